use clap::Args;
use deltachain::SnapshotId;

#[derive(Args, Debug)]
pub struct SnapshotDeleteArgs {
    /// Snapshot(s) to delete
    #[arg(required = true, num_args = 1..)]
    pub uuids: Vec<SnapshotId>,
}

pub fn execute(args: SnapshotDeleteArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let mut descriptor = global.open()?;

    let mut errors = Vec::new();
    let mut success_count = 0;
    for uuid in &args.uuids {
        match descriptor.delete_snapshot(uuid) {
            Ok(()) => {
                println!("{}", uuid);
                success_count += 1;
            }
            Err(e) => {
                if args.uuids.len() > 1 {
                    eprintln!("Error deleting snapshot {}: {}", uuid, e);
                }
                errors.push(e);
            }
        }
    }
    descriptor.close();

    match errors.len() {
        0 => Ok(()),
        // Keep the error kind for the exit code.
        1 if success_count == 0 => Err(errors.remove(0).into()),
        n => anyhow::bail!(
            "Failed to delete {} of {} snapshot(s)",
            n,
            n + success_count
        ),
    }
}
