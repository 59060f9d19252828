use clap::Args;
use deltachain::{SnapshotId, SwitchPolicy};

#[derive(Args, Debug)]
pub struct SnapshotSwitchArgs {
    /// Snapshot to switch to
    pub uuid: SnapshotId,

    /// Keep the current top as a new snapshot instead of discarding it
    #[arg(long)]
    pub keep_old_top: bool,

    /// Make the snapshot itself writable instead of adding a new top above it
    #[arg(long)]
    pub reuse_target: bool,
}

pub fn execute(args: SnapshotSwitchArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let mut descriptor = global.open()?;

    if !args.keep_old_top && !args.reuse_target {
        descriptor.switch_snapshot(&args.uuid)?;
    } else {
        let mut policy = SwitchPolicy::default();
        if args.keep_old_top {
            policy = policy.keep_old_top();
        }
        if args.reuse_target {
            policy = policy.reuse_target();
        }
        if let Some(kept) = descriptor.switch_snapshot_ext(&args.uuid, policy)? {
            println!("{}", kept);
        }
    }

    descriptor.close();
    Ok(())
}
