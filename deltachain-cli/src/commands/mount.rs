use std::path::PathBuf;

use clap::Args;
use deltachain::{MountOptions, SnapshotId};

#[derive(Args, Debug)]
pub struct MountArgs {
    /// Mount point; without it only the device is attached
    pub target: Option<PathBuf>,

    /// Expose this snapshot (read-only) instead of the top
    #[arg(short, long)]
    pub uuid: Option<SnapshotId>,

    /// Mount read-only
    #[arg(short, long)]
    pub read_only: bool,

    /// Check the filesystem before mounting
    #[arg(long)]
    pub fsck: bool,

    /// Enable user and group quota
    #[arg(long)]
    pub quota: bool,

    /// Extra mount options, comma separated
    #[arg(short = 'o', long, default_value = "")]
    pub options: String,

    /// Raw MS_* mount flags
    #[arg(long, default_value_t = 0)]
    pub flags: u64,
}

pub fn execute(args: MountArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let mut descriptor = global.open()?;

    let options = MountOptions {
        uuid: args.uuid,
        target: args.target,
        flags: args.flags,
        data: args.options,
        read_only: args.read_only,
        fsck: args.fsck,
        quota: args.quota,
    };
    let device = descriptor.mount(&options)?;
    println!("{}", device);

    // The device stays attached for the next invocation to find.
    descriptor.close();
    Ok(())
}
