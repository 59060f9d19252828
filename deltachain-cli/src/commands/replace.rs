use std::path::PathBuf;

use clap::Args;
use deltachain::{ReplaceParams, SnapshotId};

/// The new file must hold exactly the content of the layer it replaces;
/// this is not checked.
#[derive(Args, Debug)]
pub struct ReplaceArgs {
    /// New image file
    pub file: PathBuf,

    /// Layer to replace, by snapshot UUID
    #[arg(short, long)]
    pub uuid: Option<SnapshotId>,

    /// Layer to replace, by its current file
    #[arg(long)]
    pub cur_file: Option<PathBuf>,

    /// Layer to replace, by level on the active chain
    #[arg(short, long)]
    pub level: Option<u32>,

    /// Rename the new file over the old one
    #[arg(short, long)]
    pub keep_name: bool,
}

pub fn execute(args: ReplaceArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let mut descriptor = global.open()?;

    let params = ReplaceParams {
        uuid: args.uuid,
        cur_file: args.cur_file,
        level: args.level,
        keep_name: args.keep_name,
        ..ReplaceParams::new(args.file)
    };
    descriptor.replace(&params)?;
    descriptor.close();
    Ok(())
}
