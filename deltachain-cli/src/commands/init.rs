use std::path::PathBuf;

use clap::Args;
use deltachain::{CreateParams, Descriptor, ImageMode};

use crate::cli::parse_size_kb;

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Image directory to create the disk in
    pub dir: PathBuf,

    /// Disk size in KB, or with a K/M/G/T suffix
    #[arg(short, long, value_parser = parse_size_kb)]
    pub size: u64,

    /// Image mode: expanded, preallocated or raw
    #[arg(short, long, default_value = "expanded")]
    pub mode: ImageMode,

    /// Base image file name
    #[arg(short, long)]
    pub file: Option<PathBuf>,
}

pub fn execute(args: InitArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let mut params = CreateParams::new(args.size).mode(args.mode);
    if let Some(file) = args.file {
        params = params.file(file);
    }

    let descriptor = Descriptor::create(&args.dir, &params, global.backend()?)?;
    println!("{}", descriptor.path().display());
    descriptor.close();
    Ok(())
}
