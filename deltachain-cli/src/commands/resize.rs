use clap::Args;

use crate::cli::parse_size_kb;

#[derive(Args, Debug)]
pub struct ResizeArgs {
    /// New size in KB, or with a K/M/G/T suffix
    #[arg(value_parser = parse_size_kb)]
    pub size: u64,

    /// Resize with no device bound instead of through the mounted filesystem
    #[arg(long)]
    pub offline: bool,
}

pub fn execute(args: ResizeArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let mut descriptor = global.open()?;
    descriptor.resize(args.size, args.offline)?;
    println!("{} KB", args.size);
    descriptor.close();
    Ok(())
}
