use clap::Args;

#[derive(Args, Debug)]
pub struct FsInfoArgs {
    /// Print JSON
    #[arg(long)]
    pub json: bool,
}

/// Works while another process holds the disk open.
pub fn execute(args: FsInfoArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let path = global.descriptor_path()?;
    let backend = global.backend()?;
    let stats = deltachain::fs_info(&path, backend.as_ref())?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!(
            "blocks: {} total, {} free ({} bytes each)",
            stats.blocks, stats.blocks_free, stats.block_size
        );
        println!("inodes: {} total, {} free", stats.inodes, stats.inodes_free);
    }
    Ok(())
}
