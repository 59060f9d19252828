use clap::Args;

#[derive(Args, Debug)]
pub struct InfoArgs {
    /// Print JSON
    #[arg(long)]
    pub json: bool,
}

pub fn execute(args: InfoArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let descriptor = global.open()?;
    let info = descriptor.image_info();
    let mode = descriptor.geometry().mode;
    descriptor.close();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("size:       {} KB", info.blocks / 2);
        println!("blocks:     {}", info.blocks);
        println!("block size: {}", info.block_size);
        println!("version:    {}", info.version);
        println!("mode:       {}", mode);
    }
    Ok(())
}
