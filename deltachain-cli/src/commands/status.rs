use clap::Args;

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Print JSON
    #[arg(long)]
    pub json: bool,
}

pub fn execute(args: StatusArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let descriptor = global.open()?;
    let chain: Vec<String> = descriptor
        .active_chain_paths()?
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    let bound = descriptor.bound_device().cloned();
    let attached = descriptor.is_mounted()?;
    descriptor.close();

    if args.json {
        let value = serde_json::json!({
            "chain": chain,
            "device": bound.as_ref().map(|b| b.device.to_string()),
            "mount_point": bound.as_ref().and_then(|b| b.mount_point.as_ref()).map(|p| p.display().to_string()),
            "read_only": bound.as_ref().map(|b| b.read_only),
            "attached": attached,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("chain:");
    for (level, path) in chain.iter().enumerate() {
        println!("  {:>3}  {}", level, path);
    }
    match bound {
        Some(bound) => {
            let mount = bound
                .mount_point
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "device: {} ({}) mounted at {}",
                bound.device,
                if bound.read_only { "ro" } else { "rw" },
                mount
            );
        }
        None => println!("device: none"),
    }
    Ok(())
}
