pub fn execute(global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let mut descriptor = global.open()?;
    let uuid = descriptor.create_snapshot()?;
    println!("{}", uuid);
    descriptor.close();
    Ok(())
}
