pub fn execute(global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let mut descriptor = global.open()?;
    descriptor.unmount()?;
    descriptor.close();
    Ok(())
}
