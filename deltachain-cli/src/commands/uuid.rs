pub fn execute() -> anyhow::Result<()> {
    println!("{}", deltachain::generate_uuid());
    Ok(())
}
