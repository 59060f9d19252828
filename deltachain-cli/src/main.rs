mod cli;
mod commands;

use clap::Parser;

use cli::{Cli, Commands};

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(exit_code(&e));
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    cli.global.init_logging()?;
    tracing::debug!(command = ?cli.command, "Running command");

    match cli.command {
        Commands::Init(args) => commands::init::execute(args, &cli.global),
        Commands::Mount(args) => commands::mount::execute(args, &cli.global),
        Commands::Umount => commands::umount::execute(&cli.global),
        Commands::Status(args) => commands::status::execute(args, &cli.global),
        Commands::Resize(args) => commands::resize::execute(args, &cli.global),
        Commands::Snapshot => commands::snapshot::execute(&cli.global),
        Commands::SnapshotSwitch(args) => commands::snapshot_switch::execute(args, &cli.global),
        Commands::SnapshotDelete(args) => commands::snapshot_delete::execute(args, &cli.global),
        Commands::SnapshotList(args) => commands::snapshot_list::execute(args, &cli.global),
        Commands::Replace(args) => commands::replace::execute(args, &cli.global),
        Commands::Info(args) => commands::info::execute(args, &cli.global),
        Commands::FsInfo(args) => commands::fs_info::execute(args, &cli.global),
        Commands::Uuid => commands::uuid::execute(),
    }
}

/// Caller mistakes exit with 2, everything else with 1.
fn exit_code(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<deltachain::DeltaError>() {
        Some(e) if e.is_caller_error() => 2,
        _ => 1,
    }
}
