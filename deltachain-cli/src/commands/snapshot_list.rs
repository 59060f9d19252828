use clap::Args;
use comfy_table::{Table, presets};
use serde::Serialize;

#[derive(Args, Debug)]
pub struct SnapshotListArgs {
    /// Include the top and unnamed layers
    #[arg(short, long)]
    pub all: bool,

    /// Print JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct Row {
    uuid: Option<String>,
    level: u32,
    state: &'static str,
    active: bool,
    path: String,
}

pub fn execute(args: SnapshotListArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let descriptor = global.open()?;
    let active: Vec<_> = descriptor.active_chain()?.iter().map(|l| l.id()).collect();

    let rows: Vec<Row> = descriptor
        .layers()
        .iter()
        .filter(|layer| args.all || layer.uuid().is_some())
        .map(|layer| Row {
            uuid: layer.uuid().map(|u| u.to_string()),
            level: layer.level(),
            state: match layer.state() {
                deltachain::LayerState::Top => "top",
                deltachain::LayerState::Snapshot => "snapshot",
                deltachain::LayerState::Intermediate => "intermediate",
            },
            active: active.contains(&layer.id()),
            path: layer.path().display().to_string(),
        })
        .collect();
    descriptor.close();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::NOTHING);
    table.set_header(vec!["UUID", "LEVEL", "STATE", "ACTIVE", "PATH"]);
    for row in rows {
        table.add_row(vec![
            row.uuid.unwrap_or_else(|| "-".to_string()),
            row.level.to_string(),
            row.state.to_string(),
            if row.active { "*" } else { "" }.to_string(),
            row.path,
        ]);
    }
    println!("{table}");
    Ok(())
}
