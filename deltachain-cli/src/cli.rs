use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{ArgAction, Args, Parser, Subcommand};
use deltachain::backend::{ImageBackend, LocalBackend, LocalBackendConfig};
use deltachain::logging::{self, VerboseLevel};
use deltachain::Descriptor;
use deltachain_shared::constants::{envs, filenames, units};

use crate::commands;

/// Manage copy-on-write delta chain disks
#[derive(Parser, Debug)]
#[command(author, version, about, propagate_version = true)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a new disk with an empty filesystem
    Init(commands::init::InitArgs),
    /// Attach the chain to a block device and optionally mount it
    Mount(commands::mount::MountArgs),
    /// Unmount and detach the bound device
    Umount,
    /// Show the chain and the bound device
    Status(commands::status::StatusArgs),
    /// Grow or shrink the disk
    Resize(commands::resize::ResizeArgs),
    /// Freeze the top layer as a snapshot and print its UUID
    Snapshot,
    /// Make a snapshot the writable top
    SnapshotSwitch(commands::snapshot_switch::SnapshotSwitchArgs),
    /// Delete a snapshot, merging it into its child
    SnapshotDelete(commands::snapshot_delete::SnapshotDeleteArgs),
    /// List snapshots
    SnapshotList(commands::snapshot_list::SnapshotListArgs),
    /// Point a layer at a different file with the same content
    Replace(commands::replace::ReplaceArgs),
    /// Show image geometry
    Info(commands::info::InfoArgs),
    /// Show statistics of the mounted filesystem
    FsInfo(commands::fs_info::FsInfoArgs),
    /// Print a freshly generated UUID
    Uuid,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalFlags {
    /// Disk descriptor file, or the image directory holding it
    #[arg(short = 'd', long, global = true, env = envs::DESCRIPTOR)]
    pub descriptor: Option<PathBuf>,

    /// More console output (repeat for more)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// No console logging
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Prefix console log lines with a timestamp
    #[arg(long, global = true)]
    pub timestamps: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// File log level (0 errors .. 4 trace)
    #[arg(long, global = true, default_value_t = 2)]
    pub log_level: u8,

    /// Engine configuration (JSON); defaults come from the environment
    #[arg(long, global = true)]
    pub backend_config: Option<PathBuf>,
}

impl GlobalFlags {
    pub fn init_logging(&self) -> anyhow::Result<()> {
        if self.quiet {
            logging::set_verbose_level(VerboseLevel::NoConsole);
        } else {
            logging::set_verbose_level(VerboseLevel::Level(1 + self.verbose));
        }
        if self.timestamps {
            logging::set_verbose_level(VerboseLevel::Timestamps);
        }
        if let Some(path) = &self.log_file {
            logging::set_log_level(self.log_level);
            logging::set_log_file(path)?;
        }
        Ok(())
    }

    /// Descriptor file named by `--descriptor`.
    pub fn descriptor_path(&self) -> anyhow::Result<PathBuf> {
        let path = self.descriptor.as_deref().with_context(|| {
            format!(
                "no disk given; pass --descriptor or set {}",
                envs::DESCRIPTOR
            )
        })?;
        Ok(descriptor_file(path))
    }

    pub fn backend(&self) -> anyhow::Result<Arc<dyn ImageBackend>> {
        let config = match &self.backend_config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                serde_json::from_str::<LocalBackendConfig>(&raw)
                    .with_context(|| format!("Failed to parse {}", path.display()))?
            }
            None => LocalBackendConfig::from_env(),
        };
        tracing::debug!(config = ?config, "Using local backend");
        Ok(Arc::new(LocalBackend::new(config)))
    }

    pub fn open(&self) -> anyhow::Result<Descriptor> {
        let path = self.descriptor_path()?;
        Ok(Descriptor::open(&path, self.backend()?)?)
    }
}

/// Accept either the descriptor file or its directory.
pub fn descriptor_file(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(filenames::DESCRIPTOR)
    } else {
        path.to_path_buf()
    }
}

/// Size in KB from "393216", "384M", "10G" or "512K".
pub fn parse_size_kb(value: &str) -> Result<u64, String> {
    let value = value.trim();
    let (digits, multiplier) = match value.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => {
            let multiplier = match c.to_ascii_uppercase() {
                'K' => 1,
                'M' => 1024,
                'G' => 1024 * 1024,
                'T' => 1024 * 1024 * 1024,
                other => return Err(format!("unknown size suffix '{}'", other)),
            };
            (&value[..i], multiplier)
        }
        _ => (value, 1),
    };

    let number: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size '{}'", value))?;
    number
        .checked_mul(multiplier)
        .filter(|kb| units::kb_to_sectors(*kb).is_some())
        .ok_or_else(|| format!("size '{}' is too large", value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_kb() {
        assert_eq!(parse_size_kb("393216"), Ok(393216));
        assert_eq!(parse_size_kb("384M"), Ok(393216));
        assert_eq!(parse_size_kb("1g"), Ok(1048576));
        assert_eq!(parse_size_kb("512K"), Ok(512));
        assert!(parse_size_kb("12Q").is_err());
        assert!(parse_size_kb("M").is_err());
        assert!(parse_size_kb("").is_err());
        assert!(parse_size_kb("18446744073709551615").is_err());
        assert!(parse_size_kb("16777216T").is_err());
        assert_eq!(parse_size_kb("16777215T"), Ok(16777215 * 1024 * 1024 * 1024));
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
