#![allow(dead_code)]

use assert_cmd::Command;
use deltachain_shared::constants::{envs, filenames};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// Size of the raw base image written by [`raw_disk`].
pub const DISK_KB: u64 = 1024;

pub struct TestContext {
    pub cmd: Command,
    pub dir: TempDir,
}

impl TestContext {
    /// Command pointed at this context's disk.
    pub fn new_cmd(&self) -> Command {
        let mut cmd = bare_cmd();
        cmd.arg("--descriptor").arg(self.dir.path());
        cmd
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn descriptor_path(&self) -> PathBuf {
        self.dir.path().join(filenames::DESCRIPTOR)
    }

    /// Run `args` and return trimmed stdout, asserting success.
    pub fn stdout_of(&self, args: &[&str]) -> String {
        let output = self.new_cmd().args(args).assert().success();
        String::from_utf8_lossy(&output.get_output().stdout)
            .trim()
            .to_string()
    }
}

/// The binary with no disk configured.
pub fn bare_cmd() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_deltachain"));
    cmd.timeout(Duration::from_secs(30));
    cmd.env_remove(envs::DESCRIPTOR);
    cmd.env_remove("RUST_LOG");
    cmd
}

/// A disk whose base layer is a plain raw file.
///
/// The descriptor is written by hand so no command that formats or
/// attaches anything needs to run; raw bases and qcow2 deltas on top of
/// them are created without root.
pub fn raw_disk() -> TestContext {
    let dir = TempDir::new().expect("Failed to create temp dir");

    let base = std::fs::File::create(dir.path().join(filenames::DEFAULT_BASE_IMAGE))
        .expect("Failed to create base image");
    base.set_len(DISK_KB * 1024)
        .expect("Failed to size base image");

    let descriptor = serde_json::json!({
        "version": 1,
        "geometry": {
            "size_sectors": DISK_KB * 2,
            "block_size_sectors": 2048,
            "format_version": 0,
            "mode": "raw",
        },
        "layers": [
            {"id": 0, "path": filenames::DEFAULT_BASE_IMAGE, "level": 0, "top": true},
        ],
        "top": 0,
        "next_id": 1,
    });
    std::fs::write(
        dir.path().join(filenames::DESCRIPTOR),
        serde_json::to_string_pretty(&descriptor).expect("Failed to encode descriptor"),
    )
    .expect("Failed to write descriptor");

    TestContext {
        cmd: {
            let mut cmd = bare_cmd();
            cmd.arg("--descriptor").arg(dir.path());
            cmd
        },
        dir,
    }
}

/// An empty directory, for commands that create a disk.
pub fn empty_dir() -> TestContext {
    let dir = TempDir::new().expect("Failed to create temp dir");
    TestContext {
        cmd: bare_cmd(),
        dir,
    }
}
