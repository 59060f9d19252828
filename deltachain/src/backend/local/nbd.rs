//! Network block devices driven by `qemu-nbd`.

use std::path::{Path, PathBuf};
use std::process::Command;

use deltachain_shared::errors::{DeltaError, DeltaResult};

use super::image::ImageFormat;
use super::run;
use crate::backend::{DeviceNode, DeviceStatus};

const SYS_BLOCK: &str = "/sys/block";
const PROC_MOUNTS: &str = "/proc/self/mounts";

/// The `/dev/nbdN` nodes this process may use.
#[derive(Debug, Clone)]
pub struct NbdPool {
    qemu_nbd: PathBuf,
    max_devices: u32,
}

impl NbdPool {
    pub fn new(qemu_nbd: PathBuf, max_devices: u32) -> Self {
        Self {
            qemu_nbd,
            max_devices,
        }
    }

    /// First device node with no server attached.
    pub fn find_free(&self) -> DeltaResult<DeviceNode> {
        (0..self.max_devices)
            .map(|index| format!("nbd{}", index))
            .find(|name| {
                let sys = Path::new(SYS_BLOCK).join(name);
                sys.exists() && !sys.join("pid").exists()
            })
            .map(|name| DeviceNode::new(format!("/dev/{}", name)))
            .ok_or_else(|| {
                DeltaError::Busy(format!(
                    "no free nbd device among the first {}",
                    self.max_devices
                ))
            })
    }

    /// Serve `top` (and, through its backing files, the rest of the
    /// chain) on `device`.
    pub fn connect(
        &self,
        device: &DeviceNode,
        top: &Path,
        format: ImageFormat,
        read_only: bool,
    ) -> DeltaResult<()> {
        let mut cmd = Command::new(&self.qemu_nbd);
        cmd.arg(format!("--connect={}", device))
            .arg(format!("--format={}", format.as_str()))
            .arg("--cache=none");
        if read_only {
            cmd.arg("--read-only");
        }
        cmd.arg(top);
        run::run(
            &mut cmd,
            &format!("connect {} to {}", top.display(), device),
        )?;
        tracing::debug!(device = %device, top = %top.display(), read_only, "Connected nbd device");
        Ok(())
    }

    pub fn disconnect(&self, device: &DeviceNode) -> DeltaResult<()> {
        run::run(
            Command::new(&self.qemu_nbd).arg(format!("--disconnect={}", device)),
            &format!("disconnect {}", device),
        )?;
        Ok(())
    }

    /// Devices with a live server, with the server's pid.
    pub fn attached(&self) -> Vec<(DeviceNode, u32)> {
        (0..self.max_devices)
            .filter_map(|index| {
                let name = format!("nbd{}", index);
                let pid = read_pid_file(&Path::new(SYS_BLOCK).join(&name).join("pid")).ok()?;
                Some((DeviceNode::new(format!("/dev/{}", name)), pid))
            })
            .collect()
    }
}

/// Attachment state from `/sys/block/<dev>/pid`.
pub fn status(device: &DeviceNode) -> DeviceStatus {
    let Some(sys) = sys_dir(device) else {
        return DeviceStatus::Unknown;
    };
    if !sys.exists() {
        return DeviceStatus::Unknown;
    }
    match read_pid_file(&sys.join("pid")) {
        Ok(pid) if is_process_alive(pid) => DeviceStatus::Attached,
        Ok(_) => DeviceStatus::Unknown,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => DeviceStatus::Detached,
        Err(_) => DeviceStatus::Unknown,
    }
}

pub fn is_read_only(device: &DeviceNode) -> bool {
    sys_dir(device)
        .and_then(|sys| std::fs::read_to_string(sys.join("ro")).ok())
        .is_some_and(|ro| ro.trim() == "1")
}

/// Image file served by the `qemu-nbd` process `pid`.
///
/// The image is the last argument on its command line.
pub fn served_image(pid: u32) -> Option<PathBuf> {
    let cmdline = std::fs::read_to_string(format!("/proc/{}/cmdline", pid)).ok()?;
    let args: Vec<&str> = cmdline.split('\0').filter(|a| !a.is_empty()).collect();
    if !args.first()?.contains("qemu-nbd") {
        return None;
    }
    args.last().map(PathBuf::from)
}

/// One `/proc/self/mounts` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub target: PathBuf,
    pub fs_type: String,
    /// Comma separated options as the kernel reports them.
    pub options: String,
}

/// Where `device` is mounted, if anywhere.
pub fn mount_point(device: &DeviceNode) -> DeltaResult<Option<PathBuf>> {
    Ok(mount_entry(device)?.map(|entry| entry.target))
}

pub fn mount_entry(device: &DeviceNode) -> DeltaResult<Option<MountEntry>> {
    let mounts = std::fs::read_to_string(PROC_MOUNTS)
        .map_err(|e| DeltaError::io(format!("failed to read {}", PROC_MOUNTS), e))?;
    Ok(find_mount_entry(&mounts, device.as_str()))
}

fn find_mount_entry(mounts: &str, device: &str) -> Option<MountEntry> {
    mounts.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let source = fields.next()?;
        let target = fields.next()?;
        let fs_type = fields.next()?;
        let options = fields.next().unwrap_or_default();
        (source == device).then(|| MountEntry {
            target: PathBuf::from(unescape_mount_field(target)),
            fs_type: fs_type.to_string(),
            options: options.to_string(),
        })
    })
}

/// Image file `device` is serving as its top.
pub fn served_top(device: &DeviceNode) -> DeltaResult<PathBuf> {
    let not_attached = || DeltaError::NotBound(format!("{} is not attached", device));
    let sys = sys_dir(device).ok_or_else(not_attached)?;
    let pid = read_pid_file(&sys.join("pid")).map_err(|_| not_attached())?;
    served_image(pid).ok_or_else(|| {
        DeltaError::Storage(format!(
            "{} is served by pid {}, which is not qemu-nbd",
            device, pid
        ))
    })
}

/// Current size of `device` in sectors.
pub fn device_sectors(device: &DeviceNode) -> DeltaResult<u64> {
    let sys = sys_dir(device)
        .ok_or_else(|| DeltaError::InvalidArgument(format!("{} is not a device node", device)))?;
    let path = sys.join("size");
    let content = std::fs::read_to_string(&path)
        .map_err(|e| DeltaError::io(format!("failed to read {}", path.display()), e))?;
    content.trim().parse().map_err(|_| {
        DeltaError::Storage(format!(
            "invalid size '{}' in {}",
            content.trim(),
            path.display()
        ))
    })
}

/// Undo the octal escaping (`\040` for space) of `/proc/mounts`.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && let Some(digits) = bytes.get(i + 1..i + 4)
            && digits.iter().all(|d| (b'0'..=b'7').contains(d))
        {
            out.push(digits.iter().fold(0u8, |acc, d| (acc << 3) | (d - b'0')));
            i += 4;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn sys_dir(device: &DeviceNode) -> Option<PathBuf> {
    let name = device.as_path().file_name()?;
    Some(Path::new(SYS_BLOCK).join(name))
}

fn read_pid_file(path: &Path) -> std::io::Result<u32> {
    let content = std::fs::read_to_string(path)?;
    content.trim().parse::<u32>().map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid pid in {}: '{}' - {}", path.display(), content.trim(), e),
        )
    })
}

fn is_process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_find_mount_entry() {
        let mounts = "\
proc /proc proc rw,nosuid 0 0
/dev/nbd1 /mnt/disk\\040one ext4 rw,relatime 0 0
/dev/nbd0 /srv/ct ext4 ro,noatime,usrquota 0 0
";
        let entry = find_mount_entry(mounts, "/dev/nbd0").unwrap();
        assert_eq!(entry.target, PathBuf::from("/srv/ct"));
        assert_eq!(entry.fs_type, "ext4");
        assert_eq!(entry.options, "ro,noatime,usrquota");
        assert_eq!(
            find_mount_entry(mounts, "/dev/nbd1").map(|e| e.target),
            Some(PathBuf::from("/mnt/disk one"))
        );
        assert_eq!(find_mount_entry(mounts, "/dev/nbd2"), None);
    }

    #[test]
    fn test_served_top_of_detached_node() {
        let device = DeviceNode::new("/dev/nbd-does-not-exist");
        assert!(matches!(served_top(&device), Err(DeltaError::NotBound(_))));
    }

    #[test]
    fn test_unescape_plain() {
        assert_eq!(unescape_mount_field("/mnt/a"), "/mnt/a");
        assert_eq!(unescape_mount_field("/mnt/tab\\011x"), "/mnt/tab\tx");
    }

    #[test]
    fn test_read_pid_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "12345").unwrap();
        assert_eq!(read_pid_file(file.path()).unwrap(), 12345);

        let mut bad = NamedTempFile::new().unwrap();
        writeln!(bad, "not-a-pid").unwrap();
        assert!(read_pid_file(bad.path()).is_err());
    }

    #[test]
    fn test_served_image_ignores_other_processes() {
        // The test runner is not qemu-nbd.
        assert_eq!(served_image(std::process::id()), None);
        assert_eq!(served_image(999_999_999), None);
    }

    #[test]
    fn test_status_of_nonexistent_node() {
        let device = DeviceNode::new("/dev/nbd-does-not-exist");
        assert_eq!(status(&device), DeviceStatus::Unknown);
    }
}
