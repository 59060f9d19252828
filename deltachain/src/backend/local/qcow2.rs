//! qcow2 layer files.
//!
//! Base images are laid out natively through `qcow2-rs` (or by `qemu-img`
//! when fully preallocated); deltas are written as a bare qcow2 v3 header
//! that points at the parent.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use deltachain_shared::errors::{DeltaError, DeltaResult};
use qcow2_rs::meta::Qcow2Header;

use super::image::{Disk, ImageFormat};
use super::run;

pub const QCOW2_MAGIC: u32 = 0x514649fb;

const CLUSTER_BITS: usize = 16;
const REFCOUNT_ORDER: u8 = 4;
const BLOCK_SIZE: usize = 512;

const HEADER_LENGTH: usize = 104;
const BACKING_NAME_OFFSET: u64 = 512;
const EXT_BACKING_FORMAT: u32 = 0xE2792ACA;

/// Fields of a qcow2 header the engine cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderInfo {
    pub version: u32,
    /// Virtual size in bytes.
    pub size: u64,
    pub cluster_bits: u32,
    pub backing_file: Option<PathBuf>,
}

impl HeaderInfo {
    pub fn cluster_size(&self) -> u64 {
        1u64 << self.cluster_bits
    }
}

/// Read the header of a qcow2 file.
pub fn read_header(path: &Path) -> DeltaResult<HeaderInfo> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| DeltaError::io(format!("failed to open {}", path.display()), e))?;

    let mut header = [0u8; HEADER_LENGTH];
    file.read_exact(&mut header).map_err(|e| {
        DeltaError::io(format!("failed to read header from {}", path.display()), e)
    })?;

    let magic = be_u32(&header[0..4]);
    if magic != QCOW2_MAGIC {
        return Err(DeltaError::CorruptData(format!(
            "invalid qcow2 magic in {}: 0x{:08x}",
            path.display(),
            magic
        )));
    }

    let backing_offset = be_u64(&header[8..16]);
    let backing_len = be_u32(&header[16..20]) as usize;
    let backing_file = if backing_offset == 0 || backing_len == 0 {
        None
    } else {
        let mut name = vec![0u8; backing_len];
        std::io::Seek::seek(&mut file, std::io::SeekFrom::Start(backing_offset))
            .and_then(|_| file.read_exact(&mut name))
            .map_err(|e| {
                DeltaError::io(
                    format!("failed to read backing file name from {}", path.display()),
                    e,
                )
            })?;
        Some(PathBuf::from(String::from_utf8_lossy(&name).into_owned()))
    };

    Ok(HeaderInfo {
        version: be_u32(&header[4..8]),
        size: be_u64(&header[24..32]),
        cluster_bits: be_u32(&header[20..24]),
        backing_file,
    })
}

/// Lay out an empty, sparse qcow2 image of `size_bytes`.
pub fn create_native(path: &Path, size_bytes: u64) -> DeltaResult<Disk> {
    tracing::info!(
        "Creating qcow2 image: {} ({} bytes sparse)",
        path.display(),
        size_bytes
    );

    let (rc_table, rc_block, _l1_table) =
        Qcow2Header::calculate_meta_params(size_bytes, CLUSTER_BITS, REFCOUNT_ORDER, BLOCK_SIZE);
    let clusters = 1 + rc_table.1 + rc_block.1;
    let buffer_size = ((clusters as usize) << CLUSTER_BITS) + BLOCK_SIZE;

    let mut header_buf = vec![0u8; buffer_size];
    Qcow2Header::format_qcow2(
        &mut header_buf,
        size_bytes,
        CLUSTER_BITS,
        REFCOUNT_ORDER,
        BLOCK_SIZE,
    )
    .map_err(|e| {
        DeltaError::Storage(format!(
            "Failed to format qcow2 header for {}: {}",
            path.display(),
            e
        ))
    })?;

    let mut file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .map_err(|e| DeltaError::io(format!("failed to create image {}", path.display()), e))?;
    let disk = Disk::new(path.to_path_buf(), ImageFormat::Qcow2);

    file.write_all(&header_buf).map_err(|e| {
        DeltaError::io(
            format!("failed to write qcow2 header to {}", path.display()),
            e,
        )
    })?;

    Ok(disk)
}

/// Create a fully preallocated qcow2 image through `qemu-img`.
pub fn create_preallocated(qemu_img: &Path, path: &Path, size_bytes: u64) -> DeltaResult<Disk> {
    tracing::info!(
        "Creating preallocated qcow2 image: {} ({} bytes)",
        path.display(),
        size_bytes
    );

    let output = Command::new(qemu_img)
        .args(["create", "-q", "-f", "qcow2", "-o", "preallocation=full"])
        .arg(path)
        .arg(size_bytes.to_string())
        .output();
    // Covers a partially written file as well.
    let disk = Disk::new(path.to_path_buf(), ImageFormat::Qcow2);
    run::check_output(output, qemu_img, &format!("create image {}", path.display()))?;
    Ok(disk)
}

/// Write an empty qcow2 v3 delta that reads through to `backing`.
pub fn write_cow_child(
    child: &Path,
    backing: &Path,
    backing_format: ImageFormat,
    virtual_size: u64,
) -> DeltaResult<()> {
    let backing_str = backing
        .canonicalize()
        .map_err(|e| {
            DeltaError::io(
                format!("failed to canonicalize backing path {}", backing.display()),
                e,
            )
        })?
        .to_string_lossy()
        .to_string();
    let backing_bytes = backing_str.as_bytes();

    let cluster_bits = CLUSTER_BITS as u32;
    let cluster_size = 1u64 << cluster_bits;
    if BACKING_NAME_OFFSET as usize + backing_bytes.len() > cluster_size as usize {
        return Err(DeltaError::InvalidArgument(format!(
            "backing path too long: {}",
            backing.display()
        )));
    }

    // Each L1 entry maps one L2 table of cluster_size / 8 clusters.
    let l1_size = virtual_size.div_ceil(cluster_size * (cluster_size / 8)) as u32;
    let l1_clusters = (l1_size as u64 * 8).div_ceil(cluster_size).max(1);

    let l1_offset = cluster_size;
    let refcount_offset = l1_offset + l1_clusters * cluster_size;
    let refcount_block_offset = refcount_offset + cluster_size;
    let total_clusters = refcount_block_offset / cluster_size + 1;

    let mut header = vec![0u8; (total_clusters * cluster_size) as usize];
    header[0..4].copy_from_slice(&QCOW2_MAGIC.to_be_bytes());
    header[4..8].copy_from_slice(&3u32.to_be_bytes());
    header[8..16].copy_from_slice(&BACKING_NAME_OFFSET.to_be_bytes());
    header[16..20].copy_from_slice(&(backing_bytes.len() as u32).to_be_bytes());
    header[20..24].copy_from_slice(&cluster_bits.to_be_bytes());
    header[24..32].copy_from_slice(&virtual_size.to_be_bytes());
    // crypt_method stays 0
    header[36..40].copy_from_slice(&l1_size.to_be_bytes());
    header[40..48].copy_from_slice(&l1_offset.to_be_bytes());
    header[48..56].copy_from_slice(&refcount_offset.to_be_bytes());
    header[56..60].copy_from_slice(&1u32.to_be_bytes());
    // no snapshots, no feature bits
    header[96..100].copy_from_slice(&(REFCOUNT_ORDER as u32).to_be_bytes());
    header[100..104].copy_from_slice(&(HEADER_LENGTH as u32).to_be_bytes());

    // Backing format extension, then the end marker.
    let format_bytes = backing_format.as_str().as_bytes();
    let ext = HEADER_LENGTH;
    header[ext..ext + 4].copy_from_slice(&EXT_BACKING_FORMAT.to_be_bytes());
    header[ext + 4..ext + 8].copy_from_slice(&(format_bytes.len() as u32).to_be_bytes());
    header[ext + 8..ext + 8 + format_bytes.len()].copy_from_slice(format_bytes);

    let name = BACKING_NAME_OFFSET as usize;
    header[name..name + backing_bytes.len()].copy_from_slice(backing_bytes);

    // L1 stays zeroed: every read falls through to the backing file.
    let rt = refcount_offset as usize;
    header[rt..rt + 8].copy_from_slice(&refcount_block_offset.to_be_bytes());
    let rb = refcount_block_offset as usize;
    for i in 0..total_clusters as usize {
        header[rb + i * 2..rb + i * 2 + 2].copy_from_slice(&1u16.to_be_bytes());
    }

    let mut file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(child)
        .map_err(|e| DeltaError::io(format!("failed to create delta {}", child.display()), e))?;
    let disk = Disk::new(child.to_path_buf(), ImageFormat::Qcow2);

    file.write_all(&header).map_err(|e| {
        DeltaError::io(
            format!("failed to write delta header to {}", child.display()),
            e,
        )
    })?;
    file.sync_all()
        .map_err(|e| DeltaError::io(format!("failed to sync {}", child.display()), e))?;

    disk.leak();
    tracing::debug!(
        child = %child.display(),
        backing = %backing_str,
        format = backing_format.as_str(),
        "Wrote delta header"
    );
    Ok(())
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn be_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(buf)
}
