pub mod fs_info;
pub mod info;
pub mod init;
pub mod mount;
pub mod replace;
pub mod resize;
pub mod snapshot;
pub mod snapshot_delete;
pub mod snapshot_list;
pub mod snapshot_switch;
pub mod status;
pub mod umount;
pub mod uuid;
