//! Integration tests for snapshot create, switch, delete and replace.

use deltachain::{
    CreateParams, DeltaError, ImageBackend, ImageMode, LayerSelector, LayerState, ReplaceParams,
    SwitchPolicy,
};
use deltachain_test_utils::{TEST_DISK_KB, TestDisk};

fn base_img_disk() -> TestDisk {
    TestDisk::with_params(
        CreateParams::new(TEST_DISK_KB)
            .mode(ImageMode::Expanded)
            .file("base.img"),
    )
}

// ============================================================================
// SNAPSHOT / SWITCH / DELETE
// ============================================================================

#[test]
fn snapshot_switch_back_collapses_chain() {
    let mut disk = base_img_disk().reopen().unwrap();

    let uuid = disk.descriptor.create_snapshot().unwrap();
    assert_eq!(disk.descriptor.layers().len(), 2);
    assert_eq!(disk.descriptor.snapshots().len(), 1);
    let empty_top = disk.descriptor.top_layer().unwrap().path().to_path_buf();

    disk.descriptor.switch_snapshot(&uuid).unwrap();
    let layers = disk.descriptor.layers();
    assert_eq!(layers.len(), 1);
    assert!(layers[0].is_top());
    assert_eq!(layers[0].uuid(), None);
    assert_eq!(layers[0].path(), std::path::Path::new("base.img"));
    assert!(!disk.backend.image_exists(&disk.dir().join(&empty_top)));

    let missing = deltachain::generate_uuid();
    let err = disk.descriptor.delete_snapshot(&missing).unwrap_err();
    assert!(matches!(err, DeltaError::NotFound(_)));
    assert_eq!(disk.descriptor.layers().len(), 1);
}

#[test]
fn switch_unknown_uuid_leaves_chain_alone() {
    let mut disk = TestDisk::new(TEST_DISK_KB);
    disk.descriptor.create_snapshot().unwrap();
    let before = disk.descriptor.layers().to_vec();

    let err = disk
        .descriptor
        .switch_snapshot(&deltachain::generate_uuid())
        .unwrap_err();
    assert!(matches!(err, DeltaError::NotFound(_)));
    assert_eq!(disk.descriptor.layers(), before.as_slice());
}

#[test]
fn switch_keep_old_top_names_it() {
    let mut disk = TestDisk::new(TEST_DISK_KB);
    let first = disk.descriptor.create_snapshot().unwrap();
    disk.write_top(7, 70);
    let named_before = disk.descriptor.snapshots().len();

    let kept = disk
        .descriptor
        .switch_snapshot_ext(&first, SwitchPolicy::default().keep_old_top())
        .unwrap()
        .expect("old top should be kept");

    assert_ne!(kept, first);
    assert_eq!(disk.descriptor.snapshots().len(), named_before + 1);
    let uuids: Vec<_> = disk
        .descriptor
        .layers()
        .iter()
        .filter_map(|l| l.uuid())
        .collect();
    assert_eq!(uuids.iter().filter(|u| **u == kept).count(), 1);

    // The new top sits on the target and does not see the kept branch.
    let top = disk.descriptor.top_layer().unwrap();
    let target = disk.descriptor.find_snapshot(&first).unwrap();
    assert_eq!(top.parent(), Some(target.id()));
    assert_eq!(top.level(), target.level() + 1);
}

#[test]
fn switch_keep_and_reuse_promotes_branch_tip() {
    let mut disk = TestDisk::new(TEST_DISK_KB);
    let first = disk.descriptor.create_snapshot().unwrap();
    let old_tip = disk
        .descriptor
        .switch_snapshot_ext(&first, SwitchPolicy::default().keep_old_top())
        .unwrap()
        .unwrap();
    let layers_before = disk.descriptor.layers().len();

    // The retained tip has no children and can become writable in place.
    let again = disk
        .descriptor
        .switch_snapshot_ext(
            &old_tip,
            SwitchPolicy::default().keep_old_top().reuse_target(),
        )
        .unwrap()
        .unwrap();

    assert_eq!(disk.descriptor.layers().len(), layers_before);
    let top = disk.descriptor.top_layer().unwrap();
    assert_eq!(top.uuid(), None);
    assert!(disk.descriptor.find_snapshot(&old_tip).is_err());
    assert!(disk.descriptor.find_snapshot(&again).is_ok());
}

#[test]
fn reuse_target_with_dependents_gets_fresh_top() {
    let mut disk = TestDisk::new(TEST_DISK_KB);
    disk.write_top(3, 30);
    let first = disk.descriptor.create_snapshot().unwrap();
    let first_checksum = disk.chain_checksum();
    disk.write_top(3, 31);
    let branch = disk
        .descriptor
        .switch_snapshot_ext(&first, SwitchPolicy::default().keep_old_top())
        .unwrap()
        .unwrap();

    // `first` still backs the retained branch, so it cannot be promoted.
    disk.descriptor
        .switch_snapshot_ext(&first, SwitchPolicy::default().reuse_target())
        .unwrap();

    let chain = disk.descriptor.active_chain().unwrap();
    assert_eq!(chain.len(), 2);
    assert_eq!(chain[0].uuid(), Some(first));
    assert_eq!(chain[1].state(), LayerState::Top);
    assert!(disk.descriptor.find_snapshot(&branch).is_ok());
    assert_eq!(disk.descriptor.layers().len(), 3);
    assert_eq!(disk.chain_checksum(), first_checksum);
}

#[test]
fn keep_and_reuse_on_linear_chain_keeps_old_top() {
    let mut disk = TestDisk::new(TEST_DISK_KB);
    let first = disk.descriptor.create_snapshot().unwrap();

    let kept = disk
        .descriptor
        .switch_snapshot_ext(
            &first,
            SwitchPolicy::default().keep_old_top().reuse_target(),
        )
        .unwrap()
        .unwrap();

    assert_eq!(disk.descriptor.layers().len(), 3);
    assert_eq!(disk.descriptor.active_chain().unwrap().len(), 2);
    assert!(disk.descriptor.find_snapshot(&first).is_ok());
    assert!(disk.descriptor.find_snapshot(&kept).is_ok());
}

#[test]
fn switch_after_resize_restores_snapshot_size() {
    let mut disk = TestDisk::new(4096);
    let uuid = disk.descriptor.create_snapshot().unwrap();
    disk.descriptor.resize(8192, true).unwrap();
    assert_eq!(disk.descriptor.image_info().blocks, 16384);

    disk.descriptor.switch_snapshot(&uuid).unwrap();

    let top = disk
        .descriptor
        .resolve(disk.descriptor.top_layer().unwrap().path());
    assert_eq!(disk.descriptor.geometry().size_sectors, 8192);
    assert_eq!(disk.descriptor.image_info().blocks, 8192);
    assert_eq!(disk.backend.image_size_sectors(&top), Some(8192));

    let disk = disk.reopen().unwrap();
    assert_eq!(disk.descriptor.geometry().size_sectors, 8192);
}

#[test]
fn delete_middle_snapshot_preserves_content() {
    let mut disk = TestDisk::new(TEST_DISK_KB);
    disk.write_top(1, 10);
    let a = disk.descriptor.create_snapshot().unwrap();
    disk.write_top(1, 11);
    disk.write_top(2, 20);
    let b = disk.descriptor.create_snapshot().unwrap();
    disk.write_top(3, 30);

    let checksum = disk.chain_checksum();
    let len = disk.descriptor.layers().len();

    disk.descriptor.delete_snapshot(&b).unwrap();
    assert_eq!(disk.descriptor.layers().len(), len - 1);
    assert_eq!(disk.chain_checksum(), checksum);

    disk.descriptor.delete_snapshot(&a).unwrap();
    assert_eq!(disk.descriptor.layers().len(), len - 2);
    assert_eq!(disk.chain_checksum(), checksum);

    // Deleting the base promoted its child to base.
    let layers = disk.descriptor.layers();
    assert_eq!(layers.len(), 1);
    assert!(layers[0].is_base());
    assert_eq!(layers[0].state(), LayerState::Top);
}

#[test]
fn delete_live_snapshot_preserves_device_content() {
    let mut disk = TestDisk::new(TEST_DISK_KB);
    disk.write_top(4, 40);
    let snap = disk.descriptor.create_snapshot().unwrap();
    let device = disk
        .descriptor
        .mount(&deltachain::MountOptions::device_only())
        .unwrap();
    disk.backend.write_block(&device, 5, 50).unwrap();
    let before = disk.backend.device_checksum(&device).unwrap();

    disk.descriptor.delete_snapshot(&snap).unwrap();
    assert_eq!(disk.backend.device_checksum(&device).unwrap(), before);
    assert_eq!(disk.descriptor.layers().len(), 1);
}

// ============================================================================
// REPLACE
// ============================================================================

#[test]
fn replace_keep_name_by_current_file() {
    let mut disk = base_img_disk();
    let base = disk.dir().join("base.img");
    let staging = disk.dir().join("base.img.migrated");
    disk.backend.clone_image(&base, &staging).unwrap();

    let params = ReplaceParams {
        cur_file: Some("base.img".into()),
        keep_name: true,
        ..ReplaceParams::new(&staging)
    };
    assert!(matches!(
        params.selector().unwrap(),
        LayerSelector::File(_)
    ));
    disk.descriptor.replace(&params).unwrap();

    let layers = disk.descriptor.layers();
    assert_eq!(layers.len(), 1);
    assert_eq!(layers[0].level(), 0);
    assert_eq!(layers[0].path(), std::path::Path::new("base.img"));
    assert!(!disk.backend.image_exists(&staging));
    assert!(disk.backend.image_exists(&base));
}

#[test]
fn replace_without_keep_name_points_at_new_file() {
    let mut disk = TestDisk::new(TEST_DISK_KB);
    let snap = disk.descriptor.create_snapshot().unwrap();
    let old = disk
        .descriptor
        .resolve(disk.descriptor.find_snapshot(&snap).unwrap().path());
    let moved = disk.dir().join("moved.img");
    disk.backend.clone_image(&old, &moved).unwrap();

    let params = ReplaceParams {
        uuid: Some(snap),
        ..ReplaceParams::new(&moved)
    };
    disk.descriptor.replace(&params).unwrap();

    let layer = disk.descriptor.find_snapshot(&snap).unwrap();
    assert_eq!(layer.path(), std::path::Path::new("moved.img"));
    // Both files keep their names.
    assert!(disk.backend.image_exists(&old));
    assert!(disk.backend.image_exists(&moved));

    let disk = disk.reopen().unwrap();
    let layer = disk.descriptor.find_snapshot(&snap).unwrap();
    assert_eq!(layer.path(), std::path::Path::new("moved.img"));
}

#[test]
fn replace_unknown_selector_not_found() {
    let mut disk = TestDisk::new(TEST_DISK_KB);
    let other = disk.dir().join("other.img");
    disk.backend
        .clone_image(&disk.dir().join("root.hdd"), &other)
        .unwrap();

    let params = ReplaceParams {
        level: Some(5),
        ..ReplaceParams::new(&other)
    };
    assert!(matches!(
        disk.descriptor.replace(&params),
        Err(DeltaError::NotFound(_))
    ));

    let params = ReplaceParams::new(&other);
    assert!(matches!(
        disk.descriptor.replace(&params),
        Err(DeltaError::InvalidArgument(_))
    ));
}
