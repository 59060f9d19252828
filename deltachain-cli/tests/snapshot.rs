use predicates::prelude::*;

mod common;

// ============================================================================
// CREATE AND LIST
// ============================================================================

#[test]
fn test_snapshot_prints_listed_uuid() {
    let ctx = common::raw_disk();

    let uuid = ctx.stdout_of(&["snapshot"]);
    assert!(uuid.starts_with('{') && uuid.ends_with('}'));

    ctx.new_cmd()
        .arg("snapshot-list")
        .assert()
        .success()
        .stdout(predicate::str::contains(uuid.as_str()))
        .stdout(predicate::str::contains("root.hdd"));
}

#[test]
fn test_snapshot_list_json() {
    let ctx = common::raw_disk();
    let uuid = ctx.stdout_of(&["snapshot"]);

    let stdout = ctx.stdout_of(&["snapshot-list", "--all", "--json"]);
    let rows: Vec<serde_json::Value> = serde_json::from_str(&stdout).unwrap();

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["uuid"], uuid.as_str());
    assert_eq!(rows[0]["state"], "snapshot");
    assert_eq!(rows[1]["state"], "top");
    assert_eq!(rows[1]["level"], 1);
}

#[test]
fn test_status_shows_chain() {
    let ctx = common::raw_disk();
    ctx.stdout_of(&["snapshot"]);

    ctx.new_cmd()
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("root.hdd"))
        .stdout(predicate::str::contains("device: none"));
}

// ============================================================================
// SWITCH
// ============================================================================

#[test]
fn test_switch_back_collapses_chain() {
    let ctx = common::raw_disk();
    let uuid = ctx.stdout_of(&["snapshot"]);

    ctx.new_cmd()
        .args(["snapshot-switch", &uuid])
        .assert()
        .success();

    let stdout = ctx.stdout_of(&["snapshot-list", "--all", "--json"]);
    let rows: Vec<serde_json::Value> = serde_json::from_str(&stdout).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["state"], "top");
    assert!(rows[0]["uuid"].is_null());

    // Only the base image and the descriptor remain.
    let mut files: Vec<String> = std::fs::read_dir(ctx.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| !name.starts_with('.'))
        .collect();
    files.sort();
    assert_eq!(files, vec!["DiskDescriptor.json", "root.hdd"]);
}

#[test]
fn test_switch_keep_old_top_prints_new_name() {
    let ctx = common::raw_disk();
    let uuid = ctx.stdout_of(&["snapshot"]);

    let kept = ctx.stdout_of(&["snapshot-switch", "--keep-old-top", &uuid]);
    assert!(kept.starts_with('{'));
    assert_ne!(kept, uuid);

    ctx.new_cmd()
        .arg("snapshot-list")
        .assert()
        .success()
        .stdout(predicate::str::contains(uuid.as_str()))
        .stdout(predicate::str::contains(kept.as_str()));
}

#[test]
fn test_switch_unknown_uuid() {
    let ctx = common::raw_disk();
    let before = std::fs::read_to_string(ctx.descriptor_path()).unwrap();
    let unknown = ctx.stdout_of(&["uuid"]);

    ctx.new_cmd()
        .args(["snapshot-switch", &unknown])
        .assert()
        .failure()
        .code(2);

    assert_eq!(std::fs::read_to_string(ctx.descriptor_path()).unwrap(), before);
}

#[test]
fn test_switch_malformed_uuid() {
    let ctx = common::raw_disk();

    ctx.new_cmd()
        .args(["snapshot-switch", "not-a-uuid"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid snapshot uuid"));
}

// ============================================================================
// DELETE
// ============================================================================

#[test]
fn test_delete_unknown_uuid() {
    let ctx = common::raw_disk();
    let unknown = ctx.stdout_of(&["uuid"]);

    ctx.new_cmd()
        .args(["snapshot-delete", &unknown])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains(unknown.as_str()));
}

#[test]
fn test_delete_requires_uuid() {
    let ctx = common::raw_disk();
    ctx.new_cmd().arg("snapshot-delete").assert().failure();
}
