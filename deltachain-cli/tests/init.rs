use predicates::prelude::*;

mod common;

#[test]
fn test_init_zero_size() {
    let ctx = common::empty_dir();

    common::bare_cmd()
        .args(["init", "--size", "0"])
        .arg(ctx.path())
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("greater than zero"));

    assert!(!ctx.descriptor_path().exists());
}

#[test]
fn test_init_oversized() {
    let ctx = common::empty_dir();

    common::bare_cmd()
        .args(["init", "--size", "18446744073709551615"])
        .arg(ctx.path())
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("too large"));

    assert!(!ctx.descriptor_path().exists());
}

#[test]
fn test_init_bad_size_suffix() {
    let ctx = common::empty_dir();

    common::bare_cmd()
        .args(["init", "--size", "12Q"])
        .arg(ctx.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown size suffix"));
}

#[test]
fn test_init_bad_mode() {
    let ctx = common::empty_dir();

    common::bare_cmd()
        .args(["init", "--size", "1M", "--mode", "sparse"])
        .arg(ctx.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown image mode"));
}

#[test]
fn test_init_existing_disk() {
    let ctx = common::raw_disk();
    let before = std::fs::read_to_string(ctx.descriptor_path()).unwrap();

    common::bare_cmd()
        .args(["init", "--size", "1M"])
        .arg(ctx.path())
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("already exists"));

    assert_eq!(std::fs::read_to_string(ctx.descriptor_path()).unwrap(), before);
}
