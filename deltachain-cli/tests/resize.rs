use predicates::prelude::*;

mod common;

#[test]
fn test_resize_zero() {
    let mut ctx = common::raw_disk();

    ctx.cmd
        .args(["resize", "0", "--offline"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("greater than zero"));
}

#[test]
fn test_online_resize_needs_device() {
    let ctx = common::raw_disk();

    ctx.new_cmd()
        .args(["resize", "2M"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("bound device"));
}

#[test]
fn test_umount_without_device() {
    let ctx = common::raw_disk();

    ctx.new_cmd()
        .arg("umount")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no device bound"));
}
