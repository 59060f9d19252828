use predicates::prelude::*;

mod common;

#[test]
fn test_uuid_is_braced() {
    common::bare_cmd()
        .arg("uuid")
        .assert()
        .success()
        .stdout(predicate::str::is_match(r"^\{[0-9a-f]{8}(-[0-9a-f]{4}){3}-[0-9a-f]{12}\}\n$").unwrap());
}

#[test]
fn test_uuid_is_fresh() {
    let first = common::bare_cmd().arg("uuid").output().unwrap();
    let second = common::bare_cmd().arg("uuid").output().unwrap();
    assert_ne!(first.stdout, second.stdout);
}
