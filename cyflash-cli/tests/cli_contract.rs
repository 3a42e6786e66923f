//! Integration tests for core CLI contract behavior.

use {predicates::prelude::*, std::fs, tempfile::tempdir};

fn cli_cmd() -> assert_cmd::Command {
    assert_cmd::Command::cargo_bin("cyflash").expect("binary should build")
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("cyflash"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero() {
    let mut cmd = cli_cmd();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("cyflash"));
}

#[test]
fn missing_arguments_exit_with_usage_error() {
    let mut cmd = cli_cmd();
    cmd.assert().failure().code(2);
}

#[test]
fn missing_interface_exits_with_usage_error() {
    let mut cmd = cli_cmd();
    cmd.arg("firmware.cyacd").assert().failure().code(2);
}

#[test]
fn both_interfaces_exit_with_usage_error() {
    let mut cmd = cli_cmd();
    cmd.args([
        "--serial",
        "/dev/ttyUSB0",
        "--canbus",
        "socketcan",
        "firmware.cyacd",
    ])
    .assert()
    .failure()
    .code(2);
}

#[test]
fn invalid_chunk_size_exits_with_usage_error() {
    let mut cmd = cli_cmd();
    cmd.args(["--serial", "/dev/ttyUSB0", "-c", "48", "firmware.cyacd"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("chunk size"));
}

#[test]
fn conflicting_downgrade_flags_exit_with_usage_error() {
    let mut cmd = cli_cmd();
    cmd.args([
        "--serial",
        "/dev/ttyUSB0",
        "--downgrade",
        "--nodowngrade",
        "firmware.cyacd",
    ])
    .assert()
    .failure()
    .code(2);
}

#[test]
fn nonexistent_image_exits_one_with_message() {
    let dir = tempdir().expect("tempdir should be created");
    let missing = dir.path().join("not_there.cyacd");

    let mut cmd = cli_cmd();
    cmd.arg("--serial")
        .arg("/dev/ttyUSB0")
        .arg(missing.as_os_str())
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("cannot load image"));
}

#[test]
fn corrupt_image_exits_one_before_touching_the_port() {
    let dir = tempdir().expect("tempdir should be created");
    let corrupt = dir.path().join("corrupt.cyacd");
    fs::write(&corrupt, "this is not hex\n").expect("write corrupt image");

    let mut cmd = cli_cmd();
    cmd.arg("--serial")
        .arg("/dev/does-not-exist")
        .arg(corrupt.as_os_str())
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("cannot load image"));
}
