#[path = "common/mod.rs"]
mod common;

use std::fs;

use assert_cmd::Command;
use common::DaemonGuard;
use predicates::prelude::*;
use tempfile::tempdir;

fn write_sleeper(dir: &std::path::Path, name: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, "#!/bin/sh\nsleep 30\n").expect("write script");
    let mut perms = fs::metadata(&path).unwrap().permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

#[test]
fn unreachable_daemon_exits_with_code_two() {
    let temp = tempdir().unwrap();
    Command::new(assert_cmd::cargo::cargo_bin!("bun-pm"))
        .arg("list")
        .env("BUN_PM_HOME", temp.path().join("nope"))
        .env("BUN_PM_SOCKET", temp.path().join("nope/sock"))
        .assert()
        .code(2)
        .stderr(predicate::str::contains("daemon unreachable"));
}

#[test]
fn missing_subcommand_argument_is_a_usage_error() {
    Command::new(assert_cmd::cargo::cargo_bin!("bun-pm"))
        .arg("stop")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Usage:"));
}

#[test]
fn unknown_command_is_a_usage_error() {
    Command::new(assert_cmd::cargo::cargo_bin!("bun-pm"))
        .arg("frobnicate")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Unknown command"));
}

#[test]
fn start_list_stop_round_trip() {
    let temp = tempdir().unwrap();
    let home = temp.path().join("home");
    fs::create_dir_all(&home).unwrap();
    let daemon = DaemonGuard::start(&home);

    let script = write_sleeper(temp.path(), "sleeper.sh");

    daemon
        .client()
        .arg("start")
        .arg(&script)
        .arg("--name")
        .arg("sleeper")
        .assert()
        .success();

    let output = daemon.client().arg("list").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("sleeper"), "list output was: {stdout}");

    daemon
        .client()
        .arg("stop")
        .arg("sleeper")
        .assert()
        .success();

    daemon
        .client()
        .arg("delete")
        .arg("sleeper")
        .assert()
        .success();
}

#[test]
fn deleting_an_unknown_process_is_a_user_error() {
    let temp = tempdir().unwrap();
    let home = temp.path().join("home");
    fs::create_dir_all(&home).unwrap();
    let daemon = DaemonGuard::start(&home);

    daemon
        .client()
        .arg("delete")
        .arg("f")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn starting_the_same_name_twice_is_a_user_error() {
    let temp = tempdir().unwrap();
    let home = temp.path().join("home");
    fs::create_dir_all(&home).unwrap();
    let daemon = DaemonGuard::start(&home);
    let script = write_sleeper(temp.path(), "dup.sh");

    daemon
        .client()
        .arg("start")
        .arg(&script)
        .arg("--name")
        .arg("dup")
        .assert()
        .success();

    daemon
        .client()
        .arg("start")
        .arg(&script)
        .arg("--name")
        .arg("dup")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("already exists"));

    daemon.client().arg("delete").arg("dup").assert().success();
}
