#[path = "common/mod.rs"]
mod common;

use std::fs;

use common::{DaemonGuard, wait_for};
use predicates::prelude::*;
use serde_json::Value;
use tempfile::tempdir;

#[test]
fn captured_stdout_is_retrievable_through_the_cli() {
    let temp = tempdir().unwrap();
    let home = temp.path().join("home");
    fs::create_dir_all(&home).unwrap();
    let daemon = DaemonGuard::start(&home);

    let script = temp.path().join("talker.sh");
    fs::write(
        &script,
        "#!/bin/sh\nfor i in 1 2 3 4 5; do echo \"line $i\"; sleep 0.2; done\nsleep 30\n",
    )
    .unwrap();
    let mut perms = fs::metadata(&script).unwrap().permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
    fs::set_permissions(&script, perms).unwrap();

    daemon
        .client()
        .arg("start")
        .arg(&script)
        .arg("--name")
        .arg("talker")
        .assert()
        .success();

    let saw_all_lines = wait_for(
        || {
            let output = daemon
                .client()
                .arg("logs")
                .arg("talker")
                .arg("--lines")
                .arg("10")
                .output()
                .unwrap();
            if !output.status.success() {
                return false;
            }
            let value: Value = match serde_json::from_slice(&output.stdout) {
                Ok(value) => value,
                Err(_) => return false,
            };
            let lines = value["lines"].as_array().cloned().unwrap_or_default();
            lines.len() >= 5
        },
        std::time::Duration::from_secs(5),
    );
    assert!(saw_all_lines, "did not capture all expected lines in time");

    let output = daemon
        .client()
        .arg("logs")
        .arg("talker")
        .arg("--filter")
        .arg("line 3")
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: Value = serde_json::from_slice(&output.stdout).unwrap();
    let lines = value["lines"].as_array().unwrap();
    assert_eq!(lines.len(), 1);
    assert!(lines[0]["content"].as_str().unwrap().contains("line 3"));

    daemon
        .client()
        .arg("delete")
        .arg("talker")
        .arg("--force")
        .assert()
        .success();
}

#[test]
fn logs_for_an_unknown_process_is_a_user_error() {
    let temp = tempdir().unwrap();
    let home = temp.path().join("home");
    fs::create_dir_all(&home).unwrap();
    let daemon = DaemonGuard::start(&home);

    daemon
        .client()
        .arg("logs")
        .arg("ghost")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("not found"));
}
