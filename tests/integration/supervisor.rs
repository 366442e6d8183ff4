#[path = "common/mod.rs"]
mod common;

use std::fs;

use common::{DaemonGuard, wait_for};
use serde_json::Value;
use tempfile::tempdir;

fn write_sleeper(dir: &std::path::Path, name: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, "#!/bin/sh\nsleep 30\n").expect("write script");
    let mut perms = fs::metadata(&path).unwrap().permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

fn list(daemon: &DaemonGuard) -> Value {
    let output = daemon.client().arg("list").output().unwrap();
    assert!(output.status.success());
    serde_json::from_slice(&output.stdout).expect("list output is JSON")
}

#[test]
fn scale_up_then_down_renames_back_to_the_bare_id() {
    let temp = tempdir().unwrap();
    let home = temp.path().join("home");
    fs::create_dir_all(&home).unwrap();
    let daemon = DaemonGuard::start(&home);
    let script = write_sleeper(temp.path(), "cluster.sh");

    daemon
        .client()
        .arg("start")
        .arg(&script)
        .arg("--name")
        .arg("web")
        .arg("--instances")
        .arg("3")
        .assert()
        .success();

    let instances = list(&daemon);
    let ids: Vec<String> = instances
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids.len(), 3);
    assert!(ids.contains(&"web_0".to_string()));
    assert!(ids.contains(&"web_1".to_string()));
    assert!(ids.contains(&"web_2".to_string()));

    daemon
        .client()
        .arg("scale")
        .arg("web")
        .arg("1")
        .assert()
        .success();

    let instances = list(&daemon);
    let ids: Vec<String> = instances
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids, vec!["web".to_string()]);

    daemon.client().arg("delete").arg("web").assert().success();
}

#[test]
fn scaled_up_singleton_respawns_after_exit() {
    let temp = tempdir().unwrap();
    let home = temp.path().join("home");
    fs::create_dir_all(&home).unwrap();
    let daemon = DaemonGuard::start(&home);

    let script = temp.path().join("die_once.sh");
    let marker = temp.path().join("died");
    fs::write(
        &script,
        format!(
            "#!/bin/sh\nif [ -e {marker} ]; then\n  sleep 30\nelse\n  touch {marker}\n  exit 1\nfi\n",
            marker = marker.display()
        ),
    )
    .unwrap();
    let mut perms = fs::metadata(&script).unwrap().permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
    fs::set_permissions(&script, perms).unwrap();

    let ecosystem = temp.path().join("eco.json");
    fs::write(
        &ecosystem,
        format!(
            r#"{{"apps":[{{"id":"d","script":"{}","max_restarts":5,"restart_delay":"50ms"}}]}}"#,
            script.display()
        ),
    )
    .unwrap();

    daemon.client().arg("start").arg(&ecosystem).assert().success();

    daemon.client().arg("scale").arg("d").arg("1").assert().success();

    let instances = list(&daemon);
    let ids: Vec<String> = instances
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids, vec!["d".to_string()]);

    daemon.client().arg("scale").arg("d").arg("2").assert().success();

    let instances = list(&daemon);
    let ids: Vec<String> = instances
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["id"].as_str().unwrap().to_string())
        .collect();
    assert!(ids.contains(&"d_0".to_string()), "expected d_0 after scale-up, got {ids:?}");

    let respawned = wait_for(
        || {
            let instances = list(&daemon);
            instances
                .as_array()
                .unwrap()
                .iter()
                .any(|i| i["id"] == "d_0" && i["restart_count"].as_u64().unwrap_or(0) >= 1)
        },
        std::time::Duration::from_secs(10),
    );
    assert!(
        respawned,
        "d_0 never respawned after its exit (rename left it orphaned)"
    );

    let instances = list(&daemon);
    let statuses: Vec<String> = instances
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["status"].as_str().unwrap().to_string())
        .collect();
    assert!(
        statuses.iter().all(|s| s != "errored"),
        "an instance ended up errored: {statuses:?}"
    );

    let logs = daemon.client().arg("logs").arg("d_0").output().unwrap();
    assert!(logs.status.success(), "logs lookup for d_0 should not be NotFound");

    daemon.client().arg("delete").arg("d").arg("--force").assert().success();
}

#[test]
fn a_non_restarting_process_that_exits_cleanly_ends_up_stopped() {
    let temp = tempdir().unwrap();
    let home = temp.path().join("home");
    fs::create_dir_all(&home).unwrap();
    let daemon = DaemonGuard::start(&home);

    let script = temp.path().join("greet.sh");
    fs::write(&script, "#!/bin/sh\necho hello\nexit 0\n").unwrap();
    let mut perms = fs::metadata(&script).unwrap().permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
    fs::set_permissions(&script, perms).unwrap();

    let ecosystem = temp.path().join("eco.json");
    fs::write(
        &ecosystem,
        format!(
            r#"{{"apps":[{{"id":"a","script":"{}","autorestart":false}}]}}"#,
            script.display()
        ),
    )
    .unwrap();

    daemon.client().arg("start").arg(&ecosystem).assert().success();

    let became_stopped = wait_for(
        || {
            let instances = list(&daemon);
            instances
                .as_array()
                .unwrap()
                .iter()
                .any(|i| i["id"] == "a" && i["status"] == "stopped")
        },
        std::time::Duration::from_secs(5),
    );
    assert!(became_stopped, "instance never settled into stopped");

    let instances = list(&daemon);
    let a = instances
        .as_array()
        .unwrap()
        .iter()
        .find(|i| i["id"] == "a")
        .unwrap();
    assert_eq!(a["exit_code"], 0);
    assert_eq!(a["restart_count"], 0);

    let output = daemon.client().arg("logs").arg("a").output().unwrap();
    assert!(output.status.success());
    let value: Value = serde_json::from_slice(&output.stdout).unwrap();
    let lines = value["lines"].as_array().unwrap();
    assert!(
        lines.iter().any(|l| l["content"].as_str().unwrap().contains("hello")),
        "logs did not contain hello: {lines:?}"
    );

    daemon.client().arg("delete").arg("a").arg("--force").assert().success();
}

#[test]
fn cluster_instances_get_distinct_port_and_node_app_instance() {
    let temp = tempdir().unwrap();
    let home = temp.path().join("home");
    fs::create_dir_all(&home).unwrap();
    let daemon = DaemonGuard::start(&home);

    let script = temp.path().join("port_reporter.sh");
    fs::write(
        &script,
        "#!/bin/sh\necho \"PORT=$PORT INSTANCE=$NODE_APP_INSTANCE\"\nsleep 30\n",
    )
    .unwrap();
    let mut perms = fs::metadata(&script).unwrap().permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
    fs::set_permissions(&script, perms).unwrap();

    let ecosystem = temp.path().join("eco.json");
    fs::write(
        &ecosystem,
        format!(
            r#"{{"apps":[{{"id":"b","script":"{}","instances":3,"env":{{"PORT":"4000"}}}}]}}"#,
            script.display()
        ),
    )
    .unwrap();

    daemon.client().arg("start").arg(&ecosystem).assert().success();

    let mut seen_ports = Vec::new();
    for (index, id) in ["b_0", "b_1", "b_2"].iter().enumerate() {
        let saw_line = wait_for(
            || {
                let output = daemon
                    .client()
                    .arg("logs")
                    .arg(id)
                    .arg("--lines")
                    .arg("5")
                    .output()
                    .unwrap();
                output.status.success()
                    && String::from_utf8_lossy(&output.stdout).contains("PORT=")
            },
            std::time::Duration::from_secs(5),
        );
        assert!(saw_line, "instance {id} never logged its PORT/instance line");

        let output = daemon.client().arg("logs").arg(id).output().unwrap();
        let value: Value = serde_json::from_slice(&output.stdout).unwrap();
        let line = value["lines"][0]["content"].as_str().unwrap().to_string();
        assert!(
            line.contains(&format!("INSTANCE={index}")),
            "instance {id} line was: {line}"
        );
        seen_ports.push(line);
    }

    assert!(seen_ports[0].starts_with("PORT=4000 "));
    assert!(seen_ports[1].starts_with("PORT=4001 "));
    assert!(seen_ports[2].starts_with("PORT=4002 "));

    daemon.client().arg("delete").arg("b").arg("--force").assert().success();
}

#[test]
fn monit_with_no_identifier_returns_every_instance() {
    let temp = tempdir().unwrap();
    let home = temp.path().join("home");
    fs::create_dir_all(&home).unwrap();
    let daemon = DaemonGuard::start(&home);
    let script = write_sleeper(temp.path(), "monit.sh");

    daemon
        .client()
        .arg("start")
        .arg(&script)
        .arg("--name")
        .arg("m")
        .assert()
        .success();

    let got_sample = wait_for(
        || {
            let output = daemon.client().arg("monit").output().unwrap();
            output.status.success()
                && serde_json::from_slice::<Value>(&output.stdout)
                    .map(|v| v.get("m").is_some())
                    .unwrap_or(false)
        },
        std::time::Duration::from_secs(5),
    );
    assert!(got_sample, "monit never reported a sample for instance 'm'");

    daemon.client().arg("delete").arg("m").arg("--force").assert().success();
}

#[test]
fn a_process_that_always_fails_ends_up_errored() {
    let temp = tempdir().unwrap();
    let home = temp.path().join("home");
    fs::create_dir_all(&home).unwrap();
    let daemon = DaemonGuard::start(&home);

    let script = temp.path().join("fails.sh");
    fs::write(&script, "#!/bin/sh\nexit 1\n").unwrap();
    let mut perms = fs::metadata(&script).unwrap().permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
    fs::set_permissions(&script, perms).unwrap();

    // The plain `start <script>` CLI path has no flags for max_restarts/
    // restart_delay (out of scope per spec.md's CLI contract), so drive the
    // policy knobs through an ecosystem file instead, keeping the restart
    // budget small enough for the test to observe `errored` quickly.
    let ecosystem = temp.path().join("eco.json");
    fs::write(
        &ecosystem,
        format!(
            r#"{{"apps":[{{"id":"flaky","script":"{}","max_restarts":2,"restart_delay":"50ms"}}]}}"#,
            script.display()
        ),
    )
    .unwrap();

    daemon.client().arg("start").arg(&ecosystem).assert().success();

    let became_errored = wait_for(
        || {
            let instances = list(&daemon);
            instances
                .as_array()
                .unwrap()
                .iter()
                .any(|i| i["id"] == "flaky" && i["status"] == "errored")
        },
        std::time::Duration::from_secs(10),
    );
    assert!(became_errored, "instance never reached errored status");

    let instances = list(&daemon);
    let flaky = instances
        .as_array()
        .unwrap()
        .iter()
        .find(|i| i["id"] == "flaky")
        .unwrap();
    assert_eq!(flaky["restart_count"], 2);

    daemon
        .client()
        .arg("delete")
        .arg("flaky")
        .arg("--force")
        .assert()
        .success();
}
