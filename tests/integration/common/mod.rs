#![allow(dead_code)]

use std::{
    path::{Path, PathBuf},
    process::{Child, Command},
    thread,
    time::{Duration, Instant},
};

/// Spawns the real `bun-pm daemon` binary against an isolated `BUN_PM_HOME`,
/// and kills it on drop. Every test that needs a live daemon to talk to
/// goes through this so state never leaks between tests.
pub struct DaemonGuard {
    child: Child,
    pub home: PathBuf,
    pub socket: PathBuf,
}

impl DaemonGuard {
    pub fn start(home: &Path) -> Self {
        let socket = home.join("sock");
        let child = Command::new(assert_cmd::cargo::cargo_bin!("bun-pm"))
            .arg("daemon")
            .env("BUN_PM_HOME", home)
            .spawn()
            .expect("failed to spawn daemon");

        let deadline = Instant::now() + Duration::from_secs(5);
        while !socket.exists() {
            if Instant::now() >= deadline {
                panic!("daemon did not bind {} in time", socket.display());
            }
            thread::sleep(Duration::from_millis(20));
        }

        Self {
            child,
            home: home.to_path_buf(),
            socket,
        }
    }

    /// Builds a client invocation pointed at this daemon's `BUN_PM_HOME`.
    pub fn client(&self) -> Command {
        let mut command = Command::new(assert_cmd::cargo::cargo_bin!("bun-pm"));
        command.env("BUN_PM_HOME", &self.home);
        command
    }
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub fn wait_for(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(20));
    }
}
