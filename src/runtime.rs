//! Resolves the daemon's data directory and socket path.
//!
//! `BUN_PM_HOME` and `BUN_PM_SOCKET` control where the daemon keeps its data: the
//! directory holds `sock`, `logs/`, and `ecosystem.json`; the socket path can
//! be overridden independently of the data directory.
use std::{
    env,
    path::PathBuf,
    sync::{OnceLock, RwLock},
};

/// Runtime mode that determines the default data directory when no override
/// is supplied via `BUN_PM_HOME`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    /// Standard userspace mode; state lives under the invoking user's home.
    User,
    /// System mode; state is stored in system directories.
    System,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    mode: RuntimeMode,
    home_dir: PathBuf,
    socket_override: Option<PathBuf>,
}

static CONTEXT: OnceLock<RwLock<RuntimeContext>> = OnceLock::new();

fn context_lock() -> &'static RwLock<RuntimeContext> {
    CONTEXT.get_or_init(|| RwLock::new(RuntimeContext::resolve(RuntimeMode::User)))
}

impl RuntimeContext {
    fn resolve(mode: RuntimeMode) -> Self {
        let home_dir = match env::var_os("BUN_PM_HOME") {
            Some(dir) => PathBuf::from(dir),
            None => Self::default_home(mode),
        };
        let socket_override = env::var_os("BUN_PM_SOCKET").map(PathBuf::from);

        Self {
            mode,
            home_dir,
            socket_override,
        }
    }

    fn default_home(mode: RuntimeMode) -> PathBuf {
        match mode {
            RuntimeMode::User => {
                let home = env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/"));
                home.join(".local/share/bun-pm")
            }
            RuntimeMode::System => PathBuf::from("/var/lib/bun-pm"),
        }
    }
}

/// (Re-)reads the runtime context for `mode` from the environment. Call this
/// once at startup, after any `BUN_PM_HOME`/`BUN_PM_SOCKET` overrides are in
/// place; tests call it again whenever they change those variables.
pub fn init(mode: RuntimeMode) {
    let mut guard = context_lock().write().expect("runtime context poisoned");
    *guard = RuntimeContext::resolve(mode);
}

/// Returns the active runtime mode.
pub fn mode() -> RuntimeMode {
    context_lock().read().expect("runtime context poisoned").mode
}

/// Returns the data directory (`BUN_PM_HOME` or the per-mode default).
pub fn home_dir() -> PathBuf {
    context_lock()
        .read()
        .expect("runtime context poisoned")
        .home_dir
        .clone()
}

/// Returns the directory holding per-instance log files (`<home>/logs`).
pub fn log_dir() -> PathBuf {
    home_dir().join("logs")
}

/// Returns the path of the ecosystem file written by `save` and read by
/// `load` when no explicit path is given.
pub fn ecosystem_file() -> PathBuf {
    home_dir().join("ecosystem.json")
}

/// Returns the IPC socket path: `BUN_PM_SOCKET` if set, else `<home>/sock`.
pub fn socket_path() -> PathBuf {
    let guard = context_lock().read().expect("runtime context poisoned");
    guard
        .socket_override
        .clone()
        .unwrap_or_else(|| guard.home_dir.join("sock"))
}

#[cfg(test)]
pub fn init_with_test_home(home: &std::path::Path) {
    let mut guard = context_lock().write().expect("runtime context poisoned");
    guard.mode = RuntimeMode::User;
    guard.home_dir = home.to_path_buf();
    guard.socket_override = env::var_os("BUN_PM_SOCKET").map(PathBuf::from);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::env_lock;
    use tempfile::tempdir;

    #[test]
    fn user_mode_defaults_under_home() {
        let _guard = env_lock();
        let temp = tempdir().expect("tempdir");
        let original_home = env::var("HOME").ok();
        let original_socket = env::var("BUN_PM_SOCKET").ok();
        unsafe {
            env::set_var("HOME", temp.path());
            env::remove_var("BUN_PM_SOCKET");
            env::remove_var("BUN_PM_HOME");
        }

        init(RuntimeMode::User);

        let expected_home = temp.path().join(".local/share/bun-pm");
        assert_eq!(home_dir(), expected_home);
        assert_eq!(log_dir(), expected_home.join("logs"));
        assert_eq!(socket_path(), expected_home.join("sock"));

        if let Some(previous) = original_home {
            unsafe { env::set_var("HOME", previous) };
        } else {
            unsafe { env::remove_var("HOME") };
        }
        if let Some(previous) = original_socket {
            unsafe { env::set_var("BUN_PM_SOCKET", previous) };
        }
    }

    #[test]
    fn bun_pm_home_overrides_default() {
        let _guard = env_lock();
        let temp = tempdir().expect("tempdir");
        let override_dir = temp.path().join("custom");
        unsafe {
            env::set_var("BUN_PM_HOME", &override_dir);
            env::remove_var("BUN_PM_SOCKET");
        }

        init(RuntimeMode::User);
        assert_eq!(home_dir(), override_dir);
        assert_eq!(socket_path(), override_dir.join("sock"));

        unsafe { env::remove_var("BUN_PM_HOME") };
    }

    #[test]
    fn bun_pm_socket_overrides_independent_of_home() {
        let _guard = env_lock();
        let temp = tempdir().expect("tempdir");
        let socket = temp.path().join("custom.sock");
        unsafe {
            env::remove_var("BUN_PM_HOME");
            env::set_var("BUN_PM_SOCKET", &socket);
        }

        init(RuntimeMode::User);
        assert_eq!(socket_path(), socket);

        unsafe { env::remove_var("BUN_PM_SOCKET") };
    }
}
