//! Composes the supervisor, log manager, and metrics collector into a
//! long-lived process: ensures the data directory, binds the control
//! socket (reclaiming a stale one only after probing for a live owner),
//! installs signal handlers, and blocks until shutdown.
use std::{
    fs,
    io::Write,
    os::unix::net::UnixStream,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use serde_json::{Value, json};
use thiserror::Error;
use tracing::info;

use crate::{
    ipc::{self, IpcError, IpcRequest, IpcResponse, IpcServer},
    logs::LogEvent,
    runtime,
    supervisor::Supervisor,
};

/// Failures that prevent the daemon from starting at all.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Another daemon instance already owns the control socket.
    #[error("a daemon is already listening at {0}")]
    AlreadyRunning(PathBuf),
    /// Binding or serving the control socket failed.
    #[error(transparent)]
    Ipc(#[from] IpcError),
    /// The data directory could not be created.
    #[error("failed to create data directory {path}: {source}")]
    DataDir {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
}

/// `true` iff a live daemon answers a connection at `socket_path`. Used
/// both to decide whether a stale-looking socket file is actually stale,
/// and to implement the CLI's own "is the daemon up" check.
pub fn is_active(socket_path: &Path) -> bool {
    UnixStream::connect(socket_path).is_ok()
}

/// Owns the supervisor and control socket for the lifetime of the daemon
/// process.
pub struct Daemon {
    socket_path: PathBuf,
    home_dir: PathBuf,
}

impl Daemon {
    /// A daemon bound to the current runtime context's socket/home paths
    /// (`BUN_PM_HOME`/`BUN_PM_SOCKET`, or their per-mode defaults).
    pub fn new() -> Self {
        Self {
            socket_path: runtime::socket_path(),
            home_dir: runtime::home_dir(),
        }
    }

    /// Runs the daemon to completion: binds the socket, starts serving
    /// connections and the monitor tick, then blocks until SIGINT/SIGTERM,
    /// at which point it stops every managed instance and removes the
    /// socket file before returning.
    pub fn run(self) -> Result<(), DaemonError> {
        fs::create_dir_all(&self.home_dir).map_err(|source| DaemonError::DataDir {
            path: self.home_dir.clone(),
            source,
        })?;

        if self.socket_path.exists() {
            if is_active(&self.socket_path) {
                return Err(DaemonError::AlreadyRunning(self.socket_path.clone()));
            }
            info!(socket = %self.socket_path.display(), "removing stale socket file");
            let _ = fs::remove_file(&self.socket_path);
        }

        let server = IpcServer::bind(&self.socket_path)?;
        let supervisor = Supervisor::new();

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_for_signal = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            shutdown_for_signal.store(true, Ordering::SeqCst);
        })
        .expect("failed to install SIGINT/SIGTERM handler");

        let tick_supervisor = Arc::clone(&supervisor);
        let tick_shutdown = Arc::clone(&shutdown);
        thread::spawn(move || {
            while !tick_shutdown.load(Ordering::Relaxed) {
                tick_supervisor.enforce_memory_limits();
                thread::sleep(Duration::from_secs(1));
            }
        });

        let accept_supervisor = Arc::clone(&supervisor);
        thread::spawn(move || {
            server.serve_with(Arc::new(move |stream| {
                handle_connection(stream, Arc::clone(&accept_supervisor));
            }));
        });

        info!(socket = %self.socket_path.display(), "daemon listening");

        while !shutdown.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(200));
        }

        info!("shutdown signal received; stopping managed instances");
        supervisor.stop_all();
        let _ = fs::remove_file(&self.socket_path);
        info!("daemon shutdown complete");
        Ok(())
    }
}

impl Default for Daemon {
    fn default() -> Self {
        Self::new()
    }
}

/// Services one accepted connection. Every request is dispatched through
/// [`Supervisor::dispatch`] except `logs` requests carrying `stream: true`,
/// which hand the connection over to [`stream_logs`] for the remainder of
/// its life.
fn handle_connection(stream: UnixStream, supervisor: Arc<Supervisor>) {
    let mut writer = match stream.try_clone() {
        Ok(w) => w,
        Err(_) => return,
    };
    let mut reader = std::io::BufReader::new(stream);
    loop {
        let request = match ipc::read_request(&mut reader) {
            Ok(request) => request,
            Err(_) => return,
        };

        let wants_stream = request
            .payload
            .get("stream")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if request.kind == "logs" && wants_stream {
            stream_logs(&request, &supervisor, &mut writer);
            return;
        }

        let response = supervisor.dispatch(request);
        if ipc::write_response(&mut writer, &response).is_err() {
            return;
        }
    }
}

/// Drains the log manager's backlog-then-live subscription for one `logs
/// --stream` request, writing one response frame per line until the
/// instance is deleted (a sentinel `{"event":"end"}` frame) or the client
/// disconnects (a write failure ends the loop).
fn stream_logs(request: &IpcRequest, supervisor: &Supervisor, writer: &mut impl Write) {
    let Some(instance_id) = request.payload.get("id").and_then(Value::as_str) else {
        let _ = ipc::write_response(writer, &IpcResponse::err(request.id.clone(), "missing id"));
        return;
    };

    let receiver = match supervisor.logs().stream(instance_id) {
        Ok(receiver) => receiver,
        Err(err) => {
            let _ = ipc::write_response(writer, &IpcResponse::err(request.id.clone(), err.to_string()));
            return;
        }
    };

    for event in receiver {
        let response = match event {
            LogEvent::Line(line) => IpcResponse::ok(
                request.id.clone(),
                json!({"event": "line", "line": serde_json::to_value(&line).expect("serializable")}),
            ),
            LogEvent::End => {
                let _ = ipc::write_response(writer, &IpcResponse::ok(request.id.clone(), json!({"event": "end"})));
                return;
            }
        };
        if ipc::write_response(writer, &response).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::env_lock;
    use tempfile::tempdir;

    #[test]
    fn is_active_false_when_nothing_listens() {
        let temp = tempdir().unwrap();
        let socket = temp.path().join("nope.sock");
        assert!(!is_active(&socket));
    }

    #[test]
    fn run_rejects_a_second_daemon_on_the_same_socket() {
        let _guard = env_lock();
        let temp = tempdir().unwrap();
        runtime::init_with_test_home(temp.path());

        let socket_path = runtime::socket_path();
        let listener = std::os::unix::net::UnixListener::bind(&socket_path).unwrap();

        let err = Daemon::new().run().unwrap_err();
        assert!(matches!(err, DaemonError::AlreadyRunning(_)));
        drop(listener);
    }
}
