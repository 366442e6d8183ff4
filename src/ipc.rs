//! Unix-socket IPC: request/response envelopes, newline-delimited JSON
//! framing, and a thread-per-connection accept loop.
use std::{
    fs,
    io::{BufRead, BufReader, Write},
    os::unix::net::{UnixListener, UnixStream},
    path::PathBuf,
    sync::Arc,
    thread,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::runtime;

/// Frames larger than this close the connection rather than growing
/// unbounded memory for a misbehaving or malicious client.
const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// One request crossing the control socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcRequest {
    /// Correlates this request with its response; caller-chosen.
    pub id: String,
    /// Command name (`start`, `stop`, `restart`, `delete`, `scale`, `list`,
    /// `logs`, `monit`, `status`, `save`, `load`, `ping`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Command-specific arguments.
    #[serde(default)]
    pub payload: Value,
}

/// One response crossing the control socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcResponse {
    /// Echoes the request's `id`.
    pub id: String,
    /// Whether the command succeeded.
    pub success: bool,
    /// Present on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Present on failure; a human-readable message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IpcResponse {
    /// Builds a success response carrying `data`.
    pub fn ok(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Builds a failure response carrying `message`.
    pub fn err(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Errors raised while framing or transporting an IPC message.
#[derive(Debug, Error)]
pub enum IpcError {
    /// The connection was closed or reset mid-frame.
    #[error("connection closed")]
    ConnectionClosed,
    /// A line exceeded [`MAX_FRAME_BYTES`]; the connection was closed.
    #[error("frame too large (max {0} bytes)")]
    FrameTooLarge(usize),
    /// The frame was not valid JSON.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    /// I/O failure reading or writing the socket.
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reads one newline-delimited JSON request from `reader`.
pub fn read_request(reader: &mut impl BufRead) -> Result<IpcRequest, IpcError> {
    let line = read_frame(reader)?;
    Ok(serde_json::from_str(&line)?)
}

/// Writes one newline-delimited JSON response to `stream`.
pub fn write_response(stream: &mut impl Write, response: &IpcResponse) -> Result<(), IpcError> {
    let payload = serde_json::to_string(response)?;
    stream.write_all(payload.as_bytes())?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}

/// Writes one newline-delimited JSON request (client side).
pub fn write_request(stream: &mut impl Write, request: &IpcRequest) -> Result<(), IpcError> {
    let payload = serde_json::to_string(request)?;
    stream.write_all(payload.as_bytes())?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}

/// Reads one newline-delimited JSON response (client side).
pub fn read_response(reader: &mut impl BufRead) -> Result<IpcResponse, IpcError> {
    let line = read_frame(reader)?;
    Ok(serde_json::from_str(&line)?)
}

fn read_frame(reader: &mut impl BufRead) -> Result<String, IpcError> {
    let mut line = String::new();
    loop {
        let before = line.len();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            if line.is_empty() {
                return Err(IpcError::ConnectionClosed);
            }
            break;
        }
        if line.len() > MAX_FRAME_BYTES {
            return Err(IpcError::FrameTooLarge(MAX_FRAME_BYTES));
        }
        if line[before..].ends_with('\n') {
            break;
        }
    }
    Ok(line.trim_end_matches('\n').to_string())
}

/// Sends one request over a fresh connection to the daemon's control
/// socket and waits for the matching response. Used by the thin CLI.
pub fn call(socket: &PathBuf, request: &IpcRequest) -> Result<IpcResponse, IpcError> {
    let stream = UnixStream::connect(socket)?;
    let mut writer = stream.try_clone()?;
    write_request(&mut writer, request)?;
    let mut reader = BufReader::new(stream);
    read_response(&mut reader)
}

/// Handles one already-accepted connection: reads requests until the
/// client disconnects, dispatching each through `handler` and writing back
/// its response. A malformed or oversized frame ends the connection.
pub fn serve_connection(stream: UnixStream, handler: impl Fn(IpcRequest) -> IpcResponse) {
    let mut writer = match stream.try_clone() {
        Ok(w) => w,
        Err(_) => return,
    };
    let mut reader = BufReader::new(stream);
    loop {
        let request = match read_request(&mut reader) {
            Ok(req) => req,
            Err(IpcError::ConnectionClosed) => return,
            Err(_) => return,
        };
        let id = request.id.clone();
        let response = handler(request);
        if write_response(&mut writer, &response).is_err() {
            return;
        }
        let _ = id;
    }
}

/// Binds the control socket and accepts connections, spawning one thread
/// per connection so a slow or stuck client never blocks others.
pub struct IpcServer {
    listener: UnixListener,
}

impl IpcServer {
    /// Binds at `socket_path`, removing a stale socket file first (the
    /// caller is responsible for confirming no live daemon owns it).
    pub fn bind(socket_path: &PathBuf) -> Result<Self, IpcError> {
        if socket_path.exists() {
            fs::remove_file(socket_path)?;
        }
        if let Some(parent) = socket_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(socket_path)?;
        Ok(Self { listener })
    }

    /// Accepts connections in a loop, dispatching each to its own thread
    /// via `handler`. Returns once the listener itself errors (typically
    /// because the socket was removed during shutdown).
    pub fn serve(&self, handler: Arc<dyn Fn(IpcRequest) -> IpcResponse + Send + Sync>) {
        self.serve_with(Arc::new(move |stream| {
            let handler = Arc::clone(&handler);
            serve_connection(stream, move |req| handler(req));
        }));
    }

    /// Lower-level accept loop: gives `handler` the raw accepted stream
    /// instead of a pre-wired request/response handler, so a caller that
    /// needs to hold a connection open across multiple frames (a log
    /// stream, say) can implement its own read loop.
    pub fn serve_with(&self, handler: Arc<dyn Fn(UnixStream) + Send + Sync>) {
        for incoming in self.listener.incoming() {
            let stream = match incoming {
                Ok(stream) => stream,
                Err(_) => continue,
            };
            let handler = Arc::clone(&handler);
            thread::spawn(move || handler(stream));
        }
    }
}

/// Convenience wrapper for the thin CLI: builds a request and calls the
/// daemon at the configured socket path.
pub fn request(kind: &str, payload: Value) -> Result<IpcResponse, IpcError> {
    let socket = runtime::socket_path();
    let envelope = IpcRequest {
        id: format!("{}-{}", std::process::id(), kind),
        kind: kind.to_string(),
        payload,
    };
    call(&socket, &envelope)
}
