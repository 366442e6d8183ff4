//! Process supervisor daemon: spawns, watches, restarts, scales, and logs
//! user-specified child processes, exposed over a local IPC socket.
#![warn(unused_crate_dependencies)]
// Test-only dependencies are only used in test code.
#[cfg(test)]
use assert_cmd as _;
#[cfg(test)]
use predicates as _;
#[cfg(test)]
use tempfile as _;
use tracing_subscriber as _;

/// Thin CLI surface (argument parsing only; formatting lives in `bin/main.rs`).
pub mod cli;

/// Ecosystem file parsing, normalization, and validation.
pub mod config;

/// Daemon composition: startup, signal handling, graceful shutdown.
pub mod daemon;

/// Error taxonomy.
pub mod error;

/// Unix-socket IPC: framing, request/response envelope, accept loop.
pub mod ipc;

/// Log capture, retrieval, and streaming.
pub mod logs;

/// Per-instance CPU/memory sampling and history.
pub mod metrics;

/// The process table: configs and runtime instance records.
pub mod process;

/// Runtime paths (data directory, socket path) and environment overrides.
pub mod runtime;

/// The process supervisor: lifecycle state machine and IPC dispatch.
pub mod supervisor;

/// Test utilities shared across module test suites.
#[doc(hidden)]
pub mod test_utils;
