//! Command-line argument parsing. Translating parsed arguments into IPC
//! requests and formatting responses both live in `bin/main.rs`.
use clap::{Parser, Subcommand};
use std::str::FromStr;
use tracing::level_filters::LevelFilter;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let lowercase = trimmed.to_ascii_lowercase();
        let level = match lowercase.as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// A process count argument: either a fixed positive integer or the
/// literal `max`, meaning one instance per available CPU.
#[derive(Clone, Debug)]
pub enum InstancesArg {
    /// A fixed, explicit instance count.
    Fixed(u32),
    /// Resolve to the number of available CPUs at start time.
    Max,
}

impl FromStr for InstancesArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.eq_ignore_ascii_case("max") {
            return Ok(InstancesArg::Max);
        }
        value
            .parse::<u32>()
            .map(InstancesArg::Fixed)
            .map_err(|_| format!("invalid instance count '{value}' (expected a number or 'max')"))
    }
}

/// A single `KEY=VALUE` environment variable assignment.
#[derive(Clone, Debug)]
pub struct EnvVar {
    /// Variable name.
    pub key: String,
    /// Variable value.
    pub value: String,
}

impl FromStr for EnvVar {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok(EnvVar {
                key: key.to_string(),
                value: value.to_string(),
            }),
            _ => Err(format!("invalid --env entry '{value}' (expected KEY=VALUE)")),
        }
    }
}

/// Command-line interface for the process supervisor.
#[derive(Parser)]
#[command(name = "bun-pm", version, author)]
#[command(about = "Spawns, supervises, and logs child processes over a local control socket", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Start a new managed process (or all apps from an ecosystem file).
    Start {
        /// Path to a script/executable, or to an ecosystem JSON file.
        target: String,

        /// Override the process name (ignored for ecosystem files).
        #[arg(long)]
        name: Option<String>,

        /// Instance count, or `max` for one per CPU.
        #[arg(long)]
        instances: Option<InstancesArg>,

        /// Additional `KEY=VALUE` environment variables; may repeat.
        #[arg(long = "env", value_name = "KEY=VALUE")]
        env: Vec<EnvVar>,
    },

    /// Stop a running process by name or id.
    Stop {
        /// Name or id of the process (or cluster) to stop.
        identifier: String,
    },

    /// Restart a running process by name or id.
    Restart {
        /// Name or id of the process (or cluster) to restart.
        identifier: String,
    },

    /// Delete a process entirely, stopping it first if running.
    #[command(visible_alias = "del")]
    Delete {
        /// Name or id of the process (or cluster) to delete.
        identifier: String,

        /// Delete even if the process is currently running.
        #[arg(short, long)]
        force: bool,
    },

    /// Scale a cluster to exactly `n` instances.
    Scale {
        /// Name or id of the cluster to scale.
        identifier: String,

        /// Target instance count.
        n: u32,
    },

    /// List every managed process.
    #[command(visible_alias = "ls")]
    List,

    /// Show logs for a process.
    Logs {
        /// Name or id of the process whose logs should be displayed.
        identifier: String,

        /// Number of lines to show.
        #[arg(long, default_value = "50")]
        lines: usize,

        /// Only show lines containing this substring or matching this regex.
        #[arg(long)]
        filter: Option<String>,

        /// Keep the connection open and print new lines as they arrive.
        #[arg(long)]
        stream: bool,
    },

    /// Show a live snapshot of CPU and memory usage for every instance.
    Monit,

    /// Show the status of every managed process and the daemon itself.
    Status,

    /// Persist the current process table to the ecosystem file.
    Save,

    /// Start every app from the ecosystem file, reconciling drifted ones.
    Load,

    /// Run the supervisor daemon in the foreground. Hidden: normally
    /// spawned by the first client command that finds no daemon listening.
    #[command(hide = true)]
    Daemon,
}

/// Parses command-line arguments, returning clap's error instead of
/// exiting, so the caller can map it onto the exit-code contract (clap's
/// own default exit code for a parse failure, 2, collides with this
/// protocol's "2 = daemon unreachable").
pub fn try_parse_args() -> Result<Cli, clap::Error> {
    Cli::try_parse()
}
