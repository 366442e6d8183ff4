use std::{collections::HashMap, env, path::PathBuf, process::ExitCode};

use clap::error::ErrorKind;
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

use bun_pm::{
    cli::{Cli, Commands, InstancesArg, try_parse_args},
    config,
    daemon::Daemon,
    ipc::{self, IpcError},
    runtime::{self, RuntimeMode},
};

fn main() -> ExitCode {
    let args = match try_parse_args() {
        Ok(args) => args,
        Err(err) => return handle_parse_error(err),
    };
    init_logging(&args);
    runtime::init(RuntimeMode::User);

    if let Commands::Daemon = args.command {
        return match Daemon::new().run() {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("bun-pm: {err}");
                ExitCode::from(1)
            }
        };
    }

    match run(args.command) {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
            ExitCode::SUCCESS
        }
        Err(CliError::Usage(message)) => {
            eprintln!("Usage: {message}");
            ExitCode::from(1)
        }
        Err(CliError::User(message)) => {
            eprintln!("{message}");
            ExitCode::from(1)
        }
        Err(CliError::DaemonUnreachable) => {
            eprintln!("bun-pm: daemon unreachable at {}", runtime::socket_path().display());
            ExitCode::from(2)
        }
    }
}

/// clap's own exit codes collide with our "2 = daemon unreachable"
/// contract, so parse errors are handled here instead of letting
/// `Cli::parse()` call `std::process::exit` on our behalf.
fn handle_parse_error(err: clap::Error) -> ExitCode {
    match err.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
            print!("{err}");
            ExitCode::SUCCESS
        }
        ErrorKind::InvalidSubcommand | ErrorKind::UnknownArgument => {
            let unknown = err
                .context()
                .find(|(kind, _)| *kind == clap::error::ContextKind::InvalidSubcommand)
                .map(|(_, value)| value.to_string())
                .unwrap_or_else(|| err.to_string());
            eprintln!("Unknown command: {unknown}");
            ExitCode::from(1)
        }
        _ => {
            eprintln!("Usage: {err}");
            ExitCode::from(1)
        }
    }
}

enum CliError {
    Usage(String),
    User(String),
    DaemonUnreachable,
}

impl From<IpcError> for CliError {
    fn from(_: IpcError) -> Self {
        CliError::DaemonUnreachable
    }
}

fn run(command: Commands) -> Result<Value, CliError> {
    match command {
        Commands::Start {
            target,
            name,
            instances,
            env,
        } => start(target, name, instances, env),
        Commands::Stop { identifier } => call("stop", json!({"id": identifier})),
        Commands::Restart { identifier } => call("restart", json!({"id": identifier})),
        Commands::Delete { identifier, force } => {
            call("delete", json!({"id": identifier, "force": force}))
        }
        Commands::Scale { identifier, n } => {
            call("scale", json!({"id": identifier, "instances": n}))
        }
        Commands::List => call("list", Value::Null),
        Commands::Logs {
            identifier,
            lines,
            filter,
            stream,
        } => logs(identifier, lines, filter, stream),
        Commands::Monit => call("monit", Value::Null),
        Commands::Status => call("status", Value::Null),
        Commands::Save => call("save", Value::Null),
        Commands::Load => call("load", Value::Null),
        Commands::Daemon => unreachable!("handled before run() is called"),
    }
}

fn start(
    target: String,
    name: Option<String>,
    instances: Option<InstancesArg>,
    env_overrides: Vec<bun_pm::cli::EnvVar>,
) -> Result<Value, CliError> {
    let path = PathBuf::from(&target);

    if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
        if name.is_some() || instances.is_some() || !env_overrides.is_empty() {
            return Err(CliError::Usage(
                "--name/--instances/--env are not supported when starting from an ecosystem file".into(),
            ));
        }
        let loaded = config::load(&path).map_err(|e| CliError::User(e.to_string()))?;
        let mut started = Vec::new();
        for app in loaded.apps {
            let response = call_raw("start", serde_json::to_value(&app).expect("serializable"))?;
            if response.success {
                started.push(response.data.unwrap_or(Value::Null));
            } else {
                return Err(CliError::User(response.error.unwrap_or_default()));
            }
        }
        return Ok(json!({"started": started, "errors": loaded.errors}));
    }

    let absolute_script = path
        .canonicalize()
        .map_err(|_| CliError::Usage(format!("script not found: {}", path.display())))?;
    let cwd = env::current_dir().map_err(|e| CliError::User(e.to_string()))?;
    let id = name.clone().unwrap_or_else(|| {
        absolute_script
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "app".to_string())
    });
    let mut env_map: HashMap<String, String> = HashMap::new();
    for entry in env_overrides {
        env_map.insert(entry.key, entry.value);
    }
    let instances = match instances {
        Some(InstancesArg::Fixed(n)) => n,
        Some(InstancesArg::Max) => std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1),
        None => 1,
    };

    let config = json!({
        "id": id,
        "name": name.unwrap_or(id.clone()),
        "script": absolute_script,
        "cwd": cwd,
        "env": env_map,
        "instances": instances,
    });
    call("start", config)
}

fn logs(identifier: String, lines: usize, filter: Option<String>, stream: bool) -> Result<Value, CliError> {
    if !stream {
        return call(
            "logs",
            json!({"id": identifier, "lines": lines, "filter": filter}),
        );
    }

    let socket = runtime::socket_path();
    let request = ipc::IpcRequest {
        id: format!("{}-logs", std::process::id()),
        kind: "logs".to_string(),
        payload: json!({"id": identifier, "lines": lines, "filter": filter, "stream": true}),
    };
    let stream_conn = std::os::unix::net::UnixStream::connect(&socket).map_err(|_| CliError::DaemonUnreachable)?;
    let mut writer = stream_conn.try_clone().map_err(|_| CliError::DaemonUnreachable)?;
    ipc::write_request(&mut writer, &request)?;
    let mut reader = std::io::BufReader::new(stream_conn);
    loop {
        let response = ipc::read_response(&mut reader)?;
        if !response.success {
            return Err(CliError::User(response.error.unwrap_or_default()));
        }
        let Some(data) = response.data else { continue };
        match data.get("event").and_then(Value::as_str) {
            Some("end") => return Ok(json!({"status": "stream ended"})),
            Some("line") => {
                if let Some(line) = data.get("line") {
                    println!("{}", serde_json::to_string(line).unwrap_or_default());
                }
            }
            _ => {}
        }
    }
}

fn call(kind: &str, payload: Value) -> Result<Value, CliError> {
    let response = call_raw(kind, payload)?;
    if response.success {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(CliError::User(response.error.unwrap_or_default()))
    }
}

fn call_raw(kind: &str, payload: Value) -> Result<ipc::IpcResponse, CliError> {
    Ok(ipc::request(kind, payload)?)
}

fn init_logging(args: &Cli) {
    let filter = match &args.log_level {
        Some(level) => EnvFilter::new(level.as_str()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
