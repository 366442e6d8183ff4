//! Ecosystem file parsing, normalization, and validation.
//!
//! Accepts a JSON file shaped `{"apps": [...]}`. Each app entry recognizes
//! both the native, camelCase shape and a widely used compatible shape
//! (snake_case keys like `max_memory_restart`); both resolve to the same
//! [`ProcessConfig`].
use std::{collections::HashMap, env, fs, path::Path};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    process::ProcessConfig,
};

/// Result of loading an ecosystem file: every config that parsed cleanly,
/// plus every validation issue encountered. The loader never throws on a
/// per-app problem — it collects so the caller can report all of them.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Successfully parsed and validated configs, normalized to absolute
    /// paths.
    pub apps: Vec<ProcessConfig>,
    /// Human-readable validation issues, one per problem found.
    pub errors: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize)]
struct EcosystemFile {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    created: Option<String>,
    apps: Vec<RawApp>,
}

/// On-disk shape of one app entry, accepting both the native and
/// PM2-compatible keys via serde aliases.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct RawApp {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    script: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    instances: Option<InstancesField>,
    #[serde(default, alias = "exec_mode")]
    exec_mode: Option<String>,
    #[serde(default)]
    autorestart: Option<bool>,
    #[serde(default, alias = "max_restarts")]
    max_restarts: Option<u32>,
    #[serde(default, alias = "restart_delay")]
    restart_delay: Option<RestartDelayField>,
    #[serde(default, alias = "max_memory_restart")]
    max_memory_restart: Option<String>,
    #[serde(default)]
    env_file: Option<String>,
    /// Catches any `env_<suffix>` key (`env_production`, `env_staging`,
    /// ...) so `normalize` can pick the one matching the active `NODE_ENV`
    /// without a fixed field per suffix.
    #[serde(flatten)]
    extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
enum InstancesField {
    Count(u32),
    Max(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
enum RestartDelayField {
    Millis(u64),
    Suffixed(String),
}

/// Loads and validates an ecosystem file at `path`. Invalid JSON or a
/// missing file each return one synthetic error and an empty app list,
/// rather than a hard error, per the collected-errors contract.
pub fn load(path: &Path) -> Result<LoadedConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()));
    }
    let raw = fs::read_to_string(path)?;
    let base_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| Path::new(".").to_path_buf());

    let file: EcosystemFile = match serde_json::from_str(&raw) {
        Ok(file) => file,
        Err(err) => {
            return Ok(LoadedConfig {
                apps: Vec::new(),
                errors: vec![format!("Invalid JSON: {err}")],
            });
        }
    };

    let node_env = env::var("NODE_ENV").ok();

    let mut apps = Vec::new();
    let mut errors = Vec::new();
    let mut seen_ids = std::collections::HashSet::new();

    for (index, raw_app) in file.apps.into_iter().enumerate() {
        match normalize(raw_app, &base_dir, node_env.as_deref()) {
            Ok(config) => {
                if !seen_ids.insert(config.id.clone()) {
                    errors.push(format!("duplicate id '{}' at app index {index}", config.id));
                    continue;
                }
                apps.push(config);
            }
            Err(mut issues) => {
                for issue in issues.drain(..) {
                    errors.push(format!("app index {index}: {issue}"));
                }
            }
        }
    }

    Ok(LoadedConfig { apps, errors })
}

fn normalize(
    raw: RawApp,
    base_dir: &Path,
    node_env: Option<&str>,
) -> Result<ProcessConfig, Vec<String>> {
    let mut issues = Vec::new();

    let script = match raw.script.as_deref() {
        Some(s) if !s.trim().is_empty() => s,
        _ => {
            issues.push("missing script".to_string());
            return Err(issues);
        }
    };
    let script_path = resolve_path(base_dir, script);
    if !script_path.exists() {
        issues.push(format!("script file does not exist: {}", script_path.display()));
    }

    let name = raw
        .name
        .clone()
        .or_else(|| raw.id.clone())
        .unwrap_or_else(|| derive_name_from_script(script));
    let id = raw.id.clone().unwrap_or_else(|| slugify(&name));
    if id.trim().is_empty() {
        issues.push("could not derive a non-empty id".to_string());
    }

    let cwd = match &raw.cwd {
        Some(c) => resolve_path(base_dir, c),
        None => base_dir.to_path_buf(),
    };

    let mut env = HashMap::new();
    if let Some(env_file) = &raw.env_file {
        let env_file_path = resolve_path(base_dir, env_file);
        match load_dotenv_file(&env_file_path) {
            Ok(vars) => env.extend(vars),
            Err(issue) => issues.push(issue),
        }
    }
    env.extend(raw.env.clone());
    if let Some(node_env) = node_env {
        let key = format!("env_{node_env}");
        if let Some(value) = raw.extra.get(&key) {
            match serde_json::from_value::<HashMap<String, String>>(value.clone()) {
                Ok(overlay) => env.extend(overlay),
                Err(_) => issues.push(format!("{key} must be an object of string values")),
            }
        }
    }

    let instances = match resolve_instances(raw.instances.as_ref(), raw.exec_mode.as_deref()) {
        Ok(n) => n,
        Err(issue) => {
            issues.push(issue);
            1
        }
    };

    let max_restarts = raw.max_restarts.unwrap_or(15);

    let restart_delay_ms = match &raw.restart_delay {
        None => 1000,
        Some(RestartDelayField::Millis(ms)) => *ms,
        Some(RestartDelayField::Suffixed(s)) => match parse_duration_ms(s) {
            Ok(ms) => ms,
            Err(issue) => {
                issues.push(issue);
                1000
            }
        },
    };

    let memory_limit = match &raw.max_memory_restart {
        None => 0,
        Some(s) => match parse_memory_limit(s) {
            Ok(bytes) => bytes,
            Err(issue) => {
                issues.push(issue);
                0
            }
        },
    };

    if !issues.is_empty() {
        return Err(issues);
    }

    Ok(ProcessConfig {
        id,
        name,
        script: script_path,
        args: raw.args,
        cwd,
        env,
        instances,
        autorestart: raw.autorestart.unwrap_or(true),
        max_restarts,
        memory_limit,
        restart_delay_ms,
    })
}

fn resolve_instances(field: Option<&InstancesField>, exec_mode: Option<&str>) -> Result<u32, String> {
    match field {
        None => {
            if exec_mode == Some("cluster") {
                Ok(cpu_count())
            } else {
                Ok(1)
            }
        }
        Some(InstancesField::Count(n)) => {
            if *n == 0 {
                Err("instances must be positive".to_string())
            } else {
                Ok(*n)
            }
        }
        Some(InstancesField::Max(s)) => {
            if s == "max" {
                Ok(cpu_count())
            } else {
                Err(format!("instances: unrecognized value '{s}'"))
            }
        }
    }
}

fn cpu_count() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

fn resolve_path(base_dir: &Path, raw: &str) -> std::path::PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

fn derive_name_from_script(script: &str) -> String {
    Path::new(script)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "app".to_string())
}

fn slugify(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect()
}

/// Parses a dotenv-style file (`KEY=value` lines, optional surrounding
/// quotes, `#` comments) into a key/value map scoped to one app's env —
/// unlike the global process-env mutation PM2-compatible tools perform,
/// these values only ever merge into this app's child environment.
fn load_dotenv_file(path: &Path) -> Result<HashMap<String, String>, String> {
    let content = fs::read_to_string(path)
        .map_err(|e| format!("env_file {}: {e}", path.display()))?;
    let mut vars = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let mut value = value.trim();
        if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
            value = &value[1..value.len() - 1];
        }
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

/// Parses a `max_memory_restart`-style string (`"150M"`, `"1G"`, `"512K"`,
/// or a bare byte count) into a byte count.
fn parse_memory_limit(raw: &str) -> Result<u64, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("max_memory_restart must not be empty".to_string());
    }
    let (digits, multiplier) = match trimmed.chars().last() {
        Some(c) if c.eq_ignore_ascii_case(&'k') => (&trimmed[..trimmed.len() - 1], 1024u64),
        Some(c) if c.eq_ignore_ascii_case(&'m') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some(c) if c.eq_ignore_ascii_case(&'g') => {
            (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024)
        }
        _ => (trimmed, 1u64),
    };
    digits
        .trim()
        .parse::<u64>()
        .map(|n| n * multiplier)
        .map_err(|_| format!("invalid max_memory_restart: '{raw}'"))
}

/// Parses a restart-delay string (`"500ms"`, `"2s"`, or a bare millisecond
/// count) into milliseconds.
fn parse_duration_ms(raw: &str) -> Result<u64, String> {
    let trimmed = raw.trim();
    if let Some(prefix) = trimmed.strip_suffix("ms") {
        return prefix.parse().map_err(|_| format!("invalid restart_delay: '{raw}'"));
    }
    if let Some(prefix) = trimmed.strip_suffix('s') {
        return prefix
            .parse::<u64>()
            .map(|s| s * 1000)
            .map_err(|_| format!("invalid restart_delay: '{raw}'"));
    }
    trimmed.parse().map_err(|_| format!("invalid restart_delay: '{raw}'"))
}

/// Writes `apps` to `path` as an ecosystem file with a fresh `version` and
/// `created` timestamp. A later [`load`] of this file yields semantically
/// equal configs.
pub fn save(path: &Path, apps: &[ProcessConfig]) -> Result<(), ConfigError> {
    let file = EcosystemFile {
        version: Some("1.0.0".to_string()),
        created: Some(Utc::now().to_rfc3339()),
        apps: apps.iter().map(to_raw_app).collect(),
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(&file).map_err(ConfigError::InvalidJson)?;
    fs::write(path, json)?;
    Ok(())
}

fn to_raw_app(config: &ProcessConfig) -> RawApp {
    RawApp {
        name: Some(config.name.clone()),
        id: Some(config.id.clone()),
        script: Some(config.script.display().to_string()),
        args: config.args.clone(),
        cwd: Some(config.cwd.display().to_string()),
        env: config.env.clone(),
        instances: Some(InstancesField::Count(config.instances)),
        exec_mode: if config.instances > 1 {
            Some("cluster".to_string())
        } else {
            None
        },
        autorestart: Some(config.autorestart),
        max_restarts: Some(config.max_restarts),
        restart_delay: Some(RestartDelayField::Millis(config.restart_delay_ms)),
        max_memory_restart: if config.memory_limit > 0 {
            Some(config.memory_limit.to_string())
        } else {
            None
        },
        env_file: None,
        extra: HashMap::new(),
    }
}

/// Writes a minimal sample ecosystem file, for `bun-pm init`-style flows.
pub fn write_sample(path: &Path) -> Result<(), ConfigError> {
    let sample = ProcessConfig {
        id: "app".to_string(),
        name: "app".to_string(),
        script: std::path::PathBuf::from("./index.js"),
        args: Vec::new(),
        cwd: std::path::PathBuf::from("."),
        env: HashMap::new(),
        instances: 1,
        autorestart: true,
        max_restarts: 15,
        memory_limit: 0,
        restart_delay_ms: 1000,
    };
    save(path, std::slice::from_ref(&sample))
}
