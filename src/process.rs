//! The process table: [`ProcessConfig`], [`ProcessInstance`], and the shared
//! map the supervisor mutates under a single lock.
use std::{
    collections::HashMap,
    path::PathBuf,
    time::SystemTime,
};

use serde::{Deserialize, Serialize};

/// A positive instance count, or the literal `"max"` meaning "one per CPU".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instances {
    /// A fixed, explicit instance count.
    Fixed(u32),
    /// Resolve to `std::thread::available_parallelism()` at start time.
    Max,
}

impl Instances {
    /// Resolves to a concrete, positive instance count.
    pub fn resolve(self) -> u32 {
        match self {
            Instances::Fixed(n) => n.max(1),
            Instances::Max => std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1),
        }
    }
}

/// User-provided, immutable-once-accepted description of what to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Stable identifier, unique within the daemon's process table.
    pub id: String,
    /// Human-facing label; defaults to `id` when not distinct.
    pub name: String,
    /// Absolute path to the script or executable.
    pub script: PathBuf,
    /// Ordered arguments passed to `script`.
    #[serde(default)]
    pub args: Vec<String>,
    /// Absolute working directory.
    pub cwd: PathBuf,
    /// Environment variables merged into each instance's process env.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Positive instance count; `instances > 1` implies cluster mode.
    #[serde(default = "default_instances")]
    pub instances: u32,
    /// Whether an involuntary exit triggers a respawn.
    #[serde(default = "default_autorestart")]
    pub autorestart: bool,
    /// Maximum respawns before the instance becomes `errored`.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// RSS threshold in bytes that triggers a restart; 0 = unlimited.
    #[serde(default)]
    pub memory_limit: u64,
    /// Fixed delay before a respawn after an involuntary exit.
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
}

fn default_instances() -> u32 {
    1
}
fn default_autorestart() -> bool {
    true
}
fn default_max_restarts() -> u32 {
    15
}
fn default_restart_delay_ms() -> u64 {
    1000
}

impl ProcessConfig {
    /// `true` when this config spawns more than one instance.
    pub fn is_cluster(&self) -> bool {
        self.instances > 1
    }

    /// A stable digest over everything that affects how this config is
    /// executed (script, args, cwd, env, restart policy). Two configs with
    /// the same id and the same hash are running the same program; a
    /// changed hash across a `load` means the on-disk definition drifted
    /// and the running instance should be replaced rather than left stale.
    pub fn compute_hash(&self) -> String {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(self.script.as_os_str().as_encoded_bytes());
        for arg in &self.args {
            hasher.update(arg.as_bytes());
        }
        hasher.update(self.cwd.as_os_str().as_encoded_bytes());
        let mut keys: Vec<&String> = self.env.keys().collect();
        keys.sort();
        for key in keys {
            hasher.update(key.as_bytes());
            hasher.update(self.env[key].as_bytes());
        }
        hasher.update(self.instances.to_le_bytes());
        hasher.update([self.autorestart as u8]);
        hasher.update(self.max_restarts.to_le_bytes());
        hasher.update(self.memory_limit.to_le_bytes());
        hasher.update(self.restart_delay_ms.to_le_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// The id an instance at `index` should carry: bare `id` for a
    /// single-instance config, `id_index` for a cluster.
    pub fn instance_id(&self, index: u32) -> String {
        if self.instances > 1 {
            format!("{}_{index}", self.id)
        } else {
            self.id.clone()
        }
    }
}

/// Runtime lifecycle state of a [`ProcessInstance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    /// Spawn requested, not yet confirmed alive.
    Starting,
    /// Confirmed alive.
    Running,
    /// Stop requested; waiting for graceful exit or the SIGKILL deadline.
    Stopping,
    /// Terminal: stopped deliberately (manual stop, or a clean autorestart-off exit).
    Stopped,
    /// Terminal: restart policy exhausted or spawn failed.
    Errored,
}

/// One live or previously-live child process derived from a
/// [`ProcessConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInstance {
    /// `config.id` for a singleton, `<config.id>_<index>` for a cluster.
    pub id: String,
    /// Owning config id.
    pub config_id: String,
    /// Cluster index, 0 for a singleton.
    pub index: u32,
    /// OS pid while `status == Running`/`Starting`/`Stopping`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Current lifecycle state.
    pub status: ProcessStatus,
    /// When the current/last spawn attempt began.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<SystemTime>,
    /// When the instance last moved out of `Running`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<SystemTime>,
    /// Consecutive autorestart count; reset on manual start/restart.
    pub restart_count: u32,
    /// Exit code from the last termination, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Terminating signal from the last termination, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_signal: Option<i32>,
    /// Set once a user-initiated `stop` has been applied, so an involuntary
    /// exit arriving just after isn't mistaken for policy-driven.
    #[serde(default)]
    pub manual_stop: bool,
}

impl ProcessInstance {
    /// A fresh instance in the `Starting` state for `config` at `index`.
    pub fn new_starting(config: &ProcessConfig, index: u32) -> Self {
        Self {
            id: config.instance_id(index),
            config_id: config.id.clone(),
            index,
            pid: None,
            status: ProcessStatus::Starting,
            started_at: None,
            stopped_at: None,
            restart_count: 0,
            exit_code: None,
            exit_signal: None,
            manual_stop: false,
        }
    }

    /// Milliseconds since `started_at`, or 0 if never started.
    pub fn uptime_ms(&self) -> u64 {
        self.started_at
            .and_then(|t| t.elapsed().ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Ways an identifier passed to a command can resolve to instances:
/// a config id, an instance id, or a config name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identifier<'a> {
    /// Matches `ProcessInstance::id` exactly.
    Instance(&'a str),
    /// Matches `ProcessConfig::id` — all instances of that config.
    Config(&'a str),
    /// Matches `ProcessConfig::name`.
    Name(&'a str),
}

/// Owns every [`ProcessConfig`] and [`ProcessInstance`] the daemon knows
/// about. All mutation happens under the supervisor's single mutex: lock,
/// mutate the table and capture whatever is needed, unlock, then do I/O.
#[derive(Default)]
pub struct ProcessTable {
    configs: HashMap<String, ProcessConfig>,
    instances: HashMap<String, ProcessInstance>,
}

impl ProcessTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `config`, returning `false` if a config with the same id
    /// is already present.
    pub fn insert_config(&mut self, config: ProcessConfig) -> bool {
        if self.configs.contains_key(&config.id) {
            return false;
        }
        self.configs.insert(config.id.clone(), config);
        true
    }

    /// Looks up a config by id.
    pub fn config(&self, config_id: &str) -> Option<&ProcessConfig> {
        self.configs.get(config_id)
    }

    /// Replaces a config in place (used by `scale` to update `instances`).
    pub fn update_config(&mut self, config_id: &str, f: impl FnOnce(&mut ProcessConfig)) {
        if let Some(config) = self.configs.get_mut(config_id) {
            f(config);
        }
    }

    /// Removes a config and returns it, if present.
    pub fn remove_config(&mut self, config_id: &str) -> Option<ProcessConfig> {
        self.configs.remove(config_id)
    }

    /// Inserts or replaces an instance record.
    pub fn put_instance(&mut self, instance: ProcessInstance) {
        self.instances.insert(instance.id.clone(), instance);
    }

    /// Looks up an instance by its own id.
    pub fn instance(&self, instance_id: &str) -> Option<&ProcessInstance> {
        self.instances.get(instance_id)
    }

    /// Mutable lookup of an instance by its own id.
    pub fn instance_mut(&mut self, instance_id: &str) -> Option<&mut ProcessInstance> {
        self.instances.get_mut(instance_id)
    }

    /// Removes an instance record and returns it, if present.
    pub fn remove_instance(&mut self, instance_id: &str) -> Option<ProcessInstance> {
        self.instances.remove(instance_id)
    }

    /// All instances belonging to `config_id`, ordered by cluster index.
    pub fn instances_of(&self, config_id: &str) -> Vec<&ProcessInstance> {
        let mut out: Vec<&ProcessInstance> = self
            .instances
            .values()
            .filter(|i| i.config_id == config_id)
            .collect();
        out.sort_by_key(|i| i.index);
        out
    }

    /// A point-in-time snapshot of every instance, for `list()`.
    pub fn snapshot(&self) -> Vec<ProcessInstance> {
        let mut out: Vec<ProcessInstance> = self.instances.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Every registered config.
    pub fn configs(&self) -> impl Iterator<Item = &ProcessConfig> {
        self.configs.values()
    }

    /// Resolves `identifier` (an instance id, config id, or config name) to
    /// the set of matching instance ids.
    pub fn resolve(&self, identifier: &str) -> Vec<String> {
        if self.instances.contains_key(identifier) {
            return vec![identifier.to_string()];
        }

        if self.configs.contains_key(identifier) {
            return self.instances_of(identifier).iter().map(|i| i.id.clone()).collect();
        }

        if let Some(config) = self.configs.values().find(|c| c.name == identifier) {
            return self.instances_of(&config.id).iter().map(|i| i.id.clone()).collect();
        }

        Vec::new()
    }

    /// Finds the current id of the instance at `(config_id, index)`. Needed
    /// because a cluster rename (`rename_singleton`) can change an
    /// instance's id out from under a waiter thread that only knows the
    /// config/index it was spawned for.
    pub fn instance_id_at(&self, config_id: &str, index: u32) -> Option<String> {
        self.instances
            .values()
            .find(|i| i.config_id == config_id && i.index == index)
            .map(|i| i.id.clone())
    }

    /// Atomically renames instances between `<id>` and `<id>_0` when a
    /// cluster transitions to/from a single instance. Caller already holds
    /// the supervisor's config-group lock, so this is the whole atomic
    /// section.
    pub fn rename_singleton(&mut self, config_id: &str, to_clustered: bool) {
        let (from, to) = if to_clustered {
            (config_id.to_string(), format!("{config_id}_0"))
        } else {
            (format!("{config_id}_0"), config_id.to_string())
        };

        if let Some(mut instance) = self.instances.remove(&from) {
            instance.id = to.clone();
            self.instances.insert(to, instance);
        }
    }
}
