//! The process supervisor: owns the process table, spawns and stops
//! instances, runs the restart state machine, and dispatches IPC commands
//! to it plus the log and metrics managers.
use std::{
    collections::HashMap,
    path::PathBuf,
    process::{Child, Command, Stdio},
    sync::{Arc, Mutex},
    thread,
    time::{Duration, SystemTime},
};

use nix::{
    sys::signal::{Signal, kill},
    unistd::Pid as NixPid,
};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    config,
    error::ProcessManagerError,
    ipc::{IpcRequest, IpcResponse},
    logs::LogManager,
    metrics::{MetricsCollector, MetricsStore},
    process::{ProcessConfig, ProcessInstance, ProcessStatus, ProcessTable},
    runtime,
};

/// Wraps supervisor-level failures distinctly from the generic
/// [`ProcessManagerError`] the inner table operations raise.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// An operation on the process table or its collaborators failed.
    #[error(transparent)]
    Process(#[from] ProcessManagerError),
}

const STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// How long to wait after a SIGTERM before escalating to SIGKILL.
fn grace_period() -> Duration {
    STOP_GRACE_PERIOD
}

/// Central coordination point for the daemon's process table. Every
/// mutation follows the same shape: lock, mutate the table and capture
/// whatever the following I/O needs, unlock, then act.
pub struct Supervisor {
    table: Mutex<ProcessTable>,
    config_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    // Keyed by (config_id, index) rather than instance id: a cluster
    // rename (`rename_singleton`) changes an instance's id but never its
    // (config_id, index) pair, so this stays valid across a scale.
    children: Mutex<HashMap<(String, u32), Child>>,
    logs: Arc<LogManager>,
    metrics: Arc<MetricsStore>,
    metrics_collector: Mutex<Option<MetricsCollector>>,
}

impl Supervisor {
    /// A fresh supervisor with empty state, ready to `start` configs.
    pub fn new() -> Arc<Self> {
        let supervisor = Arc::new(Self {
            table: Mutex::new(ProcessTable::new()),
            config_locks: Mutex::new(HashMap::new()),
            children: Mutex::new(HashMap::new()),
            logs: Arc::new(LogManager::new(runtime::log_dir()).expect("failed to initialize log manager")),
            metrics: Arc::new(MetricsStore::new()),
            metrics_collector: Mutex::new(None),
        });
        let collector = MetricsCollector::spawn(Arc::clone(&supervisor.metrics), Duration::from_secs(1));
        *supervisor.metrics_collector.lock().unwrap_or_else(|e| e.into_inner()) = Some(collector);
        supervisor
    }

    fn config_lock(&self, config_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.config_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            locks
                .entry(config_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Registers `config` and spawns its configured instance count. Fails
    /// with `AlreadyExists` if `config.id` is already in the table.
    pub fn start(self: &Arc<Self>, config: ProcessConfig) -> Result<Vec<String>, ProcessManagerError> {
        let lock = self.config_lock(&config.id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            if !table.insert_config(config.clone()) {
                return Err(ProcessManagerError::AlreadyExists(config.id.clone()));
            }
        }

        let count = config.instances;
        let mut ids = Vec::with_capacity(count as usize);
        for index in 0..count {
            let id = self.spawn_instance(&config, index, 0)?;
            ids.push(id);
        }
        Ok(ids)
    }

    fn spawn_instance(
        self: &Arc<Self>,
        config: &ProcessConfig,
        index: u32,
        restart_count: u32,
    ) -> Result<String, ProcessManagerError> {
        let instance_id = config.instance_id(index);

        let mut command = Command::new(&config.script);
        command
            .args(&config.args)
            .current_dir(&config.cwd)
            .envs(&config.env)
            .env("NODE_APP_INSTANCE", index.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(base_port) = config.env.get("PORT").and_then(|p| p.parse::<u32>().ok()) {
            command.env("PORT", (base_port + index).to_string());
        }

        let mut child = command.spawn().map_err(|source| ProcessManagerError::SpawnError {
            service: instance_id.clone(),
            source,
        })?;

        let pid = child.id();
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        self.logs.register(&instance_id)?;
        self.logs.capture_output(&instance_id, stdout, stderr);
        self.metrics
            .start_monitoring(&instance_id, pid, std::time::Instant::now());

        let mut instance = ProcessInstance::new_starting(config, index);
        instance.pid = Some(pid);
        instance.status = ProcessStatus::Running;
        instance.started_at = Some(std::time::SystemTime::now());
        instance.restart_count = restart_count;

        {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            table.put_instance(instance);
        }
        self.children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((config.id.clone(), index), child);

        self.spawn_waiter(Arc::clone(self), config.id.clone(), index);
        info!(instance = %instance_id, pid, "instance started");
        Ok(instance_id)
    }

    fn spawn_waiter(self: &Arc<Self>, supervisor: Arc<Self>, config_id: String, index: u32) {
        thread::spawn(move || {
            let child = supervisor
                .children
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&(config_id.clone(), index));
            let Some(mut child) = child else {
                return;
            };
            let status = child.wait();
            supervisor.handle_exit(&config_id, index, status.ok());
        });
    }

    /// Resolves the current instance id and config for `(config_id, index)`
    /// at use-time rather than trusting values captured when the waiter
    /// thread was spawned, since a `scale`-driven rename can change an
    /// instance's id (and a config's `instances` count) while that thread
    /// was blocked in `child.wait()`.
    fn handle_exit(
        self: &Arc<Self>,
        config_id: &str,
        index: u32,
        status: Option<std::process::ExitStatus>,
    ) {
        let lock = self.config_lock(config_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let (instance_id, config) = {
            let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            let Some(instance_id) = table.instance_id_at(config_id, index) else {
                return;
            };
            let Some(config) = table.config(config_id).cloned() else {
                return;
            };
            (instance_id, config)
        };
        let instance_id = instance_id.as_str();

        let (requested_stop, restart_count) = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            let Some(instance) = table.instance_mut(instance_id) else {
                return;
            };
            let requested_stop = instance.status == ProcessStatus::Stopping || instance.manual_stop;
            instance.pid = None;
            instance.stopped_at = Some(SystemTime::now());
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                instance.exit_code = status.and_then(|s| s.code());
                instance.exit_signal = status.and_then(|s| s.signal());
            }
            #[cfg(not(unix))]
            {
                instance.exit_code = status.and_then(|s| s.code());
            }
            (requested_stop, instance.restart_count)
        };

        self.metrics.stop_monitoring(instance_id);

        if requested_stop {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(instance) = table.instance_mut(instance_id) {
                instance.status = ProcessStatus::Stopped;
            }
            return;
        }

        let exited_cleanly = status.map(|s| s.success()).unwrap_or(false);
        if exited_cleanly {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(instance) = table.instance_mut(instance_id) {
                instance.status = ProcessStatus::Stopped;
            }
            return;
        }

        if !config.autorestart || restart_count >= config.max_restarts {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(instance) = table.instance_mut(instance_id) {
                instance.status = ProcessStatus::Errored;
            }
            warn!(instance = %instance_id, "restart policy exhausted, instance errored");
            return;
        }

        {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(instance) = table.instance_mut(instance_id) {
                instance.status = ProcessStatus::Starting;
            }
        }
        self.metrics.note_restart(instance_id, restart_count + 1);

        let supervisor = Arc::clone(self);
        let delay = Duration::from_millis(config.restart_delay_ms);
        thread::spawn(move || {
            thread::sleep(delay);
            if let Err(err) = supervisor.spawn_instance(&config, index, restart_count + 1) {
                warn!(error = %err, "failed to respawn instance");
            }
        });
    }

    /// Sends SIGTERM to every instance matching `identifier`, escalating to
    /// SIGKILL after the grace period if the child has not exited.
    pub fn stop(self: &Arc<Self>, identifier: &str) -> Result<Vec<String>, ProcessManagerError> {
        let instance_ids = {
            let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            table.resolve(identifier)
        };
        if instance_ids.is_empty() {
            return Err(ProcessManagerError::NotFound(identifier.to_string()));
        }

        for instance_id in &instance_ids {
            self.stop_instance(instance_id);
        }
        Ok(instance_ids)
    }

    fn stop_instance(self: &Arc<Self>, instance_id: &str) {
        let pid = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            let Some(instance) = table.instance_mut(instance_id) else {
                return;
            };
            instance.status = ProcessStatus::Stopping;
            instance.manual_stop = true;
            instance.pid
        };
        let Some(pid) = pid else { return };

        let _ = kill(NixPid::from_raw(pid as i32), Signal::SIGTERM);

        let supervisor = Arc::clone(self);
        let instance_id = instance_id.to_string();
        thread::spawn(move || {
            thread::sleep(grace_period());
            let still_running = supervisor
                .table
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .instance(&instance_id)
                .map(|i| i.status == ProcessStatus::Stopping)
                .unwrap_or(false);
            if still_running && let Some(pid) = pid_of(&supervisor, &instance_id) {
                let _ = kill(NixPid::from_raw(pid as i32), Signal::SIGKILL);
            }
        });
    }

    /// Stops then restarts every instance matching `identifier`, resetting
    /// each instance's restart count.
    pub fn restart(self: &Arc<Self>, identifier: &str) -> Result<Vec<String>, ProcessManagerError> {
        let instance_ids = self.stop(identifier)?;
        for instance_id in &instance_ids {
            self.wait_for_stop(instance_id);
        }

        let config_id = {
            let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            instance_ids
                .first()
                .and_then(|id| table.instance(id))
                .map(|i| i.config_id.clone())
        };
        let Some(config_id) = config_id else {
            return Err(ProcessManagerError::NotFound(identifier.to_string()));
        };
        let config = {
            let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            table.config(&config_id).cloned()
        };
        let Some(config) = config else {
            return Err(ProcessManagerError::NotFound(config_id));
        };

        let lock = self.config_lock(&config.id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        for index in 0..config.instances {
            self.spawn_instance(&config, index, 0)?;
        }
        Ok(instance_ids)
    }

    fn wait_for_stop(&self, instance_id: &str) {
        for _ in 0..100 {
            let stopped = self
                .table
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .instance(instance_id)
                .map(|i| matches!(i.status, ProcessStatus::Stopped | ProcessStatus::Errored))
                .unwrap_or(true);
            if stopped {
                return;
            }
            thread::sleep(Duration::from_millis(50));
        }
    }

    /// Stops and removes every instance/config matching `identifier`. With
    /// `force`, skips the grace period and removes immediately.
    pub fn delete(self: &Arc<Self>, identifier: &str, force: bool) -> Result<(), ProcessManagerError> {
        let instance_ids = {
            let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            table.resolve(identifier)
        };
        if instance_ids.is_empty() {
            return Err(ProcessManagerError::NotFound(identifier.to_string()));
        }

        for instance_id in &instance_ids {
            let (pid, child_key) = {
                let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
                let pid = table.instance(instance_id).and_then(|i| i.pid);
                let child_key = table
                    .instance(instance_id)
                    .map(|i| (i.config_id.clone(), i.index));
                if let Some(instance) = table.instance_mut(instance_id) {
                    instance.status = ProcessStatus::Stopping;
                }
                (pid, child_key)
            };
            if let Some(pid) = pid {
                let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
                let _ = kill(NixPid::from_raw(pid as i32), signal);
            }
            self.wait_for_stop(instance_id);
            if let Some(key) = child_key {
                self.children.lock().unwrap_or_else(|e| e.into_inner()).remove(&key);
            }
            self.logs.deregister(instance_id, true);
            self.metrics.stop_monitoring(instance_id);
        }

        let config_id = {
            let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            table.instance(&instance_ids[0]).map(|i| i.config_id.clone())
        }
        .unwrap_or_else(|| identifier.to_string());

        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        for instance_id in &instance_ids {
            table.remove_instance(instance_id);
        }
        table.remove_config(&config_id);
        Ok(())
    }

    /// Grows or shrinks a cluster to `target` instances, spawning or
    /// stopping the difference. Transitions between a single instance and
    /// a cluster rename `<id>` to/from `<id>_0` atomically.
    pub fn scale(self: &Arc<Self>, identifier: &str, target: u32) -> Result<(), ProcessManagerError> {
        let target = target.max(1);
        let config_id = {
            let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            table
                .config(identifier)
                .map(|c| c.id.clone())
                .or_else(|| {
                    table
                        .instance(identifier)
                        .map(|i| i.config_id.clone())
                })
                .ok_or_else(|| ProcessManagerError::NotFound(identifier.to_string()))?
        };

        let lock = self.config_lock(&config_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let (current, config) = {
            let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            let config = table
                .config(&config_id)
                .cloned()
                .ok_or_else(|| ProcessManagerError::NotFound(config_id.clone()))?;
            (config.instances, config)
        };

        if target == current {
            return Ok(());
        }

        if current == 1 && target > 1 {
            self.rename_singleton_instance(&config_id, true);
        }

        if target > current {
            let mut updated = config.clone();
            updated.instances = target;
            self.table
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .update_config(&config_id, |c| c.instances = target);
            for index in current..target {
                self.spawn_instance(&updated, index, 0)?;
            }
        } else {
            self.table
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .update_config(&config_id, |c| c.instances = target);
            for index in target..current {
                let instance_id = config.instance_id(index);
                self.stop_instance(&instance_id);
                self.wait_for_stop(&instance_id);
                self.table
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove_instance(&instance_id);
            }
        }

        if target == 1 && current > 1 {
            self.rename_singleton_instance(&config_id, false);
        }

        Ok(())
    }

    /// Renames the table's instance entry for `config_id` between `<id>`
    /// and `<id>_0`, and propagates the rename to the log and metrics
    /// stores in the same step so neither is left keyed to the old id.
    /// `children` needs no update: it's keyed by `(config_id, index)`,
    /// which a rename never changes.
    fn rename_singleton_instance(&self, config_id: &str, to_clustered: bool) {
        let (from, to) = if to_clustered {
            (config_id.to_string(), format!("{config_id}_0"))
        } else {
            (format!("{config_id}_0"), config_id.to_string())
        };
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .rename_singleton(config_id, to_clustered);
        self.logs.rename(&from, &to);
        self.metrics.rename(&from, &to);
    }

    /// A snapshot of every instance, for `list`/`status`.
    pub fn list(&self) -> Vec<ProcessInstance> {
        self.table.lock().unwrap_or_else(|e| e.into_inner()).snapshot()
    }

    /// The log manager backing this supervisor's instances, for callers
    /// (the daemon's streaming `logs` handler) that need direct access
    /// beyond the request/response `dispatch` surface.
    pub fn logs(&self) -> &Arc<LogManager> {
        &self.logs
    }

    /// Signals every live instance to stop as part of daemon shutdown:
    /// SIGTERM to each, a short grace period, then SIGKILL to stragglers.
    /// Unlike [`Supervisor::stop`], this does not spawn a background
    /// escalation thread, since the daemon process is about to exit.
    pub fn stop_all(self: &Arc<Self>) {
        let pids: Vec<u32> = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            let snapshot = table.snapshot();
            let mut pids = Vec::new();
            for instance in &snapshot {
                if let Some(pid) = instance.pid {
                    pids.push(pid);
                }
                if let Some(i) = table.instance_mut(&instance.id) {
                    i.status = ProcessStatus::Stopping;
                }
            }
            pids
        };

        for pid in &pids {
            let _ = kill(NixPid::from_raw(*pid as i32), Signal::SIGTERM);
        }
        thread::sleep(Duration::from_millis(500));
        for pid in &pids {
            let _ = kill(NixPid::from_raw(*pid as i32), Signal::SIGKILL);
        }
    }

    /// Enforces configured memory limits, restarting any instance whose
    /// current RSS exceeds its `memoryLimit`. Intended to be driven by the
    /// same periodic tick the metrics collector uses.
    pub fn enforce_memory_limits(self: &Arc<Self>) {
        let limits: HashMap<String, u64> = {
            let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            table
                .snapshot()
                .into_iter()
                .filter_map(|instance| {
                    table.config(&instance.config_id).and_then(|config| {
                        (config.memory_limit > 0).then(|| (instance.id.clone(), config.memory_limit))
                    })
                })
                .collect()
        };
        let violators = self.metrics.check_all_memory_limits(&limits);
        for instance_id in violators {
            warn!(instance = %instance_id, "memory limit exceeded, restarting");
            let _ = self.restart(&instance_id);
        }
    }

    /// Dispatches one framed IPC request to the appropriate operation,
    /// producing the response envelope.
    pub fn dispatch(self: &Arc<Self>, request: IpcRequest) -> IpcResponse {
        match self.dispatch_inner(&request) {
            Ok(data) => IpcResponse::ok(request.id, data),
            Err(err) => IpcResponse::err(request.id, err.to_string()),
        }
    }

    fn dispatch_inner(self: &Arc<Self>, request: &IpcRequest) -> Result<Value, ProcessManagerError> {
        match request.kind.as_str() {
            "ping" => Ok(json!({"pong": true})),
            "start" => {
                let config: ProcessConfig = serde_json::from_value(request.payload.clone())
                    .map_err(|e| ProcessManagerError::ValidationError(vec![e.to_string()]))?;
                let ids = self.start(config)?;
                Ok(json!({"instances": ids}))
            }
            "stop" => {
                let id = identifier_arg(request)?;
                let ids = self.stop(&id)?;
                Ok(json!({"instances": ids}))
            }
            "restart" => {
                let id = identifier_arg(request)?;
                let ids = self.restart(&id)?;
                Ok(json!({"instances": ids}))
            }
            "delete" => {
                let id = identifier_arg(request)?;
                let force = request.payload.get("force").and_then(Value::as_bool).unwrap_or(false);
                self.delete(&id, force)?;
                Ok(json!({"deleted": id}))
            }
            "scale" => {
                let id = identifier_arg(request)?;
                let target = request
                    .payload
                    .get("instances")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| ProcessManagerError::ValidationError(vec!["missing instances".to_string()]))?
                    as u32;
                self.scale(&id, target)?;
                Ok(json!({"scaled": id, "instances": target}))
            }
            "list" => Ok(serde_json::to_value(self.list()).expect("serializable")),
            "status" => {
                let instances = self.list();
                let metrics = self.metrics.all_latest();
                Ok(json!({"instances": instances, "metrics": metrics}))
            }
            "logs" => {
                let id = identifier_arg(request)?;
                let n = request.payload.get("lines").and_then(Value::as_u64).unwrap_or(50) as usize;
                let filter = request.payload.get("filter").and_then(Value::as_str);
                let query = self.logs.get_logs(&id, n, filter)?;
                Ok(serde_json::to_value(query).expect("serializable"))
            }
            "monit" => {
                // `bun-pm monit` (spec.md §6) takes no identifier: it is a
                // live snapshot across every instance. An `id` in the
                // payload narrows that to one instance's latest sample.
                match request.payload.get("id").and_then(Value::as_str) {
                    Some(id) => match self.metrics.latest(id) {
                        Some(sample) => Ok(serde_json::to_value(sample).expect("serializable")),
                        None => Err(ProcessManagerError::NotFound(id.to_string())),
                    },
                    None => Ok(serde_json::to_value(self.metrics.all_latest()).expect("serializable")),
                }
            }
            "save" => {
                let path = save_path(request);
                let configs: Vec<ProcessConfig> = {
                    let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
                    table.configs().cloned().collect()
                };
                config::save(&path, &configs)?;
                Ok(json!({"saved": path.display().to_string()}))
            }
            "load" => {
                let path = save_path(request);
                let loaded = config::load(&path)?;
                let mut started = Vec::new();
                for app in loaded.apps {
                    let existing_hash = {
                        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
                        table.config(&app.id).map(ProcessConfig::compute_hash)
                    };
                    match existing_hash {
                        // Already running the same definition; nothing to do.
                        Some(hash) if hash == app.compute_hash() => continue,
                        // Running but the on-disk definition drifted: replace it.
                        Some(_) => {
                            let _ = self.delete(&app.id, false);
                            if let Ok(ids) = self.start(app) {
                                started.extend(ids);
                            }
                        }
                        None => {
                            if let Ok(ids) = self.start(app) {
                                started.extend(ids);
                            }
                        }
                    }
                }
                Ok(json!({"started": started, "errors": loaded.errors}))
            }
            other => Err(ProcessManagerError::ValidationError(vec![format!(
                "unknown command: {other}"
            )])),
        }
    }
}

fn pid_of(supervisor: &Supervisor, instance_id: &str) -> Option<u32> {
    supervisor
        .table
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .instance(instance_id)
        .and_then(|i| i.pid)
}

fn identifier_arg(request: &IpcRequest) -> Result<String, ProcessManagerError> {
    request
        .payload
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProcessManagerError::ValidationError(vec!["missing id".to_string()]))
}

fn save_path(request: &IpcRequest) -> PathBuf {
    request
        .payload
        .get("path")
        .and_then(Value::as_str)
        .map(PathBuf::from)
        .unwrap_or_else(runtime::ecosystem_file)
}
