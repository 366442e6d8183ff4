//! Per-instance CPU/memory sampling and history.
//!
//! Built on a `sysinfo`-driven ticker, narrowed to a small fixed sample
//! shape and a fixed-capacity history ring rather than a time+byte-budget
//! retention policy.
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

const DEFAULT_HISTORY_CAPACITY: usize = 120;

/// One point-in-time reading for a running instance.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MetricSample {
    /// CPU usage, normalized per-core (a fully busy 2-thread process on 2
    /// cores reports ~200%).
    pub cpu_percent: f32,
    /// Resident set size in bytes.
    pub memory_bytes: u64,
    /// Milliseconds since the instance's current `started_at`.
    pub uptime_ms: u64,
    /// Restart count at the time of this sample.
    pub restarts: u32,
}

struct UnitMetrics {
    pid: u32,
    started_at: Instant,
    restarts: u32,
    history: VecDeque<MetricSample>,
}

/// Registers instances, ticks a `sysinfo` sampler against them, and answers
/// the snapshot/history/limit-check queries the supervisor needs.
pub struct MetricsStore {
    capacity: usize,
    units: RwLock<HashMap<String, UnitMetrics>>,
}

impl MetricsStore {
    /// A store with the default history capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    /// A store retaining `capacity` samples of history per instance.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            units: RwLock::new(HashMap::new()),
        }
    }

    /// `startMonitoring(instanceId, pid, startedAt)`. Re-registering an
    /// already-tracked instance (e.g. after a restart) resets its pid and
    /// start time but keeps the accumulated restart count in sync via
    /// [`MetricsStore::note_restart`] rather than here.
    pub fn start_monitoring(&self, instance_id: &str, pid: u32, started_at: Instant) {
        let mut units = self.units.write().unwrap_or_else(|e| e.into_inner());
        let restarts = units.get(instance_id).map(|u| u.restarts).unwrap_or(0);
        units.insert(
            instance_id.to_string(),
            UnitMetrics {
                pid,
                started_at,
                restarts,
                history: VecDeque::with_capacity(self.capacity),
            },
        );
    }

    /// `stopMonitoring(id)`; idempotent.
    pub fn stop_monitoring(&self, instance_id: &str) {
        self.units
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(instance_id);
    }

    /// Records that `instance_id` restarted, so the next sample reports the
    /// updated count. Called alongside the supervisor's own restart
    /// bookkeeping.
    pub fn note_restart(&self, instance_id: &str, restart_count: u32) {
        if let Some(unit) = self
            .units
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(instance_id)
        {
            unit.restarts = restart_count;
        }
    }

    /// Samples every registered instance once, refreshing `system` in one
    /// pass. Call this from one periodic ticker thread.
    pub fn tick(&self, system: &mut System) {
        let pids: Vec<Pid> = {
            let units = self.units.read().unwrap_or_else(|e| e.into_inner());
            units.values().map(|u| Pid::from_u32(u.pid)).collect()
        };
        if pids.is_empty() {
            return;
        }
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&pids),
            true,
            ProcessRefreshKind::everything(),
        );

        let mut units = self.units.write().unwrap_or_else(|e| e.into_inner());
        for unit in units.values_mut() {
            let Some(process) = system.process(Pid::from_u32(unit.pid)) else {
                continue;
            };
            let sample = MetricSample {
                cpu_percent: process.cpu_usage(),
                memory_bytes: process.memory(),
                uptime_ms: unit.started_at.elapsed().as_millis() as u64,
                restarts: unit.restarts,
            };
            if unit.history.len() == unit.history.capacity().max(1).min(self.capacity)
                || unit.history.len() >= self.capacity
            {
                unit.history.pop_front();
            }
            unit.history.push_back(sample);
        }
    }

    /// `getMetrics(id)`: the latest sample, if the instance has one yet.
    pub fn latest(&self, instance_id: &str) -> Option<MetricSample> {
        self.units
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(instance_id)
            .and_then(|u| u.history.back().copied())
    }

    /// `getAllMetrics()`.
    pub fn all_latest(&self) -> HashMap<String, MetricSample> {
        self.units
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(|(id, u)| u.history.back().map(|s| (id.clone(), *s)))
            .collect()
    }

    /// `getMetricsHistory(id, n)`: the newest `n` samples, oldest first.
    pub fn history(&self, instance_id: &str, n: usize) -> Vec<MetricSample> {
        let units = self.units.read().unwrap_or_else(|e| e.into_inner());
        let Some(unit) = units.get(instance_id) else {
            return Vec::new();
        };
        let len = unit.history.len();
        let skip = len.saturating_sub(n);
        unit.history.iter().skip(skip).copied().collect()
    }

    /// `checkMemoryLimit(id, limit)`: true iff `limit > 0` and the current
    /// sample's RSS strictly exceeds it. `limit <= 0` or no sample yet never
    /// violates; exact equality never violates.
    pub fn check_memory_limit(&self, instance_id: &str, limit: u64) -> bool {
        if limit == 0 {
            return false;
        }
        self.latest(instance_id)
            .map(|s| s.memory_bytes > limit)
            .unwrap_or(false)
    }

    /// `checkAllMemoryLimits(limits)`: ids whose current memory exceeds
    /// their configured limit, in one pass.
    pub fn check_all_memory_limits(&self, limits: &HashMap<String, u64>) -> Vec<String> {
        limits
            .iter()
            .filter(|(id, limit)| self.check_memory_limit(id, **limit))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Re-keys a tracked instance after a scale-driven id change (e.g.
    /// `d` -> `d_0`), preserving its history and restart count. No-op if
    /// `from` isn't registered.
    pub fn rename(&self, from: &str, to: &str) {
        let mut units = self.units.write().unwrap_or_else(|e| e.into_inner());
        if let Some(unit) = units.remove(from) {
            units.insert(to.to_string(), unit);
        }
    }

    /// `cleanup()`: drops all tracked state.
    pub fn cleanup(&self) {
        self.units.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Background ticker driving [`MetricsStore::tick`] at a fixed interval,
/// mirroring `metrics::MetricsCollector`'s responsive-shutdown sleep loop.
pub struct MetricsCollector {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl MetricsCollector {
    /// Spawns the ticker thread.
    pub fn spawn(store: Arc<MetricsStore>, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();

        let handle = thread::Builder::new()
            .name("metrics-ticker".into())
            .spawn(move || {
                let mut system = System::new();
                while !stop_clone.load(Ordering::Relaxed) {
                    store.tick(&mut system);
                    sleep_responsively(interval, &stop_clone);
                }
            })
            .expect("failed to spawn metrics ticker thread");

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Signals the ticker to stop and joins it.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MetricsCollector {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sleep_responsively(total: Duration, stop: &AtomicBool) {
    const STEP: Duration = Duration::from_millis(100);
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        let chunk = remaining.min(STEP);
        thread::sleep(chunk);
        remaining -= chunk;
    }
}
