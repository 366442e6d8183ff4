//! Log capture, retrieval, and streaming for each process instance.
//!
//! Each instance gets a fixed-capacity in-memory ring (stdout and stderr
//! interleaved in emission order) plus two append-only files
//! on disk. Disk writes go through a bounded queue drained by a dedicated
//! writer thread so a slow disk never back-pressures the child.
use std::{
    collections::{HashMap, VecDeque},
    fs::{self, OpenOptions},
    io::{BufRead, BufReader, Read, Write},
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
        mpsc,
    },
    thread,
};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::LogsError;

const DEFAULT_RING_CAPACITY: usize = 1000;
const DEFAULT_ROTATE_THRESHOLD_BYTES: u64 = 10 * 1024 * 1024;
const WRITE_QUEUE_CAPACITY: usize = 4096;

/// Which child stream a [`LogLine`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// One decoded line captured from a child's stdout or stderr.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    /// When the line was decoded by the reader thread.
    pub timestamp: DateTime<Utc>,
    /// Which stream it came from.
    pub stream: StreamKind,
    /// The decoded line, without its trailing newline.
    pub content: String,
}

/// A frame delivered to a [`LogManager::stream`] subscriber.
#[derive(Debug, Clone)]
pub enum LogEvent {
    /// A captured (or backlog) line.
    Line(LogLine),
    /// The instance was deleted; no further lines will arrive.
    End,
}

/// Result shape for [`LogManager::get_logs`].
#[derive(Debug, Clone, Serialize)]
pub struct LogQuery {
    /// The last `n` lines, optionally filtered.
    pub lines: Vec<LogLine>,
    /// Total lines ever captured for this instance.
    pub total_lines: u64,
    /// Lines that matched the filter, if one was given; equals `lines.len()`.
    pub filtered_lines: usize,
}

struct LogBook {
    lines: VecDeque<LogLine>,
    capacity: usize,
    total_captured: u64,
    subscribers: Vec<mpsc::Sender<LogEvent>>,
}

impl LogBook {
    fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
            total_captured: 0,
            subscribers: Vec::new(),
        }
    }

    fn push(&mut self, line: LogLine) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.clone());
        self.total_captured += 1;
        self.subscribers
            .retain(|s| s.send(LogEvent::Line(line.clone())).is_ok());
    }

    fn snapshot(&self) -> Vec<LogLine> {
        self.lines.iter().cloned().collect()
    }

    fn clear(&mut self) {
        self.lines.clear();
        self.total_captured = 0;
    }

    fn close(&mut self) {
        for sub in self.subscribers.drain(..) {
            let _ = sub.send(LogEvent::End);
        }
    }
}

struct WriteJob {
    path: PathBuf,
    line: String,
}

struct InstanceLog {
    book: Mutex<LogBook>,
    out_path: PathBuf,
    err_path: PathBuf,
    // `None` once `deregister` has taken it, which is what disconnects the
    // writer thread's receiver and lets its `for job in write_rx` loop end.
    write_tx: Mutex<Option<mpsc::SyncSender<WriteJob>>>,
    dropped_writes: AtomicU64,
    writer_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

/// Owns per-instance log state: the in-memory ring, the on-disk files, and
/// the background writer thread.
pub struct LogManager {
    log_dir: PathBuf,
    ring_capacity: usize,
    rotate_threshold_bytes: u64,
    instances: Mutex<HashMap<String, Arc<InstanceLog>>>,
}

impl LogManager {
    /// Creates a manager writing files under `log_dir`, creating it if
    /// necessary.
    pub fn new(log_dir: PathBuf) -> Result<Self, LogsError> {
        fs::create_dir_all(&log_dir)?;
        Ok(Self {
            log_dir,
            ring_capacity: DEFAULT_RING_CAPACITY,
            rotate_threshold_bytes: DEFAULT_ROTATE_THRESHOLD_BYTES,
            instances: Mutex::new(HashMap::new()),
        })
    }

    /// Registers `instance_id`, creating its ring and writer thread if this
    /// is the first time it's been seen. Idempotent.
    pub fn register(&self, instance_id: &str) -> Result<(), LogsError> {
        let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        if instances.contains_key(instance_id) {
            return Ok(());
        }

        let out_path = self.log_dir.join(format!("{instance_id}.out.log"));
        let err_path = self.log_dir.join(format!("{instance_id}.err.log"));
        let (write_tx, write_rx) = mpsc::sync_channel::<WriteJob>(WRITE_QUEUE_CAPACITY);

        let handle = thread::Builder::new()
            .name(format!("log-writer-{instance_id}"))
            .spawn(move || {
                for job in write_rx {
                    if let Err(err) = append_line(&job.path, &job.line) {
                        warn!("failed to append log line to {:?}: {err}", job.path);
                    }
                }
            })
            .map_err(LogsError::Io)?;

        let entry = Arc::new(InstanceLog {
            book: Mutex::new(LogBook::new(self.ring_capacity)),
            out_path,
            err_path,
            write_tx: Mutex::new(Some(write_tx)),
            dropped_writes: AtomicU64::new(0),
            writer_handle: Mutex::new(Some(handle)),
        });
        instances.insert(instance_id.to_string(), entry);
        Ok(())
    }

    /// Attaches line-oriented readers for a freshly spawned child. Each
    /// decoded line is pushed to the ring, broadcast to stream subscribers,
    /// and enqueued for disk append — never blocking the reader thread
    /// beyond the bounded queue.
    pub fn capture_output<O, E>(&self, instance_id: &str, stdout: O, stderr: E)
    where
        O: Read + Send + 'static,
        E: Read + Send + 'static,
    {
        if let Some(entry) = self.get(instance_id) {
            spawn_reader(entry.clone(), stdout, StreamKind::Stdout);
            spawn_reader(entry, stderr, StreamKind::Stderr);
        }
    }

    /// Returns the last `n` lines, optionally restricted to lines matching
    /// `filter` (substring, or regex if `filter` compiles as one).
    pub fn get_logs(
        &self,
        instance_id: &str,
        n: usize,
        filter: Option<&str>,
    ) -> Result<LogQuery, LogsError> {
        let entry = self
            .get(instance_id)
            .ok_or_else(|| LogsError::NotFound(instance_id.to_string()))?;
        let book = entry.book.lock().unwrap_or_else(|e| e.into_inner());
        let total_lines = book.total_captured;
        let all = book.snapshot();
        drop(book);

        let matches: Box<dyn Fn(&LogLine) -> bool> = match filter {
            None => Box::new(|_| true),
            Some(pattern) => match Regex::new(pattern) {
                Ok(re) => Box::new(move |line: &LogLine| re.is_match(&line.content)),
                Err(_) => {
                    let needle = pattern.to_string();
                    Box::new(move |line: &LogLine| line.content.contains(&needle))
                }
            },
        };

        let filtered: Vec<LogLine> = all.into_iter().filter(|l| matches(l)).collect();
        let filtered_lines = filtered.len();
        let tail = if filtered.len() > n {
            filtered[filtered.len() - n..].to_vec()
        } else {
            filtered
        };

        Ok(LogQuery {
            lines: tail,
            total_lines,
            filtered_lines,
        })
    }

    /// Returns a channel that first yields the current ring contents, then
    /// yields newly captured lines until the instance is deleted or the
    /// receiver is dropped. Snapshot and subscription happen under one lock so no line
    /// is missed or duplicated across the handoff.
    pub fn stream(&self, instance_id: &str) -> Result<mpsc::Receiver<LogEvent>, LogsError> {
        let entry = self
            .get(instance_id)
            .ok_or_else(|| LogsError::NotFound(instance_id.to_string()))?;
        let (tx, rx) = mpsc::channel();
        let mut book = entry.book.lock().unwrap_or_else(|e| e.into_inner());
        for line in book.snapshot() {
            let _ = tx.send(LogEvent::Line(line));
        }
        book.subscribers.push(tx);
        Ok(rx)
    }

    /// Rotates an instance's log files once they exceed the configured
    /// size threshold. No-op below the threshold.
    pub fn rotate(&self, instance_id: &str) -> Result<(), LogsError> {
        let entry = self
            .get(instance_id)
            .ok_or_else(|| LogsError::NotFound(instance_id.to_string()))?;
        rotate_if_needed(&entry.out_path, self.rotate_threshold_bytes)?;
        rotate_if_needed(&entry.err_path, self.rotate_threshold_bytes)?;
        Ok(())
    }

    /// Clears the in-memory ring and truncates both on-disk files.
    pub fn clear(&self, instance_id: &str) -> Result<(), LogsError> {
        let entry = self
            .get(instance_id)
            .ok_or_else(|| LogsError::NotFound(instance_id.to_string()))?;
        entry.book.lock().unwrap_or_else(|e| e.into_inner()).clear();
        for path in [&entry.out_path, &entry.err_path] {
            OpenOptions::new().write(true).truncate(true).create(true).open(path)?;
        }
        Ok(())
    }

    /// Ends every active stream subscription and drops the instance's
    /// state, optionally removing its on-disk files (`delete(..., force)`).
    pub fn deregister(&self, instance_id: &str, remove_files: bool) {
        let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = instances.remove(instance_id) {
            entry.book.lock().unwrap_or_else(|e| e.into_inner()).close();
            // Taking the only sender disconnects write_rx so the writer
            // thread's `for job in write_rx` loop ends and join() returns.
            entry.write_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(handle) = entry
                .writer_handle
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
            {
                let _ = handle.join();
            }
            if remove_files {
                let _ = fs::remove_file(&entry.out_path);
                let _ = fs::remove_file(&entry.err_path);
            }
        }
    }

    /// Re-keys an instance's log state after a scale-driven id change
    /// (e.g. `d` -> `d_0`), without disturbing its ring, files, or writer
    /// thread. No-op if `from` isn't registered.
    pub fn rename(&self, from: &str, to: &str) {
        let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = instances.remove(from) {
            instances.insert(to.to_string(), entry);
        }
    }

    /// Number of disk-write jobs dropped for `instance_id` due to a full
    /// queue.
    pub fn dropped_writes(&self, instance_id: &str) -> u64 {
        self.get(instance_id)
            .map(|e| e.dropped_writes.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn get(&self, instance_id: &str) -> Option<Arc<InstanceLog>> {
        self.instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(instance_id)
            .cloned()
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    entry: Arc<InstanceLog>,
    reader: R,
    stream: StreamKind,
) {
    thread::spawn(move || {
        let buffered = BufReader::new(reader);
        let path = match stream {
            StreamKind::Stdout => entry.out_path.clone(),
            StreamKind::Stderr => entry.err_path.clone(),
        };

        for line in buffered.lines() {
            let Ok(content) = line else { break };
            let log_line = LogLine {
                timestamp: Utc::now(),
                stream,
                content: content.clone(),
            };

            entry
                .book
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(log_line);

            let job = WriteJob {
                path: path.clone(),
                line: content,
            };
            let dropped = match entry.write_tx.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
                Some(tx) => tx.try_send(job).is_err(),
                None => true,
            };
            if dropped {
                entry.dropped_writes.fetch_add(1, Ordering::Relaxed);
            }
        }
    });
}

fn append_line(path: &PathBuf, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}

fn rotate_if_needed(path: &PathBuf, threshold: u64) -> Result<(), LogsError> {
    let size = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(_) => return Ok(()),
    };
    if size <= threshold {
        return Ok(());
    }
    let rotated = path.with_extension(match path.extension() {
        Some(ext) => format!("{}.1", ext.to_string_lossy()),
        None => "1".to_string(),
    });
    fs::rename(path, rotated)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::tempdir;

    #[test]
    fn ring_bound_keeps_only_newest_n() {
        let dir = tempdir().unwrap();
        let manager = LogManager::new(dir.path().to_path_buf()).unwrap();
        manager.register("a").unwrap();
        let entry = manager.get("a").unwrap();
        {
            let mut book = entry.book.lock().unwrap();
            book.capacity = 3;
            for i in 0..10u32 {
                book.push(LogLine {
                    timestamp: Utc::now(),
                    stream: StreamKind::Stdout,
                    content: i.to_string(),
                });
            }
        }

        let query = manager.get_logs("a", 100, None).unwrap();
        assert_eq!(query.lines.len(), 3);
        let contents: Vec<&str> = query.lines.iter().map(|l| l.content.as_str()).collect();
        assert_eq!(contents, vec!["7", "8", "9"]);
    }

    #[test]
    fn get_logs_filters_by_substring() {
        let dir = tempdir().unwrap();
        let manager = LogManager::new(dir.path().to_path_buf()).unwrap();
        manager.register("e").unwrap();
        let entry = manager.get("e").unwrap();
        {
            let mut book = entry.book.lock().unwrap();
            for content in ["INFO one", "INFO two", "ERROR bad", "INFO three", "ERROR worse"] {
                book.push(LogLine {
                    timestamp: Utc::now(),
                    stream: StreamKind::Stdout,
                    content: content.to_string(),
                });
            }
        }

        let query = manager.get_logs("e", 10, Some("ERROR")).unwrap();
        assert_eq!(query.total_lines, 5);
        assert_eq!(query.filtered_lines, 2);
        assert_eq!(query.lines.len(), 2);
    }

    #[test]
    fn get_logs_unknown_instance_is_not_found() {
        let dir = tempdir().unwrap();
        let manager = LogManager::new(dir.path().to_path_buf()).unwrap();
        let err = manager.get_logs("missing", 10, None).unwrap_err();
        assert!(matches!(err, LogsError::NotFound(_)));
    }

    #[test]
    fn capture_output_writes_ring_and_disk() {
        let dir = tempdir().unwrap();
        let manager = LogManager::new(dir.path().to_path_buf()).unwrap();
        manager.register("s").unwrap();

        let stdout = Cursor::new(b"hello\nworld\n".to_vec());
        let stderr = Cursor::new(b"".to_vec());
        manager.capture_output("s", stdout, stderr);

        // Reader threads run asynchronously; poll briefly for lines to land.
        for _ in 0..50 {
            if manager.get_logs("s", 10, None).unwrap().lines.len() >= 2 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }

        let query = manager.get_logs("s", 10, None).unwrap();
        let contents: Vec<&str> = query.lines.iter().map(|l| l.content.as_str()).collect();
        assert_eq!(contents, vec!["hello", "world"]);
    }

    #[test]
    fn stream_yields_backlog_then_live_lines() {
        let dir = tempdir().unwrap();
        let manager = LogManager::new(dir.path().to_path_buf()).unwrap();
        manager.register("t").unwrap();
        let entry = manager.get("t").unwrap();
        entry.book.lock().unwrap().push(LogLine {
            timestamp: Utc::now(),
            stream: StreamKind::Stdout,
            content: "backlog".to_string(),
        });

        let rx = manager.stream("t").unwrap();
        entry.book.lock().unwrap().push(LogLine {
            timestamp: Utc::now(),
            stream: StreamKind::Stdout,
            content: "live".to_string(),
        });

        let first = rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        let second = rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        assert!(matches!(first, LogEvent::Line(l) if l.content == "backlog"));
        assert!(matches!(second, LogEvent::Line(l) if l.content == "live"));
    }

    #[test]
    fn deregister_sends_end_to_subscribers() {
        let dir = tempdir().unwrap();
        let manager = LogManager::new(dir.path().to_path_buf()).unwrap();
        manager.register("u").unwrap();
        let rx = manager.stream("u").unwrap();
        manager.deregister("u", true);
        let event = rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        assert!(matches!(event, LogEvent::End));
    }
}
