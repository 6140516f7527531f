//! Failure diagnostics: a bounded buffer of recent log lines and frames per
//! target, written to disk when a routine has to restart or abort.

use crate::io::{create_fresh_dir, slugify};
use chrono::{Local, NaiveDateTime, Timelike};
use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

pub const DEFAULT_MAX_LOGS: usize = 400;
pub const DEFAULT_MAX_FRAMES: usize = 6;

struct LogLine {
    at: NaiveDateTime,
    message: String,
}

struct FrameRecord {
    at: NaiveDateTime,
    label: String,
    png: Vec<u8>,
}

#[derive(Default)]
struct Buffers {
    logs: HashMap<String, VecDeque<LogLine>>,
    frames: HashMap<String, VecDeque<FrameRecord>>,
}

// ---------------------------------------------------------------------------
// DiagnosticsSink
// ---------------------------------------------------------------------------

/// Shared across a run behind an `Arc`; every target writes into its own buffers.
pub struct DiagnosticsSink {
    base_dir: PathBuf,
    max_logs: usize,
    max_frames: usize,
    buffers: Mutex<Buffers>,
}

impl DiagnosticsSink {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self::with_capacity(base_dir, DEFAULT_MAX_LOGS, DEFAULT_MAX_FRAMES)
    }

    pub fn with_capacity(base_dir: impl Into<PathBuf>, max_logs: usize, max_frames: usize) -> Self {
        Self {
            base_dir: base_dir.into(),
            max_logs,
            max_frames,
            buffers: Mutex::new(Buffers::default()),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn record_log(&self, target: &str, message: &str) {
        if target.is_empty() || message.is_empty() || self.max_logs == 0 {
            return;
        }
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        let queue = buffers.logs.entry(target.to_string()).or_default();
        if queue.len() == self.max_logs {
            queue.pop_front();
        }
        queue.push_back(LogLine {
            at: Local::now().naive_local(),
            message: message.to_string(),
        });
    }

    /// Buffer an encoded PNG frame under a short label.
    pub fn record_frame(&self, target: &str, label: &str, png: &[u8]) {
        if target.is_empty() || png.is_empty() || self.max_frames == 0 {
            return;
        }
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        let queue = buffers.frames.entry(target.to_string()).or_default();
        if queue.len() == self.max_frames {
            queue.pop_front();
        }
        queue.push_back(FrameRecord {
            at: Local::now().naive_local(),
            label: slugify(label, "frame"),
            png: png.to_vec(),
        });
    }

    pub fn buffered_logs(&self, target: &str) -> usize {
        let buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        buffers.logs.get(target).map_or(0, VecDeque::len)
    }

    pub fn buffered_frames(&self, target: &str) -> usize {
        let buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        buffers.frames.get(target).map_or(0, VecDeque::len)
    }

    /// Write the buffered logs and frames for `target` into a fresh report
    /// folder. Returns the folder, or `None` if nothing could be written.
    pub fn persist_failure(&self, target: &str, reason: &str) -> Option<PathBuf> {
        match self.write_report(target, reason) {
            Ok(folder) => {
                info!(target_name = %target, path = %folder.display(), "diagnostics saved");
                Some(folder)
            }
            Err(e) => {
                warn!(target_name = %target, error = %e, "could not save diagnostics");
                None
            }
        }
    }

    fn write_report(&self, target: &str, reason: &str) -> crate::Result<PathBuf> {
        let now = Local::now().naive_local();
        let folder_name = format!(
            "{}_{}_{}",
            now.format("%Y%m%d_%H%M%S"),
            slugify(target, "target"),
            slugify(reason, "failure")
        );
        let mut folder = self.base_dir.join(&folder_name);
        if !create_fresh_dir(&folder)? {
            folder = self
                .base_dir
                .join(format!("{folder_name}_{:03}", now.nanosecond() / 1_000_000 % 1000));
            std::fs::create_dir_all(&folder)?;
        }

        let (logs, frames) = {
            let buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
            let logs: Vec<String> = buffers
                .logs
                .get(target)
                .map(|q| {
                    q.iter()
                        .map(|l| format!("[{}] {}", l.at.format("%H:%M:%S"), l.message))
                        .collect()
                })
                .unwrap_or_default();
            let frames: Vec<(String, Vec<u8>)> = buffers
                .frames
                .get(target)
                .map(|q| {
                    q.iter()
                        .enumerate()
                        .map(|(i, f)| {
                            let name =
                                format!("{:02}_{}_{}.png", i + 1, f.at.format("%H%M%S"), f.label);
                            (name, f.png.clone())
                        })
                        .collect()
                })
                .unwrap_or_default();
            (logs, frames)
        };

        let mut text = String::new();
        let _ = writeln!(text, "Target: {target}");
        let _ = writeln!(text, "Timestamp: {}", now.format("%Y-%m-%dT%H:%M:%S%.f"));
        let _ = writeln!(text, "Reason: {reason}");
        text.push_str("\n--- Recent log entries ---\n");
        for line in logs {
            text.push_str(&line);
            text.push('\n');
        }
        std::fs::write(folder.join("log.txt"), text)?;

        for (name, png) in frames {
            std::fs::write(folder.join(name), png)?;
        }
        Ok(folder)
    }
}

// ---------------------------------------------------------------------------
// TargetLog
// ---------------------------------------------------------------------------

struct TargetLogInner {
    target: String,
    task: Mutex<Option<String>>,
    sink: Option<Arc<DiagnosticsSink>>,
}

/// Per-target logger handed to the channel and to tasks.
///
/// Lines go to `tracing` with a `target_name` field and are mirrored, prefixed
/// with the current task, into the diagnostics sink. Clones share state.
#[derive(Clone)]
pub struct TargetLog {
    inner: Arc<TargetLogInner>,
}

impl TargetLog {
    pub fn new(target: impl Into<String>, sink: Option<Arc<DiagnosticsSink>>) -> Self {
        Self {
            inner: Arc::new(TargetLogInner {
                target: target.into(),
                task: Mutex::new(None),
                sink,
            }),
        }
    }

    pub fn target(&self) -> &str {
        &self.inner.target
    }

    pub fn set_task(&self, task: Option<&str>) {
        let task = task.map(str::trim).filter(|t| !t.is_empty()).map(String::from);
        *self.inner.task.lock().unwrap_or_else(|e| e.into_inner()) = task;
    }

    pub fn current_task(&self) -> Option<String> {
        self.inner.task.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn info(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        let task = self.current_task();
        info!(target_name = %self.inner.target, task = task.as_deref().unwrap_or("-"), "{message}");
        self.record(task.as_deref(), message);
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        let task = self.current_task();
        warn!(target_name = %self.inner.target, task = task.as_deref().unwrap_or("-"), "{message}");
        self.record(task.as_deref(), message);
    }

    pub fn error(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        let task = self.current_task();
        error!(target_name = %self.inner.target, task = task.as_deref().unwrap_or("-"), "{message}");
        self.record(task.as_deref(), message);
    }

    pub fn record_frame(&self, label: &str, png: &[u8]) {
        if let Some(sink) = &self.inner.sink {
            sink.record_frame(&self.inner.target, label, png);
        }
    }

    pub fn persist_failure(&self, reason: &str) -> Option<PathBuf> {
        self.inner
            .sink
            .as_ref()
            .and_then(|sink| sink.persist_failure(&self.inner.target, reason))
    }

    fn record(&self, task: Option<&str>, message: &str) {
        let Some(sink) = &self.inner.sink else {
            return;
        };
        let line = match task {
            Some(task) => format!("[{task}] {message}"),
            None => message.to_string(),
        };
        sink.record_log(&self.inner.target, &line);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
