//! Correlation-tagged structured logging.
//!
//! Every outbound request and risk decision carries a `CorrelationId` so a
//! failure can be traced across retries, the rate limiter queue, and the
//! wire. The `LogBuffer` keeps a bounded, level-filtered window of recent
//! entries for operator inspection (surfaced via the health endpoint) and
//! mirrors everything through `tracing`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Log severity levels, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl LogLevel {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Debug,
            1 => LogLevel::Info,
            2 => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }
}

/// A single buffered log entry.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    /// Severity.
    pub level: LogLevel,
    /// Component that produced the entry (e.g., "rest", "connection").
    pub target: String,
    /// Correlation id, if the entry belongs to a traced operation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Human-readable message.
    pub message: String,
    /// Unix timestamp (ms).
    pub timestamp: i64,
}

/// Bounded, level-filtered buffer of recent log entries.
pub struct LogBuffer {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
    min_level: AtomicU8,
}

impl LogBuffer {
    /// Create a buffer retaining at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            min_level: AtomicU8::new(LogLevel::Info as u8),
        }
    }

    /// Change the minimum retained level.
    pub fn set_min_level(&self, level: LogLevel) {
        self.min_level.store(level as u8, Ordering::Relaxed);
    }

    /// Record an entry. Entries below the minimum level are dropped; all
    /// retained entries are also mirrored to `tracing`.
    pub fn log(
        &self,
        level: LogLevel,
        target: &str,
        correlation_id: Option<&str>,
        message: impl Into<String>,
    ) {
        if level < LogLevel::from_u8(self.min_level.load(Ordering::Relaxed)) {
            return;
        }

        let message = message.into();
        match (level, correlation_id) {
            (LogLevel::Debug, Some(id)) => debug!("[{}] [{}] {}", target, id, message),
            (LogLevel::Debug, None) => debug!("[{}] {}", target, message),
            (LogLevel::Info, Some(id)) => info!("[{}] [{}] {}", target, id, message),
            (LogLevel::Info, None) => info!("[{}] {}", target, message),
            (LogLevel::Warn, Some(id)) => warn!("[{}] [{}] {}", target, id, message),
            (LogLevel::Warn, None) => warn!("[{}] {}", target, message),
            (LogLevel::Error, Some(id)) => error!("[{}] [{}] {}", target, id, message),
            (LogLevel::Error, None) => error!("[{}] {}", target, message),
        }

        let entry = LogEntry {
            level,
            target: target.to_string(),
            correlation_id: correlation_id.map(|s| s.to_string()),
            message,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };

        if let Ok(mut entries) = self.entries.lock() {
            if entries.len() >= self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
    }

    /// Most recent `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<LogEntry> {
        match self.entries.lock() {
            Ok(entries) => {
                let skip = entries.len().saturating_sub(n);
                entries.iter().skip(skip).cloned().collect()
            }
            Err(_) => Vec::new(),
        }
    }

    /// Drain and return all buffered entries.
    pub fn flush(&self) -> Vec<LogEntry> {
        match self.entries.lock() {
            Ok(mut entries) => entries.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Number of buffered entries.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// Generate a new correlation id.
///
/// Short enough to read in logs, unique enough to never collide within a
/// retention window.
pub fn correlation_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("req-{}", &id[..12])
}
