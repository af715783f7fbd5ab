//! Per-tunnel bounded log buffers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Maximum number of entries retained per tunnel
pub const LOG_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Classify a line the tunnel process wrote to stderr
    ///
    /// The launcher logs everything to stderr, so the level is inferred from
    /// the line itself.
    pub fn classify_stderr(line: &str) -> Self {
        if line.contains(" ERR ") || line.contains("error") || line.contains("failed") {
            LogLevel::Error
        } else if line.contains(" WRN ") {
            LogLevel::Warning
        } else {
            LogLevel::Info
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Ring-bounded log storage keyed by tunnel id
#[derive(Debug, Default)]
pub struct LogSink {
    buffers: Mutex<HashMap<String, VecDeque<LogEntry>>>,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a line, evicting the oldest entry once the buffer is full
    pub fn append(&self, id: &str, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        };

        let mut buffers = match self.buffers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let buffer = buffers
            .entry(id.to_string())
            .or_insert_with(|| VecDeque::with_capacity(LOG_CAPACITY));
        while buffer.len() >= LOG_CAPACITY {
            buffer.pop_front();
        }
        buffer.push_back(entry);
    }

    /// Current buffer in insertion order; empty for unknown ids
    pub fn read(&self, id: &str) -> Vec<LogEntry> {
        let buffers = match self.buffers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        buffers
            .get(id)
            .map(|buffer| buffer.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&self, id: &str) {
        let mut buffers = match self.buffers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        buffers.remove(id);
    }
}
