//! In-memory uptime counters
//!
//! Uptime accrues only between a `start` and the matching `stop`. Nothing here
//! is persisted; the counters reset when the daemon restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// Counters tracked per tunnel
///
/// Only uptime is recorded. The traffic fields keep the reported shape and
/// stay zero, since the connector exposes no per-request data to the daemon.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelMetrics {
    pub cumulative_uptime_ms: u64,
    pub requests: u64,
    pub bandwidth: u64,
    pub errors: u64,
    pub last_request: Option<DateTime<Utc>>,
}

/// Point-in-time view returned to operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    #[serde(flatten)]
    pub metrics: TunnelMetrics,
    /// Cumulative uptime including the currently open bracket
    pub uptime_ms: u64,
    pub uptime_percentage: f64,
}

#[derive(Debug, Default)]
struct Entry {
    metrics: TunnelMetrics,
    bracket: Option<Instant>,
}

impl Entry {
    fn current_uptime_ms(&self) -> u64 {
        let open = self
            .bracket
            .map(|started| started.elapsed().as_millis() as u64)
            .unwrap_or(0);
        self.metrics.cumulative_uptime_ms + open
    }
}

#[derive(Debug, Default)]
pub struct MetricsRecorder {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<R>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> R) -> R {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut entries)
    }

    /// Open an uptime bracket. An already open bracket is kept.
    pub fn start(&self, id: &str) {
        self.with_entries(|entries| {
            let entry = entries.entry(id.to_string()).or_default();
            if entry.bracket.is_none() {
                entry.bracket = Some(Instant::now());
            }
        });
    }

    /// Close the open bracket, folding it into cumulative uptime
    pub fn stop(&self, id: &str) {
        self.with_entries(|entries| {
            if let Some(entry) = entries.get_mut(id) {
                if let Some(started) = entry.bracket.take() {
                    entry.metrics.cumulative_uptime_ms += started.elapsed().as_millis() as u64;
                }
            }
        });
    }

    pub fn current_uptime(&self, id: &str) -> u64 {
        self.with_entries(|entries| {
            entries
                .get(id)
                .map(Entry::current_uptime_ms)
                .unwrap_or(0)
        })
    }

    /// Share of wall-clock time since `created_at` the tunnel spent running
    pub fn uptime_percentage(&self, id: &str, created_at: Option<DateTime<Utc>>) -> f64 {
        let uptime = self.current_uptime(id);
        percentage(uptime, created_at)
    }

    pub fn snapshot(&self, id: &str, created_at: Option<DateTime<Utc>>) -> MetricsSnapshot {
        let (metrics, uptime_ms) = self.with_entries(|entries| {
            entries
                .get(id)
                .map(|entry| (entry.metrics.clone(), entry.current_uptime_ms()))
                .unwrap_or_default()
        });

        MetricsSnapshot {
            metrics,
            uptime_ms,
            uptime_percentage: percentage(uptime_ms, created_at),
        }
    }

    pub fn forget(&self, id: &str) {
        self.with_entries(|entries| {
            entries.remove(id);
        });
    }
}

fn percentage(uptime_ms: u64, created_at: Option<DateTime<Utc>>) -> f64 {
    let Some(created_at) = created_at else {
        return 0.0;
    };
    let elapsed_ms = (Utc::now() - created_at).num_milliseconds();
    if elapsed_ms <= 0 {
        return 0.0;
    }
    (uptime_ms as f64 / elapsed_ms as f64) * 100.0
}
