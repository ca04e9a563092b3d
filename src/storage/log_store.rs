//! Engine log buffer
//!
//! Keeps the most recent engine log lines (stdout text that is not a flow
//! event, plus everything written to stderr) in a bounded ring buffer.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock};

/// Maximum log lines retained
pub const MAX_LOG_LINES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub source: LogSource,
    pub line: String,
    pub received_at: DateTime<Utc>,
}

pub struct LogStore {
    entries: RwLock<VecDeque<LogEntry>>,
    capacity: usize,
}

impl Default for LogStore {
    fn default() -> Self {
        Self::with_capacity(MAX_LOG_LINES)
    }
}

impl LogStore {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(MAX_LOG_LINES))),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, source: LogSource, line: impl Into<String>) -> LogEntry {
        let entry = LogEntry {
            source,
            line: line.into(),
            received_at: Utc::now(),
        };
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry.clone());
        entry
    }

    /// Oldest first
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
