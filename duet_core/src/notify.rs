//! User-facing notifications.
//!
//! Session-scoped log of info/warning/error messages, deduplicated by
//! message text: recording a message that is already present replaces the
//! old entry and bumps its count. Every entry is also emitted through
//! `tracing`.

use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

/// Severity of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info = 1,
    Warning = 2,
    Error = 3,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub level: Level,

    /// Component that raised it, e.g. `dispatcher`
    pub source: String,

    pub message: String,

    /// How often this message was recorded
    pub count: u32,
}

#[derive(Debug, Default)]
pub struct Notifications {
    entries: Mutex<Vec<Notification>>,
}

impl Notifications {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries_mut(&self) -> MutexGuard<'_, Vec<Notification>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records a notification; the latest copy of a message wins.
    pub fn record(&self, level: Level, source: &str, message: impl Into<String>) {
        let message = message.into();
        match level {
            Level::Info => info!(source, "{message}"),
            Level::Warning => warn!(source, "{message}"),
            Level::Error => error!(source, "{message}"),
        }

        let mut entries = self.entries_mut();
        let count = match entries.iter().position(|n| n.message == message) {
            Some(index) => entries.remove(index).count + 1,
            None => 1,
        };
        entries.push(Notification {
            level,
            source: source.to_string(),
            message,
            count,
        });
    }

    pub fn info(&self, source: &str, message: impl Into<String>) {
        self.record(Level::Info, source, message);
    }

    pub fn warning(&self, source: &str, message: impl Into<String>) {
        self.record(Level::Warning, source, message);
    }

    pub fn error(&self, source: &str, message: impl Into<String>) {
        self.record(Level::Error, source, message);
    }

    /// Snapshot, oldest first.
    pub fn entries(&self) -> Vec<Notification> {
        self.entries_mut().clone()
    }

    /// Entries at or above a level.
    pub fn at_least(&self, level: Level) -> Vec<Notification> {
        self.entries_mut().iter().filter(|n| n.level >= level).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries_mut().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries_mut().clear();
    }
}
