//! Bounded, timestamped record of session and protocol events
//!
//! The log is the only user-facing error channel. It keeps the most recent
//! entries and fans every append out to live subscribers.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::broadcast;

/// Default number of retained entries
pub const DEFAULT_CAPACITY: usize = 500;

/// Buffer of the live subscriber channel
const SUBSCRIBER_BUFFER: usize = 256;

/// Who or what an entry is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogCategory {
    System,
    User,
    Agent,
    Audio,
    Error,
}

impl LogCategory {
    /// Lowercase label
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Agent => "agent",
            Self::Audio => "audio",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One log line
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub time: DateTime<Local>,
    pub category: LogCategory,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {:<6} {}",
            self.time.format("%H:%M:%S"),
            self.category,
            self.message
        )
    }
}

/// Shared, bounded event log
///
/// Cloning yields another handle to the same log, so the capture path, the
/// connection tasks and the session can all append to it.
#[derive(Debug, Clone)]
pub struct EventLog {
    entries: Arc<Mutex<VecDeque<LogEntry>>>,
    capacity: usize,
    live: broadcast::Sender<LogEntry>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventLog {
    /// Create a log retaining at most `capacity` entries
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (live, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
            live,
        }
    }

    /// Append an entry, evicting the oldest when full
    pub fn append(&self, category: LogCategory, message: impl Into<String>) {
        let entry = LogEntry {
            time: Local::now(),
            category,
            message: message.into(),
        };

        match category {
            LogCategory::Error => tracing::warn!(category = %category, "{}", entry.message),
            _ => tracing::debug!(category = %category, "{}", entry.message),
        }

        if let Ok(mut entries) = self.entries.lock() {
            if entries.len() >= self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry.clone());
        }

        // No subscribers is fine
        let _ = self.live.send(entry);
    }

    /// Record a lifecycle message
    pub fn system(&self, message: impl Into<String>) {
        self.append(LogCategory::System, message);
    }

    /// Record what the user said or typed
    pub fn user(&self, message: impl Into<String>) {
        self.append(LogCategory::User, message);
    }

    /// Record agent reply text
    pub fn agent(&self, message: impl Into<String>) {
        self.append(LogCategory::Agent, message);
    }

    /// Record an audio pipeline event
    pub fn audio(&self, message: impl Into<String>) {
        self.append(LogCategory::Audio, message);
    }

    /// Record a failure
    pub fn error(&self, message: impl Into<String>) {
        self.append(LogCategory::Error, message);
    }

    /// Snapshot of retained entries, oldest first
    #[must_use]
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Retained entries of one category
    #[must_use]
    pub fn by_category(&self, category: LogCategory) -> Vec<LogEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.category == category)
            .collect()
    }

    /// Number of retained entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or_default()
    }

    /// Check if the log holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of retained entries
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop all retained entries
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    /// Receive entries appended from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.live.subscribe()
    }
}
