//! Observability events emitted by the secret store.
//!
//! The store reports four events: every raw file notification it receives,
//! every confirmed rotation, every initial load of a watched secret, and
//! every notification it ignored. They go through a [`Telemetry`] sink;
//! [`TracingTelemetry`] logs them, [`RecordingTelemetry`] also keeps a
//! bounded history that can be queried.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::event::{join_kinds, EventKind, FileEvent};
use crate::types::SecretId;

/// An event emitted by the store. Never carries secret content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelemetryEvent {
    /// A raw notification arrived from the watcher.
    FileEvent {
        /// The reported kinds.
        events: Vec<EventKind>,
        /// The reported path.
        path: PathBuf,
    },
    /// A watched secret was rotated.
    ChangedSecret {
        /// The rotated secret.
        secret_name: SecretId,
    },
    /// A watched secret was loaded at startup.
    InitialLoading {
        /// The loaded secret.
        secret_name: SecretId,
        /// The directory it was loaded from.
        directory: PathBuf,
    },
    /// A notification was ignored.
    UnwatchedEvents {
        /// The reported kinds.
        events: Vec<EventKind>,
        /// The reported path.
        path: PathBuf,
    },
}

impl TelemetryEvent {
    pub(crate) fn file_event(event: &FileEvent) -> Self {
        Self::FileEvent {
            events: event.kinds.clone(),
            path: event.path.clone(),
        }
    }

    pub(crate) fn unwatched(event: &FileEvent) -> Self {
        Self::UnwatchedEvents {
            events: event.kinds.clone(),
            path: event.path.clone(),
        }
    }

    /// The event name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::FileEvent { .. } => "file_event",
            Self::ChangedSecret { .. } => "changed_secret",
            Self::InitialLoading { .. } => "initial_loading",
            Self::UnwatchedEvents { .. } => "unwatched_events",
        }
    }

    /// The secret the event is about, if any.
    #[must_use]
    pub const fn secret_name(&self) -> Option<&SecretId> {
        match self {
            Self::ChangedSecret { secret_name } | Self::InitialLoading { secret_name, .. } => {
                Some(secret_name)
            }
            Self::FileEvent { .. } | Self::UnwatchedEvents { .. } => None,
        }
    }
}

fn log_event(event: &TelemetryEvent) {
    match event {
        TelemetryEvent::FileEvent { events, path } => debug!(
            event = event.name(),
            events = %join_kinds(events),
            path = %path.display(),
            "file event received"
        ),
        TelemetryEvent::ChangedSecret { secret_name } => debug!(
            event = event.name(),
            secret_name = %secret_name,
            "secret changed"
        ),
        TelemetryEvent::InitialLoading {
            secret_name,
            directory,
        } => debug!(
            event = event.name(),
            secret_name = %secret_name,
            directory = %directory.display(),
            "secret loaded"
        ),
        TelemetryEvent::UnwatchedEvents { events, path } => debug!(
            event = event.name(),
            events = %join_kinds(events),
            path = %path.display(),
            "file event ignored"
        ),
    }
}

/// A sink for store telemetry.
pub trait Telemetry: Send + Sync {
    /// Emits one event. Must not block for long; it runs on the store's task.
    /// A panic is caught and logged by the store.
    fn emit(&self, event: &TelemetryEvent);
}

/// Logs every event through `tracing` at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn emit(&self, event: &TelemetryEvent) {
        log_event(event);
    }
}

/// A recorded telemetry event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryRecord {
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
    /// The event.
    pub event: TelemetryEvent,
}

/// Filter criteria for querying recorded telemetry.
#[derive(Debug, Clone, Default)]
pub struct TelemetryFilter {
    /// Filter by event name.
    pub name: Option<&'static str>,
    /// Filter by secret.
    pub secret_name: Option<SecretId>,
    /// Filter records after this time.
    pub after: Option<DateTime<Utc>>,
    /// Maximum number of records to return.
    pub limit: Option<usize>,
}

impl TelemetryFilter {
    /// Creates a new empty filter that matches all records.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Filters by event name (`file_event`, `changed_secret`, ...).
    #[must_use]
    pub fn named(mut self, name: &'static str) -> Self {
        self.name = Some(name);
        self
    }

    /// Filters by secret.
    #[must_use]
    pub fn for_secret(mut self, secret_name: SecretId) -> Self {
        self.secret_name = Some(secret_name);
        self
    }

    /// Filters records after a given time.
    #[must_use]
    pub fn after(mut self, time: DateTime<Utc>) -> Self {
        self.after = Some(time);
        self
    }

    /// Limits the number of returned records.
    #[must_use]
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    fn matches(&self, record: &TelemetryRecord) -> bool {
        if let Some(name) = self.name {
            if record.event.name() != name {
                return false;
            }
        }

        if let Some(ref id) = self.secret_name {
            if record.event.secret_name() != Some(id) {
                return false;
            }
        }

        if let Some(after) = self.after {
            if record.timestamp <= after {
                return false;
            }
        }

        true
    }
}

/// Keeps the most recent events in memory and logs them via `tracing`.
pub struct RecordingTelemetry {
    capacity: usize,
    records: RwLock<VecDeque<TelemetryRecord>>,
}

impl RecordingTelemetry {
    /// Default number of records retained.
    pub const DEFAULT_CAPACITY: usize = 1024;

    /// Creates a recorder with [`Self::DEFAULT_CAPACITY`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Creates a recorder retaining at most `capacity` records.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: RwLock::new(VecDeque::new()),
        }
    }

    /// Returns matching records, newest first.
    #[must_use]
    pub fn query(&self, filter: &TelemetryFilter) -> Vec<TelemetryRecord> {
        let records = self
            .records
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let matching = records.iter().rev().filter(|r| filter.matches(r)).cloned();
        match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        }
    }

    /// Counts records with the given event name.
    #[must_use]
    pub fn count(&self, name: &'static str) -> usize {
        self.query(&TelemetryFilter::new().named(name)).len()
    }

    /// Returns the number of retained records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Returns true if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops all retained records.
    pub fn clear(&self) {
        self.records
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }
}

impl Default for RecordingTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry for RecordingTelemetry {
    fn emit(&self, event: &TelemetryEvent) {
        log_event(event);

        let mut records = self
            .records
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(TelemetryRecord {
            timestamp: Utc::now(),
            event: event.clone(),
        });
    }
}

impl std::fmt::Debug for RecordingTelemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingTelemetry")
            .field("capacity", &self.capacity)
            .field("records_count", &self.len())
            .finish()
    }
}
