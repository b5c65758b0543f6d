//! Raw filesystem notifications as delivered by a watcher.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The kind of a filesystem notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// File data was written.
    Modified,
    /// A file was created.
    Created,
    /// A file was renamed (destination side).
    Renamed,
    /// A file was moved into place.
    MovedTo,
    /// A file was moved away.
    MovedFrom,
    /// A file was removed.
    Removed,
    /// Metadata such as permissions changed.
    Attributes,
    /// A file opened for writing was closed.
    Closed,
    /// Anything else the watcher reports.
    Other,
}

impl EventKind {
    /// Returns true if this kind can signal new file content.
    #[must_use]
    pub const fn may_change_content(self) -> bool {
        matches!(
            self,
            Self::Modified | Self::Created | Self::Renamed | Self::MovedTo
        )
    }

    /// Returns the snake-case name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Modified => "modified",
            Self::Created => "created",
            Self::Renamed => "renamed",
            Self::MovedTo => "moved_to",
            Self::MovedFrom => "moved_from",
            Self::Removed => "removed",
            Self::Attributes => "attributes",
            Self::Closed => "closed",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `(path, kinds)` notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEvent {
    /// The path the notification refers to.
    pub path: PathBuf,
    /// The kinds reported for the path.
    pub kinds: Vec<EventKind>,
}

impl FileEvent {
    /// Creates a notification for `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self {
            path: path.into(),
            kinds: kinds.into_iter().collect(),
        }
    }

    /// Returns true if any reported kind can signal new content.
    #[must_use]
    pub fn may_change_content(&self) -> bool {
        self.kinds.iter().any(|kind| kind.may_change_content())
    }

    /// Comma-separated kind names, for log metadata.
    #[must_use]
    pub fn kind_names(&self) -> String {
        join_kinds(&self.kinds)
    }
}

pub(crate) fn join_kinds(kinds: &[EventKind]) -> String {
    kinds
        .iter()
        .map(|kind| kind.as_str())
        .collect::<Vec<_>>()
        .join(",")
}
