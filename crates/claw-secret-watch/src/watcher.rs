//! Filesystem watcher built on the `notify` crate.
//!
//! Subscribes non-recursively to each directory and hands every reported
//! path to a sink as a [`FileEvent`], in the order `notify` delivers them.

use std::collections::BTreeSet;
use std::path::PathBuf;

use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use crate::error::Result;
use crate::event::{EventKind, FileEvent};

/// A running watcher. Dropping it stops the subscription.
pub struct FsWatcher {
    _inner: RecommendedWatcher,
    directories: Vec<PathBuf>,
}

impl FsWatcher {
    /// Starts watching `directories`, passing each notification to `sink`.
    ///
    /// `sink` runs on the watcher's own thread, outside any async runtime.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Watch`] if the watcher cannot be created or a
    /// directory cannot be subscribed to.
    pub fn watch<F>(directories: &BTreeSet<PathBuf>, sink: F) -> Result<Self>
    where
        F: Fn(FileEvent) + Send + 'static,
    {
        let mut inner = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    for file_event in convert(&event) {
                        sink(file_event);
                    }
                }
                Err(e) => warn!(error = %e, "filesystem watcher error"),
            }
        })?;

        for directory in directories {
            inner.watch(directory, RecursiveMode::NonRecursive)?;
            debug!(directory = %directory.display(), "watching directory");
        }

        Ok(Self {
            _inner: inner,
            directories: directories.iter().cloned().collect(),
        })
    }

    /// The watched directories.
    #[must_use]
    pub fn directories(&self) -> &[PathBuf] {
        &self.directories
    }
}

impl std::fmt::Debug for FsWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsWatcher")
            .field("directories", &self.directories)
            .finish_non_exhaustive()
    }
}

/// Maps a `notify` event kind onto an [`EventKind`].
fn map_kind(kind: notify::EventKind) -> EventKind {
    match kind {
        notify::EventKind::Create(_) => EventKind::Created,
        notify::EventKind::Remove(_) => EventKind::Removed,
        notify::EventKind::Modify(modify) => match modify {
            ModifyKind::Data(_) | ModifyKind::Any | ModifyKind::Other => EventKind::Modified,
            ModifyKind::Metadata(_) => EventKind::Attributes,
            ModifyKind::Name(RenameMode::To) => EventKind::MovedTo,
            ModifyKind::Name(RenameMode::From) => EventKind::MovedFrom,
            ModifyKind::Name(_) => EventKind::Renamed,
        },
        notify::EventKind::Access(AccessKind::Close(AccessMode::Write)) => EventKind::Closed,
        notify::EventKind::Access(_) | notify::EventKind::Any | notify::EventKind::Other => {
            EventKind::Other
        }
    }
}

/// Splits a `notify` event into one [`FileEvent`] per path.
///
/// A two-path rename reports the source as moved away and the destination
/// as renamed.
pub fn convert(event: &notify::Event) -> Vec<FileEvent> {
    if event.kind == notify::EventKind::Modify(ModifyKind::Name(RenameMode::Both)) {
        return event
            .paths
            .iter()
            .enumerate()
            .map(|(i, path)| {
                let kind = if i == 0 {
                    EventKind::MovedFrom
                } else {
                    EventKind::Renamed
                };
                FileEvent::new(path.clone(), [kind])
            })
            .collect();
    }

    let kind = map_kind(event.kind);
    event
        .paths
        .iter()
        .map(|path| FileEvent::new(path.clone(), [kind]))
        .collect()
}
