//! Turns raw file notifications into rotation decisions.
//!
//! A notification counts only if one of its kinds can change content and its
//! path is a regular file at the time it is handled. The path must belong to
//! a watched secret, the file must be readable, and the new content must
//! differ (in constant time) from the stored value. An erased or unset slot
//! has no baseline, so any readable content counts as a change.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::compare;
use crate::event::FileEvent;
use crate::resolver::{self, PathIndex};
use crate::types::{Secret, SecretId, Slot};

/// Why a notification did not lead to a rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// None of the kinds can change content.
    IrrelevantKinds,
    /// The path is missing or is not a regular file.
    NotARegularFile,
    /// The path does not belong to a watched secret.
    UntrackedPath,
    /// The file could not be read.
    Unreadable,
    /// The content equals the stored value.
    Unchanged,
}

impl IgnoreReason {
    /// Returns true if the notification fell outside the watched secrets.
    #[must_use]
    pub const fn is_unwatched(self) -> bool {
        matches!(
            self,
            Self::IrrelevantKinds | Self::NotARegularFile | Self::UntrackedPath
        )
    }
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IrrelevantKinds => write!(f, "irrelevant_kinds"),
            Self::NotARegularFile => write!(f, "not_a_regular_file"),
            Self::UntrackedPath => write!(f, "untracked_path"),
            Self::Unreadable => write!(f, "unreadable"),
            Self::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// The outcome of reconciling one notification.
#[derive(Debug, Clone)]
pub enum Classification {
    /// Nothing to do.
    Ignore(IgnoreReason),
    /// The secret rotated to `secret`.
    Changed {
        /// The rotated secret.
        id: SecretId,
        /// Accessor for the new content.
        secret: Secret,
    },
}

impl Classification {
    /// Returns true for [`Classification::Changed`].
    #[must_use]
    pub const fn is_changed(&self) -> bool {
        matches!(self, Self::Changed { .. })
    }
}

/// Classifies notifications against the path index.
#[derive(Debug, Clone)]
pub struct Reconciler {
    index: PathIndex,
    trim_secrets: bool,
}

impl Reconciler {
    /// Creates a reconciler over `index`.
    #[must_use]
    pub const fn new(index: PathIndex, trim_secrets: bool) -> Self {
        Self {
            index,
            trim_secrets,
        }
    }

    /// The path index.
    #[must_use]
    pub const fn index(&self) -> &PathIndex {
        &self.index
    }

    /// Classifies `event`. `current` looks up the stored slot of a secret.
    ///
    /// Reads the file synchronously when the notification is relevant. A
    /// stored accessor that panics counts as different content.
    pub fn classify<'a, F>(&self, event: &FileEvent, current: F) -> Classification
    where
        F: FnOnce(&SecretId) -> Option<&'a Slot>,
    {
        if !event.may_change_content() {
            return Classification::Ignore(IgnoreReason::IrrelevantKinds);
        }

        if !is_regular_file(&event.path) {
            return Classification::Ignore(IgnoreReason::NotARegularFile);
        }

        let Some(id) = self.index.resolve(&event_path(&event.path)) else {
            return Classification::Ignore(IgnoreReason::UntrackedPath);
        };

        let Some(new_value) = resolver::load_file(&event.path, self.trim_secrets) else {
            return Classification::Ignore(IgnoreReason::Unreadable);
        };

        let unchanged = match current(id) {
            Some(Slot::Value(stored)) => catch_unwind(AssertUnwindSafe(|| {
                compare::equal(stored.expose().as_bytes(), new_value.as_bytes())
            }))
            .unwrap_or_else(|_| {
                warn!(secret_name = %id, "stored accessor panicked, treating content as changed");
                false
            }),
            Some(Slot::Unset | Slot::Erased) | None => false,
        };

        if unchanged {
            Classification::Ignore(IgnoreReason::Unchanged)
        } else {
            Classification::Changed {
                id: id.clone(),
                secret: Secret::new(new_value),
            }
        }
    }
}

fn is_regular_file(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|meta| meta.is_file())
}

/// Brings a reported path into the form used by the index.
fn event_path(path: &Path) -> PathBuf {
    std::path::absolute(path).map_or_else(|_| path.to_path_buf(), |abs| resolver::normalize(&abs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use test_case::test_case;

    struct Fixture {
        dir: tempfile::TempDir,
        reconciler: Reconciler,
    }

    impl Fixture {
        fn new(trim: bool) -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let mut index = PathIndex::new();
            index
                .insert(
                    SecretId::new("token").expect("valid id"),
                    resolver::secret_path(dir.path(), &SecretId::new("token").expect("valid id"))
                        .expect("resolvable"),
                )
                .expect("insert");
            Self {
                dir,
                reconciler: Reconciler::new(index, trim),
            }
        }

        fn token_path(&self) -> PathBuf {
            self.dir.path().join("token")
        }

        fn write(&self, name: &str, content: &str) {
            std::fs::write(self.dir.path().join(name), content).expect("write");
        }

        fn classify(&self, event: &FileEvent, slot: &Slot) -> Classification {
            self.reconciler.classify(event, |_| Some(slot))
        }
    }

    fn exposed(classification: &Classification) -> Option<String> {
        match classification {
            Classification::Changed { secret, .. } => {
                secret.expose().as_str().map(ToString::to_string)
            }
            Classification::Ignore(_) => None,
        }
    }

    #[test_case(EventKind::Modified ; "modified")]
    #[test_case(EventKind::Created ; "created")]
    #[test_case(EventKind::Renamed ; "renamed")]
    #[test_case(EventKind::MovedTo ; "moved to")]
    fn content_kinds_detect_change(kind: EventKind) {
        let fx = Fixture::new(true);
        fx.write("token", "new");

        let event = FileEvent::new(fx.token_path(), [kind]);
        let result = fx.classify(&event, &Slot::Value(Secret::new("old")));

        assert!(result.is_changed());
        assert_eq!(exposed(&result).as_deref(), Some("new"));
    }

    #[test_case(EventKind::Removed ; "removed")]
    #[test_case(EventKind::Attributes ; "attributes")]
    #[test_case(EventKind::Closed ; "closed")]
    #[test_case(EventKind::Other ; "other")]
    fn other_kinds_are_ignored(kind: EventKind) {
        let fx = Fixture::new(true);
        fx.write("token", "new");

        let event = FileEvent::new(fx.token_path(), [kind]);
        let result = fx.classify(&event, &Slot::Value(Secret::new("old")));

        assert!(matches!(
            result,
            Classification::Ignore(IgnoreReason::IrrelevantKinds)
        ));
    }

    #[test]
    fn unchanged_content_is_ignored() {
        let fx = Fixture::new(true);
        fx.write("token", "same\n");

        let event = FileEvent::new(fx.token_path(), [EventKind::Modified]);
        let result = fx.classify(&event, &Slot::Value(Secret::new("same")));

        assert!(matches!(
            result,
            Classification::Ignore(IgnoreReason::Unchanged)
        ));
    }

    #[test]
    fn untrimmed_comparison_sees_whitespace() {
        let fx = Fixture::new(false);
        fx.write("token", "same\n");

        let event = FileEvent::new(fx.token_path(), [EventKind::Modified]);
        let result = fx.classify(&event, &Slot::Value(Secret::new("same")));

        assert_eq!(exposed(&result).as_deref(), Some("same\n"));
    }

    #[test]
    fn erased_slot_always_changes() {
        let fx = Fixture::new(true);
        fx.write("token", "same");

        let event = FileEvent::new(fx.token_path(), [EventKind::Modified]);
        assert!(fx.classify(&event, &Slot::Erased).is_changed());
        assert!(fx.classify(&event, &Slot::Unset).is_changed());
    }

    #[test]
    fn missing_file_is_ignored() {
        let fx = Fixture::new(true);

        let event = FileEvent::new(fx.token_path(), [EventKind::Created]);
        let result = fx.classify(&event, &Slot::Erased);

        assert!(matches!(
            result,
            Classification::Ignore(IgnoreReason::NotARegularFile)
        ));
    }

    #[test]
    fn directory_is_ignored() {
        let fx = Fixture::new(true);
        std::fs::create_dir(fx.token_path()).expect("mkdir");

        let event = FileEvent::new(fx.token_path(), [EventKind::Created]);
        let result = fx.classify(&event, &Slot::Erased);

        assert!(matches!(
            result,
            Classification::Ignore(IgnoreReason::NotARegularFile)
        ));
    }

    #[test]
    fn untracked_path_is_ignored() {
        let fx = Fixture::new(true);
        fx.write("unrelated", "noise");

        let event = FileEvent::new(fx.dir.path().join("unrelated"), [EventKind::Modified]);
        let result = fx.classify(&event, &Slot::Erased);

        assert!(matches!(
            result,
            Classification::Ignore(IgnoreReason::UntrackedPath)
        ));
    }

    #[test]
    fn non_normalized_event_path_resolves() {
        let fx = Fixture::new(true);
        fx.write("token", "new");

        let event = FileEvent::new(fx.dir.path().join(".").join("token"), [EventKind::Modified]);
        assert!(fx.classify(&event, &Slot::Erased).is_changed());
    }

    #[test]
    fn replaying_event_after_update_is_idempotent() {
        let fx = Fixture::new(true);
        fx.write("token", "rotated");
        let event = FileEvent::new(fx.token_path(), [EventKind::Modified]);

        let mut slot = Slot::Value(Secret::new("original"));
        let first = fx.classify(&event, &slot);
        let Classification::Changed { secret, .. } = first else {
            unreachable!("first replay must change");
        };
        slot = Slot::Value(secret);

        let second = fx.classify(&event, &slot);
        assert!(matches!(
            second,
            Classification::Ignore(IgnoreReason::Unchanged)
        ));
    }

    #[test]
    #[allow(clippy::panic)]
    fn panicking_accessor_counts_as_changed() {
        let fx = Fixture::new(true);
        fx.write("token", "new");

        let broken = Slot::Value(Secret::from_fn(|| panic!("accessor failure")));
        let event = FileEvent::new(fx.token_path(), [EventKind::Modified]);
        let result = fx.classify(&event, &broken);

        assert_eq!(exposed(&result).as_deref(), Some("new"));
    }

    #[test]
    fn unwatched_reasons() {
        assert!(IgnoreReason::IrrelevantKinds.is_unwatched());
        assert!(IgnoreReason::NotARegularFile.is_unwatched());
        assert!(IgnoreReason::UntrackedPath.is_unwatched());
        assert!(!IgnoreReason::Unreadable.is_unwatched());
        assert!(!IgnoreReason::Unchanged.is_unwatched());
        assert_eq!(IgnoreReason::Unchanged.to_string(), "unchanged");
    }
}
