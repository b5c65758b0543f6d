//! Startup path resolution and initial secret loading.
//!
//! Every watched secret lives at `directory/<identifier>`. Resolution turns
//! that into an absolute, lexically normalized path, records it in a
//! [`PathIndex`] that must stay injective, and loads the initial content.

use std::collections::{BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};

use tracing::debug;
use zeroize::Zeroize;

use crate::config::SecretsConfig;
use crate::error::{Error, Result};
use crate::types::{Secret, SecretBytes, SecretId, Slot};

/// Bidirectional `absolute path <-> identifier` map for watched secrets.
#[derive(Debug, Clone, Default)]
pub struct PathIndex {
    by_path: HashMap<PathBuf, SecretId>,
    by_id: HashMap<SecretId, PathBuf>,
}

impl PathIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a mapping.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicatePath`] if another identifier already maps
    /// to `path`.
    pub fn insert(&mut self, id: SecretId, path: PathBuf) -> Result<()> {
        if let Some(existing) = self.by_path.get(&path) {
            if *existing != id {
                return Err(Error::DuplicatePath {
                    path,
                    first: existing.to_string(),
                    second: id.to_string(),
                });
            }
        }

        if let Some(old_path) = self.by_id.insert(id.clone(), path.clone()) {
            self.by_path.remove(&old_path);
        }
        self.by_path.insert(path, id);
        Ok(())
    }

    /// Returns the identifier watching `path`.
    #[must_use]
    pub fn resolve(&self, path: &Path) -> Option<&SecretId> {
        self.by_path.get(path)
    }

    /// Returns the file backing `id`.
    #[must_use]
    pub fn path_of(&self, id: &str) -> Option<&Path> {
        self.by_id.get(id).map(PathBuf::as_path)
    }

    /// Number of watched secrets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Returns true if nothing is watched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// A secret as it stands right after startup.
#[derive(Debug, Clone)]
pub struct InitialSecret {
    /// The identifier.
    pub id: SecretId,
    /// The initial slot content.
    pub slot: Slot,
    /// The resolved file, for watched secrets.
    pub watched_path: Option<PathBuf>,
}

impl InitialSecret {
    /// The directory holding the secret's file, for watched secrets.
    #[must_use]
    pub fn directory(&self) -> Option<&Path> {
        self.watched_path.as_deref().and_then(Path::parent)
    }
}

/// The outcome of resolving a configuration.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Path index for every watched secret.
    pub index: PathIndex,
    /// Directories to subscribe to, deduplicated.
    pub directories: BTreeSet<PathBuf>,
    /// Initial state of every configured secret.
    pub secrets: Vec<InitialSecret>,
}

/// Resolves paths and loads the initial value of every configured secret.
///
/// An explicit `value` wins over the file and is never trimmed. A missing or
/// unreadable file leaves the slot [`Slot::Unset`].
///
/// # Errors
///
/// Returns [`Error::DuplicatePath`] if two identifiers resolve to the same
/// file, or [`Error::InvalidConfig`] if a directory cannot be made absolute.
pub fn resolve(config: &SecretsConfig) -> Result<Resolution> {
    let mut resolution = Resolution::default();

    for (id, secret) in &config.secrets {
        let watched_path = match &secret.directory {
            Some(directory) => {
                let path = secret_path(directory, id)?;
                resolution.index.insert(id.clone(), path.clone())?;
                if let Some(parent) = path.parent() {
                    resolution.directories.insert(parent.to_path_buf());
                }
                Some(path)
            }
            None => None,
        };

        let slot = match (&secret.value, &watched_path) {
            (Some(value), _) => Slot::Value(Secret::new(value.as_str())),
            (None, Some(path)) => match load_file(path, config.trim_secrets) {
                Some(bytes) => Slot::Value(Secret::new(bytes)),
                None => Slot::Unset,
            },
            (None, None) => Slot::Unset,
        };

        resolution.secrets.push(InitialSecret {
            id: id.clone(),
            slot,
            watched_path,
        });
    }

    debug!(
        secrets = resolution.secrets.len(),
        watched = resolution.index.len(),
        directories = resolution.directories.len(),
        "resolved secret paths"
    );

    Ok(resolution)
}

/// Absolute, lexically normalized path of `id` inside `directory`.
///
/// A leading root in `id` is dropped, so the path always starts from
/// `directory`.
///
/// # Errors
///
/// Returns [`Error::InvalidConfig`] if the path cannot be made absolute.
pub fn secret_path(directory: &Path, id: &SecretId) -> Result<PathBuf> {
    let relative: PathBuf = Path::new(id.as_str())
        .components()
        .filter(|c| {
            matches!(
                c,
                Component::Normal(_) | Component::ParentDir | Component::CurDir
            )
        })
        .collect();
    let joined = directory.join(relative);
    let absolute = std::path::absolute(&joined).map_err(|e| Error::InvalidConfig {
        reason: format!("cannot resolve {}: {e}", joined.display()),
    })?;
    Ok(normalize(&absolute))
}

/// Folds `.` and `..` components without touching the filesystem.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Reads a secret file, trimming surrounding whitespace if asked to.
///
/// Trimming is byte-wise and ASCII-only: Unicode whitespace such as U+00A0
/// is kept. Returns `None` if the file cannot be read.
pub fn load_file(path: &Path, trim: bool) -> Option<SecretBytes> {
    let mut raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "secret file unreadable");
            return None;
        }
    };

    if !trim {
        return Some(SecretBytes::new(raw));
    }

    let trimmed = SecretBytes::from(raw.trim_ascii());
    raw.zeroize();
    Some(trimmed)
}
