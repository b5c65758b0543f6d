//! Error types for the secret watcher.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while building or querying a secret store.
///
/// Startup errors (`InvalidConfig`, `DuplicatePath`, `InitCallbackFailed`,
/// `Watch`) abort initialisation; no store is returned. At runtime only
/// `SecretNotFound`, `InvalidSecretId` and `StoreClosed` reach callers.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration was malformed or contained unknown options.
    #[error("invalid config: {reason}")]
    InvalidConfig {
        /// Why the configuration was rejected.
        reason: String,
    },

    /// Invalid secret identifier.
    #[error("invalid secret id: {reason}")]
    InvalidSecretId {
        /// The reason the identifier is invalid.
        reason: String,
    },

    /// Two identifiers resolve to the same file.
    #[error("secrets '{first}' and '{second}' both resolve to {}", path.display())]
    DuplicatePath {
        /// The shared absolute path.
        path: PathBuf,
        /// The identifier that claimed the path first.
        first: String,
        /// The identifier that collided with it.
        second: String,
    },

    /// Secret not found in the store.
    #[error("secret not found: {id}")]
    SecretNotFound {
        /// The identifier of the secret that was not found.
        id: String,
    },

    /// An init callback panicked during startup.
    #[error("init callback for secret '{id}' panicked")]
    InitCallbackFailed {
        /// The secret whose init callback failed.
        id: String,
    },

    /// The task owning the store is gone.
    #[error("secret store is closed")]
    StoreClosed,

    /// The filesystem watcher could not be set up.
    #[error("watch error: {reason}")]
    Watch {
        /// The reason the watcher failed.
        reason: String,
    },

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<notify::Error> for Error {
    fn from(err: notify::Error) -> Self {
        Self::Watch {
            reason: err.to_string(),
        }
    }
}

/// Result type alias for secret store operations.
pub type Result<T> = std::result::Result<T, Error>;
