//! Store configuration.
//!
//! The serializable part ([`SecretsConfig`]) is loaded from JSON and rejects
//! unknown keys. Callbacks and the telemetry sink cannot be serialized and
//! are attached through [`StoreOptions`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::telemetry::{Telemetry, TracingTelemetry};
use crate::types::{Secret, SecretId};

/// Called with the new value after every confirmed rotation.
pub type RotationCallback = Arc<dyn Fn(Secret) + Send + Sync>;

/// Called once at startup with the initially loaded watched value.
pub type InitCallback = Arc<dyn Fn(Secret) + Send + Sync>;

const fn default_trim_secrets() -> bool {
    true
}

/// Per-secret options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecretConfig {
    /// Watch `directory/<identifier>` for this secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
    /// Explicit initial value; wins over file content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl SecretConfig {
    /// A secret backed by a file in `directory`.
    #[must_use]
    pub fn watched(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: Some(directory.into()),
            value: None,
        }
    }

    /// A secret held only in memory.
    #[must_use]
    pub fn in_memory(value: impl Into<String>) -> Self {
        Self {
            directory: None,
            value: Some(value.into()),
        }
    }

    /// Sets an explicit initial value.
    #[must_use]
    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }
}

/// The serializable store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecretsConfig {
    /// Strip surrounding whitespace from file content.
    #[serde(default = "default_trim_secrets")]
    pub trim_secrets: bool,
    /// Stop waiting for a rotation callback after this many milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_timeout_ms: Option<u64>,
    /// Secrets by identifier.
    #[serde(default)]
    pub secrets: BTreeMap<SecretId, SecretConfig>,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            trim_secrets: default_trim_secrets(),
            callback_timeout_ms: None,
            secrets: BTreeMap::new(),
        }
    }
}

impl SecretsConfig {
    /// Creates an empty configuration with default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] on malformed JSON, unknown keys or
    /// invalid identifiers.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::InvalidConfig {
            reason: e.to_string(),
        })
    }

    /// Reads and parses a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the file cannot be read, or
    /// [`Error::InvalidConfig`] if it cannot be parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Adds or replaces a secret.
    ///
    /// # Errors
    ///
    /// Returns an error if the identifier is invalid.
    pub fn secret(mut self, id: impl Into<String>, config: SecretConfig) -> Result<Self> {
        self.secrets.insert(SecretId::new(id)?, config);
        Ok(self)
    }

    /// Sets whether file content is trimmed.
    #[must_use]
    pub fn trim_secrets(mut self, trim: bool) -> Self {
        self.trim_secrets = trim;
        self
    }

    /// Bounds how long the dispatcher waits for a rotation callback.
    #[must_use]
    pub fn callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// The configured callback timeout, if any.
    #[must_use]
    pub fn callback_timeout_duration(&self) -> Option<Duration> {
        self.callback_timeout_ms.map(Duration::from_millis)
    }
}

/// Runtime options that cannot come from a config file.
#[derive(Clone)]
pub struct StoreOptions {
    pub(crate) on_rotate: HashMap<String, RotationCallback>,
    pub(crate) on_init: HashMap<String, InitCallback>,
    pub(crate) telemetry: Arc<dyn Telemetry>,
    pub(crate) watch_filesystem: bool,
}

impl StoreOptions {
    /// Options with no callbacks, `tracing` telemetry and filesystem
    /// watching enabled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            on_rotate: HashMap::new(),
            on_init: HashMap::new(),
            telemetry: Arc::new(TracingTelemetry),
            watch_filesystem: true,
        }
    }

    /// Registers the rotation callback for a secret.
    #[must_use]
    pub fn on_rotate<F>(mut self, id: impl Into<String>, callback: F) -> Self
    where
        F: Fn(Secret) + Send + Sync + 'static,
    {
        self.on_rotate.insert(id.into(), Arc::new(callback));
        self
    }

    /// Registers the startup callback for a watched secret.
    #[must_use]
    pub fn on_init<F>(mut self, id: impl Into<String>, callback: F) -> Self
    where
        F: Fn(Secret) + Send + Sync + 'static,
    {
        self.on_init.insert(id.into(), Arc::new(callback));
        self
    }

    /// Replaces the telemetry sink.
    #[must_use]
    pub fn telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Enables or disables the built-in filesystem watcher.
    ///
    /// With watching disabled, notifications must be fed in through
    /// [`crate::SecretStore::notify`].
    #[must_use]
    pub fn watch_filesystem(mut self, enabled: bool) -> Self {
        self.watch_filesystem = enabled;
        self
    }

    /// Checks that every callback refers to a configured secret.
    pub(crate) fn validate_against(&self, config: &SecretsConfig) -> Result<()> {
        let unknown = self
            .on_rotate
            .keys()
            .chain(self.on_init.keys())
            .find(|id| !config.secrets.contains_key(id.as_str()));

        match unknown {
            Some(id) => Err(Error::InvalidConfig {
                reason: format!("callback registered for unknown secret '{id}'"),
            }),
            None => Ok(()),
        }
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreOptions")
            .field("on_rotate", &self.on_rotate.keys().collect::<Vec<_>>())
            .field("on_init", &self.on_init.keys().collect::<Vec<_>>())
            .field("watch_filesystem", &self.watch_filesystem)
            .finish_non_exhaustive()
    }
}
