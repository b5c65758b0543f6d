//! Core types for the secret watcher.
//!
//! - [`SecretId`]: the caller-chosen name of a secret
//! - [`SecretBytes`]: raw secret content that zeroizes on drop
//! - [`Secret`]: an accessor that materializes the content on demand
//! - [`Slot`]: what a store holds for an identifier
//! - [`SecretMetadata`] / [`SecretStatus`]: value-free bookkeeping

use std::borrow::Borrow;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// The name of a secret.
///
/// Identifiers are opaque: for watched secrets they double as the file name
/// relative to the configured directory, so they may contain path
/// separators. They must be non-empty and free of NUL bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SecretId(String);

impl SecretId {
    /// Maximum length of a secret identifier (`PATH_MAX` on Linux).
    pub const MAX_LENGTH: usize = 4096;

    /// Creates a new `SecretId` after validating the input.
    ///
    /// # Errors
    ///
    /// Returns an error if the identifier is empty, too long or contains a
    /// NUL byte.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(Error::InvalidSecretId {
                reason: "identifier cannot be empty".to_string(),
            });
        }

        if id.len() > Self::MAX_LENGTH {
            return Err(Error::InvalidSecretId {
                reason: format!(
                    "identifier exceeds maximum length of {} bytes",
                    Self::MAX_LENGTH
                ),
            });
        }

        if id.contains('\0') {
            return Err(Error::InvalidSecretId {
                reason: "identifier cannot contain a NUL byte".to_string(),
            });
        }

        Ok(())
    }
}

impl fmt::Display for SecretId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl TryFrom<String> for SecretId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<&str> for SecretId {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl From<SecretId> for String {
    fn from(id: SecretId) -> Self {
        id.0
    }
}

impl AsRef<str> for SecretId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for SecretId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Raw secret content that securely zeroizes memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes {
    data: Vec<u8>,
}

impl SecretBytes {
    /// Wraps raw bytes.
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Returns the content as a byte slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Returns the content as UTF-8, if it is valid UTF-8.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    /// Returns the length of the content.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the content is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<Vec<u8>> for SecretBytes {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl From<&[u8]> for SecretBytes {
    fn from(data: &[u8]) -> Self {
        Self::new(data.to_vec())
    }
}

impl From<String> for SecretBytes {
    fn from(data: String) -> Self {
        Self::new(data.into_bytes())
    }
}

impl From<&str> for SecretBytes {
    fn from(data: &str) -> Self {
        Self::new(data.as_bytes().to_vec())
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never expose the actual bytes in debug output
        f.debug_struct("SecretBytes")
            .field("len", &self.data.len())
            .field("data", &"[REDACTED]")
            .finish()
    }
}

impl PartialEq for SecretBytes {
    fn eq(&self, other: &Self) -> bool {
        crate::compare::equal(&self.data, &other.data)
    }
}

impl Eq for SecretBytes {}

type AccessorFn = dyn Fn() -> SecretBytes + Send + Sync;

/// A deferred handle to a secret value.
///
/// The bytes live inside the accessor closure and are only materialized by
/// [`Secret::expose`]. Cloning a `Secret` clones the handle, not the bytes.
#[derive(Clone)]
pub struct Secret {
    accessor: Arc<AccessorFn>,
}

impl Secret {
    /// Creates an accessor that always yields a copy of `value`.
    #[must_use]
    pub fn new(value: impl Into<SecretBytes>) -> Self {
        let value = value.into();
        Self::from_fn(move || value.clone())
    }

    /// Creates an accessor from an arbitrary function.
    #[must_use]
    pub fn from_fn<F>(accessor: F) -> Self
    where
        F: Fn() -> SecretBytes + Send + Sync + 'static,
    {
        Self {
            accessor: Arc::new(accessor),
        }
    }

    /// Materializes the secret content.
    #[must_use]
    pub fn expose(&self) -> SecretBytes {
        (self.accessor)()
    }

    /// Returns true if both handles share the same accessor.
    #[must_use]
    pub fn same_accessor(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.accessor, &other.accessor)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([REDACTED])")
    }
}

/// The content of a store slot.
#[derive(Debug, Clone)]
pub enum Slot {
    /// The identifier is known but never received a value.
    Unset,
    /// A retrievable value.
    Value(Secret),
    /// The value was erased explicitly or by an erasing read.
    Erased,
}

impl Slot {
    /// Returns the value-free state of this slot.
    #[must_use]
    pub const fn state(&self) -> SlotState {
        match self {
            Self::Unset => SlotState::Unset,
            Self::Value(_) => SlotState::Present,
            Self::Erased => SlotState::Erased,
        }
    }

    /// Returns the accessor, if the slot holds one.
    #[must_use]
    pub const fn secret(&self) -> Option<&Secret> {
        match self {
            Self::Value(secret) => Some(secret),
            Self::Unset | Self::Erased => None,
        }
    }

    /// Consumes the slot, returning the accessor if there is one.
    #[must_use]
    pub fn into_secret(self) -> Option<Secret> {
        match self {
            Self::Value(secret) => Some(secret),
            Self::Unset | Self::Erased => None,
        }
    }

    /// Returns true if the slot has been erased.
    #[must_use]
    pub const fn is_erased(&self) -> bool {
        matches!(self, Self::Erased)
    }
}

/// The state of a slot, without its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    /// No value has been loaded yet.
    Unset,
    /// A value is available.
    Present,
    /// The value was erased.
    Erased,
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unset => f.pad("unset"),
            Self::Present => f.pad("present"),
            Self::Erased => f.pad("erased"),
        }
    }
}

/// Bookkeeping about a secret's value history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretMetadata {
    /// Number of values the slot has held; 0 if it never held one.
    pub version: u64,
    /// When the slot last received a value.
    pub updated_at: Option<DateTime<Utc>>,
}

impl SecretMetadata {
    /// Metadata for a slot that starts out with a value.
    #[must_use]
    pub fn loaded() -> Self {
        Self {
            version: 1,
            updated_at: Some(Utc::now()),
        }
    }

    /// Increments the version and updates the timestamp.
    pub fn bump_version(&mut self) {
        self.version += 1;
        self.updated_at = Some(Utc::now());
    }
}

/// A value-free summary of one secret in a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretStatus {
    /// The secret's identifier.
    pub id: SecretId,
    /// Current slot state.
    pub state: SlotState,
    /// The file backing the secret, if it is watched.
    pub watched_path: Option<PathBuf>,
    /// Value history.
    pub metadata: SecretMetadata,
}
