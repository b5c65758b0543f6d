//! # Claw Secret Watch
//!
//! A file-backed secret cache for Clawbernetes workloads:
//!
//! - **Follows rotation on disk**: every watched secret lives at
//!   `directory/<identifier>` and is reloaded when the file changes
//! - **Erase-on-read**: a value is handed out once per rotation unless read
//!   with [`SecretStore::peek`]
//! - **Rotation callbacks**: run in isolation, so a slow or panicking
//!   callback never stalls the store
//! - **Telemetry**: every notification and rotation is reported to a
//!   pluggable [`Telemetry`] sink
//!
//! ## Example
//!
//! ```rust,no_run
//! use claw_secret_watch::{SecretConfig, SecretStore, SecretsConfig, StoreOptions};
//!
//! # async fn example() -> claw_secret_watch::Result<()> {
//! let config = SecretsConfig::new()
//!     .secret("db-password", SecretConfig::watched("/run/secrets"))?;
//!
//! let options = StoreOptions::new().on_rotate("db-password", |secret| {
//!     let _len = secret.expose().len();
//! });
//!
//! let store = SecretStore::start(config, options).await?;
//! let slot = store.get("db-password").await?;
//! # let _ = slot;
//! # Ok(())
//! # }
//! ```
//!
//! ## Security Considerations
//!
//! - Secret bytes use `zeroize` to clear memory on drop
//! - Stored and reloaded content is compared in constant time
//! - Debug output for secrets is redacted

pub mod compare;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod reconcile;
pub mod resolver;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod watcher;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::{Secret, SecretBytes, SecretId, SecretMetadata, SecretStatus, Slot, SlotState};

pub use config::{InitCallback, RotationCallback, SecretConfig, SecretsConfig, StoreOptions};

pub use event::{EventKind, FileEvent};

pub use reconcile::{Classification, IgnoreReason, Reconciler};

pub use resolver::PathIndex;

pub use dispatch::CallbackDispatcher;

pub use store::SecretStore;

pub use telemetry::{
    RecordingTelemetry, Telemetry, TelemetryEvent, TelemetryFilter, TelemetryRecord,
    TracingTelemetry,
};

pub use watcher::FsWatcher;
