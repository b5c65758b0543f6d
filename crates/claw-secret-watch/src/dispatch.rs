//! Isolated, fire-and-forget execution of rotation callbacks.
//!
//! Each callback runs on tokio's blocking pool so a slow or hanging callback
//! never stalls the store. A small supervisor task waits for it and logs the
//! outcome; a panic stays inside the callback's task.

use std::time::Duration;

use tracing::{debug, warn};

use crate::config::RotationCallback;
use crate::types::{Secret, SecretId};

/// Spawns rotation callbacks.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallbackDispatcher {
    timeout: Option<Duration>,
}

impl CallbackDispatcher {
    /// A dispatcher that waits for callbacks indefinitely.
    #[must_use]
    pub const fn new() -> Self {
        Self { timeout: None }
    }

    /// A dispatcher whose supervisor gives up waiting after `timeout`.
    ///
    /// The callback itself keeps running; only the supervisor stops.
    #[must_use]
    pub const fn with_timeout(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    /// Runs `callback(secret)` in the background and returns immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn dispatch(&self, id: SecretId, secret: Secret, callback: RotationCallback) {
        let handle = tokio::task::spawn_blocking(move || callback(secret));
        let timeout = self.timeout;

        tokio::spawn(async move {
            let joined = match timeout {
                Some(limit) => match tokio::time::timeout(limit, handle).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!(
                            secret_name = %id,
                            timeout_ms = limit.as_millis(),
                            "rotation callback still running after timeout"
                        );
                        return;
                    }
                },
                None => handle.await,
            };

            match joined {
                Ok(()) => debug!(secret_name = %id, "rotation callback completed"),
                Err(e) if e.is_panic() => {
                    warn!(secret_name = %id, "rotation callback panicked");
                }
                Err(e) => warn!(secret_name = %id, error = %e, "rotation callback aborted"),
            }
        });
    }
}
