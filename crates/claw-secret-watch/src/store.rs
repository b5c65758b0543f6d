//! The secret store and the task that owns it.
//!
//! All state lives in one tokio task. [`SecretStore`] is a cheap, cloneable
//! handle that talks to that task over a channel, so lookups, writes and
//! file notifications are applied one at a time in arrival order without
//! any locking. Rotation callbacks run elsewhere (see [`crate::dispatch`]).

use std::collections::{BTreeSet, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::{InitCallback, RotationCallback, SecretsConfig, StoreOptions};
use crate::dispatch::CallbackDispatcher;
use crate::error::{Error, Result};
use crate::event::FileEvent;
use crate::reconcile::{Classification, Reconciler};
use crate::resolver::{self, InitialSecret};
use crate::telemetry::{Telemetry, TelemetryEvent};
use crate::types::{Secret, SecretId, SecretMetadata, SecretStatus, Slot};
use crate::watcher::FsWatcher;

/// Capacity of the request channel into the owning task.
pub const COMMAND_BUFFER: usize = 256;

enum Command {
    Get {
        id: String,
        erase: bool,
        reply: oneshot::Sender<Result<Slot>>,
    },
    Put {
        id: SecretId,
        secret: Secret,
        reply: oneshot::Sender<()>,
    },
    Erase {
        id: String,
        reply: oneshot::Sender<()>,
    },
    List {
        reply: oneshot::Sender<Vec<SecretStatus>>,
    },
    FileEvent(FileEvent),
}

struct SecretRecord {
    slot: Slot,
    callback: Option<RotationCallback>,
    metadata: SecretMetadata,
}

/// State owned exclusively by the store task.
struct StoreState {
    records: HashMap<SecretId, SecretRecord>,
    reconciler: Reconciler,
    dispatcher: CallbackDispatcher,
    telemetry: Arc<dyn Telemetry>,
}

impl StoreState {
    fn handle(&mut self, command: Command) {
        match command {
            Command::Get { id, erase, reply } => {
                let _ = reply.send(self.get(&id, erase));
            }
            Command::Put { id, secret, reply } => {
                self.put(id, secret);
                let _ = reply.send(());
            }
            Command::Erase { id, reply } => {
                self.erase(&id);
                let _ = reply.send(());
            }
            Command::List { reply } => {
                let _ = reply.send(self.list());
            }
            Command::FileEvent(event) => self.reconcile(&event),
        }
    }

    fn get(&mut self, id: &str, erase: bool) -> Result<Slot> {
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| Error::SecretNotFound { id: id.to_string() })?;

        if erase && matches!(record.slot, Slot::Value(_)) {
            debug!(secret_name = %id, "secret read and erased");
            return Ok(std::mem::replace(&mut record.slot, Slot::Erased));
        }

        Ok(record.slot.clone())
    }

    fn put(&mut self, id: SecretId, secret: Secret) {
        let record = self.records.entry(id).or_insert_with(|| SecretRecord {
            slot: Slot::Unset,
            callback: None,
            metadata: SecretMetadata::default(),
        });
        record.slot = Slot::Value(secret);
        record.metadata.bump_version();
    }

    fn erase(&mut self, id: &str) {
        if let Some(record) = self.records.get_mut(id) {
            record.slot = Slot::Erased;
            debug!(secret_name = %id, "secret erased");
        }
    }

    fn list(&self) -> Vec<SecretStatus> {
        let mut statuses: Vec<SecretStatus> = self
            .records
            .iter()
            .map(|(id, record)| SecretStatus {
                id: id.clone(),
                state: record.slot.state(),
                watched_path: self
                    .reconciler
                    .index()
                    .path_of(id.as_str())
                    .map(PathBuf::from),
                metadata: record.metadata.clone(),
            })
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    fn reconcile(&mut self, event: &FileEvent) {
        emit(self.telemetry.as_ref(), &TelemetryEvent::file_event(event));

        let records = &self.records;
        let classification = self
            .reconciler
            .classify(event, |id| records.get(id).map(|record| &record.slot));

        match classification {
            Classification::Ignore(reason) => {
                if reason.is_unwatched() {
                    emit(self.telemetry.as_ref(), &TelemetryEvent::unwatched(event));
                }
                debug!(path = %event.path.display(), reason = %reason, "no rotation");
            }
            Classification::Changed { id, secret } => self.rotate(id, secret),
        }
    }

    fn rotate(&mut self, id: SecretId, secret: Secret) {
        let Some(record) = self.records.get_mut(&id) else {
            warn!(secret_name = %id, "indexed secret has no record");
            return;
        };

        record.slot = Slot::Value(secret.clone());
        record.metadata.bump_version();
        info!(secret_name = %id, version = record.metadata.version, "secret rotated");
        emit(
            self.telemetry.as_ref(),
            &TelemetryEvent::ChangedSecret {
                secret_name: id.clone(),
            },
        );

        if let Some(callback) = &record.callback {
            self.dispatcher.dispatch(id, secret, Arc::clone(callback));
        }
    }
}

/// Emits `event`, containing a panicking sink so the store keeps running.
fn emit(telemetry: &dyn Telemetry, event: &TelemetryEvent) {
    if catch_unwind(AssertUnwindSafe(|| telemetry.emit(event))).is_err() {
        warn!(event = event.name(), "telemetry sink panicked");
    }
}

async fn run(mut state: StoreState, mut rx: mpsc::Receiver<Command>) {
    while let Some(command) = rx.recv().await {
        state.handle(command);
    }
    debug!("secret store stopped");
}

/// Runs the init callback of a freshly loaded watched secret.
fn run_init_callback(secret: &InitialSecret, callback: &InitCallback) -> Result<()> {
    let Some(value) = secret.slot.secret() else {
        return Ok(());
    };

    catch_unwind(AssertUnwindSafe(|| callback(value.clone()))).map_err(
        |_| Error::InitCallbackFailed {
            id: secret.id.to_string(),
        },
    )
}

/// Handle to a running secret store.
///
/// Cloning the handle is cheap; the store stops once every handle is
/// dropped.
#[derive(Clone)]
pub struct SecretStore {
    tx: mpsc::Sender<Command>,
    directories: Arc<BTreeSet<PathBuf>>,
    watcher: Option<Arc<FsWatcher>>,
}

impl SecretStore {
    /// Resolves `config`, loads every secret and starts the owning task.
    ///
    /// Init callbacks run synchronously before this returns. Must be called
    /// from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, two secrets resolve
    /// to the same file, an init callback panics, or the watcher cannot
    /// subscribe to a directory. No store is started in that case.
    pub async fn start(config: SecretsConfig, options: StoreOptions) -> Result<Self> {
        options.validate_against(&config)?;
        let resolution = resolver::resolve(&config)?;

        let StoreOptions {
            mut on_rotate,
            on_init,
            telemetry,
            watch_filesystem,
        } = options;

        let mut records = HashMap::with_capacity(resolution.secrets.len());
        for secret in resolution.secrets {
            if let Some(directory) = secret.directory() {
                emit(
                    telemetry.as_ref(),
                    &TelemetryEvent::InitialLoading {
                        secret_name: secret.id.clone(),
                        directory: directory.to_path_buf(),
                    },
                );

                if let Some(callback) = on_init.get(secret.id.as_str()) {
                    run_init_callback(&secret, callback)?;
                }
            }

            let metadata = match secret.slot {
                Slot::Value(_) => SecretMetadata::loaded(),
                Slot::Unset | Slot::Erased => SecretMetadata::default(),
            };
            let callback = on_rotate.remove(secret.id.as_str());
            records.insert(
                secret.id,
                SecretRecord {
                    slot: secret.slot,
                    callback,
                    metadata,
                },
            );
        }

        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);

        let watcher = if watch_filesystem && !resolution.directories.is_empty() {
            let events = tx.clone();
            let watcher = FsWatcher::watch(&resolution.directories, move |event| {
                if events.blocking_send(Command::FileEvent(event)).is_err() {
                    debug!("secret store gone, dropping file event");
                }
            })?;
            Some(Arc::new(watcher))
        } else {
            None
        };

        info!(
            secrets = records.len(),
            watched = resolution.index.len(),
            directories = resolution.directories.len(),
            watching = watcher.is_some(),
            "secret store started"
        );

        let state = StoreState {
            records,
            reconciler: Reconciler::new(resolution.index, config.trim_secrets),
            dispatcher: CallbackDispatcher::with_timeout(config.callback_timeout_duration()),
            telemetry,
        };
        tokio::spawn(run(state, rx));

        Ok(Self {
            tx,
            directories: Arc::new(resolution.directories),
            watcher,
        })
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| Error::StoreClosed)?;
        response.await.map_err(|_| Error::StoreClosed)
    }

    /// Returns the current slot of `id` and erases a present value.
    ///
    /// A value is therefore handed out once per rotation or `put`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SecretNotFound`] if `id` is unknown.
    pub async fn get(&self, id: &str) -> Result<Slot> {
        self.lookup(id, true).await
    }

    /// Returns the current slot of `id` without erasing it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SecretNotFound`] if `id` is unknown.
    pub async fn peek(&self, id: &str) -> Result<Slot> {
        self.lookup(id, false).await
    }

    /// Returns the current slot of `id`, erasing a present value if `erase`.
    ///
    /// The read and the erasure happen in one step of the owning task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SecretNotFound`] if `id` is unknown.
    pub async fn lookup(&self, id: &str, erase: bool) -> Result<Slot> {
        let id = id.to_string();
        self.request(|reply| Command::Get { id, erase, reply })
            .await?
    }

    /// Stores an in-memory value under `id`, creating the slot if needed.
    ///
    /// Does not change which secrets are watched: a watched secret keeps
    /// following its file.
    ///
    /// # Errors
    ///
    /// Returns an error if `id` is not a valid identifier.
    pub async fn put(&self, id: &str, secret: Secret) -> Result<()> {
        let id = SecretId::new(id)?;
        self.request(|reply| Command::Put { id, secret, reply })
            .await
    }

    /// Erases the value of `id`. Unknown identifiers are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreClosed`] if the store has stopped.
    pub async fn erase(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.request(|reply| Command::Erase { id, reply }).await
    }

    /// Lists every secret with its state, never its value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreClosed`] if the store has stopped.
    pub async fn list(&self) -> Result<Vec<SecretStatus>> {
        self.request(|reply| Command::List { reply }).await
    }

    /// Feeds a file notification to the store.
    ///
    /// Returns once the notification is queued; requests sent afterwards
    /// observe its effect.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreClosed`] if the store has stopped.
    pub async fn notify(&self, event: FileEvent) -> Result<()> {
        self.tx
            .send(Command::FileEvent(event))
            .await
            .map_err(|_| Error::StoreClosed)
    }

    /// Directories the store watches.
    #[must_use]
    pub fn watched_directories(&self) -> &BTreeSet<PathBuf> {
        &self.directories
    }

    /// Returns true if the built-in filesystem watcher is running.
    #[must_use]
    pub fn is_watching(&self) -> bool {
        self.watcher.is_some()
    }
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStore")
            .field("directories", &self.directories)
            .field("watching", &self.watcher.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecretConfig;
    use crate::event::EventKind;
    use crate::telemetry::RecordingTelemetry;
    use crate::types::SlotState;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn value_of(slot: &Slot) -> Option<String> {
        slot.secret()
            .and_then(|s| s.expose().as_str().map(ToString::to_string))
    }

    fn options() -> StoreOptions {
        StoreOptions::new().watch_filesystem(false)
    }

    async fn in_memory_store(pairs: &[(&str, &str)]) -> SecretStore {
        let config = pairs.iter().fold(SecretsConfig::new(), |config, (id, value)| {
            config
                .secret(*id, SecretConfig::in_memory(*value))
                .expect("valid id")
        });
        SecretStore::start(config, options()).await.expect("start")
    }

    #[tokio::test]
    async fn get_erases_by_default() {
        let store = in_memory_store(&[("token", "initial")]).await;

        let first = store.get("token").await.expect("known secret");
        assert_eq!(value_of(&first).as_deref(), Some("initial"));

        let second = store.get("token").await.expect("known secret");
        assert!(second.is_erased());
    }

    #[tokio::test]
    async fn peek_keeps_value() {
        let store = in_memory_store(&[("token", "initial")]).await;

        for _ in 0..3 {
            let slot = store.peek("token").await.expect("known secret");
            assert_eq!(value_of(&slot).as_deref(), Some("initial"));
        }
    }

    #[tokio::test]
    async fn get_unknown_is_not_found() {
        let store = in_memory_store(&[]).await;

        let result = store.get("missing").await;
        assert!(matches!(result, Err(Error::SecretNotFound { .. })));
    }

    #[tokio::test]
    async fn erase_unknown_is_noop() {
        let store = in_memory_store(&[]).await;

        store.erase("missing").await.expect("no-op");
        assert!(matches!(
            store.get("missing").await,
            Err(Error::SecretNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn unset_slot_stays_unset_on_get() {
        let config = SecretsConfig::new()
            .secret("later", SecretConfig::default())
            .expect("valid id");
        let store = SecretStore::start(config, options()).await.expect("start");

        assert!(matches!(store.get("later").await, Ok(Slot::Unset)));
        assert!(matches!(store.get("later").await, Ok(Slot::Unset)));
    }

    #[tokio::test]
    async fn put_rejects_invalid_id() {
        let store = in_memory_store(&[]).await;
        let result = store.put("", Secret::new("x")).await;
        assert!(matches!(result, Err(Error::InvalidSecretId { .. })));
    }

    #[tokio::test]
    async fn list_reports_state_and_versions() {
        let store = in_memory_store(&[("a", "1"), ("b", "2")]).await;
        store.erase("b").await.expect("erase");
        store.put("c", Secret::new("3")).await.expect("put");
        store.put("c", Secret::new("4")).await.expect("put");

        let statuses = store.list().await.expect("list");
        let summary: Vec<(&str, SlotState, u64)> = statuses
            .iter()
            .map(|s| (s.id.as_str(), s.state, s.metadata.version))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("a", SlotState::Present, 1),
                ("b", SlotState::Erased, 1),
                ("c", SlotState::Present, 2),
            ]
        );
        assert!(statuses.iter().all(|s| s.watched_path.is_none()));
    }

    #[tokio::test]
    async fn rotation_updates_and_dispatches() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("token");
        std::fs::write(&path, "v1").expect("write");

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let telemetry = Arc::new(RecordingTelemetry::new());
        let config = SecretsConfig::new()
            .secret("token", SecretConfig::watched(dir.path()))
            .expect("valid id");
        let options = options()
            .telemetry(telemetry.clone())
            .on_rotate("token", move |secret| {
                let _ = tx.send(secret.expose().as_str().map(ToString::to_string));
            });
        let store = SecretStore::start(config, options).await.expect("start");

        std::fs::write(&path, "v2").expect("write");
        store
            .notify(FileEvent::new(&path, [EventKind::Modified]))
            .await
            .expect("notify");

        let slot = store.peek("token").await.expect("known");
        assert_eq!(value_of(&slot).as_deref(), Some("v2"));

        let delivered = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("callback runs")
            .expect("channel open");
        assert_eq!(delivered.as_deref(), Some("v2"));

        assert_eq!(telemetry.count("initial_loading"), 1);
        assert_eq!(telemetry.count("file_event"), 1);
        assert_eq!(telemetry.count("changed_secret"), 1);

        let statuses = store.list().await.expect("list");
        assert_eq!(statuses[0].metadata.version, 2);
        assert_eq!(statuses[0].watched_path.as_deref(), Some(path.as_path()));
    }

    #[tokio::test]
    async fn init_callback_receives_loaded_value() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("token"), " boot \n").expect("write");

        let seen = Arc::new(std::sync::Mutex::new(None));
        let sink = Arc::clone(&seen);
        let config = SecretsConfig::new()
            .secret("token", SecretConfig::watched(dir.path()))
            .expect("valid id");
        let options = options().on_init("token", move |secret| {
            *sink
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) =
                secret.expose().as_str().map(ToString::to_string);
        });

        let _store = SecretStore::start(config, options).await.expect("start");

        let seen = seen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        assert_eq!(seen.as_deref(), Some("boot"));
    }

    #[tokio::test]
    async fn init_callback_does_not_run_on_rotation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("token");
        std::fs::write(&path, "v1").expect("write");

        let inits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&inits);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let config = SecretsConfig::new()
            .secret("token", SecretConfig::watched(dir.path()))
            .expect("valid id");
        let options = options()
            .on_init("token", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .on_rotate("token", move |_| {
                let _ = tx.send(());
            });
        let store = SecretStore::start(config, options).await.expect("start");
        assert_eq!(inits.load(Ordering::SeqCst), 1);

        std::fs::write(&path, "v2").expect("write");
        store
            .notify(FileEvent::new(&path, [EventKind::Modified]))
            .await
            .expect("notify");
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("rotation callback runs")
            .expect("channel open");

        let slot = store.peek("token").await.expect("known");
        assert_eq!(value_of(&slot).as_deref(), Some("v2"));
        assert_eq!(inits.load(Ordering::SeqCst), 1);
    }

    // ========================================================================
    // Failure Containment Tests
    // ========================================================================

    struct PanickingTelemetry;

    impl Telemetry for PanickingTelemetry {
        #[allow(clippy::panic)]
        fn emit(&self, _event: &TelemetryEvent) {
            panic!("telemetry failure");
        }
    }

    #[tokio::test]
    async fn panicking_telemetry_keeps_store_running() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("token");
        std::fs::write(&path, "v1").expect("write");

        let config = SecretsConfig::new()
            .secret("token", SecretConfig::watched(dir.path()))
            .expect("valid id");
        let options = options().telemetry(Arc::new(PanickingTelemetry));
        let store = SecretStore::start(config, options).await.expect("start");

        std::fs::write(&path, "v2").expect("write");
        store
            .notify(FileEvent::new(&path, [EventKind::Modified]))
            .await
            .expect("notify");
        store
            .notify(FileEvent::new(dir.path().join("stray"), [EventKind::Removed]))
            .await
            .expect("notify");

        let slot = store.peek("token").await.expect("store still running");
        assert_eq!(value_of(&slot).as_deref(), Some("v2"));
    }

    #[tokio::test]
    #[allow(clippy::panic)]
    async fn panicking_stored_accessor_keeps_store_running() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("token");
        std::fs::write(&path, "v1").expect("write");

        let config = SecretsConfig::new()
            .secret("token", SecretConfig::watched(dir.path()))
            .expect("valid id");
        let store = SecretStore::start(config, options()).await.expect("start");

        store
            .put("token", Secret::from_fn(|| panic!("accessor failure")))
            .await
            .expect("put");
        store
            .notify(FileEvent::new(&path, [EventKind::Modified]))
            .await
            .expect("notify");

        let slot = store.peek("token").await.expect("store still running");
        assert_eq!(value_of(&slot).as_deref(), Some("v1"));
    }

    #[tokio::test]
    #[allow(clippy::panic)]
    async fn panicking_init_callback_aborts_startup() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("token"), "boot").expect("write");

        let config = SecretsConfig::new()
            .secret("token", SecretConfig::watched(dir.path()))
            .expect("valid id");
        let options = options().on_init("token", |_| panic!("init failure"));

        let result = SecretStore::start(config, options).await;
        assert!(matches!(result, Err(Error::InitCallbackFailed { .. })));
    }

    #[tokio::test]
    async fn callbacks_for_unknown_secrets_are_rejected() {
        let options = options().on_rotate("ghost", |_| {});
        let result = SecretStore::start(SecretsConfig::new(), options).await;
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[tokio::test]
    async fn debug_does_not_leak_values() {
        let store = in_memory_store(&[("token", "hunter2")]).await;
        let debug = format!("{store:?}");
        assert!(debug.contains("SecretStore"));
        assert!(!debug.contains("hunter2"));
    }
}
