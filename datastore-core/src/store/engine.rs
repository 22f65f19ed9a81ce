/*
    engine.rs - Single-file transactional store

    One DataStore owns one file. All loads and commits for that file go
    through a per-store FIFO lock, so transactions observe a totally ordered
    sequence of snapshots. The cached snapshot always matches the last bytes
    successfully written (or the default if nothing was ever written).

    Store lifecycle:
    - Unloaded: nothing decoded yet; first read/update/subscribe loads
    - Loading:  a load is in flight under the store lock
    - Ready:    snapshot cached; reads never touch the disk
    - Faulted:  the file is corrupt; the error is cached until reset
    - Closed:   the owning registry shut the store down

    I/O failures during a load are transient and leave the store Unloaded, so
    the next call retries. Corruption is structural and is not retried.
*/

use crate::metrics::{
    record_counter, Timer, COMMITS, CORRUPTIONS, FAILED_TRANSACTIONS, FAILED_WRITES, LOADS,
    WRITE_DURATION,
};
use crate::store::atomic_file::{read_if_exists, write_atomic};
use crate::store::codec::Codec;
use crate::store::errors::{DataStoreError, DataStoreResult};
use crate::store::snapshot::Snapshot;
use crate::store::subscription::{OverflowPolicy, SubscriberRegistry, Subscription};
use std::convert::Infallible;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Helper to convert poison errors into DataStoreError
fn handle_poison<T>(_err: PoisonError<T>) -> DataStoreError {
    DataStoreError::Internal("Lock poisoned: a thread panicked while holding the lock".to_string())
}

/// Produces a replacement value when the store file turns out to be corrupt
pub type CorruptionHandler<T> = Arc<dyn Fn(&DataStoreError) -> T + Send + Sync>;

/// Per-store options
pub struct StoreOptions<T> {
    /// Capacity of each subscriber's buffer
    pub subscriber_buffer: usize,

    /// Default overflow policy for subscribers of this store
    pub overflow_policy: OverflowPolicy,

    /// Replace corrupt files instead of surfacing corruption
    pub corruption_handler: Option<CorruptionHandler<T>>,
}

impl<T> Default for StoreOptions<T> {
    fn default() -> Self {
        StoreOptions {
            subscriber_buffer: 16,
            overflow_policy: OverflowPolicy::DropOldest,
            corruption_handler: None,
        }
    }
}

impl<T> StoreOptions<T> {
    pub fn with_corruption_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&DataStoreError) -> T + Send + Sync + 'static,
    {
        self.corruption_handler = Some(Arc::new(handler));
        self
    }
}

impl<T> Clone for StoreOptions<T> {
    fn clone(&self) -> Self {
        StoreOptions {
            subscriber_buffer: self.subscriber_buffer,
            overflow_policy: self.overflow_policy,
            corruption_handler: self.corruption_handler.clone(),
        }
    }
}

impl<T> fmt::Debug for StoreOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreOptions")
            .field("subscriber_buffer", &self.subscriber_buffer)
            .field("overflow_policy", &self.overflow_policy)
            .field("corruption_handler", &self.corruption_handler.is_some())
            .finish()
    }
}

/// Externally visible lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    Unloaded,
    Loading,
    Ready,
    Faulted,
    Closed,
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub name: String,
    pub state: StoreState,
    /// Version of the cached snapshot, if one is loaded
    pub version: Option<u64>,
    /// Durable writes that completed
    pub writes: u64,
    pub failed_writes: u64,
    pub subscribers: usize,
}

enum LoadState<T> {
    Unloaded,
    Ready(Snapshot<T>),
    Faulted(DataStoreError),
    Closed,
}

struct CachedState<T> {
    load: LoadState<T>,
    last_version: Option<u64>,
}

impl<T> CachedState<T> {
    fn next_version(&self) -> u64 {
        self.last_version.map_or(0, |v| v + 1)
    }
}

struct Shared<C: Codec> {
    name: String,
    path: PathBuf,
    codec: C,
    corruption_handler: Option<CorruptionHandler<C::Value>>,
    state: RwLock<CachedState<C::Value>>,
    /// Serializes loads and commits; tokio's mutex is FIFO
    write_lock: Arc<tokio::sync::Mutex<()>>,
    subscribers: Arc<Mutex<SubscriberRegistry<C::Value>>>,
    loading: AtomicBool,
    /// Set as soon as teardown begins; new work is rejected from then on
    closing: AtomicBool,
    writes: AtomicU64,
    failed_writes: AtomicU64,
}

/// Handle to a single-file store; clones share the same store
pub struct DataStore<C: Codec> {
    shared: Arc<Shared<C>>,
}

impl<C: Codec> Clone for DataStore<C> {
    fn clone(&self) -> Self {
        DataStore {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Codec> fmt::Debug for DataStore<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataStore")
            .field("name", &self.shared.name)
            .field("path", &self.shared.path)
            .finish()
    }
}

impl<C: Codec> DataStore<C> {
    /// Stores are created through a registry so one file has one owner.
    pub(crate) fn new(
        name: impl Into<String>,
        path: PathBuf,
        codec: C,
        options: StoreOptions<C::Value>,
    ) -> Self {
        let name = name.into();
        let subscribers =
            SubscriberRegistry::new(name.clone(), options.subscriber_buffer, options.overflow_policy);
        DataStore {
            shared: Arc::new(Shared {
                name,
                path,
                codec,
                corruption_handler: options.corruption_handler,
                state: RwLock::new(CachedState {
                    load: LoadState::Unloaded,
                    last_version: None,
                }),
                write_lock: Arc::new(tokio::sync::Mutex::new(())),
                subscribers: Arc::new(Mutex::new(subscribers)),
                loading: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                writes: AtomicU64::new(0),
                failed_writes: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Current snapshot, loading from disk on first access
    pub async fn read(&self) -> DataStoreResult<Snapshot<C::Value>> {
        if let Some(snapshot) = self.shared.cached()? {
            return Ok(snapshot);
        }
        let _guard = self.shared.write_lock.lock().await;
        self.shared.ensure_loaded().await
    }

    /// Apply `transform` to the current value and persist the result
    pub async fn update<F>(&self, transform: F) -> DataStoreResult<Snapshot<C::Value>>
    where
        F: FnOnce(&C::Value) -> C::Value + Send + 'static,
    {
        self.try_update(move |current| Ok::<_, Infallible>(transform(current)))
            .await
    }

    /// Like [`DataStore::update`], but the transaction may fail
    ///
    /// Dropping the returned future before the store lock is acquired cancels
    /// the update. Once the transaction has started, the commit finishes in
    /// the background regardless.
    pub async fn try_update<F, E>(&self, transform: F) -> DataStoreResult<Snapshot<C::Value>>
    where
        F: FnOnce(&C::Value) -> Result<C::Value, E> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        self.shared.ensure_open()?;
        let guard = Arc::clone(&self.shared.write_lock).lock_owned().await;

        let shared = Arc::clone(&self.shared);
        let commit = tokio::spawn(async move { shared.commit(guard, transform).await });
        commit
            .await
            .map_err(|e| DataStoreError::Internal(format!("update task failed: {}", e)))?
    }

    /// Run an update in the background
    ///
    /// The returned task can be cancelled until its transaction starts.
    pub fn submit_update<F>(&self, transform: F) -> UpdateTask<C::Value>
    where
        F: FnOnce(&C::Value) -> C::Value + Send + 'static,
    {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let shared = Arc::clone(&self.shared);

        let handle = tokio::spawn(async move {
            shared.ensure_open()?;
            let guard = tokio::select! {
                biased;
                _ = cancelled.cancelled() => {
                    debug!(store = %shared.name, "Update cancelled before start");
                    return Err(DataStoreError::Cancelled);
                }
                guard = Arc::clone(&shared.write_lock).lock_owned() => guard,
            };
            if cancelled.is_cancelled() {
                return Err(DataStoreError::Cancelled);
            }
            shared
                .commit(guard, move |current| Ok::<_, Infallible>(transform(current)))
                .await
        });

        UpdateTask { handle, token }
    }

    /// Stream of the current snapshot followed by every later commit
    pub async fn subscribe(&self) -> DataStoreResult<Subscription<C::Value>> {
        self.subscribe_inner(None).await
    }

    /// Subscribe with an overflow policy other than the store default
    pub async fn subscribe_with_policy(
        &self,
        policy: OverflowPolicy,
    ) -> DataStoreResult<Subscription<C::Value>> {
        self.subscribe_inner(Some(policy)).await
    }

    async fn subscribe_inner(
        &self,
        policy: Option<OverflowPolicy>,
    ) -> DataStoreResult<Subscription<C::Value>> {
        loop {
            self.read().await?;

            // Commits publish while holding the state write lock, so registering
            // under the read lock cannot miss or duplicate a snapshot.
            let state = self.shared.state.read().map_err(handle_poison)?;
            match &state.load {
                LoadState::Ready(current) => {
                    return Ok(SubscriberRegistry::register(
                        &self.shared.subscribers,
                        current.clone(),
                        policy,
                    ))
                }
                LoadState::Faulted(err) => return Err(err.clone()),
                LoadState::Closed => return Err(self.shared.closed_error()),
                // reset() ran after the load; load again
                LoadState::Unloaded => continue,
            }
        }
    }

    /// Drop the cached snapshot or fault; the next access re-reads the file
    pub async fn reset(&self) -> DataStoreResult<()> {
        self.shared.ensure_open()?;
        let _guard = self.shared.write_lock.lock().await;
        self.shared.ensure_open()?;
        let mut state = self.shared.state.write().map_err(handle_poison)?;
        info!(store = %self.shared.name, "Resetting store");
        state.load = LoadState::Unloaded;
        Ok(())
    }

    /// Overwrite the store with `value`, regardless of what is on disk
    pub async fn reset_to(&self, value: C::Value) -> DataStoreResult<Snapshot<C::Value>> {
        self.shared.ensure_open()?;
        let guard = Arc::clone(&self.shared.write_lock).lock_owned().await;
        let shared = Arc::clone(&self.shared);
        let install = tokio::spawn(async move {
            let _guard = guard;
            shared.ensure_open()?;
            shared.persist(&value).await?;
            shared.install(value)
        });
        install
            .await
            .map_err(|e| DataStoreError::Internal(format!("reset task failed: {}", e)))?
    }

    /// Reject further calls, wait for in-flight work, then end subscriptions
    ///
    /// New operations fail with `Closed` as soon as this is called. The
    /// teardown itself finishes in the background even if the returned
    /// future is dropped.
    pub async fn close(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        if let Err(e) = tokio::spawn(async move { shared.close().await }).await {
            error!(store = %self.shared.name, error = %e, "Close task failed");
        }
    }

    pub fn stats(&self) -> StoreStats {
        self.shared.stats()
    }
}

impl<C: Codec> Shared<C> {
    fn closed_error(&self) -> DataStoreError {
        DataStoreError::Closed(self.name.clone())
    }

    fn ensure_open(&self) -> DataStoreResult<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(self.closed_error());
        }
        match self.state.read().map_err(handle_poison)?.load {
            LoadState::Closed => Err(self.closed_error()),
            _ => Ok(()),
        }
    }

    /// Fast path: cached snapshot, cached fault, or `None` if a load is needed
    fn cached(&self) -> DataStoreResult<Option<Snapshot<C::Value>>> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(self.closed_error());
        }
        let state = self.state.read().map_err(handle_poison)?;
        match &state.load {
            LoadState::Ready(snapshot) => Ok(Some(snapshot.clone())),
            LoadState::Faulted(err) => Err(err.clone()),
            LoadState::Closed => Err(self.closed_error()),
            LoadState::Unloaded => Ok(None),
        }
    }

    /// Must be called with the write lock held
    async fn ensure_loaded(&self) -> DataStoreResult<Snapshot<C::Value>> {
        if let Some(snapshot) = self.cached()? {
            return Ok(snapshot);
        }

        self.loading.store(true, Ordering::SeqCst);
        let result = self.load().await;
        self.loading.store(false, Ordering::SeqCst);
        result
    }

    async fn load(&self) -> DataStoreResult<Snapshot<C::Value>> {
        let path = self.path.clone();
        let bytes = tokio::task::spawn_blocking(move || read_if_exists(&path))
            .await
            .map_err(|e| DataStoreError::Internal(format!("load task failed: {}", e)))?;
        record_counter(LOADS, &self.name, 1);

        let value = match bytes {
            Ok(None) => {
                debug!(store = %self.name, path = %self.path.display(), "No store file, using default");
                self.codec.default_value()
            }
            Ok(Some(bytes)) => match self.codec.decode(&bytes) {
                Ok(value) => value,
                Err(e) => {
                    let err = DataStoreError::corruption(&self.path, e);
                    record_counter(CORRUPTIONS, &self.name, 1);
                    return self.recover_corruption(err).await;
                }
            },
            Err(e) => {
                // Transient: stay Unloaded so the next call retries.
                let err = DataStoreError::io(&self.path, &e);
                error!(store = %self.name, error = %err, "Failed to read store file");
                return Err(err);
            }
        };

        let snapshot = self.install(value)?;
        debug!(store = %self.name, version = snapshot.version(), "Store loaded");
        Ok(snapshot)
    }

    async fn recover_corruption(&self, err: DataStoreError) -> DataStoreResult<Snapshot<C::Value>> {
        let Some(handler) = self.corruption_handler.clone() else {
            error!(store = %self.name, error = %err, "Store file is corrupt");
            self.state.write().map_err(handle_poison)?.load = LoadState::Faulted(err.clone());
            return Err(err);
        };

        warn!(store = %self.name, error = %err, "Store file is corrupt, replacing it");
        let replacement = handler(&err);
        self.persist(&replacement).await?;
        self.install(replacement)
    }

    /// Run a transaction and commit its result; `guard` is the write lock
    async fn commit<F, E>(
        &self,
        guard: OwnedMutexGuard<()>,
        transform: F,
    ) -> DataStoreResult<Snapshot<C::Value>>
    where
        F: FnOnce(&C::Value) -> Result<C::Value, E>,
        E: fmt::Display,
    {
        let _guard = guard;
        let current = self.ensure_loaded().await?;

        let next = match transform(current.value()) {
            Ok(next) => next,
            Err(e) => {
                let err = DataStoreError::transaction(e);
                warn!(store = %self.name, version = current.version(), error = %err, "Transaction failed");
                record_counter(FAILED_TRANSACTIONS, &self.name, 1);
                return Err(err);
            }
        };

        self.persist(&next).await?;
        let snapshot = self.install(next)?;
        debug!(store = %self.name, version = snapshot.version(), "Committed");
        record_counter(COMMITS, &self.name, 1);
        Ok(snapshot)
    }

    /// Encode and durably write `value`; the cache is untouched on failure
    async fn persist(&self, value: &C::Value) -> DataStoreResult<()> {
        let bytes = self
            .codec
            .encode(value)
            .map_err(|e| DataStoreError::Serialization(e.to_string()))?;

        let timer = Timer::new(WRITE_DURATION, self.name.as_str());
        let path = self.path.clone();
        let written = tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|e| DataStoreError::Internal(format!("write task failed: {}", e)))?;

        match written {
            Ok(()) => {
                self.writes.fetch_add(1, Ordering::SeqCst);
                timer.stop();
                Ok(())
            }
            Err(e) => {
                self.failed_writes.fetch_add(1, Ordering::SeqCst);
                record_counter(FAILED_WRITES, &self.name, 1);
                let err = DataStoreError::io(&self.path, &e);
                error!(store = %self.name, error = %err, "Failed to persist store");
                Err(err)
            }
        }
    }

    /// Make `value` the current snapshot and notify subscribers
    fn install(&self, value: C::Value) -> DataStoreResult<Snapshot<C::Value>> {
        let mut state = self.state.write().map_err(handle_poison)?;
        if let LoadState::Closed = state.load {
            return Err(self.closed_error());
        }
        let snapshot = Snapshot::new(state.next_version(), value);
        state.last_version = Some(snapshot.version());
        state.load = LoadState::Ready(snapshot.clone());

        self.subscribers
            .lock()
            .map_err(handle_poison)?
            .publish(&snapshot);
        Ok(snapshot)
    }

    async fn close(&self) {
        let _guard = self.write_lock.lock().await;
        match self.state.write() {
            Ok(mut state) => state.load = LoadState::Closed,
            Err(poisoned) => poisoned.into_inner().load = LoadState::Closed,
        }
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .close_all();
        info!(store = %self.name, "Store closed");
    }

    fn stats(&self) -> StoreStats {
        let (state, version) = match self.state.read() {
            Ok(guard) => {
                let state = match &guard.load {
                    _ if self.closing.load(Ordering::SeqCst) => StoreState::Closed,
                    LoadState::Unloaded if self.loading.load(Ordering::SeqCst) => StoreState::Loading,
                    LoadState::Unloaded => StoreState::Unloaded,
                    LoadState::Ready(_) => StoreState::Ready,
                    LoadState::Faulted(_) => StoreState::Faulted,
                    LoadState::Closed => StoreState::Closed,
                };
                let version = match &guard.load {
                    LoadState::Ready(snapshot) => Some(snapshot.version()),
                    _ => None,
                };
                (state, version)
            }
            Err(_) => (StoreState::Faulted, None),
        };

        StoreStats {
            name: self.name.clone(),
            state,
            version,
            writes: self.writes.load(Ordering::SeqCst),
            failed_writes: self.failed_writes.load(Ordering::SeqCst),
            subscribers: self
                .subscribers
                .lock()
                .map(|registry| registry.len())
                .unwrap_or(0),
        }
    }
}

/// Background update submitted with [`DataStore::submit_update`]
pub struct UpdateTask<T> {
    handle: tokio::task::JoinHandle<DataStoreResult<Snapshot<T>>>,
    token: CancellationToken,
}

impl<T> UpdateTask<T> {
    /// Cancel the update if its transaction has not started yet
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the outcome; `Cancelled` if cancel() won the race
    pub async fn join(self) -> DataStoreResult<Snapshot<T>> {
        self.handle
            .await
            .map_err(|e| DataStoreError::Internal(format!("update task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::codec::BincodeCodec;
    use crate::store::subscription::RecvError;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;
    use tempfile::tempdir;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Counter {
        value: i64,
    }

    fn open(dir: &Path) -> DataStore<BincodeCodec<Counter>> {
        DataStore::new(
            "counter",
            dir.join("counter.pb"),
            BincodeCodec::new(),
            StoreOptions::default(),
        )
    }

    fn on_disk(store: &DataStore<BincodeCodec<Counter>>) -> Counter {
        let bytes = std::fs::read(store.path()).unwrap();
        BincodeCodec::<Counter>::new().decode(&bytes).unwrap()
    }

    fn increment(c: &Counter) -> Counter {
        Counter { value: c.value + 1 }
    }

    #[tokio::test]
    async fn test_read_missing_file_uses_default_without_writing() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        let snapshot = store.read().await.unwrap();

        assert_eq!(snapshot.value(), &Counter::default());
        assert_eq!(snapshot.version(), 0);
        assert!(!store.path().exists());
        assert_eq!(store.stats().state, StoreState::Ready);
        assert_eq!(store.stats().writes, 0);
    }

    #[tokio::test]
    async fn test_two_increments_two_writes() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        store.update(increment).await.unwrap();
        let snapshot = store.update(increment).await.unwrap();

        assert_eq!(snapshot.value, 2);
        assert_eq!(snapshot.version(), 2);
        assert_eq!(store.stats().writes, 2);
        assert_eq!(on_disk(&store), Counter { value: 2 });
    }

    #[tokio::test]
    async fn test_failed_transaction_changes_nothing() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        store.update(increment).await.unwrap();
        let before = std::fs::read(store.path()).unwrap();

        let err = store
            .try_update(|_| Err::<Counter, _>("refused"))
            .await
            .unwrap_err();

        assert!(matches!(err, DataStoreError::Transaction { .. }));
        assert_eq!(store.read().await.unwrap().value, 1);
        assert_eq!(std::fs::read(store.path()).unwrap(), before);
        assert_eq!(store.stats().writes, 1);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_surfaced_and_cached() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        std::fs::write(store.path(), b"not a frame").unwrap();

        let err = store.read().await.unwrap_err();
        assert!(err.is_corruption());
        assert_eq!(store.stats().state, StoreState::Faulted);

        // Fixing the file alone is not enough; the fault is structural.
        std::fs::write(store.path(), BincodeCodec::new().encode(&Counter { value: 9 }).unwrap())
            .unwrap();
        assert!(store.read().await.unwrap_err().is_corruption());
        assert!(store.update(increment).await.unwrap_err().is_corruption());

        store.reset().await.unwrap();
        assert_eq!(store.read().await.unwrap().value, 9);
    }

    #[tokio::test]
    async fn test_reset_to_overwrites_corrupt_file() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        std::fs::write(store.path(), b"garbage").unwrap();
        assert!(store.read().await.is_err());

        let snapshot = store.reset_to(Counter { value: 5 }).await.unwrap();

        assert_eq!(snapshot.value, 5);
        assert_eq!(on_disk(&store), Counter { value: 5 });
        assert_eq!(store.update(increment).await.unwrap().value, 6);
    }

    #[tokio::test]
    async fn test_corruption_handler_replaces_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("counter.pb");
        std::fs::write(&path, b"garbage").unwrap();
        let store = DataStore::new(
            "counter",
            path,
            BincodeCodec::<Counter>::new(),
            StoreOptions::default().with_corruption_handler(|_| Counter { value: -1 }),
        );

        assert_eq!(store.read().await.unwrap().value, -1);
        assert_eq!(on_disk(&store), Counter { value: -1 });
        assert_eq!(store.stats().writes, 1);
    }

    #[tokio::test]
    async fn test_io_failure_does_not_advance_snapshot() {
        let dir = tempdir().unwrap();
        // A directory at the store path makes the rename fail.
        let path = dir.path().join("counter.pb");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("child"), b"x").unwrap();
        let store = DataStore::new("counter", path, BincodeCodec::<Counter>::new(), StoreOptions::default());

        // Reading a directory is itself an I/O error: transient, not cached.
        assert!(store.read().await.unwrap_err().is_retriable());
        assert_eq!(store.stats().state, StoreState::Unloaded);

        std::fs::remove_dir_all(store.path()).unwrap();
        assert_eq!(store.read().await.unwrap().value, 0);

        std::fs::create_dir(store.path()).unwrap();
        std::fs::write(store.path().join("child"), b"x").unwrap();
        let err = store.update(increment).await.unwrap_err();
        assert!(err.is_retriable());
        assert_eq!(store.read().await.unwrap().value, 0);
        assert_eq!(store.stats().failed_writes, 1);
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_latest_then_next() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        for _ in 0..3 {
            store.update(increment).await.unwrap();
        }

        let mut sub = store.subscribe().await.unwrap();
        assert_eq!(sub.recv().await.unwrap().value, 3);

        store.update(increment).await.unwrap();
        let next = sub.recv().await.unwrap();
        assert_eq!(next.value, 4);
        assert_eq!(next.version(), 4);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions_and_rejects_updates() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let mut sub = store.subscribe().await.unwrap();
        sub.recv().await.unwrap();

        store.close().await;

        assert_eq!(sub.recv().await.unwrap_err(), RecvError::Closed);
        assert!(matches!(
            store.update(increment).await,
            Err(DataStoreError::Closed(_))
        ));
        assert!(matches!(store.read().await, Err(DataStoreError::Closed(_))));
        assert_eq!(store.stats().state, StoreState::Closed);
    }

    #[tokio::test]
    async fn test_close_rejects_new_work_while_commit_in_flight() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let mut sub = store.subscribe().await.unwrap();
        sub.recv().await.unwrap();

        // Holding the lock stands in for a long-running commit.
        let guard = Arc::clone(&store.shared.write_lock).lock_owned().await;
        let closer = store.clone();
        let closing = tokio::spawn(async move { closer.close().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(matches!(store.read().await, Err(DataStoreError::Closed(_))));
        assert!(matches!(
            store.update(increment).await,
            Err(DataStoreError::Closed(_))
        ));
        assert!(matches!(store.reset().await, Err(DataStoreError::Closed(_))));
        assert_eq!(store.stats().state, StoreState::Closed);

        drop(guard);
        closing.await.unwrap();
        assert_eq!(sub.recv().await.unwrap_err(), RecvError::Closed);
    }

    #[tokio::test]
    async fn test_close_completes_after_caller_stops_waiting() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let mut sub = store.subscribe().await.unwrap();
        sub.recv().await.unwrap();

        let guard = Arc::clone(&store.shared.write_lock).lock_owned().await;
        let waited = tokio::time::timeout(Duration::from_millis(10), store.close()).await;
        assert!(waited.is_err());
        drop(guard);

        let ended = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap();
        assert_eq!(ended.unwrap_err(), RecvError::Closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_subscribe_races_reset() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        store.update(increment).await.unwrap();

        for _ in 0..200 {
            let resetting = store.clone();
            let reset = tokio::spawn(async move { resetting.reset().await });
            let mut sub = store.subscribe().await.unwrap();
            reset.await.unwrap().unwrap();
            assert_eq!(sub.recv().await.unwrap().value, 1);
        }
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        // Hold the lock so the submitted update cannot start.
        let guard = Arc::clone(&store.shared.write_lock).lock_owned().await;
        let task = store.submit_update(increment);
        tokio::time::sleep(Duration::from_millis(20)).await;
        task.cancel();
        drop(guard);

        assert!(matches!(task.join().await, Err(DataStoreError::Cancelled)));
        assert_eq!(store.read().await.unwrap().value, 0);
        assert_eq!(store.stats().writes, 0);
    }

    #[tokio::test]
    async fn test_dropped_update_future_still_commits_once_started() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();

        let pending = store.clone();
        let fut = async move {
            pending
                .update(move |c| {
                    let _ = started_tx.send(());
                    increment(c)
                })
                .await
        };
        let handle = tokio::spawn(fut);
        started_rx.await.unwrap();
        handle.abort();

        // The commit runs to completion in its own task.
        let mut snapshot = store.read().await.unwrap();
        for _ in 0..50 {
            if snapshot.value == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            snapshot = store.read().await.unwrap();
        }
        assert_eq!(snapshot.value, 1);
        assert_eq!(on_disk(&store), Counter { value: 1 });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_are_serialized() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.update(increment).await }));
        }
        let mut versions = Vec::new();
        for handle in handles {
            versions.push(handle.await.unwrap().unwrap().version());
        }
        versions.sort_unstable();

        assert_eq!(versions, (1..=20).collect::<Vec<u64>>());
        assert_eq!(store.read().await.unwrap().value, 20);
        assert_eq!(store.stats().writes, 20);
        assert_eq!(on_disk(&store), Counter { value: 20 });
    }
}
