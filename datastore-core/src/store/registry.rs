/*
    registry.rs - Name -> store ownership

    A registry hands out at most one DataStore per name, so every file has
    exactly one in-memory owner. Stores live until the registry is closed.
*/

use crate::config::DataStoreConfig;
use crate::store::codec::Codec;
use crate::store::engine::{DataStore, StoreOptions, StoreStats};
use crate::store::errors::{DataStoreError, DataStoreResult};
use crate::store::preferences::PreferencesCodec;
use async_trait::async_trait;
use futures::future::join_all;
use std::any::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// File name suffix for stores opened with [`DataStoreRegistry::open_preferences`]
pub const PREFERENCES_SUFFIX: &str = ".preferences_pb";

/// Type-erased view of a store, used for teardown and stats
#[async_trait]
trait ManagedStore: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn stats(&self) -> StoreStats;
    async fn close(&self);
}

#[async_trait]
impl<C: Codec> ManagedStore for DataStore<C> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn stats(&self) -> StoreStats {
        DataStore::stats(self)
    }

    async fn close(&self) {
        DataStore::close(self).await
    }
}

/// Owner of every open store
pub struct DataStoreRegistry {
    config: DataStoreConfig,
    stores: Mutex<HashMap<String, Arc<dyn ManagedStore>>>,
    closed: AtomicBool,
}

impl DataStoreRegistry {
    pub fn new(config: DataStoreConfig) -> Self {
        DataStoreRegistry {
            config,
            stores: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Registry with default settings rooted at `data_dir`
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self::new(DataStoreConfig {
            data_dir: data_dir.into(),
            ..Default::default()
        })
    }

    pub fn config(&self) -> &DataStoreConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// Options derived from the registry configuration
    pub fn default_options<T>(&self) -> StoreOptions<T> {
        StoreOptions {
            subscriber_buffer: self.config.subscriber_buffer,
            overflow_policy: self.config.overflow_policy,
            corruption_handler: None,
        }
    }

    /// Open (or return the already open) store backed by `<data_dir>/<name>`
    ///
    /// When the store is already open, `codec` is discarded and the existing
    /// instance is returned.
    pub fn open<C: Codec>(&self, name: &str, codec: C) -> DataStoreResult<DataStore<C>> {
        self.open_with(name, codec, self.default_options())
    }

    /// Like [`DataStoreRegistry::open`] with explicit options
    ///
    /// Options only take effect when this call creates the store.
    pub fn open_with<C: Codec>(
        &self,
        name: &str,
        codec: C,
        options: StoreOptions<C::Value>,
    ) -> DataStoreResult<DataStore<C>> {
        validate_name(name)?;

        let mut stores = self.stores.lock().map_err(|_: PoisonError<_>| {
            DataStoreError::Internal("store registry lock poisoned".to_string())
        })?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(DataStoreError::Closed("registry".to_string()));
        }

        if let Some(existing) = stores.get(name) {
            return existing
                .as_any()
                .downcast_ref::<DataStore<C>>()
                .cloned()
                .ok_or_else(|| DataStoreError::TypeMismatch {
                    name: name.to_string(),
                });
        }

        let path = self.config.data_dir.join(name);
        debug!(store = name, path = %path.display(), "Opening store");
        let store = DataStore::new(name, path, codec, options);
        stores.insert(name.to_string(), Arc::new(store.clone()));
        Ok(store)
    }

    /// Open a typed key/value store backed by `<data_dir>/<name>.preferences_pb`
    pub fn open_preferences(&self, name: &str) -> DataStoreResult<DataStore<PreferencesCodec>> {
        self.open(&format!("{}{}", name, PREFERENCES_SUFFIX), PreferencesCodec)
    }

    /// Names of all open stores, sorted
    pub fn store_names(&self) -> Vec<String> {
        let stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = stores.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn stats(&self) -> Vec<StoreStats> {
        let stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stats: Vec<StoreStats> = stores.values().map(|s| s.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close every store: in-flight commits finish, subscriptions end, and
    /// later opens fail. Each store gets `close_timeout` to drain.
    ///
    /// All stores reject new work as soon as teardown starts. A store that
    /// does not drain in time stays registered, and calling `close` again
    /// waits for it once more.
    pub async fn close(&self) -> DataStoreResult<()> {
        let stores: Vec<(String, Arc<dyn ManagedStore>)> = {
            let mut stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
            self.closed.store(true, Ordering::SeqCst);
            stores.drain().collect()
        };
        if stores.is_empty() {
            return Ok(());
        }

        info!(stores = stores.len(), "Closing store registry");
        let timeout = self.config.close_timeout;
        let outcomes = join_all(stores.into_iter().map(|(name, store)| async move {
            let drained = tokio::time::timeout(timeout, store.close()).await.is_ok();
            (name, store, drained)
        }))
        .await;

        let mut pending = Vec::new();
        for (name, store, drained) in outcomes {
            if !drained {
                warn!(store = %name, timeout = ?timeout, "Timed out closing store");
                pending.push((name, store));
            }
        }

        let Some((first, _)) = pending.first() else {
            return Ok(());
        };
        let err = DataStoreError::Internal(format!("timed out closing store '{}'", first));
        self.stores
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(pending);
        Err(err)
    }
}

fn validate_name(name: &str) -> DataStoreResult<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if invalid {
        return Err(DataStoreError::InvalidName(name.to_string()));
    }
    Ok(())
}
