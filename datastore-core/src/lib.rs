//! Durable, transactional storage for a single typed value per file.
//!
//! A [`DataStoreRegistry`] owns one [`DataStore`] per name. Each store loads
//! its file lazily, serializes read-modify-write transactions, persists every
//! commit atomically, and publishes committed [`Snapshot`]s to subscribers.
//!
//! ```no_run
//! use datastore_core::{int_key, BincodeCodec, DataStoreRegistry};
//!
//! # async fn demo() -> Result<(), datastore_core::DataStoreError> {
//! let registry = DataStoreRegistry::with_data_dir("/tmp/app");
//!
//! let counter = registry.open("counter.pb", BincodeCodec::<u64>::new())?;
//! counter.update(|n| n + 1).await?;
//!
//! let prefs = registry.open_preferences("settings")?;
//! let key = int_key("launches");
//! prefs.edit(move |p| p.set(&key, p.get(&key).unwrap_or(0) + 1)).await?;
//!
//! registry.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod logging;
pub mod metrics;
pub mod store;

pub use config::{ConfigError, DataStoreConfig, LoggingConfig};
pub use logging::{init_logging, init_logging_with_config, LogConfig, LogLevel, LoggingError};
pub use store::{
    bool_key, double_key, float_key, int_key, long_key, string_key, string_set_key,
    BincodeCodec, Codec, CodecError, CorruptionHandler, DataStore, DataStoreError,
    DataStoreRegistry, DataStoreResult, Key, MutablePreferences, OverflowPolicy,
    PreferenceValue, Preferences, PreferencesCodec, RecvError, Snapshot, StoreOptions,
    StoreState, StoreStats, Subscription, UpdateTask,
};
