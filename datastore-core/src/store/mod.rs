/*
    Store subsystem - typed single-value persistence

    Components:
    - engine.rs: DataStore, the per-file transaction and caching engine
    - registry.rs: one owner per store name, lifecycle and teardown
    - subscription.rs: bounded snapshot fan-out to observers
    - codec.rs / preferences.rs: value <-> bytes
    - atomic_file.rs: crash-safe file replacement
*/

pub mod atomic_file;
pub mod codec;
pub mod engine;
pub mod errors;
pub mod preferences;
pub mod registry;
pub mod snapshot;
pub mod subscription;

pub use atomic_file::{read_if_exists, write_atomic};
pub use codec::{BincodeCodec, Codec};
pub use engine::{CorruptionHandler, DataStore, StoreOptions, StoreState, StoreStats, UpdateTask};
pub use errors::*;
pub use preferences::{
    bool_key, double_key, float_key, int_key, long_key, string_key, string_set_key, Key,
    MutablePreferences, PreferenceType, PreferenceValue, Preferences, PreferencesCodec,
};
pub use registry::{DataStoreRegistry, PREFERENCES_SUFFIX};
pub use snapshot::Snapshot;
pub use subscription::{OverflowPolicy, RecvError, Subscription};
