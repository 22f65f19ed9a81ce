//! Counter demo
//!
//! Reads a counter, increments it, and reads it back, once through a
//! key/value preference store and once through a typed settings store.
//! Run it twice to see the counters survive restarts.
//!
//! ```text
//! DATASTORE_DATA_DIR=/tmp/datastore-demo cargo run --example counter_demo
//! ```

use anyhow::{Context, Result};
use datastore_core::{
    init_logging_with_config, int_key, BincodeCodec, DataStoreConfig, DataStoreRegistry,
    LogConfig, RecvError,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Settings {
    example_counter: i32,
    kotlin_counter: i32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = DataStoreConfig::from_env().context("loading configuration")?;
    init_logging_with_config(LogConfig::try_from(&config.logging)?)?;
    datastore_core::metrics::init_metrics();

    info!(data_dir = %config.data_dir.display(), "Starting counter demo");
    let registry = DataStoreRegistry::new(config);

    // Key/value preferences
    let prefs = registry.open_preferences("pref_settings")?;
    let counter = int_key("counter_key");

    let current = prefs.read().await?;
    info!(counter = current.get(&counter).unwrap_or(0), "Read preference counter");

    tokio::time::sleep(Duration::from_millis(100)).await;

    let key = counter.clone();
    let updated = prefs
        .edit(move |p| {
            let next = p.get(&key).unwrap_or(0) + 1;
            p.set(&key, next);
        })
        .await?;
    info!(
        counter = updated.get(&counter).unwrap_or(0),
        version = updated.version(),
        "Incremented preference counter"
    );

    // Typed settings
    let settings = registry.open("proto_settings.pb", BincodeCodec::<Settings>::new())?;
    let mut changes = settings.subscribe().await?;

    let before = settings.read().await?;
    info!(kotlin_counter = before.kotlin_counter, "Read settings counter");

    settings
        .update(|s| Settings {
            kotlin_counter: s.kotlin_counter + 1,
            ..s.clone()
        })
        .await?;

    let after = settings.read().await?;
    info!(kotlin_counter = after.kotlin_counter, "Read settings counter back");

    for stats in registry.stats() {
        info!(?stats, "Store stats");
    }
    registry.close().await?;

    loop {
        match changes.recv().await {
            Ok(snapshot) => info!(
                version = snapshot.version(),
                kotlin_counter = snapshot.kotlin_counter,
                "Observed settings"
            ),
            Err(RecvError::Lagged(n)) => info!(skipped = n, "Observer fell behind"),
            Err(_) => break,
        }
    }
    Ok(())
}
