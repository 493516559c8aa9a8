//! Background purge of consumed notifications.
//!
//! Only entries that were acknowledged more than `retention_days` ago are
//! deleted. Unconsumed entries stay until their owner acknowledges them.

use std::sync::Arc;
use std::time::Duration;

use crate::store::{run_blocking, Store};

/// Spawn the retention task. Runs every `interval` and deletes consumed
/// entries older than `retention_days`.
pub fn spawn_retention_cleanup(store: Arc<dyn Store>, retention_days: u32, interval: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;

            let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(retention_days));
            match run_blocking(&store, move |store| store.purge_consumed(cutoff)).await {
                Ok(count) => {
                    if count > 0 {
                        tracing::info!("Purged {} consumed notifications", count);
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to purge consumed notifications: {}", e);
                }
            }
        }
    });
}
