//! Background retention sweep for stored keys and used replay tokens.
//!
//! Spawns a tokio task that periodically deletes rows older than the
//! retention window. Failures are logged and never crash the server.

use std::sync::Arc;

use chrono::Duration;

use crate::clock::UtcInstant;
use crate::storage::KeyStore;

/// Spawn a background task that runs the retention sweep every
/// `interval_secs` seconds. Logs the number of purged rows each cycle.
pub fn spawn_retention_sweep(
    store: Arc<dyn KeyStore>,
    retention: Duration,
    interval_secs: u64,
) {
    let interval = std::time::Duration::from_secs(interval_secs);

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;

            let store = store.clone();
            match tokio::task::spawn_blocking(move || store.clean(retention, UtcInstant::now()))
                .await
            {
                Ok(Ok(count)) => {
                    if count > 0 {
                        tracing::info!("Retention sweep: purged {} expired keys", count);
                    } else {
                        tracing::debug!("Retention sweep: nothing to purge");
                    }
                }
                Ok(Err(e)) => {
                    tracing::error!("Retention sweep error: {}", e);
                }
                Err(e) => {
                    tracing::error!("Retention sweep task join error: {}", e);
                }
            }
        }
    });
}
