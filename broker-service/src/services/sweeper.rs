//! Periodic maintenance sweep.
//!
//! The only background task: prunes expired revocation entries, elapsed
//! grace keys, and expired refresh records. Idempotent, so any single
//! instance may run it without cross-instance coordination.

use std::sync::Arc;
use std::time::Duration;

use crate::services::keys::KeyRing;
use crate::services::revocation::RevocationIndex;
use crate::services::store::BrokerStore;

pub fn spawn_sweeper(
    store: Arc<dyn BrokerStore>,
    revocations: Arc<dyn RevocationIndex>,
    keyring: Arc<KeyRing>,
    interval_seconds: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_seconds.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so startup stays quiet.
        interval.tick().await;

        loop {
            interval.tick().await;

            match revocations.purge_expired().await {
                Ok(purged) if purged > 0 => {
                    tracing::debug!(purged = purged, "Pruned expired revocation entries")
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Revocation purge failed"),
            }

            match store.purge_expired_refresh().await {
                Ok(purged) if purged > 0 => {
                    tracing::debug!(purged = purged, "Pruned expired refresh records")
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Refresh purge failed"),
            }

            match keyring.prune_expired() {
                Ok(pruned) if pruned > 0 => {
                    tracing::info!(pruned = pruned, "Pruned retired signing keys")
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Key pruning failed"),
            }
        }
    })
}
