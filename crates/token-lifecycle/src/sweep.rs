//! Background eviction of expired access tokens
//!
//! Reads already evict lazily, so this task never affects which token a
//! caller gets. It only bounds memory when many identities stop making
//! requests and their expired entries would otherwise stay in the map.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::manager::TokenLifecycleManager;

/// Spawn a task that sweeps the access token cache every `interval`.
///
/// Returns a `JoinHandle`; abort it to stop sweeping.
pub fn spawn_sweep_task(
    manager: Arc<TokenLifecycleManager>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick, the cache starts empty
        ticker.tick().await;

        loop {
            ticker.tick().await;
            sweep_cycle(&manager).await;
        }
    })
}

/// Run one sweep. Returns the number of entries evicted.
async fn sweep_cycle(manager: &TokenLifecycleManager) -> usize {
    let evicted = manager.access_tokens().sweep().await;
    if evicted > 0 {
        let remaining = manager.access_tokens().len().await;
        debug!(evicted, remaining, "swept expired access tokens");
    }
    evicted
}
