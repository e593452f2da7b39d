//! Periodic cleanup of sessions whose transport has gone away without a close
//! event reaching the reader loop.

use std::time::Duration;
use tokio::task::JoinHandle;

use super::{EvictReason, Registry};

/// Spawn a background task that sweeps `registry` every `interval`.
pub fn spawn_session_sweeper(registry: Registry, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;

            let swept = sweep(&registry);
            if swept > 0 {
                tracing::info!("Session sweep: removed {} dead sessions", swept);
            } else {
                tracing::debug!("Session sweep: no dead sessions");
            }
        }
    })
}

/// One sweep pass. Returns how many connections were removed.
pub fn sweep(registry: &Registry) -> usize {
    let mut swept = 0;
    for connection in registry.all() {
        let id = connection.id();
        if connection.is_open() {
            if connection.outbound_closed() && registry.evict(&id, EvictReason::Swept) {
                swept += 1;
            }
        } else if registry.remove(&id).is_some() {
            // Closing elsewhere but still indexed
            tracing::debug!(connection_id = %id, state = ?connection.state(), "Removed stale entry");
            swept += 1;
        }
    }
    swept
}
