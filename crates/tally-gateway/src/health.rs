use std::time::Duration;

use tracing::{debug, info};

use crate::registry::Registry;

/// Background task that drops sockets with no sign of life.
///
/// Runs every `interval` and removes connections whose last heartbeat is
/// older than `timeout`. Dropping the registry's sender ends each socket's
/// outbound loop, which closes the socket.
pub async fn run_health_sweep(registry: Registry, interval: Duration, timeout: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        sweep_once(&registry, timeout).await;
    }
}

pub async fn sweep_once(registry: &Registry, timeout: Duration) -> usize {
    let removed = registry.sweep(timeout).await;
    for meta in &removed {
        debug!(
            "Sweep: {:?} connection {} ({}) in session {} went silent",
            meta.kind, meta.connection_id, meta.user_id, meta.session_id
        );
    }
    if !removed.is_empty() {
        info!("Sweep: dropped {} silent connections", removed.len());
    }
    removed.len()
}
