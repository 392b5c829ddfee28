use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::registry::ConnectionRegistry;

/// Per-connection lifecycle: Alive -> (no activity within the timeout) ->
/// Stale -> evicted. The sweep bounds how long zombie connections can sit
/// in the registry after a client vanishes without a close frame.
pub struct HeartbeatMonitor {
    registry: Arc<ConnectionRegistry>,
    sweep_interval: Duration,
    connection_timeout: Duration,
}

impl HeartbeatMonitor {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        sweep_interval: Duration,
        connection_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            sweep_interval,
            connection_timeout,
        }
    }

    pub fn spawn(self, mut stop_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.sweep_interval);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                    _ = interval.tick() => {}
                }

                let stale = self
                    .registry
                    .stale_connections(self.connection_timeout)
                    .await;
                for id in stale {
                    info!(connection = %id, "Evicting unresponsive connection");
                    self.registry.close_connection(id).await;
                }

                let pinged = self.registry.ping_all().await;
                debug!(pinged, "Heartbeat sweep complete");
            }
            debug!("Heartbeat monitor stopped");
        })
    }
}
