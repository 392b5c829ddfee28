use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use chrono::Utc;
use futures_util::StreamExt;
use launchpad_common::{AppError, FanoutMessage, RedisPool, BROADCAST_SCOPE};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::registry::ConnectionRegistry;

const FANOUT_CHANNEL_CAPACITY: usize = 1024;

/// The shared bus every instance publishes to and consumes from.
#[async_trait]
pub trait FanoutTransport: Send + Sync {
    async fn publish(&self, message: &FanoutMessage) -> Result<(), AppError>;

    /// Open this instance's consumer stream. Every published message comes
    /// back here, including the publisher's own.
    async fn subscribe(&self) -> Result<mpsc::Receiver<FanoutMessage>, AppError>;
}

/// Redis pub/sub transport; the production fleet runs on this.
pub struct RedisFanout {
    pool: Arc<RedisPool>,
}

impl RedisFanout {
    pub fn new(pool: Arc<RedisPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FanoutTransport for RedisFanout {
    async fn publish(&self, message: &FanoutMessage) -> Result<(), AppError> {
        self.pool.publish_fanout(message).await
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<FanoutMessage>, AppError> {
        // The first subscribe happens inline so a broken Redis surfaces at
        // startup instead of silently dropping broadcasts.
        let mut pubsub = self.pool.subscribe_fanout().await?;
        let pool = Arc::clone(&self.pool);
        let (tx, rx) = mpsc::channel(FANOUT_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut reconnect = ExponentialBackoff {
                initial_interval: Duration::from_secs(1),
                max_interval: Duration::from_secs(30),
                max_elapsed_time: None,
                ..Default::default()
            };

            loop {
                {
                    let mut stream = pubsub.on_message();
                    while let Some(msg) = stream.next().await {
                        let payload: String = match msg.get_payload() {
                            Ok(payload) => payload,
                            Err(e) => {
                                warn!("Unreadable fanout payload: {}", e);
                                continue;
                            }
                        };
                        match serde_json::from_str::<FanoutMessage>(&payload) {
                            Ok(message) => {
                                reconnect.reset();
                                if tx.send(message).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => warn!("Discarding malformed fanout message: {}", e),
                        }
                    }
                }

                if tx.is_closed() {
                    return;
                }
                let delay = reconnect
                    .next_backoff()
                    .unwrap_or(Duration::from_secs(30));
                warn!("Fanout subscription lost; reconnecting in {:?}", delay);
                tokio::time::sleep(delay).await;
                match pool.subscribe_fanout().await {
                    Ok(new_pubsub) => pubsub = new_pubsub,
                    Err(e) => error!("Fanout resubscribe failed: {}", e),
                }
            }
        });

        Ok(rx)
    }
}

/// In-process transport for single-node runs and tests. Same contract as
/// Redis: publishers hear their own messages back.
pub struct LocalFanout {
    sender: broadcast::Sender<FanoutMessage>,
}

impl LocalFanout {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(FANOUT_CHANNEL_CAPACITY);
        Self { sender }
    }
}

impl Default for LocalFanout {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FanoutTransport for LocalFanout {
    async fn publish(&self, message: &FanoutMessage) -> Result<(), AppError> {
        // No subscribers yet is not a failure.
        let _ = self.sender.send(message.clone());
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<FanoutMessage>, AppError> {
        let mut bus_rx = self.sender.subscribe();
        let (tx, rx) = mpsc::channel(FANOUT_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            loop {
                match bus_rx.recv().await {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Local fanout consumer lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }
}

/// Publishes room notifications to the shared bus and feeds received ones
/// back into the local registry. Local delivery also rides the bus: every
/// instance, the publisher included, delivers what it receives.
pub struct FanoutBus {
    transport: Arc<dyn FanoutTransport>,
}

impl FanoutBus {
    pub fn new(transport: Arc<dyn FanoutTransport>) -> Self {
        Self { transport }
    }

    /// Best-effort publish: a failure is logged and surfaced to the
    /// caller; nothing at this layer retries.
    pub async fn publish(&self, room: &str, payload: Value) -> Result<(), AppError> {
        let message = FanoutMessage {
            room: room.to_string(),
            payload,
            timestamp: Utc::now(),
        };
        self.transport.publish(&message).await.map_err(|e| {
            warn!("Fanout publish to {} failed: {}", room, e);
            e
        })
    }

    /// Consume the bus and deliver into this instance's registry.
    pub async fn start_listener(
        &self,
        registry: Arc<ConnectionRegistry>,
        mut stop_rx: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, AppError> {
        let mut messages = self.transport.subscribe().await?;
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                    received = messages.recv() => match received {
                        Some(message) => {
                            if message.room == BROADCAST_SCOPE {
                                registry.deliver_all(&message.payload, None).await;
                            } else {
                                registry.deliver(&message.room, &message.payload, None).await;
                            }
                        }
                        None => {
                            warn!("Fanout stream ended; no further cross-instance delivery");
                            break;
                        }
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message;

    async fn expect_text(rx: &mut UnboundedReceiver<Message>) -> Value {
        let message = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("message should arrive")
            .expect("channel should stay open");
        match message {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn publish_on_one_instance_delivers_on_every_instance() {
        let transport = Arc::new(LocalFanout::new());
        let registry_a = Arc::new(ConnectionRegistry::new());
        let registry_b = Arc::new(ConnectionRegistry::new());
        let bus_a = FanoutBus::new(transport.clone());
        let bus_b = FanoutBus::new(transport.clone());

        let (_stop_tx, stop_rx) = watch::channel(false);
        bus_a
            .start_listener(Arc::clone(&registry_a), stop_rx.clone())
            .await
            .unwrap();
        bus_b
            .start_listener(Arc::clone(&registry_b), stop_rx.clone())
            .await
            .unwrap();

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let (tx_other, mut rx_other) = mpsc::unbounded_channel();
        let a = registry_a.register(tx_a, None).await;
        let b = registry_b.register(tx_b, None).await;
        let other = registry_b.register(tx_other, None).await;
        registry_a.join_room(a, "token_events").await;
        registry_b.join_room(b, "token_events").await;
        registry_b.join_room(other, "price_updates").await;

        bus_a
            .publish("token_events", json!({"type": "token_event", "data": {}}))
            .await
            .unwrap();

        // The publisher's own instance and the peer instance both deliver.
        let seen_a = expect_text(&mut rx_a).await;
        let seen_b = expect_text(&mut rx_b).await;
        assert_eq!(seen_a["type"], "token_event");
        assert_eq!(seen_b["type"], "token_event");
        // Members of other rooms hear nothing.
        assert!(rx_other.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_scope_reaches_every_connection() {
        let transport = Arc::new(LocalFanout::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let bus = FanoutBus::new(transport);

        let (_stop_tx, stop_rx) = watch::channel(false);
        bus.start_listener(Arc::clone(&registry), stop_rx)
            .await
            .unwrap();

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = registry.register(tx_a, None).await;
        let _b = registry.register(tx_b, None).await;
        registry.join_room(a, "token_events").await;

        bus.publish(BROADCAST_SCOPE, json!({"type": "system_notification"}))
            .await
            .unwrap();

        assert_eq!(expect_text(&mut rx_a).await["type"], "system_notification");
        assert_eq!(expect_text(&mut rx_b).await["type"], "system_notification");
    }

    #[tokio::test]
    async fn listener_stops_on_shutdown_signal() {
        let transport = Arc::new(LocalFanout::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let bus = FanoutBus::new(transport);

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = bus
            .start_listener(Arc::clone(&registry), stop_rx)
            .await
            .unwrap();

        stop_tx.send(true).unwrap();
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("listener should stop")
            .unwrap();
    }
}
