use async_trait::async_trait;
use launchpad_common::{
    spawn_metric, token_room, AppError, ChainEventKind, MetricsSink, NormalizedEvent, Notification,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::fanout::FanoutBus;
use crate::provider::ProviderPool;
use crate::queue::BatchHandler;

/// Maps normalized chain events to client notifications and pushes them
/// onto the fanout bus. Handlers are retried wholesale with their batch,
/// so everything here tolerates running more than once per event.
pub struct DomainEventHandlers {
    pool: Arc<ProviderPool>,
    fanout: Arc<FanoutBus>,
    metrics: Arc<dyn MetricsSink>,
    price_query_timeout: Duration,
}

impl DomainEventHandlers {
    pub fn new(
        pool: Arc<ProviderPool>,
        fanout: Arc<FanoutBus>,
        metrics: Arc<dyn MetricsSink>,
        price_query_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            fanout,
            metrics,
            price_query_timeout,
        }
    }

    /// Derive the notifications for one event. An empty result means the
    /// event is filtered (untracked transfer), not failed.
    pub async fn handle(&self, event: &NormalizedEvent) -> Vec<Notification> {
        let token_rooms = vec![
            token_room(&event.token_address),
            "token_events".to_string(),
        ];

        match event.kind {
            ChainEventKind::TokenCreated => {
                vec![token_event(&token_rooms, event, event.fields.clone())]
            }
            ChainEventKind::TokenPurchased | ChainEventKind::TokenSold => {
                let amount = event
                    .fields
                    .get("amount")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0);
                let price = self.current_price(&event.token_address).await;
                let value = amount * price;
                self.record_volume(value);

                let mut data = event.fields.clone();
                data["price"] = json!(price);
                data["value"] = json!(value);

                vec![
                    token_event(&token_rooms, event, data),
                    Notification {
                        rooms: vec!["price_updates".to_string()],
                        payload: json!({
                            "type": "price_update",
                            "data": {
                                "tokenAddress": event.token_address,
                                "price": price,
                                "change24h": serde_json::Value::Null,
                                "timestamp": event.observed_at.timestamp_millis(),
                            }
                        }),
                    },
                    transaction_update(event),
                ]
            }
            ChainEventKind::TradingEnabled => {
                vec![token_event(&token_rooms, event, json!({}))]
            }
            ChainEventKind::Transfer => {
                // Transfers of tokens the platform does not track are
                // dropped; a failed check counts as untracked and must not
                // block the rest of the batch.
                if !self.token_is_tracked(&event.token_address).await {
                    return Vec::new();
                }
                vec![
                    token_event(&token_rooms, event, event.fields.clone()),
                    transaction_update(event),
                ]
            }
        }
    }

    async fn process_event(&self, event: &NormalizedEvent) -> Result<(), AppError> {
        let notifications = self.handle(event).await;
        if notifications.is_empty() {
            return Ok(());
        }

        for notification in &notifications {
            for room in &notification.rooms {
                self.fanout
                    .publish(room, notification.payload.clone())
                    .await?;
            }
        }

        let metrics = Arc::clone(&self.metrics);
        spawn_metric(async move { metrics.increment("events_processed").await });
        let metrics = Arc::clone(&self.metrics);
        let counter = format!("events_{}", event.kind.as_str());
        spawn_metric(async move { metrics.increment(&counter).await });

        Ok(())
    }

    fn record_volume(&self, value: f64) {
        let metrics = Arc::clone(&self.metrics);
        spawn_metric(async move { metrics.add("trade_volume", value).await });
    }

    /// Contract read with its own timeout; any failure falls back to 0 so
    /// a flaky read path never blocks trade notifications.
    async fn current_price(&self, token_address: &str) -> f64 {
        let provider = self.pool.active();
        match tokio::time::timeout(
            self.price_query_timeout,
            provider.query_token_price(token_address),
        )
        .await
        {
            Ok(Ok(price)) => price,
            Ok(Err(e)) => {
                warn!("Price lookup failed for {}: {}", token_address, e);
                0.0
            }
            Err(_) => {
                warn!("Price lookup timed out for {}", token_address);
                0.0
            }
        }
    }

    async fn token_is_tracked(&self, token_address: &str) -> bool {
        let provider = self.pool.active();
        match tokio::time::timeout(
            self.price_query_timeout,
            provider.is_tracked_token(token_address),
        )
        .await
        {
            Ok(Ok(tracked)) => tracked,
            Ok(Err(e)) => {
                debug!("Tracked-token check failed for {}: {}", token_address, e);
                false
            }
            Err(_) => {
                debug!("Tracked-token check timed out for {}", token_address);
                false
            }
        }
    }
}

#[async_trait]
impl BatchHandler for DomainEventHandlers {
    async fn process_batch(&self, batch: &[NormalizedEvent]) -> Result<(), AppError> {
        // Sequential on purpose: per-batch ordering is part of the
        // delivery contract.
        for event in batch {
            self.process_event(event).await?;
        }
        Ok(())
    }
}

fn token_event(
    rooms: &[String],
    event: &NormalizedEvent,
    data: serde_json::Value,
) -> Notification {
    Notification {
        rooms: rooms.to_vec(),
        payload: json!({
            "type": "token_event",
            "data": {
                "tokenAddress": event.token_address,
                "eventType": event.kind.as_str(),
                "data": data,
                "timestamp": event.observed_at.timestamp_millis(),
            }
        }),
    }
}

fn transaction_update(event: &NormalizedEvent) -> Notification {
    Notification {
        rooms: vec!["transactions".to_string()],
        payload: json!({
            "type": "transaction_update",
            "data": {
                "hash": event.transaction_hash,
                "status": "confirmed",
                "data": {
                    "tokenAddress": event.token_address,
                    "eventType": event.kind.as_str(),
                    "blockNumber": event.block_number,
                },
                "timestamp": event.observed_at.timestamp_millis(),
            }
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::{FanoutTransport, LocalFanout};
    use crate::provider::{ChainProvider, RawLog};
    use chrono::Utc;
    use launchpad_common::{EventSystem, FanoutMessage};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct FakeProvider {
        price: Result<f64, ()>,
        tracked: Result<bool, ()>,
        delay: Duration,
    }

    impl FakeProvider {
        fn healthy(price: f64, tracked: bool) -> Arc<Self> {
            Arc::new(Self {
                price: Ok(price),
                tracked: Ok(tracked),
                delay: Duration::ZERO,
            })
        }

        fn broken() -> Arc<Self> {
            Arc::new(Self {
                price: Err(()),
                tracked: Err(()),
                delay: Duration::ZERO,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                price: Ok(42.0),
                tracked: Ok(true),
                delay,
            })
        }
    }

    #[async_trait]
    impl ChainProvider for FakeProvider {
        fn provider_id(&self) -> &str {
            "primary"
        }

        async fn subscribe_logs(
            &self,
            _contracts: &[String],
            _topics: &[String],
        ) -> Result<mpsc::Receiver<RawLog>, AppError> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }

        async fn query_token_price(&self, _token_address: &str) -> Result<f64, AppError> {
            tokio::time::sleep(self.delay).await;
            self.price
                .map_err(|_| AppError::ProviderError("read path down".to_string()))
        }

        async fn is_tracked_token(&self, _token_address: &str) -> Result<bool, AppError> {
            tokio::time::sleep(self.delay).await;
            self.tracked
                .map_err(|_| AppError::ProviderError("read path down".to_string()))
        }
    }

    struct RecordingSink {
        calls: StdMutex<Vec<String>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl MetricsSink for RecordingSink {
        async fn increment(&self, name: &str) -> Result<(), AppError> {
            self.calls.lock().unwrap().push(name.to_string());
            Ok(())
        }

        async fn add(&self, name: &str, amount: f64) -> Result<(), AppError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{}+{}", name, amount));
            Ok(())
        }

        async fn set(&self, _name: &str, _value: f64) -> Result<(), AppError> {
            Ok(())
        }
    }

    struct FailingTransport;

    #[async_trait]
    impl FanoutTransport for FailingTransport {
        async fn publish(&self, _message: &FanoutMessage) -> Result<(), AppError> {
            Err(AppError::RedisError("bus unreachable".to_string()))
        }

        async fn subscribe(&self) -> Result<mpsc::Receiver<FanoutMessage>, AppError> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
    }

    fn event(kind: ChainEventKind, fields: serde_json::Value) -> NormalizedEvent {
        NormalizedEvent {
            kind,
            token_address: "0xaaa111".to_string(),
            fields,
            transaction_hash: "0xhash".to_string(),
            block_number: 5,
            provider_id: "primary".to_string(),
            observed_at: Utc::now(),
        }
    }

    fn handlers_with(
        provider: Arc<dyn ChainProvider>,
        transport: Arc<dyn FanoutTransport>,
        metrics: Arc<dyn MetricsSink>,
    ) -> DomainEventHandlers {
        let pool = Arc::new(
            ProviderPool::new(
                vec![("ws://primary".to_string(), provider)],
                Arc::new(EventSystem::new()),
            )
            .unwrap(),
        );
        DomainEventHandlers::new(
            pool,
            Arc::new(FanoutBus::new(transport)),
            metrics,
            Duration::from_millis(100),
        )
    }

    #[tokio::test]
    async fn purchases_carry_the_computed_trade_value() {
        let handlers = handlers_with(
            FakeProvider::healthy(2.0, true),
            Arc::new(LocalFanout::new()),
            RecordingSink::new(),
        );
        let event = event(
            ChainEventKind::TokenPurchased,
            json!({"trader": "0xbbb", "amount": 3.0}),
        );

        let notifications = handlers.handle(&event).await;
        assert_eq!(notifications.len(), 3);

        let token_event = &notifications[0];
        assert_eq!(
            token_event.rooms,
            vec!["token:0xaaa111".to_string(), "token_events".to_string()]
        );
        assert_eq!(token_event.payload["data"]["data"]["value"], 6.0);
        assert_eq!(token_event.payload["data"]["data"]["price"], 2.0);

        assert_eq!(notifications[1].rooms, vec!["price_updates".to_string()]);
        assert_eq!(notifications[1].payload["type"], "price_update");
        assert_eq!(notifications[2].rooms, vec!["transactions".to_string()]);
        assert_eq!(notifications[2].payload["type"], "transaction_update");
    }

    #[tokio::test]
    async fn price_failures_fall_back_to_zero() {
        for provider in [FakeProvider::broken(), FakeProvider::slow(Duration::from_secs(5))] {
            let handlers = handlers_with(
                provider,
                Arc::new(LocalFanout::new()),
                RecordingSink::new(),
            );
            let event = event(
                ChainEventKind::TokenSold,
                json!({"trader": "0xbbb", "amount": 3.0}),
            );

            let notifications = handlers.handle(&event).await;
            // The notification still goes out, priced at zero.
            assert_eq!(notifications[0].payload["data"]["data"]["value"], 0.0);
            assert_eq!(notifications[0].payload["data"]["data"]["price"], 0.0);
        }
    }

    #[tokio::test]
    async fn untracked_transfers_are_filtered() {
        let handlers = handlers_with(
            FakeProvider::healthy(1.0, false),
            Arc::new(LocalFanout::new()),
            RecordingSink::new(),
        );
        let event = event(
            ChainEventKind::Transfer,
            json!({"from": "0x1", "to": "0x2", "amount": 1.0}),
        );
        assert!(handlers.handle(&event).await.is_empty());
    }

    #[tokio::test]
    async fn tracked_check_errors_count_as_untracked() {
        let handlers = handlers_with(
            FakeProvider::broken(),
            Arc::new(LocalFanout::new()),
            RecordingSink::new(),
        );
        let event = event(
            ChainEventKind::Transfer,
            json!({"from": "0x1", "to": "0x2", "amount": 1.0}),
        );
        assert!(handlers.handle(&event).await.is_empty());

        // The swallowed error does not fail the surrounding batch.
        let created = self::event(
            ChainEventKind::TokenCreated,
            json!({"creator": "0xc", "name": "Dog", "symbol": "DOG"}),
        );
        handlers
            .process_batch(&[event, created])
            .await
            .expect("batch should survive a failed tracked check");
    }

    #[tokio::test]
    async fn processed_events_record_metrics() {
        let metrics = RecordingSink::new();
        let handlers = handlers_with(
            FakeProvider::healthy(2.0, true),
            Arc::new(LocalFanout::new()),
            metrics.clone(),
        );
        let event = event(
            ChainEventKind::TokenPurchased,
            json!({"trader": "0xbbb", "amount": 3.0}),
        );
        handlers.process_batch(&[event]).await.unwrap();

        timeout(Duration::from_secs(1), async {
            loop {
                let calls = metrics.calls.lock().unwrap().clone();
                if calls.contains(&"events_processed".to_string())
                    && calls.contains(&"events_purchased".to_string())
                    && calls.iter().any(|c| c.starts_with("trade_volume+"))
                {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("metrics should be recorded");
    }

    #[tokio::test]
    async fn publish_failures_fail_the_batch_for_retry() {
        let handlers = handlers_with(
            FakeProvider::healthy(1.0, true),
            Arc::new(FailingTransport),
            RecordingSink::new(),
        );
        let event = event(
            ChainEventKind::TokenCreated,
            json!({"creator": "0xc", "name": "Dog", "symbol": "DOG"}),
        );
        assert!(handlers.process_batch(&[event]).await.is_err());
    }
}
