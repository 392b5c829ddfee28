use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use launchpad_common::{AppError, Event, EventSystem, ProviderState, ProviderStatus};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{error, info, warn};

/// Consecutive errors on the active provider before the pool fails it over.
const FAILOVER_THRESHOLD: u32 = 3;

const SUBSCRIBE_CONFIRM_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const LOG_CHANNEL_CAPACITY: usize = 1024;

// Read selectors on the launchpad contract.
const PRICE_CALL_SELECTOR: &str = "0x4fd42c49";
const IS_TRACKED_CALL_SELECTOR: &str = "0x75f12b29";

/// One raw log as delivered by the node, before decoding.
#[derive(Debug, Clone)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub block_number: u64,
    pub transaction_hash: String,
}

/// Upstream chain-node surface the pipeline consumes: subscribe-by-topic
/// plus the two read calls the handlers need.
#[async_trait]
pub trait ChainProvider: Send + Sync {
    fn provider_id(&self) -> &str;

    /// Open a log subscription filtered to `contracts` and `topics`. The
    /// returned channel closing means the upstream connection died.
    async fn subscribe_logs(
        &self,
        contracts: &[String],
        topics: &[String],
    ) -> Result<mpsc::Receiver<RawLog>, AppError>;

    async fn query_token_price(&self, token_address: &str) -> Result<f64, AppError>;

    async fn is_tracked_token(&self, token_address: &str) -> Result<bool, AppError>;
}

struct PoolEntry {
    provider: Arc<dyn ChainProvider>,
    endpoint: String,
    state: ProviderState,
    last_block: u64,
    consecutive_errors: u32,
}

struct PoolInner {
    entries: Vec<PoolEntry>,
    active: usize,
}

/// Primary-plus-backups provider set with transparent failover. All state
/// transitions happen under one lock; the `ProviderSwitched` signal is
/// emitted after the lock is released.
pub struct ProviderPool {
    inner: RwLock<PoolInner>,
    event_system: Arc<EventSystem>,
}

impl ProviderPool {
    pub fn new(
        providers: Vec<(String, Arc<dyn ChainProvider>)>,
        event_system: Arc<EventSystem>,
    ) -> Result<Self, AppError> {
        if providers.is_empty() {
            return Err(AppError::ConfigError(
                "Provider pool requires at least one provider".to_string(),
            ));
        }

        let entries = providers
            .into_iter()
            .map(|(endpoint, provider)| PoolEntry {
                provider,
                endpoint,
                state: ProviderState::Connected,
                last_block: 0,
                consecutive_errors: 0,
            })
            .collect();

        Ok(Self {
            inner: RwLock::new(PoolInner { entries, active: 0 }),
            event_system,
        })
    }

    pub fn active(&self) -> Arc<dyn ChainProvider> {
        let inner = self.inner.read();
        Arc::clone(&inner.entries[inner.active].provider)
    }

    pub fn active_id(&self) -> String {
        let inner = self.inner.read();
        inner.entries[inner.active].provider.provider_id().to_string()
    }

    /// Record a provider failure. Three consecutive errors on the active
    /// provider fail it over to the first healthy backup; with no backup
    /// left the pool goes degraded and the watcher keeps retrying.
    pub fn report_error(&self, provider_id: &str, error: &AppError) {
        let mut switched = None;
        let mut degraded = None;
        {
            let mut inner = self.inner.write();
            let Some(idx) = Self::position(&inner, provider_id) else {
                return;
            };

            let entry = &mut inner.entries[idx];
            entry.consecutive_errors += 1;
            entry.state = ProviderState::Degraded;
            warn!(
                "Provider {} error #{}: {}",
                provider_id, entry.consecutive_errors, error
            );

            if entry.consecutive_errors >= FAILOVER_THRESHOLD {
                entry.state = ProviderState::Failed;
                if idx == inner.active {
                    match Self::promote_locked(&mut inner) {
                        Some(switch) => switched = Some(switch),
                        None => degraded = Some(provider_id.to_string()),
                    }
                }
            }
        }

        if let Some((from, to)) = switched {
            warn!("Provider {} failed; promoted backup {}", from, to);
            self.event_system.emit(Event::ProviderSwitched { from, to });
        }
        if let Some(provider_id) = degraded {
            error!(
                "Provider {} failed with no healthy backup; entering degraded mode",
                provider_id
            );
            self.event_system.emit(Event::ProviderDegraded { provider_id });
        }
    }

    /// A successful subscription clears the error streak.
    pub fn report_recovered(&self, provider_id: &str) {
        let mut inner = self.inner.write();
        if let Some(idx) = Self::position(&inner, provider_id) {
            let entry = &mut inner.entries[idx];
            entry.consecutive_errors = 0;
            entry.state = ProviderState::Connected;
        }
    }

    pub fn promote_backup(&self) -> bool {
        let switched = {
            let mut inner = self.inner.write();
            Self::promote_locked(&mut inner)
        };
        match switched {
            Some((from, to)) => {
                warn!("Manually promoted provider {} over {}", to, from);
                self.event_system.emit(Event::ProviderSwitched { from, to });
                true
            }
            None => false,
        }
    }

    fn promote_locked(inner: &mut PoolInner) -> Option<(String, String)> {
        let from = inner.entries[inner.active].provider.provider_id().to_string();
        let candidate = inner
            .entries
            .iter()
            .enumerate()
            .find(|(idx, entry)| *idx != inner.active && entry.state != ProviderState::Failed)
            .map(|(idx, _)| idx)?;

        inner.active = candidate;
        let entry = &mut inner.entries[candidate];
        entry.consecutive_errors = 0;
        entry.state = ProviderState::Connected;
        let to = entry.provider.provider_id().to_string();
        Some((from, to))
    }

    pub fn record_block(&self, provider_id: &str, block_number: u64) {
        let mut inner = self.inner.write();
        if let Some(idx) = Self::position(&inner, provider_id) {
            let entry = &mut inner.entries[idx];
            if block_number > entry.last_block {
                entry.last_block = block_number;
            }
        }
    }

    pub fn statuses(&self) -> Vec<ProviderStatus> {
        let inner = self.inner.read();
        inner
            .entries
            .iter()
            .enumerate()
            .map(|(idx, entry)| ProviderStatus {
                id: entry.provider.provider_id().to_string(),
                endpoint: entry.endpoint.clone(),
                state: entry.state,
                last_block: entry.last_block,
                active: idx == inner.active,
            })
            .collect()
    }

    fn position(inner: &PoolInner, provider_id: &str) -> Option<usize> {
        inner
            .entries
            .iter()
            .position(|entry| entry.provider.provider_id() == provider_id)
    }
}

/// JSON-RPC over websocket against a single node endpoint. Subscriptions
/// hold a dedicated connection; read calls open short-lived ones.
pub struct WsChainProvider {
    id: String,
    endpoint: String,
    /// Launchpad contract answering the read calls.
    launchpad_contract: String,
    request_id: AtomicU64,
}

impl WsChainProvider {
    pub fn new(
        id: impl Into<String>,
        endpoint: impl Into<String>,
        launchpad_contract: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            launchpad_contract: launchpad_contract.into(),
            request_id: AtomicU64::new(1),
        }
    }

    fn next_request_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    /// One-shot request/response exchange on a fresh connection.
    async fn request(&self, method: &str, params: Value) -> Result<Value, AppError> {
        let (ws_stream, _) = connect_async(&self.endpoint)
            .await
            .map_err(|e| AppError::ProviderError(format!("Failed to connect: {}", e)))?;
        let (mut sink, mut stream) = ws_stream.split();

        let id = self.next_request_id();
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        sink.send(Message::Text(request.to_string().into()))
            .await
            .map_err(|e| AppError::ProviderError(format!("Failed to send request: {}", e)))?;

        let result = tokio::time::timeout(REQUEST_TIMEOUT, async {
            while let Some(message) = stream.next().await {
                let message =
                    message.map_err(|e| AppError::ProviderError(format!("Stream error: {}", e)))?;
                let Message::Text(text) = message else {
                    continue;
                };
                let value: Value = serde_json::from_str(&text)
                    .map_err(|e| AppError::JsonParseError(format!("Bad RPC response: {}", e)))?;
                if value.get("id").and_then(Value::as_u64) != Some(id) {
                    continue;
                }
                if let Some(rpc_error) = value.get("error") {
                    return Err(AppError::ProviderError(format!(
                        "RPC error from {}: {}",
                        method, rpc_error
                    )));
                }
                return Ok(value.get("result").cloned().unwrap_or(Value::Null));
            }
            Err(AppError::ProviderError(
                "Connection closed before response".to_string(),
            ))
        })
        .await
        .map_err(|_| AppError::ProviderError(format!("{} timed out", method)))??;

        let _ = sink.close().await;
        Ok(result)
    }

    async fn eth_call(&self, selector: &str, address_arg: &str) -> Result<String, AppError> {
        let data = encode_address_call(selector, address_arg)?;
        let params = json!([{"to": self.launchpad_contract, "data": data}, "latest"]);
        let result = self.request("eth_call", params).await?;
        result
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| AppError::DecodeError("eth_call returned a non-string".to_string()))
    }
}

#[async_trait]
impl ChainProvider for WsChainProvider {
    fn provider_id(&self) -> &str {
        &self.id
    }

    async fn subscribe_logs(
        &self,
        contracts: &[String],
        topics: &[String],
    ) -> Result<mpsc::Receiver<RawLog>, AppError> {
        let (ws_stream, _) = connect_async(&self.endpoint)
            .await
            .map_err(|e| AppError::ProviderError(format!("Failed to connect: {}", e)))?;
        let (mut sink, mut stream) = ws_stream.split();

        let mut pending: HashSet<u64> = HashSet::new();
        for contract in contracts {
            let id = self.next_request_id();
            let request = json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": "eth_subscribe",
                "params": ["logs", {"address": contract, "topics": [topics]}],
            });
            sink.send(Message::Text(request.to_string().into()))
                .await
                .map_err(|e| {
                    AppError::ProviderError(format!("Failed to send subscription: {}", e))
                })?;
            pending.insert(id);
        }

        // Consume every confirmation before handing the stream over; an
        // error response here means the filter was rejected outright.
        tokio::time::timeout(SUBSCRIBE_CONFIRM_TIMEOUT, async {
            while !pending.is_empty() {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let value: Value = serde_json::from_str(&text).map_err(|e| {
                            AppError::JsonParseError(format!("Bad subscription response: {}", e))
                        })?;
                        if let Some(rpc_error) = value.get("error") {
                            return Err(AppError::ProviderError(format!(
                                "Subscription rejected: {}",
                                rpc_error
                            )));
                        }
                        if let Some(id) = value.get("id").and_then(Value::as_u64) {
                            pending.remove(&id);
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(AppError::ProviderError(format!(
                            "Stream error during subscribe: {}",
                            e
                        )))
                    }
                    None => {
                        return Err(AppError::ProviderError(
                            "Connection closed during subscribe".to_string(),
                        ))
                    }
                }
            }
            Ok(())
        })
        .await
        .map_err(|_| AppError::ProviderError("Subscription confirmation timed out".to_string()))??;

        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let provider_id = self.id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = stream.next() => match message {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(log) = parse_log_notification(&text) {
                                if tx.send(log).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = sink.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            warn!("Provider {} log stream closed", provider_id);
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!("Provider {} stream error: {}", provider_id, e);
                            break;
                        }
                    },
                    _ = tx.closed() => break,
                }
            }
            let _ = sink.close().await;
        });

        info!(
            "Provider {} subscribed to logs for {} contracts",
            self.id,
            contracts.len()
        );
        Ok(rx)
    }

    async fn query_token_price(&self, token_address: &str) -> Result<f64, AppError> {
        let result = self.eth_call(PRICE_CALL_SELECTOR, token_address).await?;
        parse_u256_u128(&result)
            .map(wei_to_f64)
            .ok_or_else(|| AppError::DecodeError(format!("Bad price result: {}", result)))
    }

    async fn is_tracked_token(&self, token_address: &str) -> Result<bool, AppError> {
        let result = self.eth_call(IS_TRACKED_CALL_SELECTOR, token_address).await?;
        parse_u256_u128(&result)
            .map(|value| value != 0)
            .ok_or_else(|| AppError::DecodeError(format!("Bad tracked result: {}", result)))
    }
}

fn parse_log_notification(text: &str) -> Option<RawLog> {
    let value: Value = serde_json::from_str(text).ok()?;
    let result = value.get("params")?.get("result")?;
    Some(RawLog {
        address: result.get("address")?.as_str()?.to_lowercase(),
        topics: result
            .get("topics")?
            .as_array()?
            .iter()
            .filter_map(|t| t.as_str())
            .map(|t| t.to_lowercase())
            .collect(),
        data: result.get("data")?.as_str()?.to_string(),
        block_number: parse_hex_u64(result.get("blockNumber")?.as_str()?)?,
        transaction_hash: result.get("transactionHash")?.as_str()?.to_string(),
    })
}

pub fn parse_hex_u64(value: &str) -> Option<u64> {
    u64::from_str_radix(value.trim_start_matches("0x"), 16).ok()
}

/// Calldata for `selector(address)`: the selector plus one left-padded word.
fn encode_address_call(selector: &str, address: &str) -> Result<String, AppError> {
    let addr = address.trim_start_matches("0x");
    if addr.len() != 40 || hex::decode(addr).is_err() {
        return Err(AppError::ValidationError(format!(
            "Bad token address: {}",
            address
        )));
    }
    Ok(format!("{}{:0>64}", selector, addr.to_lowercase()))
}

/// Result words are 32 bytes; every value we read fits in the low 16.
fn parse_u256_u128(result: &str) -> Option<u128> {
    let hex_part = result.trim_start_matches("0x");
    if hex_part.is_empty() || hex_part.len() > 64 {
        return None;
    }
    let low = if hex_part.len() > 32 {
        let (high, low) = hex_part.split_at(hex_part.len() - 32);
        if high.chars().any(|c| c != '0') {
            return None;
        }
        low
    } else {
        hex_part
    };
    u128::from_str_radix(low, 16).ok()
}

pub fn wei_to_f64(value: u128) -> f64 {
    value as f64 / 1e18
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubProvider {
        id: String,
    }

    impl StubProvider {
        fn new(id: &str) -> Arc<dyn ChainProvider> {
            Arc::new(Self { id: id.to_string() })
        }
    }

    #[async_trait]
    impl ChainProvider for StubProvider {
        fn provider_id(&self) -> &str {
            &self.id
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
            Ok(1.0)
        }

        async fn is_tracked_token(&self, _token_address: &str) -> Result<bool, AppError> {
            Ok(true)
        }
    }

    fn pool_with(
        providers: Vec<(&str, Arc<dyn ChainProvider>)>,
    ) -> (Arc<ProviderPool>, Arc<EventSystem>) {
        let event_system = Arc::new(EventSystem::new());
        let pool = ProviderPool::new(
            providers
                .into_iter()
                .map(|(endpoint, p)| (endpoint.to_string(), p))
                .collect(),
            Arc::clone(&event_system),
        )
        .unwrap();
        (Arc::new(pool), event_system)
    }

    #[tokio::test]
    async fn three_consecutive_errors_promote_backup() {
        let (pool, event_system) = pool_with(vec![
            ("ws://primary", StubProvider::new("primary")),
            ("ws://backup", StubProvider::new("backup")),
        ]);
        let mut events = event_system.subscribe();

        let err = AppError::ProviderError("connection reset".to_string());
        pool.report_error("primary", &err);
        pool.report_error("primary", &err);
        assert_eq!(pool.active_id(), "primary");

        pool.report_error("primary", &err);
        assert_eq!(pool.active_id(), "backup");

        match events.recv().await.unwrap() {
            Event::ProviderSwitched { from, to } => {
                assert_eq!(from, "primary");
                assert_eq!(to, "backup");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let statuses = pool.statuses();
        assert!(statuses.iter().any(|s| s.id == "primary"
            && s.state == ProviderState::Failed
            && !s.active));
        assert!(statuses.iter().any(|s| s.id == "backup" && s.active));
    }

    #[tokio::test]
    async fn failure_without_backup_degrades() {
        let (pool, event_system) = pool_with(vec![("ws://primary", StubProvider::new("primary"))]);
        let mut events = event_system.subscribe();

        let err = AppError::ProviderError("gone".to_string());
        for _ in 0..3 {
            pool.report_error("primary", &err);
        }

        // Still the only provider, still active.
        assert_eq!(pool.active_id(), "primary");
        match events.recv().await.unwrap() {
            Event::ProviderDegraded { provider_id } => assert_eq!(provider_id, "primary"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn recovery_resets_the_error_streak() {
        let (pool, _events) = pool_with(vec![
            ("ws://primary", StubProvider::new("primary")),
            ("ws://backup", StubProvider::new("backup")),
        ]);

        let err = AppError::ProviderError("flaky".to_string());
        pool.report_error("primary", &err);
        pool.report_error("primary", &err);
        pool.report_recovered("primary");
        pool.report_error("primary", &err);
        pool.report_error("primary", &err);

        // Streak restarted after recovery, so no failover yet.
        assert_eq!(pool.active_id(), "primary");
    }

    #[tokio::test]
    async fn record_block_keeps_the_high_water_mark() {
        let (pool, _events) = pool_with(vec![("ws://primary", StubProvider::new("primary"))]);
        pool.record_block("primary", 120);
        pool.record_block("primary", 90);
        assert_eq!(pool.statuses()[0].last_block, 120);
    }

    #[test]
    fn encode_address_call_pads_the_argument() {
        let data =
            encode_address_call("0x4fd42c49", "0xAbCd000000000000000000000000000000001234").unwrap();
        assert_eq!(
            data,
            "0x4fd42c49000000000000000000000000abcd000000000000000000000000000000001234"
        );
        assert!(encode_address_call("0x4fd42c49", "0x1234").is_err());
    }

    #[test]
    fn parse_u256_handles_padding_and_overflow() {
        assert_eq!(parse_u256_u128("0x0de0b6b3a7640000"), Some(10u128.pow(18)));
        let padded = format!("0x{:0>64}", "1");
        assert_eq!(parse_u256_u128(&padded), Some(1));
        let overflow = format!("0x1{:0>63}", "0");
        assert_eq!(parse_u256_u128(&overflow), None);
    }

    #[test]
    fn parse_log_notification_extracts_the_fields() {
        let text = r#"{
            "jsonrpc": "2.0",
            "method": "eth_subscription",
            "params": {
                "subscription": "0xcd0c3e8af590364c09d0fa6a1210faf5",
                "result": {
                    "address": "0xAb00000000000000000000000000000000000001",
                    "topics": ["0xDDf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"],
                    "data": "0x00",
                    "blockNumber": "0x1b4",
                    "transactionHash": "0xdeadbeef"
                }
            }
        }"#;
        let log = parse_log_notification(text).unwrap();
        assert_eq!(log.address, "0xab00000000000000000000000000000000000001");
        assert_eq!(log.block_number, 436);
        assert_eq!(log.transaction_hash, "0xdeadbeef");
        assert!(parse_log_notification("{\"id\":1,\"result\":\"0xabc\"}").is_none());
    }
}
