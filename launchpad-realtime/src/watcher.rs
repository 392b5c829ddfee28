use backoff::{backoff::Backoff, ExponentialBackoff};
use chrono::Utc;
use launchpad_common::{AppError, ChainEventKind, Event, EventSystem, NormalizedEvent};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::provider::{ChainProvider, ProviderPool, RawLog};
use crate::queue::EventQueue;

// Event signature topics emitted by the launchpad contracts. Transfer is
// the standard ERC-20 signature; the rest are launchpad-specific.
pub const TOPIC_TOKEN_CREATED: &str =
    "0x27c1ae2b1e6a985096a4a91da476c23eb041d158a5cf423ae874de2546b16be3";
pub const TOPIC_TOKEN_PURCHASED: &str =
    "0x6a4f3d47c5cb1712f2e286ab47eeb7b0beb2a44c5573c4dcbf98e384e3c1bf40";
pub const TOPIC_TOKEN_SOLD: &str =
    "0x9387a595ac4be9038bbb9751abad8baa3dcf219dd8e19ce05a8e8f5cdcb2b1a9";
pub const TOPIC_TRADING_ENABLED: &str =
    "0x5d8e8cf56a6e06eae766f9b24a787eb74e5a53cf1a870d8c1e21ac7a469d2da6";
pub const TOPIC_TRANSFER: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

pub const WATCHED_TOPICS: [&str; 5] = [
    TOPIC_TOKEN_CREATED,
    TOPIC_TOKEN_PURCHASED,
    TOPIC_TOKEN_SOLD,
    TOPIC_TRADING_ENABLED,
    TOPIC_TRANSFER,
];

/// Tails the active provider's log stream, normalizes what it sees and
/// feeds the event queue. Re-binds its subscriptions whenever the pool
/// switches providers.
pub struct ContractEventWatcher {
    pool: Arc<ProviderPool>,
    queue: Arc<EventQueue>,
    event_system: Arc<EventSystem>,
    contracts: Vec<String>,
    retry_initial: Duration,
    retry_max: Duration,
    stop_tx: watch::Sender<bool>,
}

impl ContractEventWatcher {
    pub fn new(
        pool: Arc<ProviderPool>,
        queue: Arc<EventQueue>,
        event_system: Arc<EventSystem>,
        contracts: Vec<String>,
        retry_initial: Duration,
        retry_max: Duration,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            pool,
            queue,
            event_system,
            contracts,
            retry_initial,
            retry_max,
            stop_tx,
        }
    }

    pub fn start(&self) -> JoinHandle<()> {
        let pool = Arc::clone(&self.pool);
        let queue = Arc::clone(&self.queue);
        let event_system = Arc::clone(&self.event_system);
        let contracts = self.contracts.clone();
        let retry_initial = self.retry_initial;
        let retry_max = self.retry_max;
        let stop_rx = self.stop_tx.subscribe();

        tokio::spawn(run_loop(
            pool,
            queue,
            event_system,
            contracts,
            retry_initial,
            retry_max,
            stop_rx,
        ))
    }

    /// Cancels the watcher; no events are enqueued after this returns and
    /// the task has observed the signal.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

async fn run_loop(
    pool: Arc<ProviderPool>,
    queue: Arc<EventQueue>,
    event_system: Arc<EventSystem>,
    contracts: Vec<String>,
    retry_initial: Duration,
    retry_max: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut bus_rx = event_system.subscribe();
    let topics: Vec<String> = WATCHED_TOPICS.iter().map(|t| t.to_string()).collect();
    let mut backoff = ExponentialBackoff {
        initial_interval: retry_initial,
        max_interval: retry_max,
        max_elapsed_time: None,
        ..Default::default()
    };

    'outer: loop {
        if *stop_rx.borrow() {
            break;
        }

        let provider = pool.active();
        let provider_id = provider.provider_id().to_string();

        match provider.subscribe_logs(&contracts, &topics).await {
            Err(e) => {
                pool.report_error(&provider_id, &e);
                let delay = backoff.next_backoff().unwrap_or(retry_max);
                warn!(
                    "Log subscription on {} failed: {}; retrying in {:?}",
                    provider_id, e, delay
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop_rx.changed() => {}
                }
            }
            Ok(mut logs) => {
                info!(
                    "Watching {} contracts through provider {}",
                    contracts.len(),
                    provider_id
                );
                pool.report_recovered(&provider_id);
                backoff.reset();

                loop {
                    tokio::select! {
                        _ = stop_rx.changed() => {
                            if *stop_rx.borrow() {
                                break 'outer;
                            }
                        }
                        bus_event = bus_rx.recv() => match bus_event {
                            Ok(Event::ProviderSwitched { to, .. }) => {
                                info!("Provider switched to {}; re-binding subscriptions", to);
                                break;
                            }
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "Watcher lagged behind the internal bus");
                            }
                            Err(broadcast::error::RecvError::Closed) => {}
                        },
                        log = logs.recv() => match log {
                            Some(raw) => {
                                pool.record_block(&provider_id, raw.block_number);
                                if let Some(event) = decode_log(&raw, &provider_id) {
                                    queue.enqueue(event).await;
                                }
                            }
                            None => {
                                let err = AppError::ProviderError(
                                    "log stream closed".to_string(),
                                );
                                pool.report_error(&provider_id, &err);
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    info!("Contract event watcher stopped");
}

/// Decode one raw log into a normalized event. Unknown topics are ignored;
/// recognized-but-malformed logs and zero-address transfer noise are
/// dropped, never failing the stream.
pub(crate) fn decode_log(log: &RawLog, provider_id: &str) -> Option<NormalizedEvent> {
    let topic0 = log.topics.first()?.as_str();
    if !WATCHED_TOPICS.contains(&topic0) {
        return None;
    }

    let decoded = (|| {
        let (kind, token_address, fields) = match topic0 {
            TOPIC_TOKEN_CREATED => {
                let token = topic_address(log.topics.get(1)?)?;
                let creator = topic_address(log.topics.get(2)?)?;
                let (name, symbol) = decode_two_strings(&log.data)?;
                (
                    ChainEventKind::TokenCreated,
                    token,
                    json!({"creator": creator, "name": name, "symbol": symbol}),
                )
            }
            TOPIC_TOKEN_PURCHASED => {
                let token = topic_address(log.topics.get(1)?)?;
                let trader = topic_address(log.topics.get(2)?)?;
                let amount = data_word_f64(&log.data, 0)?;
                (
                    ChainEventKind::TokenPurchased,
                    token,
                    json!({"trader": trader, "amount": amount}),
                )
            }
            TOPIC_TOKEN_SOLD => {
                let token = topic_address(log.topics.get(1)?)?;
                let trader = topic_address(log.topics.get(2)?)?;
                let amount = data_word_f64(&log.data, 0)?;
                (
                    ChainEventKind::TokenSold,
                    token,
                    json!({"trader": trader, "amount": amount}),
                )
            }
            TOPIC_TRADING_ENABLED => {
                let token = topic_address(log.topics.get(1)?)?;
                (ChainEventKind::TradingEnabled, token, json!({}))
            }
            TOPIC_TRANSFER => {
                let from = topic_address(log.topics.get(1)?)?;
                let to = topic_address(log.topics.get(2)?)?;
                if is_zero_address(&from) || is_zero_address(&to) {
                    // Mint/burn noise, filtered before it ever queues.
                    return None;
                }
                let amount = data_word_f64(&log.data, 0)?;
                (
                    ChainEventKind::Transfer,
                    log.address.clone(),
                    json!({"from": from, "to": to, "amount": amount}),
                )
            }
            _ => return None,
        };
        Some((kind, token_address, fields))
    })();

    let Some((kind, token_address, fields)) = decoded else {
        if topic0 != TOPIC_TRANSFER || log.topics.len() < 3 {
            warn!(
                "Dropping undecodable log from tx {} (topic {})",
                log.transaction_hash, topic0
            );
        }
        return None;
    };

    Some(NormalizedEvent {
        kind,
        token_address,
        fields,
        transaction_hash: log.transaction_hash.clone(),
        block_number: log.block_number,
        provider_id: provider_id.to_string(),
        observed_at: Utc::now(),
    })
}

fn topic_address(topic: &str) -> Option<String> {
    let hex_part = topic.strip_prefix("0x")?;
    if hex_part.len() != 64 {
        return None;
    }
    Some(format!("0x{}", &hex_part[24..]))
}

fn is_zero_address(address: &str) -> bool {
    address
        .trim_start_matches("0x")
        .chars()
        .all(|c| c == '0')
}

fn data_bytes(data: &str) -> Option<Vec<u8>> {
    hex::decode(data.strip_prefix("0x")?).ok()
}

fn word_u128(bytes: &[u8], index: usize) -> Option<u128> {
    let word = bytes.get(index * 32..(index + 1) * 32)?;
    if word[..16].iter().any(|b| *b != 0) {
        return None;
    }
    Some(u128::from_be_bytes(word[16..32].try_into().ok()?))
}

fn data_word_f64(data: &str, index: usize) -> Option<f64> {
    let bytes = data_bytes(data)?;
    Some(word_u128(&bytes, index)? as f64 / 1e18)
}

/// Two dynamic ABI strings: head words hold offsets, each string is a
/// length word followed by utf8 bytes.
fn decode_two_strings(data: &str) -> Option<(String, String)> {
    let bytes = data_bytes(data)?;
    let first = abi_string_at(&bytes, word_u128(&bytes, 0)? as usize)?;
    let second = abi_string_at(&bytes, word_u128(&bytes, 1)? as usize)?;
    Some((first, second))
}

fn abi_string_at(bytes: &[u8], offset: usize) -> Option<String> {
    let length_word = bytes.get(offset..offset + 32)?;
    if length_word[..16].iter().any(|b| *b != 0) {
        return None;
    }
    let length = u128::from_be_bytes(length_word[16..32].try_into().ok()?) as usize;
    let start = offset + 32;
    let slice = bytes.get(start..start + length)?;
    String::from_utf8(slice.to_vec()).ok()
}
