use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// On-chain event classes the platform reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainEventKind {
    TokenCreated,
    TokenPurchased,
    TokenSold,
    TradingEnabled,
    Transfer,
}

impl ChainEventKind {
    /// The `eventType` string clients see in `token_event` payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainEventKind::TokenCreated => "created",
            ChainEventKind::TokenPurchased => "purchased",
            ChainEventKind::TokenSold => "sold",
            ChainEventKind::TradingEnabled => "trading_enabled",
            ChainEventKind::Transfer => "transfer",
        }
    }
}

/// A decoded chain log, immutable once the watcher has produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub kind: ChainEventKind,
    pub token_address: String,
    /// Per-kind decoded fields (creator/name/symbol, trader/amount, from/to/amount).
    pub fields: Value,
    pub transaction_hash: String,
    pub block_number: u64,
    /// Which provider sourced the raw log. Changes after a failover.
    pub provider_id: String,
    pub observed_at: DateTime<Utc>,
}

/// What a domain handler derives from one event: a payload plus the rooms
/// it should reach.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub rooms: Vec<String>,
    pub payload: Value,
}

/// One message on the cross-instance fanout channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutMessage {
    pub room: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderState {
    Connected,
    Degraded,
    Failed,
}

/// Point-in-time view of one upstream provider, surfaced on `/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub id: String,
    pub endpoint: String,
    pub state: ProviderState,
    pub last_block: u64,
    pub active: bool,
}
