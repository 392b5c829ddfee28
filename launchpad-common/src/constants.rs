/// Channel every instance publishes and consumes room broadcasts on.
pub const FANOUT_CHANNEL: &str = "launchpad:fanout";

/// Scope value that addresses every connection instead of a single room.
pub const BROADCAST_SCOPE: &str = "*";

/// Key prefix for counters written by the metrics sink.
pub const METRICS_KEY_PREFIX: &str = "launchpad:metrics";

/// Fixed channels clients may subscribe to by name.
pub const ALLOWED_CHANNELS: [&str; 6] = [
    "token_events",
    "price_updates",
    "transactions",
    "platform_stats",
    "user_activity",
    "system_notifications",
];

/// Per-token rooms are `token:<address>`.
pub const TOKEN_ROOM_PREFIX: &str = "token:";

/// True for fixed channels and any non-empty `token:<address>` room.
pub fn is_valid_channel(name: &str) -> bool {
    if ALLOWED_CHANNELS.contains(&name) {
        return true;
    }
    match name.strip_prefix(TOKEN_ROOM_PREFIX) {
        Some(rest) => !rest.is_empty(),
        None => false,
    }
}

pub fn token_room(token_address: &str) -> String {
    format!("{}{}", TOKEN_ROOM_PREFIX, token_address.to_lowercase())
}
