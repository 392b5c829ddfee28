pub mod constants;
pub mod error;
pub mod metrics;
pub mod models;
pub mod redis;

pub mod events {
    pub mod event_system;
}

pub use constants::{
    is_valid_channel, token_room, ALLOWED_CHANNELS, BROADCAST_SCOPE, FANOUT_CHANNEL,
    METRICS_KEY_PREFIX, TOKEN_ROOM_PREFIX,
};
pub use error::AppError;
pub use events::event_system::{Event, EventSystem};
pub use metrics::{spawn_metric, MetricsSink, NullMetricsSink, RedisMetricsSink};
pub use models::{
    ChainEventKind, FanoutMessage, NormalizedEvent, Notification, ProviderState, ProviderStatus,
};
pub use self::redis::RedisPool;
