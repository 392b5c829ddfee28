use super::RedisPool;
use crate::{constants::FANOUT_CHANNEL, error::AppError, models::FanoutMessage};

impl RedisPool {
    /// Publish one fanout message. Callers log a failed publish and move
    /// on; nothing retries at this layer.
    pub async fn publish_fanout(&self, message: &FanoutMessage) -> Result<(), AppError> {
        self.publish(FANOUT_CHANNEL, message).await
    }

    /// Dedicated PubSub connection already subscribed to the fanout channel.
    pub async fn subscribe_fanout(&self) -> Result<redis::aio::PubSub, AppError> {
        self.subscribe(FANOUT_CHANNEL).await
    }
}
