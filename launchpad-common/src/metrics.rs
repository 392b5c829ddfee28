use async_trait::async_trait;
use bb8_redis::redis::AsyncCommands;
use std::future::Future;
use std::sync::Arc;

use crate::{constants::METRICS_KEY_PREFIX, error::AppError, redis::RedisPool};

/// Sink for the analytics collaborator. Every call site treats failures as
/// log-and-continue; nothing in the pipeline waits on a metric write.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn increment(&self, name: &str) -> Result<(), AppError>;
    async fn add(&self, name: &str, amount: f64) -> Result<(), AppError>;
    async fn set(&self, name: &str, value: f64) -> Result<(), AppError>;
}

pub struct RedisMetricsSink {
    pool: Arc<RedisPool>,
}

impl RedisMetricsSink {
    pub fn new(pool: Arc<RedisPool>) -> Self {
        Self { pool }
    }

    fn key(name: &str) -> String {
        format!("{}:{}", METRICS_KEY_PREFIX, name)
    }
}

#[async_trait]
impl MetricsSink for RedisMetricsSink {
    async fn increment(&self, name: &str) -> Result<(), AppError> {
        let mut conn = self.pool.get_connection().await?;
        conn.incr::<_, _, ()>(Self::key(name), 1i64)
            .await
            .map_err(|e| AppError::RedisError(format!("Failed to increment {}: {}", name, e)))
    }

    async fn add(&self, name: &str, amount: f64) -> Result<(), AppError> {
        let mut conn = self.pool.get_connection().await?;
        conn.incr::<_, _, ()>(Self::key(name), amount)
            .await
            .map_err(|e| AppError::RedisError(format!("Failed to add to {}: {}", name, e)))
    }

    async fn set(&self, name: &str, value: f64) -> Result<(), AppError> {
        let mut conn = self.pool.get_connection().await?;
        conn.set::<_, _, ()>(Self::key(name), value)
            .await
            .map_err(|e| AppError::RedisError(format!("Failed to set {}: {}", name, e)))
    }
}

/// Sink that drops everything. Used when no analytics store is configured.
pub struct NullMetricsSink;

#[async_trait]
impl MetricsSink for NullMetricsSink {
    async fn increment(&self, _name: &str) -> Result<(), AppError> {
        Ok(())
    }

    async fn add(&self, _name: &str, _amount: f64) -> Result<(), AppError> {
        Ok(())
    }

    async fn set(&self, _name: &str, _value: f64) -> Result<(), AppError> {
        Ok(())
    }
}

/// Run a metric update without blocking the caller. Errors are logged and
/// swallowed; a failing analytics store must never stall event delivery.
pub fn spawn_metric<F>(fut: F)
where
    F: Future<Output = Result<(), AppError>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = fut.await {
            tracing::warn!("Metric update failed: {}", e);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MetricsSink for CountingSink {
        async fn increment(&self, _name: &str) -> Result<(), AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn add(&self, _name: &str, _amount: f64) -> Result<(), AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn set(&self, _name: &str, _value: f64) -> Result<(), AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn spawn_metric_swallows_errors() {
        spawn_metric(async { Err(AppError::RedisError("down".to_string())) });
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn counting_sink_records_calls() {
        let sink = Arc::new(CountingSink {
            calls: AtomicUsize::new(0),
        });
        sink.increment("events").await.unwrap();
        sink.add("volume", 2.5).await.unwrap();
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
    }
}
