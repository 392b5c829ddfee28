use async_trait::async_trait;
use launchpad_common::{AppError, NormalizedEvent};
use std::collections::VecDeque;
use std::time::Duration;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

/// Consumer of flushed batches. Implementations must tolerate seeing the
/// same event more than once: a failed batch is retried in full.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn process_batch(&self, batch: &[NormalizedEvent]) -> Result<(), AppError>;
}

/// Ordered buffer between the watcher and the domain handlers.
pub struct EventQueue {
    buffer: Mutex<VecDeque<NormalizedEvent>>,
    batch_ready: Notify,
    batch_size: usize,
}

impl EventQueue {
    pub fn new(batch_size: usize) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::new()),
            batch_ready: Notify::new(),
            batch_size,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub async fn enqueue(&self, event: NormalizedEvent) {
        let len = {
            let mut buffer = self.buffer.lock().await;
            buffer.push_back(event);
            buffer.len()
        };
        if len >= self.batch_size {
            self.batch_ready.notify_one();
        }
    }

    pub async fn len(&self) -> usize {
        self.buffer.lock().await.len()
    }

    /// Resolves when the buffer has reached the batch-size threshold.
    pub async fn wait_batch_ready(&self) {
        self.batch_ready.notified().await;
    }

    /// Drain at most `batch_size` events, preserving insertion order.
    pub async fn take_batch(&self) -> Vec<NormalizedEvent> {
        let mut buffer = self.buffer.lock().await;
        let take = self.batch_size.min(buffer.len());
        buffer.drain(..take).collect()
    }

    /// Put a failed batch back at the front so the next flush retries it
    /// before anything newer.
    pub async fn requeue_front(&self, events: Vec<NormalizedEvent>) {
        let mut buffer = self.buffer.lock().await;
        for event in events.into_iter().rev() {
            buffer.push_front(event);
        }
    }
}

/// Flush loop: drains the queue whenever the size threshold is hit or the
/// flush timer elapses, whichever comes first.
pub struct BatchProcessor {
    queue: Arc<EventQueue>,
    handler: Arc<dyn BatchHandler>,
    flush_interval: Duration,
    max_batch_retries: u32,
}

impl BatchProcessor {
    pub fn new(
        queue: Arc<EventQueue>,
        handler: Arc<dyn BatchHandler>,
        flush_interval: Duration,
        max_batch_retries: u32,
    ) -> Self {
        Self {
            queue,
            handler,
            flush_interval,
            max_batch_retries,
        }
    }

    pub fn spawn(self, mut stop_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.flush_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; swallow it so the timer
            // measures from startup.
            interval.tick().await;

            let mut consecutive_failures: u32 = 0;

            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                    _ = interval.tick() => {}
                    _ = self.queue.wait_batch_ready() => {}
                }

                // Keep draining while full batches are waiting, but stop on
                // the first failure so retries stay paced by the timer.
                loop {
                    let batch = self.queue.take_batch().await;
                    if batch.is_empty() {
                        break;
                    }
                    debug!(events = batch.len(), "Flushing event batch");

                    match self.handler.process_batch(&batch).await {
                        Ok(()) => {
                            consecutive_failures = 0;
                        }
                        Err(e) => {
                            consecutive_failures += 1;
                            if consecutive_failures >= self.max_batch_retries {
                                error!(
                                    dropped = batch.len(),
                                    "Dropping batch after {} failed attempts: {}",
                                    consecutive_failures,
                                    e
                                );
                                consecutive_failures = 0;
                            } else {
                                warn!(
                                    attempt = consecutive_failures,
                                    "Batch processing failed: {}; requeueing", e
                                );
                                self.queue.requeue_front(batch).await;
                            }
                            break;
                        }
                    }

                    if self.queue.len().await < self.queue.batch_size() {
                        break;
                    }
                }

                interval.reset();
            }
            debug!("Batch processor stopped");
        })
    }
}
