use launchpad_common::{AppError, EventSystem, MetricsSink, ProviderStatus};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use crate::config::RealtimeConfig;
use crate::fanout::{FanoutBus, FanoutTransport};
use crate::handlers::DomainEventHandlers;
use crate::heartbeat::HeartbeatMonitor;
use crate::provider::{ChainProvider, ProviderPool};
use crate::queue::{BatchHandler, BatchProcessor, EventQueue};
use crate::registry::ConnectionRegistry;
use crate::server::WebSocketServer;
use crate::watcher::ContractEventWatcher;

/// The whole realtime pipeline behind one start/stop lifecycle. Everything
/// is constructed here and injected explicitly, so tests can run several
/// independent instances side by side.
pub struct RealtimeService {
    config: RealtimeConfig,
    pool: Arc<ProviderPool>,
    registry: Arc<ConnectionRegistry>,
    fanout: Arc<FanoutBus>,
    queue: Arc<EventQueue>,
    handlers: Arc<DomainEventHandlers>,
    metrics: Arc<dyn MetricsSink>,
    event_system: Arc<EventSystem>,
    watcher: ContractEventWatcher,
    stop_tx: watch::Sender<bool>,
}

impl RealtimeService {
    pub fn new(
        config: RealtimeConfig,
        providers: Vec<(String, Arc<dyn ChainProvider>)>,
        transport: Arc<dyn FanoutTransport>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, AppError> {
        let event_system = Arc::new(EventSystem::new());
        let pool = Arc::new(ProviderPool::new(providers, Arc::clone(&event_system))?);
        let registry = Arc::new(ConnectionRegistry::new());
        let fanout = Arc::new(FanoutBus::new(transport));
        let queue = Arc::new(EventQueue::new(config.batch_size));
        let handlers = Arc::new(DomainEventHandlers::new(
            Arc::clone(&pool),
            Arc::clone(&fanout),
            Arc::clone(&metrics),
            config.price_query_timeout,
        ));
        let watcher = ContractEventWatcher::new(
            Arc::clone(&pool),
            Arc::clone(&queue),
            Arc::clone(&event_system),
            config.contracts.clone(),
            config.provider_retry_initial,
            config.provider_retry_max,
        );
        let (stop_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            pool,
            registry,
            fanout,
            queue,
            handlers,
            metrics,
            event_system,
            watcher,
            stop_tx,
        })
    }

    pub async fn start(&self) -> Result<(), AppError> {
        let stop_rx = self.stop_tx.subscribe();

        self.fanout
            .start_listener(Arc::clone(&self.registry), stop_rx.clone())
            .await?;

        HeartbeatMonitor::new(
            Arc::clone(&self.registry),
            self.config.heartbeat_interval,
            self.config.connection_timeout,
        )
        .spawn(stop_rx.clone());

        BatchProcessor::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.handlers) as Arc<dyn BatchHandler>,
            self.config.flush_interval,
            self.config.max_batch_retries,
        )
        .spawn(stop_rx.clone());

        if self.config.watcher_enabled {
            self.watcher.start();
        } else {
            // Another instance of the fleet runs the watcher; this one
            // still delivers everything arriving on the fanout bus.
            info!("Chain watcher disabled on this instance");
        }

        let server = WebSocketServer::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.metrics),
            Arc::clone(&self.event_system),
            self.config.allowed_origins.clone(),
            self.config.jwt_secret.clone(),
            self.config.ws_port,
        );
        server.start(stop_rx).await?;

        info!("Realtime service started");
        Ok(())
    }

    pub async fn stop(&self) {
        info!("Stopping realtime service");
        self.watcher.stop();
        let _ = self.stop_tx.send(true);
    }

    pub fn provider_statuses(&self) -> Vec<ProviderStatus> {
        self.pool.statuses()
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.connection_count().await
    }

    pub async fn room_count(&self) -> usize {
        self.registry.room_count().await
    }

    pub async fn queued_events(&self) -> usize {
        self.queue.len().await
    }

    pub fn watcher_enabled(&self) -> bool {
        self.config.watcher_enabled
    }
}
