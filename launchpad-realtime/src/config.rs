use std::time::Duration;

/// Tunables for the realtime pipeline. Defaults match production; tests
/// shrink the intervals.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Flush the event queue once this many events are buffered.
    pub batch_size: usize,
    /// Flush the event queue when this much time has passed since the last
    /// flush, even if the buffer is below `batch_size`.
    pub flush_interval: Duration,
    /// Consecutive failures after which a batch is dropped as poison.
    pub max_batch_retries: u32,
    pub heartbeat_interval: Duration,
    /// Connections idle longer than this are evicted by the sweep.
    pub connection_timeout: Duration,
    pub provider_retry_initial: Duration,
    pub provider_retry_max: Duration,
    /// Budget for contract read calls (price, tracked-token checks).
    pub price_query_timeout: Duration,
    /// Empty list allows any origin.
    pub allowed_origins: Vec<String>,
    /// HS256 secret for bearer credentials; `None` disables bearer auth.
    pub jwt_secret: Option<String>,
    /// Exactly one instance of the fleet runs the watcher.
    pub watcher_enabled: bool,
    /// Launchpad contract addresses to watch.
    pub contracts: Vec<String>,
    pub ws_port: u16,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            flush_interval: Duration::from_secs(5),
            max_batch_retries: 5,
            heartbeat_interval: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(60),
            provider_retry_initial: Duration::from_secs(1),
            provider_retry_max: Duration::from_secs(30),
            price_query_timeout: Duration::from_secs(3),
            allowed_origins: Vec::new(),
            jwt_secret: None,
            watcher_enabled: true,
            contracts: Vec::new(),
            ws_port: 8081,
        }
    }
}

impl RealtimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_max_batch_retries(mut self, retries: u32) -> Self {
        self.max_batch_retries = retries;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_price_query_timeout(mut self, timeout: Duration) -> Self {
        self.price_query_timeout = timeout;
        self
    }

    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = origins;
        self
    }

    pub fn with_jwt_secret(mut self, secret: Option<String>) -> Self {
        self.jwt_secret = secret;
        self
    }

    pub fn with_watcher_enabled(mut self, enabled: bool) -> Self {
        self.watcher_enabled = enabled;
        self
    }

    pub fn with_contracts(mut self, contracts: Vec<String>) -> Self {
        self.contracts = contracts;
        self
    }

    pub fn with_ws_port(mut self, port: u16) -> Self {
        self.ws_port = port;
        self
    }
}
