use tokio::sync::broadcast;
use uuid::Uuid;

/// Process-internal signals passed between components. Cross-instance
/// traffic never rides this bus; that is what the fanout channel is for.
#[derive(Debug, Clone)]
pub enum Event {
    /// The provider pool promoted a backup; subscribers must re-bind.
    ProviderSwitched { from: String, to: String },
    /// The active provider failed and no backup was available.
    ProviderDegraded { provider_id: String },
    ConnectionOpened { connection_id: Uuid },
    ConnectionClosed { connection_id: Uuid },
}

pub struct EventSystem {
    sender: broadcast::Sender<Event>,
}

impl EventSystem {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(200);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: Event) {
        tracing::debug!(?event, receivers = self.sender.receiver_count(), "emitting event");
        // A send error only means nobody is listening yet; that is fine
        // during startup and shutdown.
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventSystem {
    fn default() -> Self {
        Self::new()
    }
}
