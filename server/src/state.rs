use std::sync::Arc;
use tokio::sync::mpsc;

use crate::chat::log::MessageLog;
use crate::chat::presence::spawn_presence_announcer;
use crate::config::PresenceConfig;
use crate::identity::ProfileResolver;
use crate::ws::router::MessageRouter;
use crate::ws::{sweeper, Delivery, Registry};

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Live connections and the username index
    pub registry: Registry,
    /// Fan-out over the registry
    pub delivery: Delivery,
    /// Inbound frame dispatch
    pub router: MessageRouter,
    /// Account lookup and status updates
    pub profiles: Arc<dyn ProfileResolver>,
    /// Durable chat log
    pub message_log: Arc<dyn MessageLog>,
    /// Presence, heartbeat and delivery settings
    pub presence: Arc<PresenceConfig>,
}

impl AppState {
    /// Build the state and start its background tasks (presence announcer and
    /// session sweeper). Must be called from within a tokio runtime.
    pub fn new(
        presence: PresenceConfig,
        profiles: Arc<dyn ProfileResolver>,
        message_log: Arc<dyn MessageLog>,
    ) -> Self {
        let presence = Arc::new(presence);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registry = Registry::with_events(events_tx);
        let delivery = Delivery::new(registry.clone());
        let router = MessageRouter::new(
            delivery.clone(),
            profiles.clone(),
            message_log.clone(),
            presence.clone(),
        );

        spawn_presence_announcer(events_rx, delivery.clone(), profiles.clone());
        sweeper::spawn_session_sweeper(registry.clone(), presence.sweep_interval());

        Self {
            registry,
            delivery,
            router,
            profiles,
            message_log,
            presence,
        }
    }
}
