pub mod actor;
pub mod connection;
pub mod delivery;
pub mod handler;
pub mod heartbeat;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod sweeper;

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

pub use connection::{Connection, ConnectionState};
pub use delivery::{Delivery, DeliveryReport};
pub use registry::{EvictReason, PresenceEvent, Registry, RegistryError};

/// Sender half of a connection's outbound queue.
/// The matching receiver is owned by the connection's writer task, which is the
/// only code allowed to touch the WebSocket sink.
pub type ConnectionSender = mpsc::Sender<axum::extract::ws::Message>;

/// Opaque, process-unique identifier assigned to a transport session at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Allocate a fresh id (UUIDv7, time ordered).
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
