use axum::extract::ws::Message;
use std::sync::Arc;

use super::protocol::{self, Envelope};
use super::{Connection, ConnectionId, EvictReason, Registry};

/// Outcome of one broadcast or unicast pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Connections the payload was queued to.
    pub delivered: Vec<ConnectionId>,
    /// Connections whose write failed and which were evicted as a result.
    pub evicted: Vec<ConnectionId>,
    /// Unicast target was not connected. Not an error.
    pub target_offline: bool,
}

impl DeliveryReport {
    fn offline() -> Self {
        Self {
            target_offline: true,
            ..Self::default()
        }
    }
}

/// Writes payloads to registered connections.
///
/// Writes only enqueue onto each connection's outbound queue, so a slow client
/// never holds up delivery to the others. A failed write is taken as proof the
/// peer is gone: that one connection is evicted and delivery carries on.
#[derive(Debug, Clone)]
pub struct Delivery {
    registry: Registry,
}

impl Delivery {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Send `payload` to every connection except the one bound to `exclude_username`.
    /// Connections that have not identified themselves still receive it.
    pub fn broadcast(&self, payload: &Message, exclude_username: Option<&str>) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        for connection in self.registry.all() {
            if !connection.is_open() {
                continue;
            }
            if exclude_username.is_some() && connection.username().as_deref() == exclude_username {
                continue;
            }
            self.write(&connection, payload.clone(), &mut report);
        }

        tracing::debug!(
            delivered = report.delivered.len(),
            evicted = report.evicted.len(),
            "Broadcast complete"
        );
        report
    }

    /// Send `payload` to the single connection bound to `target_username`.
    pub fn unicast(&self, target_username: &str, payload: &Message) -> DeliveryReport {
        let connection = match self.registry.lookup_by_username(target_username) {
            Some(connection) if connection.is_open() => connection,
            _ => {
                tracing::debug!(target = %target_username, "Unicast target offline");
                return DeliveryReport::offline();
            }
        };

        let mut report = DeliveryReport::default();
        self.write(&connection, payload.clone(), &mut report);
        report
    }

    /// Encode and send an envelope to one connection, e.g. an error reply.
    /// Returns whether the frame was queued.
    pub fn send_envelope(&self, connection: &Arc<Connection>, envelope: &Envelope) -> bool {
        let frame = match protocol::encode_frame(envelope) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(kind = envelope.kind(), error = %e, "Failed to encode envelope");
                return false;
            }
        };
        let mut report = DeliveryReport::default();
        self.write(connection, frame, &mut report);
        !report.delivered.is_empty()
    }

    /// Encode an envelope once and broadcast it.
    pub fn broadcast_envelope(
        &self,
        envelope: &Envelope,
        exclude_username: Option<&str>,
    ) -> DeliveryReport {
        match protocol::encode_frame(envelope) {
            Ok(frame) => self.broadcast(&frame, exclude_username),
            Err(e) => {
                tracing::error!(kind = envelope.kind(), error = %e, "Failed to encode envelope");
                DeliveryReport::default()
            }
        }
    }

    fn write(&self, connection: &Arc<Connection>, payload: Message, report: &mut DeliveryReport) {
        let id = connection.id();
        match connection.send(payload) {
            Ok(()) => report.delivered.push(id),
            Err(e) => {
                tracing::warn!(connection_id = %id, error = %e, "Write failed, evicting connection");
                if self.registry.evict(&id, EvictReason::WriteFailed) {
                    report.evicted.push(id);
                }
            }
        }
    }
}
