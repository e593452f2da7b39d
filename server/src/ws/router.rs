//! Inbound frame classification and dispatch.

use axum::extract::ws::Message;
use std::sync::Arc;

use crate::chat::log::{self, LogEntry, MessageKind, MessageLog};
use crate::config::{IdentityPolicy, PresenceConfig};
use crate::db::StoreError;
use crate::identity::ProfileResolver;

use super::protocol::{self, Envelope, ProtocolError};
use super::{Connection, Delivery, DeliveryReport, RegistryError};

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("username is required")]
    MissingUsername,
    #[error("unknown user `{0}`")]
    UnknownUser(String),
    #[error("identity service unavailable")]
    IdentityUnavailable(#[source] StoreError),
    #[error("unsupported message type `{0}`")]
    Unsupported(&'static str),
    #[error("binary frames are not supported")]
    BinaryFrame,
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// What happened to a successfully routed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// Client heartbeat; liveness was already refreshed by the reader.
    Heartbeat,
    /// Chat or file message handed to the delivery engine.
    Delivered(DeliveryReport),
}

/// Fields shared by every deliverable message kind.
struct Outbound<'a> {
    username: &'a str,
    target: Option<&'a str>,
    kind: MessageKind,
    log_content: &'a str,
}

/// Turns inbound frames into deliveries.
#[derive(Clone)]
pub struct MessageRouter {
    delivery: Delivery,
    profiles: Arc<dyn ProfileResolver>,
    message_log: Arc<dyn MessageLog>,
    presence: Arc<PresenceConfig>,
}

impl MessageRouter {
    pub fn new(
        delivery: Delivery,
        profiles: Arc<dyn ProfileResolver>,
        message_log: Arc<dyn MessageLog>,
        presence: Arc<PresenceConfig>,
    ) -> Self {
        Self {
            delivery,
            profiles,
            message_log,
            presence,
        }
    }

    /// Route one text frame. Any failure becomes a single `error` envelope sent
    /// back to `connection`; nothing is surfaced to the transport.
    pub async fn handle_text_frame(&self, connection: &Arc<Connection>, text: &str) {
        if let Err(e) = self.route(connection, text).await {
            self.reply_error(connection, &e);
        }
    }

    pub fn handle_binary_frame(&self, connection: &Arc<Connection>) {
        self.reply_error(connection, &RouteError::BinaryFrame);
    }

    pub async fn route(&self, connection: &Arc<Connection>, text: &str) -> Result<Routed, RouteError> {
        let envelope = protocol::decode(text)?;

        let outbound = match &envelope {
            Envelope::Heartbeat { .. } => return Ok(Routed::Heartbeat),
            Envelope::Chat(chat) => Outbound {
                username: &chat.username,
                target: chat.target.as_deref(),
                kind: MessageKind::Text,
                log_content: &chat.content,
            },
            Envelope::File(file) => Outbound {
                username: &file.username,
                target: file.target.as_deref(),
                kind: MessageKind::File,
                log_content: &file.file_name,
            },
            Envelope::Error { .. } | Envelope::Notification(_) => {
                return Err(RouteError::Unsupported(envelope.kind()));
            }
        };

        self.bind_identity(connection, outbound.username).await?;

        // Forward the client's frame untouched so unknown extra fields survive.
        let payload = Message::Text(text.to_string().into());
        let target = outbound
            .target
            .filter(|t| !t.is_empty())
            .unwrap_or(&self.presence.broadcast_target);
        let report = if self.presence.is_broadcast(target) {
            self.delivery.broadcast(&payload, Some(outbound.username))
        } else {
            self.delivery.unicast(target, &payload)
        };

        tracing::debug!(
            connection_id = %connection.id(),
            username = %outbound.username,
            target = %target,
            kind = envelope.kind(),
            delivered = report.delivered.len(),
            "Message routed"
        );

        log::append_detached(
            self.message_log.clone(),
            LogEntry::now(outbound.username, outbound.log_content, outbound.kind),
        );

        Ok(Routed::Delivered(report))
    }

    /// Bind the declared username to the connection, validating it first if it
    /// differs from the one already bound.
    async fn bind_identity(&self, connection: &Arc<Connection>, username: &str) -> Result<(), RouteError> {
        if username.trim().is_empty() {
            return Err(RouteError::MissingUsername);
        }
        if connection.username().as_deref() == Some(username) {
            return Ok(());
        }

        if self.presence.identity_policy == IdentityPolicy::Verified {
            match self.profiles.resolve(username).await {
                Ok(Some(_)) => {}
                Ok(None) => return Err(RouteError::UnknownUser(username.to_string())),
                Err(e) => {
                    tracing::error!(username = %username, error = %e, "Profile lookup failed");
                    return Err(RouteError::IdentityUnavailable(e));
                }
            }
        }

        self.delivery
            .registry()
            .bind_username(&connection.id(), username)?;
        Ok(())
    }

    fn reply_error(&self, connection: &Arc<Connection>, error: &RouteError) {
        tracing::debug!(connection_id = %connection.id(), error = %error, "Rejected inbound frame");
        self.delivery
            .send_envelope(connection, &Envelope::error(error.to_string()));
    }
}
