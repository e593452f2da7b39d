//! Presence announcements and the presence snapshot endpoint.
//!
//! The registry reports every username that comes online or goes offline on an
//! event channel. A single announcer task turns those events into `notification`
//! envelopes for the room and records the status on the user's profile.

use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::identity::{PresenceStatus, ProfileResolver};
use crate::state::AppState;
use crate::ws::protocol::{Envelope, Notification, NotificationEvent};
use crate::ws::{Delivery, PresenceEvent};

/// Spawn the announcer. It stops once the registry's event sender is gone.
pub fn spawn_presence_announcer(
    mut events: mpsc::UnboundedReceiver<PresenceEvent>,
    delivery: Delivery,
    profiles: Arc<dyn ProfileResolver>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            announce(&delivery, profiles.as_ref(), event).await;
        }
        tracing::debug!("Presence event channel closed, announcer stopping");
    })
}

/// Broadcast one presence transition and persist the resulting status.
pub async fn announce(delivery: &Delivery, profiles: &dyn ProfileResolver, event: PresenceEvent) {
    let online = delivery.registry().online_count();

    let (username, notification_event, status) = match event {
        PresenceEvent::Joined { username, .. } => {
            (username, NotificationEvent::Join, PresenceStatus::Online)
        }
        PresenceEvent::Left { username, .. } => {
            (username, NotificationEvent::Leave, PresenceStatus::Offline)
        }
    };

    let envelope = Envelope::Notification(Notification {
        event: notification_event,
        username: Some(username.clone()),
        online: Some(online),
    });
    let exclude = match notification_event {
        NotificationEvent::Join => Some(username.as_str()),
        NotificationEvent::Leave => None,
    };
    let report = delivery.broadcast_envelope(&envelope, exclude);

    tracing::info!(
        username = %username,
        event = ?notification_event,
        online = online,
        notified = report.delivered.len(),
        "Presence changed"
    );

    // A leave can be processed after the same user reconnected elsewhere.
    if status == PresenceStatus::Offline
        && delivery.registry().lookup_by_username(&username).is_some()
    {
        return;
    }
    if let Err(e) = profiles.set_status(&username, status).await {
        tracing::warn!(username = %username, error = %e, "Failed to record presence status");
    }
}

#[derive(Debug, Serialize)]
pub struct PresenceResponse {
    /// Bound usernames, sorted.
    pub online: Vec<String>,
    /// All open transport sessions, identified or not.
    pub connections: usize,
}

/// GET /api/presence
pub async fn get_presence(State(state): State<AppState>) -> Json<PresenceResponse> {
    Json(PresenceResponse {
        online: state.registry.online_usernames(),
        connections: state.registry.len(),
    })
}
