use axum::{
    extract::{ConnectInfo, State, WebSocketUpgrade},
    response::Response,
};
use std::net::SocketAddr;

use crate::state::AppState;
use crate::ws::actor;

/// GET /ws
/// WebSocket upgrade endpoint. Identity is declared in-band by the first chat
/// message, so every upgrade is accepted and handed to a connection actor.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    tracing::debug!(peer = %peer, "WebSocket upgrade requested");
    ws.on_upgrade(move |socket| actor::run_connection(socket, state, peer))
}
