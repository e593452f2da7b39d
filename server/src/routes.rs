use axum::{routing::get, Router};

use crate::chat::{history, presence};
use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Build the full axum Router.
pub fn build_router(state: AppState) -> Router {
    let ws_routes = Router::new().route("/ws", get(ws_handler::ws_upgrade));

    let api_routes = Router::new()
        .route("/api/presence", get(presence::get_presence))
        .route("/api/messages/recent", get(history::get_recent_messages));

    let health = Router::new().route("/health", get(health_check));

    Router::new()
        .merge(ws_routes)
        .merge(api_routes)
        .merge(health)
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
