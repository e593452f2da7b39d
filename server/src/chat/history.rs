//! Recent message history for clients joining the room.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::chat::log::LogEntry;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<usize>,
}

/// Clamp a requested page size to `1..=max`. Absent means `max`.
pub fn effective_limit(requested: Option<usize>, max: usize) -> usize {
    requested.unwrap_or(max).clamp(1, max)
}

/// GET /api/messages/recent?limit=N
/// Returns the newest messages first.
pub async fn get_recent_messages(
    State(state): State<AppState>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<Vec<LogEntry>>, StatusCode> {
    let limit = effective_limit(query.limit, state.presence.history_limit);
    let entries = state.message_log.recent(limit).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to load message history");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(entries))
}
