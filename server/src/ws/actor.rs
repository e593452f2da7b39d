use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::state::AppState;
use crate::ws::{heartbeat, Connection, ConnectionId, EvictReason, Registry};

/// How long the writer may keep flushing queued frames once the reader is done.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Run the actor-per-connection pattern for one WebSocket.
///
/// Splits the WebSocket into reader and writer halves:
/// - Writer task: sole owner of the sink, drains the connection's outbound queue
/// - Reader loop: refreshes liveness and hands frames to the message router
///
/// Everything else (delivery, heartbeat, eviction) reaches the client only through
/// the bounded outbound queue.
pub async fn run_connection(mut socket: WebSocket, state: AppState, peer: SocketAddr) {
    let (tx, rx) = mpsc::channel::<Message>(state.presence.outbound_queue_capacity);
    let connection = Arc::new(Connection::new(ConnectionId::new(), tx));
    let id = connection.id();

    if let Err(e) = state.registry.register(connection.clone()) {
        tracing::error!(connection_id = %id, peer = %peer, error = %e, "Refusing connection");
        connection.close(None);
        let _ = socket
            .send(Message::Close(EvictReason::Refused.close_frame()))
            .await;
        return;
    }

    tracing::info!(connection_id = %id, peer = %peer, "WebSocket actor started");

    let (ws_sender, mut ws_receiver) = socket.split();
    let mut writer_handle = tokio::spawn(writer_task(
        ws_sender,
        rx,
        connection.clone(),
        state.registry.clone(),
    ));

    heartbeat::start(
        state.registry.clone(),
        connection.clone(),
        state.presence.heartbeat(),
    );

    // Reader loop: runs until the peer goes away or the connection is evicted
    let reason = loop {
        let frame = tokio::select! {
            _ = connection.closed() => break None,
            frame = ws_receiver.next() => frame,
        };

        match frame {
            Some(Ok(msg)) => {
                connection.touch();
                match msg {
                    Message::Text(text) => {
                        state.router.handle_text_frame(&connection, text.as_str()).await;
                    }
                    Message::Binary(_) => state.router.handle_binary_frame(&connection),
                    // axum answers pings itself; either way the peer is alive
                    Message::Ping(_) | Message::Pong(_) => {}
                    Message::Close(frame) => {
                        tracing::info!(
                            connection_id = %id,
                            reason = ?frame,
                            "Client initiated close"
                        );
                        break Some(EvictReason::ClientClosed);
                    }
                }
            }
            Some(Err(e)) => {
                tracing::warn!(
                    connection_id = %id,
                    error = %e,
                    "WebSocket receive error"
                );
                break Some(EvictReason::TransportError);
            }
            None => {
                tracing::info!(connection_id = %id, "WebSocket stream ended");
                break Some(EvictReason::ClientClosed);
            }
        }
    };

    if let Some(reason) = reason {
        state.registry.evict(&id, reason);
    }

    if timeout(WRITER_DRAIN_TIMEOUT, &mut writer_handle).await.is_err() {
        tracing::debug!(connection_id = %id, "Writer did not drain in time");
        writer_handle.abort();
    }

    tracing::info!(
        connection_id = %id,
        username = connection.username().as_deref().unwrap_or("-"),
        "WebSocket actor stopped"
    );
}

/// Writer task: forwards queued frames to the WebSocket sink.
///
/// Queued frames take priority over the close signal, so the close frame pushed
/// during eviction still goes out. Stops after sending a close frame.
async fn writer_task(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
    connection: Arc<Connection>,
    registry: Registry,
) {
    loop {
        let msg = tokio::select! {
            biased;
            msg = rx.recv() => msg,
            _ = connection.closed() => None,
        };
        let Some(msg) = msg else { break };

        let is_close = matches!(msg, Message::Close(_));
        if let Err(e) = ws_sender.send(msg).await {
            if connection.is_open() {
                tracing::warn!(
                    connection_id = %connection.id(),
                    error = %e,
                    "WebSocket send failed"
                );
                registry.evict(&connection.id(), EvictReason::WriteFailed);
            }
            return;
        }
        if is_close {
            break;
        }
    }
    let _ = ws_sender.close().await;
}
