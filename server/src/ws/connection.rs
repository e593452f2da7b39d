use axum::extract::ws::{CloseFrame, Message};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::{ConnectionId, ConnectionSender};

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Why an outbound write was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("connection is not open")]
    NotOpen,
    #[error("outbound queue is full")]
    QueueFull,
    #[error("writer task has gone away")]
    Disconnected,
}

/// One live client session.
///
/// The WebSocket sink itself lives in the connection's writer task; this struct
/// holds the sending side of the writer's queue, so every outbound frame for the
/// session is serialized through a single writer. All mutation goes through
/// interior mutability so the connection can be shared as `Arc<Connection>`
/// between the reader loop, the heartbeat task and delivery.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    outbound: ConnectionSender,
    username: Mutex<Option<String>>,
    state: AtomicU8,
    last_seen: Mutex<Instant>,
    heartbeat: Mutex<Option<AbortHandle>>,
    closed: CancellationToken,
}

impl Connection {
    pub fn new(id: ConnectionId, outbound: ConnectionSender) -> Self {
        Self {
            id,
            outbound,
            username: Mutex::new(None),
            state: AtomicU8::new(ConnectionState::Open as u8),
            last_seen: Mutex::new(Instant::now()),
            heartbeat: Mutex::new(None),
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Username currently bound to this connection, if it has identified itself.
    pub fn username(&self) -> Option<String> {
        self.username.lock().clone()
    }

    /// Only the registry changes the username, so both indices stay in step.
    pub(crate) fn set_username(&self, username: Option<String>) {
        *self.username.lock() = username;
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Record inbound activity. Called for every frame the peer sends.
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn last_seen(&self) -> Instant {
        *self.last_seen.lock()
    }

    /// Time elapsed since the last inbound frame.
    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_seen())
    }

    /// True once the writer task has dropped its receiver.
    pub fn outbound_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Queue a frame for the writer task without waiting.
    ///
    /// A full queue means the peer is not draining its socket; callers treat it the
    /// same as a dead transport.
    pub fn send(&self, message: Message) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::NotOpen);
        }
        self.outbound.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => SendError::QueueFull,
            TrySendError::Closed(_) => SendError::Disconnected,
        })
    }

    /// Hand the connection its heartbeat task.
    /// If the connection is already closing the task is aborted straight away.
    pub fn attach_heartbeat(&self, handle: AbortHandle) {
        let mut slot = self.heartbeat.lock();
        if !self.is_open() {
            handle.abort();
            return;
        }
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    /// Abort the heartbeat task. Returns `false` if there was nothing left to cancel.
    pub fn cancel_heartbeat(&self) -> bool {
        match self.heartbeat.lock().take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Win the right to tear this connection down. Only the first caller gets `true`.
    pub(crate) fn begin_close(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Open as u8,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Release everything the connection owns. Must follow a successful `begin_close`.
    pub(crate) fn finish_close(&self, frame: Option<CloseFrame>) {
        self.cancel_heartbeat();
        // Best effort: if the queue is full the close signal still stops the writer.
        let _ = self.outbound.try_send(Message::Close(frame));
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        self.closed.cancel();
    }

    /// Tear down a connection that is not (or no longer) in a registry.
    pub fn close(&self, frame: Option<CloseFrame>) -> bool {
        if !self.begin_close() {
            return false;
        }
        self.finish_close(frame);
        true
    }

    /// Resolves once the connection has been closed by any path.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }
}
