//! Per-connection liveness supervision.
//!
//! Every connection gets its own timer task. On each tick the task checks that
//! the connection is still registered, evicts it if nothing has been received for
//! longer than the liveness timeout, and otherwise probes it. A single failed
//! probe is treated as a dead transport; probes are never retried.

use axum::extract::ws::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::protocol::{self, Envelope};
use super::{Connection, EvictReason, Registry};

/// Timing parameters for the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatSettings {
    /// Time between probes.
    pub probe_interval: Duration,
    /// Maximum silence tolerated from the peer. Must exceed `probe_interval`.
    pub liveness_timeout: Duration,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            liveness_timeout: Duration::from_secs(40),
        }
    }
}

/// What a single supervisor tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Probe queued; keep running.
    Probed,
    /// The connection is no longer registered; the task stops itself.
    Detached,
    /// Peer was silent for too long and has been evicted.
    TimedOut,
    /// The probe could not be written and the connection has been evicted.
    ProbeFailed,
}

impl TickOutcome {
    fn keeps_running(self) -> bool {
        matches!(self, Self::Probed)
    }
}

/// Spawn the heartbeat task for `connection` and hand its abort handle to the
/// connection, which cancels it exactly once when it closes.
pub fn start(
    registry: Registry,
    connection: Arc<Connection>,
    settings: HeartbeatSettings,
) -> JoinHandle<()> {
    let task_connection = connection.clone();
    let handle = tokio::spawn(async move {
        run(registry, task_connection, settings).await;
    });
    connection.attach_heartbeat(handle.abort_handle());
    handle
}

async fn run(registry: Registry, connection: Arc<Connection>, settings: HeartbeatSettings) {
    // First probe one interval after open
    let mut ticker = interval_at(
        Instant::now() + settings.probe_interval,
        settings.probe_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let outcome = tick(&registry, &connection, settings.liveness_timeout);
        if !outcome.keeps_running() {
            tracing::debug!(
                connection_id = %connection.id(),
                outcome = ?outcome,
                "Heartbeat task finished"
            );
            break;
        }
    }
}

/// Run one supervisor step for `connection`.
pub fn tick(
    registry: &Registry,
    connection: &Arc<Connection>,
    liveness_timeout: Duration,
) -> TickOutcome {
    let id = connection.id();

    let registered = registry
        .lookup_by_id(&id)
        .is_some_and(|current| Arc::ptr_eq(&current, connection));
    if !registered || !connection.is_open() {
        connection.cancel_heartbeat();
        return TickOutcome::Detached;
    }

    let idle = connection.idle_for();
    if idle > liveness_timeout {
        tracing::warn!(
            connection_id = %id,
            idle_ms = idle.as_millis() as u64,
            "No inbound traffic within liveness timeout"
        );
        registry.evict(&id, EvictReason::HeartbeatTimeout);
        return TickOutcome::TimedOut;
    }

    if let Err(e) = probe(connection) {
        tracing::warn!(connection_id = %id, error = %e, "Heartbeat probe failed");
        registry.evict(&id, EvictReason::WriteFailed);
        return TickOutcome::ProbeFailed;
    }
    TickOutcome::Probed
}

/// Queue a heartbeat envelope followed by a WebSocket ping.
/// Browsers answer the ping with a pong, which counts as inbound traffic.
fn probe(connection: &Connection) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let frame = protocol::encode_frame(&Envelope::heartbeat_now())?;
    connection.send(frame)?;
    connection.send(Message::Ping(Vec::new().into()))?;
    Ok(())
}
