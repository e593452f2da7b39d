//! Connection registry: the single source of truth for who is online.
//!
//! Two views are kept, `by_id` and `by_username`, behind one lock so they are
//! always updated together. Critical sections never perform I/O; callers take
//! `Arc<Connection>` clones out of the registry and write to them unlocked.

use axum::extract::ws::CloseFrame;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{Connection, ConnectionId};

/// Errors returned by registry mutations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Id assignment handed out an id that is already live. Never expected.
    #[error("connection {0} is already registered")]
    DuplicateId(ConnectionId),
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),
}

/// Presence transitions observed by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    /// A username became bound while nobody else held it.
    Joined {
        username: String,
        connection_id: ConnectionId,
    },
    /// A username is no longer bound to any connection.
    Left {
        username: String,
        connection_id: ConnectionId,
    },
}

/// Result of `Registry::bind_username`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindOutcome {
    /// The name was not held by any connection before this call.
    pub newly_online: bool,
    /// Connection that held the name and was demoted to "no username".
    pub displaced: Option<ConnectionId>,
}

/// Why a connection was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    ClientClosed,
    TransportError,
    HeartbeatTimeout,
    WriteFailed,
    Swept,
    Refused,
}

impl EvictReason {
    /// Close frame sent to the peer, when the transport may still be usable.
    pub fn close_frame(&self) -> Option<CloseFrame> {
        let (code, reason) = match self {
            Self::ClientClosed | Self::TransportError | Self::WriteFailed | Self::Swept => {
                return None
            }
            Self::HeartbeatTimeout => (1001, "Heartbeat timeout"),
            Self::Refused => (1011, "Connection refused"),
        };
        Some(CloseFrame {
            code,
            reason: reason.into(),
        })
    }
}

impl fmt::Display for EvictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ClientClosed => "client closed",
            Self::TransportError => "transport error",
            Self::HeartbeatTimeout => "heartbeat timeout",
            Self::WriteFailed => "write failed",
            Self::Swept => "swept",
            Self::Refused => "refused",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Default)]
struct Indices {
    by_id: HashMap<ConnectionId, Arc<Connection>>,
    by_username: HashMap<String, ConnectionId>,
}

/// In-memory registry of live connections.
///
/// Cheap to clone; clones share the same maps. Each server (or test) builds its
/// own instance and injects it where needed.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<Indices>>,
    events: Option<mpsc::UnboundedSender<PresenceEvent>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry that reports presence transitions on `events`.
    pub fn with_events(events: mpsc::UnboundedSender<PresenceEvent>) -> Self {
        Self {
            inner: Arc::default(),
            events: Some(events),
        }
    }

    /// Admit a freshly opened connection.
    pub fn register(&self, connection: Arc<Connection>) -> Result<(), RegistryError> {
        let id = connection.id();
        let mut indices = self.inner.write();
        if indices.by_id.contains_key(&id) {
            return Err(RegistryError::DuplicateId(id));
        }
        indices.by_id.insert(id, connection);
        drop(indices);

        tracing::debug!(connection_id = %id, "Connection registered");
        Ok(())
    }

    /// Bind `username` to connection `id`.
    ///
    /// Last writer wins: if another live connection holds the name it is demoted to
    /// "no username". If this connection held a different name, that name is released.
    pub fn bind_username(
        &self,
        id: &ConnectionId,
        username: &str,
    ) -> Result<BindOutcome, RegistryError> {
        let mut pending = Vec::new();

        // Events are queued before the lock is released so their order matches
        // the order of the index updates. Sending never blocks.
        let outcome = {
            let mut guard = self.inner.write();
            let indices = &mut *guard;
            let connection = indices
                .by_id
                .get(id)
                .cloned()
                .ok_or(RegistryError::UnknownConnection(*id))?;

            let previous_name = connection.username();
            if previous_name.as_deref() == Some(username)
                && indices.by_username.get(username) == Some(id)
            {
                return Ok(BindOutcome {
                    newly_online: false,
                    displaced: None,
                });
            }

            if let Some(old) = previous_name {
                if indices.by_username.get(&old) == Some(id) {
                    indices.by_username.remove(&old);
                    pending.push(PresenceEvent::Left {
                        username: old,
                        connection_id: *id,
                    });
                }
            }

            let displaced = match indices.by_username.insert(username.to_string(), *id) {
                Some(holder) if holder != *id => {
                    if let Some(other) = indices.by_id.get(&holder) {
                        other.set_username(None);
                    }
                    Some(holder)
                }
                _ => None,
            };
            connection.set_username(Some(username.to_string()));

            if displaced.is_none() {
                pending.push(PresenceEvent::Joined {
                    username: username.to_string(),
                    connection_id: *id,
                });
            }

            self.emit(pending);

            BindOutcome {
                newly_online: displaced.is_none(),
                displaced,
            }
        };

        if let Some(holder) = outcome.displaced {
            tracing::info!(
                username = %username,
                connection_id = %id,
                displaced = %holder,
                "Username taken over by newer connection"
            );
        } else {
            tracing::debug!(username = %username, connection_id = %id, "Username bound");
        }

        Ok(outcome)
    }

    pub fn lookup_by_id(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.inner.read().by_id.get(id).cloned()
    }

    pub fn lookup_by_username(&self, username: &str) -> Option<Arc<Connection>> {
        let indices = self.inner.read();
        indices
            .by_username
            .get(username)
            .and_then(|id| indices.by_id.get(id))
            .cloned()
    }

    /// Point-in-time snapshot of every registered connection.
    /// The lock is released before the caller iterates.
    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.inner.read().by_id.values().cloned().collect()
    }

    /// Usernames currently bound, sorted.
    pub fn online_usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().by_username.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn online_count(&self) -> usize {
        self.inner.read().by_username.len()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop a connection from both views. Unknown ids are a no-op.
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let mut indices = self.inner.write();
        let removed = indices.by_id.remove(id);
        let released = removed.as_ref().and_then(|connection| {
            let name = connection.username()?;
            if indices.by_username.get(&name) == Some(id) {
                indices.by_username.remove(&name);
                Some(name)
            } else {
                None
            }
        });

        if let Some(username) = released {
            // Still under the write lock, see bind_username
            self.emit(vec![PresenceEvent::Left {
                username,
                connection_id: *id,
            }]);
        }
        removed
    }

    /// Tear a connection down: remove it from both views, cancel its heartbeat and
    /// release its transport. Safe to call concurrently from any trigger; only the
    /// first call for a given connection has an effect and returns `true`.
    pub fn evict(&self, id: &ConnectionId, reason: EvictReason) -> bool {
        let Some(connection) = self.lookup_by_id(id) else {
            return false;
        };
        if !connection.begin_close() {
            return false;
        }

        self.remove(id);
        connection.finish_close(reason.close_frame());

        tracing::info!(
            connection_id = %id,
            username = connection.username().as_deref().unwrap_or("-"),
            reason = %reason,
            "Connection evicted"
        );
        true
    }

    fn emit(&self, events: Vec<PresenceEvent>) {
        if let Some(tx) = &self.events {
            for event in events {
                // Receiver gone means the server is shutting down
                let _ = tx.send(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::ConnectionState;
    use axum::extract::ws::Message;
    use proptest::prelude::*;
    use std::sync::Barrier;
    use std::thread;

    fn open(registry: &Registry) -> (Arc<Connection>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(16);
        let connection = Arc::new(Connection::new(ConnectionId::new(), tx));
        registry.register(connection.clone()).unwrap();
        (connection, rx)
    }

    /// Every reverse entry points at a registered connection carrying that name.
    fn assert_consistent(registry: &Registry) {
        let indices = registry.inner.read();
        for (name, id) in &indices.by_username {
            let connection = indices
                .by_id
                .get(id)
                .unwrap_or_else(|| panic!("{} maps to missing connection {}", name, id));
            assert_eq!(connection.username().as_deref(), Some(name.as_str()));
        }
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let registry = Registry::new();
        let (connection, _rx) = open(&registry);

        let err = registry.register(connection.clone()).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateId(connection.id()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_bind_and_lookup() {
        let registry = Registry::new();
        let (connection, _rx) = open(&registry);

        let outcome = registry.bind_username(&connection.id(), "alice").unwrap();
        assert!(outcome.newly_online);
        assert_eq!(outcome.displaced, None);

        let found = registry.lookup_by_username("alice").unwrap();
        assert_eq!(found.id(), connection.id());
        assert!(registry.lookup_by_username("bob").is_none());
        assert_consistent(&registry);
    }

    #[test]
    fn test_bind_unknown_connection_fails() {
        let registry = Registry::new();
        let id = ConnectionId::new();
        assert_eq!(
            registry.bind_username(&id, "alice").unwrap_err(),
            RegistryError::UnknownConnection(id)
        );
    }

    #[test]
    fn test_last_writer_wins_demotes_previous_holder() {
        let registry = Registry::new();
        let (first, _rx1) = open(&registry);
        let (second, _rx2) = open(&registry);

        registry.bind_username(&first.id(), "alice").unwrap();
        let outcome = registry.bind_username(&second.id(), "alice").unwrap();

        assert_eq!(outcome.displaced, Some(first.id()));
        assert!(!outcome.newly_online);
        assert_eq!(first.username(), None);
        assert_eq!(
            registry.lookup_by_username("alice").unwrap().id(),
            second.id()
        );
        assert_eq!(registry.len(), 2);
        assert_consistent(&registry);

        // Removing the demoted connection must not release the name
        registry.remove(&first.id());
        assert!(registry.lookup_by_username("alice").is_some());
        assert_consistent(&registry);
    }

    #[test]
    fn test_rebinding_releases_old_name() {
        let registry = Registry::new();
        let (connection, _rx) = open(&registry);

        registry.bind_username(&connection.id(), "alice").unwrap();
        registry.bind_username(&connection.id(), "alicia").unwrap();

        assert!(registry.lookup_by_username("alice").is_none());
        assert_eq!(registry.online_usernames(), vec!["alicia".to_string()]);
        assert_consistent(&registry);
    }

    #[test]
    fn test_remove_is_idempotent_and_clears_both_views() {
        let registry = Registry::new();
        let (connection, _rx) = open(&registry);
        registry.bind_username(&connection.id(), "alice").unwrap();

        assert!(registry.remove(&connection.id()).is_some());
        assert!(registry.remove(&connection.id()).is_none());
        assert!(registry.remove(&ConnectionId::new()).is_none());

        assert!(registry.is_empty());
        assert!(registry.lookup_by_username("alice").is_none());
        assert_eq!(registry.online_count(), 0);
    }

    #[test]
    fn test_snapshot_survives_concurrent_mutation() {
        let registry = Registry::new();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            receivers.push(open(&registry).1);
        }

        let snapshot = registry.all();
        for connection in &snapshot {
            // Mutating while holding the snapshot must not deadlock
            registry.remove(&connection.id());
        }
        assert_eq!(snapshot.len(), 3);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_evict_twice_has_single_effect() {
        let registry = Registry::new();
        let (connection, mut rx) = open(&registry);
        registry.bind_username(&connection.id(), "alice").unwrap();

        assert!(registry.evict(&connection.id(), EvictReason::HeartbeatTimeout));
        assert!(!registry.evict(&connection.id(), EvictReason::HeartbeatTimeout));

        assert!(registry.lookup_by_id(&connection.id()).is_none());
        assert!(registry.lookup_by_username("alice").is_none());
        assert_eq!(connection.state(), ConnectionState::Closed);

        match rx.try_recv() {
            Ok(Message::Close(Some(frame))) => assert_eq!(frame.code, 1001),
            other => panic!("Expected close frame, got: {:?}", other),
        }
        assert!(rx.try_recv().is_err(), "Only one close frame expected");
    }

    #[test]
    fn test_presence_events() {
        let (tx, mut events) = mpsc::unbounded_channel();
        let registry = Registry::with_events(tx);
        let (first, _rx1) = open(&registry);
        let (second, _rx2) = open(&registry);

        registry.bind_username(&first.id(), "alice").unwrap();
        // Same name again: no event
        registry.bind_username(&first.id(), "alice").unwrap();
        // Takeover: the name never went offline
        registry.bind_username(&second.id(), "alice").unwrap();
        registry.evict(&first.id(), EvictReason::ClientClosed);
        registry.evict(&second.id(), EvictReason::ClientClosed);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                PresenceEvent::Joined {
                    username: "alice".to_string(),
                    connection_id: first.id(),
                },
                PresenceEvent::Left {
                    username: "alice".to_string(),
                    connection_id: second.id(),
                },
            ]
        );
    }

    #[test]
    fn test_concurrent_evict_has_single_effect() {
        let reasons = [
            EvictReason::ClientClosed,
            EvictReason::TransportError,
            EvictReason::HeartbeatTimeout,
            EvictReason::WriteFailed,
        ];

        for _ in 0..200 {
            let (tx, mut events) = mpsc::unbounded_channel();
            let registry = Registry::with_events(tx);
            let (connection, mut rx) = open(&registry);
            registry.bind_username(&connection.id(), "alice").unwrap();

            let barrier = Arc::new(Barrier::new(reasons.len()));
            let handles: Vec<_> = reasons
                .into_iter()
                .map(|reason| {
                    let registry = registry.clone();
                    let barrier = barrier.clone();
                    let id = connection.id();
                    thread::spawn(move || {
                        barrier.wait();
                        registry.evict(&id, reason)
                    })
                })
                .collect();
            let winners = handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .filter(|won| *won)
                .count();

            assert_eq!(winners, 1);
            assert!(registry.is_empty());
            assert_eq!(registry.online_count(), 0);
            assert_eq!(connection.state(), ConnectionState::Closed);

            let mut closes = 0;
            while let Ok(frame) = rx.try_recv() {
                if matches!(frame, Message::Close(_)) {
                    closes += 1;
                }
            }
            assert_eq!(closes, 1);

            let mut left = 0;
            while let Ok(event) = events.try_recv() {
                if matches!(event, PresenceEvent::Left { .. }) {
                    left += 1;
                }
            }
            assert_eq!(left, 1);
        }
    }

    #[test]
    fn test_presence_events_follow_index_order_under_races() {
        for _ in 0..200 {
            let (tx, mut events) = mpsc::unbounded_channel();
            let registry = Registry::with_events(tx);
            let (first, _rx1) = open(&registry);
            let (second, _rx2) = open(&registry);
            registry.bind_username(&first.id(), "alice").unwrap();

            let barrier = Arc::new(Barrier::new(2));
            let leaving = {
                let (registry, barrier, id) = (registry.clone(), barrier.clone(), first.id());
                thread::spawn(move || {
                    barrier.wait();
                    registry.remove(&id);
                })
            };
            let joining = {
                let (registry, barrier, id) = (registry.clone(), barrier.clone(), second.id());
                thread::spawn(move || {
                    barrier.wait();
                    registry.bind_username(&id, "alice").unwrap();
                })
            };
            leaving.join().unwrap();
            joining.join().unwrap();

            // Replaying the events must never announce a join for a name that is
            // already online, or a leave for one that is not.
            let mut online = false;
            while let Ok(event) = events.try_recv() {
                match event {
                    PresenceEvent::Joined { .. } => {
                        assert!(!online, "join announced while already online");
                        online = true;
                    }
                    PresenceEvent::Left { .. } => {
                        assert!(online, "leave announced while offline");
                        online = false;
                    }
                }
            }
            assert_eq!(online, registry.lookup_by_username("alice").is_some());
            assert_consistent(&registry);
        }
    }

    #[derive(Debug, Clone)]
    enum Op {
        Register,
        Bind(usize, &'static str),
        Remove(usize),
        Evict(usize),
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Register),
            (any::<usize>(), prop::sample::select(vec!["alice", "bob", "carol"]))
                .prop_map(|(pick, name)| Op::Bind(pick, name)),
            any::<usize>().prop_map(Op::Remove),
            any::<usize>().prop_map(Op::Evict),
        ]
    }

    proptest! {
        /// For any sequence of register/bind/remove/evict, the username index only
        /// references registered connections that carry that name.
        #[test]
        fn registry_stays_consistent(ops in prop::collection::vec(arb_op(), 1..200)) {
            let registry = Registry::new();
            let mut live: Vec<(Arc<Connection>, mpsc::Receiver<Message>)> = Vec::new();

            for op in ops {
                match op {
                    Op::Register => live.push(open(&registry)),
                    Op::Bind(pick, name) if !live.is_empty() => {
                        let (connection, _) = &live[pick % live.len()];
                        registry.bind_username(&connection.id(), name).unwrap();
                    }
                    Op::Remove(pick) if !live.is_empty() => {
                        let (connection, _) = live.remove(pick % live.len());
                        registry.remove(&connection.id());
                        prop_assert!(registry.lookup_by_id(&connection.id()).is_none());
                    }
                    Op::Evict(pick) if !live.is_empty() => {
                        let (connection, _) = live.remove(pick % live.len());
                        prop_assert!(registry.evict(&connection.id(), EvictReason::WriteFailed));
                        prop_assert_eq!(connection.state(), ConnectionState::Closed);
                    }
                    _ => {}
                }
                assert_consistent(&registry);
                prop_assert_eq!(registry.len(), live.len());
                prop_assert!(registry.online_count() <= registry.len());
            }
        }
    }
}
