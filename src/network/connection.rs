//! Connection Handles
//!
//! Per-connection state shared between the read loop, the heartbeat task,
//! and the session registry. Players never hold a reference to a connection
//! directly; they hold a [`ConnectionId`] that is looked up in the
//! [`ConnectionTable`], so a retired connection can never dangle.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::network::protocol::WireMessage;

/// Unique connection identifier, issued by the accept loop.
pub type ConnectionId = u64;

/// Connection state shared across tasks.
///
/// The `is_alive` flag carries the whole heartbeat state machine: `true`
/// means the peer has answered since the last probe, `false` means a probe
/// is outstanding.
#[derive(Debug)]
pub struct ConnectionShared {
    /// Connection identifier.
    pub id: ConnectionId,
    /// Outbound frame channel, drained by the connection's writer task.
    outbound: mpsc::Sender<WireMessage>,
    /// Liveness flag for the heartbeat protocol.
    is_alive: AtomicBool,
    /// Cancelled exactly once, when the connection is torn down.
    cancel: CancellationToken,
}

impl ConnectionShared {
    fn new(id: ConnectionId, outbound: mpsc::Sender<WireMessage>) -> Self {
        Self {
            id,
            outbound,
            is_alive: AtomicBool::new(true),
            cancel: CancellationToken::new(),
        }
    }

    /// Record a heartbeat reply from the peer.
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
    }

    /// Read and clear the liveness flag in one step.
    ///
    /// Returns the flag as it was before clearing: `false` means the peer
    /// never answered the previous probe.
    pub fn take_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Queue a frame for the peer. Delivery failures mean the writer task
    /// is gone, which the read loop will notice on its own.
    pub async fn send(&self, msg: WireMessage) {
        let _ = self.outbound.send(msg).await;
    }

    /// Force the connection down with no close handshake.
    pub fn force_close(&self) {
        self.cancel.cancel();
    }

    /// Token observed by the read loop and the heartbeat task.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// A player identity bound to a connection.
///
/// Installing this is what arms the session-scoped message listener
/// (`leave_game` and `error` interception) and the terminate hook.
#[derive(Debug, Clone)]
pub struct SessionBinding {
    /// The bound player's username.
    pub username: String,
}

/// The read loop's view of one connection.
///
/// Owns the session binding; everything else is shared via
/// [`ConnectionShared`].
#[derive(Debug)]
pub struct ConnectionHandle {
    shared: Arc<ConnectionShared>,
    binding: Option<SessionBinding>,
}

impl ConnectionHandle {
    /// Connection identifier.
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// Shared state, for the heartbeat task and the connection table.
    pub fn shared(&self) -> Arc<ConnectionShared> {
        self.shared.clone()
    }

    /// Queue a frame for the peer.
    pub async fn send(&self, msg: WireMessage) {
        self.shared.send(msg).await;
    }

    /// Record a heartbeat reply.
    pub fn mark_alive(&self) {
        self.shared.mark_alive();
    }

    /// Install the session-scoped listener and terminate hook.
    pub fn bind(&mut self, username: &str) {
        self.binding = Some(SessionBinding {
            username: username.to_string(),
        });
    }

    /// Remove the listener and terminate hook. Idempotent.
    pub fn unbind(&mut self) -> Option<SessionBinding> {
        self.binding.take()
    }

    /// Username this connection is bound to, if any.
    pub fn bound_username(&self) -> Option<&str> {
        self.binding.as_ref().map(|b| b.username.as_str())
    }
}

/// Registry of live connections, keyed by id.
///
/// Entries exist from accept until transport close; a lookup after
/// retirement returns `None`.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    next_id: ConnectionId,
    entries: BTreeMap<ConnectionId, Arc<ConnectionShared>>,
}

impl ConnectionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a new connection and hand back its handle.
    pub fn register(&mut self, outbound: mpsc::Sender<WireMessage>) -> ConnectionHandle {
        let id = self.next_id;
        self.next_id += 1;

        let shared = Arc::new(ConnectionShared::new(id, outbound));
        self.entries.insert(id, shared.clone());

        ConnectionHandle {
            shared,
            binding: None,
        }
    }

    /// Look up a live connection.
    pub fn get(&self, id: ConnectionId) -> Option<&Arc<ConnectionShared>> {
        self.entries.get(&id)
    }

    /// Retire a closed connection. Returns true if it was present.
    pub fn retire(&mut self, id: ConnectionId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether any connections are live.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_table_entry(table: &mut ConnectionTable) -> ConnectionHandle {
        let (tx, _rx) = mpsc::channel(8);
        table.register(tx)
    }

    #[test]
    fn test_register_assigns_distinct_ids() {
        let mut table = ConnectionTable::new();
        let a = make_table_entry(&mut table);
        let b = make_table_entry(&mut table);

        assert_ne!(a.id(), b.id());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_retired_lookup_is_absent() {
        let mut table = ConnectionTable::new();
        let conn = make_table_entry(&mut table);
        let id = conn.id();

        assert!(table.get(id).is_some());
        assert!(table.retire(id));
        assert!(table.get(id).is_none());
        // Second retire is a no-op.
        assert!(!table.retire(id));
    }

    #[test]
    fn test_alive_flag_take_and_mark() {
        let mut table = ConnectionTable::new();
        let conn = make_table_entry(&mut table);
        let shared = conn.shared();

        // Starts alive; taking it clears it.
        assert!(shared.take_alive());
        assert!(!shared.take_alive());

        shared.mark_alive();
        assert!(shared.take_alive());
    }

    #[test]
    fn test_bind_unbind_idempotent() {
        let mut table = ConnectionTable::new();
        let mut conn = make_table_entry(&mut table);

        assert!(conn.bound_username().is_none());
        conn.bind("Digitalis");
        assert_eq!(conn.bound_username(), Some("Digitalis"));

        assert!(conn.unbind().is_some());
        assert!(conn.unbind().is_none());
        assert!(conn.bound_username().is_none());
    }

    #[tokio::test]
    async fn test_send_reaches_writer_channel() {
        let mut table = ConnectionTable::new();
        let (tx, mut rx) = mpsc::channel(8);
        let conn = table.register(tx);

        conn.send(WireMessage::Ping).await;
        assert_eq!(rx.recv().await, Some(WireMessage::Ping));
    }
}
