//! Session Registry
//!
//! Maps player identities (usernames) to their current connection, if any.
//! Identity is decoupled from transport lifetime: a Player record survives
//! disconnects so the same username can rejoin and resume. A second login
//! while the first connection is live is rejected rather than displacing it,
//! so one identity is never controlled from two places.

use std::collections::BTreeMap;

use tracing::{error, info};

use crate::network::connection::{ConnectionHandle, ConnectionId, ConnectionTable};
use crate::network::protocol::ProtocolError;

/// A persistent player identity.
///
/// Created on first successful join for a username; never destroyed for the
/// lifetime of the process.
#[derive(Debug, Clone)]
pub struct Player {
    /// Unique player name.
    pub username: String,
    /// The connection currently controlling this identity, if any.
    /// Held as an id into the connection table, never a direct reference.
    pub active_connection: Option<ConnectionId>,
}

/// Outcome of a join attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The connection is now bound to the identity.
    Joined {
        /// True when an existing identity was resumed rather than created.
        rejoin: bool,
    },
    /// The attempt was refused; the caller replies with this error.
    Rejected(ProtocolError),
}

/// Process-wide username → [`Player`] map.
///
/// An explicitly owned instance, injected into whatever routes messages;
/// unit tests run against independent registries.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    players: BTreeMap<String, Player>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `conn` to `username`.
    ///
    /// First join creates the identity, rejoin resumes it; a username bound
    /// to a live connection is refused with `username_in_use` and the
    /// existing binding is untouched. On success the connection's scoped
    /// listener and terminate hook are installed via [`ConnectionHandle::bind`].
    pub fn join_game(
        &mut self,
        table: &ConnectionTable,
        conn: &mut ConnectionHandle,
        username: &str,
    ) -> JoinOutcome {
        if username.is_empty() {
            return JoinOutcome::Rejected(ProtocolError::BlankUsername);
        }

        let rejoin = match self.players.get_mut(username) {
            None => {
                self.players.insert(
                    username.to_string(),
                    Player {
                        username: username.to_string(),
                        active_connection: Some(conn.id()),
                    },
                );
                info!(username, connection = conn.id(), "player joined game");
                false
            }
            Some(player) => {
                // A stale id whose connection has been retired counts as
                // absent; only a live connection occupies the identity.
                let occupied = player
                    .active_connection
                    .is_some_and(|id| table.get(id).is_some());
                if occupied {
                    return JoinOutcome::Rejected(ProtocolError::UsernameInUse);
                }
                player.active_connection = Some(conn.id());
                info!(username, connection = conn.id(), "player rejoined game");
                true
            }
        };

        // Upstream behavior preserved: a connection already bound to another
        // name rebinds here without releasing the old identity, which stays
        // marked active until the transport closes.
        conn.bind(username);
        JoinOutcome::Joined { rejoin }
    }

    /// Release `conn`'s player binding.
    ///
    /// Idempotent: a connection with no binding is left alone. This is also
    /// the terminate hook; the close path calls it unconditionally.
    pub fn leave_game(&mut self, conn: &mut ConnectionHandle) -> bool {
        let Some(binding) = conn.unbind() else {
            return false;
        };

        if let Some(player) = self.players.get_mut(&binding.username) {
            if player.active_connection == Some(conn.id()) {
                player.active_connection = None;
            }
        }

        info!(username = %binding.username, connection = conn.id(), "player left game");
        true
    }

    /// Log an error report from a bound peer, tagged with its username.
    pub fn log_peer_error(&self, username: &str, error: ProtocolError) {
        error!(username, error = error.as_str(), "peer reported error");
    }

    /// Look up a player record.
    pub fn player(&self, username: &str) -> Option<&Player> {
        self.players.get(username)
    }

    /// Number of known identities (bound or not).
    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Number of identities with a live connection.
    pub fn active_player_count(&self) -> usize {
        self.players
            .values()
            .filter(|p| p.active_connection.is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn make_conn(table: &mut ConnectionTable) -> ConnectionHandle {
        let (tx, _rx) = mpsc::channel(8);
        table.register(tx)
    }

    #[test]
    fn test_first_join_creates_player() {
        let mut table = ConnectionTable::new();
        let mut registry = SessionRegistry::new();
        let mut conn = make_conn(&mut table);

        let outcome = registry.join_game(&table, &mut conn, "ada");
        assert_eq!(outcome, JoinOutcome::Joined { rejoin: false });
        assert_eq!(conn.bound_username(), Some("ada"));
        assert_eq!(
            registry.player("ada").unwrap().active_connection,
            Some(conn.id())
        );
    }

    #[test]
    fn test_second_join_while_active_is_rejected() {
        let mut table = ConnectionTable::new();
        let mut registry = SessionRegistry::new();
        let mut conn_a = make_conn(&mut table);
        let mut conn_b = make_conn(&mut table);

        registry.join_game(&table, &mut conn_a, "ada");
        let outcome = registry.join_game(&table, &mut conn_b, "ada");

        assert_eq!(
            outcome,
            JoinOutcome::Rejected(ProtocolError::UsernameInUse)
        );
        // Existing binding untouched, new connection not attached.
        assert_eq!(
            registry.player("ada").unwrap().active_connection,
            Some(conn_a.id())
        );
        assert!(conn_b.bound_username().is_none());
    }

    #[test]
    fn test_leave_then_rejoin_keeps_identity() {
        let mut table = ConnectionTable::new();
        let mut registry = SessionRegistry::new();
        let mut conn_a = make_conn(&mut table);
        let mut conn_b = make_conn(&mut table);

        registry.join_game(&table, &mut conn_a, "ada");
        assert!(registry.leave_game(&mut conn_a));

        let outcome = registry.join_game(&table, &mut conn_b, "ada");
        assert_eq!(outcome, JoinOutcome::Joined { rejoin: true });
        assert_eq!(registry.player_count(), 1);
        assert_eq!(
            registry.player("ada").unwrap().active_connection,
            Some(conn_b.id())
        );
    }

    #[test]
    fn test_blank_username_rejected_without_state_change() {
        let mut table = ConnectionTable::new();
        let mut registry = SessionRegistry::new();
        let mut conn = make_conn(&mut table);

        let outcome = registry.join_game(&table, &mut conn, "");
        assert_eq!(
            outcome,
            JoinOutcome::Rejected(ProtocolError::BlankUsername)
        );
        assert_eq!(registry.player_count(), 0);
        assert!(conn.bound_username().is_none());
    }

    #[test]
    fn test_leave_is_idempotent() {
        let mut table = ConnectionTable::new();
        let mut registry = SessionRegistry::new();
        let mut conn = make_conn(&mut table);

        registry.join_game(&table, &mut conn, "ada");
        assert!(registry.leave_game(&mut conn));
        assert!(!registry.leave_game(&mut conn));
        assert!(registry.player("ada").unwrap().active_connection.is_none());
    }

    #[test]
    fn test_retired_connection_does_not_occupy_identity() {
        let mut table = ConnectionTable::new();
        let mut registry = SessionRegistry::new();
        let mut conn_a = make_conn(&mut table);
        let mut conn_b = make_conn(&mut table);

        registry.join_game(&table, &mut conn_a, "ada");
        // Connection retired without the terminate hook running (it should
        // not happen, but a stale id must never block the identity).
        table.retire(conn_a.id());

        let outcome = registry.join_game(&table, &mut conn_b, "ada");
        assert_eq!(outcome, JoinOutcome::Joined { rejoin: true });
    }

    #[test]
    fn test_active_player_count() {
        let mut table = ConnectionTable::new();
        let mut registry = SessionRegistry::new();
        let mut conn_a = make_conn(&mut table);
        let mut conn_b = make_conn(&mut table);

        registry.join_game(&table, &mut conn_a, "ada");
        registry.join_game(&table, &mut conn_b, "brin");
        assert_eq!(registry.active_player_count(), 2);

        registry.leave_game(&mut conn_a);
        assert_eq!(registry.active_player_count(), 1);
        assert_eq!(registry.player_count(), 2);
    }
}
