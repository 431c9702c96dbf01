// Connection sessions and room membership.
//
// The registry is plain owned state held by the lifecycle engine — there is
// no process-global map. It tracks, per live connection, the generated
// player identity, the outbound message channel, and the at-most-one race
// the connection is attached to; and per race, the set of attached
// connections. Broadcast fan-out lives here because it is purely a
// membership concern: the engine hands it a serialized frame and a room.

use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;
use tracing::debug;

/// Process-local identifier for one live connection. Assigned by the
/// transport layer, never reused within a process lifetime.
pub type ConnectionId = u64;

/// Ephemeral per-connection state. Created on connect, destroyed on
/// disconnect; never persisted.
#[derive(Debug)]
pub struct Session {
    /// Generated player identity, stable for the connection's lifetime.
    pub player_id: String,
    /// The race this connection is attached to, if any.
    pub race_id: Option<String>,
    /// Outbound channel to the connection's socket writer task. A closed
    /// channel means the writer is gone and the connection is stale.
    sender: mpsc::UnboundedSender<String>,
}

/// Connection-membership index: sessions by connection id, member sets by
/// race id. Invariant: a connection appears in at most one member set, and
/// that set's race id matches the session's `race_id`.
#[derive(Debug, Default)]
pub struct Registry {
    sessions: HashMap<ConnectionId, Session>,
    rooms: HashMap<String, HashSet<ConnectionId>>,
}

/// Generate a player identifier for a new connection.
fn generate_player_id() -> String {
    format!("p_{:08x}", rand::random::<u32>())
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Create a session for a newly connected client and return its
    /// generated player id.
    pub fn register(
        &mut self,
        conn: ConnectionId,
        sender: mpsc::UnboundedSender<String>,
    ) -> String {
        let player_id = generate_player_id();
        self.sessions.insert(
            conn,
            Session {
                player_id: player_id.clone(),
                race_id: None,
                sender,
            },
        );
        player_id
    }

    /// Destroy a session, detaching it from its race first. Returns the
    /// removed session, or `None` for an unknown connection.
    pub fn unregister(&mut self, conn: ConnectionId) -> Option<Session> {
        self.detach(conn);
        self.sessions.remove(&conn)
    }

    pub fn session(&self, conn: ConnectionId) -> Option<&Session> {
        self.sessions.get(&conn)
    }

    /// Attach a connection to a race. A connection belongs to at most one
    /// race, so any previous attachment is dropped first.
    pub fn attach(&mut self, conn: ConnectionId, race_id: &str) {
        self.detach(conn);
        let Some(session) = self.sessions.get_mut(&conn) else {
            return;
        };
        session.race_id = Some(race_id.to_string());
        self.rooms.entry(race_id.to_string()).or_default().insert(conn);
    }

    /// Detach a connection from whatever race it is attached to. Detaching
    /// an unattached (or unknown) connection is a no-op. When the last
    /// member of a race detaches, the membership set is evicted. Returns
    /// the race id the connection was attached to, if any.
    pub fn detach(&mut self, conn: ConnectionId) -> Option<String> {
        let session = self.sessions.get_mut(&conn)?;
        let race_id = session.race_id.take()?;
        if let Some(members) = self.rooms.get_mut(&race_id) {
            members.remove(&conn);
            if members.is_empty() {
                self.rooms.remove(&race_id);
            }
        }
        Some(race_id)
    }

    /// Connections currently attached to a race. Order is unspecified.
    pub fn members_of(&self, race_id: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(race_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Send a frame to a single connection. Returns `false` if the
    /// connection is unknown or its outbound channel is closed; the caller
    /// decides whether that warrants pruning.
    pub fn send_to(&self, conn: ConnectionId, frame: &str) -> bool {
        match self.sessions.get(&conn) {
            Some(session) => session.sender.send(frame.to_string()).is_ok(),
            None => false,
        }
    }

    /// Deliver a frame to every member of a race, optionally excluding one
    /// connection (typically the sender).
    ///
    /// Delivery is best-effort and unordered: a failed send to one member
    /// never aborts delivery to the rest. A member whose outbound channel
    /// is closed is stale — its membership and session are removed here so
    /// leaked registrations heal themselves.
    pub fn broadcast(&mut self, race_id: &str, frame: &str, exclude: Option<ConnectionId>) {
        let mut stale = Vec::new();
        for conn in self.members_of(race_id) {
            if Some(conn) == exclude {
                continue;
            }
            if !self.send_to(conn, frame) {
                stale.push(conn);
            }
        }
        for conn in stale {
            debug!("Pruning stale connection {} from race {}", conn, race_id);
            self.unregister(conn);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
