use std::collections::{HashMap, HashSet};
use std::fmt;

/// The host application's lightweight per-peer connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub i64);

impl ConnectionId {
    /// Sentinel for "no connection", matching the -1 wire hint.
    pub const UNKNOWN: ConnectionId = ConnectionId(-1);

    pub fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A peer's transport-independent, durable identifier. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        if raw.is_empty() { None } else { Some(Self(raw)) }
    }

    /// Placeholder identity for nodes configured without one.
    pub fn unidentified() -> Self {
        Self("unidentified".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One row of the host application's authoritative connection list.
/// Identity is `None` while the peer's platform handshake is pending.
#[derive(Debug, Clone)]
pub struct RosterEntry {
    pub connection: ConnectionId,
    pub identity: Option<PeerIdentity>,
}

/// Collaborator-supplied view of the live connection list. The identity
/// map is rebuilt from this every tick rather than patched, so stale
/// entries cannot drift across reconnects.
pub trait ConnectionRoster {
    fn connections(&self) -> Vec<RosterEntry>;
}

/// Host-side bidirectional table linking local connection handles to
/// stable identities. An identity maps to at most one live connection.
#[derive(Debug, Default)]
pub struct IdentityMap {
    by_connection: HashMap<ConnectionId, PeerIdentity>,
    by_identity: HashMap<PeerIdentity, ConnectionId>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discards both tables and repopulates them from the roster.
    pub fn rebuild(&mut self, roster: &dyn ConnectionRoster) {
        self.by_connection.clear();
        self.by_identity.clear();

        for entry in roster.connections() {
            let Some(identity) = entry.identity else {
                continue;
            };
            if let Some(existing) = self.by_identity.get(&identity) {
                log::warn!(
                    "identity {} already mapped to connection {}, ignoring duplicate connection {}",
                    identity,
                    existing,
                    entry.connection
                );
                continue;
            }
            self.by_connection.insert(entry.connection, identity.clone());
            self.by_identity.insert(identity, entry.connection);
        }
    }

    pub fn identity_for(&self, connection: ConnectionId) -> Option<&PeerIdentity> {
        self.by_connection.get(&connection)
    }

    pub fn connection_for(&self, identity: &PeerIdentity) -> Option<ConnectionId> {
        self.by_identity.get(identity).copied()
    }

    /// Resolves an inbound sender to a local connection handle: the
    /// envelope's connection hint (validated against the table), then
    /// the cached table, then one forced rebuild as a last resort.
    pub fn resolve_sender(
        &mut self,
        from: &PeerIdentity,
        hint: i64,
        roster: Option<&dyn ConnectionRoster>,
    ) -> Option<ConnectionId> {
        if hint >= 0 {
            let hinted = ConnectionId(hint);
            if self.identity_for(hinted) == Some(from) {
                return Some(hinted);
            }
        }

        if let Some(connection) = self.connection_for(from) {
            return Some(connection);
        }

        let roster = roster?;
        self.rebuild(roster);
        self.connection_for(from)
    }

    pub fn len(&self) -> usize {
        self.by_connection.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_connection.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_connection.clear();
        self.by_identity.clear();
    }
}

/// Connection ids for which a "using fallback" notice has already been
/// logged, so an unresolved peer warns once rather than per message.
#[derive(Debug, Default)]
pub struct WarnOnceSet {
    warned: HashSet<ConnectionId>,
}

impl WarnOnceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true the first time a connection id is inserted.
    pub fn insert(&mut self, connection: ConnectionId) -> bool {
        self.warned.insert(connection)
    }

    pub fn contains(&self, connection: ConnectionId) -> bool {
        self.warned.contains(&connection)
    }

    pub fn clear(&mut self) {
        self.warned.clear();
    }
}
