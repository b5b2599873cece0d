use std::fmt;
use std::str::FromStr;

use crate::bootstrap::BootstrapChannel;
use crate::identity::{ConnectionId, PeerIdentity};

/// The closed set of transport backends. Exactly one is active per
/// process, chosen at initialization and fixed for the service's
/// lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Piggybacks on the host application's always-available reliable
    /// channel. Lowest setup cost; also the universal fallback leg.
    BootstrapChannel,
    /// Identity-addressed datagram sessions from the platform service.
    PeerDatagram,
    /// Connection-oriented listen-socket/poll-group service.
    ConnectionSocket,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::BootstrapChannel => "bootstrap-channel",
            BackendKind::PeerDatagram => "peer-datagram",
            BackendKind::ConnectionSocket => "connection-socket",
        };
        f.write_str(name)
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bootstrap-channel" => Ok(BackendKind::BootstrapChannel),
            "peer-datagram" => Ok(BackendKind::PeerDatagram),
            "connection-socket" => Ok(BackendKind::ConnectionSocket),
            other => Err(format!("unknown backend kind: {other}")),
        }
    }
}

/// Which side of the session this node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Peer,
}

impl Role {
    pub fn is_host(self) -> bool {
        matches!(self, Role::Host)
    }
}

/// Inbound messages surfaced by a backend, drained once per tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    MessageFromHost {
        command: String,
        data: String,
    },
    MessageFromPeer {
        connection: ConnectionId,
        command: String,
        data: String,
    },
}

/// Tags inbound bootstrap-channel payloads handed over by the
/// collaborator that owns the underlying networked object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrigin {
    Host,
    Peer(ConnectionId),
}

/// The capability set every transport backend satisfies.
///
/// All sends are best-effort and non-blocking: they report success via
/// boolean/count return values, never retry internally, and never let a
/// failure escape as a panic or error type. `is_available` is checkable
/// before `initialize`, so an unusable backend can be refused at
/// configuration time instead of failing mid-session.
pub trait MessagingBackend {
    fn kind(&self) -> BackendKind;

    /// Whether this backend's prerequisites are met on this platform.
    fn is_available(&self) -> bool;

    /// Brings the backend up. Returns false when prerequisites are not
    /// met; never panics.
    fn initialize(&mut self) -> bool;

    /// Idempotent; releases every owned resource and clears warn-once
    /// state. Safe to call before a successful `initialize`.
    fn shutdown(&mut self);

    /// Drains a bounded batch of pending inbound traffic and refreshes
    /// identity mappings. Called once per simulation update; never
    /// blocks.
    fn tick(&mut self);

    fn send_to_host(&mut self, command: &str, data: &str) -> bool;

    fn send_to_peer(&mut self, connection: ConnectionId, command: &str, data: &str) -> bool;

    /// Sends to every live peer; the count reflects actual successes,
    /// not attempts.
    fn broadcast(&mut self, command: &str, data: &str) -> usize;

    /// One-line human-readable status for diagnostics.
    fn status_info(&self) -> String;

    fn drain_events(&mut self) -> Vec<BackendEvent>;

    /// One-time registration hook, invoked when the collaborator's
    /// singleton networked object becomes ready. Idempotent.
    fn register_channel(&mut self, channel: Box<dyn BootstrapChannel>);

    /// Inbound bootstrap-channel bytes, pushed by the collaborator.
    fn deliver_channel(&mut self, origin: ChannelOrigin, payload: &[u8]);

    /// Supplies the host's stable identity out-of-band (peer side).
    /// No-op where it has no meaning.
    fn set_host_identity(&mut self, identity: PeerIdentity);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parse_round_trip() {
        for kind in [
            BackendKind::BootstrapChannel,
            BackendKind::PeerDatagram,
            BackendKind::ConnectionSocket,
        ] {
            assert_eq!(kind.to_string().parse::<BackendKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_backend_kind_parse_rejects_unknown() {
        assert!("webrtc".parse::<BackendKind>().is_err());
    }
}
