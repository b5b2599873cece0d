//! Trait seams for the underlying platform transport services, plus the
//! concrete non-blocking UDP and TCP implementations. Backends receive
//! a boxed service at construction time, so tests and other platforms
//! slot in their own implementations without touching backend logic.

pub mod tcp;
pub mod udp;

use std::fmt;

use crate::identity::PeerIdentity;

/// Outcome of a single service-level send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    Sent,
    /// The destination is not currently reachable on this service.
    NoRoute,
    /// The service refused or failed the send.
    Rejected,
}

/// Events surfaced by an identity-addressed datagram service. A
/// `SessionRequest` for a given identity is emitted ahead of that
/// identity's messages within one poll batch, so an accepting receiver
/// processes them in order without losing first contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SessionRequest { from: PeerIdentity },
    SessionClosed { from: PeerIdentity },
    SessionFailed { from: PeerIdentity, reason: String },
    Message { from: PeerIdentity, payload: Vec<u8> },
}

/// Options applied when a datagram session service is opened.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Whether the service may route traffic through a relay when no
    /// direct path exists.
    pub allow_relay: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { allow_relay: true }
    }
}

/// Session-oriented datagram service addressed by stable peer identity.
/// Session establishment belongs to the service; the messaging layer
/// only accepts or forgets.
pub trait SessionService {
    fn is_available(&self) -> bool;

    fn local_identity(&self) -> &PeerIdentity;

    fn open(&mut self, config: &SessionConfig) -> bool;

    /// Idempotent; releases the underlying socket/session resources.
    fn close(&mut self);

    fn accept(&mut self, from: &PeerIdentity) -> bool;

    fn send(&mut self, to: &PeerIdentity, payload: &[u8], reliable: bool) -> SendResult;

    /// Drains up to `max_events` pending events without blocking.
    fn poll(&mut self, max_events: usize) -> Vec<SessionEvent>;
}

/// Backend-opaque handle to one accepted/outbound connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketHandle(pub u32);

impl fmt::Display for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Events surfaced by a connection-oriented socket service. Sender
/// identity arrives as service metadata; it is never parsed out of the
/// payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// A remote side initiated a connection; it becomes usable only
    /// after `accept`.
    Connecting {
        handle: SocketHandle,
        identity: PeerIdentity,
    },
    Connected {
        handle: SocketHandle,
        identity: PeerIdentity,
    },
    Closed {
        handle: SocketHandle,
    },
    Message {
        handle: SocketHandle,
        identity: PeerIdentity,
        payload: Vec<u8>,
    },
}

/// Connection-oriented service: one listen socket plus a poll group on
/// the host, a single outbound connection on a peer.
pub trait SocketService {
    fn is_available(&self) -> bool;

    fn local_identity(&self) -> &PeerIdentity;

    /// Host side: start listening on the given virtual port.
    fn listen(&mut self, virtual_port: u16) -> bool;

    /// Peer side: connect outward to the host.
    fn connect(&mut self, host: &str, virtual_port: u16) -> Option<SocketHandle>;

    /// Host side: accept a `Connecting` handle into the poll group.
    fn accept(&mut self, handle: SocketHandle) -> bool;

    fn close_connection(&mut self, handle: SocketHandle);

    /// Idempotent; releases the listen socket and every connection.
    fn shutdown(&mut self);

    fn send(&mut self, handle: SocketHandle, payload: &[u8]) -> SendResult;

    /// Drains up to `max_events` pending events without blocking.
    fn poll(&mut self, max_events: usize) -> Vec<SocketEvent>;
}
