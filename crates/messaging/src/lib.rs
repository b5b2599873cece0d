pub mod backend;
pub mod bootstrap;
pub mod config;
pub mod datagram;
pub mod envelope;
pub mod fallback;
pub mod identity;
pub mod platform;
pub mod service;
pub mod socket;

pub use backend::{BackendEvent, BackendKind, ChannelOrigin, MessagingBackend, Role};
pub use bootstrap::{BootstrapBackend, BootstrapChannel};
pub use config::{
    DEFAULT_MAX_PAYLOAD, DEFAULT_MESSAGES_PER_TICK, DEFAULT_VIRTUAL_PORT, MessagingConfig,
};
pub use datagram::PeerDatagramBackend;
pub use envelope::{Envelope, EnvelopeError, HOST_IDENTITY_COMMAND, WIRE_VERSION};
pub use fallback::FallbackLeg;
pub use identity::{ConnectionId, ConnectionRoster, IdentityMap, PeerIdentity, RosterEntry};
pub use platform::{
    SendResult, SessionConfig, SessionEvent, SessionService, SocketEvent, SocketHandle,
    SocketService,
    tcp::TcpSocketService, udp::UdpSessionService,
};
pub use service::{MessagingEvent, MessagingService};
pub use socket::ConnectionSocketBackend;
