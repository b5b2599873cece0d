use crate::backend::{BackendKind, Role};

pub const DEFAULT_MAX_PAYLOAD: usize = 4096;
pub const DEFAULT_MESSAGES_PER_TICK: usize = 64;
pub const DEFAULT_VIRTUAL_PORT: u16 = 1;

/// Messaging-layer configuration, fixed at service construction.
#[derive(Debug, Clone)]
pub struct MessagingConfig {
    /// Which transport backend to run. Exactly one is live per process.
    pub backend: BackendKind,
    pub role: Role,
    /// This node's stable identity string.
    pub local_identity: String,
    /// Local bind address for the concrete platform services.
    pub bind_address: String,
    /// Maximum encoded envelope size, applied on send and receive.
    pub max_payload: usize,
    /// Upper bound on inbound messages drained per tick.
    pub max_messages_per_tick: usize,
    /// Peer-datagram only: whether relay routing is permitted.
    pub allow_relay: bool,
    /// Connection-socket only: logical channel number.
    pub virtual_port: u16,
    /// Peer side: the host's address, when known from a connection
    /// string.
    pub host_address: Option<String>,
    /// Peer side: the host's stable identity, when known out-of-band.
    pub host_identity: Option<String>,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::BootstrapChannel,
            role: Role::Host,
            local_identity: "local".to_string(),
            bind_address: "127.0.0.1:0".to_string(),
            max_payload: DEFAULT_MAX_PAYLOAD,
            max_messages_per_tick: DEFAULT_MESSAGES_PER_TICK,
            allow_relay: true,
            virtual_port: DEFAULT_VIRTUAL_PORT,
            host_address: None,
            host_identity: None,
        }
    }
}
