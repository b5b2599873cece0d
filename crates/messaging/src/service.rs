use crate::backend::{BackendEvent, BackendKind, ChannelOrigin, MessagingBackend};
use crate::bootstrap::{BootstrapBackend, BootstrapChannel};
use crate::config::MessagingConfig;
use crate::datagram::PeerDatagramBackend;
use crate::identity::{ConnectionId, ConnectionRoster, PeerIdentity};
use crate::platform::tcp::TcpSocketService;
use crate::platform::udp::UdpSessionService;
use crate::socket::ConnectionSocketBackend;

/// Messages the facade hands to the embedding application, in arrival
/// order within a tick. Arrival order across the primary and fallback
/// channels is not meaningful during a handover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagingEvent {
    /// A message from the host, surfaced on a peer.
    ClientMessageReceived { command: String, data: String },
    /// A message from a mapped peer, surfaced on the host.
    ServerMessageReceived {
        connection: ConnectionId,
        command: String,
        data: String,
    },
}

/// The single entry point the embedding application talks to. Owns
/// exactly one backend, fixed at construction; every operation funnels
/// through it. Before a successful `initialize`, sends answer false or
/// zero and ticks are no-ops.
pub struct MessagingService {
    backend: Box<dyn MessagingBackend>,
    events: Vec<MessagingEvent>,
    initialized: bool,
}

impl MessagingService {
    pub fn new(backend: Box<dyn MessagingBackend>) -> Self {
        Self {
            backend,
            events: Vec::new(),
            initialized: false,
        }
    }

    /// Builds the configured backend over the built-in platform
    /// services. Callers with their own service implementations use
    /// [`MessagingService::new`] instead.
    pub fn from_config(
        config: &MessagingConfig,
        roster: Option<Box<dyn ConnectionRoster>>,
    ) -> Self {
        let identity = PeerIdentity::new(config.local_identity.clone())
            .unwrap_or_else(PeerIdentity::unidentified);
        let backend: Box<dyn MessagingBackend> = match config.backend {
            BackendKind::BootstrapChannel => {
                let mut bootstrap = BootstrapBackend::new(config.role, config.max_payload);
                if let Some(roster) = roster {
                    bootstrap = bootstrap.with_roster(roster);
                }
                Box::new(bootstrap)
            }
            BackendKind::PeerDatagram => {
                let service =
                    UdpSessionService::new(&config.bind_address, identity, config.max_payload);
                Box::new(PeerDatagramBackend::new(config, Box::new(service), roster))
            }
            BackendKind::ConnectionSocket => {
                let service =
                    TcpSocketService::new(&config.bind_address, identity, config.max_payload);
                Box::new(ConnectionSocketBackend::new(
                    config,
                    Box::new(service),
                    roster,
                ))
            }
        };
        Self::new(backend)
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Refuses an unavailable backend rather than limping along half
    /// up. Idempotent once it has succeeded.
    pub fn initialize(&mut self) -> bool {
        if self.initialized {
            return true;
        }
        if !self.backend.is_available() {
            log::warn!("{} backend is not available here", self.backend.kind());
            return false;
        }
        if !self.backend.initialize() {
            log::warn!("{} backend failed to initialize", self.backend.kind());
            return false;
        }
        log::info!("messaging up on {} backend", self.backend.kind());
        self.initialized = true;
        true
    }

    /// Idempotent, safe before `initialize`.
    pub fn shutdown(&mut self) {
        self.backend.shutdown();
        self.events.clear();
        self.initialized = false;
    }

    /// Pumps the backend once and collects its inbound messages. Call
    /// once per simulation update.
    pub fn tick(&mut self) {
        if !self.initialized {
            return;
        }
        self.backend.tick();
        for event in self.backend.drain_events() {
            self.events.push(match event {
                BackendEvent::MessageFromHost { command, data } => {
                    MessagingEvent::ClientMessageReceived { command, data }
                }
                BackendEvent::MessageFromPeer {
                    connection,
                    command,
                    data,
                } => MessagingEvent::ServerMessageReceived {
                    connection,
                    command,
                    data,
                },
            });
        }
    }

    pub fn drain_events(&mut self) -> Vec<MessagingEvent> {
        std::mem::take(&mut self.events)
    }

    /// Peer side: best-effort send to the host.
    pub fn send_to_server(&mut self, command: &str, data: &str) -> bool {
        if !self.initialized {
            return false;
        }
        self.backend.send_to_host(command, data)
    }

    /// Host side: best-effort send to one mapped peer.
    pub fn send_to_client(&mut self, connection: ConnectionId, command: &str, data: &str) -> bool {
        if !self.initialized {
            return false;
        }
        self.backend.send_to_peer(connection, command, data)
    }

    /// Host side: sends to every live peer, returning the number that
    /// actually went out.
    pub fn broadcast_to_clients(&mut self, command: &str, data: &str) -> usize {
        if !self.initialized {
            return 0;
        }
        self.backend.broadcast(command, data)
    }

    /// Registration hook for the collaborator's bootstrap channel
    /// object the moment it spawns.
    pub fn on_channel_ready(&mut self, channel: Box<dyn BootstrapChannel>) {
        self.backend.register_channel(channel);
    }

    /// Inbound bootstrap-channel bytes, pushed by the collaborator.
    pub fn deliver_channel(&mut self, origin: ChannelOrigin, payload: &[u8]) {
        self.backend.deliver_channel(origin, payload);
    }

    /// Supplies the host's stable identity out-of-band (peer side).
    pub fn set_host_identity(&mut self, identity: PeerIdentity) {
        self.backend.set_host_identity(identity);
    }

    pub fn status_info(&self) -> String {
        format!(
            "{} (initialized={})",
            self.backend.status_info(),
            self.initialized
        )
    }
}
