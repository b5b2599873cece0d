use std::collections::{HashMap, VecDeque};

use crate::backend::{BackendEvent, BackendKind, ChannelOrigin, MessagingBackend, Role};
use crate::bootstrap::BootstrapChannel;
use crate::config::MessagingConfig;
use crate::envelope::{Envelope, HOST_IDENTITY_COMMAND};
use crate::fallback::FallbackLeg;
use crate::identity::{ConnectionId, ConnectionRoster, IdentityMap, PeerIdentity};
use crate::platform::{SendResult, SocketEvent, SocketHandle, SocketService};

/// Transport backend over connection-oriented sockets: the host runs a
/// listen socket and one poll group that all accepted connections join;
/// peers connect outward to the host.
///
/// The send path mirrors the datagram backend's resolve-then-fallback
/// logic, except that resolution ends at a socket handle instead of a
/// session identity, and a failed service send degrades to the
/// bootstrap leg the same way a missing mapping does.
pub struct ConnectionSocketBackend {
    role: Role,
    max_payload: usize,
    max_messages_per_tick: usize,
    virtual_port: u16,
    service: Box<dyn SocketService>,
    roster: Option<Box<dyn ConnectionRoster>>,
    identity_map: IdentityMap,
    fallback: FallbackLeg,
    host_address: Option<String>,
    host_identity: Option<PeerIdentity>,
    host_handle: Option<SocketHandle>,
    handles: HashMap<PeerIdentity, SocketHandle>,
    peers: HashMap<SocketHandle, PeerIdentity>,
    events: VecDeque<BackendEvent>,
    initialized: bool,
    retry_connect: bool,
}

impl ConnectionSocketBackend {
    pub fn new(
        config: &MessagingConfig,
        service: Box<dyn SocketService>,
        roster: Option<Box<dyn ConnectionRoster>>,
    ) -> Self {
        let host_identity = config
            .host_identity
            .as_deref()
            .and_then(PeerIdentity::new);
        Self {
            role: config.role,
            max_payload: config.max_payload,
            max_messages_per_tick: config.max_messages_per_tick,
            virtual_port: config.virtual_port,
            service,
            roster,
            identity_map: IdentityMap::new(),
            fallback: FallbackLeg::new(config.role, config.max_payload),
            host_address: config.host_address.clone(),
            host_identity,
            host_handle: None,
            handles: HashMap::new(),
            peers: HashMap::new(),
            events: VecDeque::new(),
            initialized: false,
            retry_connect: true,
        }
    }

    fn connect_target(&self) -> Option<String> {
        self.host_address
            .clone()
            .or_else(|| self.host_identity.as_ref().map(|i| i.to_string()))
    }

    /// One connect attempt per trigger (initialize, hint update, close)
    /// rather than per tick, so an unreachable host does not stall the
    /// tick loop.
    fn try_connect_host(&mut self) {
        if self.role.is_host() || self.host_handle.is_some() || !self.retry_connect {
            return;
        }
        self.retry_connect = false;
        let Some(target) = self.connect_target() else {
            return;
        };
        match self.service.connect(&target, self.virtual_port) {
            Some(handle) => {
                log::debug!("connected to host {target} as {handle}");
                self.host_handle = Some(handle);
            }
            None => log::warn!("connect to host {target} failed, staying on bootstrap"),
        }
    }

    fn encode_outbound(&self, command: &str, data: &str) -> Option<Vec<u8>> {
        let envelope = Envelope::new(command, data)
            .with_peer_hint(self.service.local_identity().as_str());
        let bytes = match envelope.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("refusing to send malformed envelope: {e}");
                return None;
            }
        };
        if bytes.len() > self.max_payload {
            log::warn!(
                "refusing to send {} byte envelope (max {})",
                bytes.len(),
                self.max_payload
            );
            return None;
        }
        Some(bytes)
    }

    fn note_host_identity(&mut self, identity: PeerIdentity) {
        if self.host_identity.is_none() {
            log::info!("learned host identity {identity}");
            self.host_identity = Some(identity);
            self.retry_connect = true;
        }
    }

    fn absorb_event(&mut self, event: BackendEvent) {
        if !self.role.is_host() {
            if let BackendEvent::MessageFromHost { command, data } = &event {
                if command == HOST_IDENTITY_COMMAND {
                    if let Some(identity) = PeerIdentity::new(data.clone()) {
                        self.note_host_identity(identity);
                    }
                }
            }
        }
        self.events.push_back(event);
    }

    fn attach_peer(&mut self, handle: SocketHandle, identity: PeerIdentity) {
        self.handles.insert(identity.clone(), handle);
        self.peers.insert(handle, identity);
    }

    fn detach(&mut self, handle: SocketHandle) {
        if let Some(identity) = self.peers.remove(&handle) {
            self.handles.remove(&identity);
        }
        if self.host_handle == Some(handle) {
            self.host_handle = None;
            self.retry_connect = true;
        }
    }

    fn handle_message(&mut self, handle: SocketHandle, from: PeerIdentity, payload: Vec<u8>) {
        if payload.is_empty() {
            log::warn!("discarding zero-length message on {handle}");
            return;
        }
        if payload.len() > self.max_payload {
            log::warn!(
                "discarding {} byte message on {handle} (max {})",
                payload.len(),
                self.max_payload
            );
            return;
        }
        let envelope = match Envelope::decode(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("dropping malformed message from {from}: {e}");
                return;
            }
        };
        if !envelope.sender_peer_hint.is_empty() && envelope.sender_peer_hint != from.as_str() {
            log::debug!(
                "envelope hint {} disagrees with service metadata {from}",
                envelope.sender_peer_hint
            );
        }

        if self.role.is_host() {
            let connection = self.identity_map.resolve_sender(
                &from,
                envelope.sender_connection_hint,
                self.roster.as_deref(),
            );
            match connection {
                Some(connection) => self.absorb_event(BackendEvent::MessageFromPeer {
                    connection,
                    command: envelope.command,
                    data: envelope.data,
                }),
                None => log::warn!(
                    "dropping {} from unmapped sender {from}",
                    envelope.command
                ),
            }
        } else {
            self.note_host_identity(from);
            self.absorb_event(BackendEvent::MessageFromHost {
                command: envelope.command,
                data: envelope.data,
            });
        }
    }

    fn handle_socket_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Connecting { handle, identity } => {
                if !self.role.is_host() {
                    return;
                }
                if self.service.accept(handle) {
                    log::debug!("accepted connection {handle} from {identity}");
                    self.attach_peer(handle, identity);
                } else {
                    log::warn!("failed to accept connection {handle} from {identity}");
                    self.service.close_connection(handle);
                }
            }
            SocketEvent::Connected { handle, identity } => {
                if self.role.is_host() {
                    self.attach_peer(handle, identity);
                } else {
                    self.host_handle = Some(handle);
                    self.note_host_identity(identity);
                }
            }
            SocketEvent::Closed { handle } => {
                log::warn!("connection {handle} closed");
                self.detach(handle);
            }
            SocketEvent::Message {
                handle,
                identity,
                payload,
            } => self.handle_message(handle, identity, payload),
        }
    }
}

impl MessagingBackend for ConnectionSocketBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::ConnectionSocket
    }

    fn is_available(&self) -> bool {
        self.service.is_available()
    }

    fn initialize(&mut self) -> bool {
        if self.initialized {
            return true;
        }
        if !self.service.is_available() {
            log::warn!("socket service unavailable");
            return false;
        }
        if self.role.is_host() && !self.service.listen(self.virtual_port) {
            log::warn!("failed to open listen socket");
            return false;
        }
        self.fallback.initialize();
        self.initialized = true;
        self.try_connect_host();
        true
    }

    fn shutdown(&mut self) {
        if self.initialized {
            self.service.shutdown();
        }
        self.fallback.shutdown();
        self.identity_map.clear();
        self.handles.clear();
        self.peers.clear();
        self.host_handle = None;
        self.events.clear();
        self.initialized = false;
        self.retry_connect = true;
    }

    fn tick(&mut self) {
        if !self.initialized {
            return;
        }
        if self.role.is_host() {
            if let Some(roster) = &self.roster {
                self.identity_map.rebuild(roster.as_ref());
            }
        } else {
            self.try_connect_host();
        }
        for event in self.service.poll(self.max_messages_per_tick) {
            self.handle_socket_event(event);
        }
        for event in self.fallback.drain_events() {
            self.absorb_event(event);
        }
    }

    fn send_to_host(&mut self, command: &str, data: &str) -> bool {
        if !self.initialized || self.role.is_host() {
            return false;
        }
        self.try_connect_host();
        let Some(handle) = self.host_handle else {
            return self.fallback.send_to_host(command, data);
        };
        let Some(bytes) = self.encode_outbound(command, data) else {
            return false;
        };
        match self.service.send(handle, &bytes) {
            SendResult::Sent => true,
            _ => self.fallback.send_to_host(command, data),
        }
    }

    fn send_to_peer(&mut self, connection: ConnectionId, command: &str, data: &str) -> bool {
        if !self.initialized || !self.role.is_host() {
            return false;
        }
        let handle = self
            .identity_map
            .identity_for(connection)
            .and_then(|identity| self.handles.get(identity))
            .copied();
        let Some(handle) = handle else {
            return self.fallback.send_to_peer(connection, command, data);
        };
        let Some(bytes) = self.encode_outbound(command, data) else {
            return false;
        };
        match self.service.send(handle, &bytes) {
            SendResult::Sent => true,
            _ => self.fallback.send_to_peer(connection, command, data),
        }
    }

    fn broadcast(&mut self, command: &str, data: &str) -> usize {
        if !self.initialized || !self.role.is_host() {
            return 0;
        }
        let connections: Vec<ConnectionId> = match &self.roster {
            Some(roster) => roster.connections().iter().map(|e| e.connection).collect(),
            None => return 0,
        };
        connections
            .into_iter()
            .filter(|&connection| self.send_to_peer(connection, command, data))
            .count()
    }

    fn status_info(&self) -> String {
        format!(
            "connection-socket role={:?} port={} connections={} mapped={} available={}",
            self.role,
            self.virtual_port,
            self.peers.len(),
            self.identity_map.len(),
            self.service.is_available()
        )
    }

    fn drain_events(&mut self) -> Vec<BackendEvent> {
        self.events.drain(..).collect()
    }

    fn register_channel(&mut self, channel: Box<dyn BootstrapChannel>) {
        self.fallback.register_channel(channel);
    }

    fn deliver_channel(&mut self, origin: ChannelOrigin, payload: &[u8]) {
        self.fallback.deliver_channel(origin, payload);
    }

    fn set_host_identity(&mut self, identity: PeerIdentity) {
        self.note_host_identity(identity);
        self.try_connect_host();
    }
}
