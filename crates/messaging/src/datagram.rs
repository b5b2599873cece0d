use std::collections::{HashSet, VecDeque};

use crate::backend::{BackendEvent, BackendKind, ChannelOrigin, MessagingBackend, Role};
use crate::bootstrap::BootstrapChannel;
use crate::config::MessagingConfig;
use crate::envelope::{Envelope, HOST_IDENTITY_COMMAND};
use crate::fallback::FallbackLeg;
use crate::identity::{ConnectionId, ConnectionRoster, IdentityMap, PeerIdentity};
use crate::platform::{SendResult, SessionConfig, SessionEvent, SessionService};

/// Transport backend over an identity-addressed datagram session
/// service. The messaging layer performs no handshake of its own;
/// session establishment belongs to the underlying service, and the
/// host accepts every session request.
///
/// Sends resolve the destination's stable identity first. On the host
/// that means consulting the identity map rebuilt from the roster each
/// tick; a missing mapping routes the message through the embedded
/// bootstrap leg instead. On a peer, host-bound sends degrade to the
/// bootstrap leg until the host identity is configured, supplied via
/// the hint API, or learned from the authentication exchange.
pub struct PeerDatagramBackend {
    role: Role,
    max_payload: usize,
    max_messages_per_tick: usize,
    allow_relay: bool,
    service: Box<dyn SessionService>,
    roster: Option<Box<dyn ConnectionRoster>>,
    identity_map: IdentityMap,
    fallback: FallbackLeg,
    host_identity: Option<PeerIdentity>,
    sessions: HashSet<PeerIdentity>,
    events: VecDeque<BackendEvent>,
    initialized: bool,
}

impl PeerDatagramBackend {
    pub fn new(
        config: &MessagingConfig,
        service: Box<dyn SessionService>,
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
            allow_relay: config.allow_relay,
            service,
            roster,
            identity_map: IdentityMap::new(),
            fallback: FallbackLeg::new(config.role, config.max_payload),
            host_identity,
            sessions: HashSet::new(),
            events: VecDeque::new(),
            initialized: false,
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
        }
    }

    /// Applies peer-side host-identity learning to an event on its way
    /// to the collaborator. The message itself still surfaces.
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

    fn handle_message(&mut self, from: PeerIdentity, payload: Vec<u8>) {
        if payload.is_empty() {
            log::warn!("discarding zero-length datagram from {from}");
            return;
        }
        if payload.len() > self.max_payload {
            log::warn!(
                "discarding {} byte datagram from {from} (max {})",
                payload.len(),
                self.max_payload
            );
            return;
        }
        let envelope = match Envelope::decode(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("dropping malformed datagram from {from}: {e}");
                return;
            }
        };

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
            // Sender is the host by construction; remember its identity
            // for future primary-channel sends.
            self.note_host_identity(from);
            self.absorb_event(BackendEvent::MessageFromHost {
                command: envelope.command,
                data: envelope.data,
            });
        }
    }

    fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::SessionRequest { from } => {
                if self.service.accept(&from) {
                    log::debug!("accepted session from {from}");
                    self.sessions.insert(from);
                } else {
                    log::warn!("failed to accept session from {from}");
                }
            }
            SessionEvent::SessionClosed { from } => {
                log::warn!("session with {from} closed");
                self.sessions.remove(&from);
            }
            SessionEvent::SessionFailed { from, reason } => {
                log::warn!("session with {from} failed: {reason}");
                self.sessions.remove(&from);
            }
            SessionEvent::Message { from, payload } => self.handle_message(from, payload),
        }
    }
}

impl MessagingBackend for PeerDatagramBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::PeerDatagram
    }

    fn is_available(&self) -> bool {
        self.service.is_available()
    }

    fn initialize(&mut self) -> bool {
        if self.initialized {
            return true;
        }
        if !self.service.is_available() {
            log::warn!("datagram session service unavailable");
            return false;
        }
        let session_config = SessionConfig {
            allow_relay: self.allow_relay,
        };
        if !self.service.open(&session_config) {
            log::warn!("failed to open datagram session service");
            return false;
        }
        self.fallback.initialize();
        self.initialized = true;
        true
    }

    fn shutdown(&mut self) {
        if self.initialized {
            self.service.close();
        }
        self.fallback.shutdown();
        self.identity_map.clear();
        self.sessions.clear();
        self.events.clear();
        self.initialized = false;
    }

    fn tick(&mut self) {
        if !self.initialized {
            return;
        }
        if self.role.is_host() {
            if let Some(roster) = &self.roster {
                self.identity_map.rebuild(roster.as_ref());
            }
        }
        for event in self.service.poll(self.max_messages_per_tick) {
            self.handle_session_event(event);
        }
        for event in self.fallback.drain_events() {
            self.absorb_event(event);
        }
    }

    fn send_to_host(&mut self, command: &str, data: &str) -> bool {
        if !self.initialized || self.role.is_host() {
            return false;
        }
        let Some(host) = self.host_identity.clone() else {
            return self.fallback.send_to_host(command, data);
        };
        let Some(bytes) = self.encode_outbound(command, data) else {
            return false;
        };
        match self.service.send(&host, &bytes, true) {
            SendResult::Sent => true,
            _ => self.fallback.send_to_host(command, data),
        }
    }

    fn send_to_peer(&mut self, connection: ConnectionId, command: &str, data: &str) -> bool {
        if !self.initialized || !self.role.is_host() {
            return false;
        }
        let Some(identity) = self.identity_map.identity_for(connection).cloned() else {
            return self.fallback.send_to_peer(connection, command, data);
        };
        let Some(bytes) = self.encode_outbound(command, data) else {
            return false;
        };
        match self.service.send(&identity, &bytes, true) {
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
            "peer-datagram role={:?} sessions={} mapped={} relay={} available={}",
            self.role,
            self.sessions.len(),
            self.identity_map.len(),
            self.allow_relay,
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
    }
}
