use std::collections::VecDeque;

use crate::backend::{BackendEvent, BackendKind, ChannelOrigin, MessagingBackend, Role};
use crate::envelope::Envelope;
use crate::identity::{ConnectionId, ConnectionRoster, PeerIdentity};

/// The host application's always-available reliable channel, piggybacked
/// on its singleton networked object. Sends are reliable and ordered per
/// destination; `is_spawned` reports whether the object is live yet.
pub trait BootstrapChannel {
    fn is_spawned(&self) -> bool;
    fn send_to_host(&mut self, payload: &[u8]) -> bool;
    fn send_to_peer(&mut self, connection: ConnectionId, payload: &[u8]) -> bool;
}

/// Transport backend over the bootstrap channel. Available the instant
/// the collaborator's networked object exists, with no identity
/// resolution step; also embedded in the two network backends as their
/// fallback leg.
///
/// Sends fail closed: an unregistered channel, an un-spawned object or
/// an invalid handle yields `false`, never queuing. Receiving is
/// registration-based; the collaborator forwards inbound payloads via
/// `deliver_channel`.
pub struct BootstrapBackend {
    role: Role,
    max_payload: usize,
    initialized: bool,
    channel: Option<Box<dyn BootstrapChannel>>,
    roster: Option<Box<dyn ConnectionRoster>>,
    events: VecDeque<BackendEvent>,
}

impl BootstrapBackend {
    pub fn new(role: Role, max_payload: usize) -> Self {
        Self {
            role,
            max_payload,
            initialized: false,
            channel: None,
            roster: None,
            events: VecDeque::new(),
        }
    }

    /// Host-side roster, used only by `broadcast`.
    pub fn with_roster(mut self, roster: Box<dyn ConnectionRoster>) -> Self {
        self.roster = Some(roster);
        self
    }

    fn channel_ready(&self) -> bool {
        match &self.channel {
            Some(channel) => channel.is_spawned(),
            None => false,
        }
    }

    fn encode_outbound(&self, command: &str, data: &str) -> Option<Vec<u8>> {
        let envelope = Envelope::new(command, data);
        let bytes = match envelope.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("refusing to send malformed envelope: {e}");
                return None;
            }
        };
        if bytes.len() > self.max_payload {
            log::warn!(
                "refusing to send {} byte envelope over bootstrap channel (max {})",
                bytes.len(),
                self.max_payload
            );
            return None;
        }
        Some(bytes)
    }
}

impl MessagingBackend for BootstrapBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::BootstrapChannel
    }

    fn is_available(&self) -> bool {
        true
    }

    fn initialize(&mut self) -> bool {
        self.initialized = true;
        true
    }

    fn shutdown(&mut self) {
        self.initialized = false;
        self.channel = None;
        self.events.clear();
    }

    fn tick(&mut self) {
        // Receive is push-based via deliver_channel; nothing to drain.
    }

    fn send_to_host(&mut self, command: &str, data: &str) -> bool {
        if !self.initialized || !self.channel_ready() {
            return false;
        }
        let Some(bytes) = self.encode_outbound(command, data) else {
            return false;
        };
        match &mut self.channel {
            Some(channel) => channel.send_to_host(&bytes),
            None => false,
        }
    }

    fn send_to_peer(&mut self, connection: ConnectionId, command: &str, data: &str) -> bool {
        if !self.initialized || !self.channel_ready() || !connection.is_valid() {
            return false;
        }
        let Some(bytes) = self.encode_outbound(command, data) else {
            return false;
        };
        match &mut self.channel {
            Some(channel) => channel.send_to_peer(connection, &bytes),
            None => false,
        }
    }

    fn broadcast(&mut self, command: &str, data: &str) -> usize {
        if !self.role.is_host() {
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
            "bootstrap-channel role={:?} registered={} spawned={}",
            self.role,
            self.channel.is_some(),
            self.channel_ready()
        )
    }

    fn drain_events(&mut self) -> Vec<BackendEvent> {
        self.events.drain(..).collect()
    }

    fn register_channel(&mut self, channel: Box<dyn BootstrapChannel>) {
        if self.channel.is_some() {
            log::debug!("bootstrap channel already registered, ignoring");
            return;
        }
        self.channel = Some(channel);
    }

    fn deliver_channel(&mut self, origin: ChannelOrigin, payload: &[u8]) {
        if !self.initialized {
            return;
        }
        let envelope = match Envelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("dropping malformed bootstrap payload: {e}");
                return;
            }
        };
        let event = match origin {
            ChannelOrigin::Host => BackendEvent::MessageFromHost {
                command: envelope.command,
                data: envelope.data,
            },
            ChannelOrigin::Peer(connection) => BackendEvent::MessageFromPeer {
                connection,
                command: envelope.command,
                data: envelope.data,
            },
        };
        self.events.push_back(event);
    }

    fn set_host_identity(&mut self, _identity: PeerIdentity) {
        // The bootstrap channel never resolves identities.
    }
}
