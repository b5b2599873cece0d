use crate::backend::{BackendEvent, ChannelOrigin, MessagingBackend, Role};
use crate::bootstrap::{BootstrapBackend, BootstrapChannel};
use crate::identity::{ConnectionId, PeerIdentity, WarnOnceSet};

/// The fallback leg embedded in both network backends: a privately
/// owned bootstrap backend plus warn-once bookkeeping. A peer whose
/// identity mapping is not established yet keeps receiving messages
/// through here; the notice is logged once per connection, not per
/// message.
///
/// Messages that cross over during a fallback handover carry no
/// ordering guarantee relative to the primary channel.
pub struct FallbackLeg {
    bootstrap: BootstrapBackend,
    warned: WarnOnceSet,
}

impl FallbackLeg {
    pub fn new(role: Role, max_payload: usize) -> Self {
        Self {
            bootstrap: BootstrapBackend::new(role, max_payload),
            warned: WarnOnceSet::new(),
        }
    }

    pub fn initialize(&mut self) -> bool {
        self.bootstrap.initialize()
    }

    pub fn shutdown(&mut self) {
        self.bootstrap.shutdown();
        self.warned.clear();
    }

    pub fn register_channel(&mut self, channel: Box<dyn BootstrapChannel>) {
        self.bootstrap.register_channel(channel);
    }

    pub fn deliver_channel(&mut self, origin: ChannelOrigin, payload: &[u8]) {
        self.bootstrap.deliver_channel(origin, payload);
    }

    pub fn drain_events(&mut self) -> Vec<BackendEvent> {
        self.bootstrap.drain_events()
    }

    pub fn send_to_peer(&mut self, connection: ConnectionId, command: &str, data: &str) -> bool {
        if self.warned.insert(connection) {
            log::warn!("no primary route for connection {connection}, using bootstrap fallback");
        }
        self.bootstrap.send_to_peer(connection, command, data)
    }

    pub fn send_to_host(&mut self, command: &str, data: &str) -> bool {
        if self.warned.insert(ConnectionId::UNKNOWN) {
            log::warn!("host route not resolved yet, using bootstrap fallback");
        }
        self.bootstrap.send_to_host(command, data)
    }

    #[cfg(test)]
    pub(crate) fn has_warned(&self, connection: ConnectionId) -> bool {
        self.warned.contains(connection)
    }
}
