use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::{SocketAddr, UdpSocket};

use super::{SendResult, SessionConfig, SessionEvent, SessionService};
use crate::identity::PeerIdentity;

const RECV_BUFFER_SIZE: usize = 65536;
const IDENTITY_HEADER_LEN: usize = 2;

/// `SessionService` over a non-blocking UDP socket.
///
/// Each datagram is framed as a 2-byte big-endian identity length,
/// the sender's identity bytes, then the payload, which lets the
/// service hand sender identity to the backend as metadata. Routes from
/// identity to address are learned from inbound traffic and from
/// `add_route`; identity strings that parse as socket addresses are
/// routable with no directory entry at all.
///
/// UDP offers a single delivery tier, so the `reliable` send flag is
/// advisory here.
pub struct UdpSessionService {
    bind_address: String,
    local_identity: PeerIdentity,
    max_payload: usize,
    socket: Option<UdpSocket>,
    allow_relay: bool,
    routes: HashMap<PeerIdentity, SocketAddr>,
    known: HashSet<PeerIdentity>,
    pending: VecDeque<SessionEvent>,
    recv_buffer: Box<[u8; RECV_BUFFER_SIZE]>,
}

impl UdpSessionService {
    pub fn new(bind_address: &str, local_identity: PeerIdentity, max_payload: usize) -> Self {
        Self {
            bind_address: bind_address.to_string(),
            local_identity,
            max_payload,
            socket: None,
            allow_relay: true,
            routes: HashMap::new(),
            known: HashSet::new(),
            pending: VecDeque::new(),
            recv_buffer: Box::new([0u8; RECV_BUFFER_SIZE]),
        }
    }

    /// Relay policy recorded at `open`. This service only has direct
    /// socket routes, so the flag is advisory here.
    pub fn allow_relay(&self) -> bool {
        self.allow_relay
    }

    /// Local address after `open`, for collaborators that need to
    /// advertise it.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Registers a destination route up front (e.g. a peer registering
    /// the host). Routes learned this way are pre-accepted.
    pub fn add_route(&mut self, identity: PeerIdentity, addr: SocketAddr) {
        self.routes.insert(identity.clone(), addr);
        self.known.insert(identity);
    }

    fn route_for(&mut self, to: &PeerIdentity) -> Option<SocketAddr> {
        if let Some(addr) = self.routes.get(to) {
            return Some(*addr);
        }
        // Address-shaped identities route directly.
        let addr: SocketAddr = to.as_str().parse().ok()?;
        self.routes.insert(to.clone(), addr);
        self.known.insert(to.clone());
        Some(addr)
    }

    fn encode_frame(&self, payload: &[u8]) -> Vec<u8> {
        let identity = self.local_identity.as_str().as_bytes();
        let mut frame = Vec::with_capacity(IDENTITY_HEADER_LEN + identity.len() + payload.len());
        frame.extend_from_slice(&(identity.len() as u16).to_be_bytes());
        frame.extend_from_slice(identity);
        frame.extend_from_slice(payload);
        frame
    }

    fn decode_frame(frame: &[u8]) -> Option<(PeerIdentity, &[u8])> {
        if frame.len() < IDENTITY_HEADER_LEN {
            return None;
        }
        let identity_len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
        let payload_start = IDENTITY_HEADER_LEN + identity_len;
        if frame.len() < payload_start {
            return None;
        }
        let identity = std::str::from_utf8(&frame[IDENTITY_HEADER_LEN..payload_start]).ok()?;
        let identity = PeerIdentity::new(identity)?;
        Some((identity, &frame[payload_start..]))
    }
}

impl SessionService for UdpSessionService {
    fn is_available(&self) -> bool {
        true
    }

    fn local_identity(&self) -> &PeerIdentity {
        &self.local_identity
    }

    fn open(&mut self, config: &SessionConfig) -> bool {
        self.allow_relay = config.allow_relay;
        if !config.allow_relay {
            log::debug!("relay routing disabled, direct routes only");
        }
        if self.socket.is_some() {
            return true;
        }
        let socket = match UdpSocket::bind(&self.bind_address) {
            Ok(socket) => socket,
            Err(e) => {
                log::warn!("failed to bind datagram socket {}: {e}", self.bind_address);
                return false;
            }
        };
        if let Err(e) = socket.set_nonblocking(true) {
            log::warn!("failed to set datagram socket non-blocking: {e}");
            return false;
        }
        self.socket = Some(socket);
        true
    }

    fn close(&mut self) {
        self.socket = None;
        self.routes.clear();
        self.known.clear();
        self.pending.clear();
    }

    fn accept(&mut self, from: &PeerIdentity) -> bool {
        if self.routes.contains_key(from) {
            self.known.insert(from.clone());
            true
        } else {
            false
        }
    }

    fn send(&mut self, to: &PeerIdentity, payload: &[u8], _reliable: bool) -> SendResult {
        if payload.len() > self.max_payload {
            return SendResult::Rejected;
        }
        let Some(addr) = self.route_for(to) else {
            return SendResult::NoRoute;
        };
        let frame = self.encode_frame(payload);
        let Some(socket) = &self.socket else {
            return SendResult::Rejected;
        };
        match socket.send_to(&frame, addr) {
            Ok(_) => SendResult::Sent,
            Err(e) => {
                log::warn!("datagram send to {to} ({addr}) failed: {e}");
                SendResult::Rejected
            }
        }
    }

    fn poll(&mut self, max_events: usize) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while events.len() < max_events {
            match self.pending.pop_front() {
                Some(event) => events.push(event),
                None => break,
            }
        }
        let Some(socket) = &self.socket else {
            return events;
        };

        // First contact produces two events at once; the overflow is
        // carried to the next poll so the per-call bound holds.
        while events.len() < max_events {
            let (size, addr) = match socket.recv_from(&mut self.recv_buffer[..]) {
                Ok(received) => received,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("datagram receive error: {e}");
                    break;
                }
            };

            let Some((from, payload)) = Self::decode_frame(&self.recv_buffer[..size]) else {
                log::warn!("discarding unframed datagram from {addr}");
                continue;
            };
            let payload = payload.to_vec();

            self.routes.insert(from.clone(), addr);
            if self.known.insert(from.clone()) {
                events.push(SessionEvent::SessionRequest { from: from.clone() });
            }
            let message = SessionEvent::Message { from, payload };
            if events.len() < max_events {
                events.push(message);
            } else {
                self.pending.push_back(message);
            }
        }

        events
    }
}
