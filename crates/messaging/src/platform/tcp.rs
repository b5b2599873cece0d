use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};

use super::{SendResult, SocketEvent, SocketHandle, SocketService};
use crate::identity::PeerIdentity;

const FRAME_HEADER_LEN: usize = 4;
const FRAME_HELLO: u8 = 1;
const FRAME_MESSAGE: u8 = 2;
const READ_CHUNK_SIZE: usize = 4096;

struct Connection {
    stream: TcpStream,
    identity: Option<PeerIdentity>,
    accepted: bool,
    inbound: Vec<u8>,
    outbound: Vec<u8>,
}

impl Connection {
    fn new(stream: TcpStream, accepted: bool) -> Self {
        Self {
            stream,
            identity: None,
            accepted,
            inbound: Vec::new(),
            outbound: Vec::new(),
        }
    }
}

/// `SocketService` over non-blocking TCP: a listen socket on the host,
/// one outbound stream on a peer, and every live stream polled as one
/// group per tick.
///
/// Frames are 4-byte big-endian length prefixed; the first frame on any
/// connection is a hello carrying the sender's identity string, which is
/// the service-level handshake that lets sender identity travel as
/// metadata. The virtual port offsets the TCP port, so several logical
/// services can share one configured base address.
pub struct TcpSocketService {
    bind_address: String,
    local_identity: PeerIdentity,
    max_payload: usize,
    listener: Option<TcpListener>,
    connections: HashMap<SocketHandle, Connection>,
    next_handle: u32,
    pending_events: VecDeque<SocketEvent>,
}

impl TcpSocketService {
    pub fn new(bind_address: &str, local_identity: PeerIdentity, max_payload: usize) -> Self {
        Self {
            bind_address: bind_address.to_string(),
            local_identity,
            max_payload,
            listener: None,
            connections: HashMap::new(),
            next_handle: 1,
            pending_events: VecDeque::new(),
        }
    }

    /// Listening address after `listen`, for collaborators that need to
    /// advertise it.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    fn alloc_handle(&mut self) -> SocketHandle {
        let handle = SocketHandle(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1);
        handle
    }

    fn offset_port(address: &str, virtual_port: u16) -> Option<SocketAddr> {
        let mut addr: SocketAddr = address.parse().ok()?;
        addr.set_port(addr.port().wrapping_add(virtual_port));
        Some(addr)
    }

    fn encode_frame(frame_type: u8, body: &[u8]) -> Vec<u8> {
        let len = (body.len() + 1) as u32;
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + 1 + body.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.push(frame_type);
        frame.extend_from_slice(body);
        frame
    }

    /// Writes as much of the connection's outbound buffer as the
    /// socket accepts. A full send buffer keeps the remainder queued
    /// for the next attempt instead of failing the connection.
    fn flush_outbound(connection: &mut Connection) -> io::Result<()> {
        while !connection.outbound.is_empty() {
            match connection.stream.write(&connection.outbound) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    connection.outbound.drain(..n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn send_hello(&mut self, handle: SocketHandle) -> bool {
        let frame = Self::encode_frame(FRAME_HELLO, self.local_identity.as_str().as_bytes());
        let Some(connection) = self.connections.get_mut(&handle) else {
            return false;
        };
        connection.outbound.extend_from_slice(&frame);
        match Self::flush_outbound(connection) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("hello write to {handle} failed: {e}");
                self.drop_connection(handle);
                false
            }
        }
    }

    fn drop_connection(&mut self, handle: SocketHandle) {
        if self.connections.remove(&handle).is_some() {
            self.pending_events.push_back(SocketEvent::Closed { handle });
        }
    }

    /// Parses complete frames out of a connection's inbound buffer.
    /// Returns false when the connection violated the protocol and must
    /// be dropped.
    fn parse_frames(
        connection: &mut Connection,
        handle: SocketHandle,
        max_payload: usize,
        events: &mut Vec<SocketEvent>,
    ) -> bool {
        loop {
            if connection.inbound.len() < FRAME_HEADER_LEN {
                return true;
            }
            let len = u32::from_be_bytes([
                connection.inbound[0],
                connection.inbound[1],
                connection.inbound[2],
                connection.inbound[3],
            ]) as usize;
            if len == 0 || len > max_payload + 1 {
                log::warn!("rejecting oversized {len} byte frame on {handle}");
                return false;
            }
            if connection.inbound.len() < FRAME_HEADER_LEN + len {
                return true;
            }

            let frame: Vec<u8> = connection
                .inbound
                .drain(..FRAME_HEADER_LEN + len)
                .skip(FRAME_HEADER_LEN)
                .collect();
            let (frame_type, body) = (frame[0], &frame[1..]);

            match frame_type {
                FRAME_HELLO => {
                    let identity = std::str::from_utf8(body)
                        .ok()
                        .and_then(PeerIdentity::new);
                    let Some(identity) = identity else {
                        log::warn!("rejecting hello with invalid identity on {handle}");
                        return false;
                    };
                    if connection.identity.is_some() {
                        continue;
                    }
                    connection.identity = Some(identity.clone());
                    // Outbound connections are implicitly accepted, so
                    // the peer's hello completes the link; inbound ones
                    // wait for an explicit accept.
                    if connection.accepted {
                        events.push(SocketEvent::Connected { handle, identity });
                    } else {
                        events.push(SocketEvent::Connecting { handle, identity });
                    }
                }
                FRAME_MESSAGE => match &connection.identity {
                    Some(identity) => events.push(SocketEvent::Message {
                        handle,
                        identity: identity.clone(),
                        payload: body.to_vec(),
                    }),
                    None => log::warn!("discarding message before hello on {handle}"),
                },
                other => log::warn!("discarding unknown frame type {other} on {handle}"),
            }
        }
    }

    fn accept_incoming(&mut self, events_left: usize) {
        for _ in 0..events_left {
            let accepted = match &self.listener {
                Some(listener) => listener.accept(),
                None => return,
            };
            match accepted {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        log::warn!("failed to set accepted stream non-blocking: {e}");
                        continue;
                    }
                    let handle = self.alloc_handle();
                    log::debug!("incoming connection {handle} from {addr}");
                    self.connections.insert(handle, Connection::new(stream, false));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("listener accept error: {e}");
                    break;
                }
            }
        }
    }
}

impl SocketService for TcpSocketService {
    fn is_available(&self) -> bool {
        true
    }

    fn local_identity(&self) -> &PeerIdentity {
        &self.local_identity
    }

    fn listen(&mut self, virtual_port: u16) -> bool {
        if self.listener.is_some() {
            return true;
        }
        let Some(addr) = Self::offset_port(&self.bind_address, virtual_port) else {
            log::warn!("invalid listen address {}", self.bind_address);
            return false;
        };
        let listener = match TcpListener::bind(addr) {
            Ok(listener) => listener,
            Err(e) => {
                log::warn!("failed to bind listen socket {addr}: {e}");
                return false;
            }
        };
        if let Err(e) = listener.set_nonblocking(true) {
            log::warn!("failed to set listen socket non-blocking: {e}");
            return false;
        }
        self.listener = Some(listener);
        true
    }

    fn connect(&mut self, host: &str, virtual_port: u16) -> Option<SocketHandle> {
        let Some(addr) = Self::offset_port(host, virtual_port) else {
            log::warn!("invalid host address {host}");
            return None;
        };
        let mut stream = match TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("connect to {addr} failed: {e}");
                return None;
            }
        };
        let hello = Self::encode_frame(FRAME_HELLO, self.local_identity.as_str().as_bytes());
        if let Err(e) = stream.write_all(&hello) {
            log::warn!("hello write to {addr} failed: {e}");
            return None;
        }
        if let Err(e) = stream.set_nonblocking(true) {
            log::warn!("failed to set outbound stream non-blocking: {e}");
            return None;
        }
        let handle = self.alloc_handle();
        self.connections.insert(handle, Connection::new(stream, true));
        Some(handle)
    }

    fn accept(&mut self, handle: SocketHandle) -> bool {
        match self.connections.get_mut(&handle) {
            Some(connection) if connection.identity.is_some() => {
                connection.accepted = true;
            }
            _ => return false,
        }
        self.send_hello(handle)
    }

    fn close_connection(&mut self, handle: SocketHandle) {
        self.connections.remove(&handle);
    }

    fn shutdown(&mut self) {
        self.listener = None;
        self.connections.clear();
        self.pending_events.clear();
    }

    fn send(&mut self, handle: SocketHandle, payload: &[u8]) -> SendResult {
        if payload.len() > self.max_payload {
            return SendResult::Rejected;
        }
        let frame = Self::encode_frame(FRAME_MESSAGE, payload);
        let Some(connection) = self.connections.get_mut(&handle) else {
            return SendResult::NoRoute;
        };
        connection.outbound.extend_from_slice(&frame);
        match Self::flush_outbound(connection) {
            Ok(()) => SendResult::Sent,
            Err(e) => {
                log::warn!("send on {handle} failed: {e}");
                self.drop_connection(handle);
                SendResult::Rejected
            }
        }
    }

    fn poll(&mut self, max_events: usize) -> Vec<SocketEvent> {
        let mut events = Vec::new();
        while events.len() < max_events {
            match self.pending_events.pop_front() {
                Some(event) => events.push(event),
                None => break,
            }
        }

        self.accept_incoming(max_events.saturating_sub(events.len()));

        let handles: Vec<SocketHandle> = self.connections.keys().copied().collect();
        let mut dead = Vec::new();
        let mut chunk = [0u8; READ_CHUNK_SIZE];

        for handle in handles {
            if events.len() >= max_events {
                break;
            }
            let Some(connection) = self.connections.get_mut(&handle) else {
                continue;
            };

            loop {
                match connection.stream.read(&mut chunk) {
                    Ok(0) => {
                        dead.push(handle);
                        break;
                    }
                    Ok(n) => connection.inbound.extend_from_slice(&chunk[..n]),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        log::warn!("read error on {handle}: {e}");
                        dead.push(handle);
                        break;
                    }
                }
            }

            if !Self::parse_frames(connection, handle, self.max_payload, &mut events)
                && !dead.contains(&handle)
            {
                dead.push(handle);
            }

            if dead.contains(&handle) {
                continue;
            }
            if let Some(connection) = self.connections.get_mut(&handle) {
                if let Err(e) = Self::flush_outbound(connection) {
                    log::warn!("flush on {handle} failed: {e}");
                    dead.push(handle);
                }
            }
        }

        for handle in dead {
            self.drop_connection(handle);
        }
        while events.len() < max_events {
            match self.pending_events.pop_front() {
                Some(event) => events.push(event),
                None => break,
            }
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    fn ident(raw: &str) -> PeerIdentity {
        PeerIdentity::new(raw).unwrap()
    }

    fn poll_until(
        service: &mut TcpSocketService,
        want: usize,
        timeout_ms: u64,
    ) -> Vec<SocketEvent> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut events = Vec::new();
        while events.len() < want && Instant::now() < deadline {
            events.extend(service.poll(16));
            std::thread::sleep(Duration::from_millis(1));
        }
        events
    }

    fn connected_pair() -> (TcpSocketService, TcpSocketService, SocketHandle, SocketHandle) {
        let mut host = TcpSocketService::new("127.0.0.1:0", ident("host"), 4096);
        assert!(host.listen(0));
        let host_addr = host.local_addr().unwrap().to_string();

        let mut peer = TcpSocketService::new("127.0.0.1:0", ident("peer"), 4096);
        let peer_to_host = peer.connect(&host_addr, 0).unwrap();

        let events = poll_until(&mut host, 1, 500);
        let (host_to_peer, peer_identity) = match &events[0] {
            SocketEvent::Connecting { handle, identity } => (*handle, identity.clone()),
            other => panic!("expected Connecting, got {other:?}"),
        };
        assert_eq!(peer_identity, ident("peer"));
        assert!(host.accept(host_to_peer));

        let events = poll_until(&mut peer, 1, 500);
        match &events[0] {
            SocketEvent::Connected { handle, identity } => {
                assert_eq!(*handle, peer_to_host);
                assert_eq!(*identity, ident("host"));
            }
            other => panic!("expected Connected, got {other:?}"),
        }

        (host, peer, host_to_peer, peer_to_host)
    }

    #[test]
    fn test_handshake_and_message_exchange() {
        let (mut host, mut peer, host_to_peer, peer_to_host) = connected_pair();

        assert_eq!(peer.send(peer_to_host, b"question"), SendResult::Sent);
        let events = poll_until(&mut host, 1, 500);
        assert_eq!(
            events[0],
            SocketEvent::Message {
                handle: host_to_peer,
                identity: ident("peer"),
                payload: b"question".to_vec(),
            }
        );

        assert_eq!(host.send(host_to_peer, b"answer"), SendResult::Sent);
        let events = poll_until(&mut peer, 1, 500);
        assert_eq!(
            events[0],
            SocketEvent::Message {
                handle: peer_to_host,
                identity: ident("host"),
                payload: b"answer".to_vec(),
            }
        );
    }

    #[test]
    fn test_closed_connection_surfaces_event() {
        let (mut host, peer, host_to_peer, _peer_to_host) = connected_pair();
        drop(peer);

        let deadline = Instant::now() + Duration::from_millis(500);
        let mut closed = false;
        while !closed && Instant::now() < deadline {
            for event in host.poll(16) {
                if event == (SocketEvent::Closed { handle: host_to_peer }) {
                    closed = true;
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(closed);
        assert_eq!(host.send(host_to_peer, b"x"), SendResult::NoRoute);
    }

    #[test]
    fn test_backpressure_buffers_instead_of_dropping() {
        let (mut host, mut peer, host_to_peer, _peer_to_host) = connected_pair();
        let payload = vec![7u8; 4000];

        // Far more than the socket send buffer holds while the peer is
        // not reading; every send must still be accepted and the
        // connection must stay up.
        for _ in 0..256 {
            assert_eq!(host.send(host_to_peer, &payload), SendResult::Sent);
        }

        let mut received = 0;
        let deadline = Instant::now() + Duration::from_millis(2000);
        while received < 256 && Instant::now() < deadline {
            host.poll(16);
            for event in peer.poll(512) {
                if matches!(event, SocketEvent::Message { .. }) {
                    received += 1;
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(received, 256);
        assert_eq!(host.send(host_to_peer, b"still here"), SendResult::Sent);
    }

    #[test]
    fn test_send_to_unknown_handle_is_no_route() {
        let mut service = TcpSocketService::new("127.0.0.1:0", ident("host"), 4096);
        assert_eq!(service.send(SocketHandle(99), b"x"), SendResult::NoRoute);
    }

    #[test]
    fn test_oversized_send_rejected() {
        let (mut host, _peer, host_to_peer, _) = connected_pair();
        let big = vec![0u8; 8192];
        assert_eq!(host.send(host_to_peer, &big), SendResult::Rejected);
    }

    #[test]
    fn test_shutdown_idempotent() {
        let (mut host, _peer, _, _) = connected_pair();
        host.shutdown();
        host.shutdown();
        assert!(host.poll(16).is_empty());
    }
}
