use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use sidechannel::{
    BackendEvent, BackendKind, BootstrapChannel, ChannelOrigin, ConnectionId,
    ConnectionRoster, ConnectionSocketBackend, Envelope, HOST_IDENTITY_COMMAND, MessagingBackend,
    MessagingConfig, PeerDatagramBackend, PeerIdentity, Role, RosterEntry, SendResult,
    SessionConfig, SessionEvent, SessionService, SocketEvent, SocketHandle, SocketService,
};

fn ident(raw: &str) -> PeerIdentity {
    PeerIdentity::new(raw).unwrap()
}

fn envelope_bytes(command: &str, data: &str) -> Vec<u8> {
    Envelope::new(command, data).encode().unwrap()
}

struct FakeRoster(Rc<RefCell<Vec<RosterEntry>>>);

impl ConnectionRoster for FakeRoster {
    fn connections(&self) -> Vec<RosterEntry> {
        self.0.borrow().clone()
    }
}

fn roster(entries: &[(i64, &str)]) -> (Rc<RefCell<Vec<RosterEntry>>>, Box<dyn ConnectionRoster>) {
    let entries: Vec<RosterEntry> = entries
        .iter()
        .map(|&(connection, identity)| RosterEntry {
            connection: ConnectionId(connection),
            identity: Some(ident(identity)),
        })
        .collect();
    let shared = Rc::new(RefCell::new(entries));
    (Rc::clone(&shared), Box::new(FakeRoster(shared)))
}

#[derive(Default)]
struct ChannelLog {
    to_host: Vec<Vec<u8>>,
    to_peer: Vec<(ConnectionId, Vec<u8>)>,
}

struct FakeChannel(Rc<RefCell<ChannelLog>>);

impl BootstrapChannel for FakeChannel {
    fn is_spawned(&self) -> bool {
        true
    }

    fn send_to_host(&mut self, payload: &[u8]) -> bool {
        self.0.borrow_mut().to_host.push(payload.to_vec());
        true
    }

    fn send_to_peer(&mut self, connection: ConnectionId, payload: &[u8]) -> bool {
        self.0.borrow_mut().to_peer.push((connection, payload.to_vec()));
        true
    }
}

#[derive(Default)]
struct SessionLog {
    sent: Vec<(String, Vec<u8>)>,
    inbound: VecDeque<SessionEvent>,
    accepted: Vec<String>,
    unreachable: Vec<String>,
    opened_with_relay: Option<bool>,
}

struct FakeSession {
    identity: PeerIdentity,
    log: Rc<RefCell<SessionLog>>,
}

impl SessionService for FakeSession {
    fn is_available(&self) -> bool {
        true
    }

    fn local_identity(&self) -> &PeerIdentity {
        &self.identity
    }

    fn open(&mut self, config: &SessionConfig) -> bool {
        self.log.borrow_mut().opened_with_relay = Some(config.allow_relay);
        true
    }

    fn close(&mut self) {}

    fn accept(&mut self, from: &PeerIdentity) -> bool {
        self.log.borrow_mut().accepted.push(from.to_string());
        true
    }

    fn send(&mut self, to: &PeerIdentity, payload: &[u8], _reliable: bool) -> SendResult {
        let mut log = self.log.borrow_mut();
        if log.unreachable.iter().any(|i| i == to.as_str()) {
            return SendResult::NoRoute;
        }
        log.sent.push((to.to_string(), payload.to_vec()));
        SendResult::Sent
    }

    fn poll(&mut self, max_events: usize) -> Vec<SessionEvent> {
        let mut log = self.log.borrow_mut();
        let count = max_events.min(log.inbound.len());
        log.inbound.drain(..count).collect()
    }
}

fn datagram_backend(
    role: Role,
    local: &str,
    roster: Option<Box<dyn ConnectionRoster>>,
) -> (PeerDatagramBackend, Rc<RefCell<SessionLog>>) {
    let config = MessagingConfig {
        backend: BackendKind::PeerDatagram,
        role,
        local_identity: local.to_string(),
        ..MessagingConfig::default()
    };
    let log = Rc::new(RefCell::new(SessionLog::default()));
    let service = FakeSession {
        identity: ident(local),
        log: Rc::clone(&log),
    };
    let backend = PeerDatagramBackend::new(&config, Box::new(service), roster);
    (backend, log)
}

fn push_message(log: &Rc<RefCell<SessionLog>>, from: &str, payload: Vec<u8>) {
    log.borrow_mut().inbound.push_back(SessionEvent::Message {
        from: ident(from),
        payload,
    });
}

#[test]
fn test_host_requires_mapping_before_delivery() {
    let (_, roster) = roster(&[(1, "alice")]);
    let (mut host, log) = datagram_backend(Role::Host, "host", Some(roster));
    assert!(host.initialize());

    push_message(&log, "alice", envelope_bytes("ping", "1"));
    push_message(&log, "mallory", envelope_bytes("ping", "2"));
    host.tick();

    let events = host.drain_events();
    assert_eq!(
        events,
        vec![BackendEvent::MessageFromPeer {
            connection: ConnectionId(1),
            command: "ping".to_string(),
            data: "1".to_string(),
        }]
    );
}

#[test]
fn test_host_falls_back_until_peer_mapped() {
    let (entries, roster) = roster(&[]);
    let (mut host, log) = datagram_backend(Role::Host, "host", Some(roster));
    let channel = Rc::new(RefCell::new(ChannelLog::default()));
    assert!(host.initialize());
    host.register_channel(Box::new(FakeChannel(Rc::clone(&channel))));

    // Peer joined but its platform identity is not in the roster yet:
    // the welcome travels over the bootstrap channel.
    assert!(host.send_to_peer(ConnectionId(7), "welcome", "hi"));
    assert_eq!(channel.borrow().to_peer.len(), 1);
    assert_eq!(channel.borrow().to_peer[0].0, ConnectionId(7));
    assert!(log.borrow().sent.is_empty());

    // Identity lands in the roster; the next tick rebuilds the map and
    // sends switch to the primary channel.
    entries.borrow_mut().push(RosterEntry {
        connection: ConnectionId(7),
        identity: Some(ident("bob")),
    });
    host.tick();
    assert!(host.send_to_peer(ConnectionId(7), "ping", "1"));
    assert_eq!(channel.borrow().to_peer.len(), 1);
    let sent = log.borrow();
    assert_eq!(sent.sent.len(), 1);
    assert_eq!(sent.sent[0].0, "bob");
}

#[test]
fn test_relay_policy_reaches_session_service() {
    let config = MessagingConfig {
        backend: BackendKind::PeerDatagram,
        role: Role::Peer,
        local_identity: "peer-1".to_string(),
        allow_relay: false,
        ..MessagingConfig::default()
    };
    let log = Rc::new(RefCell::new(SessionLog::default()));
    let service = FakeSession {
        identity: ident("peer-1"),
        log: Rc::clone(&log),
    };
    let mut peer = PeerDatagramBackend::new(&config, Box::new(service), None);
    assert!(peer.initialize());
    assert_eq!(log.borrow().opened_with_relay, Some(false));
}

#[test]
fn test_broadcast_counts_only_successes() {
    let (_, roster) = roster(&[(1, "a"), (2, "b"), (3, "c")]);
    let (mut host, log) = datagram_backend(Role::Host, "host", Some(roster));
    log.borrow_mut().unreachable.push("b".to_string());
    assert!(host.initialize());
    host.tick();

    // No bootstrap channel is registered, so the unreachable peer has
    // nowhere to fall back to.
    assert_eq!(host.broadcast("state", "{}"), 2);
    assert_eq!(log.borrow().sent.len(), 2);
}

#[test]
fn test_oversized_send_produces_no_traffic() {
    let (_, roster) = roster(&[(1, "a")]);
    let config = MessagingConfig {
        backend: BackendKind::PeerDatagram,
        role: Role::Host,
        local_identity: "host".to_string(),
        max_payload: 32,
        ..MessagingConfig::default()
    };
    let log = Rc::new(RefCell::new(SessionLog::default()));
    let service = FakeSession {
        identity: ident("host"),
        log: Rc::clone(&log),
    };
    let mut host = PeerDatagramBackend::new(&config, Box::new(service), Some(roster));
    let channel = Rc::new(RefCell::new(ChannelLog::default()));
    assert!(host.initialize());
    host.register_channel(Box::new(FakeChannel(Rc::clone(&channel))));
    host.tick();

    assert!(!host.send_to_peer(ConnectionId(1), "state", &"x".repeat(256)));
    assert!(log.borrow().sent.is_empty());
    assert!(channel.borrow().to_peer.is_empty());
}

#[test]
fn test_peer_falls_back_until_host_known() {
    let (mut peer, log) = datagram_backend(Role::Peer, "peer-1", None);
    let channel = Rc::new(RefCell::new(ChannelLog::default()));
    assert!(peer.initialize());
    peer.register_channel(Box::new(FakeChannel(Rc::clone(&channel))));

    assert!(peer.send_to_host("auth", "token"));
    assert_eq!(channel.borrow().to_host.len(), 1);
    assert!(log.borrow().sent.is_empty());

    peer.set_host_identity(ident("host-1"));
    assert!(peer.send_to_host("auth", "token"));
    assert_eq!(channel.borrow().to_host.len(), 1);
    let sent = log.borrow();
    assert_eq!(sent.sent.len(), 1);
    assert_eq!(sent.sent[0].0, "host-1");
}

#[test]
fn test_peer_learns_host_identity_from_channel() {
    let (mut peer, log) = datagram_backend(Role::Peer, "peer-1", None);
    let channel = Rc::new(RefCell::new(ChannelLog::default()));
    assert!(peer.initialize());
    peer.register_channel(Box::new(FakeChannel(channel)));

    peer.deliver_channel(
        ChannelOrigin::Host,
        &envelope_bytes(HOST_IDENTITY_COMMAND, "host-9"),
    );
    peer.tick();

    // The identity exchange is absorbed and still surfaced.
    let events = peer.drain_events();
    assert_eq!(
        events,
        vec![BackendEvent::MessageFromHost {
            command: HOST_IDENTITY_COMMAND.to_string(),
            data: "host-9".to_string(),
        }]
    );
    assert!(peer.send_to_host("auth", "token"));
    assert_eq!(log.borrow().sent[0].0, "host-9");
}

#[test]
fn test_malformed_and_empty_payloads_dropped() {
    let (_, roster) = roster(&[(1, "alice")]);
    let (mut host, log) = datagram_backend(Role::Host, "host", Some(roster));
    assert!(host.initialize());

    push_message(&log, "alice", b"not json at all".to_vec());
    push_message(&log, "alice", Vec::new());
    push_message(&log, "alice", b"{\"data\":\"no command\"}".to_vec());
    host.tick();

    assert!(host.drain_events().is_empty());
}

#[test]
fn test_session_requests_are_accepted() {
    let (_, roster) = roster(&[(1, "alice")]);
    let (mut host, log) = datagram_backend(Role::Host, "host", Some(roster));
    assert!(host.initialize());

    log.borrow_mut()
        .inbound
        .push_back(SessionEvent::SessionRequest {
            from: ident("alice"),
        });
    host.tick();

    assert_eq!(log.borrow().accepted, vec!["alice".to_string()]);
}

#[test]
fn test_shutdown_is_idempotent() {
    let (mut peer, _) = datagram_backend(Role::Peer, "peer-1", None);
    peer.shutdown();
    assert!(peer.initialize());
    peer.set_host_identity(ident("host-1"));
    peer.shutdown();
    peer.shutdown();
    assert!(!peer.send_to_host("auth", "token"));
    assert!(peer.drain_events().is_empty());
}

#[derive(Default)]
struct SocketLog {
    sent: Vec<(u32, Vec<u8>)>,
    inbound: VecDeque<SocketEvent>,
    accepted: Vec<u32>,
    connect_target: Option<String>,
    connect_result: Option<u32>,
    listen_refused: bool,
}

struct FakeSocket {
    identity: PeerIdentity,
    log: Rc<RefCell<SocketLog>>,
}

impl SocketService for FakeSocket {
    fn is_available(&self) -> bool {
        true
    }

    fn local_identity(&self) -> &PeerIdentity {
        &self.identity
    }

    fn listen(&mut self, _virtual_port: u16) -> bool {
        !self.log.borrow().listen_refused
    }

    fn connect(&mut self, host: &str, _virtual_port: u16) -> Option<SocketHandle> {
        let mut log = self.log.borrow_mut();
        log.connect_target = Some(host.to_string());
        log.connect_result.map(SocketHandle)
    }

    fn accept(&mut self, handle: SocketHandle) -> bool {
        self.log.borrow_mut().accepted.push(handle.0);
        true
    }

    fn close_connection(&mut self, _handle: SocketHandle) {}

    fn shutdown(&mut self) {}

    fn send(&mut self, handle: SocketHandle, payload: &[u8]) -> SendResult {
        self.log.borrow_mut().sent.push((handle.0, payload.to_vec()));
        SendResult::Sent
    }

    fn poll(&mut self, max_events: usize) -> Vec<SocketEvent> {
        let mut log = self.log.borrow_mut();
        let count = max_events.min(log.inbound.len());
        log.inbound.drain(..count).collect()
    }
}

fn socket_backend(
    config: MessagingConfig,
    roster: Option<Box<dyn ConnectionRoster>>,
) -> (ConnectionSocketBackend, Rc<RefCell<SocketLog>>) {
    let identity = ident(&config.local_identity);
    let log = Rc::new(RefCell::new(SocketLog::default()));
    let service = FakeSocket {
        identity,
        log: Rc::clone(&log),
    };
    let backend = ConnectionSocketBackend::new(&config, Box::new(service), roster);
    (backend, log)
}

#[test]
fn test_socket_host_accepts_and_routes() {
    let (_, roster) = roster(&[(1, "alice")]);
    let config = MessagingConfig {
        backend: BackendKind::ConnectionSocket,
        role: Role::Host,
        local_identity: "host".to_string(),
        ..MessagingConfig::default()
    };
    let (mut host, log) = socket_backend(config, Some(roster));
    assert!(host.initialize());

    log.borrow_mut()
        .inbound
        .push_back(SocketEvent::Connecting {
            handle: SocketHandle(5),
            identity: ident("alice"),
        });
    log.borrow_mut().inbound.push_back(SocketEvent::Message {
        handle: SocketHandle(5),
        identity: ident("alice"),
        payload: envelope_bytes("ping", "1"),
    });
    host.tick();

    assert_eq!(log.borrow().accepted, vec![5]);
    assert_eq!(
        host.drain_events(),
        vec![BackendEvent::MessageFromPeer {
            connection: ConnectionId(1),
            command: "ping".to_string(),
            data: "1".to_string(),
        }]
    );

    assert!(host.send_to_peer(ConnectionId(1), "pong", "2"));
    assert_eq!(log.borrow().sent[0].0, 5);
}

#[test]
fn test_socket_peer_connects_to_configured_address() {
    let config = MessagingConfig {
        backend: BackendKind::ConnectionSocket,
        role: Role::Peer,
        local_identity: "peer-1".to_string(),
        host_address: Some("10.0.0.1:9000".to_string()),
        ..MessagingConfig::default()
    };
    let log = Rc::new(RefCell::new(SocketLog::default()));
    log.borrow_mut().connect_result = Some(3);
    let service = FakeSocket {
        identity: ident("peer-1"),
        log: Rc::clone(&log),
    };
    let mut peer =
        ConnectionSocketBackend::new(&config, Box::new(service), None);

    assert!(peer.initialize());
    assert_eq!(
        log.borrow().connect_target.as_deref(),
        Some("10.0.0.1:9000")
    );
    assert!(peer.send_to_host("auth", "token"));
    assert_eq!(log.borrow().sent[0].0, 3);
}

#[test]
fn test_socket_peer_falls_back_and_reconnects_on_hint() {
    let config = MessagingConfig {
        backend: BackendKind::ConnectionSocket,
        role: Role::Peer,
        local_identity: "peer-1".to_string(),
        ..MessagingConfig::default()
    };
    let (mut peer, log) = socket_backend(config, None);
    let channel = Rc::new(RefCell::new(ChannelLog::default()));
    assert!(peer.initialize());
    peer.register_channel(Box::new(FakeChannel(Rc::clone(&channel))));

    // No host address and no identity hint: nothing to connect to.
    assert!(peer.send_to_host("auth", "token"));
    assert_eq!(channel.borrow().to_host.len(), 1);
    assert!(log.borrow().sent.is_empty());

    log.borrow_mut().connect_result = Some(4);
    peer.set_host_identity(ident("192.168.1.2:7000"));
    assert_eq!(
        log.borrow().connect_target.as_deref(),
        Some("192.168.1.2:7000")
    );
    assert!(peer.send_to_host("auth", "token"));
    assert_eq!(log.borrow().sent[0].0, 4);
    assert_eq!(channel.borrow().to_host.len(), 1);
}

#[test]
fn test_socket_host_refuses_initialize_without_listen_socket() {
    let config = MessagingConfig {
        backend: BackendKind::ConnectionSocket,
        role: Role::Host,
        local_identity: "host".to_string(),
        ..MessagingConfig::default()
    };
    let log = Rc::new(RefCell::new(SocketLog::default()));
    log.borrow_mut().listen_refused = true;
    let service = FakeSocket {
        identity: ident("host"),
        log: Rc::clone(&log),
    };
    let mut host = ConnectionSocketBackend::new(&config, Box::new(service), None);
    assert!(!host.initialize());
    assert!(!host.send_to_peer(ConnectionId(1), "ping", "1"));
}

#[test]
fn test_socket_closed_connection_falls_back() {
    let (_, roster) = roster(&[(1, "alice")]);
    let config = MessagingConfig {
        backend: BackendKind::ConnectionSocket,
        role: Role::Host,
        local_identity: "host".to_string(),
        ..MessagingConfig::default()
    };
    let (mut host, log) = socket_backend(config, Some(roster));
    let channel = Rc::new(RefCell::new(ChannelLog::default()));
    assert!(host.initialize());
    host.register_channel(Box::new(FakeChannel(Rc::clone(&channel))));

    log.borrow_mut()
        .inbound
        .push_back(SocketEvent::Connecting {
            handle: SocketHandle(5),
            identity: ident("alice"),
        });
    host.tick();
    assert!(host.send_to_peer(ConnectionId(1), "ping", "1"));
    assert_eq!(log.borrow().sent.len(), 1);

    log.borrow_mut()
        .inbound
        .push_back(SocketEvent::Closed {
            handle: SocketHandle(5),
        });
    host.tick();
    assert!(host.send_to_peer(ConnectionId(1), "ping", "2"));
    assert_eq!(log.borrow().sent.len(), 1);
    assert_eq!(channel.borrow().to_peer.len(), 1);
}
