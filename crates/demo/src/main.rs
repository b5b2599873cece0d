use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use sidechannel::{
    BackendKind, BootstrapChannel, ChannelOrigin, ConnectionId, ConnectionRoster,
    MessagingConfig, MessagingEvent, MessagingService, PeerIdentity, Role, RosterEntry,
};

#[derive(Parser)]
#[command(name = "sidechannel-demo")]
#[command(about = "Loopback host plus peers exercising one messaging backend")]
struct Args {
    /// bootstrap-channel, peer-datagram or connection-socket
    #[arg(short, long, default_value = "peer-datagram")]
    backend: String,

    #[arg(short, long, default_value_t = 2)]
    peers: usize,

    #[arg(short, long, default_value_t = 30)]
    ticks: u32,

    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    #[arg(long, default_value_t = 43500)]
    port: u16,

    #[arg(long, default_value_t = 15)]
    tick_ms: u64,
}

struct FixedRoster(Vec<RosterEntry>);

impl ConnectionRoster for FixedRoster {
    fn connections(&self) -> Vec<RosterEntry> {
        self.0.clone()
    }
}

type Mailbox = Rc<RefCell<VecDeque<(ChannelOrigin, Vec<u8>)>>>;

/// In-process stand-in for a peer's side of the always-available
/// channel: host-bound sends land in the host's mailbox, and the main
/// loop shuttles mailboxes into `deliver_channel` once per tick.
struct PeerChannel {
    connection: ConnectionId,
    host_inbox: Mailbox,
}

impl BootstrapChannel for PeerChannel {
    fn is_spawned(&self) -> bool {
        true
    }

    fn send_to_host(&mut self, payload: &[u8]) -> bool {
        self.host_inbox
            .borrow_mut()
            .push_back((ChannelOrigin::Peer(self.connection), payload.to_vec()));
        true
    }

    fn send_to_peer(&mut self, _connection: ConnectionId, _payload: &[u8]) -> bool {
        false
    }
}

/// Host side of the channel: the singleton object fans out to one
/// mailbox per connected peer.
struct HostChannel {
    peer_inboxes: Vec<Mailbox>,
}

impl BootstrapChannel for HostChannel {
    fn is_spawned(&self) -> bool {
        true
    }

    fn send_to_host(&mut self, _payload: &[u8]) -> bool {
        false
    }

    fn send_to_peer(&mut self, connection: ConnectionId, payload: &[u8]) -> bool {
        let Some(index) = usize::try_from(connection.0)
            .ok()
            .and_then(|i| i.checked_sub(1))
        else {
            return false;
        };
        match self.peer_inboxes.get(index) {
            Some(inbox) => {
                inbox
                    .borrow_mut()
                    .push_back((ChannelOrigin::Host, payload.to_vec()));
                true
            }
            None => false,
        }
    }
}

fn shuttle(service: &mut MessagingService, inbox: &Mailbox) {
    loop {
        let next = inbox.borrow_mut().pop_front();
        match next {
            Some((origin, payload)) => service.deliver_channel(origin, &payload),
            None => break,
        }
    }
}


fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let backend: BackendKind = args
        .backend
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    let host_addr = format!("{}:{}", args.bind, args.port);

    let roster: Vec<RosterEntry> = (1..=args.peers as i64)
        .map(|connection| RosterEntry {
            connection: ConnectionId(connection),
            identity: PeerIdentity::new(format!("peer-{connection}")),
        })
        .collect();

    let mut host = MessagingService::from_config(
        &MessagingConfig {
            backend,
            role: Role::Host,
            local_identity: "host".to_string(),
            bind_address: host_addr.clone(),
            ..MessagingConfig::default()
        },
        Some(Box::new(FixedRoster(roster))),
    );
    anyhow::ensure!(host.initialize(), "host backend failed to initialize");
    log::info!("host up: {}", host.status_info());

    let host_inbox: Mailbox = Rc::new(RefCell::new(VecDeque::new()));
    let mut peer_inboxes: Vec<Mailbox> = Vec::new();
    let mut peers: Vec<MessagingService> = Vec::new();
    for connection in 1..=args.peers as i64 {
        let mut peer = MessagingService::from_config(
            &MessagingConfig {
                backend,
                role: Role::Peer,
                local_identity: format!("peer-{connection}"),
                bind_address: format!("{}:0", args.bind),
                host_address: Some(host_addr.clone()),
                host_identity: Some(host_addr.clone()),
                ..MessagingConfig::default()
            },
            None,
        );
        anyhow::ensure!(
            peer.initialize(),
            "peer {connection} backend failed to initialize"
        );
        peer.on_channel_ready(Box::new(PeerChannel {
            connection: ConnectionId(connection),
            host_inbox: Rc::clone(&host_inbox),
        }));
        peer_inboxes.push(Rc::new(RefCell::new(VecDeque::new())));
        peers.push(peer);
        log::info!("peer {connection} up");
    }
    host.on_channel_ready(Box::new(HostChannel {
        peer_inboxes: peer_inboxes.iter().map(Rc::clone).collect(),
    }));

    // Greet before any peer has sent a datagram: on the network
    // backends this lands on the bootstrap fallback, because the host
    // has no primary route for anyone yet.
    let greeted = host.broadcast_to_clients("welcome", "{\"motd\":\"hello\"}");
    log::info!("greeted {greeted} peer(s)");

    for tick in 0..args.ticks {
        for (index, peer) in peers.iter_mut().enumerate() {
            let connection = index as i64 + 1;
            peer.send_to_server("ping", &format!("{{\"tick\":{tick},\"from\":{connection}}}"));
            shuttle(peer, &peer_inboxes[index]);
            peer.tick();
            for event in peer.drain_events() {
                if let MessagingEvent::ClientMessageReceived { command, data } = event {
                    log::info!("peer {connection} <- host: {command} {data}");
                }
            }
        }

        shuttle(&mut host, &host_inbox);
        host.tick();
        for event in host.drain_events() {
            if let MessagingEvent::ServerMessageReceived {
                connection,
                command,
                data,
            } = event
            {
                log::info!("host <- {connection}: {command} {data}");
                host.send_to_client(connection, "pong", &data);
            }
        }

        thread::sleep(Duration::from_millis(args.tick_ms));
    }

    log::info!("final status: {}", host.status_info());
    host.shutdown();
    for peer in &mut peers {
        peer.shutdown();
    }
    Ok(())
}
