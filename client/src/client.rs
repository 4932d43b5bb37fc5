//! A sans-IO forwarding client.
//!
//! [`ClientState`] answers the server's challenge, announces the configured
//! forwards and then owns the virtual-peer table: every
//! `(port type, remote peer)` seen on the transit channel gets exactly one
//! socket towards the local service it maps to. Like its server counterpart
//! it performs no I/O; side-effects are emitted as [`Command`]s.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use passage_bin_shared::config::ClientConfig;
use passage_wire::{FlowFrame, PeerAddr, PortType, handshake, peer_config};
use secrecy::SecretString;

use crate::time_events::TimeEvents;

/// How long a virtual UDP peer may stay silent before it is torn down.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Identifies one virtual peer: the remote end of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub port_type: PortType,
    pub peer: PeerAddr,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    /// Send a logical message over the transit channel.
    SendMessage(Vec<u8>),
    /// Allocate an unconnected UDP socket for this virtual peer.
    OpenUdp { key: FlowKey },
    /// Start a non-blocking TCP connect towards the local service.
    OpenTcp { key: FlowKey, local: SocketAddrV4 },
    /// Relay a payload to the local service behind this virtual peer.
    SendToPeer {
        key: FlowKey,
        /// Datagram destination; established TCP peers ignore it.
        local: SocketAddrV4,
        payload: Vec<u8>,
    },
    /// Flush and close the virtual peer's socket.
    ClosePeer { key: FlowKey },
    /// Tear the transit channel down; the session is over.
    CloseTransit,
}

enum State {
    AwaitChallenge,
    Running,
    Closed,
}

struct VirtualPeer {
    /// The local target that created this peer; attribution for flow-closed.
    local: SocketAddrV4,
}

pub struct ClientState {
    token: SecretString,
    sections: BTreeMap<String, peer_config::Section>,

    remote2local: HashMap<(PortType, u16), SocketAddrV4>,
    local2remote: HashMap<(PortType, SocketAddrV4), u16>,

    peers: HashMap<FlowKey, VirtualPeer>,
    idle_timeout: Duration,
    timeouts: TimeEvents<FlowKey>,

    state: State,
    pending_commands: VecDeque<Command>,
}

impl ClientState {
    /// Consumes the configuration; the token moves in here and the rest of
    /// the config is dropped.
    pub fn new(config: ClientConfig, idle_timeout: Duration) -> Self {
        let sections = config.wire_sections();

        let mut remote2local = HashMap::new();
        let mut local2remote = HashMap::new();
        for forward in &config.forwards {
            for &(local_port, remote_port) in &forward.ports {
                let local = SocketAddrV4::new(forward.local_ip, local_port);

                remote2local.insert((forward.port_type, remote_port), local);
                local2remote.insert((forward.port_type, local), remote_port);
            }
        }

        Self {
            token: config.token,
            sections,
            remote2local,
            local2remote,
            peers: HashMap::new(),
            idle_timeout,
            timeouts: TimeEvents::default(),
            state: State::AwaitChallenge,
            pending_commands: VecDeque::new(),
        }
    }

    /// One complete logical message arrived on the transit channel.
    pub fn handle_transit_message(&mut self, message: &[u8], now: Instant) {
        match self.state {
            State::Closed => {}
            State::AwaitChallenge => match handshake::respond(&self.token, message) {
                Ok(digest) => {
                    self.pending_commands
                        .push_back(Command::SendMessage(digest.to_vec()));
                    self.pending_commands
                        .push_back(Command::SendMessage(peer_config::encode(&self.sections)));
                    self.state = State::Running;

                    tracing::info!("Authenticated; announced {} forward(s)", self.sections.len());
                }
                Err(e) => {
                    tracing::error!("Bad challenge from server: {e}");
                    self.close();
                }
            },
            State::Running => {
                let frame = match FlowFrame::decode(message) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::error!("Malformed flow frame: {e}");
                        self.close();
                        return;
                    }
                };

                self.dispatch_frame(frame, now);
            }
        }
    }

    /// A datagram arrived on a virtual peer's UDP socket.
    pub fn handle_peer_datagram(
        &mut self,
        key: FlowKey,
        from: SocketAddrV4,
        payload: Vec<u8>,
        now: Instant,
    ) {
        if !self.peers.contains_key(&key) {
            return;
        }

        let Some(&remote_port) = self.local2remote.get(&(PortType::Udp, from)) else {
            tracing::debug!(%from, "Datagram from unmapped local address");
            return;
        };

        self.timeouts.add(now + self.idle_timeout, key);
        self.send_frame(FlowFrame {
            port_type: PortType::Udp,
            port: remote_port,
            peer: key.peer,
            payload,
        });
    }

    /// Bytes arrived on a virtual peer's TCP socket.
    pub fn handle_peer_data(&mut self, key: FlowKey, payload: Vec<u8>) {
        let Some(peer) = self.peers.get(&key) else {
            return;
        };

        let Some(&remote_port) = self.local2remote.get(&(PortType::Tcp, peer.local)) else {
            tracing::warn!(local = %peer.local, "TCP peer has no remote mapping");
            return;
        };

        self.send_frame(FlowFrame {
            port_type: PortType::Tcp,
            port: remote_port,
            peer: key.peer,
            payload,
        });
    }

    /// A virtual peer's socket hit EOF, a connect failure or an error.
    pub fn handle_peer_closed(&mut self, key: FlowKey) {
        let Some(peer) = self.peers.remove(&key) else {
            return;
        };
        self.timeouts.remove(&key);

        tracing::info!(peer = %key.peer, "Virtual peer closed");

        self.send_flow_closed(key, &peer);
        self.pending_commands.push_back(Command::ClosePeer { key });
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        self.timeouts.next_trigger()
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        let due = self.timeouts.pending_actions(now).collect::<Vec<_>>();

        for key in due {
            let Some(peer) = self.peers.remove(&key) else {
                continue;
            };

            tracing::info!(peer = %key.peer, "Virtual peer timed out");

            self.send_flow_closed(key, &peer);
            self.pending_commands.push_back(Command::ClosePeer { key });
        }
    }

    /// The transit channel is gone; the session is over.
    pub fn handle_transit_closed(&mut self) {
        if !self.peers.is_empty() {
            tracing::info!("Dropping {} virtual peer(s)", self.peers.len());
        }

        self.peers.clear();
        self.timeouts = TimeEvents::default();
        self.pending_commands.clear();
        self.state = State::Closed;
    }

    /// Return the next command to be executed.
    pub fn next_command(&mut self) -> Option<Command> {
        self.pending_commands.pop_front()
    }

    fn dispatch_frame(&mut self, frame: FlowFrame, now: Instant) {
        let FlowFrame {
            port_type,
            port,
            peer,
            payload,
        } = frame;
        let key = FlowKey { port_type, peer };

        if payload.is_empty() {
            // Flow-closed for an unknown peer is dropped silently.
            let Some(peer) = self.peers.remove(&key) else {
                return;
            };
            self.timeouts.remove(&key);

            tracing::debug!(local = %peer.local, remote = %key.peer, "Flow closed by remote");
            self.pending_commands.push_back(Command::ClosePeer { key });
            return;
        }

        let Some(&local) = self.remote2local.get(&(port_type, port)) else {
            tracing::warn!(%port_type, %port, "Dropping frame for unmapped port");
            return;
        };

        if !self.peers.contains_key(&key) {
            self.peers.insert(key, VirtualPeer { local });

            tracing::info!(%port_type, remote = %peer, %local, "New virtual peer");

            match port_type {
                PortType::Udp => self.pending_commands.push_back(Command::OpenUdp { key }),
                PortType::Tcp => self
                    .pending_commands
                    .push_back(Command::OpenTcp { key, local }),
            }
        }

        if port_type == PortType::Udp {
            self.timeouts.add(now + self.idle_timeout, key);
        }

        self.pending_commands.push_back(Command::SendToPeer {
            key,
            local,
            payload,
        });
    }

    fn send_flow_closed(&mut self, key: FlowKey, peer: &VirtualPeer) {
        let Some(&remote_port) = self.local2remote.get(&(key.port_type, peer.local)) else {
            return;
        };

        self.send_frame(FlowFrame::closed(key.port_type, remote_port, key.peer));
    }

    fn send_frame(&mut self, frame: FlowFrame) {
        self.pending_commands
            .push_back(Command::SendMessage(frame.encode()));
    }

    fn close(&mut self) {
        self.pending_commands.push_back(Command::CloseTransit);
        self.state = State::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use passage_bin_shared::config::Forward;
    use passage_wire::handshake::Challenge;
    use rand::rngs::OsRng;
    use std::net::Ipv4Addr;

    const TOKEN: &str = "hunter2";

    fn now() -> Instant {
        Instant::now()
    }

    fn peer(port: u16) -> PeerAddr {
        PeerAddr::new(SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 7), port))
    }

    fn local(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    fn config() -> ClientConfig {
        ClientConfig {
            server_addr: "198.51.100.4".to_owned(),
            server_port: 16262,
            token: SecretString::from(TOKEN),
            log_file: None,
            log_level: None,
            forwards: vec![
                Forward {
                    name: "game".to_owned(),
                    port_type: PortType::Udp,
                    local_ip: Ipv4Addr::LOCALHOST,
                    ports: vec![(40001, 40000)],
                },
                Forward {
                    name: "rcon".to_owned(),
                    port_type: PortType::Tcp,
                    local_ip: Ipv4Addr::LOCALHOST,
                    ports: vec![(27015, 27016)],
                },
            ],
        }
    }

    fn client() -> ClientState {
        ClientState::new(config(), DEFAULT_IDLE_TIMEOUT)
    }

    fn running_client() -> ClientState {
        let mut client = client();
        let challenge = Challenge::new(&SecretString::from(TOKEN), &mut OsRng);

        client.handle_transit_message(challenge.nonces(), now());
        drain(&mut client);

        client
    }

    fn drain(client: &mut ClientState) -> Vec<Command> {
        std::iter::from_fn(|| client.next_command()).collect()
    }

    fn udp_frame(port: u16, from: PeerAddr, payload: &[u8]) -> Vec<u8> {
        FlowFrame {
            port_type: PortType::Udp,
            port,
            peer: from,
            payload: payload.to_vec(),
        }
        .encode()
    }

    #[test]
    fn answers_challenge_then_sends_config() {
        let mut client = client();
        let challenge = Challenge::new(&SecretString::from(TOKEN), &mut OsRng);

        client.handle_transit_message(challenge.nonces(), now());

        let commands = drain(&mut client);
        let [Command::SendMessage(digest), Command::SendMessage(config_json)] = &commands[..]
        else {
            panic!("expected digest followed by config, got {commands:?}")
        };

        assert!(challenge.verify(digest));

        let sections = peer_config::decode(config_json).unwrap();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].1.remote_port, "40000");
        assert_eq!(sections[1].1.remote_port, "27016");
    }

    #[test]
    fn malformed_challenge_closes() {
        let mut client = client();

        client.handle_transit_message(b"way too short", now());

        assert_eq!(drain(&mut client), vec![Command::CloseTransit]);
    }

    #[test]
    fn first_udp_frame_creates_a_virtual_peer() {
        let mut client = running_client();
        let key = FlowKey {
            port_type: PortType::Udp,
            peer: peer(5555),
        };

        client.handle_transit_message(&udp_frame(40000, peer(5555), b"ping"), now());

        assert_eq!(
            drain(&mut client),
            vec![
                Command::OpenUdp { key },
                Command::SendToPeer {
                    key,
                    local: local(40001),
                    payload: b"ping".to_vec(),
                },
            ]
        );

        // The next frame reuses the socket.
        client.handle_transit_message(&udp_frame(40000, peer(5555), b"pong"), now());

        assert_eq!(
            drain(&mut client),
            vec![Command::SendToPeer {
                key,
                local: local(40001),
                payload: b"pong".to_vec(),
            }]
        );
    }

    #[test]
    fn frames_for_unmapped_ports_are_dropped() {
        let mut client = running_client();

        client.handle_transit_message(&udp_frame(50000, peer(5555), b"ping"), now());

        assert_eq!(drain(&mut client), vec![]);
    }

    #[test]
    fn local_datagrams_flow_back_with_the_mapped_port() {
        let mut client = running_client();
        let key = FlowKey {
            port_type: PortType::Udp,
            peer: peer(5555),
        };

        client.handle_transit_message(&udp_frame(40000, peer(5555), b"ping"), now());
        drain(&mut client);

        client.handle_peer_datagram(key, local(40001), b"reply".to_vec(), now());

        let commands = drain(&mut client);
        let [Command::SendMessage(message)] = &commands[..] else {
            panic!("expected one transit message")
        };
        let frame = FlowFrame::decode(message).unwrap();

        assert_eq!(frame.port, 40000);
        assert_eq!(frame.peer, peer(5555));
        assert_eq!(frame.payload, b"reply");
    }

    #[test]
    fn datagrams_from_unmapped_local_addresses_are_dropped() {
        let mut client = running_client();
        let key = FlowKey {
            port_type: PortType::Udp,
            peer: peer(5555),
        };

        client.handle_transit_message(&udp_frame(40000, peer(5555), b"ping"), now());
        drain(&mut client);

        client.handle_peer_datagram(key, local(9), b"stray".to_vec(), now());

        assert_eq!(drain(&mut client), vec![]);
    }

    #[test]
    fn idle_timeout_emits_exactly_one_flow_closed() {
        let mut client = running_client();
        let key = FlowKey {
            port_type: PortType::Udp,
            peer: peer(5555),
        };

        let start = now();
        client.handle_transit_message(&udp_frame(40000, peer(5555), b"ping"), start);
        drain(&mut client);

        let deadline = client.poll_timeout().unwrap();
        assert_eq!(deadline, start + DEFAULT_IDLE_TIMEOUT);

        client.handle_timeout(deadline);

        let commands = drain(&mut client);
        let [Command::SendMessage(message), Command::ClosePeer { .. }] = &commands[..] else {
            panic!("expected flow-closed then close, got {commands:?}")
        };
        let frame = FlowFrame::decode(message).unwrap();
        assert!(frame.is_closed());
        assert_eq!(frame.port, 40000);
        assert_eq!(frame.peer, peer(5555));

        // The peer is gone; a second expiry must do nothing.
        client.handle_timeout(deadline + DEFAULT_IDLE_TIMEOUT);
        assert_eq!(drain(&mut client), vec![]);
        assert!(!client.peers.contains_key(&key));
    }

    #[test]
    fn traffic_postpones_the_idle_deadline() {
        let mut client = running_client();

        let start = now();
        client.handle_transit_message(&udp_frame(40000, peer(5555), b"ping"), start);
        drain(&mut client);

        let later = start + Duration::from_secs(100);
        client.handle_transit_message(&udp_frame(40000, peer(5555), b"ping"), later);
        drain(&mut client);

        assert_eq!(client.poll_timeout(), Some(later + DEFAULT_IDLE_TIMEOUT));
    }

    #[test]
    fn flow_closed_removes_the_peer() {
        let mut client = running_client();
        let key = FlowKey {
            port_type: PortType::Udp,
            peer: peer(5555),
        };

        client.handle_transit_message(&udp_frame(40000, peer(5555), b"ping"), now());
        drain(&mut client);

        client.handle_transit_message(&udp_frame(40000, peer(5555), b""), now());

        assert_eq!(drain(&mut client), vec![Command::ClosePeer { key }]);
        assert_eq!(client.poll_timeout(), None);

        // Unknown peers are dropped silently.
        client.handle_transit_message(&udp_frame(40000, peer(7777), b""), now());
        assert_eq!(drain(&mut client), vec![]);
    }

    #[test]
    fn tcp_frames_connect_then_relay() {
        let mut client = running_client();
        let key = FlowKey {
            port_type: PortType::Tcp,
            peer: peer(6000),
        };

        let frame = FlowFrame {
            port_type: PortType::Tcp,
            port: 27016,
            peer: peer(6000),
            payload: b"abc".to_vec(),
        };
        client.handle_transit_message(&frame.encode(), now());

        assert_eq!(
            drain(&mut client),
            vec![
                Command::OpenTcp {
                    key,
                    local: local(27015),
                },
                Command::SendToPeer {
                    key,
                    local: local(27015),
                    payload: b"abc".to_vec(),
                },
            ]
        );

        // TCP peers carry no idle deadline.
        assert_eq!(client.poll_timeout(), None);
    }

    #[test]
    fn local_tcp_eof_emits_flow_closed_once() {
        let mut client = running_client();
        let key = FlowKey {
            port_type: PortType::Tcp,
            peer: peer(6000),
        };

        let frame = FlowFrame {
            port_type: PortType::Tcp,
            port: 27016,
            peer: peer(6000),
            payload: b"abc".to_vec(),
        };
        client.handle_transit_message(&frame.encode(), now());
        drain(&mut client);

        client.handle_peer_closed(key);
        client.handle_peer_closed(key);

        let commands = drain(&mut client);
        let [Command::SendMessage(message), Command::ClosePeer { .. }] = &commands[..] else {
            panic!("expected flow-closed then close, got {commands:?}")
        };
        let frame = FlowFrame::decode(message).unwrap();
        assert!(frame.is_closed());
        assert_eq!(frame.port, 27016);
    }

    #[test]
    fn teardown_clears_the_peer_table() {
        let mut client = running_client();

        client.handle_transit_message(&udp_frame(40000, peer(5555), b"ping"), now());
        drain(&mut client);

        client.handle_transit_closed();

        assert!(client.peers.is_empty());
        assert_eq!(client.poll_timeout(), None);
        assert_eq!(drain(&mut client), vec![]);
    }
}
