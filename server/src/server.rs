//! A sans-IO forwarding server.
//!
//! [`Server`] drives one transit session at a time through the handshake
//! (`AwaitToken → AwaitConfig → Running`) and owns the flow table: which
//! public ports are bound, which peers each of them has seen, and which
//! accepted TCP connections exist. It performs no I/O itself; every
//! side-effect is described by a [`Command`] that the caller pops with
//! [`Server::next_command`] and executes.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::time::{Duration, Instant};

use passage_wire::handshake::Challenge;
use passage_wire::{FlowFrame, PeerAddr, PortType, peer_config};
use rand::{CryptoRng, RngCore};
use secrecy::SecretString;

/// Grace period for the client to present its token.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(3);

pub struct Server<R> {
    token: SecretString,
    rng: R,

    state: State,

    /// Every bound public port, with its per-protocol peer state.
    listeners: BTreeMap<(PortType, u16), Listener>,
    /// Ports held by the active session; enforced against new configurations.
    used_ports: HashSet<u16>,

    pending_commands: VecDeque<Command>,
}

/// The side-effects the caller must execute, in order.
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    /// Send a logical message over the transit channel.
    SendMessage(Vec<u8>),
    /// Bind a public UDP socket on `0.0.0.0:port`.
    BindUdp { port: u16 },
    /// Bind + listen a public TCP socket on `0.0.0.0:port`.
    BindTcp { port: u16 },
    /// Send one datagram from the given public UDP port.
    SendDatagram {
        port: u16,
        dest: PeerAddr,
        payload: Vec<u8>,
    },
    /// Write bytes to an accepted public TCP connection.
    SendTcp {
        port: u16,
        peer: PeerAddr,
        payload: Vec<u8>,
    },
    /// Flush and close an accepted public TCP connection.
    CloseTcpConn { port: u16, peer: PeerAddr },
    /// Tear the transit channel down; the session failed.
    CloseTransit(SessionError),
}

/// Why the server abandoned a transit session.
///
/// A client that simply disconnects is a clean end and never produces one of
/// these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("client failed authentication")]
    AuthFailed,
    #[error("client configuration rejected")]
    BadConfig,
    #[error("transit protocol violated")]
    Protocol,
    #[error("a public listener failed")]
    ListenerFailed,
}

enum State {
    /// No transit client.
    Idle,
    AwaitToken {
        challenge: Challenge,
        deadline: Instant,
    },
    AwaitConfig,
    Running,
    /// A fatal condition was met; ignore inputs until the caller confirms the
    /// teardown via [`Server::handle_transit_closed`].
    Closed,
}

enum Listener {
    Udp {
        /// Peers observed on this port. Observation only; no per-peer sockets.
        peers: BTreeSet<PeerAddr>,
        /// Attribution for ICMP-unreachable: the last peer we sent to.
        last_sent: Option<PeerAddr>,
    },
    Tcp {
        conns: BTreeSet<PeerAddr>,
    },
}

impl<R> Server<R>
where
    R: RngCore + CryptoRng,
{
    pub fn new(token: SecretString, rng: R) -> Self {
        Self {
            token,
            rng,
            state: State::Idle,
            listeners: BTreeMap::new(),
            used_ports: HashSet::new(),
            pending_commands: VecDeque::new(),
        }
    }

    /// A transit client connected; issue the challenge.
    pub fn handle_transit_connected(&mut self, now: Instant) {
        debug_assert!(matches!(self.state, State::Idle));

        let challenge = Challenge::new(&self.token, &mut self.rng);

        self.pending_commands
            .push_back(Command::SendMessage(challenge.nonces().to_vec()));
        self.state = State::AwaitToken {
            challenge,
            deadline: now + AUTH_TIMEOUT,
        };
    }

    /// One complete logical message arrived on the transit channel.
    pub fn handle_transit_message(&mut self, message: &[u8], now: Instant) {
        match &self.state {
            State::Idle | State::Closed => {}
            State::AwaitToken { challenge, deadline } => {
                if now >= *deadline {
                    tracing::info!("Client took too long to present its token");
                    self.close(SessionError::AuthFailed);
                    return;
                }

                if !challenge.verify(message) {
                    tracing::info!("Client token verification failed");
                    self.close(SessionError::AuthFailed);
                    return;
                }

                tracing::debug!("Client token verified");
                self.state = State::AwaitConfig;
            }
            State::AwaitConfig => match self.apply_config(message) {
                Ok(()) => {
                    self.state = State::Running;
                }
                Err(e) => {
                    tracing::error!("Rejecting client configuration: {e}");
                    self.close(SessionError::BadConfig);
                }
            },
            State::Running => {
                let frame = match FlowFrame::decode(message) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::error!("Malformed flow frame: {e}");
                        self.close(SessionError::Protocol);
                        return;
                    }
                };

                self.dispatch_frame(frame);
            }
        }
    }

    /// The deadline the caller must wake us at, if any.
    pub fn poll_timeout(&self) -> Option<Instant> {
        match &self.state {
            State::AwaitToken { deadline, .. } => Some(*deadline),
            State::Idle | State::AwaitConfig | State::Running | State::Closed => None,
        }
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        let State::AwaitToken { deadline, .. } = &self.state else {
            return;
        };

        if now >= *deadline {
            tracing::info!("Client took too long to present its token");
            self.close(SessionError::AuthFailed);
        }
    }

    /// A datagram arrived on a bound public UDP port.
    pub fn handle_datagram(&mut self, port: u16, from: PeerAddr, payload: Vec<u8>) {
        let Some(Listener::Udp { peers, .. }) = self.listeners.get_mut(&(PortType::Udp, port))
        else {
            return;
        };

        if peers.insert(from) {
            tracing::debug!(%port, peer = %from, "New UDP peer");
        }

        self.send_frame(FlowFrame {
            port_type: PortType::Udp,
            port,
            peer: from,
            payload,
        });
    }

    /// A bound UDP port reported an ICMP-unreachable condition.
    ///
    /// The kernel does not tell us which peer became unreachable, so the last
    /// peer we sent to is the best available attribution.
    pub fn handle_udp_unreachable(&mut self, port: u16) {
        let Some(Listener::Udp { peers, last_sent }) =
            self.listeners.get_mut(&(PortType::Udp, port))
        else {
            return;
        };
        let Some(peer) = last_sent.take() else {
            return;
        };

        tracing::info!(%port, %peer, "UDP peer unreachable");
        peers.remove(&peer);

        self.send_frame(FlowFrame::closed(PortType::Udp, port, peer));
    }

    /// A public TCP listener accepted a connection.
    pub fn handle_tcp_accepted(&mut self, port: u16, peer: PeerAddr) {
        let Some(Listener::Tcp { conns }) = self.listeners.get_mut(&(PortType::Tcp, port)) else {
            return;
        };

        tracing::info!(%port, %peer, "New TCP connection");
        conns.insert(peer);
    }

    /// Bytes arrived on an accepted public TCP connection.
    pub fn handle_tcp_data(&mut self, port: u16, peer: PeerAddr, payload: Vec<u8>) {
        self.send_frame(FlowFrame {
            port_type: PortType::Tcp,
            port,
            peer,
            payload,
        });
    }

    /// An accepted public TCP connection hit EOF or an error.
    pub fn handle_tcp_closed(&mut self, port: u16, peer: PeerAddr) {
        let Some(Listener::Tcp { conns }) = self.listeners.get_mut(&(PortType::Tcp, port)) else {
            return;
        };

        if !conns.remove(&peer) {
            return;
        }

        tracing::info!(%port, %peer, "TCP connection closed");

        self.send_frame(FlowFrame::closed(PortType::Tcp, port, peer));
        self.pending_commands
            .push_back(Command::CloseTcpConn { port, peer });
    }

    /// A listener could not be bound or failed fatally; the session dies.
    pub fn handle_listener_failed(&mut self, port_type: PortType, port: u16) {
        tracing::error!(%port_type, %port, "Public listener failed");
        self.close(SessionError::ListenerFailed);
    }

    /// The transit channel is gone; release every resource of the session.
    pub fn handle_transit_closed(&mut self) {
        if !self.listeners.is_empty() {
            tracing::info!("Tearing down {} public listener(s)", self.listeners.len());
        }

        self.listeners.clear();
        self.used_ports.clear();
        self.pending_commands.clear();
        self.state = State::Idle;
    }

    /// Return the next command to be executed.
    pub fn next_command(&mut self) -> Option<Command> {
        self.pending_commands.pop_front()
    }

    fn dispatch_frame(&mut self, frame: FlowFrame) {
        let FlowFrame {
            port_type,
            port,
            peer,
            payload,
        } = frame;

        let Some(listener) = self.listeners.get_mut(&(port_type, port)) else {
            tracing::warn!(%port_type, %port, "Dropping frame for unbound port");
            return;
        };

        match listener {
            Listener::Udp { peers, last_sent } => {
                if payload.is_empty() {
                    // The client's virtual peer is gone; forget what we know.
                    peers.remove(&peer);
                    return;
                }

                *last_sent = Some(peer);
                self.pending_commands.push_back(Command::SendDatagram {
                    port,
                    dest: peer,
                    payload,
                });
            }
            Listener::Tcp { conns } => {
                if !conns.contains(&peer) {
                    tracing::warn!(%port, %peer, "No corresponding TCP connection");
                    self.send_frame(FlowFrame::closed(PortType::Tcp, port, peer));
                    return;
                }

                if payload.is_empty() {
                    conns.remove(&peer);
                    self.pending_commands
                        .push_back(Command::CloseTcpConn { port, peer });
                    return;
                }

                self.pending_commands
                    .push_back(Command::SendTcp { port, peer, payload });
            }
        }
    }

    fn apply_config(&mut self, message: &[u8]) -> Result<(), ConfigError> {
        let sections = peer_config::decode(message)?;

        let mut requested = Vec::new();
        let mut seen = HashSet::new();

        for (name, section) in &sections {
            let port_type = section.port_type()?;

            for port in section.remote_ports()? {
                if !seen.insert(port) || self.used_ports.contains(&port) {
                    return Err(ConfigError::PortCollision(port));
                }

                tracing::debug!(section = %name, %port_type, %port, "Requested public port");
                requested.push((port_type, port));
            }
        }

        for (port_type, port) in requested {
            let (listener, command) = match port_type {
                PortType::Udp => (
                    Listener::Udp {
                        peers: BTreeSet::new(),
                        last_sent: None,
                    },
                    Command::BindUdp { port },
                ),
                PortType::Tcp => (
                    Listener::Tcp {
                        conns: BTreeSet::new(),
                    },
                    Command::BindTcp { port },
                ),
            };

            self.listeners.insert((port_type, port), listener);
            self.used_ports.insert(port);
            self.pending_commands.push_back(command);
        }

        tracing::info!(
            "Starting {} public listener(s) for the client",
            self.listeners.len()
        );

        Ok(())
    }

    fn send_frame(&mut self, frame: FlowFrame) {
        self.pending_commands
            .push_back(Command::SendMessage(frame.encode()));
    }

    fn close(&mut self, error: SessionError) {
        self.pending_commands.push_back(Command::CloseTransit(error));
        self.state = State::Closed;
    }
}

#[derive(Debug, thiserror::Error)]
enum ConfigError {
    #[error(transparent)]
    Config(#[from] peer_config::Error),
    #[error("port {0} is already occupied")]
    PortCollision(u16),
}
