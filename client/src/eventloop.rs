//! Executes the [`ClientState`]'s commands against real sockets.
//!
//! One instance drives one session: it pumps the transit stream and the
//! virtual-peer sockets, keeps per-peer write queues with partial-send
//! retention and feeds every observation back into the sans-IO core. TCP
//! connects towards local services stay pending futures until they resolve;
//! payload queued in the meantime is flushed once the connection is up.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::mem;
use std::net::{SocketAddr, SocketAddrV4};
use std::task::{Context, Poll};
use std::time::Instant;

use futures::FutureExt as _;
use futures::future::BoxFuture;
use tokio::io::ReadBuf;
use tokio::net::{TcpStream, UdpSocket};
use transit_stream::{Deadline, TransitStream};

use crate::client::{ClientState, Command, FlowKey};

/// Soft cap on datagrams queued towards one local service.
const UDP_QUEUE_CAP: usize = 256 * 1024;

/// Soft cap on bytes queued towards one local TCP connection.
const TCP_QUEUE_CAP: usize = 1024 * 1024;

/// How many reads we grant one socket before moving on to its neighbours.
const MAX_READS_PER_TURN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transit connection closed by server")]
    TransitClosed,
    #[error("transit protocol violated")]
    Protocol,
    #[error("transit connection failed")]
    Transit(#[source] transit_stream::Error),
}

pub struct Eventloop<'a> {
    client: &'a mut ClientState,
    transit: TransitStream,

    peers: HashMap<FlowKey, PeerSocket>,

    deadline: Deadline,

    read_buf: Box<[u8]>,
    closing: bool,
}

enum PeerSocket {
    Udp {
        socket: UdpSocket,
        /// Datagrams not yet accepted by the kernel, with their destination.
        pending: VecDeque<(Vec<u8>, SocketAddrV4)>,
        queued_bytes: usize,
        closing: bool,
    },
    Connecting {
        connect: BoxFuture<'static, io::Result<TcpStream>>,
        queued: VecDeque<Vec<u8>>,
        queued_bytes: usize,
        closing: bool,
    },
    Tcp {
        stream: TcpStream,
        write_queue: VecDeque<Vec<u8>>,
        write_offset: usize,
        queued_bytes: usize,
        closing: bool,
    },
}

impl<'a> Eventloop<'a> {
    pub fn new(client: &'a mut ClientState, transit: TransitStream) -> Self {
        Self {
            client,
            transit,
            peers: HashMap::new(),
            deadline: Deadline::default(),
            read_buf: vec![0u8; 0xFFFF * 2].into_boxed_slice(),
            closing: false,
        }
    }

    /// Runs the session until the transit channel dies.
    pub async fn run(mut self) -> Result<(), Error> {
        let result = std::future::poll_fn(|cx| self.poll(cx)).await;
        self.client.handle_transit_closed();

        result
    }

    fn poll(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        loop {
            self.drain_commands();

            if self.closing {
                return Poll::Ready(Err(Error::Protocol));
            }

            match self.transit.poll_flush(cx) {
                Poll::Ready(Ok(())) | Poll::Pending => {}
                Poll::Ready(Err(e)) => return Poll::Ready(Err(Error::Transit(e))),
            }

            self.deadline.set(self.client.poll_timeout());
            if self.deadline.poll(cx).is_ready() {
                self.client.handle_timeout(Instant::now());
                continue;
            }

            match self.transit.poll_next_message(cx) {
                Poll::Ready(Ok(message)) => {
                    self.client.handle_transit_message(&message, Instant::now());
                    continue;
                }
                Poll::Ready(Err(transit_stream::Error::Closed)) => {
                    return Poll::Ready(Err(Error::TransitClosed));
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(Error::Transit(e))),
                Poll::Pending => {}
            }

            if self.pump_peers(cx) {
                continue;
            }

            return Poll::Pending;
        }
    }

    fn drain_commands(&mut self) {
        while let Some(command) = self.client.next_command() {
            match command {
                Command::SendMessage(message) => {
                    if let Err(e) = self.transit.send(&message) {
                        tracing::error!("Transit channel overloaded: {e}");
                        self.closing = true;
                    }
                }
                Command::OpenUdp { key } => match open_udp() {
                    Ok(socket) => {
                        self.peers.insert(
                            key,
                            PeerSocket::Udp {
                                socket,
                                pending: VecDeque::new(),
                                queued_bytes: 0,
                                closing: false,
                            },
                        );
                    }
                    Err(e) => {
                        tracing::warn!(peer = %key.peer, "Failed to open UDP socket: {e}");
                        self.client.handle_peer_closed(key);
                    }
                },
                Command::OpenTcp { key, local } => {
                    self.peers.insert(
                        key,
                        PeerSocket::Connecting {
                            connect: TcpStream::connect(SocketAddr::V4(local)).boxed(),
                            queued: VecDeque::new(),
                            queued_bytes: 0,
                            closing: false,
                        },
                    );
                }
                Command::SendToPeer {
                    key,
                    local,
                    payload,
                } => self.enqueue_to_peer(key, local, payload),
                Command::ClosePeer { key } => {
                    if let Some(peer) = self.peers.get_mut(&key) {
                        match peer {
                            PeerSocket::Udp { closing, .. }
                            | PeerSocket::Connecting { closing, .. }
                            | PeerSocket::Tcp { closing, .. } => *closing = true,
                        }
                    }
                }
                Command::CloseTransit => {
                    self.closing = true;
                }
            }
        }
    }

    fn enqueue_to_peer(&mut self, key: FlowKey, local: SocketAddrV4, payload: Vec<u8>) {
        let Some(peer) = self.peers.get_mut(&key) else {
            return;
        };

        match peer {
            PeerSocket::Udp {
                pending,
                queued_bytes,
                closing,
                ..
            } => {
                if *closing {
                    return;
                }

                // Oldest datagrams make room for new ones.
                while *queued_bytes + payload.len() > UDP_QUEUE_CAP {
                    let Some((dropped, _)) = pending.pop_front() else {
                        break;
                    };
                    *queued_bytes -= dropped.len();
                    tracing::debug!(peer = %key.peer, "UDP send queue full, dropping oldest datagram");
                }

                *queued_bytes += payload.len();
                pending.push_back((payload, local));
            }
            PeerSocket::Connecting {
                queued,
                queued_bytes,
                closing,
                ..
            } => {
                if *closing {
                    return;
                }

                if *queued_bytes + payload.len() > TCP_QUEUE_CAP {
                    tracing::warn!(peer = %key.peer, "TCP send queue full, closing flow");
                    self.peers.remove(&key);
                    self.client.handle_peer_closed(key);
                    return;
                }

                *queued_bytes += payload.len();
                queued.push_back(payload);
            }
            PeerSocket::Tcp {
                write_queue,
                queued_bytes,
                closing,
                ..
            } => {
                if *closing {
                    return;
                }

                if *queued_bytes + payload.len() > TCP_QUEUE_CAP {
                    tracing::warn!(peer = %key.peer, "TCP send queue full, closing flow");
                    self.peers.remove(&key);
                    self.client.handle_peer_closed(key);
                    return;
                }

                *queued_bytes += payload.len();
                write_queue.push_back(payload);
            }
        }
    }

    fn pump_peers(&mut self, cx: &mut Context<'_>) -> bool {
        let mut progress = false;
        let mut dead = Vec::new();
        let mut flushed = Vec::new();

        for (&key, peer) in self.peers.iter_mut() {
            match peer {
                PeerSocket::Udp {
                    socket,
                    pending,
                    queued_bytes,
                    closing,
                } => {
                    let failed = pump_udp_peer(
                        cx,
                        key,
                        socket,
                        pending,
                        queued_bytes,
                        self.client,
                        &mut self.read_buf,
                        &mut progress,
                    );

                    if failed {
                        dead.push(key);
                    } else if *closing && pending.is_empty() {
                        flushed.push(key);
                    }
                }
                PeerSocket::Connecting {
                    connect,
                    queued,
                    queued_bytes,
                    closing,
                } => match connect.poll_unpin(cx) {
                    Poll::Ready(Ok(stream)) => {
                        tracing::debug!(peer = %key.peer, "Connected to local service");

                        *peer = PeerSocket::Tcp {
                            stream,
                            write_queue: mem::take(queued),
                            write_offset: 0,
                            queued_bytes: *queued_bytes,
                            closing: *closing,
                        };
                        progress = true;
                    }
                    Poll::Ready(Err(e)) => {
                        tracing::warn!(peer = %key.peer, "Failed to connect to local service: {e}");
                        dead.push(key);
                    }
                    Poll::Pending => {}
                },
                PeerSocket::Tcp {
                    stream,
                    write_queue,
                    write_offset,
                    queued_bytes,
                    closing,
                } => {
                    let failed = pump_tcp_peer(
                        cx,
                        key,
                        stream,
                        write_queue,
                        write_offset,
                        queued_bytes,
                        *closing,
                        self.client,
                        &mut self.read_buf,
                        &mut progress,
                    );

                    if failed {
                        dead.push(key);
                    } else if *closing && write_queue.is_empty() {
                        flushed.push(key);
                    }
                }
            }
        }

        for key in flushed {
            self.peers.remove(&key);
        }
        for key in dead {
            self.peers.remove(&key);
            self.client.handle_peer_closed(key);
            progress = true;
        }

        progress
    }
}

/// Pumps one virtual UDP peer; returns `true` if the socket failed.
fn pump_udp_peer(
    cx: &mut Context<'_>,
    key: FlowKey,
    socket: &UdpSocket,
    pending: &mut VecDeque<(Vec<u8>, SocketAddrV4)>,
    queued_bytes: &mut usize,
    client: &mut ClientState,
    read_buf: &mut [u8],
    progress: &mut bool,
) -> bool {
    while !pending.is_empty() {
        match socket.poll_send_ready(cx) {
            Poll::Pending => break,
            Poll::Ready(Err(e)) => {
                tracing::warn!(peer = %key.peer, "UDP socket failed: {e}");
                return true;
            }
            Poll::Ready(Ok(())) => {}
        }

        let (payload, dest) = &pending[0];
        match socket.try_send_to(payload, SocketAddr::V4(*dest)) {
            Ok(sent) => {
                *queued_bytes -= sent;
                if sent == pending[0].0.len() {
                    pending.pop_front();
                } else if let Some((payload, _)) = pending.front_mut() {
                    payload.drain(..sent);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => {
                tracing::warn!(peer = %key.peer, "UDP socket failed: {e}");
                return true;
            }
        }
    }

    for _ in 0..MAX_READS_PER_TURN {
        let mut buf = ReadBuf::new(read_buf);

        match socket.poll_recv_from(cx, &mut buf) {
            Poll::Ready(Ok(from)) => {
                let SocketAddr::V4(from) = from else {
                    continue;
                };

                client.handle_peer_datagram(key, from, buf.filled().to_vec(), Instant::now());
                *progress = true;
            }
            Poll::Ready(Err(e)) => {
                // The local service became unreachable; tear the flow down.
                tracing::warn!(peer = %key.peer, "UDP socket failed: {e}");
                return true;
            }
            Poll::Pending => break,
        }
    }

    false
}

/// Pumps one established TCP peer; returns `true` if the connection is done.
fn pump_tcp_peer(
    cx: &mut Context<'_>,
    key: FlowKey,
    stream: &TcpStream,
    write_queue: &mut VecDeque<Vec<u8>>,
    write_offset: &mut usize,
    queued_bytes: &mut usize,
    closing: bool,
    client: &mut ClientState,
    read_buf: &mut [u8],
    progress: &mut bool,
) -> bool {
    while !write_queue.is_empty() {
        match stream.poll_write_ready(cx) {
            Poll::Pending => break,
            Poll::Ready(Err(e)) => {
                tracing::debug!(peer = %key.peer, "TCP connection failed: {e}");
                return true;
            }
            Poll::Ready(Ok(())) => {}
        }

        match stream.try_write(&write_queue[0][*write_offset..]) {
            Ok(written) => {
                *write_offset += written;
                *queued_bytes -= written;

                if *write_offset == write_queue[0].len() {
                    write_queue.pop_front();
                    *write_offset = 0;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => {
                tracing::debug!(peer = %key.peer, "TCP connection failed: {e}");
                return true;
            }
        }
    }

    if closing {
        return false;
    }

    for _ in 0..MAX_READS_PER_TURN {
        match stream.poll_read_ready(cx) {
            Poll::Pending => break,
            Poll::Ready(Err(e)) => {
                tracing::debug!(peer = %key.peer, "TCP connection failed: {e}");
                return true;
            }
            Poll::Ready(Ok(())) => {}
        }

        match stream.try_read(read_buf) {
            Ok(0) => return true,
            Ok(num_read) => {
                client.handle_peer_data(key, read_buf[..num_read].to_vec());
                *progress = true;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                tracing::debug!(peer = %key.peer, "TCP connection failed: {e}");
                return true;
            }
        }
    }

    false
}

fn open_udp() -> io::Result<UdpSocket> {
    let socket = std::net::UdpSocket::bind(("0.0.0.0", 0))?;
    socket.set_nonblocking(true)?;

    UdpSocket::from_std(socket)
}
