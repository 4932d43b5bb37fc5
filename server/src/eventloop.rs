//! Executes the [`Server`]'s commands against real sockets.
//!
//! One instance drives one transit session: it pumps the transit stream,
//! accepts public TCP connections, reads public UDP datagrams and flushes the
//! per-socket write queues, feeding every observation back into the sans-IO
//! core. All of it runs on a single task; sockets are only ever touched with
//! `try_*` calls after a readiness poll, so nothing here blocks.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::task::{Context, Poll};
use std::time::Instant;

use passage_wire::{PeerAddr, PortType};
use rand::{CryptoRng, RngCore};
use tokio::io::ReadBuf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use transit_stream::{Deadline, TransitStream};

use crate::server::{Command, Server, SessionError};

/// Soft cap on datagrams queued towards one public UDP port.
const UDP_QUEUE_CAP: usize = 256 * 1024;

/// Soft cap on bytes queued towards one accepted TCP connection.
const TCP_QUEUE_CAP: usize = 1024 * 1024;

/// How many reads we grant one socket before moving on to its neighbours.
const MAX_READS_PER_TURN: usize = 16;

/// How a transit session ended abnormally.
///
/// A clean end (the client disconnecting) is not an error; `main` only sees
/// one of these when the handshake, the protocol or the transit socket broke.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Session(SessionError),
    #[error("transit connection failed")]
    Transit(#[source] transit_stream::Error),
}

pub struct Eventloop<'a, R> {
    server: &'a mut Server<R>,
    transit: TransitStream,

    udp_listeners: HashMap<u16, UdpListener>,
    tcp_listeners: HashMap<u16, TcpListener>,
    tcp_conns: HashMap<(u16, PeerAddr), TcpConn>,

    deadline: Deadline,

    read_buf: Box<[u8]>,
    failure: Option<Error>,
}

struct UdpListener {
    socket: UdpSocket,
    /// Datagrams not yet accepted by the kernel, oldest first.
    pending: VecDeque<(Vec<u8>, SocketAddrV4)>,
    queued_bytes: usize,
}

struct TcpConn {
    stream: TcpStream,
    write_queue: VecDeque<Vec<u8>>,
    write_offset: usize,
    queued_bytes: usize,
    /// Flush the queue, then drop the connection.
    closing: bool,
}

impl<'a, R> Eventloop<'a, R>
where
    R: RngCore + CryptoRng,
{
    pub fn new(server: &'a mut Server<R>, transit: TransitStream) -> Self {
        server.handle_transit_connected(Instant::now());

        Self {
            server,
            transit,
            udp_listeners: HashMap::new(),
            tcp_listeners: HashMap::new(),
            tcp_conns: HashMap::new(),
            deadline: Deadline::default(),
            read_buf: vec![0u8; 0xFFFF * 2].into_boxed_slice(),
            failure: None,
        }
    }

    /// Runs the session to completion and releases its resources.
    pub async fn run(mut self) -> Result<(), Error> {
        let result = std::future::poll_fn(|cx| self.poll(cx)).await;
        self.server.handle_transit_closed();

        result
    }

    fn poll(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        loop {
            self.drain_commands();

            if let Some(error) = self.failure.take() {
                // Close semantics: queued writes are discarded, sockets are
                // dropped with the loop.
                return Poll::Ready(Err(error));
            }

            // Flush every turn so sustained inbound traffic cannot starve
            // the transit write queue.
            match self.transit.poll_flush(cx) {
                Poll::Ready(Ok(())) | Poll::Pending => {}
                Poll::Ready(Err(e)) => return Poll::Ready(Err(Error::Transit(e))),
            }

            self.deadline.set(self.server.poll_timeout());
            if self.deadline.poll(cx).is_ready() {
                self.server.handle_timeout(Instant::now());
                continue;
            }

            match self.transit.poll_next_message(cx) {
                Poll::Ready(Ok(message)) => {
                    self.server.handle_transit_message(&message, Instant::now());
                    continue;
                }
                Poll::Ready(Err(transit_stream::Error::Closed)) => {
                    tracing::info!("Client closed the transit connection");
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(Error::Transit(e))),
                Poll::Pending => {}
            }

            if self.accept_tcp(cx) {
                continue;
            }
            if self.pump_udp(cx) {
                continue;
            }
            if self.pump_tcp(cx) {
                continue;
            }

            return Poll::Pending;
        }
    }

    fn drain_commands(&mut self) {
        while let Some(command) = self.server.next_command() {
            match command {
                Command::SendMessage(message) => {
                    if let Err(e) = self.transit.send(&message) {
                        tracing::error!("Transit channel overloaded: {e}");
                        self.failure.get_or_insert(Error::Transit(e));
                    }
                }
                Command::BindUdp { port } => match bind_udp(port) {
                    Ok(socket) => {
                        tracing::info!(%port, "Listening on public UDP port");
                        self.udp_listeners.insert(
                            port,
                            UdpListener {
                                socket,
                                pending: VecDeque::new(),
                                queued_bytes: 0,
                            },
                        );
                    }
                    Err(e) => {
                        tracing::error!(%port, "Failed to bind public UDP port: {e}");
                        self.server.handle_listener_failed(PortType::Udp, port);
                    }
                },
                Command::BindTcp { port } => match bind_tcp(port) {
                    Ok(listener) => {
                        tracing::info!(%port, "Listening on public TCP port");
                        self.tcp_listeners.insert(port, listener);
                    }
                    Err(e) => {
                        tracing::error!(%port, "Failed to bind public TCP port: {e}");
                        self.server.handle_listener_failed(PortType::Tcp, port);
                    }
                },
                Command::SendDatagram {
                    port,
                    dest,
                    payload,
                } => {
                    let Some(listener) = self.udp_listeners.get_mut(&port) else {
                        continue;
                    };

                    // Oldest datagrams make room for new ones.
                    while listener.queued_bytes + payload.len() > UDP_QUEUE_CAP {
                        let Some((dropped, _)) = listener.pending.pop_front() else {
                            break;
                        };
                        listener.queued_bytes -= dropped.len();
                        tracing::debug!(%port, "UDP send queue full, dropping oldest datagram");
                    }

                    listener.queued_bytes += payload.len();
                    listener.pending.push_back((payload, dest.into_socket()));
                }
                Command::SendTcp {
                    port,
                    peer,
                    payload,
                } => {
                    let Some(conn) = self.tcp_conns.get_mut(&(port, peer)) else {
                        continue;
                    };
                    if conn.closing {
                        continue;
                    }

                    if conn.queued_bytes + payload.len() > TCP_QUEUE_CAP {
                        tracing::warn!(%port, %peer, "TCP send queue full, closing flow");
                        self.tcp_conns.remove(&(port, peer));
                        self.server.handle_tcp_closed(port, peer);
                        continue;
                    }

                    conn.queued_bytes += payload.len();
                    conn.write_queue.push_back(payload);
                }
                Command::CloseTcpConn { port, peer } => {
                    if let Some(conn) = self.tcp_conns.get_mut(&(port, peer)) {
                        conn.closing = true;
                    }
                }
                Command::CloseTransit(error) => {
                    self.failure.get_or_insert(Error::Session(error));
                }
            }
        }
    }

    fn accept_tcp(&mut self, cx: &mut Context<'_>) -> bool {
        let mut progress = false;

        for (&port, listener) in &self.tcp_listeners {
            loop {
                match listener.poll_accept(cx) {
                    Poll::Ready(Ok((stream, addr))) => {
                        let SocketAddr::V4(addr) = addr else {
                            continue;
                        };
                        if let Err(e) = transit_stream::set_keepalive(&stream) {
                            tracing::debug!(%addr, "Failed to enable keepalive: {e}");
                        }

                        let peer = PeerAddr::new(addr);
                        self.tcp_conns.insert(
                            (port, peer),
                            TcpConn {
                                stream,
                                write_queue: VecDeque::new(),
                                write_offset: 0,
                                queued_bytes: 0,
                                closing: false,
                            },
                        );
                        self.server.handle_tcp_accepted(port, peer);
                        progress = true;
                    }
                    Poll::Ready(Err(e)) => {
                        tracing::warn!(%port, "Failed to accept public TCP connection: {e}");
                        break;
                    }
                    Poll::Pending => break,
                }
            }
        }

        progress
    }

    fn pump_udp(&mut self, cx: &mut Context<'_>) -> bool {
        let mut progress = false;
        let mut failed = Vec::new();

        for (&port, listener) in self.udp_listeners.iter_mut() {
            // Flush queued datagrams; a short send keeps the unsent suffix.
            while !listener.pending.is_empty() {
                match listener.socket.poll_send_ready(cx) {
                    Poll::Pending => break,
                    Poll::Ready(Err(e)) => {
                        tracing::warn!(%port, "UDP listener failed: {e}");
                        failed.push(port);
                        break;
                    }
                    Poll::Ready(Ok(())) => {}
                }

                let (payload, dest) = &listener.pending[0];
                match listener.socket.try_send_to(payload, SocketAddr::V4(*dest)) {
                    Ok(sent) => {
                        listener.queued_bytes -= sent;
                        if sent == listener.pending[0].0.len() {
                            listener.pending.pop_front();
                        } else if let Some((payload, _)) = listener.pending.front_mut() {
                            payload.drain(..sent);
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) if is_unreachable(&e) => {
                        let len = listener.pending[0].0.len();
                        listener.queued_bytes -= len;
                        listener.pending.pop_front();

                        self.server.handle_udp_unreachable(port);
                        progress = true;
                    }
                    Err(e) => {
                        tracing::warn!(%port, "UDP listener failed: {e}");
                        failed.push(port);
                        break;
                    }
                }
            }

            for _ in 0..MAX_READS_PER_TURN {
                let mut buf = ReadBuf::new(&mut self.read_buf);

                match listener.socket.poll_recv_from(cx, &mut buf) {
                    Poll::Ready(Ok(from)) => {
                        let SocketAddr::V4(from) = from else {
                            continue;
                        };

                        self.server.handle_datagram(
                            port,
                            PeerAddr::new(from),
                            buf.filled().to_vec(),
                        );
                        progress = true;
                    }
                    Poll::Ready(Err(e)) if is_unreachable(&e) => {
                        self.server.handle_udp_unreachable(port);
                        progress = true;
                    }
                    Poll::Ready(Err(e)) => {
                        tracing::warn!(%port, "UDP listener failed: {e}");
                        failed.push(port);
                        break;
                    }
                    Poll::Pending => break,
                }
            }
        }

        for port in failed {
            self.udp_listeners.remove(&port);
            self.server.handle_listener_failed(PortType::Udp, port);
            progress = true;
        }

        progress
    }

    fn pump_tcp(&mut self, cx: &mut Context<'_>) -> bool {
        let mut progress = false;
        let mut dead = Vec::new();
        let mut flushed = Vec::new();

        for (&(port, peer), conn) in self.tcp_conns.iter_mut() {
            loop {
                if conn.write_queue.is_empty() {
                    if conn.closing {
                        flushed.push((port, peer));
                    }
                    break;
                }

                match conn.stream.poll_write_ready(cx) {
                    Poll::Pending => break,
                    Poll::Ready(Err(e)) => {
                        tracing::debug!(%port, %peer, "TCP connection failed: {e}");
                        dead.push((port, peer));
                        break;
                    }
                    Poll::Ready(Ok(())) => {}
                }

                match conn.stream.try_write(&conn.write_queue[0][conn.write_offset..]) {
                    Ok(written) => {
                        conn.write_offset += written;
                        conn.queued_bytes -= written;

                        if conn.write_offset == conn.write_queue[0].len() {
                            conn.write_queue.pop_front();
                            conn.write_offset = 0;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => {
                        tracing::debug!(%port, %peer, "TCP connection failed: {e}");
                        dead.push((port, peer));
                        break;
                    }
                }
            }

            if conn.closing || dead.last() == Some(&(port, peer)) {
                continue;
            }

            for _ in 0..MAX_READS_PER_TURN {
                match conn.stream.poll_read_ready(cx) {
                    Poll::Pending => break,
                    Poll::Ready(Err(e)) => {
                        tracing::debug!(%port, %peer, "TCP connection failed: {e}");
                        dead.push((port, peer));
                        break;
                    }
                    Poll::Ready(Ok(())) => {}
                }

                match conn.stream.try_read(&mut self.read_buf) {
                    Ok(0) => {
                        dead.push((port, peer));
                        break;
                    }
                    Ok(num_read) => {
                        self.server
                            .handle_tcp_data(port, peer, self.read_buf[..num_read].to_vec());
                        progress = true;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        tracing::debug!(%port, %peer, "TCP connection failed: {e}");
                        dead.push((port, peer));
                        break;
                    }
                }
            }
        }

        for key in flushed {
            self.tcp_conns.remove(&key);
        }
        for (port, peer) in dead {
            self.tcp_conns.remove(&(port, peer));
            self.server.handle_tcp_closed(port, peer);
            progress = true;
        }

        progress
    }
}

fn bind_udp(port: u16) -> io::Result<UdpSocket> {
    let socket = std::net::UdpSocket::bind(("0.0.0.0", port))?;
    socket.set_nonblocking(true)?;

    UdpSocket::from_std(socket)
}

fn bind_tcp(port: u16) -> io::Result<TcpListener> {
    let listener = std::net::TcpListener::bind(("0.0.0.0", port))?;
    listener.set_nonblocking(true)?;

    TcpListener::from_std(listener)
}

/// ICMP-unreachable conditions surface as resets (or refusals) on UDP sends
/// and receives.
fn is_unreachable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
    )
}
