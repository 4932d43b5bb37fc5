//! The transit channel: a TCP stream pumping chunk-framed logical messages.
//!
//! [`TransitStream`] owns the socket and keeps the per-socket state the
//! dispatcher needs: a read buffer drained through the incremental
//! [`Assembler`], and a FIFO of framed outbound messages with partial-send
//! retention. Both directions are strictly non-blocking: reads and writes
//! run `try_read`/`try_write` until the socket reports `WouldBlock`, then
//! suspend on readiness.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod deadline;

pub use deadline::Deadline;

use std::collections::VecDeque;
use std::io;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use passage_wire::framing::{self, Assembler};
use tokio::net::TcpStream;

/// Size of the scratch buffer for a single `read` syscall.
const READ_BUF_LEN: usize = 0xFFFF * 2;

/// Hard cap on buffered outbound bytes.
///
/// The transit channel is the session's lifeline; if the remote stalls long
/// enough for this much data to pile up, the session is torn down rather
/// than ballooning memory.
pub const MAX_QUEUED_BYTES: usize = 8 * 1024 * 1024;

pub struct TransitStream {
    stream: TcpStream,
    assembler: Assembler,
    read_buf: Box<[u8]>,
    read_closed: bool,

    send_queue: VecDeque<Vec<u8>>,
    /// How much of the queue head has already been written.
    send_offset: usize,
    queued_bytes: usize,
}

impl TransitStream {
    /// Wraps an established transit connection, enabling keepalive probing.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        set_keepalive(&stream)?;

        Ok(Self {
            stream,
            assembler: Assembler::default(),
            read_buf: vec![0u8; READ_BUF_LEN].into_boxed_slice(),
            read_closed: false,
            send_queue: VecDeque::new(),
            send_offset: 0,
            queued_bytes: 0,
        })
    }

    /// Frames a logical message and queues it for sending.
    ///
    /// Actual writes happen in [`TransitStream::poll_flush`].
    pub fn send(&mut self, message: &[u8]) -> Result<(), Error> {
        let framed = framing::pack(message);

        if self.queued_bytes + framed.len() > MAX_QUEUED_BYTES {
            return Err(Error::SendBufferFull);
        }

        self.queued_bytes += framed.len();
        self.send_queue.push_back(framed);

        Ok(())
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Writes queued messages until the queue is empty or the socket is full.
    pub fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        loop {
            let Some(head) = self.send_queue.front() else {
                return Poll::Ready(Ok(()));
            };
            let remaining = self.send_offset..head.len();

            ready!(self.stream.poll_write_ready(cx)).map_err(Error::Io)?;

            match self.stream.try_write(&self.send_queue[0][remaining]) {
                Ok(written) => {
                    self.send_offset += written;
                    self.queued_bytes -= written;

                    if self.send_offset == self.send_queue[0].len() {
                        self.send_queue.pop_front();
                        self.send_offset = 0;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Poll::Ready(Err(Error::Io(e))),
            }
        }
    }

    /// Reads from the socket until a complete logical message is available.
    ///
    /// Returns [`Error::Closed`] once the remote has shut down its write half
    /// and all buffered messages have been drained.
    pub fn poll_next_message(&mut self, cx: &mut Context<'_>) -> Poll<Result<Vec<u8>, Error>> {
        loop {
            if let Some(message) = self.assembler.next_message().map_err(Error::Protocol)? {
                return Poll::Ready(Ok(message));
            }

            if self.read_closed {
                return Poll::Ready(Err(Error::Closed));
            }

            ready!(self.stream.poll_read_ready(cx)).map_err(Error::Io)?;

            match self.stream.try_read(&mut self.read_buf) {
                Ok(0) => {
                    self.read_closed = true;
                }
                Ok(num_read) => {
                    self.assembler.extend(&self.read_buf[..num_read]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Poll::Ready(Err(Error::Io(e))),
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transit channel closed by remote")]
    Closed,
    #[error("transit send buffer overflowed")]
    SendBufferFull,
    #[error(transparent)]
    Protocol(framing::MessageTooLarge),
    #[error(transparent)]
    Io(io::Error),
}

/// Enables keepalive probing so a vanished remote is detected within minutes.
///
/// 35s idle + 10 probes at 30s intervals puts detection at roughly 5 minutes.
pub fn set_keepalive(stream: &TcpStream) -> io::Result<()> {
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(35))
        .with_interval(Duration::from_secs(30));

    #[cfg(not(windows))]
    let keepalive = keepalive.with_retries(10);

    socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::poll_fn;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TransitStream, TransitStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        (
            TransitStream::new(client).unwrap(),
            TransitStream::new(server).unwrap(),
        )
    }

    async fn flush(stream: &mut TransitStream) {
        poll_fn(|cx| stream.poll_flush(cx)).await.unwrap();
    }

    async fn next_message(stream: &mut TransitStream) -> Result<Vec<u8>, Error> {
        poll_fn(|cx| stream.poll_next_message(cx)).await
    }

    #[tokio::test]
    async fn delivers_messages_in_order() {
        let (mut client, mut server) = connected_pair().await;

        client.send(b"one").unwrap();
        client.send(b"").unwrap();
        client.send(b"three").unwrap();
        flush(&mut client).await;

        assert_eq!(next_message(&mut server).await.unwrap(), b"one");
        assert_eq!(next_message(&mut server).await.unwrap(), b"");
        assert_eq!(next_message(&mut server).await.unwrap(), b"three");
    }

    #[tokio::test]
    async fn delivers_chunked_messages() {
        let (mut client, mut server) = connected_pair().await;

        let big = vec![0xAB; 0x1FFFE];
        client.send(&big).unwrap();

        let send = async {
            flush(&mut client).await;
        };
        let recv = async { next_message(&mut server).await.unwrap() };

        let ((), received) = tokio::join!(send, recv);

        assert_eq!(received, big);
    }

    #[tokio::test]
    async fn remote_shutdown_surfaces_as_closed() {
        let (mut client, mut server) = connected_pair().await;

        client.send(b"last words").unwrap();
        flush(&mut client).await;
        drop(client);

        assert_eq!(next_message(&mut server).await.unwrap(), b"last words");
        assert!(matches!(next_message(&mut server).await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn send_buffer_has_a_hard_cap() {
        let (mut client, _server) = connected_pair().await;

        let chunk = vec![0u8; 1024 * 1024];
        let mut result = Ok(());
        for _ in 0..16 {
            result = client.send(&chunk);
            if result.is_err() {
                break;
            }
        }

        assert!(matches!(result, Err(Error::SendBufferFull)));
    }
}
