//! Chunked length-prefix framing for the transit stream.
//!
//! TCP's stream-oriented nature requires us to know how long a message is
//! before we can hand it to the protocol layer, so every chunk is prefixed
//! with a big-endian `u16` length. A length of [`MAX_CHUNK_LEN`] marks a
//! continuation chunk: the receiver concatenates payloads until the first
//! chunk with a shorter length. A logical message whose length is an exact
//! multiple of [`MAX_CHUNK_LEN`] is therefore terminated by an empty chunk,
//! and an empty message is a single zero-length chunk.

use bytes::{Buf as _, BytesMut};

/// Chunk payloads of exactly this length signal "more to come".
pub const MAX_CHUNK_LEN: usize = 0xFFFF;

/// Sanity cap on a reassembled logical message.
///
/// The largest message a conforming sender produces is a flow frame around a
/// single UDP datagram (< 64 KiB). Anything above this cap is a protocol
/// violation and terminates the session.
pub const MAX_MESSAGE_LEN: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("logical message exceeds {MAX_MESSAGE_LEN} bytes")]
pub struct MessageTooLarge;

/// Encodes one logical message into its on-wire chunk sequence.
pub fn pack(message: &[u8]) -> Vec<u8> {
    let num_chunks = message.len() / MAX_CHUNK_LEN + 1;
    let mut wire = Vec::with_capacity(message.len() + num_chunks * 2);

    let mut offset = 0;
    loop {
        let end = usize::min(offset + MAX_CHUNK_LEN, message.len());
        let chunk = &message[offset..end];

        wire.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
        wire.extend_from_slice(chunk);

        if chunk.len() < MAX_CHUNK_LEN {
            break;
        }

        offset = end;
    }

    wire
}

/// Incrementally reassembles logical messages from a chunked byte stream.
///
/// Feed raw bytes with [`Assembler::extend`] in whatever pieces the socket
/// delivers them, then drain completed messages with
/// [`Assembler::next_message`]. Bytes of an incomplete chunk are buffered
/// until the rest arrives.
#[derive(Debug, Default)]
pub struct Assembler {
    buffer: BytesMut,
    message: Vec<u8>,
}

impl Assembler {
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns the next complete logical message, if any.
    pub fn next_message(&mut self) -> Result<Option<Vec<u8>>, MessageTooLarge> {
        loop {
            let Some(header) = self.buffer.get(..2) else {
                return Ok(None);
            };
            let chunk_len = u16::from_be_bytes([header[0], header[1]]) as usize;

            if self.buffer.len() < 2 + chunk_len {
                return Ok(None);
            }

            self.buffer.advance(2);
            self.message
                .extend_from_slice(&self.buffer.split_to(chunk_len));

            if self.message.len() > MAX_MESSAGE_LEN {
                return Err(MessageTooLarge);
            }

            if chunk_len < MAX_CHUNK_LEN {
                return Ok(Some(std::mem::take(&mut self.message)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(len: usize) {
        let message = pattern(len);
        let wire = pack(&message);

        let mut assembler = Assembler::default();
        assembler.extend(&wire);

        assert_eq!(assembler.next_message().unwrap(), Some(message));
        assert_eq!(assembler.next_message().unwrap(), None);
        assert!(assembler.buffer.is_empty());
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn roundtrips_boundary_lengths() {
        for len in [0, 1, 0xFFFE, 0xFFFF, 0x10000, 0x1FFFE] {
            roundtrip(len);
        }
    }

    #[test]
    fn short_message_is_a_single_chunk() {
        let wire = pack(b"ping");

        assert_eq!(wire, [&[0, 4][..], b"ping"].concat());
    }

    #[test]
    fn empty_message_is_a_single_zero_length_chunk() {
        assert_eq!(pack(b""), vec![0, 0]);
    }

    #[test]
    fn exact_multiple_ends_in_zero_length_chunk() {
        let wire = pack(&pattern(2 * MAX_CHUNK_LEN));

        assert_eq!(&wire[wire.len() - 2..], &[0, 0]);
        assert_eq!(wire.len(), 2 * MAX_CHUNK_LEN + 3 * 2);
    }

    #[test]
    fn reassembles_byte_by_byte() {
        let message = pattern(0x1FFFE);
        let wire = pack(&message);

        let mut assembler = Assembler::default();
        let mut received = Vec::new();

        for byte in wire {
            assembler.extend(&[byte]);
            while let Some(msg) = assembler.next_message().unwrap() {
                received.push(msg);
            }
        }

        assert_eq!(received, vec![message]);
    }

    #[test]
    fn preserves_message_boundaries_across_a_single_read() {
        let mut wire = pack(b"first");
        wire.extend_from_slice(&pack(b""));
        wire.extend_from_slice(&pack(b"third"));

        let mut assembler = Assembler::default();
        assembler.extend(&wire);

        assert_eq!(assembler.next_message().unwrap(), Some(b"first".to_vec()));
        assert_eq!(assembler.next_message().unwrap(), Some(Vec::new()));
        assert_eq!(assembler.next_message().unwrap(), Some(b"third".to_vec()));
        assert_eq!(assembler.next_message().unwrap(), None);
    }

    #[test]
    fn rejects_oversize_messages() {
        let mut assembler = Assembler::default();

        // 17 max-length continuation chunks exceed the 1 MiB cap.
        for _ in 0..17 {
            assembler.extend(&(MAX_CHUNK_LEN as u16).to_be_bytes());
            assembler.extend(&vec![0; MAX_CHUNK_LEN]);
        }

        assert_eq!(assembler.next_message(), Err(MessageTooLarge));
    }
}
