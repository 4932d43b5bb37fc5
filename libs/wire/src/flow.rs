use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

/// The transport of a forwarded public port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PortType {
    Udp,
    Tcp,
}

impl PortType {
    pub fn to_wire(self) -> u16 {
        match self {
            PortType::Udp => 1,
            PortType::Tcp => 2,
        }
    }

    pub fn from_wire(value: u16) -> Option<Self> {
        match value {
            1 => Some(PortType::Udp),
            2 => Some(PortType::Tcp),
            _ => None,
        }
    }
}

impl fmt::Display for PortType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortType::Udp => write!(f, "udp"),
            PortType::Tcp => write!(f, "tcp"),
        }
    }
}

impl FromStr for PortType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(PortType::Udp),
            "tcp" => Ok(PortType::Tcp),
            other => Err(Error::UnknownPortType(other.to_owned())),
        }
    }
}

/// New-type for the public-side address of a remote peer.
///
/// Wire addresses are IPv4 only (4-byte IP + 2-byte port), so this wraps a
/// [`SocketAddrV4`] rather than a [`std::net::SocketAddr`].
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct PeerAddr(SocketAddrV4);

impl PeerAddr {
    pub const WIRE_LEN: usize = 6;

    pub fn new(addr: SocketAddrV4) -> Self {
        Self(addr)
    }

    pub fn into_socket(self) -> SocketAddrV4 {
        self.0
    }

    pub fn to_wire(self) -> [u8; Self::WIRE_LEN] {
        let mut wire = [0u8; Self::WIRE_LEN];
        wire[..4].copy_from_slice(&self.0.ip().octets());
        wire[4..].copy_from_slice(&self.0.port().to_be_bytes());

        wire
    }

    pub fn from_wire(wire: &[u8]) -> Result<Self, Error> {
        let &[a, b, c, d, hi, lo] = wire else {
            return Err(Error::BadAddress { len: wire.len() });
        };

        Ok(Self(SocketAddrV4::new(
            Ipv4Addr::new(a, b, c, d),
            u16::from_be_bytes([hi, lo]),
        )))
    }
}

impl From<SocketAddrV4> for PeerAddr {
    fn from(addr: SocketAddrV4) -> Self {
        Self(addr)
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One multiplexed unit on the transit channel while a session is running.
///
/// An empty payload is the in-band flow-closed signal for the
/// `(port_type, port, peer)` tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowFrame {
    pub port_type: PortType,
    pub port: u16,
    pub peer: PeerAddr,
    pub payload: Vec<u8>,
}

impl FlowFrame {
    pub const HEADER_LEN: usize = 4 + PeerAddr::WIRE_LEN;

    pub fn closed(port_type: PortType, port: u16, peer: PeerAddr) -> Self {
        Self {
            port_type,
            port,
            peer,
            payload: Vec::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut wire = Vec::with_capacity(Self::HEADER_LEN + self.payload.len());
        wire.extend_from_slice(&self.port_type.to_wire().to_be_bytes());
        wire.extend_from_slice(&self.port.to_be_bytes());
        wire.extend_from_slice(&self.peer.to_wire());
        wire.extend_from_slice(&self.payload);

        wire
    }

    pub fn decode(message: &[u8]) -> Result<Self, Error> {
        if message.len() < Self::HEADER_LEN {
            return Err(Error::ShortFrame { len: message.len() });
        }

        let port_type = u16::from_be_bytes([message[0], message[1]]);
        let port_type =
            PortType::from_wire(port_type).ok_or(Error::UnknownWirePortType(port_type))?;
        let port = u16::from_be_bytes([message[2], message[3]]);
        let peer = PeerAddr::from_wire(&message[4..Self::HEADER_LEN])?;

        Ok(Self {
            port_type,
            port,
            peer,
            payload: message[Self::HEADER_LEN..].to_vec(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("flow frame of {len} bytes is shorter than its header")]
    ShortFrame { len: usize },
    #[error("unknown port type `{0}`")]
    UnknownPortType(String),
    #[error("unknown wire port type {0}")]
    UnknownWirePortType(u16),
    #[error("expected a 6-byte address, got {len} bytes")]
    BadAddress { len: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerAddr {
        PeerAddr::new(SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 9), 54321))
    }

    #[test]
    fn address_roundtrip() {
        let wire = peer().to_wire();

        assert_eq!(wire, [203, 0, 113, 9, 0xD4, 0x31]);
        assert_eq!(PeerAddr::from_wire(&wire).unwrap(), peer());
    }

    #[test]
    fn frame_roundtrip() {
        let frame = FlowFrame {
            port_type: PortType::Tcp,
            port: 16261,
            peer: peer(),
            payload: b"hello".to_vec(),
        };

        let decoded = FlowFrame::decode(&frame.encode()).unwrap();

        assert_eq!(decoded, frame);
    }

    #[test]
    fn empty_payload_is_flow_closed() {
        let frame = FlowFrame::closed(PortType::Udp, 40000, peer());
        let decoded = FlowFrame::decode(&frame.encode()).unwrap();

        assert!(decoded.is_closed());
        assert_eq!(decoded.port_type, PortType::Udp);
    }

    #[test]
    fn rejects_truncated_header() {
        assert!(matches!(
            FlowFrame::decode(&[0, 1, 0x9C]),
            Err(Error::ShortFrame { len: 3 })
        ));
    }

    #[test]
    fn rejects_unknown_port_type() {
        let mut wire = FlowFrame::closed(PortType::Udp, 1, peer()).encode();
        wire[1] = 7;

        assert!(matches!(
            FlowFrame::decode(&wire),
            Err(Error::UnknownWirePortType(7))
        ));
    }
}
