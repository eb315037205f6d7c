//! Packet buffers, transport addresses and the control-packet codec.
//!
//! Every transport message starts with a single type byte:
//!
//! | byte   | meaning                                          |
//! |--------|--------------------------------------------------|
//! | `0x00` | CONNECT (`secret;groupId`) or the params reply   |
//! | `0x01` | DISCONNECT (no body)                             |
//! | other  | a raw IPv4 packet (DATA)                         |

use bytes::BytesMut;
use ipnet::Ipv4Net;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};

/// Largest payload accepted on receive or send (16-bit signed length).
pub const MAX_PACKET_SIZE: usize = 32767;

/// Type byte for CONNECT requests and their params replies.
pub const CONNECT_PACKET: u8 = 0x00;

/// Type byte for DISCONNECT.
pub const DISCONNECT_PACKET: u8 = 0x01;

/// IPv4 minimum header length.
pub const IPV4_MIN_HEADER: usize = 20;

/// Opaque address of a peer on some transport.
///
/// The relay hashes and compares these but never looks inside.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransportAddr {
    /// Peer of a datagram transport.
    Datagram(SocketAddr),
    /// Peer identifier on a message relay.
    Relay(String),
}

impl fmt::Display for TransportAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportAddr::Datagram(addr) => write!(f, "udp://{}", addr),
            TransportAddr::Relay(id) => write!(f, "relay://{}", id),
        }
    }
}

/// A payload plus the transport addresses it came from or goes to.
///
/// Receive loops reuse their buffer, so a `Packet` always owns a copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub data: BytesMut,
    pub source: Option<TransportAddr>,
    pub destination: Option<TransportAddr>,
}

impl Packet {
    /// Copy `data` into a new packet with no addresses.
    pub fn copy_from(data: &[u8]) -> Self {
        Self {
            data: BytesMut::from(data),
            source: None,
            destination: None,
        }
    }

    /// Copy `data` into a new packet received from `source`.
    pub fn received(data: &[u8], source: TransportAddr) -> Self {
        Self {
            source: Some(source),
            ..Self::copy_from(data)
        }
    }

    /// Set the destination, consuming the packet.
    pub fn to(mut self, destination: TransportAddr) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True if the payload exceeds [`MAX_PACKET_SIZE`].
    pub fn is_oversized(&self) -> bool {
        self.data.len() > MAX_PACKET_SIZE
    }

    /// Classify the payload by its leading byte.
    pub fn kind(&self) -> Option<PacketKind> {
        PacketKind::classify(&self.data)
    }
}

/// What a transport message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Connect,
    Disconnect,
    Data,
}

impl PacketKind {
    /// Classify a payload. Empty payloads have no kind.
    pub fn classify(payload: &[u8]) -> Option<Self> {
        match *payload.first()? {
            CONNECT_PACKET => Some(PacketKind::Connect),
            DISCONNECT_PACKET => Some(PacketKind::Disconnect),
            _ => Some(PacketKind::Data),
        }
    }
}

/// Body of a CONNECT packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub secret: String,
    pub group_id: String,
}

impl ConnectRequest {
    /// Parse a full CONNECT payload, type byte included.
    ///
    /// The secret is everything before the first `;`. The group id is the
    /// rest and must not be empty.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let (&kind, body) = payload.split_first()?;
        if kind != CONNECT_PACKET {
            return None;
        }
        let body = std::str::from_utf8(body).ok()?;
        let (secret, group_id) = body.split_once(';')?;
        if group_id.is_empty() {
            return None;
        }
        Some(Self {
            secret: secret.to_string(),
            group_id: group_id.to_string(),
        })
    }

    /// Encode as a CONNECT payload.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(2 + self.secret.len() + self.group_id.len());
        buf.extend_from_slice(&[CONNECT_PACKET]);
        buf.extend_from_slice(self.secret.as_bytes());
        buf.extend_from_slice(b";");
        buf.extend_from_slice(self.group_id.as_bytes());
        buf
    }
}

/// Network settings sent to every client, specialized only by its address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub mtu: u16,
    /// Prefix length advertised with the client address.
    pub address_prefix_len: u8,
    pub route: Ipv4Net,
    pub dns_server: Option<Ipv4Addr>,
    pub search_domain: Option<String>,
}

impl ConnectionParams {
    /// Render the space-separated parameter string for `address`.
    pub fn render(&self, address: Ipv4Addr) -> String {
        let mut out = format!(
            " m,{} a,{},{}",
            self.mtu, address, self.address_prefix_len
        );
        if let Some(dns) = self.dns_server {
            out.push_str(&format!(" d,{}", dns));
        }
        out.push_str(&format!(
            " r,{},{}",
            self.route.network(),
            self.route.prefix_len()
        ));
        if let Some(ref domain) = self.search_domain {
            out.push_str(&format!(" s,{}", domain));
        }
        out
    }

    /// Encode the CONNECT reply for `address`.
    ///
    /// Returns `None` if the reply would exceed [`MAX_PACKET_SIZE`].
    pub fn encode_reply(&self, address: Ipv4Addr) -> Option<BytesMut> {
        let rendered = self.render(address);
        if rendered.len() + 1 > MAX_PACKET_SIZE {
            return None;
        }
        let mut buf = BytesMut::with_capacity(rendered.len() + 1);
        buf.extend_from_slice(&[CONNECT_PACKET]);
        buf.extend_from_slice(rendered.as_bytes());
        Some(buf)
    }
}

/// Extract the IPv4 source address from a raw packet.
#[inline]
pub fn ipv4_source(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < IPV4_MIN_HEADER || packet[0] >> 4 != 4 {
        return None;
    }
    Some(Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]))
}

/// Extract the IPv4 destination address from a raw packet.
#[inline]
pub fn ipv4_destination(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < IPV4_MIN_HEADER || packet[0] >> 4 != 4 {
        return None;
    }
    Some(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]))
}
