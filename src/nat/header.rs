//! IPv4 header parsing and in-place address/port rewriting.

use super::checksum::{update_checksum_16, update_checksum_32};
use crate::packet::IPV4_MIN_HEADER;
use std::net::Ipv4Addr;

pub(crate) const PROTO_ICMP: u8 = 1;
pub(crate) const PROTO_TCP: u8 = 6;
pub(crate) const PROTO_UDP: u8 = 17;

const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_ECHO_REQUEST: u8 = 8;

const IP_CHECKSUM: usize = 10;
const IP_SOURCE: usize = 12;
const IP_DESTINATION: usize = 16;

/// Transport protocols the NAT can demultiplex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Protocol {
    Tcp,
    Udp,
    /// ICMP echo; the identifier stands in for both ports.
    IcmpEcho,
}

impl Protocol {
    /// Offset of the transport checksum within the transport header.
    fn checksum_offset(self) -> usize {
        match self {
            Protocol::Tcp => 16,
            Protocol::Udp => 6,
            Protocol::IcmpEcho => 2,
        }
    }

    /// Bytes of transport header needed to read ports and checksum.
    fn min_header(self) -> usize {
        match self {
            Protocol::Tcp => 20,
            Protocol::Udp | Protocol::IcmpEcho => 8,
        }
    }
}

/// Which end of the flow a rewrite touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Source,
    Destination,
}

/// The addressing of one validated IPv4 packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Flow {
    pub header_len: usize,
    pub protocol: Protocol,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub source_port: u16,
    pub destination_port: u16,
}

#[inline]
fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

#[inline]
fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

#[inline]
fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

impl Flow {
    /// Validate `packet` and extract its flow.
    ///
    /// Fails for non-IPv4, bad IHL, truncated headers, a total length larger
    /// than the buffer, non-initial fragments and untranslatable protocols.
    pub fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < IPV4_MIN_HEADER || packet[0] >> 4 != 4 {
            return None;
        }
        let header_len = ((packet[0] & 0x0F) as usize) * 4;
        if header_len < IPV4_MIN_HEADER {
            return None;
        }
        let total_len = read_u16(packet, 2) as usize;
        if total_len < header_len || total_len > packet.len() {
            return None;
        }
        let fragment_offset = read_u16(packet, 6) & 0x1FFF;
        if fragment_offset != 0 {
            return None;
        }

        let protocol = match packet[9] {
            PROTO_TCP => Protocol::Tcp,
            PROTO_UDP => Protocol::Udp,
            PROTO_ICMP => Protocol::IcmpEcho,
            _ => return None,
        };
        if total_len < header_len + protocol.min_header() {
            return None;
        }

        let (source_port, destination_port) = match protocol {
            Protocol::Tcp | Protocol::Udp => {
                (read_u16(packet, header_len), read_u16(packet, header_len + 2))
            }
            Protocol::IcmpEcho => {
                let icmp_type = packet[header_len];
                if icmp_type != ICMP_ECHO_REQUEST && icmp_type != ICMP_ECHO_REPLY {
                    return None;
                }
                let id = read_u16(packet, header_len + 4);
                (id, id)
            }
        };

        Some(Self {
            header_len,
            protocol,
            source: Ipv4Addr::from(read_u32(packet, IP_SOURCE)),
            destination: Ipv4Addr::from(read_u32(packet, IP_DESTINATION)),
            source_port,
            destination_port,
        })
    }

    /// Rewrite one end's address and port, patching every affected checksum.
    pub fn rewrite(&self, packet: &mut [u8], side: Side, ip: Ipv4Addr, port: u16) {
        let (ip_offset, old_ip, old_port) = match side {
            Side::Source => (IP_SOURCE, self.source, self.source_port),
            Side::Destination => (IP_DESTINATION, self.destination, self.destination_port),
        };
        let old_ip = u32::from(old_ip);
        let new_ip = u32::from(ip);

        let ip_checksum = update_checksum_32(read_u16(packet, IP_CHECKSUM), old_ip, new_ip);
        write_u16(packet, IP_CHECKSUM, ip_checksum);
        packet[ip_offset..ip_offset + 4].copy_from_slice(&new_ip.to_be_bytes());

        let l4 = self.header_len;
        let checksum_offset = l4 + self.protocol.checksum_offset();
        let old_checksum = read_u16(packet, checksum_offset);

        match self.protocol {
            Protocol::Tcp | Protocol::Udp => {
                let port_offset = match side {
                    Side::Source => l4,
                    Side::Destination => l4 + 2,
                };
                write_u16(packet, port_offset, port);

                // UDP checksum 0 means "not computed"
                if self.protocol == Protocol::Udp && old_checksum == 0 {
                    return;
                }
                let mut checksum = update_checksum_32(old_checksum, old_ip, new_ip);
                checksum = update_checksum_16(checksum, old_port, port);
                if self.protocol == Protocol::Udp && checksum == 0 {
                    checksum = 0xFFFF;
                }
                write_u16(packet, checksum_offset, checksum);
            }
            Protocol::IcmpEcho => {
                write_u16(packet, l4 + 4, port);
                write_u16(packet, checksum_offset, update_checksum_16(old_checksum, old_port, port));
            }
        }
    }
}
