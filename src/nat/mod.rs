//! Userspace NAT between the virtual network and the tunnel's external
//! address.
//!
//! Outbound packets get their source `ip:port` replaced by the external
//! address and a port from a fixed range; inbound packets addressed to that
//! port get the original internal `ip:port` back. Checksums are patched
//! incrementally.
//!
//! ```text
//! 10.0.0.7:51000 ──to_internet──► 10.255.255.255:1024 ──► internet
//! 10.0.0.7:51000 ◄─from_internet── 10.255.255.255:1024 ◄── internet
//! ```
//!
//! Mappings expire after an idle window. The reverse map (external port to
//! internal endpoint) owns the expiry; its eviction hook clears the forward
//! entry and the per-IP port index, which frees the port for reuse.

pub mod checksum;
pub(crate) mod header;

use crate::config::RelayConfig;
use crate::expiring::ExpiringMap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use header::{Flow, Side};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Round-robin cursor over the external port range.
struct PortAllocator {
    start: u16,
    size: u32,
    next: AtomicU32,
}

impl PortAllocator {
    /// Bounds are inclusive and may come in either order.
    fn new(first: u16, second: u16) -> Self {
        let (start, end) = (first.min(second), first.max(second));
        Self {
            start,
            size: u32::from(end - start) + 1,
            next: AtomicU32::new(0),
        }
    }

    /// Try each port once, starting after the last one handed out, until
    /// `claim` accepts one. Returns `None` when the range is exhausted.
    fn allocate<F>(&self, claim: F) -> Option<u16>
    where
        F: Fn(u16) -> bool,
    {
        for _ in 0..self.size {
            let offset = self.next.fetch_add(1, Ordering::Relaxed) % self.size;
            let port = self.start + offset as u16;
            if claim(port) {
                return Some(port);
            }
        }
        None
    }
}

/// Translates packets between internal and external addressing.
pub struct NatEngine {
    external_ip: Ipv4Addr,
    /// Internal endpoint to external port.
    forward: Arc<DashMap<SocketAddrV4, u16>>,
    /// External port to internal endpoint; carries the idle clock.
    reverse: ExpiringMap<u16, SocketAddrV4>,
    /// Internal IP to the external ports it holds, for lease release.
    by_ip: Arc<DashMap<Ipv4Addr, Vec<u16>>>,
    ports: PortAllocator,
}

fn unindex(by_ip: &DashMap<Ipv4Addr, Vec<u16>>, ip: Ipv4Addr, port: u16) {
    if let Entry::Occupied(mut entry) = by_ip.entry(ip) {
        if let Some(i) = entry.get().iter().position(|&held| held == port) {
            entry.get_mut().swap_remove(i);
        }
        if entry.get().is_empty() {
            entry.remove();
        }
    }
}

impl NatEngine {
    /// Create an engine for `external_ip` using ports `start..=end`.
    pub fn new(external_ip: Ipv4Addr, port_range: (u16, u16), idle_timeout: Duration) -> Self {
        let forward: Arc<DashMap<SocketAddrV4, u16>> = Arc::new(DashMap::new());
        let by_ip: Arc<DashMap<Ipv4Addr, Vec<u16>>> = Arc::new(DashMap::new());
        let hook_forward = forward.clone();
        let hook_by_ip = by_ip.clone();
        let reverse = ExpiringMap::with_eviction_hook(idle_timeout, move |port, internal: SocketAddrV4| {
            hook_forward.remove_if(&internal, |_, mapped| *mapped == port);
            unindex(&hook_by_ip, *internal.ip(), port);
            log::trace!("NAT mapping {} <-> :{} removed", internal, port);
        });

        Self {
            external_ip,
            forward,
            reverse,
            by_ip,
            ports: PortAllocator::new(port_range.0, port_range.1),
        }
    }

    /// Create an engine from validated configuration.
    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(
            config.tunnel_destination,
            config.nat_port_range,
            config.nat_idle_timeout(),
        )
    }

    pub fn external_ip(&self) -> Ipv4Addr {
        self.external_ip
    }

    /// Rewrite an outbound packet's source to the external address.
    ///
    /// Returns the external port used, or `None` if the packet must be
    /// dropped (malformed, unsupported protocol, port pool exhausted).
    pub fn to_internet(&self, packet: &mut [u8]) -> Option<u16> {
        let flow = Flow::parse(packet)?;
        let internal = SocketAddrV4::new(flow.source, flow.source_port);
        let port = self.mapping_for(internal)?;
        flow.rewrite(packet, Side::Source, self.external_ip, port);
        Some(port)
    }

    /// Rewrite an inbound packet's destination back to the internal endpoint.
    ///
    /// Returns the internal endpoint, or `None` if the packet is not ours or
    /// its port has no live mapping.
    pub fn from_internet(&self, packet: &mut [u8]) -> Option<SocketAddrV4> {
        let flow = Flow::parse(packet)?;
        if flow.destination != self.external_ip {
            return None;
        }
        let internal = self.reverse.get(&flow.destination_port)?;
        flow.rewrite(packet, Side::Destination, *internal.ip(), internal.port());
        Some(internal)
    }

    fn mapping_for(&self, internal: SocketAddrV4) -> Option<u16> {
        let existing = self.forward.get(&internal).map(|port| *port);
        if let Some(port) = existing {
            // get() refreshes the mapping, or evicts it if it went idle
            if self.reverse.get(&port) == Some(internal) {
                return Some(port);
            }
        }

        match self.forward.entry(internal) {
            Entry::Occupied(mut entry) => {
                let port = *entry.get();
                if self.reverse.peek(&port) == Some(internal) {
                    // Another task created it first
                    return Some(port);
                }
                match self.claim_port(internal) {
                    Some(port) => {
                        entry.insert(port);
                        Some(port)
                    }
                    None => {
                        entry.remove();
                        None
                    }
                }
            }
            Entry::Vacant(entry) => {
                let port = self.claim_port(internal)?;
                entry.insert(port);
                Some(port)
            }
        }
    }

    // Expired-but-unswept ports are skipped: evicting them here would
    // re-enter `forward` while the caller holds one of its entries.
    fn claim_port(&self, internal: SocketAddrV4) -> Option<u16> {
        let port = self
            .ports
            .allocate(|port| self.reverse.insert_if_vacant(port, internal));
        match port {
            Some(port) => {
                self.by_ip.entry(*internal.ip()).or_default().push(port);
                log::trace!("NAT mapping {} <-> :{} created", internal, port)
            }
            None => log::warn!("NAT port pool exhausted, dropping packet from {}", internal),
        }
        port
    }

    /// Remove every mapping whose internal address is `ip`.
    pub fn purge_ip(&self, ip: Ipv4Addr) -> usize {
        let Some((_, ports)) = self.by_ip.remove(&ip) else {
            return 0;
        };
        let purged = ports
            .iter()
            .filter(|&&port| self.reverse.invalidate_if(&port, |internal| *internal.ip() == ip))
            .count();
        if purged > 0 {
            log::debug!("Purged {} NAT mappings for {}", purged, ip);
        }
        purged
    }

    /// Evict idle mappings. Returns how many were evicted.
    pub fn sweep_expired(&self) -> usize {
        self.reverse.sweep()
    }

    /// Number of live (or not yet swept) mappings.
    pub fn active_mappings(&self) -> usize {
        self.reverse.len()
    }
}

#[cfg(test)]
mod tests {
    use super::header::tests::{assert_checksums_valid, build_packet};
    use super::header::{PROTO_ICMP, PROTO_TCP, PROTO_UDP};
    use super::*;
    use crate::clock::MockClock;
    use crate::packet::{ipv4_destination, ipv4_source};

    const EXTERNAL: Ipv4Addr = Ipv4Addr::new(10, 255, 255, 255);
    const REMOTE: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

    fn client(octet: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, octet)
    }

    fn engine() -> NatEngine {
        NatEngine::new(EXTERNAL, (1024, 49151), Duration::from_secs(65))
    }

    fn source_port(packet: &[u8]) -> u16 {
        u16::from_be_bytes([packet[20], packet[21]])
    }

    /// Build the reply a remote host would send to a translated packet.
    fn reply_to(protocol: u8, external_port: u16) -> Vec<u8> {
        build_packet(protocol, REMOTE, EXTERNAL, 443, external_port, b"response")
    }

    #[test]
    fn test_round_trip_recovers_internal_endpoint() {
        let nat = engine();
        for protocol in [PROTO_TCP, PROTO_UDP] {
            let mut out = build_packet(protocol, client(7), REMOTE, 51000, 443, b"request");
            let port = nat.to_internet(&mut out).unwrap();

            assert_eq!(ipv4_source(&out), Some(EXTERNAL));
            assert_eq!(source_port(&out), port);
            assert_checksums_valid(&out);

            let mut reply = reply_to(protocol, port);
            let internal = nat.from_internet(&mut reply).unwrap();
            assert_eq!(internal, SocketAddrV4::new(client(7), 51000));
            assert_eq!(ipv4_destination(&reply), Some(client(7)));
            assert_eq!(u16::from_be_bytes([reply[22], reply[23]]), 51000);
            assert_checksums_valid(&reply);
        }
    }

    #[test]
    fn test_icmp_echo_round_trip() {
        let nat = engine();
        let mut ping = build_packet(PROTO_ICMP, client(3), REMOTE, 0x1234, 0, b"abcdefgh");
        let id = nat.to_internet(&mut ping).unwrap();
        assert_eq!(u16::from_be_bytes([ping[24], ping[25]]), id);
        assert_checksums_valid(&ping);

        let mut pong = build_packet(PROTO_ICMP, REMOTE, EXTERNAL, id, 0, b"abcdefgh");
        pong[20] = 0; // echo reply
        let checksum = checksum::compute_checksum(&{
            let mut l4 = pong[20..].to_vec();
            l4[2..4].fill(0);
            l4
        });
        pong[22..24].copy_from_slice(&checksum.to_be_bytes());

        let internal = nat.from_internet(&mut pong).unwrap();
        assert_eq!(internal, SocketAddrV4::new(client(3), 0x1234));
        assert_checksums_valid(&pong);
    }

    #[test]
    fn test_same_flow_keeps_port_distinct_flows_differ() {
        let nat = engine();
        let mut a1 = build_packet(PROTO_UDP, client(1), REMOTE, 5000, 53, b"a");
        let mut a2 = build_packet(PROTO_UDP, client(1), REMOTE, 5000, 53, b"b");
        let mut b = build_packet(PROTO_UDP, client(2), REMOTE, 5000, 53, b"c");

        let p1 = nat.to_internet(&mut a1).unwrap();
        let p2 = nat.to_internet(&mut a2).unwrap();
        let p3 = nat.to_internet(&mut b).unwrap();
        assert_eq!(p1, p2);
        assert_ne!(p1, p3);
        assert_eq!(nat.active_mappings(), 2);
    }

    #[test]
    fn test_foreign_destination_and_unmapped_port_fail() {
        let nat = engine();
        let mut foreign = build_packet(PROTO_UDP, REMOTE, Ipv4Addr::new(1, 2, 3, 4), 53, 1024, b"x");
        assert!(nat.from_internet(&mut foreign).is_none());

        let mut unmapped = reply_to(PROTO_UDP, 2000);
        let before = unmapped.clone();
        assert!(nat.from_internet(&mut unmapped).is_none());
        assert_eq!(unmapped, before);
    }

    #[test]
    fn test_unsupported_protocol_dropped() {
        let nat = engine();
        let mut packet = build_packet(PROTO_UDP, client(1), REMOTE, 1, 2, b"x");
        packet[9] = 47;
        assert!(nat.to_internet(&mut packet).is_none());
        assert_eq!(nat.active_mappings(), 0);
    }

    #[test]
    fn test_mapping_expires_and_port_is_reused() {
        MockClock::set_time(Duration::ZERO);
        let nat = NatEngine::new(EXTERNAL, (2000, 2000), Duration::from_secs(65));

        let mut out = build_packet(PROTO_UDP, client(1), REMOTE, 5000, 53, b"x");
        let port = nat.to_internet(&mut out).unwrap();
        assert_eq!(port, 2000);

        // Single-port pool is busy
        let mut other = build_packet(PROTO_UDP, client(2), REMOTE, 6000, 53, b"y");
        assert!(nat.to_internet(&mut other.clone()).is_none());

        MockClock::advance(Duration::from_secs(66));
        let mut reply = reply_to(PROTO_UDP, port);
        assert!(nat.from_internet(&mut reply).is_none());
        assert_eq!(nat.active_mappings(), 0);

        assert_eq!(nat.to_internet(&mut other), Some(2000));
        let mut reply = reply_to(PROTO_UDP, 2000);
        assert_eq!(
            nat.from_internet(&mut reply),
            Some(SocketAddrV4::new(client(2), 6000))
        );
    }

    #[test]
    fn test_translation_refreshes_idle_clock() {
        MockClock::set_time(Duration::ZERO);
        let nat = engine();
        let mut out = build_packet(PROTO_TCP, client(1), REMOTE, 40000, 443, b"x");
        let port = nat.to_internet(&mut out).unwrap();

        for _ in 0..4 {
            MockClock::advance(Duration::from_secs(40));
            let mut reply = reply_to(PROTO_TCP, port);
            assert!(nat.from_internet(&mut reply).is_some());
        }
        assert_eq!(nat.sweep_expired(), 0);

        MockClock::advance(Duration::from_secs(70));
        assert_eq!(nat.sweep_expired(), 1);
        assert_eq!(nat.active_mappings(), 0);
    }

    #[test]
    fn test_expired_forward_entry_gets_new_mapping() {
        MockClock::set_time(Duration::ZERO);
        let nat = engine();
        let mut first = build_packet(PROTO_UDP, client(1), REMOTE, 5000, 53, b"x");
        let old_port = nat.to_internet(&mut first).unwrap();

        MockClock::advance(Duration::from_secs(66));
        let mut again = build_packet(PROTO_UDP, client(1), REMOTE, 5000, 53, b"x");
        let new_port = nat.to_internet(&mut again).unwrap();
        assert_ne!(old_port, new_port);
        assert_eq!(nat.active_mappings(), 1);
        assert_checksums_valid(&again);
    }

    #[test]
    fn test_purge_ip() {
        let nat = engine();
        let mut ports = Vec::new();
        for (octet, sport) in [(1, 1000), (1, 1001), (2, 1000)] {
            let mut packet = build_packet(PROTO_UDP, client(octet), REMOTE, sport, 53, b"x");
            ports.push(nat.to_internet(&mut packet).unwrap());
        }

        assert_eq!(nat.purge_ip(client(1)), 2);
        assert_eq!(nat.active_mappings(), 1);
        assert!(nat.from_internet(&mut reply_to(PROTO_UDP, ports[0])).is_none());
        assert!(nat.from_internet(&mut reply_to(PROTO_UDP, ports[2])).is_some());
        assert_eq!(nat.purge_ip(client(1)), 0);
        assert!(!nat.by_ip.contains_key(&client(1)));
        assert_eq!(*nat.by_ip.get(&client(2)).unwrap(), vec![ports[2]]);
    }

    #[test]
    fn test_port_index_follows_expiry() {
        MockClock::set_time(Duration::ZERO);
        let nat = engine();
        let mut a = build_packet(PROTO_UDP, client(1), REMOTE, 1000, 53, b"x");
        let mut b = build_packet(PROTO_UDP, client(1), REMOTE, 1001, 53, b"x");
        nat.to_internet(&mut a).unwrap();
        MockClock::advance(Duration::from_secs(40));
        let kept = nat.to_internet(&mut b).unwrap();
        assert_eq!(nat.by_ip.get(&client(1)).unwrap().len(), 2);

        MockClock::advance(Duration::from_secs(30));
        assert_eq!(nat.sweep_expired(), 1);
        assert_eq!(*nat.by_ip.get(&client(1)).unwrap(), vec![kept]);

        MockClock::advance(Duration::from_secs(70));
        assert_eq!(nat.sweep_expired(), 1);
        assert!(nat.by_ip.is_empty());
        assert_eq!(nat.purge_ip(client(1)), 0);
    }

    #[test]
    fn test_port_allocator_wraps() {
        let ports = PortAllocator::new(65534, 65535);
        assert_eq!(ports.allocate(|_| true), Some(65534));
        assert_eq!(ports.allocate(|_| true), Some(65535));
        assert_eq!(ports.allocate(|_| true), Some(65534));
        assert_eq!(ports.allocate(|_| false), None);
    }

    #[test]
    fn test_reversed_port_range_is_normalized() {
        let ports = PortAllocator::new(2001, 2000);
        assert_eq!(ports.allocate(|_| true), Some(2000));
        assert_eq!(ports.allocate(|_| true), Some(2001));

        let nat = NatEngine::new(EXTERNAL, (2001, 2000), Duration::from_secs(65));
        let mut packet = build_packet(PROTO_UDP, client(1), REMOTE, 5000, 53, b"x");
        let port = nat.to_internet(&mut packet).unwrap();
        assert!((2000..=2001).contains(&port));
    }
}
