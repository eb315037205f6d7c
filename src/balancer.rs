//! Round-robin delivery across the sessions that share a virtual IP.

use crate::packet::TransportAddr;
use crate::session::{MemberSnapshot, SessionRegistry};
use dashmap::DashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

struct Cursor {
    generation: u64,
    sessions: Arc<[TransportAddr]>,
    next: usize,
}

impl Cursor {
    fn new(snapshot: MemberSnapshot) -> Self {
        Self {
            generation: snapshot.generation,
            sessions: snapshot.sessions,
            next: 0,
        }
    }
}

/// Picks which session receives each inbound packet for a virtual IP.
///
/// One cursor per IP walks a snapshot of the live sessions. The cursor is
/// rebuilt when it runs off the end or when the registry's membership
/// generation for the IP has moved on.
#[derive(Default)]
pub struct PacketBalancer {
    cursors: DashMap<Ipv4Addr, Cursor>,
}

impl PacketBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next destination for a packet addressed to `ip`.
    pub fn next_destination(&self, ip: Ipv4Addr, registry: &SessionRegistry) -> Option<TransportAddr> {
        self.pick(ip, registry.members(ip))
    }

    /// Advance the cursor for `ip` over `snapshot`.
    ///
    /// `None` or an empty snapshot means no destination.
    pub fn pick(&self, ip: Ipv4Addr, snapshot: Option<MemberSnapshot>) -> Option<TransportAddr> {
        let snapshot = match snapshot {
            Some(snapshot) if !snapshot.sessions.is_empty() => snapshot,
            _ => {
                self.cursors.remove(&ip);
                return None;
            }
        };

        let mut cursor = self
            .cursors
            .entry(ip)
            .or_insert_with(|| Cursor::new(snapshot.clone()));
        if cursor.generation != snapshot.generation || cursor.next >= cursor.sessions.len() {
            *cursor = Cursor::new(snapshot);
        }

        let destination = cursor.sessions[cursor.next].clone();
        cursor.next += 1;
        Some(destination)
    }

    /// Drop the cursor for `ip`; the next pick rebuilds it.
    pub fn invalidate(&self, ip: Ipv4Addr) {
        self.cursors.remove(&ip);
    }

    pub fn tracked_ips(&self) -> usize {
        self.cursors.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ConnectRequest;
    use crate::session::IpAllocator;
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn addr(port: u16) -> TransportAddr {
        TransportAddr::Datagram(SocketAddr::from(([198, 51, 100, 1], port)))
    }

    fn snapshot(generation: u64, ports: &[u16]) -> Option<MemberSnapshot> {
        Some(MemberSnapshot {
            generation,
            sessions: ports.iter().map(|&p| addr(p)).collect(),
        })
    }

    const IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    #[test]
    fn test_round_robin_order() {
        let balancer = PacketBalancer::new();
        let picks: Vec<_> = (0..6)
            .map(|_| balancer.pick(IP, snapshot(1, &[1, 2, 3])).unwrap())
            .collect();
        assert_eq!(picks, vec![addr(1), addr(2), addr(3), addr(1), addr(2), addr(3)]);
    }

    #[test]
    fn test_fairness_floor() {
        let balancer = PacketBalancer::new();
        let n = 4;
        let m = 23;
        let ports: Vec<u16> = (1..=n).collect();
        let mut counts: HashMap<TransportAddr, usize> = HashMap::new();
        for delivered in 0..m {
            let dest = balancer.pick(IP, snapshot(9, &ports)).unwrap();
            *counts.entry(dest).or_default() += 1;

            // Nobody gets ahead of anyone by more than one delivery
            let max = counts.values().max().copied().unwrap_or(0);
            let min = if counts.len() < n as usize { 0 } else { *counts.values().min().unwrap() };
            assert!(max - min <= 1, "after {} deliveries: {:?}", delivered + 1, counts);
        }
        assert!(counts.values().all(|&c| c >= m / n as usize));
    }

    #[test]
    fn test_generation_change_rebuilds() {
        let balancer = PacketBalancer::new();
        assert_eq!(balancer.pick(IP, snapshot(1, &[1, 2])), Some(addr(1)));
        // Membership changed: the new set is walked from the start
        assert_eq!(balancer.pick(IP, snapshot(2, &[3, 2])), Some(addr(3)));
        assert_eq!(balancer.pick(IP, snapshot(2, &[3, 2])), Some(addr(2)));
        assert_eq!(balancer.pick(IP, snapshot(2, &[3, 2])), Some(addr(3)));
    }

    #[test]
    fn test_empty_set_is_no_destination() {
        let balancer = PacketBalancer::new();
        balancer.pick(IP, snapshot(1, &[1]));
        assert_eq!(balancer.pick(IP, snapshot(2, &[])), None);
        assert_eq!(balancer.pick(IP, None), None);
        assert_eq!(balancer.tracked_ips(), 0);
    }

    #[test]
    fn test_next_destination_follows_registry() {
        let registry = SessionRegistry::new(
            "s",
            IpAllocator::new(IP, Ipv4Addr::new(10, 0, 0, 10)),
            Duration::from_secs(60),
            None,
        );
        let request = ConnectRequest {
            secret: "s".into(),
            group_id: "g".into(),
        };
        registry.admit(&addr(1), &request, |_| true).unwrap();
        registry.admit(&addr(2), &request, |_| true).unwrap();

        let balancer = PacketBalancer::new();
        assert_eq!(balancer.next_destination(IP, &registry), Some(addr(1)));
        assert_eq!(balancer.next_destination(IP, &registry), Some(addr(2)));

        registry.disconnect(&addr(1));
        assert_eq!(balancer.next_destination(IP, &registry), Some(addr(2)));
        assert_eq!(balancer.next_destination(IP, &registry), Some(addr(2)));

        registry.disconnect(&addr(2));
        assert_eq!(balancer.next_destination(IP, &registry), None);
    }
}
