//! Relay counters.
//!
//! Per-packet drops are counted here instead of being logged, to keep
//! logging off the hot paths.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Performance and drop counters for the relay.
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Packets read from the virtual interface.
    pub iface_packets_read: AtomicU64,
    /// Packets handed to the transport for a client.
    pub packets_to_clients: AtomicU64,
    /// Inbound packets with no NAT mapping (or not addressed to us).
    pub packets_unmapped: AtomicU64,
    /// Inbound packets whose virtual IP had no live session.
    pub packets_no_route: AtomicU64,
    /// Data packets from clients written to the virtual interface.
    pub packets_from_clients: AtomicU64,
    /// Data packets from senders without a session.
    pub packets_no_session: AtomicU64,
    /// Outbound packets that failed NAT translation.
    pub packets_untranslatable: AtomicU64,
    /// Data packets whose source IP is not the sender's lease.
    pub packets_spoofed: AtomicU64,
    /// Packets above the size ceiling or with no payload.
    pub packets_malformed: AtomicU64,
    /// Packets dropped because the interface writer channel was closed.
    pub packets_iface_write_failed: AtomicU64,
    /// Client messages dropped because their dispatch queue was full.
    pub packets_queue_full: AtomicU64,
    /// CONNECTs that produced a session.
    pub connects_accepted: AtomicU64,
    /// CONNECTs dropped (bad secret, malformed, pool exhausted, admission off).
    pub connects_rejected: AtomicU64,
    /// DISCONNECTs that removed a session.
    pub disconnects: AtomicU64,
}

impl RelayStats {
    /// Create a new stats instance with all counters zeroed.
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time copy of every counter.
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            iface_packets_read: self.iface_packets_read.load(Ordering::Relaxed),
            packets_to_clients: self.packets_to_clients.load(Ordering::Relaxed),
            packets_unmapped: self.packets_unmapped.load(Ordering::Relaxed),
            packets_no_route: self.packets_no_route.load(Ordering::Relaxed),
            packets_from_clients: self.packets_from_clients.load(Ordering::Relaxed),
            packets_no_session: self.packets_no_session.load(Ordering::Relaxed),
            packets_untranslatable: self.packets_untranslatable.load(Ordering::Relaxed),
            packets_spoofed: self.packets_spoofed.load(Ordering::Relaxed),
            packets_malformed: self.packets_malformed.load(Ordering::Relaxed),
            packets_iface_write_failed: self.packets_iface_write_failed.load(Ordering::Relaxed),
            packets_queue_full: self.packets_queue_full.load(Ordering::Relaxed),
            connects_accepted: self.connects_accepted.load(Ordering::Relaxed),
            connects_rejected: self.connects_rejected.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStatsSnapshot {
    pub iface_packets_read: u64,
    pub packets_to_clients: u64,
    pub packets_unmapped: u64,
    pub packets_no_route: u64,
    pub packets_from_clients: u64,
    pub packets_no_session: u64,
    pub packets_untranslatable: u64,
    pub packets_spoofed: u64,
    pub packets_malformed: u64,
    pub packets_iface_write_failed: u64,
    pub packets_queue_full: u64,
    pub connects_accepted: u64,
    pub connects_rejected: u64,
    pub disconnects: u64,
}

impl fmt::Display for RelayStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "internet->client: read={} sent={} unmapped={} no_route={}",
            self.iface_packets_read,
            self.packets_to_clients,
            self.packets_unmapped,
            self.packets_no_route
        )?;
        writeln!(
            f,
            "client->internet: written={} no_session={} untranslatable={} spoofed={} malformed={} write_failed={} queue_full={}",
            self.packets_from_clients,
            self.packets_no_session,
            self.packets_untranslatable,
            self.packets_spoofed,
            self.packets_malformed,
            self.packets_iface_write_failed,
            self.packets_queue_full
        )?;
        write!(
            f,
            "control: accepted={} rejected={} disconnects={}",
            self.connects_accepted, self.connects_rejected, self.disconnects
        )
    }
}
