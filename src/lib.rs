//! litevpn-relay
//!
//! Server side of a lightweight VPN that carries raw IPv4 packets over an
//! application-chosen transport (plain UDP datagrams or a WebSocket message
//! relay) instead of a kernel-level encrypted protocol.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          litevpn-relay                           │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  Transport ──► Relay ──┬─ CONNECT/DISCONNECT ──► SessionRegistry │
//! │      ▲                 └─ DATA ──► NatEngine ──► tun device      │
//! │      │                                                           │
//! │      └── PacketBalancer ◄── NatEngine ◄── tun device             │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod balancer;
pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod expiring;
pub mod nat;
pub mod packet;
pub mod relay;
pub mod session;
pub mod stats;
pub mod transport;

// Re-exports for convenience
pub use balancer::PacketBalancer;
pub use config::RelayConfig;
pub use error::{RelayError, RelayResult};
pub use nat::NatEngine;
pub use packet::{Packet, TransportAddr};
pub use relay::Relay;
pub use session::SessionRegistry;
pub use stats::{RelayStats, RelayStatsSnapshot};
pub use transport::{Transport, TransportListener};
