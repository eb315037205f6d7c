//! Transport abstraction.
//!
//! A transport moves opaque payloads between the relay and its clients.
//! Two families exist: unreliable datagrams ([`UdpTransport`]) and a
//! reliable, ordered message relay ([`RelayTransport`]). Both look the same
//! to the relay except for [`Transport::is_reliable`], which picks how many
//! times control packets are sent.

mod relayed;
mod udp;

pub use relayed::{RelayFrame, RelayTransport};
pub use udp::UdpTransport;

use crate::packet::Packet;
use async_trait::async_trait;
use std::sync::{Arc, PoisonError, RwLock};

/// Copies of each control packet sent over an unreliable transport.
pub const CONTROL_SEND_MULTIPLIER: usize = 3;

/// How many times a control packet goes out on a transport.
///
/// Data packets are always sent once.
#[inline]
pub fn control_send_count(reliable: bool) -> usize {
    if reliable {
        1
    } else {
        CONTROL_SEND_MULTIPLIER
    }
}

/// Send a control packet according to the transport's redundancy policy.
pub fn send_control(transport: &dyn Transport, packet: Packet) {
    let copies = control_send_count(transport.is_reliable());
    for _ in 1..copies {
        transport.send(packet.clone());
    }
    transport.send(packet);
}

/// Receives what a transport delivers.
pub trait TransportListener: Send + Sync {
    /// A payload arrived. `packet.source` identifies the sender.
    fn on_message(&self, packet: Packet);

    /// The transport is gone. `by_user` is true when it was closed locally.
    fn on_closed(&self, by_user: bool);
}

/// A bidirectional packet channel.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Begin accepting or connecting. Resolves to false on failure.
    async fn start(&self) -> bool;

    /// Release resources. Idempotent; does not notify the listener.
    fn stop(&self);

    /// Fire-and-forget send to `packet.destination`.
    fn send(&self, packet: Packet);

    /// Install the single active listener, or detach it with `None`.
    fn set_listener(&self, listener: Option<Arc<dyn TransportListener>>);

    /// Whether the transport guarantees delivery and ordering.
    fn is_reliable(&self) -> bool;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// Holder for a transport's current listener.
#[derive(Default)]
pub(crate) struct ListenerSlot {
    inner: RwLock<Option<Arc<dyn TransportListener>>>,
}

impl ListenerSlot {
    pub(crate) fn set(&self, listener: Option<Arc<dyn TransportListener>>) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = listener;
    }

    pub(crate) fn get(&self) -> Option<Arc<dyn TransportListener>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
