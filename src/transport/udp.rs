//! Datagram transport over a single UDP socket.

use super::{ListenerSlot, Transport, TransportListener};
use crate::packet::{Packet, TransportAddr, MAX_PACKET_SIZE};
use async_trait::async_trait;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// Rebind attempts after a receive error before giving up.
const REBIND_ATTEMPTS: u32 = 5;

/// Delay before the first rebind attempt; doubles on each retry.
const REBIND_INITIAL_DELAY: Duration = Duration::from_millis(200);

/// Unreliable transport: one UDP socket bound on `0.0.0.0:port`.
///
/// Each datagram is one message. A receive error rebinds the socket on the
/// same port; only when that keeps failing does the listener see
/// `on_closed(false)`.
pub struct UdpTransport {
    inner: Arc<UdpInner>,
}

struct UdpInner {
    port: u16,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    listener: ListenerSlot,
    cancel: Mutex<Option<CancellationToken>>,
}

impl UdpInner {
    fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_socket(&self, socket: Option<Arc<UdpSocket>>) {
        *self.socket.write().unwrap_or_else(PoisonError::into_inner) = socket;
    }
}

impl UdpTransport {
    /// Create a transport for `port`. Port 0 picks an ephemeral port.
    pub fn new(port: u16) -> Self {
        Self {
            inner: Arc::new(UdpInner {
                port,
                socket: RwLock::new(None),
                listener: ListenerSlot::default(),
                cancel: Mutex::new(None),
            }),
        }
    }

    /// Address the socket is bound to, while started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.socket()?.local_addr().ok()
    }
}

async fn bind(port: u16) -> io::Result<UdpSocket> {
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await
}

#[async_trait]
impl Transport for UdpTransport {
    async fn start(&self) -> bool {
        self.stop();

        let socket = match bind(self.inner.port).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                log::error!("Failed to bind UDP port {}: {}", self.inner.port, e);
                return false;
            }
        };
        if let Ok(addr) = socket.local_addr() {
            log::info!("UDP transport listening on {}", addr);
        }

        let cancel = CancellationToken::new();
        self.inner.set_socket(Some(socket.clone()));
        *self
            .inner
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(cancel.clone());

        tokio::spawn(run_receive_loop(self.inner.clone(), socket, cancel));
        true
    }

    fn stop(&self) {
        let cancel = self
            .inner
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(cancel) = cancel {
            cancel.cancel();
            log::debug!("UDP transport stopped");
        }
        self.inner.set_socket(None);
    }

    fn send(&self, packet: Packet) {
        let addr = match packet.destination {
            Some(TransportAddr::Datagram(addr)) => addr,
            _ => {
                log::trace!("UDP send without datagram destination dropped");
                return;
            }
        };
        if packet.is_empty() || packet.is_oversized() {
            log::trace!("UDP send of {} bytes to {} dropped", packet.len(), addr);
            return;
        }
        let Some(socket) = self.inner.socket() else {
            return;
        };

        tokio::spawn(async move {
            if let Err(e) = socket.send_to(&packet.data, addr).await {
                log::trace!("UDP send to {} failed: {}", addr, e);
            }
        });
    }

    fn set_listener(&self, listener: Option<Arc<dyn TransportListener>>) {
        self.inner.listener.set(listener);
    }

    fn is_reliable(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "udp"
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_receive_loop(
    inner: Arc<UdpInner>,
    mut socket: Arc<UdpSocket>,
    cancel: CancellationToken,
) {
    // One extra byte so an oversized datagram is detectable after truncation
    let mut buf = vec![0u8; MAX_PACKET_SIZE + 1];

    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            r = socket.recv_from(&mut buf) => r,
        };

        match result {
            Ok((0, _)) => continue,
            Ok((n, peer)) if n > MAX_PACKET_SIZE => {
                log::trace!("Oversized datagram from {} dropped", peer);
            }
            Ok((n, peer)) => {
                if let Some(listener) = inner.listener.get() {
                    listener.on_message(Packet::received(&buf[..n], TransportAddr::Datagram(peer)));
                }
            }
            Err(e) => {
                log::warn!("UDP receive failed: {}, rebinding", e);
                match rebind(&inner, socket, &cancel).await {
                    Some(fresh) => socket = fresh,
                    None => {
                        if !cancel.is_cancelled() {
                            log::error!("UDP transport could not recover, closing");
                            if let Some(listener) = inner.listener.get() {
                                listener.on_closed(false);
                            }
                        }
                        break;
                    }
                }
            }
        }
    }
}

/// Drop the failed socket and bind a new one on the same port.
async fn rebind(
    inner: &UdpInner,
    failed: Arc<UdpSocket>,
    cancel: &CancellationToken,
) -> Option<Arc<UdpSocket>> {
    let port = failed
        .local_addr()
        .map(|addr| addr.port())
        .unwrap_or(inner.port);
    inner.set_socket(None);
    drop(failed);

    let mut delay = REBIND_INITIAL_DELAY;
    for attempt in 1..=REBIND_ATTEMPTS {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
        match bind(port).await {
            Ok(socket) => {
                let socket = Arc::new(socket);
                if cancel.is_cancelled() {
                    return None;
                }
                inner.set_socket(Some(socket.clone()));
                log::info!("UDP socket rebound on port {} (attempt {})", port, attempt);
                return Some(socket);
            }
            Err(e) => {
                log::warn!("UDP rebind attempt {} on port {} failed: {}", attempt, port, e);
                delay *= 2;
            }
        }
    }
    None
}
