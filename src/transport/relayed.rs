//! Reliable transport over a JSON-over-WebSocket message relay.
//!
//! The relay forwards small JSON frames between named peers:
//!
//! ```text
//! server -> relay   {"auth": "<server id>", "passwd": "<random>"}
//! relay  -> server  {"auth": "OK"}
//! server -> relay   {"to": "<peer id>", "data": "<base64 payload>"}
//! relay  -> server  {"FROM": "<peer id>", "data": "<base64 payload>"}
//! relay  -> server  {"error": "..."}
//! ```

use super::{ListenerSlot, Transport, TransportListener};
use crate::packet::{Packet, TransportAddr, MAX_PACKET_SIZE};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const PASSWORD_LEN: usize = 32;

#[derive(Serialize)]
struct AuthRequest<'a> {
    auth: &'a str,
    passwd: &'a str,
}

#[derive(Serialize)]
struct OutboundData<'a> {
    to: &'a str,
    data: String,
}

#[derive(Deserialize)]
struct InboundFrame {
    auth: Option<String>,
    error: Option<serde_json::Value>,
    #[serde(rename = "FROM")]
    from: Option<String>,
    data: Option<String>,
}

/// A decoded frame received from the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    /// Answer to the authentication request.
    Auth { ok: bool },
    /// The relay reported a problem.
    Error(String),
    /// A payload from a peer.
    Data { from: String, payload: Vec<u8> },
    /// Anything else the relay sends (presence notices and so on).
    Other,
}

impl RelayFrame {
    /// Decode a text frame. Returns `None` for malformed JSON or base64.
    pub fn decode(text: &str) -> Option<Self> {
        let frame: InboundFrame = serde_json::from_str(text).ok()?;

        if let Some(error) = frame.error {
            let message = match error {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            return Some(RelayFrame::Error(message));
        }
        if let Some(auth) = frame.auth {
            return Some(RelayFrame::Auth {
                ok: auth.eq_ignore_ascii_case("ok"),
            });
        }
        match (frame.from, frame.data) {
            (Some(from), Some(data)) => {
                let payload = general_purpose::STANDARD.decode(data).ok()?;
                Some(RelayFrame::Data { from, payload })
            }
            _ => Some(RelayFrame::Other),
        }
    }
}

/// Encode an outbound payload frame.
fn encode_data(to: &str, payload: &[u8]) -> Option<String> {
    serde_json::to_string(&OutboundData {
        to,
        data: general_purpose::STANDARD.encode(payload),
    })
    .ok()
}

fn random_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LEN)
        .map(char::from)
        .collect()
}

/// Reliable transport through a WebSocket message relay.
///
/// Peers are addressed by their relay identifier. Ordering and delivery are
/// the relay's, so control packets go out once.
pub struct RelayTransport {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    url: String,
    server_id: String,
    listener: ListenerSlot,
    session: Mutex<Option<RelaySession>>,
}

struct RelaySession {
    cancel: CancellationToken,
    outbound: mpsc::UnboundedSender<Message>,
}

impl RelayInner {
    fn outbound(&self) -> Option<mpsc::UnboundedSender<Message>> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|session| session.outbound.clone())
    }

    fn deliver(&self, text: &str) {
        match RelayFrame::decode(text) {
            Some(RelayFrame::Data { from, payload }) => {
                if payload.is_empty() || payload.len() > MAX_PACKET_SIZE {
                    log::trace!("Relay payload of {} bytes from {} dropped", payload.len(), from);
                    return;
                }
                if let Some(listener) = self.listener.get() {
                    listener.on_message(Packet::received(&payload, TransportAddr::Relay(from)));
                }
            }
            Some(RelayFrame::Error(message)) => {
                log::warn!("Relay reported error: {}", message);
            }
            Some(RelayFrame::Auth { .. }) | Some(RelayFrame::Other) => {}
            None => log::trace!("Malformed relay frame dropped"),
        }
    }
}

impl RelayTransport {
    /// Create a transport that authenticates on `url` as `server_id`.
    pub fn new(url: impl Into<String>, server_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                url: url.into(),
                server_id: server_id.into(),
                listener: ListenerSlot::default(),
                session: Mutex::new(None),
            }),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.inner.server_id
    }
}

async fn await_auth(stream: &mut SplitStream<WsStream>) -> bool {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match RelayFrame::decode(&text) {
                Some(RelayFrame::Auth { ok }) => return ok,
                Some(RelayFrame::Error(e)) => {
                    log::warn!("Relay rejected authentication: {}", e);
                    return false;
                }
                _ => continue,
            },
            Ok(Message::Close(_)) | Err(_) => return false,
            Ok(_) => continue,
        }
    }
    false
}

#[async_trait]
impl Transport for RelayTransport {
    async fn start(&self) -> bool {
        self.stop();

        let url = self.inner.url.as_str();
        let ws = match tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(url)).await {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => {
                log::error!("Failed to connect to relay {}: {}", url, e);
                return false;
            }
            Err(_) => {
                log::error!("Timed out connecting to relay {}", url);
                return false;
            }
        };
        let (mut sink, mut stream) = ws.split();

        let password = random_password();
        let auth = match serde_json::to_string(&AuthRequest {
            auth: &self.inner.server_id,
            passwd: &password,
        }) {
            Ok(auth) => auth,
            Err(e) => {
                log::error!("Failed to encode relay auth: {}", e);
                return false;
            }
        };
        if let Err(e) = sink.send(Message::Text(auth)).await {
            log::error!("Failed to send relay auth: {}", e);
            return false;
        }
        match tokio::time::timeout(AUTH_TIMEOUT, await_auth(&mut stream)).await {
            Ok(true) => {}
            Ok(false) => {
                log::error!("Relay {} refused id {}", url, self.inner.server_id);
                return false;
            }
            Err(_) => {
                log::error!("Timed out authenticating with relay {}", url);
                return false;
            }
        }
        log::info!("Authenticated on relay {} as {}", url, self.inner.server_id);

        let cancel = CancellationToken::new();
        let (outbound, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(sink, rx, cancel.clone()));
        tokio::spawn(run_reader(self.inner.clone(), stream, cancel.clone()));

        *self
            .inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(RelaySession { cancel, outbound });
        true
    }

    fn stop(&self) {
        let session = self
            .inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            session.cancel.cancel();
            log::debug!("Relay transport stopped");
        }
    }

    fn send(&self, packet: Packet) {
        let to = match packet.destination {
            Some(TransportAddr::Relay(ref id)) => id.as_str(),
            _ => {
                log::trace!("Relay send without relay destination dropped");
                return;
            }
        };
        if packet.is_empty() || packet.is_oversized() {
            return;
        }
        let Some(outbound) = self.inner.outbound() else {
            return;
        };
        if let Some(frame) = encode_data(to, &packet.data) {
            let _ = outbound.send(Message::Text(frame));
        }
    }

    fn set_listener(&self, listener: Option<Arc<dyn TransportListener>>) {
        self.inner.listener.set(listener);
    }

    fn is_reliable(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "relay"
    }
}

impl Drop for RelayTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_writer(
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            m = rx.recv() => match m {
                Some(m) => m,
                None => break,
            },
        };
        if let Err(e) = sink.send(message).await {
            log::debug!("Relay write failed: {}", e);
            return;
        }
    }
    let _ = sink.close().await;
}

async fn run_reader(inner: Arc<RelayInner>, mut stream: SplitStream<WsStream>, cancel: CancellationToken) {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            m = stream.next() => m,
        };
        match message {
            Some(Ok(Message::Text(text))) => inner.deliver(&text),
            Some(Ok(Message::Close(frame))) => {
                log::info!("Relay closed the connection: {:?}", frame);
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                log::warn!("Relay read failed: {}", e);
                break;
            }
            None => break,
        }
    }

    if !cancel.is_cancelled() {
        cancel.cancel();
        if let Some(listener) = inner.listener.get() {
            listener.on_closed(false);
        }
    }
}
