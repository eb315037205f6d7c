//! The relay loop: ties the transport, registry, NAT and balancer together.
//!
//! Two directions run concurrently:
//!
//! - **internet → client**: a long-lived task reads the virtual interface;
//!   each packet is handed to a worker task that runs NAT `from_internet`,
//!   asks the balancer for a session and sends it on the transport.
//! - **client → internet**: the transport delivers messages to the relay's
//!   listener, which queues them for one of a fixed set of client workers
//!   chosen by the sender's address. A worker dispatches on the type byte:
//!   CONNECT/DISCONNECT go to the registry, DATA goes through NAT
//!   `to_internet` and on to the interface writer task. One sender always
//!   lands on the same worker, so its messages keep their transport order.
//!
//! Per-packet failures are drops counted in [`RelayStats`]. Only interface
//! failures stop processing; transport loss clears sessions and reconnects.

use crate::balancer::PacketBalancer;
use crate::config::RelayConfig;
use crate::device::{InterfaceReader, InterfaceWriter};
use crate::error::{RelayError, RelayResult};
use crate::nat::NatEngine;
use crate::packet::{self, ConnectRequest, ConnectionParams, Packet, PacketKind, TransportAddr, MAX_PACKET_SIZE};
use crate::session::{LeaseListener, SessionRegistry};
use crate::stats::{RelayStats, RelayStatsSnapshot};
use crate::transport::{send_control, Transport, TransportListener};
use bytes::{Bytes, BytesMut};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io;
use std::net::Ipv4Addr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// First delay before restarting a lost transport.
const RECONNECT_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Cap on the transport restart delay.
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Packets the interface writer drains per wakeup.
const IFACE_WRITE_BATCH: usize = 64;

/// Client workers when the parallelism of the host is unknown.
const DEFAULT_CLIENT_WORKERS: usize = 4;

/// Keeps the balancer and NAT in step with lease changes.
struct LeaseHooks {
    nat: Arc<NatEngine>,
    balancer: Arc<PacketBalancer>,
}

impl LeaseListener for LeaseHooks {
    fn on_members_changed(&self, ip: Ipv4Addr) {
        self.balancer.invalidate(ip);
    }

    fn on_lease_released(&self, ip: Ipv4Addr) {
        self.balancer.invalidate(ip);
        self.nat.purge_ip(ip);
    }
}

/// State shared by the relay's tasks.
struct RelayCore {
    this: Weak<RelayCore>,
    params: ConnectionParams,
    sweep_interval: Duration,
    transport: Arc<dyn Transport>,
    registry: Arc<SessionRegistry>,
    nat: Arc<NatEngine>,
    balancer: Arc<PacketBalancer>,
    stats: Arc<RelayStats>,
    receive_connections: AtomicBool,
    /// Interface read half while no reader task owns it.
    iface_reader: Mutex<Option<Box<dyn InterfaceReader>>>,
    iface_tx: mpsc::Sender<Bytes>,
    /// Per-worker queues of client messages, indexed by sender hash.
    client_queues: Vec<mpsc::Sender<Packet>>,
    iface_failed: AtomicBool,
    /// Token of the running processing session, if any.
    active: Mutex<Option<CancellationToken>>,
}

/// Forwards transport events to the core without keeping it alive.
struct CoreListener {
    core: Weak<RelayCore>,
}

impl TransportListener for CoreListener {
    fn on_message(&self, packet: Packet) {
        if let Some(core) = self.core.upgrade() {
            core.enqueue_client_packet(packet);
        }
    }

    fn on_closed(&self, by_user: bool) {
        if let Some(core) = self.core.upgrade() {
            tokio::spawn(core.recover_transport(by_user));
        }
    }
}

impl RelayCore {
    fn listener(&self) -> Arc<dyn TransportListener> {
        Arc::new(CoreListener {
            core: self.this.clone(),
        })
    }

    fn active_token(&self) -> Option<CancellationToken> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_active(&self, token: Option<CancellationToken>) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = token;
    }

    fn park_reader(&self, reader: Box<dyn InterfaceReader>) {
        *self.iface_reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(reader);
    }

    fn take_reader(&self) -> Option<Box<dyn InterfaceReader>> {
        self.iface_reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// The virtual interface is unusable: stop processing for good.
    fn fail_interface(&self, op: &str, error: &io::Error) {
        if self.iface_failed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::error!("Virtual interface {} failed: {}; processing stopped", op, error);
        if let Some(token) = self.active_token() {
            token.cancel();
        }
        self.transport.set_listener(None);
        self.transport.stop();
    }

    /// Queue a client message on the worker that owns its sender.
    fn enqueue_client_packet(&self, packet: Packet) {
        let Some(source) = packet.source.as_ref() else {
            RelayStats::bump(&self.stats.packets_malformed);
            return;
        };
        let mut hasher = DefaultHasher::new();
        source.hash(&mut hasher);
        let index = (hasher.finish() % self.client_queues.len() as u64) as usize;

        match self.client_queues[index].try_send(packet) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                RelayStats::bump(&self.stats.packets_queue_full);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    async fn handle_client_packet(&self, packet: Packet) {
        if packet.is_oversized() {
            RelayStats::bump(&self.stats.packets_malformed);
            return;
        }
        let Some(source) = packet.source.clone() else {
            RelayStats::bump(&self.stats.packets_malformed);
            return;
        };

        match packet.kind() {
            Some(PacketKind::Connect) => self.handle_connect(&source, &packet.data),
            Some(PacketKind::Disconnect) => self.handle_disconnect(&source),
            Some(PacketKind::Data) => self.handle_data(&source, packet.data).await,
            None => RelayStats::bump(&self.stats.packets_malformed),
        }
    }

    fn handle_connect(&self, source: &TransportAddr, payload: &[u8]) {
        if !self.receive_connections.load(Ordering::Acquire) {
            log::trace!("CONNECT from {} ignored: not receiving connections", source);
            RelayStats::bump(&self.stats.connects_rejected);
            return;
        }
        let Some(request) = ConnectRequest::parse(payload) else {
            log::debug!("Malformed CONNECT from {}", source);
            RelayStats::bump(&self.stats.connects_rejected);
            return;
        };

        match self
            .registry
            .admit(source, &request, |ip| self.send_params(source, ip))
        {
            Some(admission) => {
                RelayStats::bump(&self.stats.connects_accepted);
                if !admission.new_session {
                    log::debug!("Repeated CONNECT from {} ({})", source, admission.ip);
                }
            }
            None => RelayStats::bump(&self.stats.connects_rejected),
        }
    }

    fn send_params(&self, destination: &TransportAddr, ip: Ipv4Addr) -> bool {
        match self.params.encode_reply(ip) {
            Some(reply) => {
                send_control(
                    self.transport.as_ref(),
                    Packet {
                        data: reply,
                        source: None,
                        destination: Some(destination.clone()),
                    },
                );
                true
            }
            None => {
                log::warn!("Connection parameters for {} exceed {} bytes", ip, MAX_PACKET_SIZE);
                false
            }
        }
    }

    fn handle_disconnect(&self, source: &TransportAddr) {
        if self.registry.disconnect(source).is_some() {
            RelayStats::bump(&self.stats.disconnects);
        }
    }

    async fn handle_data(&self, source: &TransportAddr, mut data: BytesMut) {
        let Some(session) = self.registry.lookup(source) else {
            RelayStats::bump(&self.stats.packets_no_session);
            return;
        };
        if packet::ipv4_source(&data) != Some(session.ip) {
            RelayStats::bump(&self.stats.packets_spoofed);
            return;
        }
        if self.nat.to_internet(&mut data).is_none() {
            RelayStats::bump(&self.stats.packets_untranslatable);
            return;
        }
        if self.iface_tx.send(data.freeze()).await.is_err() {
            RelayStats::bump(&self.stats.packets_iface_write_failed);
            return;
        }
        RelayStats::bump(&self.stats.packets_from_clients);
    }

    fn handle_internet_packet(&self, mut data: BytesMut) {
        let Some(internal) = self.nat.from_internet(&mut data) else {
            RelayStats::bump(&self.stats.packets_unmapped);
            return;
        };
        let Some(destination) = self.balancer.next_destination(*internal.ip(), &self.registry) else {
            RelayStats::bump(&self.stats.packets_no_route);
            return;
        };
        self.transport.send(Packet {
            data,
            source: None,
            destination: Some(destination),
        });
        RelayStats::bump(&self.stats.packets_to_clients);
    }

    /// Transport lost: drop every session, then restart with backoff unless
    /// the close was user-initiated or processing stops meanwhile.
    async fn recover_transport(self: Arc<Self>, by_user: bool) {
        let cleared = self.registry.clear();
        log::warn!(
            "{} transport closed (by_user={}), cleared {} sessions",
            self.transport.name(),
            by_user,
            cleared
        );
        if by_user {
            return;
        }
        let Some(cancel) = self.active_token() else {
            return;
        };

        let mut delay = RECONNECT_INITIAL_DELAY;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            if self.transport.start().await {
                if cancel.is_cancelled() {
                    self.transport.stop();
                    return;
                }
                self.transport.set_listener(Some(self.listener()));
                log::info!("{} transport restarted", self.transport.name());
                return;
            }

            delay = (delay * 2).min(RECONNECT_MAX_DELAY);
            log::warn!(
                "{} transport restart failed, retrying in {:?}",
                self.transport.name(),
                delay
            );
        }
    }
}

async fn run_iface_reader(
    core: Arc<RelayCore>,
    mut reader: Box<dyn InterfaceReader>,
    cancel: CancellationToken,
) -> Option<Box<dyn InterfaceReader>> {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];

    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            r = reader.read_packet(&mut buf) => Some(r),
        };

        let n = match result {
            None => return Some(reader),
            Some(Ok(0)) => {
                let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "interface closed");
                core.fail_interface("read", &eof);
                return None;
            }
            Some(Ok(n)) => n,
            Some(Err(e)) => {
                core.fail_interface("read", &e);
                return None;
            }
        };

        RelayStats::bump(&core.stats.iface_packets_read);
        let data = BytesMut::from(&buf[..n]);
        let worker = core.clone();
        tokio::spawn(async move { worker.handle_internet_packet(data) });
    }
}

async fn run_iface_writer(
    core: Weak<RelayCore>,
    mut writer: Box<dyn InterfaceWriter>,
    mut rx: mpsc::Receiver<Bytes>,
    shutdown: CancellationToken,
) {
    let mut batch = Vec::with_capacity(IFACE_WRITE_BATCH);

    loop {
        let received = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            n = rx.recv_many(&mut batch, IFACE_WRITE_BATCH) => n,
        };
        if received == 0 {
            break;
        }

        for packet in batch.drain(..) {
            if let Err(e) = writer.write_packet(&packet).await {
                if let Some(core) = core.upgrade() {
                    core.fail_interface("write", &e);
                }
                return;
            }
        }
    }
    log::debug!("Interface writer exited");
}

async fn run_client_worker(
    core: Weak<RelayCore>,
    mut rx: mpsc::Receiver<Packet>,
    shutdown: CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            p = rx.recv() => match p {
                Some(p) => p,
                None => break,
            },
        };
        let Some(core) = core.upgrade() else {
            break;
        };
        core.handle_client_packet(packet).await;
    }
}

async fn run_sweeper(core: Arc<RelayCore>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(core.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let sessions = core.registry.sweep_expired();
        let mappings = core.nat.sweep_expired();
        if sessions + mappings > 0 {
            log::debug!(
                "Swept {} idle sessions and {} idle NAT mappings",
                sessions,
                mappings
            );
        }
    }
}

struct Processing {
    cancel: CancellationToken,
    reader_task: JoinHandle<Option<Box<dyn InterfaceReader>>>,
    sweeper_task: JoinHandle<()>,
}

/// The VPN relay.
///
/// Connection admission and packet processing are separate switches:
/// [`Relay::set_receive_connections`] gates new CONNECTs, while
/// [`Relay::start_processing`]/[`Relay::stop_processing`] run or halt both
/// relay directions.
pub struct Relay {
    core: Arc<RelayCore>,
    processing: tokio::sync::Mutex<Option<Processing>>,
    shutdown: CancellationToken,
    /// Interface writer and client workers; they run until shutdown.
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Relay {
    /// Build a relay over `transport` and the two interface halves.
    ///
    /// Must be called inside a tokio runtime: the interface writer task is
    /// spawned here. Processing does not start until
    /// [`start_processing`](Self::start_processing).
    pub fn new<R, W>(
        config: &RelayConfig,
        transport: Arc<dyn Transport>,
        reader: R,
        writer: W,
    ) -> RelayResult<Self>
    where
        R: InterfaceReader,
        W: InterfaceWriter,
    {
        config.validate()?;

        let nat = Arc::new(NatEngine::from_config(config));
        let balancer = Arc::new(PacketBalancer::new());
        let hooks: Arc<dyn LeaseListener> = Arc::new(LeaseHooks {
            nat: nat.clone(),
            balancer: balancer.clone(),
        });
        let registry = Arc::new(SessionRegistry::from_config(config, Some(hooks))?);
        let (iface_tx, iface_rx) = mpsc::channel(config.iface_writer_channel_size);
        let workers = std::thread::available_parallelism()
            .map_or(DEFAULT_CLIENT_WORKERS, NonZeroUsize::get);
        let (client_queues, client_rxs): (Vec<_>, Vec<_>) = (0..workers)
            .map(|_| mpsc::channel(config.iface_writer_channel_size))
            .unzip();

        let core = Arc::new_cyclic(|this| RelayCore {
            this: this.clone(),
            params: config.connection_params(),
            sweep_interval: config.sweep_interval(),
            transport,
            registry,
            nat,
            balancer,
            stats: Arc::new(RelayStats::new()),
            receive_connections: AtomicBool::new(false),
            iface_reader: Mutex::new(Some(Box::new(reader))),
            iface_tx,
            client_queues,
            iface_failed: AtomicBool::new(false),
            active: Mutex::new(None),
        });

        let shutdown = CancellationToken::new();
        let mut background = Vec::with_capacity(workers + 1);
        background.push(tokio::spawn(run_iface_writer(
            Arc::downgrade(&core),
            Box::new(writer),
            iface_rx,
            shutdown.clone(),
        )));
        for rx in client_rxs {
            background.push(tokio::spawn(run_client_worker(
                Arc::downgrade(&core),
                rx,
                shutdown.clone(),
            )));
        }

        Ok(Self {
            core,
            processing: tokio::sync::Mutex::new(None),
            shutdown,
            background: Mutex::new(background),
        })
    }

    /// Enable or disable admission of new CONNECTs.
    pub fn set_receive_connections(&self, enabled: bool) {
        self.core.receive_connections.store(enabled, Ordering::Release);
        log::info!(
            "Receiving connections {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    pub fn receive_connections(&self) -> bool {
        self.core.receive_connections.load(Ordering::Acquire)
    }

    /// Start (or restart) both relay directions.
    ///
    /// Fails if the virtual interface has failed or the transport does not
    /// start.
    pub async fn start_processing(&self) -> RelayResult<()> {
        let mut processing = self.processing.lock().await;
        self.stop_locked(&mut processing).await;

        let core = &self.core;
        if core.iface_failed.load(Ordering::Acquire) {
            return Err(RelayError::ProcessingStopped(
                "virtual interface failed".into(),
            ));
        }
        let reader = core
            .take_reader()
            .ok_or_else(|| RelayError::ProcessingStopped("virtual interface is closed".into()))?;

        if !core.transport.start().await {
            core.park_reader(reader);
            return Err(RelayError::transport(format!(
                "Failed to start {} transport",
                core.transport.name()
            )));
        }

        let cancel = CancellationToken::new();
        core.set_active(Some(cancel.clone()));
        core.transport.set_listener(Some(core.listener()));

        let reader_task = tokio::spawn(run_iface_reader(core.clone(), reader, cancel.clone()));
        let sweeper_task = tokio::spawn(run_sweeper(core.clone(), cancel.clone()));
        *processing = Some(Processing {
            cancel,
            reader_task,
            sweeper_task,
        });

        log::info!("Processing started on {} transport", core.transport.name());
        Ok(())
    }

    /// Stop both relay directions. Sessions stay until they expire.
    pub async fn stop_processing(&self) {
        let mut processing = self.processing.lock().await;
        self.stop_locked(&mut processing).await;
    }

    async fn stop_locked(&self, processing: &mut Option<Processing>) {
        let Some(running) = processing.take() else {
            return;
        };

        // Interrupt reads, then detach, then release.
        running.cancel.cancel();
        self.core.set_active(None);
        self.core.transport.set_listener(None);
        self.core.transport.stop();

        match running.reader_task.await {
            Ok(Some(reader)) => self.core.park_reader(reader),
            Ok(None) => {}
            Err(e) => log::error!("Interface reader task failed: {}", e),
        }
        if let Err(e) = running.sweeper_task.await {
            log::error!("Sweeper task failed: {}", e);
        }
        log::info!("Processing stopped");
    }

    /// True while both directions are running.
    pub fn is_processing(&self) -> bool {
        self.core
            .active_token()
            .is_some_and(|token| !token.is_cancelled())
    }

    /// True once a read or write on the virtual interface has failed.
    pub fn interface_failed(&self) -> bool {
        self.core.iface_failed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.core.stats.snapshot()
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.core.registry
    }

    pub fn nat(&self) -> &NatEngine {
        &self.core.nat
    }

    /// Stop processing and release the virtual interface.
    pub async fn shutdown(self) {
        self.stop_processing().await;
        drop(self.core.take_reader());
        self.shutdown.cancel();

        let background = std::mem::take(
            &mut *self.background.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for task in background {
            if let Err(e) = task.await {
                log::error!("Relay task failed: {}", e);
            }
        }
        log::info!("Relay shut down");
    }
}
