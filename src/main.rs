//! litevpn-relay
//!
//! Runs the relay on a tun device and reads operator commands from stdin.
//!
//! Usage:
//!   UDP:    litevpn-relay --secret s3cret --port 1194
//!   Relay:  litevpn-relay --secret s3cret --transport relay --server-id my-server
//!   File:   litevpn-relay --config relay.toml

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use ipnet::Ipv4Net;
use litevpn_relay::config::{TransportConfig, DEFAULT_RELAY_URL, DEFAULT_UDP_PORT};
use litevpn_relay::device::{TunConfig, TunInterface};
use litevpn_relay::transport::{RelayTransport, Transport, UdpTransport};
use litevpn_relay::{Relay, RelayConfig};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Clone, Copy, ValueEnum)]
enum TransportKind {
    /// Plain UDP datagrams
    Udp,
    /// JSON-over-WebSocket message relay
    Relay,
}

#[derive(Parser)]
#[command(name = "litevpn-relay")]
#[command(version)]
#[command(about = "Relay IPv4 traffic between VPN clients and a tun device with userspace NAT")]
struct Args {
    /// TOML configuration file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Shared secret clients present in CONNECT
    #[arg(short, long)]
    secret: Option<String>,

    /// Transport to accept clients on
    #[arg(short, long)]
    transport: Option<TransportKind>,

    /// UDP port (udp transport)
    #[arg(short, long)]
    port: Option<u16>,

    /// Relay WebSocket URL (relay transport)
    #[arg(long)]
    relay_url: Option<String>,

    /// Identity to authenticate as on the relay (relay transport)
    #[arg(long)]
    server_id: Option<String>,

    #[arg(long)]
    mtu: Option<u16>,

    /// Virtual network clients are addressed from (e.g., 10.0.0.0/8)
    #[arg(long)]
    network: Option<Ipv4Net>,

    #[arg(long)]
    tun_name: Option<String>,

    #[arg(long)]
    tunnel_source: Option<Ipv4Addr>,

    /// Tun peer address, also used as the NAT external address
    #[arg(long)]
    tunnel_destination: Option<Ipv4Addr>,

    /// Route pushed to clients
    #[arg(long)]
    route: Option<Ipv4Net>,

    #[arg(long)]
    dns_server: Option<Ipv4Addr>,

    #[arg(long)]
    search_domain: Option<String>,

    /// First virtual IP handed to clients
    #[arg(long)]
    first_ip: Option<Ipv4Addr>,
}

impl Args {
    /// Apply command-line overrides on top of `config`.
    fn apply(self, mut config: RelayConfig) -> Result<RelayConfig> {
        if let Some(secret) = self.secret {
            config.shared_secret = secret;
        }

        let (current_port, current_url, current_id) = match &config.transport {
            TransportConfig::Udp { port } => (*port, None, None),
            TransportConfig::Relay { url, server_id } => {
                (DEFAULT_UDP_PORT, Some(url.clone()), Some(server_id.clone()))
            }
        };
        let kind = match (self.transport, &config.transport) {
            (Some(kind), _) => kind,
            (None, TransportConfig::Udp { .. }) => TransportKind::Udp,
            (None, TransportConfig::Relay { .. }) => TransportKind::Relay,
        };
        config.transport = match kind {
            TransportKind::Udp => TransportConfig::Udp {
                port: self.port.unwrap_or(current_port),
            },
            TransportKind::Relay => TransportConfig::Relay {
                url: self
                    .relay_url
                    .or(current_url)
                    .unwrap_or_else(|| DEFAULT_RELAY_URL.to_string()),
                server_id: self
                    .server_id
                    .or(current_id)
                    .context("--server-id is required for the relay transport")?,
            },
        };

        if let Some(mtu) = self.mtu {
            config.mtu = mtu;
        }
        if let Some(network) = self.network {
            config.network = network;
        }
        if let Some(tun_name) = self.tun_name {
            config.tun_name = tun_name;
        }
        if let Some(ip) = self.tunnel_source {
            config.tunnel_source = ip;
        }
        if let Some(ip) = self.tunnel_destination {
            config.tunnel_destination = ip;
        }
        if let Some(route) = self.route {
            config.route = route;
        }
        if let Some(dns) = self.dns_server {
            config.dns_server = Some(dns);
        }
        if let Some(domain) = self.search_domain {
            config.search_domain = Some(domain);
        }
        if let Some(ip) = self.first_ip {
            config.first_client_ip = ip;
        }
        Ok(config)
    }
}

fn build_transport(config: &TransportConfig) -> Arc<dyn Transport> {
    match config {
        TransportConfig::Udp { port } => Arc::new(UdpTransport::new(*port)),
        TransportConfig::Relay { url, server_id } => {
            Arc::new(RelayTransport::new(url.clone(), server_id.clone()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let base = match &args.config {
        Some(path) => RelayConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => RelayConfig::default(),
    };
    let config = args.apply(base)?;
    config.validate().context("Invalid configuration")?;

    let tun = TunInterface::create(TunConfig::from_relay_config(&config))
        .context("Failed to create tun device")?;
    log::info!("Using tun device {} (MTU {})", tun.name(), tun.mtu());
    let (reader, writer) = tun.split().context("Failed to split tun device")?;

    let transport = build_transport(&config.transport);
    let relay = Relay::new(&config, transport, reader, writer).context("Failed to build relay")?;
    relay.set_receive_connections(true);
    log::info!("NAT external address {}", relay.nat().external_ip());
    match relay.start_processing().await {
        Ok(()) => {}
        // A transport that is down now may come back; let the operator retry
        Err(e) if e.is_recoverable() => {
            log::warn!("Failed to start processing: {}; retry with startProcessConnections", e)
        }
        Err(e) => return Err(e).context("Failed to start processing"),
    }

    log::info!(
        "Commands: startReceiveConnections, stopReceiveConnections, \
         startProcessConnections, stopProcessConnections, stats, exit"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted");
                break;
            }
            line = lines.next_line() => line.context("Failed to read stdin")?,
        };
        let Some(line) = line else {
            // stdin closed; keep serving until interrupted
            tokio::signal::ctrl_c().await.context("Failed to wait for ctrl-c")?;
            break;
        };

        match line.trim() {
            "" => {}
            "startReceiveConnections" => relay.set_receive_connections(true),
            "stopReceiveConnections" => relay.set_receive_connections(false),
            "startProcessConnections" => match relay.start_processing().await {
                Ok(()) => {}
                Err(e) if e.is_recoverable() => log::warn!("Failed to start processing: {}", e),
                Err(e) => log::error!("Cannot start processing until the relay is restarted: {}", e),
            },
            "stopProcessConnections" => relay.stop_processing().await,
            "stats" => {
                println!("{}", relay.stats());
                println!(
                    "sessions={} leases={} nat_mappings={} processing={} receiving={}",
                    relay.registry().session_count(),
                    relay.registry().lease_count(),
                    relay.nat().active_mappings(),
                    relay.is_processing(),
                    relay.receive_connections()
                );
            }
            "exit" => break,
            other => log::warn!("Unknown command: {}", other),
        }
    }

    relay.shutdown().await;
    Ok(())
}
