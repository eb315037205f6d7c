//! Relay configuration.
//!
//! Loaded from an optional TOML file; command-line flags override individual
//! values afterwards. Call [`RelayConfig::validate`] before use.

use crate::error::{RelayError, RelayResult};
use crate::packet::{ConnectionParams, MAX_PACKET_SIZE};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

/// Default MTU pushed to clients and set on the tun device.
pub const DEFAULT_MTU: u16 = 1400;

/// Default UDP listen port.
pub const DEFAULT_UDP_PORT: u16 = 1194;

/// Default message relay endpoint.
pub const DEFAULT_RELAY_URL: &str = "wss://cloud.achex.ca";

/// Default virtual network.
pub const DEFAULT_NETWORK: Ipv4Net = Ipv4Net::new_assert(Ipv4Addr::new(10, 0, 0, 0), 8);

/// Default tun point-to-point local address.
pub const DEFAULT_TUNNEL_SOURCE: Ipv4Addr = Ipv4Addr::new(10, 255, 255, 254);

/// Default tun peer address. NAT uses it as the external address.
pub const DEFAULT_TUNNEL_DESTINATION: Ipv4Addr = Ipv4Addr::new(10, 255, 255, 255);

/// Default route pushed to clients (everything).
pub const DEFAULT_ROUTE: Ipv4Net = Ipv4Net::new_assert(Ipv4Addr::UNSPECIFIED, 0);

/// Default DNS server pushed to clients.
pub const DEFAULT_DNS_SERVER: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

/// Default first address handed to a client.
pub const DEFAULT_FIRST_CLIENT_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

/// Default tun device name.
pub const DEFAULT_TUN_NAME: &str = "tun0";

/// Default external NAT port range (inclusive).
pub const DEFAULT_NAT_PORT_RANGE: (u16, u16) = (1024, 49151);

/// Default session idle timeout.
pub const DEFAULT_SESSION_IDLE_SECS: u64 = 120;

/// Default NAT mapping idle timeout.
pub const DEFAULT_NAT_IDLE_SECS: u64 = 65;

/// Default interval between expiry sweeps.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5;

/// Default capacity of the channel feeding the tun writer task.
pub const DEFAULT_IFACE_WRITER_CHANNEL_SIZE: usize = 4096;

/// Which transport carries client traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Plain UDP datagrams on `0.0.0.0:port`.
    Udp {
        #[serde(default = "default_udp_port")]
        port: u16,
    },
    /// JSON-over-WebSocket message relay.
    Relay {
        #[serde(default = "default_relay_url")]
        url: String,
        /// Identity the server authenticates as on the relay.
        server_id: String,
    },
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Udp {
            port: DEFAULT_UDP_PORT,
        }
    }
}

/// Relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Admission credential clients send in CONNECT.
    #[serde(default)]
    pub shared_secret: String,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// Virtual network clients are addressed from.
    #[serde(default = "default_network")]
    pub network: Ipv4Net,

    #[serde(default = "default_tunnel_source")]
    pub tunnel_source: Ipv4Addr,

    /// Tun peer address; also the NAT external address.
    #[serde(default = "default_tunnel_destination")]
    pub tunnel_destination: Ipv4Addr,

    #[serde(default = "default_tun_name")]
    pub tun_name: String,

    /// Route pushed to clients.
    #[serde(default = "default_route")]
    pub route: Ipv4Net,

    #[serde(default = "default_dns_server")]
    pub dns_server: Option<Ipv4Addr>,

    #[serde(default)]
    pub search_domain: Option<String>,

    #[serde(default = "default_first_client_ip")]
    pub first_client_ip: Ipv4Addr,

    /// External NAT ports, inclusive.
    #[serde(default = "default_nat_port_range")]
    pub nat_port_range: (u16, u16),

    #[serde(default = "default_session_idle_secs")]
    pub session_idle_timeout_secs: u64,

    #[serde(default = "default_nat_idle_secs")]
    pub nat_idle_timeout_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_iface_writer_channel_size")]
    pub iface_writer_channel_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            shared_secret: String::new(),
            transport: TransportConfig::default(),
            mtu: DEFAULT_MTU,
            network: DEFAULT_NETWORK,
            tunnel_source: DEFAULT_TUNNEL_SOURCE,
            tunnel_destination: DEFAULT_TUNNEL_DESTINATION,
            tun_name: DEFAULT_TUN_NAME.to_string(),
            route: DEFAULT_ROUTE,
            dns_server: Some(DEFAULT_DNS_SERVER),
            search_domain: None,
            first_client_ip: DEFAULT_FIRST_CLIENT_IP,
            nat_port_range: DEFAULT_NAT_PORT_RANGE,
            session_idle_timeout_secs: DEFAULT_SESSION_IDLE_SECS,
            nat_idle_timeout_secs: DEFAULT_NAT_IDLE_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            iface_writer_channel_size: DEFAULT_IFACE_WRITER_CHANNEL_SIZE,
        }
    }
}

impl RelayConfig {
    /// Create a configuration with defaults and the given secret.
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            shared_secret: secret.into(),
            ..Self::default()
        }
    }

    /// Load a configuration from a TOML file.
    pub fn load(path: &Path) -> RelayResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RelayError::config_with_source(format!("Failed to read {}", path.display()), e)
        })?;
        Self::from_toml(&content)
    }

    /// Parse a configuration from TOML text.
    pub fn from_toml(content: &str) -> RelayResult<Self> {
        toml::from_str(content)
            .map_err(|e| RelayError::config_with_source("Failed to parse config", e))
    }

    /// Check values for consistency.
    pub fn validate(&self) -> RelayResult<()> {
        if self.shared_secret.is_empty() {
            return Err(RelayError::config("shared_secret must not be empty"));
        }
        if self.shared_secret.contains(';') {
            return Err(RelayError::config("shared_secret must not contain ';'"));
        }
        if self.mtu < 576 || self.mtu as usize > MAX_PACKET_SIZE {
            return Err(RelayError::config(format!(
                "mtu {} out of range 576..={}",
                self.mtu, MAX_PACKET_SIZE
            )));
        }
        if self.tunnel_source == self.tunnel_destination {
            return Err(RelayError::config(
                "tunnel_source and tunnel_destination must differ",
            ));
        }

        let (start, end) = self.nat_port_range;
        if start == 0 || start > end {
            return Err(RelayError::config(format!(
                "invalid nat_port_range {}..={}",
                start, end
            )));
        }

        if self.session_idle_timeout_secs == 0
            || self.nat_idle_timeout_secs == 0
            || self.sweep_interval_secs == 0
        {
            return Err(RelayError::config("timeouts and sweep interval must be non-zero"));
        }
        if self.iface_writer_channel_size == 0 {
            return Err(RelayError::config("iface_writer_channel_size must be non-zero"));
        }

        if let TransportConfig::Relay { ref url, ref server_id } = self.transport {
            if url.is_empty() || server_id.is_empty() {
                return Err(RelayError::config("relay transport needs url and server_id"));
            }
        }

        let (first, last) = self.client_ip_range()?;
        for reserved in [self.tunnel_source, self.tunnel_destination] {
            let reserved = u32::from(reserved);
            if (first..=last).contains(&reserved) {
                return Err(RelayError::config(format!(
                    "tunnel address {} falls inside the client pool {}..={}",
                    Ipv4Addr::from(reserved),
                    Ipv4Addr::from(first),
                    Ipv4Addr::from(last)
                )));
            }
        }
        Ok(())
    }

    /// First and last client address (inclusive) as integers.
    ///
    /// The pool ends at the last host of the network, stepping down past the
    /// tunnel addresses when they sit at the top.
    pub fn client_ip_range(&self) -> RelayResult<(u32, u32)> {
        let network = u32::from(self.network.network());
        let broadcast = u32::from(self.network.broadcast());
        let first = u32::from(self.first_client_ip);

        if self.network.prefix_len() > 30 {
            return Err(RelayError::config(format!(
                "network {} is too small for clients",
                self.network
            )));
        }
        if first <= network || first >= broadcast {
            return Err(RelayError::config(format!(
                "first_client_ip {} is not a host of {}",
                self.first_client_ip, self.network
            )));
        }

        let reserved = [
            u32::from(self.tunnel_source),
            u32::from(self.tunnel_destination),
        ];
        let mut last = broadcast - 1;
        while last >= first && reserved.contains(&last) {
            last -= 1;
        }
        if last < first {
            return Err(RelayError::IpAssignment(format!(
                "no client addresses left in {}",
                self.network
            )));
        }
        Ok((first, last))
    }

    /// The parameter template sent to clients.
    pub fn connection_params(&self) -> ConnectionParams {
        ConnectionParams {
            mtu: self.mtu,
            address_prefix_len: self.network.prefix_len(),
            route: self.route,
            dns_server: self.dns_server,
            search_domain: self.search_domain.clone(),
        }
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    pub fn nat_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.nat_idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

// Default value functions for serde
fn default_mtu() -> u16 {
    DEFAULT_MTU
}

fn default_udp_port() -> u16 {
    DEFAULT_UDP_PORT
}

fn default_relay_url() -> String {
    DEFAULT_RELAY_URL.to_string()
}

fn default_network() -> Ipv4Net {
    DEFAULT_NETWORK
}

fn default_tunnel_source() -> Ipv4Addr {
    DEFAULT_TUNNEL_SOURCE
}

fn default_tunnel_destination() -> Ipv4Addr {
    DEFAULT_TUNNEL_DESTINATION
}

fn default_tun_name() -> String {
    DEFAULT_TUN_NAME.to_string()
}

fn default_route() -> Ipv4Net {
    DEFAULT_ROUTE
}

fn default_dns_server() -> Option<Ipv4Addr> {
    Some(DEFAULT_DNS_SERVER)
}

fn default_first_client_ip() -> Ipv4Addr {
    DEFAULT_FIRST_CLIENT_IP
}

fn default_nat_port_range() -> (u16, u16) {
    DEFAULT_NAT_PORT_RANGE
}

fn default_session_idle_secs() -> u64 {
    DEFAULT_SESSION_IDLE_SECS
}

fn default_nat_idle_secs() -> u64 {
    DEFAULT_NAT_IDLE_SECS
}

fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}

fn default_iface_writer_channel_size() -> usize {
    DEFAULT_IFACE_WRITER_CHANNEL_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = RelayConfig::with_secret("secret1");
        config.validate().unwrap();
        assert_eq!(config.mtu, 1400);
        assert_eq!(config.network.to_string(), "10.0.0.0/8");
        assert_eq!(config.nat_port_range, (1024, 49151));
    }

    #[test]
    fn test_client_range_skips_tunnel_addresses() {
        let config = RelayConfig::with_secret("s");
        let (first, last) = config.client_ip_range().unwrap();
        assert_eq!(Ipv4Addr::from(first), Ipv4Addr::new(10, 0, 0, 1));
        // .255 is broadcast, .254 is the tunnel source
        assert_eq!(Ipv4Addr::from(last), Ipv4Addr::new(10, 255, 255, 253));
    }

    #[test]
    fn test_reserved_inside_pool_rejected() {
        let mut config = RelayConfig::with_secret("s");
        config.tunnel_source = Ipv4Addr::new(10, 0, 0, 5);
        assert!(matches!(config.validate(), Err(RelayError::Config(_))));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(RelayConfig::default().validate().is_err());
        assert!(RelayConfig::with_secret("a;b").validate().is_err());

        let mut config = RelayConfig::with_secret("s");
        config.first_client_ip = Ipv4Addr::new(192, 168, 0, 1);
        assert!(config.validate().is_err());

        let mut config = RelayConfig::with_secret("s");
        config.nat_port_range = (5000, 4000);
        assert!(config.validate().is_err());

        let mut config = RelayConfig::with_secret("s");
        config.mtu = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml() {
        let config = RelayConfig::from_toml(
            r#"
            shared_secret = "hunter2"
            mtu = 1300
            network = "172.16.0.0/12"
            first_client_ip = "172.16.0.10"
            tunnel_source = "172.31.255.254"
            tunnel_destination = "172.31.255.255"
            search_domain = "lan"

            [transport]
            type = "relay"
            server_id = "vpn-server"
            "#,
        )
        .unwrap();

        config.validate().unwrap();
        assert_eq!(config.mtu, 1300);
        assert_eq!(config.dns_server, Some(DEFAULT_DNS_SERVER));
        assert_eq!(
            config.transport,
            TransportConfig::Relay {
                url: DEFAULT_RELAY_URL.to_string(),
                server_id: "vpn-server".to_string(),
            }
        );

        let params = config.connection_params();
        assert_eq!(params.address_prefix_len, 12);
        assert_eq!(params.search_domain.as_deref(), Some("lan"));
    }

    #[test]
    fn test_from_toml_rejects_garbage() {
        assert!(matches!(
            RelayConfig::from_toml("mtu = \"big\""),
            Err(RelayError::Config(_))
        ));
    }
}
