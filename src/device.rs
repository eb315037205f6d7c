//! Virtual interface access.
//!
//! The relay only sees the two halves [`InterfaceReader`] and
//! [`InterfaceWriter`]. [`TunInterface`] provides them for a real tun device;
//! tests plug in channels instead. Dropping both halves closes the device.

use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use async_trait::async_trait;
use std::io;
use std::net::Ipv4Addr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tun::{AbstractDevice, Configuration, DeviceReader, DeviceWriter};

/// Read half of a virtual interface.
#[async_trait]
pub trait InterfaceReader: Send + 'static {
    /// Read one packet into `buf`, returning its length.
    async fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Write half of a virtual interface.
#[async_trait]
pub trait InterfaceWriter: Send + 'static {
    /// Write one complete packet.
    async fn write_packet(&mut self, packet: &[u8]) -> io::Result<()>;
}

/// TUN device configuration.
#[derive(Debug, Clone)]
pub struct TunConfig {
    /// Device name (e.g., "tun0"). If None, system assigns a name.
    pub name: Option<String>,
    /// Local point-to-point address.
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    /// Peer address; the relay's NAT external address.
    pub destination: Ipv4Addr,
    pub mtu: u16,
}

impl TunConfig {
    pub fn new(address: Ipv4Addr, netmask: Ipv4Addr, destination: Ipv4Addr) -> Self {
        Self {
            name: None,
            address,
            netmask,
            destination,
            mtu: crate::config::DEFAULT_MTU,
        }
    }

    /// Set the device name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the MTU.
    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    /// Derive the device settings from relay configuration.
    pub fn from_relay_config(config: &RelayConfig) -> Self {
        Self::new(
            config.tunnel_source,
            config.network.netmask(),
            config.tunnel_destination,
        )
        .with_name(config.tun_name.clone())
        .with_mtu(config.mtu)
    }
}

/// A tun device opened through the `tun` crate.
pub struct TunInterface {
    device: tun::AsyncDevice,
    name: String,
    mtu: u16,
}

impl TunInterface {
    /// Create and bring up a tun device.
    pub fn create(config: TunConfig) -> RelayResult<Self> {
        let mut tun_config = Configuration::default();

        tun_config
            .address(config.address)
            .netmask(config.netmask)
            .destination(config.destination)
            .mtu(config.mtu)
            .up();

        if let Some(ref name) = config.name {
            #[allow(deprecated)]
            tun_config.name(name);
        }

        #[cfg(target_os = "linux")]
        tun_config.platform_config(|platform_config| {
            platform_config.ensure_root_privileges(true);
        });

        let device = tun::create_as_async(&tun_config)
            .map_err(|e| RelayError::interface_with_source("Failed to create TUN device", e))?;

        let name = device
            .tun_name()
            .map_err(|e| RelayError::interface_with_source("Failed to get TUN name", e))?;

        log::info!(
            "Created TUN device: {} with {} -> {}",
            name,
            config.address,
            config.destination
        );

        Ok(Self {
            device,
            name,
            mtu: config.mtu,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Split the device into read and write halves.
    /// Note: The tun crate returns (writer, reader) order from split().
    pub fn split(self) -> RelayResult<(TunReader, TunWriter)> {
        let (writer, reader) = self
            .device
            .split()
            .map_err(|e| RelayError::interface_with_source("Failed to split TUN device", e))?;
        Ok((TunReader { reader }, TunWriter { writer }))
    }
}

/// Read half of a split tun device.
pub struct TunReader {
    reader: DeviceReader,
}

#[async_trait]
impl InterfaceReader for TunReader {
    async fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf).await
    }
}

/// Write half of a split tun device.
pub struct TunWriter {
    writer: DeviceWriter,
}

#[async_trait]
impl InterfaceWriter for TunWriter {
    async fn write_packet(&mut self, packet: &[u8]) -> io::Result<()> {
        self.writer.write_all(packet).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tun_config_from_relay_config() {
        let config = RelayConfig::with_secret("s");
        let tun = TunConfig::from_relay_config(&config);
        assert_eq!(tun.name.as_deref(), Some("tun0"));
        assert_eq!(tun.address, Ipv4Addr::new(10, 255, 255, 254));
        assert_eq!(tun.destination, Ipv4Addr::new(10, 255, 255, 255));
        assert_eq!(tun.netmask, Ipv4Addr::new(255, 0, 0, 0));
        assert_eq!(tun.mtu, 1400);
    }

    #[test]
    fn test_tun_config_builder() {
        let tun = TunConfig::new(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::new(10, 0, 0, 2),
        )
        .with_name("tun7")
        .with_mtu(1280);
        assert_eq!(tun.name.as_deref(), Some("tun7"));
        assert_eq!(tun.mtu, 1280);
    }
}
