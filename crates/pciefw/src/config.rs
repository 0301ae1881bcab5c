use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use crate::error::ConfigError;

pub const DEFAULT_LOCAL_ADDR: &str = "127.0.0.1";
pub const DEFAULT_LOCAL_PORT: u16 = 42424;
pub const DEFAULT_REMOTE_ADDR: &str = "127.0.0.1";
pub const DEFAULT_REMOTE_PORT: u16 = 42425;

pub const ENV_LOCAL_ADDR: &str = "PCIEFW_LADDR";
pub const ENV_LOCAL_PORT: &str = "PCIEFW_LPORT";
pub const ENV_REMOTE_ADDR: &str = "PCIEFW_RADDR";
pub const ENV_REMOTE_PORT: &str = "PCIEFW_RPORT";
pub const ENV_TRANSPORT: &str = "PCIEFW_TRANSPORT";

/// Which socket kind carries the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// Reliable byte stream (TCP); frames are length-prefixed.
    #[default]
    Stream,
    /// Best-effort datagrams (UDP); one frame per datagram.
    Datagram,
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stream" | "tcp" => Ok(Self::Stream),
            "datagram" | "udp" => Ok(Self::Datagram),
            _ => Err(ConfigError::UnknownTransport(s.to_owned())),
        }
    }
}

/// Host-supplied link configuration.
///
/// The local address/port is only bound by the datagram transport; stream connections originate
/// from an ephemeral port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciefwConfig {
    pub local_addr: String,
    pub local_port: u16,
    pub remote_addr: String,
    pub remote_port: u16,
    pub transport: TransportKind,
}

impl Default for PciefwConfig {
    fn default() -> Self {
        Self {
            local_addr: DEFAULT_LOCAL_ADDR.to_owned(),
            local_port: DEFAULT_LOCAL_PORT,
            remote_addr: DEFAULT_REMOTE_ADDR.to_owned(),
            remote_port: DEFAULT_REMOTE_PORT,
            transport: TransportKind::default(),
        }
    }
}

impl PciefwConfig {
    /// Defaults overridden by `PCIEFW_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for the `PCIEFW_*` keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(addr) = lookup(ENV_LOCAL_ADDR) {
            config.local_addr = addr;
        }
        if let Some(port) = lookup(ENV_LOCAL_PORT) {
            config.local_port = parse_port(ENV_LOCAL_PORT, &port)?;
        }
        if let Some(addr) = lookup(ENV_REMOTE_ADDR) {
            config.remote_addr = addr;
        }
        if let Some(port) = lookup(ENV_REMOTE_PORT) {
            config.remote_port = parse_port(ENV_REMOTE_PORT, &port)?;
        }
        if let Some(kind) = lookup(ENV_TRANSPORT) {
            config.transport = kind.parse()?;
        }
        Ok(config)
    }

    pub fn local_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        resolve(&self.local_addr, self.local_port)
    }

    pub fn remote_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        resolve(&self.remote_addr, self.remote_port)
    }
}

/// Parses a port string the way the host option layer hands them over.
pub fn parse_port(name: &'static str, value: &str) -> Result<u16, ConfigError> {
    value
        .trim()
        .parse::<u16>()
        .map_err(|_| ConfigError::InvalidPort {
            name,
            value: value.to_owned(),
        })
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(|source| ConfigError::Resolve {
            host: host.to_owned(),
            port,
            source,
        })?;
    addrs.next().ok_or_else(|| ConfigError::NoAddress {
        host: host.to_owned(),
        port,
    })
}
