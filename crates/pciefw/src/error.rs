use pciefw_protocol::{DecodeError, EncodeError};
use thiserror::Error;

/// Link-level failures. Any of these aborts the send or receive in progress.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("link I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("link closed by remote endpoint")]
    Closed,

    #[error("framing error: {0}")]
    Frame(#[from] DecodeError),

    #[error("frame of {len} bytes does not fit receive buffer of {capacity} bytes")]
    FrameTooLarge { len: usize, capacity: usize },

    #[error("datagram carries {received} bytes but declares {declared}")]
    DatagramLenMismatch { declared: usize, received: usize },
}

/// Failure of a single forwarded bus access.
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to encode request: {0}")]
    Encode(#[from] EncodeError),
}

/// Invalid or unresolvable host configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {name} {value:?}: expected a port number")]
    InvalidPort { name: &'static str, value: String },

    #[error("unknown transport {0:?} (expected `stream` or `datagram`)")]
    UnknownTransport(String),

    #[error("failed to resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("{host}:{port} resolved to no addresses")]
    NoAddress { host: String, port: u16 },
}

/// Device attach failed; no device was created.
#[derive(Debug, Error)]
pub enum AttachError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to connect to remote endpoint {addr}: {source}")]
    Connect {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to bind local address {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// A host could not apply a remote-initiated DMA write.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("DMA write of {len} bytes at 0x{addr:x} failed: {reason}")]
pub struct DmaError {
    pub addr: u64,
    pub len: usize,
    pub reason: String,
}
