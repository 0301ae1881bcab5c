#![forbid(unsafe_code)]

//! Forwards a virtual PCI device's bus traffic to a remote PCI endpoint.
//!
//! The local side ([`PciefwDevice`]) turns configuration, memory and I/O accesses into
//! [`pciefw_protocol`] requests over a [`Transport`]. The remote side may push its own
//! requests back (DMA writes, interrupts), which the host drains through
//! [`PciefwDevice::on_readable`].
//!
//! The link carries at most one transaction at a time. Reads block until their reply arrives.

pub mod bar;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod host;
pub mod session;
pub mod shadow;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use bar::{BarKind, BarTable, BarWindow};
pub use config::{PciefwConfig, TransportKind};
pub use device::{BarMmio, PciefwDevice};
pub use dispatch::DispatchOutcome;
pub use endpoint::{Endpoint, EndpointDevice, RamDevice};
pub use error::{AttachError, ConfigError, DmaError, TransactionError, TransportError};
pub use host::{DeviceHost, MmioHandler, MsiMessage, RemoteEventSink};
pub use session::Session;
pub use shadow::ShadowConfigSpace;
pub use transport::{DatagramTransport, LinkStream, StreamTransport, Transport};

pub use pciefw_protocol::{AccessWidth, Opcode};
