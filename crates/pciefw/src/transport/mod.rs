//! Frame transports.
//!
//! A transport moves whole frames (as defined by the wire codec) between the device and the
//! remote endpoint. Two variants exist:
//! - [`StreamTransport`]: reliable byte stream. Frames are read header-first, then exactly
//!   `size - 2` more bytes; partial reads are accumulated.
//! - [`DatagramTransport`]: one frame per datagram. Delivery-failure notifications surfaced by
//!   the socket are absorbed as "nothing received".

mod datagram;
mod stream;

pub use datagram::DatagramTransport;
pub use stream::{LinkStream, StreamTransport};

use std::net::{TcpStream, UdpSocket};

use tracing::info;

use crate::config::{PciefwConfig, TransportKind};
use crate::error::{AttachError, TransportError};

pub trait Transport {
    /// Sends one complete frame, or fails.
    fn send_frame(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Receives one complete frame into the front of `buf` and returns its length.
    ///
    /// `Ok(None)` means nothing was received and the caller may retry; only the datagram
    /// transport produces it.
    fn recv_frame(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TransportError>;

    /// Zero-timeout readability check. Never blocks.
    fn poll_readable(&mut self) -> Result<bool, TransportError>;

    /// Blocks, without timeout, until the link is readable.
    fn wait_readable(&mut self) -> Result<(), TransportError>;

    /// Raw descriptor for registering the link with a host event loop.
    #[cfg(unix)]
    fn raw_fd(&self) -> Option<std::os::fd::RawFd> {
        None
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        <T as Transport>::send_frame(&mut **self, frame)
    }

    fn recv_frame(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TransportError> {
        <T as Transport>::recv_frame(&mut **self, buf)
    }

    fn poll_readable(&mut self) -> Result<bool, TransportError> {
        <T as Transport>::poll_readable(&mut **self)
    }

    fn wait_readable(&mut self) -> Result<(), TransportError> {
        <T as Transport>::wait_readable(&mut **self)
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> Option<std::os::fd::RawFd> {
        <T as Transport>::raw_fd(&**self)
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        <T as Transport>::send_frame(&mut **self, frame)
    }

    fn recv_frame(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TransportError> {
        <T as Transport>::recv_frame(&mut **self, buf)
    }

    fn poll_readable(&mut self) -> Result<bool, TransportError> {
        <T as Transport>::poll_readable(&mut **self)
    }

    fn wait_readable(&mut self) -> Result<(), TransportError> {
        <T as Transport>::wait_readable(&mut **self)
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> Option<std::os::fd::RawFd> {
        <T as Transport>::raw_fd(&**self)
    }
}

/// Opens the link described by `config`.
pub fn connect(config: &PciefwConfig) -> Result<Box<dyn Transport + Send>, AttachError> {
    let remote = config.remote_socket_addr()?;
    match config.transport {
        TransportKind::Stream => {
            let stream = TcpStream::connect(remote).map_err(|source| AttachError::Connect {
                addr: remote,
                source,
            })?;
            // Best-effort.
            let _ = stream.set_nodelay(true);
            info!(%remote, "pciefw stream link connected");
            Ok(Box::new(StreamTransport::new(stream)))
        }
        TransportKind::Datagram => {
            let local = config.local_socket_addr()?;
            let socket = UdpSocket::bind(local).map_err(|source| AttachError::Bind {
                addr: local,
                source,
            })?;
            socket
                .connect(remote)
                .map_err(|source| AttachError::Connect {
                    addr: remote,
                    source,
                })?;
            info!(%local, %remote, "pciefw datagram link connected");
            Ok(Box::new(DatagramTransport::new(socket)))
        }
    }
}
