use std::io;
use std::net::UdpSocket;

use pciefw_protocol::{frame_len, DecodeError, FRAME_HEADER_LEN};
use tracing::trace;

use super::Transport;
use crate::error::TransportError;

/// One frame per datagram over a connected UDP socket.
///
/// A connected UDP socket reports ICMP port-unreachable for an earlier datagram as
/// `ConnectionRefused` on a later call. That is not a link failure: receives treat it as
/// "nothing received" and sends are retried.
#[derive(Debug)]
pub struct DatagramTransport {
    socket: UdpSocket,
    /// Set while a readability poll may have left the socket non-blocking.
    restore_pending: bool,
}

impl DatagramTransport {
    /// `socket` must already be connected to the remote endpoint.
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            restore_pending: false,
        }
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    fn ensure_blocking(&mut self) -> Result<(), TransportError> {
        if self.restore_pending {
            self.socket.set_nonblocking(false)?;
            self.restore_pending = false;
        }
        Ok(())
    }
}

fn is_delivery_failure(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::ConnectionRefused
}

impl Transport for DatagramTransport {
    fn send_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.ensure_blocking()?;
        loop {
            match self.socket.send(frame) {
                Ok(n) if n == frame.len() => return Ok(()),
                Ok(n) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("short datagram send: {n} of {} bytes", frame.len()),
                    )
                    .into())
                }
                Err(err) if is_delivery_failure(&err) => {
                    trace!("absorbing stale delivery failure before send");
                    continue;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn recv_frame(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TransportError> {
        self.ensure_blocking()?;
        let n = match self.socket.recv(buf) {
            Ok(n) => n,
            Err(err) if is_delivery_failure(&err) => {
                trace!("absorbing delivery failure on receive");
                return Ok(None);
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        if n < FRAME_HEADER_LEN {
            return Err(DecodeError::TooShort {
                len: n,
                min: FRAME_HEADER_LEN,
            }
            .into());
        }
        let len = frame_len([buf[0], buf[1]]);
        if len > buf.len() {
            return Err(TransportError::FrameTooLarge {
                len,
                capacity: buf.len(),
            });
        }
        if len != n {
            return Err(TransportError::DatagramLenMismatch {
                declared: len,
                received: n,
            });
        }
        Ok(Some(n))
    }

    fn poll_readable(&mut self) -> Result<bool, TransportError> {
        self.ensure_blocking()?;
        self.restore_pending = true;
        self.socket.set_nonblocking(true)?;
        let mut probe = [0u8; FRAME_HEADER_LEN];
        let res = self.socket.peek(&mut probe);
        self.socket.set_nonblocking(false)?;
        self.restore_pending = false;
        match res {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(err) if is_delivery_failure(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn wait_readable(&mut self) -> Result<(), TransportError> {
        self.ensure_blocking()?;
        let mut probe = [0u8; FRAME_HEADER_LEN];
        loop {
            match self.socket.peek(&mut probe) {
                Ok(_) => return Ok(()),
                Err(err) if is_delivery_failure(&err) => continue,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> Option<std::os::fd::RawFd> {
        use std::os::fd::AsRawFd;
        Some(self.socket.as_raw_fd())
    }
}
