use std::io::{self, Read, Write};
use std::net::TcpStream;

use pciefw_protocol::{frame_len, DecodeError, FRAME_HEADER_LEN};

use super::Transport;
use crate::error::TransportError;

/// A connected byte stream that can report readability.
pub trait LinkStream: Read + Write {
    /// Returns whether a read would make progress right now (data or end-of-stream pending).
    fn poll_readable(&mut self) -> io::Result<bool>;

    /// Blocks until a read would make progress.
    fn wait_readable(&mut self) -> io::Result<()>;

    /// Puts the stream back into blocking mode after a failed [`Self::poll_readable`].
    fn restore_blocking(&mut self) -> io::Result<()> {
        Ok(())
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> Option<std::os::fd::RawFd> {
        None
    }
}

impl LinkStream for TcpStream {
    fn poll_readable(&mut self) -> io::Result<bool> {
        self.set_nonblocking(true)?;
        let mut probe = [0u8; 1];
        let res = self.peek(&mut probe);
        // A failed restore is reported; the transport retries it before the next blocking call.
        self.set_nonblocking(false)?;
        match res {
            // `Ok(0)` is end-of-stream; the following read reports it.
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn wait_readable(&mut self) -> io::Result<()> {
        let mut probe = [0u8; 1];
        loop {
            match self.peek(&mut probe) {
                Ok(_) => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    fn restore_blocking(&mut self) -> io::Result<()> {
        self.set_nonblocking(false)
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> Option<std::os::fd::RawFd> {
        use std::os::fd::AsRawFd;
        Some(self.as_raw_fd())
    }
}

/// Length-prefixed framing over a reliable byte stream.
#[derive(Debug)]
pub struct StreamTransport<S> {
    stream: S,
    /// Set while a readability poll may have left the stream non-blocking.
    restore_pending: bool,
}

impl<S> StreamTransport<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            restore_pending: false,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: LinkStream> StreamTransport<S> {
    fn ensure_blocking(&mut self) -> Result<(), TransportError> {
        if self.restore_pending {
            self.stream.restore_blocking()?;
            self.restore_pending = false;
        }
        Ok(())
    }

    fn recv_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        self.stream.read_exact(buf).map_err(|err| {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                TransportError::Closed
            } else {
                TransportError::Io(err)
            }
        })
    }
}

impl<S: LinkStream> Transport for StreamTransport<S> {
    fn send_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.ensure_blocking()?;
        self.stream.write_all(frame)?;
        self.stream.flush()?;
        Ok(())
    }

    fn recv_frame(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TransportError> {
        self.ensure_blocking()?;
        let mut header = [0u8; FRAME_HEADER_LEN];
        self.recv_exact(&mut header)?;

        let len = frame_len(header);
        if len > buf.len() {
            return Err(TransportError::FrameTooLarge {
                len,
                capacity: buf.len(),
            });
        }
        if len < FRAME_HEADER_LEN {
            return Err(DecodeError::InvalidFrameLen { len }.into());
        }

        buf[..FRAME_HEADER_LEN].copy_from_slice(&header);
        self.recv_exact(&mut buf[FRAME_HEADER_LEN..len])?;
        Ok(Some(len))
    }

    fn poll_readable(&mut self) -> Result<bool, TransportError> {
        self.ensure_blocking()?;
        self.restore_pending = true;
        let ready = self.stream.poll_readable()?;
        self.restore_pending = false;
        Ok(ready)
    }

    fn wait_readable(&mut self) -> Result<(), TransportError> {
        self.ensure_blocking()?;
        Ok(self.stream.wait_readable()?)
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> Option<std::os::fd::RawFd> {
        self.stream.raw_fd()
    }
}
