//! In-memory link for unit tests.

use std::collections::VecDeque;
use std::io;

use pciefw_protocol::{decode_request, encode_reply};

use crate::endpoint::{service_request, RamDevice};
use crate::error::TransportError;
use crate::transport::Transport;

/// Records every sent frame and hands out queued inbound frames.
///
/// With a `remote` attached, each sent request is serviced immediately and its reply (if any)
/// appended to `inbound`, unless `drop_replies` says to discard it.
#[derive(Debug, Default)]
pub struct MockTransport {
    pub sent: Vec<Vec<u8>>,
    pub inbound: VecDeque<Vec<u8>>,
    pub recv_calls: usize,
    pub wait_calls: usize,
    pub fail_send: bool,
    pub drop_replies: usize,
    pub remote: Option<RamDevice>,
}

impl MockTransport {
    pub fn with_remote(remote: RamDevice) -> Self {
        Self {
            remote: Some(remote),
            ..Default::default()
        }
    }
}

impl Transport for MockTransport {
    fn send_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if self.fail_send {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock send failure").into());
        }
        self.sent.push(frame.to_vec());

        if let Some(remote) = self.remote.as_mut() {
            let req = decode_request(frame)?;
            if let Some(reply) = service_request(remote, &req) {
                if self.drop_replies > 0 {
                    self.drop_replies -= 1;
                } else {
                    self.inbound.push_back(encode_reply(&reply).to_vec());
                }
            }
        }
        Ok(())
    }

    fn recv_frame(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TransportError> {
        self.recv_calls += 1;
        let frame = self.inbound.pop_front().ok_or(TransportError::Closed)?;
        buf[..frame.len()].copy_from_slice(&frame);
        Ok(Some(frame.len()))
    }

    fn poll_readable(&mut self) -> Result<bool, TransportError> {
        Ok(!self.inbound.is_empty())
    }

    fn wait_readable(&mut self) -> Result<(), TransportError> {
        self.wait_calls += 1;
        if self.inbound.is_empty() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}
