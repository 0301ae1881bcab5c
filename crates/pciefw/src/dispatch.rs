//! Remote event dispatcher.
//!
//! The remote endpoint initiates its own transactions: DMA writes into local memory and
//! interrupts. The host calls [`Session::dispatch_one`] whenever the link becomes readable; each
//! call handles at most one message and never blocks.

use pciefw_protocol::{classify_frame_len, decode_request, FrameKind, Opcode, Request};
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::host::RemoteEventSink;
use crate::session::Session;
use crate::transport::Transport;

/// What a single dispatcher invocation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Nothing was pending.
    Idle,
    Dispatched(Opcode),
    /// A well-formed request with no local effect (unimplemented or unknown opcode).
    Ignored(Opcode),
    /// A reply arrived with no read outstanding; it was dropped.
    StrayReply,
    /// Receiving or decoding failed; the message (if any) was dropped.
    Failed,
}

impl<T: Transport> Session<T> {
    /// Handles at most one remote-initiated message.
    ///
    /// Requests set aside while a read was waiting for its reply are handled first, oldest first.
    /// Otherwise the link is polled with a zero timeout and, if readable, exactly one frame is
    /// received.
    pub fn dispatch_one<H: RemoteEventSink + ?Sized>(&mut self, sink: &mut H) -> DispatchOutcome {
        if let Some(frame) = self.pop_queued_event() {
            return match decode_request(&frame) {
                Ok(req) => dispatch_request(&req, sink),
                Err(err) => {
                    warn!(%err, "dropping malformed queued remote request");
                    DispatchOutcome::Failed
                }
            };
        }

        match self.transport_mut().poll_readable() {
            Ok(true) => {}
            Ok(false) => return DispatchOutcome::Idle,
            Err(err) => {
                warn!(%err, "failed to poll pciefw link");
                return DispatchOutcome::Failed;
            }
        }

        match self.recv_event(sink) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(%err, "failed to receive remote request");
                DispatchOutcome::Failed
            }
        }
    }

    fn recv_event<H: RemoteEventSink + ?Sized>(
        &mut self,
        sink: &mut H,
    ) -> Result<DispatchOutcome, TransportError> {
        let Some(len) = self.recv_frame()? else {
            return Ok(DispatchOutcome::Idle);
        };
        match classify_frame_len(len)? {
            FrameKind::Reply => {
                warn!("dropping reply received with no read outstanding");
                Ok(DispatchOutcome::StrayReply)
            }
            FrameKind::Request => Ok(dispatch_request(&decode_request(self.frame(len))?, sink)),
        }
    }
}

/// Applies one remote-initiated request to `sink`.
pub fn dispatch_request<H: RemoteEventSink + ?Sized>(
    req: &Request<'_>,
    sink: &mut H,
) -> DispatchOutcome {
    match req.opcode {
        Opcode::WriteMem => {
            debug!(addr = req.addr, len = req.payload.len(), "remote DMA write");
            if let Err(err) = sink.dma_write(req.addr, req.payload) {
                warn!(%err, "remote DMA write failed");
            }
            DispatchOutcome::Dispatched(Opcode::WriteMem)
        }
        Opcode::Msi => {
            debug!("remote MSI");
            sink.signal_msi(0);
            DispatchOutcome::Dispatched(Opcode::Msi)
        }
        opcode => {
            debug!(%opcode, "ignoring unimplemented remote request");
            DispatchOutcome::Ignored(opcode)
        }
    }
}
