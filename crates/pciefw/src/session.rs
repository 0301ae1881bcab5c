//! Transaction engine.
//!
//! A [`Session`] owns the link, a single max-size message buffer and the discovered BAR table.
//! Every operation takes `&mut self`, so at most one transaction is ever in flight.
//!
//! Writes are fire-and-forget: the request is sent and nothing is received. Reads send a request
//! with an empty payload and then block, without timeout, until the reply arrives.
//!
//! The protocol carries no transaction identifier. Replies are matched by position: the next
//! reply on the link answers the outstanding read. The remote endpoint may still push its own
//! requests (DMA writes, interrupts) while a read is outstanding; those are recognised by their
//! frame length, set aside in a FIFO and handed to the dispatcher later, in arrival order.
//! Nothing on the link signals readiness for queued events: after any read, the host must check
//! [`Session::has_queued_events`] (or call `PciefwDevice::dispatch_queued`).
//!
//! A read only fails on link or framing errors. A well-framed but undecodable request is dropped
//! and the wait continues, so the next reply still answers this read.

use std::collections::VecDeque;

use pciefw_protocol::{
    classify_frame_len, decode_reply, decode_request, encode_request, AccessWidth, FrameKind,
    Opcode, Reply, Request, MAX_MESSAGE_LEN,
};
use tracing::{debug, trace, warn};

use crate::bar::BarTable;
use crate::error::{TransactionError, TransportError};
use crate::transport::Transport;

/// Upper bound on remote requests set aside while reads wait for replies. Past it the oldest
/// event is dropped.
pub const MAX_QUEUED_EVENTS: usize = 1024;

pub struct Session<T> {
    transport: T,
    buf: Box<[u8]>,
    bars: BarTable,
    queued: VecDeque<Vec<u8>>,
}

impl<T> Session<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            buf: vec![0u8; MAX_MESSAGE_LEN].into_boxed_slice(),
            bars: BarTable::default(),
            queued: VecDeque::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn bars(&self) -> &BarTable {
        &self.bars
    }

    pub(crate) fn set_bars(&mut self, bars: BarTable) {
        self.bars = bars;
    }

    /// Whether remote requests received during a read are waiting for the dispatcher.
    pub fn has_queued_events(&self) -> bool {
        !self.queued.is_empty()
    }

    pub(crate) fn pop_queued_event(&mut self) -> Option<Vec<u8>> {
        self.queued.pop_front()
    }

    /// The first `len` bytes of the message buffer, as filled by the last receive.
    pub(crate) fn frame(&self, len: usize) -> &[u8] {
        &self.buf[..len]
    }

    /// Tears the session down, releasing the buffer and returning the link.
    pub fn into_transport(self) -> T {
        self.transport
    }
}

impl<T: Transport> Session<T> {
    pub fn write_config(
        &mut self,
        offset: u64,
        width: AccessWidth,
        value: u64,
    ) -> Result<(), TransactionError> {
        self.post(Opcode::WriteConfig, 0, offset, width, value)
    }

    pub fn read_config(&mut self, offset: u64, width: AccessWidth) -> Result<u64, TransactionError> {
        self.transact(Opcode::ReadConfig, 0, offset, width)
    }

    pub fn write_mem(
        &mut self,
        bar: u8,
        addr: u64,
        width: AccessWidth,
        value: u64,
    ) -> Result<(), TransactionError> {
        self.post(Opcode::WriteMem, bar, addr, width, value)
    }

    pub fn read_mem(
        &mut self,
        bar: u8,
        addr: u64,
        width: AccessWidth,
    ) -> Result<u64, TransactionError> {
        self.transact(Opcode::ReadMem, bar, addr, width)
    }

    pub fn write_io(
        &mut self,
        bar: u8,
        addr: u64,
        width: AccessWidth,
        value: u64,
    ) -> Result<(), TransactionError> {
        self.post(Opcode::WriteIo, bar, addr, width, value)
    }

    pub fn read_io(
        &mut self,
        bar: u8,
        addr: u64,
        width: AccessWidth,
    ) -> Result<u64, TransactionError> {
        self.transact(Opcode::ReadIo, bar, addr, width)
    }

    /// Sends a write request and returns as soon as it is on the link.
    fn post(
        &mut self,
        opcode: Opcode,
        bar: u8,
        addr: u64,
        width: AccessWidth,
        value: u64,
    ) -> Result<(), TransactionError> {
        let bytes = value.to_le_bytes();
        let req = Request::write(opcode, bar, width, addr, &bytes[..width.bytes()]);
        self.send_request(&req)
    }

    /// Sends a read request and blocks until its reply arrives.
    fn transact(
        &mut self,
        opcode: Opcode,
        bar: u8,
        addr: u64,
        width: AccessWidth,
    ) -> Result<u64, TransactionError> {
        self.send_request(&Request::read(opcode, bar, width, addr))?;
        let reply = self.recv_reply()?;
        if reply.status != 0 {
            debug!(%opcode, status = reply.status, "remote reported non-zero reply status");
        }
        Ok(reply.value(width))
    }

    pub(crate) fn recv_frame(&mut self) -> Result<Option<usize>, TransportError> {
        self.transport.recv_frame(&mut self.buf)
    }

    pub(crate) fn send_request(&mut self, req: &Request<'_>) -> Result<(), TransactionError> {
        trace!(
            opcode = %req.opcode,
            bar = req.bar,
            addr = req.addr,
            width = req.width,
            "forwarding request"
        );
        let len = encode_request(req, &mut self.buf)?;
        self.transport.send_frame(&self.buf[..len])?;
        Ok(())
    }

    fn recv_reply(&mut self) -> Result<Reply, TransactionError> {
        loop {
            self.transport.wait_readable()?;
            let Some(len) = self.transport.recv_frame(&mut self.buf)? else {
                continue;
            };
            let frame = &self.buf[..len];

            match classify_frame_len(len).map_err(TransportError::from)? {
                FrameKind::Reply => return Ok(decode_reply(frame).map_err(TransportError::from)?),
                // The frame boundary is intact either way, so the reply is still ahead.
                FrameKind::Request => match decode_request(frame) {
                    Ok(req) => {
                        if self.queued.len() >= MAX_QUEUED_EVENTS {
                            warn!(
                                queued = self.queued.len(),
                                "remote event queue full; dropping oldest event"
                            );
                            self.queued.pop_front();
                        }
                        debug!(
                            opcode = %req.opcode,
                            "remote request arrived while awaiting reply; queued"
                        );
                        self.queued.push_back(frame.to_vec());
                    }
                    Err(err) => {
                        warn!(%err, "dropping malformed remote request received while awaiting reply");
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use pciefw_protocol::{encode_reply, encode_request_vec, REQUEST_HEADER_LEN};

    #[test]
    fn writes_never_touch_the_receive_path() {
        let mut session = Session::new(MockTransport::default());
        session
            .write_config(0x04, AccessWidth::Word, 0x0006)
            .unwrap();
        session
            .write_mem(1, 0x20, AccessWidth::Dword, 0xCAFE_BABE)
            .unwrap();
        session.write_io(2, 0x4, AccessWidth::Byte, 0x5A).unwrap();

        let transport = session.transport();
        assert_eq!(transport.recv_calls, 0);
        assert_eq!(transport.wait_calls, 0);
        assert_eq!(transport.sent.len(), 3);

        let mem = decode_request(&transport.sent[1]).unwrap();
        assert_eq!(mem.opcode, Opcode::WriteMem);
        assert_eq!(mem.bar, 1);
        assert_eq!(mem.width, 4);
        assert_eq!(mem.payload, &[0xBE, 0xBA, 0xFE, 0xCA]);

        let io = decode_request(&transport.sent[2]).unwrap();
        assert_eq!(io.opcode, Opcode::WriteIo);
        assert_eq!(io.payload, &[0x5A]);
    }

    #[test]
    fn read_config_blocks_for_reply() {
        let mut transport = MockTransport::default();
        transport.inbound.push_back(
            encode_reply(&Reply {
                status: 0,
                data: [0xEF, 0xBE, 0xAD, 0xDE, 0, 0, 0, 0],
            })
            .to_vec(),
        );
        let mut session = Session::new(transport);

        let value = session.read_config(0x10, AccessWidth::Dword).unwrap();
        assert_eq!(value, 0xDEAD_BEEF);

        let transport = session.transport();
        assert_eq!(transport.sent.len(), 1);
        assert_eq!(transport.sent[0].len(), REQUEST_HEADER_LEN);
        let req = decode_request(&transport.sent[0]).unwrap();
        assert_eq!(req.opcode, Opcode::ReadConfig);
        assert_eq!(req.addr, 0x10);
        assert_eq!(req.width, 4);
        assert!(req.payload.is_empty());
        assert_eq!(transport.wait_calls, 1);
    }

    #[test]
    fn read_value_is_truncated_to_width() {
        let mut transport = MockTransport::default();
        transport
            .inbound
            .push_back(encode_reply(&Reply::with_value(0x1122_3344_5566_7788)).to_vec());
        let mut session = Session::new(transport);
        assert_eq!(session.read_mem(0, 0, AccessWidth::Word).unwrap(), 0x7788);
    }

    #[test]
    fn nonzero_status_still_returns_data() {
        let mut transport = MockTransport::default();
        transport.inbound.push_back(
            encode_reply(&Reply {
                status: 3,
                data: 0x42u64.to_le_bytes(),
            })
            .to_vec(),
        );
        let mut session = Session::new(transport);
        assert_eq!(session.read_io(0, 0, AccessWidth::Byte).unwrap(), 0x42);
    }

    #[test]
    fn remote_request_during_read_is_queued() {
        let dma = [0x04, 0x03, 0x02, 0x01];
        let mut transport = MockTransport::default();
        transport.inbound.push_back(
            encode_request_vec(&Request::write(
                Opcode::WriteMem,
                0,
                AccessWidth::Dword,
                0x1000,
                &dma,
            ))
            .unwrap(),
        );
        transport
            .inbound
            .push_back(encode_reply(&Reply::with_value(7)).to_vec());
        let mut session = Session::new(transport);

        assert_eq!(session.read_mem(0, 0x8, AccessWidth::Dword).unwrap(), 7);
        assert!(session.has_queued_events());
        let queued = session.pop_queued_event().unwrap();
        let req = decode_request(&queued).unwrap();
        assert_eq!(req.opcode, Opcode::WriteMem);
        assert_eq!(req.payload, &dma);
        assert!(!session.has_queued_events());
    }

    #[test]
    fn send_failure_is_surfaced() {
        let mut transport = MockTransport::default();
        transport.fail_send = true;
        let mut session = Session::new(transport);
        assert!(matches!(
            session.write_config(0, AccessWidth::Dword, 0),
            Err(TransactionError::Transport(TransportError::Io(_)))
        ));
        assert!(matches!(
            session.read_config(0, AccessWidth::Dword),
            Err(TransactionError::Transport(TransportError::Io(_)))
        ));
        assert_eq!(session.transport().recv_calls, 0);
    }

    #[test]
    fn receive_failure_is_surfaced() {
        let mut session = Session::new(MockTransport::default());
        assert!(matches!(
            session.read_config(0, AccessWidth::Dword),
            Err(TransactionError::Transport(TransportError::Closed))
        ));
    }

    #[test]
    fn malformed_frame_fails_the_read() {
        let mut transport = MockTransport::default();
        transport.inbound.push_back(vec![12, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        let mut session = Session::new(transport);
        assert!(matches!(
            session.read_config(0, AccessWidth::Dword),
            Err(TransactionError::Transport(TransportError::Frame(_)))
        ));
    }

    #[test]
    fn undecodable_request_during_read_keeps_replies_in_step() {
        // Framed as a 15-byte request but declaring a 4-byte payload.
        let mut bad = vec![0u8; REQUEST_HEADER_LEN];
        bad[0..2].copy_from_slice(&(REQUEST_HEADER_LEN as u16).to_le_bytes());
        bad[2] = Opcode::WriteMem.to_u8();
        bad[13] = 4;

        let mut transport = MockTransport::default();
        transport.inbound.push_back(bad);
        transport
            .inbound
            .push_back(encode_reply(&Reply::with_value(0x1111)).to_vec());
        transport
            .inbound
            .push_back(encode_reply(&Reply::with_value(0x2222)).to_vec());
        let mut session = Session::new(transport);

        assert_eq!(session.read_config(0, AccessWidth::Word).unwrap(), 0x1111);
        assert_eq!(session.read_config(2, AccessWidth::Word).unwrap(), 0x2222);
        assert!(!session.has_queued_events());
    }

    #[test]
    fn full_event_queue_drops_oldest_and_still_completes_the_read() {
        let mut transport = MockTransport::default();
        for i in 0..=MAX_QUEUED_EVENTS as u64 {
            let data = (i as u32).to_le_bytes();
            transport.inbound.push_back(
                encode_request_vec(&Request::write(
                    Opcode::WriteMem,
                    0,
                    AccessWidth::Dword,
                    i,
                    &data,
                ))
                .unwrap(),
            );
        }
        transport
            .inbound
            .push_back(encode_reply(&Reply::with_value(0x33)).to_vec());
        transport
            .inbound
            .push_back(encode_reply(&Reply::with_value(0x44)).to_vec());
        let mut session = Session::new(transport);

        assert_eq!(session.read_mem(0, 0, AccessWidth::Byte).unwrap(), 0x33);
        assert_eq!(session.read_mem(0, 1, AccessWidth::Byte).unwrap(), 0x44);

        let mut addrs = Vec::new();
        while let Some(frame) = session.pop_queued_event() {
            addrs.push(decode_request(&frame).unwrap().addr);
        }
        assert_eq!(addrs.len(), MAX_QUEUED_EVENTS);
        assert_eq!(addrs.first(), Some(&1));
        assert_eq!(addrs.last(), Some(&(MAX_QUEUED_EVENTS as u64)));
    }
}
