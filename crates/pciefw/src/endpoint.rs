//! Remote endpoint side of the link.
//!
//! [`Endpoint`] serves requests arriving from a [`crate::PciefwDevice`] against an
//! [`EndpointDevice`] model and can push device-initiated traffic (DMA writes, MSI) back.
//! [`RamDevice`] is a simple model with RAM-backed BARs; it backs the loopback tests and the
//! CLI's `serve` command.

use pciefw_protocol::{
    decode_request, encode_reply, encode_request, AccessWidth, Opcode, Reply, Request,
    MAX_MESSAGE_LEN, PCI_NUM_BARS,
};
use tracing::{debug, trace, warn};

use crate::bar::{BarKind, PCI_BAR0_OFFSET, PCI_BAR_SPACE_IO};
use crate::error::{TransactionError, TransportError};
use crate::shadow::PCI_CONFIG_SPACE_SIZE;
use crate::transport::Transport;

/// Reply status for a read the endpoint could not satisfy.
pub const STATUS_ACCESS_FAILED: u8 = 1;

/// A PCI function as seen from the endpoint side of the link.
///
/// Reads return `None` when the access does not hit anything; the endpoint then replies with a
/// failure status and all-ones data.
pub trait EndpointDevice {
    fn config_read(&mut self, offset: u64, width: AccessWidth) -> Option<u64>;
    fn config_write(&mut self, offset: u64, width: AccessWidth, value: u64);
    fn mem_read(&mut self, bar: u8, addr: u64, width: AccessWidth) -> Option<u64>;
    fn mem_write(&mut self, bar: u8, addr: u64, width: AccessWidth, value: u64);
    fn io_read(&mut self, bar: u8, addr: u64, width: AccessWidth) -> Option<u64>;
    fn io_write(&mut self, bar: u8, addr: u64, width: AccessWidth, value: u64);
}

/// Executes one request against `dev`, returning the reply for reads.
pub fn service_request<D: EndpointDevice + ?Sized>(dev: &mut D, req: &Request<'_>) -> Option<Reply> {
    let width = AccessWidth::try_from(req.width);

    if req.opcode.expects_reply() {
        let value = width.ok().and_then(|width| match req.opcode {
            Opcode::ReadConfig => dev.config_read(req.addr, width),
            Opcode::ReadMem => dev.mem_read(req.bar, req.addr, width),
            Opcode::ReadIo => dev.io_read(req.bar, req.addr, width),
            _ => None,
        });
        return Some(match value {
            Some(value) => Reply::with_value(value),
            None => {
                debug!(opcode = %req.opcode, bar = req.bar, addr = req.addr, "read not claimed");
                Reply {
                    status: STATUS_ACCESS_FAILED,
                    data: [0xFF; 8],
                }
            }
        });
    }

    if req.opcode.carries_data() {
        let Ok(width) = width else {
            warn!(opcode = %req.opcode, width = req.width, "dropping write with invalid width");
            return None;
        };
        if req.payload.len() != width.bytes() {
            warn!(
                opcode = %req.opcode,
                width = req.width,
                len = req.payload.len(),
                "dropping write whose payload does not match its width"
            );
            return None;
        }
        let mut bytes = [0u8; 8];
        bytes[..req.payload.len()].copy_from_slice(req.payload);
        let value = u64::from_le_bytes(bytes);
        match req.opcode {
            Opcode::WriteConfig => dev.config_write(req.addr, width, value),
            Opcode::WriteMem => dev.mem_write(req.bar, req.addr, width, value),
            Opcode::WriteIo => dev.io_write(req.bar, req.addr, width, value),
            _ => {}
        }
        return None;
    }

    debug!(opcode = %req.opcode, "endpoint ignoring request");
    None
}

#[derive(Debug, Clone)]
struct RamBar {
    kind: BarKind,
    base: u32,
    probe: bool,
    data: Vec<u8>,
}

impl RamBar {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn register(&self) -> u32 {
        let size_mask = !(self.size().saturating_sub(1) as u32);
        let (addr_mask, flags) = match self.kind {
            BarKind::Memory => (0xFFFF_FFF0, 0),
            BarKind::Io => (0xFFFF_FFFC, PCI_BAR_SPACE_IO),
        };
        if self.probe {
            (size_mask & addr_mask) | flags
        } else {
            (self.base & size_mask & addr_mask) | flags
        }
    }

    fn slice(&mut self, addr: u64, width: AccessWidth) -> Option<&mut [u8]> {
        let start = usize::try_from(addr).ok()?;
        let end = start.checked_add(width.bytes())?;
        self.data.get_mut(start..end)
    }
}

/// An endpoint with RAM-backed BARs and a flat configuration space.
#[derive(Debug, Clone)]
pub struct RamDevice {
    config: [u8; PCI_CONFIG_SPACE_SIZE],
    bars: [Option<RamBar>; PCI_NUM_BARS],
}

#[derive(Debug, Clone, Default)]
pub struct RamDeviceBuilder {
    vendor_id: u16,
    device_id: u16,
    bars: [Option<(BarKind, u64)>; PCI_NUM_BARS],
}

impl RamDeviceBuilder {
    pub fn ids(mut self, vendor_id: u16, device_id: u16) -> Self {
        self.vendor_id = vendor_id;
        self.device_id = device_id;
        self
    }

    /// Adds a memory BAR. `size` must be a power of two.
    pub fn mem_bar(mut self, index: u8, size: u64) -> Self {
        self.set_bar(index, BarKind::Memory, size);
        self
    }

    /// Adds an I/O BAR. `size` must be a power of two.
    pub fn io_bar(mut self, index: u8, size: u64) -> Self {
        self.set_bar(index, BarKind::Io, size);
        self
    }

    fn set_bar(&mut self, index: u8, kind: BarKind, size: u64) {
        if let Some(slot) = self.bars.get_mut(usize::from(index)) {
            *slot = Some((kind, size));
        }
    }

    pub fn build(self) -> RamDevice {
        let mut config = [0u8; PCI_CONFIG_SPACE_SIZE];
        config[0x00..0x02].copy_from_slice(&self.vendor_id.to_le_bytes());
        config[0x02..0x04].copy_from_slice(&self.device_id.to_le_bytes());

        let bars = self.bars.map(|bar| {
            bar.map(|(kind, size)| RamBar {
                kind,
                base: 0,
                probe: false,
                data: vec![0u8; usize::try_from(size).unwrap_or(0)],
            })
        });
        RamDevice { config, bars }
    }
}

impl RamDevice {
    pub fn builder() -> RamDeviceBuilder {
        RamDeviceBuilder {
            vendor_id: crate::shadow::PCIEFW_VENDOR_ID,
            device_id: crate::shadow::PCIEFW_DEVICE_ID,
            ..Default::default()
        }
    }

    /// Backing memory of BAR `index`, if it exists.
    pub fn bar_data(&self, index: u8) -> Option<&[u8]> {
        self.bars
            .get(usize::from(index))?
            .as_ref()
            .map(|bar| bar.data.as_slice())
    }

    fn bar_index(offset: u64) -> Option<usize> {
        let end = PCI_BAR0_OFFSET + 4 * PCI_NUM_BARS as u64;
        (PCI_BAR0_OFFSET..end)
            .contains(&offset)
            .then(|| ((offset - PCI_BAR0_OFFSET) / 4) as usize)
    }

    fn bar_mut(&mut self, bar: u8, kind: BarKind) -> Option<&mut RamBar> {
        self.bars
            .get_mut(usize::from(bar))?
            .as_mut()
            .filter(|b| b.kind == kind)
    }

    fn ram_read(&mut self, bar: u8, kind: BarKind, addr: u64, width: AccessWidth) -> Option<u64> {
        let slice = self.bar_mut(bar, kind)?.slice(addr, width)?;
        let mut bytes = [0u8; 8];
        bytes[..slice.len()].copy_from_slice(slice);
        Some(u64::from_le_bytes(bytes))
    }

    fn ram_write(&mut self, bar: u8, kind: BarKind, addr: u64, width: AccessWidth, value: u64) {
        match self.bar_mut(bar, kind).and_then(|b| b.slice(addr, width)) {
            Some(slice) => slice.copy_from_slice(&value.to_le_bytes()[..width.bytes()]),
            None => debug!(bar, addr, %width, "write outside RAM BAR dropped"),
        }
    }
}

impl EndpointDevice for RamDevice {
    fn config_read(&mut self, offset: u64, width: AccessWidth) -> Option<u64> {
        if let Some(index) = Self::bar_index(offset) {
            // BAR registers are dword-wide; narrower reads see the low bytes.
            let reg = self.bars[index].as_ref().map_or(0, RamBar::register);
            let shift = 8 * (offset % 4);
            return Some((u64::from(reg) >> shift) & width.mask());
        }

        let mut value = 0u64;
        for i in 0..width.bytes() {
            let byte = usize::try_from(offset)
                .ok()
                .and_then(|o| o.checked_add(i))
                .and_then(|addr| self.config.get(addr))
                .copied()
                .unwrap_or(0xFF);
            value |= u64::from(byte) << (8 * i);
        }
        Some(value)
    }

    fn config_write(&mut self, offset: u64, width: AccessWidth, value: u64) {
        if let Some(index) = Self::bar_index(offset) {
            let Some(bar) = self.bars[index].as_mut() else {
                return;
            };
            if width != AccessWidth::Dword || offset % 4 != 0 {
                debug!(bar = index, offset, %width, "unaligned BAR write dropped");
                return;
            }
            let value = value as u32;
            if value == 0xFFFF_FFFF {
                bar.probe = true;
            } else {
                bar.probe = false;
                bar.base = value;
            }
            return;
        }

        for i in 0..width.bytes() {
            let Some(addr) = usize::try_from(offset).ok().and_then(|o| o.checked_add(i)) else {
                return;
            };
            // Vendor and device IDs are read-only.
            if addr < 0x04 {
                continue;
            }
            if let Some(byte) = self.config.get_mut(addr) {
                *byte = (value >> (8 * i)) as u8;
            }
        }
    }

    fn mem_read(&mut self, bar: u8, addr: u64, width: AccessWidth) -> Option<u64> {
        self.ram_read(bar, BarKind::Memory, addr, width)
    }

    fn mem_write(&mut self, bar: u8, addr: u64, width: AccessWidth, value: u64) {
        self.ram_write(bar, BarKind::Memory, addr, width, value)
    }

    fn io_read(&mut self, bar: u8, addr: u64, width: AccessWidth) -> Option<u64> {
        self.ram_read(bar, BarKind::Io, addr, width)
    }

    fn io_write(&mut self, bar: u8, addr: u64, width: AccessWidth, value: u64) {
        self.ram_write(bar, BarKind::Io, addr, width, value)
    }
}

/// Endpoint side of a pciefw link.
pub struct Endpoint<T> {
    transport: T,
    buf: Box<[u8]>,
}

impl<T> Endpoint<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            buf: vec![0u8; MAX_MESSAGE_LEN].into_boxed_slice(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }
}

impl<T: Transport> Endpoint<T> {
    /// Blocks for the next request from the device, services it and sends the reply if one is
    /// due. Returns the opcode handled.
    pub fn serve_one<D: EndpointDevice + ?Sized>(
        &mut self,
        dev: &mut D,
    ) -> Result<Opcode, TransactionError> {
        let len = loop {
            self.transport.wait_readable()?;
            if let Some(len) = self.transport.recv_frame(&mut self.buf)? {
                break len;
            }
        };

        let req = decode_request(&self.buf[..len]).map_err(TransportError::from)?;
        trace!(opcode = %req.opcode, bar = req.bar, addr = req.addr, width = req.width, "serving");
        let opcode = req.opcode;
        if let Some(reply) = service_request(dev, &req) {
            self.transport.send_frame(&encode_reply(&reply))?;
        }
        Ok(opcode)
    }

    /// Pushes a device-initiated DMA write of `data` to local address `addr`.
    pub fn push_dma_write(&mut self, addr: u64, data: &[u8]) -> Result<(), TransactionError> {
        self.push_request(&Request {
            opcode: Opcode::WriteMem,
            bar: 0,
            width: data.len().min(8) as u8,
            addr,
            payload: data,
        })
    }

    /// Pushes an MSI (vector 0).
    pub fn push_msi(&mut self) -> Result<(), TransactionError> {
        self.push_request(&Request {
            opcode: Opcode::Msi,
            bar: 0,
            width: 0,
            addr: 0,
            payload: &[],
        })
    }

    pub fn push_request(&mut self, req: &Request<'_>) -> Result<(), TransactionError> {
        let len = encode_request(req, &mut self.buf)?;
        self.transport.send_frame(&self.buf[..len])?;
        Ok(())
    }
}
