//! The forwarded PCI device as the local bus sees it.
//!
//! [`PciefwDevice`] owns the [`Session`] and a [`ShadowConfigSpace`]. Bus-facing accessors never
//! fail: a read whose transaction fails returns all-ones (what a read of a non-responding device
//! yields on real hardware), a failed write is logged and dropped.

use std::cell::RefCell;
use std::rc::Rc;

use pciefw_protocol::AccessWidth;
use tracing::{debug, info, trace, warn};

use crate::bar::{BarKind, BarTable};
use crate::config::PciefwConfig;
use crate::dispatch::DispatchOutcome;
use crate::error::{AttachError, DmaError, TransportError};
use crate::host::{DeviceHost, MmioHandler, RemoteEventSink};
use crate::session::Session;
use crate::shadow::ShadowConfigSpace;
use crate::transport::{self, Transport};

pub struct PciefwDevice<T = Box<dyn Transport + Send>> {
    session: Session<T>,
    shadow: ShadowConfigSpace,
}

impl PciefwDevice {
    /// Connects to the remote endpoint described by `config`, discovers its BARs and registers
    /// a window with `host` for each one found.
    pub fn attach<H: DeviceHost + ?Sized>(
        config: &PciefwConfig,
        host: &mut H,
    ) -> Result<Self, AttachError> {
        let transport = transport::connect(config)?;
        Ok(Self::attach_with_transport(transport, host))
    }
}

impl<T: Transport> PciefwDevice<T> {
    /// Like [`PciefwDevice::attach`], over an already connected link.
    pub fn attach_with_transport<H: DeviceHost + ?Sized>(transport: T, host: &mut H) -> Self {
        let mut session = Session::new(transport);
        let bars = session.discover_bars();
        for window in bars.iter() {
            host.map_bar(window);
        }
        info!(bars = bars.iter().count(), "pciefw device attached");
        Self {
            session,
            shadow: ShadowConfigSpace::new(),
        }
    }

    pub fn config_read(&mut self, offset: u16, size: usize) -> u32 {
        let Some(width) = config_width(size) else {
            warn!(offset, size, "invalid config read size");
            return all_ones(size) as u32;
        };
        match self.session.read_config(u64::from(offset), width) {
            Ok(value) => {
                trace!(offset, size, value, "config read");
                value as u32
            }
            Err(err) => {
                warn!(offset, size, %err, "config read failed");
                width.mask() as u32
            }
        }
    }

    /// Forwards a config write and mirrors it into the shadow configuration space.
    pub fn config_write(&mut self, offset: u16, size: usize, value: u32) {
        let Some(width) = config_width(size) else {
            warn!(offset, size, "invalid config write size");
            return;
        };
        if let Err(err) = self
            .session
            .write_config(u64::from(offset), width, u64::from(value))
        {
            warn!(offset, size, %err, "config write failed");
        }
        self.shadow.write(offset, size, value);
    }

    pub fn bar_read(&mut self, bar: u8, offset: u64, size: usize) -> u64 {
        let Some((kind, width)) = self.route(bar, offset, size) else {
            return all_ones(size);
        };
        let res = match kind {
            BarKind::Memory => self.session.read_mem(bar, offset, width),
            BarKind::Io => self.session.read_io(bar, offset, width),
        };
        res.unwrap_or_else(|err| {
            warn!(bar, offset, size, %err, "BAR read failed");
            width.mask()
        })
    }

    pub fn bar_write(&mut self, bar: u8, offset: u64, size: usize, value: u64) {
        let Some((kind, width)) = self.route(bar, offset, size) else {
            return;
        };
        let res = match kind {
            BarKind::Memory => self.session.write_mem(bar, offset, width, value),
            BarKind::Io => self.session.write_io(bar, offset, width, value),
        };
        if let Err(err) = res {
            warn!(bar, offset, size, %err, "BAR write failed");
        }
    }

    fn route(&self, bar: u8, offset: u64, size: usize) -> Option<(BarKind, AccessWidth)> {
        let Some(window) = self.session.bars().get(bar) else {
            debug!(bar, offset, "access to unmapped BAR");
            return None;
        };
        let Some(width) = AccessWidth::from_bytes(size) else {
            warn!(bar, offset, size, "invalid BAR access size");
            return None;
        };
        if offset.saturating_add(size as u64) > window.size {
            debug!(bar, offset, size, "access beyond BAR window");
            return None;
        }
        Some((window.kind, width))
    }

    /// Readiness callback for the link: handles at most one remote-initiated message.
    ///
    /// Remote requests that arrived during a read were already taken off the link and will not
    /// raise readiness again. Every host must check [`Self::has_queued_events`] after each bus
    /// access and drain them with [`Self::dispatch_queued`].
    pub fn on_readable<H: DeviceHost + ?Sized>(&mut self, host: &mut H) -> DispatchOutcome {
        let mut events = HostEvents {
            host,
            shadow: &self.shadow,
        };
        self.session.dispatch_one(&mut events)
    }

    pub fn has_queued_events(&self) -> bool {
        self.session.has_queued_events()
    }

    /// Dispatches every remote request queued during earlier reads, without touching the link.
    /// Returns how many were handled.
    pub fn dispatch_queued<H: DeviceHost + ?Sized>(&mut self, host: &mut H) -> usize {
        let mut handled = 0;
        while self.session.has_queued_events() {
            self.on_readable(host);
            handled += 1;
        }
        handled
    }

    /// Blocks until the link is readable.
    pub fn wait_readable(&mut self) -> Result<(), TransportError> {
        self.session.transport_mut().wait_readable()
    }

    pub fn bars(&self) -> &BarTable {
        self.session.bars()
    }

    pub fn shadow(&self) -> &ShadowConfigSpace {
        &self.shadow
    }

    pub fn session(&self) -> &Session<T> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session<T> {
        &mut self.session
    }

    #[cfg(unix)]
    pub fn raw_fd(&self) -> Option<std::os::fd::RawFd> {
        self.session.transport().raw_fd()
    }

    /// Unregisters every BAR window and releases the session, handing back the link. Dropping
    /// the returned transport closes the connection.
    pub fn detach<H: DeviceHost + ?Sized>(self, host: &mut H) -> T {
        for window in self.session.bars().iter() {
            host.unmap_bar(window.index);
        }
        info!("pciefw device detached");
        self.session.into_transport()
    }
}

/// Routes remote events to the host, gating MSI on the shadow MSI capability.
struct HostEvents<'a, H: ?Sized> {
    host: &'a mut H,
    shadow: &'a ShadowConfigSpace,
}

impl<H: DeviceHost + ?Sized> RemoteEventSink for HostEvents<'_, H> {
    fn dma_write(&mut self, addr: u64, data: &[u8]) -> Result<(), DmaError> {
        self.host.dma_write(addr, data)
    }

    fn signal_msi(&mut self, vector: u16) {
        match self.shadow.msi_message() {
            Some(message) => self.host.raise_msi(message),
            None => debug!(vector, "MSI disabled; dropping interrupt"),
        }
    }
}

/// MMIO handler for one BAR window of a shared device.
pub struct BarMmio<T> {
    dev: Rc<RefCell<PciefwDevice<T>>>,
    bar: u8,
}

impl<T> BarMmio<T> {
    pub fn new(dev: Rc<RefCell<PciefwDevice<T>>>, bar: u8) -> Self {
        Self { dev, bar }
    }
}

impl<T: Transport> MmioHandler for BarMmio<T> {
    fn read(&mut self, offset: u64, size: usize) -> u64 {
        if !(1..=8).contains(&size) {
            return all_ones(size);
        }
        self.dev.borrow_mut().bar_read(self.bar, offset, size)
    }

    fn write(&mut self, offset: u64, size: usize, value: u64) {
        if !(1..=8).contains(&size) {
            return;
        }
        self.dev.borrow_mut().bar_write(self.bar, offset, size, value);
    }
}

fn config_width(size: usize) -> Option<AccessWidth> {
    AccessWidth::from_bytes(size).filter(|w| *w != AccessWidth::Qword)
}

fn all_ones(size: usize) -> u64 {
    if size == 0 {
        return 0;
    }
    if size >= 8 {
        return u64::MAX;
    }
    (1u64 << (size * 8)) - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bar::BarWindow;
    use crate::endpoint::RamDevice;
    use crate::host::MsiMessage;
    use crate::shadow::{MSI_CAP_OFFSET, PCIEFW_VENDOR_ID};
    use crate::testing::MockTransport;
    use pciefw_protocol::{decode_request, encode_request_vec, Opcode, Request, REQUEST_HEADER_LEN};

    #[derive(Default)]
    struct RecordingHost {
        mapped: Vec<BarWindow>,
        unmapped: Vec<u8>,
        dma: Vec<(u64, Vec<u8>)>,
        msi: Vec<MsiMessage>,
    }

    impl DeviceHost for RecordingHost {
        fn map_bar(&mut self, window: BarWindow) {
            self.mapped.push(window);
        }

        fn unmap_bar(&mut self, index: u8) {
            self.unmapped.push(index);
        }

        fn dma_write(&mut self, addr: u64, data: &[u8]) -> Result<(), DmaError> {
            self.dma.push((addr, data.to_vec()));
            Ok(())
        }

        fn raise_msi(&mut self, message: MsiMessage) {
            self.msi.push(message);
        }
    }

    fn attach() -> (PciefwDevice<MockTransport>, RecordingHost) {
        let remote = RamDevice::builder()
            .mem_bar(0, 0x1000)
            .io_bar(1, 0x20)
            .build();
        let mut host = RecordingHost::default();
        let dev = PciefwDevice::attach_with_transport(MockTransport::with_remote(remote), &mut host);
        (dev, host)
    }

    fn msi_frame() -> Vec<u8> {
        let mut frame = vec![0u8; REQUEST_HEADER_LEN];
        frame[0..2].copy_from_slice(&(REQUEST_HEADER_LEN as u16).to_le_bytes());
        frame[2] = 7;
        frame
    }

    #[test]
    fn attach_maps_discovered_bars() {
        let (dev, host) = attach();
        assert_eq!(
            host.mapped,
            vec![
                BarWindow {
                    index: 0,
                    kind: BarKind::Memory,
                    size: 0x1000
                },
                BarWindow {
                    index: 1,
                    kind: BarKind::Io,
                    size: 0x20
                },
            ]
        );
        assert_eq!(dev.bars().sizes(), [0x1000, 0x20, 0, 0, 0, 0]);
    }

    #[test]
    fn config_reads_are_forwarded() {
        let (mut dev, _host) = attach();
        assert_eq!(dev.config_read(0x00, 2), u32::from(PCIEFW_VENDOR_ID));
        let last = dev.session_mut().transport().sent.last().cloned().unwrap();
        let req = decode_request(&last).unwrap();
        assert_eq!(req.opcode, Opcode::ReadConfig);
        assert_eq!(req.width, 2);
    }

    #[test]
    fn failed_reads_return_all_ones() {
        let (mut dev, _host) = attach();
        dev.session_mut().transport_mut().drop_replies = 3;
        assert_eq!(dev.config_read(0x00, 1), 0xFF);
        assert_eq!(dev.config_read(0x00, 4), 0xFFFF_FFFF);
        assert_eq!(dev.bar_read(0, 0, 2), 0xFFFF);
        assert_eq!(dev.config_read(0x00, 3), 0x00FF_FFFF);
    }

    #[test]
    fn bar_accesses_route_by_kind() {
        let (mut dev, _host) = attach();
        dev.bar_write(0, 0x40, 4, 0xCAFE_F00D);
        assert_eq!(dev.bar_read(0, 0x40, 4), 0xCAFE_F00D);
        dev.bar_write(1, 0x2, 2, 0xBEEF);
        assert_eq!(dev.bar_read(1, 0x2, 2), 0xBEEF);

        let opcodes: Vec<Opcode> = dev
            .session_mut()
            .transport()
            .sent
            .iter()
            .rev()
            .take(4)
            .map(|f| decode_request(f).unwrap().opcode)
            .collect();
        assert_eq!(
            opcodes,
            [Opcode::ReadIo, Opcode::WriteIo, Opcode::ReadMem, Opcode::WriteMem]
        );
    }

    #[test]
    fn unmapped_or_out_of_window_access_never_reaches_the_link() {
        let (mut dev, _host) = attach();
        let before = dev.session_mut().transport().sent.len();
        assert_eq!(dev.bar_read(3, 0, 4), 0xFFFF_FFFF);
        assert_eq!(dev.bar_read(1, 0x1E, 4), 0xFFFF_FFFF);
        dev.bar_write(3, 0, 4, 0);
        dev.bar_write(0, 0, 3, 0);
        assert_eq!(dev.session_mut().transport().sent.len(), before);
    }

    #[test]
    fn config_writes_update_the_shadow() {
        let (mut dev, _host) = attach();
        dev.config_write(MSI_CAP_OFFSET + 4, 4, 0xFEE0_0000);
        dev.config_write(MSI_CAP_OFFSET + 8, 2, 0x41);
        dev.config_write(MSI_CAP_OFFSET + 2, 2, 1);
        assert!(dev.shadow().msi_enabled());

        let last = dev.session_mut().transport().sent.last().cloned().unwrap();
        let req = decode_request(&last).unwrap();
        assert_eq!(req.opcode, Opcode::WriteConfig);
        assert_eq!(req.addr, u64::from(MSI_CAP_OFFSET + 2));
        assert_eq!(req.payload, &[1, 0]);
    }

    #[test]
    fn msi_is_delivered_only_when_enabled() {
        let (mut dev, mut host) = attach();
        dev.session_mut().transport_mut().inbound.push_back(msi_frame());
        assert_eq!(dev.on_readable(&mut host), DispatchOutcome::Dispatched(Opcode::Msi));
        assert!(host.msi.is_empty());

        dev.config_write(MSI_CAP_OFFSET + 4, 4, 0xFEE0_0000);
        dev.config_write(MSI_CAP_OFFSET + 8, 2, 0x41);
        dev.config_write(MSI_CAP_OFFSET + 2, 2, 1);
        dev.session_mut().transport_mut().inbound.push_back(msi_frame());
        dev.on_readable(&mut host);
        assert_eq!(
            host.msi,
            vec![MsiMessage {
                address: 0xFEE0_0000,
                data: 0x41
            }]
        );
    }

    #[test]
    fn dma_events_reach_the_host() {
        let (mut dev, mut host) = attach();
        let frame = encode_request_vec(&Request::write(
            Opcode::WriteMem,
            0,
            AccessWidth::Word,
            0x8000,
            &[0xAA, 0xBB],
        ))
        .unwrap();
        dev.session_mut().transport_mut().inbound.push_back(frame);
        assert_eq!(
            dev.on_readable(&mut host),
            DispatchOutcome::Dispatched(Opcode::WriteMem)
        );
        assert_eq!(host.dma, vec![(0x8000, vec![0xAA, 0xBB])]);
        assert_eq!(dev.on_readable(&mut host), DispatchOutcome::Idle);
    }

    #[test]
    fn dma_queued_during_a_read_is_delivered_without_link_readiness() {
        let (mut dev, mut host) = attach();
        let frame = encode_request_vec(&Request::write(
            Opcode::WriteMem,
            0,
            AccessWidth::Dword,
            0x1000,
            &[0x04, 0x03, 0x02, 0x01],
        ))
        .unwrap();
        // The DMA write reaches the link ahead of the reply; nothing follows it.
        dev.session_mut().transport_mut().inbound.push_back(frame);
        assert_eq!(dev.bar_read(0, 0x10, 4), 0);

        assert!(dev.has_queued_events());
        assert!(host.dma.is_empty());
        assert!(!dev.session_mut().transport_mut().poll_readable().unwrap());

        let recv_calls = dev.session().transport().recv_calls;
        assert_eq!(dev.dispatch_queued(&mut host), 1);
        assert_eq!(host.dma, vec![(0x1000, vec![0x04, 0x03, 0x02, 0x01])]);
        assert!(!dev.has_queued_events());
        assert_eq!(dev.session().transport().recv_calls, recv_calls);
        assert_eq!(dev.dispatch_queued(&mut host), 0);
    }

    #[test]
    fn detach_unmaps_every_window() {
        let (dev, mut host) = attach();
        let transport = dev.detach(&mut host);
        assert_eq!(host.unmapped, vec![0, 1]);
        assert!(transport.inbound.is_empty());
    }

    #[test]
    fn bar_mmio_adapter_forwards_to_the_device() {
        let (dev, _host) = attach();
        let dev = Rc::new(RefCell::new(dev));
        let mut mmio = BarMmio::new(dev.clone(), 0);
        mmio.write(0x10, 8, 0x0102_0304_0506_0708);
        assert_eq!(mmio.read(0x10, 8), 0x0102_0304_0506_0708);
        assert_eq!(mmio.read(0x10, 0), 0);
        assert_eq!(mmio.read(0x10, 16), u64::MAX);
    }
}
