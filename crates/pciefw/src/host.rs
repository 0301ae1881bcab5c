//! Interfaces the device consumes from the virtualization host.

use crate::bar::BarWindow;
use crate::error::DmaError;

/// A message-signaled interrupt as programmed in the device's MSI capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsiMessage {
    pub address: u64,
    pub data: u16,
}

/// Side effects requested by the remote endpoint.
pub trait RemoteEventSink {
    /// Writes `data` into local/guest address space at `addr`.
    fn dma_write(&mut self, addr: u64, data: &[u8]) -> Result<(), DmaError>;

    /// Raises MSI `vector` on the local device.
    fn signal_msi(&mut self, vector: u16);
}

/// The host bus the device is attached to.
pub trait DeviceHost {
    /// Registers a window of `window.size` bytes whose accesses the host routes to
    /// [`crate::PciefwDevice::bar_read`] / [`crate::PciefwDevice::bar_write`].
    fn map_bar(&mut self, window: BarWindow);

    fn unmap_bar(&mut self, index: u8);

    fn dma_write(&mut self, addr: u64, data: &[u8]) -> Result<(), DmaError>;

    fn raise_msi(&mut self, message: MsiMessage);
}

/// Memory-mapped access handler, as installed for a BAR window.
pub trait MmioHandler {
    fn read(&mut self, offset: u64, size: usize) -> u64;
    fn write(&mut self, offset: u64, size: usize, value: u64);
}

impl<T: RemoteEventSink + ?Sized> RemoteEventSink for &mut T {
    fn dma_write(&mut self, addr: u64, data: &[u8]) -> Result<(), DmaError> {
        <T as RemoteEventSink>::dma_write(&mut **self, addr, data)
    }

    fn signal_msi(&mut self, vector: u16) {
        <T as RemoteEventSink>::signal_msi(&mut **self, vector)
    }
}
