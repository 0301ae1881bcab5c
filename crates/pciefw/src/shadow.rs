//! Local image of the forwarded device's configuration space.
//!
//! The remote endpoint owns the authoritative configuration space; every config write is
//! forwarded there and also applied here, so host-side logic (command decode gating, MSI
//! programming) can consult register state without a round trip.

use crate::host::MsiMessage;

pub const PCI_CONFIG_SPACE_SIZE: usize = 256;

pub const PCI_VENDOR_ID_OFFSET: u16 = 0x00;
pub const PCI_COMMAND_OFFSET: u16 = 0x04;
pub const PCI_STATUS_OFFSET: u16 = 0x06;
pub const PCI_CLASS_OFFSET: u16 = 0x0B;
pub const PCI_HEADER_TYPE_OFFSET: u16 = 0x0E;
pub const PCI_CAP_PTR_OFFSET: u16 = 0x34;
pub const PCI_INTERRUPT_PIN_OFFSET: u16 = 0x3D;

pub const PCI_COMMAND_IO: u16 = 1 << 0;
pub const PCI_COMMAND_MEMORY: u16 = 1 << 1;
pub const PCI_STATUS_CAPABILITIES_LIST: u16 = 1 << 4;

pub const PCI_CAP_ID_MSI: u8 = 0x05;
/// Offset of the MSI capability in the shadow image.
pub const MSI_CAP_OFFSET: u16 = 0x40;
const MSI_CONTROL: usize = 0x02;
const MSI_ADDRESS: usize = 0x04;
const MSI_DATA: usize = 0x08;
pub const PCI_MSI_FLAGS_ENABLE: u16 = 1 << 0;

/// Identity reported by the shadow image; the remote endpoint reports its own.
pub const PCIEFW_VENDOR_ID: u16 = 0x2a2a;
pub const PCIEFW_DEVICE_ID: u16 = 0x2a2a;
pub const PCIEFW_CLASS: u8 = 0xff;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowConfigSpace {
    bytes: [u8; PCI_CONFIG_SPACE_SIZE],
}

impl Default for ShadowConfigSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl ShadowConfigSpace {
    pub fn new() -> Self {
        let mut bytes = [0u8; PCI_CONFIG_SPACE_SIZE];
        bytes[0x00..0x02].copy_from_slice(&PCIEFW_VENDOR_ID.to_le_bytes());
        bytes[0x02..0x04].copy_from_slice(&PCIEFW_DEVICE_ID.to_le_bytes());
        bytes[0x04..0x06].copy_from_slice(&(PCI_COMMAND_IO | PCI_COMMAND_MEMORY).to_le_bytes());
        bytes[0x06..0x08].copy_from_slice(&PCI_STATUS_CAPABILITIES_LIST.to_le_bytes());
        bytes[usize::from(PCI_CLASS_OFFSET)] = PCIEFW_CLASS;
        bytes[usize::from(PCI_HEADER_TYPE_OFFSET)] = 0x00;
        bytes[usize::from(PCI_CAP_PTR_OFFSET)] = MSI_CAP_OFFSET as u8;

        // 32-bit address, single vector, no per-vector masking: control starts out zero.
        let msi = usize::from(MSI_CAP_OFFSET);
        bytes[msi] = PCI_CAP_ID_MSI;
        bytes[msi + 1] = 0;

        Self { bytes }
    }

    /// Reads `size` bytes at `offset`. Bytes past the end of the image read as all-ones.
    pub fn read(&self, offset: u16, size: usize) -> u32 {
        let mut value = 0u32;
        for i in 0..size.min(4) {
            let byte = self
                .bytes
                .get(usize::from(offset) + i)
                .copied()
                .unwrap_or(0xFF);
            value |= u32::from(byte) << (8 * i);
        }
        value
    }

    /// Applies a config write, leaving device-owned bits untouched.
    pub fn write(&mut self, offset: u16, size: usize, value: u32) {
        for i in 0..size.min(4) {
            let addr = usize::from(offset) + i;
            let Some(slot) = self.bytes.get(addr).copied() else {
                break;
            };
            let mask = writable_mask(addr);
            let new = (value >> (8 * i)) as u8;
            self.bytes[addr] = (slot & !mask) | (new & mask);
        }
    }

    pub fn command(&self) -> u16 {
        self.read_u16(usize::from(PCI_COMMAND_OFFSET))
    }

    pub fn msi_control(&self) -> u16 {
        self.read_u16(usize::from(MSI_CAP_OFFSET) + MSI_CONTROL)
    }

    pub fn msi_enabled(&self) -> bool {
        self.msi_control() & PCI_MSI_FLAGS_ENABLE != 0
    }

    /// The programmed MSI message, if MSI is enabled.
    pub fn msi_message(&self) -> Option<MsiMessage> {
        if !self.msi_enabled() {
            return None;
        }
        let base = usize::from(MSI_CAP_OFFSET);
        let address = u32::from_le_bytes([
            self.bytes[base + MSI_ADDRESS],
            self.bytes[base + MSI_ADDRESS + 1],
            self.bytes[base + MSI_ADDRESS + 2],
            self.bytes[base + MSI_ADDRESS + 3],
        ]);
        Some(MsiMessage {
            address: u64::from(address),
            data: self.read_u16(base + MSI_DATA),
        })
    }

    pub fn as_bytes(&self) -> &[u8; PCI_CONFIG_SPACE_SIZE] {
        &self.bytes
    }

    fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.bytes[offset], self.bytes[offset + 1]])
    }
}

/// Bits of the byte at `addr` a config write may change.
fn writable_mask(addr: usize) -> u8 {
    let msi = usize::from(MSI_CAP_OFFSET);
    match addr {
        // Vendor/device IDs.
        0x00..=0x03 => 0,
        // Status.
        0x06..=0x07 => 0,
        // Revision and class code.
        0x08..=0x0B => 0,
        a if a == usize::from(PCI_HEADER_TYPE_OFFSET) => 0,
        a if a == usize::from(PCI_CAP_PTR_OFFSET) => 0,
        a if a == usize::from(PCI_INTERRUPT_PIN_OFFSET) => 0,
        // Capability ID and next pointer.
        a if a == msi || a == msi + 1 => 0,
        a if a == msi + MSI_CONTROL => PCI_MSI_FLAGS_ENABLE as u8,
        a if a == msi + MSI_CONTROL + 1 => 0,
        // Upper half of the 32-bit MSI data register is reserved.
        a if (msi + MSI_DATA + 2..msi + MSI_DATA + 4).contains(&a) => 0,
        _ => 0xFF,
    }
}
