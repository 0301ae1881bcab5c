//! BAR size discovery.
//!
//! At attach the device learns each BAR's size from the remote endpoint with the standard PCI
//! probe: write all-ones to the BAR register, read it back, clear the flag bits and decode
//! `!masked + 1`.

use pciefw_protocol::{AccessWidth, PCI_NUM_BARS};
use tracing::{info, warn};

use crate::error::TransactionError;
use crate::session::Session;
use crate::transport::Transport;

pub const PCI_BAR0_OFFSET: u64 = 0x10;
/// Low flag bits of a BAR register (space indicator, type, prefetchable).
pub const PCI_BAR_FLAG_MASK: u32 = 0xF;
pub const PCI_BAR_SPACE_IO: u32 = 0x1;

const PCI_BAR_PROBE: u64 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarKind {
    Memory,
    Io,
}

/// A discovered, locally mapped BAR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarWindow {
    pub index: u8,
    pub kind: BarKind,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BarTable {
    windows: [Option<BarWindow>; PCI_NUM_BARS],
}

impl BarTable {
    pub fn get(&self, index: u8) -> Option<BarWindow> {
        self.windows.get(usize::from(index)).copied().flatten()
    }

    /// Size of BAR `index`, 0 if unmapped.
    pub fn size(&self, index: u8) -> u64 {
        self.get(index).map_or(0, |w| w.size)
    }

    pub fn sizes(&self) -> [u64; PCI_NUM_BARS] {
        core::array::from_fn(|i| self.windows[i].map_or(0, |w| w.size))
    }

    /// Mapped windows in BAR order.
    pub fn iter(&self) -> impl Iterator<Item = BarWindow> + '_ {
        self.windows.iter().flatten().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.iter().all(Option::is_none)
    }

    fn insert(&mut self, window: BarWindow) {
        self.windows[usize::from(window.index)] = Some(window);
    }
}

pub const fn bar_config_offset(index: u8) -> u64 {
    PCI_BAR0_OFFSET + 4 * index as u64
}

/// Decodes a flag-masked BAR probe value into a size; 0 means the BAR is unused.
pub fn decode_bar_size(masked: u32) -> u64 {
    u64::from((!masked).wrapping_add(1))
}

/// Decodes the raw value read back after writing all-ones to a BAR register.
pub fn decode_bar_probe(probe: u32) -> Option<(BarKind, u64)> {
    let kind = if probe & PCI_BAR_SPACE_IO != 0 {
        BarKind::Io
    } else {
        BarKind::Memory
    };

    let mut masked = probe & !PCI_BAR_FLAG_MASK;
    if masked == 0 {
        return None;
    }
    // 16-bit I/O decoders read back zeros in the upper half.
    if kind == BarKind::Io && masked & 0xFFFF_0000 == 0 {
        masked |= 0xFFFF_0000;
    }

    match decode_bar_size(masked) {
        0 => None,
        size => Some((kind, size)),
    }
}

impl<T: Transport> Session<T> {
    /// Probes all six BARs and records the result in the session's BAR table.
    ///
    /// A failed probe leaves that BAR unmapped; discovery always visits every index.
    pub fn discover_bars(&mut self) -> BarTable {
        let mut table = BarTable::default();
        for index in 0..PCI_NUM_BARS as u8 {
            match self.probe_bar(index) {
                Ok(Some(window)) => {
                    info!(
                        bar = index,
                        kind = ?window.kind,
                        size = window.size,
                        "discovered remote BAR"
                    );
                    table.insert(window);
                }
                Ok(None) => {}
                Err(err) => warn!(bar = index, %err, "BAR probe failed; leaving BAR unmapped"),
            }
        }
        self.set_bars(table);
        table
    }

    fn probe_bar(&mut self, index: u8) -> Result<Option<BarWindow>, TransactionError> {
        let offset = bar_config_offset(index);
        self.write_config(offset, AccessWidth::Dword, PCI_BAR_PROBE)?;
        let probe = self.read_config(offset, AccessWidth::Dword)? as u32;
        Ok(decode_bar_probe(probe).map(|(kind, size)| BarWindow { index, kind, size }))
    }
}
