#![allow(dead_code)]

use pciefw::{BarWindow, DeviceHost, DmaError, MsiMessage};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Host that records every callback.
#[derive(Debug, Default)]
pub struct RecordingHost {
    pub mapped: Vec<BarWindow>,
    pub unmapped: Vec<u8>,
    pub dma: Vec<(u64, Vec<u8>)>,
    pub msi: Vec<MsiMessage>,
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
