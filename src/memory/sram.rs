//! Service-processor SRAM region: any access size, read/write/executable
//!.

use super::{Agent, MemoryRegion};
use crate::error::BusError;

pub struct Sram {
    base: u64,
    data: Vec<u8>,
}

impl Sram {
    pub fn new(base: u64, size: u64) -> Self {
        Sram {
            base,
            data: vec![0u8; size as usize],
        }
    }
}

impl MemoryRegion for Sram {
    fn first(&self) -> u64 {
        self.base
    }

    fn last(&self) -> u64 {
        self.base + self.data.len() as u64 - 1
    }

    fn read(&self, _agent: Agent, offset: u64, buf: &mut [u8]) -> Result<(), BusError> {
        let off = offset as usize;
        let end = off + buf.len();
        if end > self.data.len() {
            return Err(BusError::Unmapped(self.base + offset));
        }
        buf.copy_from_slice(&self.data[off..end]);
        Ok(())
    }

    fn write(&mut self, _agent: Agent, offset: u64, buf: &[u8]) -> Result<(), BusError> {
        let off = offset as usize;
        let end = off + buf.len();
        if end > self.data.len() {
            return Err(BusError::Unmapped(self.base + offset));
        }
        self.data[off..end].copy_from_slice(buf);
        Ok(())
    }

    fn init(&mut self, agent: Agent, offset: u64, buf: &[u8]) -> Result<(), BusError> {
        self.write(agent, offset, buf)
    }

    fn accepts_size(&self, size: u8) -> bool {
        size > 0 && (size as u64) <= 64
    }

    fn writable(&self) -> bool {
        true
    }

    fn executable(&self) -> bool {
        true
    }
}
