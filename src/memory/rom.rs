//! Boot ROM region: any access size, executable, not writable by guest
//! code, `init`-able by the loader at startup.

use super::{Agent, MemoryRegion};
use crate::error::BusError;

pub struct Rom {
    base: u64,
    size: u64,
    data: Vec<u8>,
}

impl Rom {
    pub fn new(base: u64, size: u64, contents: Vec<u8>) -> Self {
        let mut data = contents;
        data.resize(size as usize, 0);
        Rom { base, size, data }
    }
}

impl MemoryRegion for Rom {
    fn first(&self) -> u64 {
        self.base
    }

    fn last(&self) -> u64 {
        self.base + self.size - 1
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

    fn write(&mut self, _agent: Agent, offset: u64, _buf: &[u8]) -> Result<(), BusError> {
        Err(BusError::ReadOnly(self.base + offset))
    }

    fn init(&mut self, _agent: Agent, offset: u64, buf: &[u8]) -> Result<(), BusError> {
        let off = offset as usize;
        let end = off + buf.len();
        if end > self.data.len() {
            return Err(BusError::Unmapped(self.base + offset));
        }
        self.data[off..end].copy_from_slice(buf);
        Ok(())
    }

    fn accepts_size(&self, size: u8) -> bool {
        size > 0 && (size as u64) <= 64
    }

    fn writable(&self) -> bool {
        false
    }

    fn executable(&self) -> bool {
        true
    }
}
