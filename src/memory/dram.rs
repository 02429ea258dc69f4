//! Dense, byte-addressable DRAM region.
//!
//! Under this chip's single-threaded cooperative scheduler there is only
//! ever one accessor per tick, so a plain owned `Vec<u8>` backs the whole
//! region with no interior-mutability or concurrency tricks.
//!
//! Firmware conventionally carves DRAM further into mbox/mcode/mdata/sbox/
//! scode/sdata/osbox sub-ranges, but the address decoder only needs the
//! coarse DRAM region to be address-disjoint from its neighbors, so the
//! sub-ranges below are documented for reference and not modeled as
//! distinct regions:
//!
//!   dram_mbox  [base+0x0000_0000, base+0x0000_1000)
//!   dram_mcode [base+0x0000_1000, base+0x0010_1000)
//!   dram_mdata [base+0x0010_1000, base+0x0020_1000)
//!   dram_sbox  [base+0x0020_1000, base+0x0020_2000)
//!   dram_scode [base+0x0020_2000, base+0x0120_2000)
//!   dram_sdata [base+0x0120_2000, base+0x0220_2000)
//!   dram_osbox [base+0x0220_2000, ...)

use super::{Agent, MemoryRegion};
use crate::error::BusError;

/// Bit that, when set in a DRAM-range physical address, selects the
/// uncacheable alias of the same underlying bytes. PMA collapses
/// it back to the canonical address after the access-control check.
pub const UNCACHEABLE_ALIAS_BIT: u64 = 0x40_0000_0000;

pub struct Dram {
    base: u64,
    data: Vec<u8>,
}

impl Dram {
    pub fn new(base: u64, size: u64) -> Self {
        Dram {
            base,
            data: vec![0u8; size as usize],
        }
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

impl MemoryRegion for Dram {
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
        // "any <= line": enforced by PMA's line-crossing splitter (pma.rs),
        // not here; the region itself accepts any byte count that fits.
        size > 0 && (size as u64) <= 64
    }

    fn writable(&self) -> bool {
        true
    }

    fn executable(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut d = Dram::new(0x8000_0000, 0x1000);
        d.write(Agent::Loader, 0x10, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        d.read(Agent::Loader, 0x10, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn out_of_bounds() {
        let d = Dram::new(0x8000_0000, 0x10);
        let mut buf = [0u8; 4];
        assert!(d.read(Agent::Loader, 0x100, &mut buf).is_err());
    }
}
