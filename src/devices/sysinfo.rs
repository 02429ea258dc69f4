//! System regs region.
//! A small fixed bank of miscellaneous chip-identity/status words: chip id,
//! hart count, and a hard-coded PLL-lock status (PLL read-data is always
//! "locked"; clock/PLL modeling is out of scope).

use crate::error::BusError;
use crate::memory::{Agent, MemoryRegion};

pub const SYSINFO_BASE: u64 = 0x4020_0000;
pub const SYSINFO_SIZE: u64 = 0x1000;

const REG_CHIP_ID: u64 = 0x00;
const REG_HART_COUNT: u64 = 0x08;
const REG_PLL_LOCK: u64 = 0x10;

pub struct SysInfo {
    base: u64,
    hart_count: u32,
}

impl SysInfo {
    pub fn new(hart_count: u32) -> Self {
        SysInfo {
            base: SYSINFO_BASE,
            hart_count,
        }
    }
}

impl MemoryRegion for SysInfo {
    fn first(&self) -> u64 {
        self.base
    }

    fn last(&self) -> u64 {
        self.base + SYSINFO_SIZE - 1
    }

    fn read(&self, _agent: Agent, offset: u64, buf: &mut [u8]) -> Result<(), BusError> {
        let value: u64 = match (offset, buf.len()) {
            (REG_CHIP_ID, _) => 0x4554_5343_3030_3100, // "ETSC001\0"
            (REG_HART_COUNT, _) => self.hart_count as u64,
            (REG_PLL_LOCK, _) => 1, // always locked, no PLL timing model
            _ => return Err(BusError::Unmapped(self.base + offset)),
        };
        match buf.len() {
            4 => buf.copy_from_slice(&(value as u32).to_le_bytes()),
            8 => buf.copy_from_slice(&value.to_le_bytes()),
            n => return Err(BusError::BadSize { addr: self.base + offset, size: n as u8 }),
        }
        Ok(())
    }

    fn write(&mut self, _agent: Agent, offset: u64, _buf: &[u8]) -> Result<(), BusError> {
        Err(BusError::ReadOnly(self.base + offset))
    }

    fn init(&mut self, _agent: Agent, _offset: u64, _buf: &[u8]) -> Result<(), BusError> {
        Ok(())
    }

    fn accepts_size(&self, size: u8) -> bool {
        size == 4 || size == 8
    }

    fn writable(&self) -> bool {
        false
    }

    fn executable(&self) -> bool {
        false
    }
}
