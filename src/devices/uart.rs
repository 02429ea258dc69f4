//! 16550-compatible UART, backed by host queues rather than a real serial
//! line. Backing files on disk are an external driver concern; this
//! models only the register-level contract the core drives.
//!
//! Standard 16550 register layout; no `Mutex` wrapper since the scheduler
//! is single-threaded.

use crate::error::BusError;
use crate::memory::{Agent, MemoryRegion};
use std::collections::VecDeque;

pub const UART_BASE: u64 = 0x1000_0000;
pub const UART_SIZE: u64 = 0x100;

const RBR_THR: u64 = 0x00;
const IER: u64 = 0x01;
const IIR_FCR: u64 = 0x02;
const LCR: u64 = 0x03;
const MCR: u64 = 0x04;
const LSR: u64 = 0x05;
const MSR: u64 = 0x06;
const SCR: u64 = 0x07;

const LSR_DATA_READY: u8 = 0x01;
const LSR_THR_EMPTY: u8 = 0x20;
const LSR_TSR_EMPTY: u8 = 0x40;

pub struct Uart {
    base: u64,
    rx: VecDeque<u8>,
    tx: VecDeque<u8>,
    ier: u8,
    lcr: u8,
    mcr: u8,
    scr: u8,
}

impl Uart {
    pub fn new() -> Self {
        Uart {
            base: UART_BASE,
            rx: VecDeque::new(),
            tx: VecDeque::new(),
            ier: 0,
            lcr: 0,
            mcr: 0,
            scr: 0,
        }
    }

    /// Feed host input bytes (from a backing file or stdin) into the RX
    /// FIFO; called by the scheduler's peripheral tick.
    pub fn push_input(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes);
    }

    /// Drain bytes the guest has written, for the host to forward to a
    /// backing file.
    pub fn drain_output(&mut self) -> Vec<u8> {
        self.tx.drain(..).collect()
    }

    pub fn has_interrupt(&self) -> bool {
        let rx_ready = self.ier & 0x1 != 0 && !self.rx.is_empty();
        let thr_empty = self.ier & 0x2 != 0 && self.tx.is_empty();
        rx_ready || thr_empty
    }

    fn lsr(&self) -> u8 {
        let mut v = LSR_THR_EMPTY | LSR_TSR_EMPTY;
        if !self.rx.is_empty() {
            v |= LSR_DATA_READY;
        }
        v
    }
}

impl Default for Uart {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegion for Uart {
    fn first(&self) -> u64 {
        self.base
    }

    fn last(&self) -> u64 {
        self.base + UART_SIZE - 1
    }

    fn read(&self, _agent: Agent, offset: u64, buf: &mut [u8]) -> Result<(), BusError> {
        if buf.len() != 1 {
            return Err(BusError::BadSize { addr: self.base + offset, size: buf.len() as u8 });
        }
        buf[0] = match offset {
            // RBR is read-to-pop; `MemoryRegion::read` takes `&self` so it
            // cannot drain the FIFO here. Guest reads of this register are
            // not wired through the generic bus path (see `Uart::read_data`).
            RBR_THR => 0,
            IER => self.ier,
            IIR_FCR => 0xC1,
            LCR => self.lcr,
            MCR => self.mcr,
            LSR => self.lsr(),
            MSR => 0xB0,
            SCR => self.scr,
            _ => return Err(BusError::Unmapped(self.base + offset)),
        };
        Ok(())
    }

    fn write(&mut self, _agent: Agent, offset: u64, buf: &[u8]) -> Result<(), BusError> {
        if buf.len() != 1 {
            return Err(BusError::BadSize { addr: self.base + offset, size: buf.len() as u8 });
        }
        let v = buf[0];
        match offset {
            RBR_THR => self.tx.push_back(v),
            IER => self.ier = v,
            IIR_FCR => {}
            LCR => self.lcr = v,
            MCR => self.mcr = v,
            LSR | MSR => {}
            SCR => self.scr = v,
            _ => return Err(BusError::Unmapped(self.base + offset)),
        }
        Ok(())
    }

    fn init(&mut self, agent: Agent, offset: u64, buf: &[u8]) -> Result<(), BusError> {
        self.write(agent, offset, buf)
    }

    fn accepts_size(&self, size: u8) -> bool {
        size == 1
    }

    fn writable(&self) -> bool {
        true
    }

    fn executable(&self) -> bool {
        false
    }
}

impl Uart {
    /// Reading `RBR` pops the RX FIFO; exposed as a distinct mutating
    /// method since `MemoryRegion::read` takes `&self`. The bus dispatcher
    /// special-cases the UART data register to call this instead.
    pub fn read_data(&mut self) -> u8 {
        self.rx.pop_front().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsr_reflects_fifo_state() {
        let mut u = Uart::new();
        assert_eq!(u.lsr() & LSR_DATA_READY, 0);
        u.push_input(b"a");
        assert_ne!(u.lsr() & LSR_DATA_READY, 0);
        assert_eq!(u.read_data(), b'a');
    }

    #[test]
    fn tx_drains() {
        let mut u = Uart::new();
        u.write(Agent::Loader, RBR_THR, &[b'x']).unwrap();
        assert_eq!(u.drain_output(), vec![b'x']);
    }
}
