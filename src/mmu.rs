//! Virtual-to-physical translation: bare / Sv39 / Sv48 page-table walks,
//! A/D-bit enforcement, and a direct-mapped TLB.
//!
//! Single-threaded cooperative scheduler, so the walker takes no
//! `Send + Sync` bound on the page-table-walk bus. PTE reads are modeled as
//! going through the PMA's dedicated page-table-walk access path
//! (`pma::check_ptw_access`), just like any other memory access.

use crate::error::Trap;
use crate::memory::PhysicalMemory;
use crate::pma;

pub const PAGE_SIZE: u64 = 4096;
pub const PTE_SIZE: u64 = 8;

pub const PERM_V: u64 = 1 << 0;
pub const PERM_R: u64 = 1 << 1;
pub const PERM_W: u64 = 1 << 2;
pub const PERM_X: u64 = 1 << 3;
pub const PERM_U: u64 = 1 << 4;
pub const PERM_G: u64 = 1 << 5;
pub const PERM_A: u64 = 1 << 6;
pub const PERM_D: u64 = 1 << 7;

pub const TLB_SIZE: usize = 64;
const TLB_MASK: usize = TLB_SIZE - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Instruction,
    Load,
    Store,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    User,
    Supervisor,
    Machine,
}

#[derive(Debug, Clone, Copy)]
struct TlbEntry {
    vpn: u64,
    ppn: u64,
    asid: u16,
    perm: u64,
    level: u8,
    valid: bool,
}

impl TlbEntry {
    const EMPTY: TlbEntry = TlbEntry {
        vpn: 0,
        ppn: 0,
        asid: 0,
        perm: 0,
        level: 0,
        valid: false,
    };
}

/// Direct-mapped TLB, one per hart.
pub struct Tlb {
    entries: [TlbEntry; TLB_SIZE],
}

impl Tlb {
    pub fn new() -> Self {
        Tlb {
            entries: [TlbEntry::EMPTY; TLB_SIZE],
        }
    }

    pub fn flush(&mut self) {
        self.entries = [TlbEntry::EMPTY; TLB_SIZE];
    }

    pub fn flush_asid(&mut self, asid: u16) {
        for e in self.entries.iter_mut() {
            if e.valid && e.asid == asid {
                e.valid = false;
            }
        }
    }

    pub fn flush_va(&mut self, va: u64) {
        let vpn = va >> 12;
        let idx = (vpn as usize) & TLB_MASK;
        if self.entries[idx].valid && self.entries[idx].vpn == vpn {
            self.entries[idx].valid = false;
        }
    }

    fn lookup(&self, vpn: u64, asid: u16) -> Option<&TlbEntry> {
        let idx = (vpn as usize) & TLB_MASK;
        let e = &self.entries[idx];
        if e.valid && e.vpn == vpn && (e.asid == asid || e.perm & PERM_G != 0) {
            Some(e)
        } else {
            None
        }
    }

    fn insert(&mut self, vpn: u64, ppn: u64, asid: u16, perm: u64, level: u8) {
        let idx = (vpn as usize) & TLB_MASK;
        self.entries[idx] = TlbEntry {
            vpn,
            ppn,
            asid,
            perm,
            level,
            valid: true,
        };
    }
}

impl Default for Tlb {
    fn default() -> Self {
        Self::new()
    }
}

fn page_fault(access: AccessType, addr: u64) -> Trap {
    match access {
        AccessType::Instruction => Trap::InstructionPageFault(addr),
        AccessType::Load => Trap::LoadPageFault(addr),
        AccessType::Store => Trap::StorePageFault(addr),
    }
}

fn access_fault(access: AccessType, addr: u64) -> Trap {
    match access {
        AccessType::Instruction => Trap::InstructionAccessFault(addr),
        AccessType::Load => Trap::LoadAccessFault(addr),
        AccessType::Store => Trap::StoreAccessFault(addr),
    }
}

/// `satp`-style atp register: mode in bits[63:60], asid in bits[59:44],
/// PPN in bits[43:0]. Used for both `satp` (S-stage) and `matp` (minion
/// address translation, Core data model) since both follow the
/// same encoding in this chip.
#[derive(Debug, Clone, Copy)]
pub struct Atp {
    pub mode: u8,
    pub asid: u16,
    pub ppn: u64,
}

impl Atp {
    pub const BARE: u8 = 0;
    pub const SV39: u8 = 8;
    pub const SV48: u8 = 9;

    pub fn decode(bits: u64) -> Self {
        Atp {
            mode: ((bits >> 60) & 0xF) as u8,
            asid: ((bits >> 44) & 0xFFFF) as u16,
            ppn: bits & 0xFFF_FFFF_FFFF,
        }
    }
}

fn levels_for_mode(mode: u8) -> Option<u8> {
    match mode {
        Atp::SV39 => Some(3),
        Atp::SV48 => Some(4),
        _ => None,
    }
}

/// Check canonical sign-extension of a virtual address for the given mode
/// (39 or 48 usable VA bits).
fn check_canonical(va: u64, levels: u8) -> bool {
    let va_bits = 9 * levels as u32 + 12;
    let top = va >> (va_bits - 1);
    top == 0 || top == (u64::MAX >> (va_bits - 1))
}

fn pa_from_ppn(ppn_full: u64, level: u8, addr: u64) -> u64 {
    let super_shift = 12 + 9 * level as u32;
    let super_mask = (1u64 << super_shift) - 1;
    ((ppn_full << 12) & !super_mask) | (addr & super_mask)
}

fn check_permission(perm: u64, mode: Mode, mstatus: u64, access: AccessType) -> bool {
    let r = perm & PERM_R != 0;
    let w = perm & PERM_W != 0;
    let x = perm & PERM_X != 0;
    let u = perm & PERM_U != 0;
    let mxr = (mstatus >> 19) & 1 != 0;
    let sum = (mstatus >> 18) & 1 != 0;

    match mode {
        Mode::User => {
            if !u {
                return false;
            }
        }
        Mode::Supervisor => {
            if u && !sum {
                return false;
            }
        }
        Mode::Machine => return true,
    }

    match access {
        AccessType::Instruction => x,
        AccessType::Load => r || (mxr && x),
        AccessType::Store => w,
    }
}

/// Translate `va` under the given `mode`/`atp`/`mstatus`, reading page-table
/// entries through `mem`. Returns the translated physical address or a
/// `Trap` on the original access class, .
///
/// `effective_mode` must already account for `MPRV`/`MPP` (the caller
/// resolves that "effective mode" rule before calling this).
pub fn translate(
    mem: &PhysicalMemory,
    tlb: &mut Tlb,
    effective_mode: Mode,
    atp: Atp,
    mstatus: u64,
    addr: u64,
    access: AccessType,
) -> Result<u64, Trap> {
    if atp.mode == Atp::BARE {
        return Ok(addr);
    }
    let levels = levels_for_mode(atp.mode).ok_or_else(|| page_fault(access, addr))?;
    if !check_canonical(addr, levels) {
        return Err(page_fault(access, addr));
    }

    let vpn = addr >> 12;
    if let Some(entry) = tlb.lookup(vpn, atp.asid) {
        if check_permission(entry.perm, effective_mode, mstatus, access) {
            if access == AccessType::Store && entry.perm & PERM_D == 0 {
                // fall through to walker to raise the D-bit page fault
            } else {
                return Ok(pa_from_ppn(entry.ppn, entry.level, addr));
            }
        }
    }

    let mut ppn = atp.ppn;
    let mut level = levels as i32 - 1;
    let pte;
    let final_level;
    loop {
        let vpn_i = (vpn >> (9 * level)) & 0x1FF;
        let pte_addr = (ppn << 12) + vpn_i * PTE_SIZE;
        // Page-table walker reads are a distinct access class from ordinary
        // data accesses (the original routes them through a separate
        // `pma_check_ptw_access`) and are not subject to the MPROT guard.
        let checked = pma::check_access(pte_addr, PTE_SIZE as u8, access, false, false, 0, Mode::Machine)
            .map_err(|_| access_fault(access, addr))?;
        let mut raw = [0u8; 8];
        mem.read(crate::memory::Agent::Loader, checked.addr, &mut raw)
            .map_err(|_| access_fault(access, addr))?;
        let word = u64::from_le_bytes(raw);

        let v = word & PERM_V != 0;
        let r = word & PERM_R != 0;
        let w = word & PERM_W != 0;
        let x = word & PERM_X != 0;
        if !v || (!r && w) {
            return Err(page_fault(access, addr));
        }
        if r || x {
            pte = word;
            final_level = level;
            break;
        }
        ppn = (word >> 10) & 0xFFF_FFFF_FFFF;
        level -= 1;
        if level < 0 {
            return Err(page_fault(access, addr));
        }
    }

    if !check_permission(pte, effective_mode, mstatus, access) {
        return Err(page_fault(access, addr));
    }

    if final_level > 0 {
        let low_bits_mask = (1u64 << (9 * final_level)) - 1;
        if (pte >> 10) & low_bits_mask != 0 {
            return Err(page_fault(access, addr));
        }
    }

    let a = pte & PERM_A != 0;
    let d = pte & PERM_D != 0;
    if !a {
        return Err(page_fault(access, addr));
    }
    if access == AccessType::Store && !d {
        return Err(page_fault(access, addr));
    }

    let ppn_full = (pte >> 10) & 0xFFF_FFFF_FFFF;
    let pa = pa_from_ppn(ppn_full, final_level as u8, addr);

    tlb.insert(vpn, ppn_full, atp.asid, pte & 0xFF, final_level as u8);

    Ok(pa)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Agent, PhysicalMemory, Region};

    fn mem_with_leaf(pte_addr_offset: u64, pte: u64, base: u64, size: u64) -> PhysicalMemory {
        let mut mem = PhysicalMemory::new();
        mem.add_region(Region::Dram(crate::memory::dram::Dram::new(base, size)));
        mem.write(Agent::Loader, base + pte_addr_offset, &pte.to_le_bytes())
            .unwrap();
        mem
    }

    #[test]
    fn bare_mode_identity() {
        let mem = PhysicalMemory::new();
        let mut tlb = Tlb::new();
        let atp = Atp { mode: Atp::BARE, asid: 0, ppn: 0 };
        let pa = translate(&mem, &mut tlb, Mode::Machine, atp, 0, 0x1234, AccessType::Load).unwrap();
        assert_eq!(pa, 0x1234);
    }

    #[test]
    fn sv39_single_level_leaf() {
        let base = 0x8000_0000u64;
        let leaf_ppn = base >> 12;
        let pte = (leaf_ppn << 10) | PERM_V | PERM_R | PERM_W | PERM_X | PERM_A | PERM_D;
        let mem = mem_with_leaf(0, pte, base, 0x10000);
        let mut tlb = Tlb::new();
        let atp = Atp { mode: Atp::SV39, asid: 0, ppn: base >> 12 };
        let va = 0x10;
        let pa = translate(&mem, &mut tlb, Mode::Supervisor, atp, 0, va, AccessType::Load).unwrap();
        assert_eq!(pa, base + 0x10);
    }

    #[test]
    fn invalid_pte_faults() {
        let base = 0x8000_0000u64;
        let mem = mem_with_leaf(0, 0, base, 0x1000);
        let mut tlb = Tlb::new();
        let atp = Atp { mode: Atp::SV39, asid: 0, ppn: base >> 12 };
        let err = translate(&mem, &mut tlb, Mode::Supervisor, atp, 0, 0x10, AccessType::Load);
        assert!(matches!(err, Err(Trap::LoadPageFault(_))));
    }

    #[test]
    fn load_without_accessed_bit_faults() {
        let base = 0x8000_0000u64;
        let leaf_ppn = base >> 12;
        let pte = (leaf_ppn << 10) | PERM_V | PERM_R | PERM_W;
        let mem = mem_with_leaf(0, pte, base, 0x10000);
        let mut tlb = Tlb::new();
        let atp = Atp { mode: Atp::SV39, asid: 0, ppn: base >> 12 };
        let err = translate(&mem, &mut tlb, Mode::Supervisor, atp, 0, 0x10, AccessType::Load);
        assert!(matches!(err, Err(Trap::LoadPageFault(_))));
    }

    #[test]
    fn store_without_dirty_bit_faults() {
        let base = 0x8000_0000u64;
        let leaf_ppn = base >> 12;
        let pte = (leaf_ppn << 10) | PERM_V | PERM_R | PERM_W | PERM_A;
        let mem = mem_with_leaf(0, pte, base, 0x10000);
        let mut tlb = Tlb::new();
        let atp = Atp { mode: Atp::SV39, asid: 0, ppn: base >> 12 };
        let err = translate(&mem, &mut tlb, Mode::Supervisor, atp, 0, 0x10, AccessType::Store);
        assert!(matches!(err, Err(Trap::StorePageFault(_))));
    }
}
