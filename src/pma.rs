//! Physical memory attribute checks, applied after MMU translation.
//!
//! The walker and the regular load/store path both funnel through a PMA
//! gate before the address reaches `PhysicalMemory`.

use crate::error::Trap;
use crate::memory::dram::UNCACHEABLE_ALIAS_BIT;
use crate::mmu::{AccessType, Mode};

pub const L1D_LINE_SIZE: u64 = 64;

pub const DRAM_BASE: u64 = 0x80_0000_0000;
pub const DRAM_TOP: u64 = 0x88_0000_0000; // base + 32 GiB ceiling
pub const ESR_BASE: u64 = 0x01_0000_0000;
pub const ESR_TOP: u64 = 0x02_0000_0000;

/// Base of the MPROT-guarded window (the SP region's ROM/SRAM span).
pub const MPROT_GUARD_BASE: u64 = 0x4000_0000;
const MPROT_EN: u64 = 0x100;

/// `[base, base + 4KiB*2^size)`, capped at a 16MiB span, per
/// `examples/original_source/sw-sysemu/pma_er.cpp`'s `mmode_region_end`/
/// `smode_region_end`.
fn mprot_region_end(base: u64, size_field: u64) -> u64 {
    base + (0x1000u64 << size_field.min(12))
}

/// Enforce the neighborhood's `MPROT` register over the MPROT-guarded
/// window: when `MPROT_EN` (bit 8) is set, `[base, mmode_end)` is M-mode
/// only and `[mmode_end, smode_end)` is S-mode-and-above, mirroring
/// `check_mram_pmp_access` in `examples/original_source/sw-sysemu/pma_er.cpp`.
/// `mmode_end`/`smode_end` come from the 4-bit size fields packed into
/// `mprot` bits `[7:4]` (M-mode) and `[3:0]` (S-mode).
fn check_mprot(addr: u64, mprot: u64, mode: Mode) -> bool {
    if mprot & MPROT_EN == 0 {
        return true;
    }
    let mmode_end = mprot_region_end(MPROT_GUARD_BASE, (mprot >> 4) & 0xF);
    let smode_end = mprot_region_end(MPROT_GUARD_BASE, mprot & 0xF);
    if addr < mmode_end {
        mode == Mode::Machine
    } else if smode_end > mmode_end && addr < smode_end {
        mode != Mode::User
    } else {
        true
    }
}

fn access_fault(access: AccessType, addr: u64) -> Trap {
    match access {
        AccessType::Instruction => Trap::InstructionAccessFault(addr),
        AccessType::Load => Trap::LoadAccessFault(addr),
        AccessType::Store => Trap::StoreAccessFault(addr),
    }
}

/// Is `addr` the DRAM region including its uncacheable alias?
fn in_dram_or_alias(addr: u64) -> bool {
    let canonical = addr & !UNCACHEABLE_ALIAS_BIT;
    (DRAM_BASE..DRAM_TOP).contains(&canonical)
}

fn is_uncacheable_alias(addr: u64) -> bool {
    addr & UNCACHEABLE_ALIAS_BIT != 0 && in_dram_or_alias(addr)
}

/// Collapse a DRAM uncacheable alias to its canonical physical address
/// ("Physical memory": "the emulator collapses it to the base
/// physical address after PMA check").
pub fn collapse_alias(addr: u64) -> u64 {
    if is_uncacheable_alias(addr) {
        addr & !UNCACHEABLE_ALIAS_BIT
    } else {
        addr
    }
}

/// One PMA-checked (sub-)access, already collapsed and size/alignment
/// validated.
#[derive(Debug, Clone, Copy)]
pub struct CheckedAccess {
    pub addr: u64,
    pub size: u8,
}

/// Validate and rewrite a single access. `is_atomic` forbids uncacheable
/// targets outright; `is_sp_hart` permits stores to the uncacheable DRAM
/// alias, since stores to it from any other hart are forbidden. `mprot` is
/// the issuing hart's neighborhood's raw `MPROT` register value, checked
/// against `mode` over the MPROT-guarded window; pass `0` (gate disabled)
/// for accesses the MPROT register doesn't apply to, such as page-table
/// walker reads.
pub fn check_access(
    addr: u64,
    size: u8,
    access: AccessType,
    is_atomic: bool,
    is_sp_hart: bool,
    mprot: u64,
    mode: Mode,
) -> Result<CheckedAccess, Trap> {
    if (ESR_BASE..ESR_TOP).contains(&addr) && size != 8 {
        return Err(access_fault(access, addr));
    }
    if (ESR_BASE..ESR_TOP).contains(&addr) && addr % 8 != 0 {
        return Err(access_fault(access, addr));
    }

    let uncacheable = is_uncacheable_alias(addr);
    if uncacheable && is_atomic {
        return Err(access_fault(access, addr));
    }
    if uncacheable && access == AccessType::Store && !is_sp_hart {
        return Err(access_fault(access, addr));
    }

    if !check_mprot(addr, mprot, mode) {
        return Err(access_fault(access, addr));
    }

    Ok(CheckedAccess {
        addr: collapse_alias(addr),
        size,
    })
}

/// Split a scalar access that may cross an L1D line boundary into one or
/// two sub-accesses issued in order.
pub fn split_line_crossing(addr: u64, size: u8) -> (CheckedAccess, Option<CheckedAccess>) {
    let line_off = addr % L1D_LINE_SIZE;
    if line_off + size as u64 <= L1D_LINE_SIZE {
        return (CheckedAccess { addr, size }, None);
    }
    let first_len = (L1D_LINE_SIZE - line_off) as u8;
    let second_len = size - first_len;
    (
        CheckedAccess { addr, size: first_len },
        Some(CheckedAccess {
            addr: addr + first_len as u64,
            size: second_len,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_collapses() {
        let aliased = (DRAM_BASE + 0x1000) | UNCACHEABLE_ALIAS_BIT;
        assert_eq!(collapse_alias(aliased), DRAM_BASE + 0x1000);
    }

    #[test]
    fn store_to_uncacheable_from_non_sp_forbidden() {
        let aliased = (DRAM_BASE + 0x1000) | UNCACHEABLE_ALIAS_BIT;
        let result = check_access(aliased, 8, AccessType::Store, false, false, 0, Mode::Machine);
        assert!(matches!(result, Err(Trap::StoreAccessFault(_))));
    }

    #[test]
    fn store_to_uncacheable_from_sp_allowed() {
        let aliased = (DRAM_BASE + 0x1000) | UNCACHEABLE_ALIAS_BIT;
        let result = check_access(aliased, 8, AccessType::Store, false, true, 0, Mode::Machine).unwrap();
        assert_eq!(result.addr, DRAM_BASE + 0x1000);
    }

    #[test]
    fn esr_requires_8_byte_aligned() {
        assert!(check_access(ESR_BASE + 4, 4, AccessType::Load, false, false, 0, Mode::Machine).is_err());
        assert!(check_access(ESR_BASE + 1, 8, AccessType::Load, false, false, 0, Mode::Machine).is_err());
        assert!(check_access(ESR_BASE + 8, 8, AccessType::Load, false, false, 0, Mode::Machine).is_ok());
    }

    #[test]
    fn mprot_disabled_permits_any_mode() {
        let result = check_access(MPROT_GUARD_BASE, 8, AccessType::Load, false, false, 0, Mode::User);
        assert!(result.is_ok());
    }

    #[test]
    fn mprot_mmode_window_blocks_non_machine() {
        let mprot = MPROT_EN | (0 << 4); // mmode window = [base, base+0x1000)
        let result = check_access(MPROT_GUARD_BASE, 8, AccessType::Load, false, false, mprot, Mode::Supervisor);
        assert!(matches!(result, Err(Trap::LoadAccessFault(_))));
        let result = check_access(MPROT_GUARD_BASE, 8, AccessType::Load, false, false, mprot, Mode::Machine);
        assert!(result.is_ok());
    }

    #[test]
    fn mprot_smode_window_blocks_user_only() {
        // mmode size field 0 -> mmode_end = base+0x1000; smode size field 4
        // -> smode_end = base+0x10000, so [base+0x1000, base+0x10000) is
        // S-and-above.
        let mprot = MPROT_EN | (0 << 4) | 4;
        let addr = MPROT_GUARD_BASE + 0x2000;
        assert!(check_access(addr, 8, AccessType::Load, false, false, mprot, Mode::User).is_err());
        assert!(check_access(addr, 8, AccessType::Load, false, false, mprot, Mode::Supervisor).is_ok());
        assert!(check_access(addr, 8, AccessType::Load, false, false, mprot, Mode::Machine).is_ok());
    }

    #[test]
    fn mprot_beyond_guarded_windows_permits_any_mode() {
        let mprot = MPROT_EN | (0 << 4) | 0;
        let addr = MPROT_GUARD_BASE + 0x2000; // past both 4KiB windows
        assert!(check_access(addr, 8, AccessType::Load, false, false, mprot, Mode::User).is_ok());
    }

    #[test]
    fn line_crossing_splits() {
        let addr = 60; // 4 bytes left in the 64-byte line
        let (a, b) = split_line_crossing(addr, 8);
        assert_eq!(a.size, 4);
        let b = b.unwrap();
        assert_eq!(b.addr, 64);
        assert_eq!(b.size, 4);
    }

    #[test]
    fn non_crossing_access_not_split() {
        let (a, b) = split_line_crossing(0, 8);
        assert_eq!(a.size, 8);
        assert!(b.is_none());
    }
}
