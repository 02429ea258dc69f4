//! ELF and raw-binary loading into physical memory.
//!
//! Walks `PT_LOAD` program headers, copies segment bytes, and zero-fills
//! BSS, going through this chip's `PhysicalMemory::init` contract so loads
//! use the same region dispatch guest accesses do (`init` bypasses the
//! `writable()` gate boot ROM and other read-only regions impose on guest
//! code).

use crate::memory::{Agent, PhysicalMemory};
use goblin::elf::{program_header::PT_LOAD, Elf};

/// Parse `buffer` as an ELF image and copy its `PT_LOAD` segments into
/// `mem` at their physical addresses (`p_paddr` if nonzero, else `p_vaddr`).
/// Returns the entry point.
pub fn load_elf(buffer: &[u8], mem: &mut PhysicalMemory) -> Result<u64, String> {
    let elf = Elf::parse(buffer).map_err(|e| format!("ELF parse error: {e}"))?;

    for ph in &elf.program_headers {
        if ph.p_type != PT_LOAD || ph.p_memsz == 0 {
            continue;
        }

        let file_size = ph.p_filesz as usize;
        let mem_size = ph.p_memsz as usize;
        let file_offset = ph.p_offset as usize;

        if file_offset + file_size > buffer.len() {
            return Err("segment exceeds file bounds".to_string());
        }

        let target_addr = if ph.p_paddr != 0 { ph.p_paddr } else { ph.p_vaddr };

        if file_size > 0 {
            mem.init(Agent::Loader, target_addr, &buffer[file_offset..file_offset + file_size])
                .map_err(|e| format!("failed to load segment at {target_addr:#x}: {e}"))?;
        }

        if mem_size > file_size {
            let zeros = vec![0u8; mem_size - file_size];
            mem.init(Agent::Loader, target_addr + file_size as u64, &zeros)
                .map_err(|e| format!("failed to zero bss at {target_addr:#x}: {e}"))?;
        }
    }

    log::debug!(
        "ELF loaded: entry={:#x}, segments={}",
        elf.entry,
        elf.program_headers.len()
    );

    Ok(elf.entry)
}

/// Load a raw (headerless) binary file's bytes starting at `addr`.
pub fn load_raw(buffer: &[u8], addr: u64, mem: &mut PhysicalMemory) -> Result<(), String> {
    mem.init(Agent::Loader, addr, buffer)
        .map_err(|e| format!("failed to load raw image at {addr:#x}: {e}"))
}

/// Preload a single 64-bit word at `addr`.
pub fn preload_word(addr: u64, value: u64, mem: &mut PhysicalMemory) -> Result<(), String> {
    mem.init(Agent::Loader, addr, &value.to_le_bytes())
        .map_err(|e| format!("failed to preload word at {addr:#x}: {e}"))
}
