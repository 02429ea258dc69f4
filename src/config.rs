//! Emulator configuration: topology sizing, DRAM size,
//! the run's termination ceiling, and the optional checker/GDB toggles.
//!
//! Plain `Serialize`/`Deserialize` data objects with no behavior beyond a
//! couple of derived accessors; this chip has no snapshot format of its own.

use serde::{Deserialize, Serialize};

/// Installed DRAM size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DramSize {
    Gb8,
    Gb16,
    Gb24,
    Gb32,
}

impl DramSize {
    pub const GIB: u64 = 1 << 30;

    pub fn bytes(self) -> u64 {
        match self {
            DramSize::Gb8 => 8 * Self::GIB,
            DramSize::Gb16 => 16 * Self::GIB,
            DramSize::Gb24 => 24 * Self::GIB,
            DramSize::Gb32 => 32 * Self::GIB,
        }
    }

    pub fn from_gib(gib: u64) -> Option<Self> {
        Some(match gib {
            8 => DramSize::Gb8,
            16 => DramSize::Gb16,
            24 => DramSize::Gb24,
            32 => DramSize::Gb32,
            _ => return None,
        })
    }
}

impl Default for DramSize {
    fn default() -> Self {
        DramSize::Gb8
    }
}

/// Checkers the scheduler can run alongside normal execution. These are
/// presence flags only; a checker gates the lightweight invariant
/// assertions this crate makes around a tensor op (e.g. scratchpad row
/// lock bookkeeping) rather than a full separate model.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CheckerConfig {
    pub coherency: bool,
    pub scratchpad: bool,
    pub tensor_store: bool,
}

/// Full emulator configuration, built from CLI flags or defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulatorConfig {
    pub n_compute_shires: u32,
    pub n_memory_shires: u32,
    pub dram_size: DramSize,
    pub reset_pc: u64,
    pub max_cycles: u64,
    /// GDB-stub acceptance; the wire
    /// protocol itself is an external collaborator out of scope here, so
    /// this only records whether the scheduler should leave a hook point
    /// for one.
    pub enable_gdb: bool,
    pub checkers: CheckerConfig,
}

impl EmulatorConfig {
    pub fn new(n_compute_shires: u32, n_memory_shires: u32) -> Self {
        EmulatorConfig {
            n_compute_shires,
            n_memory_shires,
            dram_size: DramSize::default(),
            reset_pc: 0x80_0000_0000,
            max_cycles: u64::MAX,
            enable_gdb: false,
            checkers: CheckerConfig::default(),
        }
    }
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        EmulatorConfig::new(1, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dram_size_round_trips_gib() {
        for gib in [8, 16, 24, 32] {
            let size = DramSize::from_gib(gib).unwrap();
            assert_eq!(size.bytes(), gib * DramSize::GIB);
        }
        assert!(DramSize::from_gib(12).is_none());
    }
}
