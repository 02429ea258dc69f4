//! Chip topology: shires, neighborhoods, minions, harts, expressed as plain
//! indices — no owning pointers, no back-references, just `u32`-wrapped
//! ids resolved against `Chip`'s arrays.

pub const MINIONS_PER_NEIGHBORHOOD: u32 = 8;
pub const NEIGHBORHOODS_PER_COMPUTE_SHIRE: u32 = 4;
pub const HARTS_PER_MINION: u32 = 2;

/// Index of a hart within the chip's flat hart array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HartId(pub u32);

/// Index of a minion (core) within the chip's flat core array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CoreId(pub u32);

impl HartId {
    pub fn core(self) -> CoreId {
        CoreId(self.0 / HARTS_PER_MINION)
    }

    /// 0 or 1: which of the minion's two harts this is.
    pub fn thread(self) -> u32 {
        self.0 % HARTS_PER_MINION
    }
}

impl CoreId {
    pub fn hart(self, thread: u32) -> HartId {
        HartId(self.0 * HARTS_PER_MINION + thread)
    }
}

/// Role a shire plays in the chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShireKind {
    /// Single-threaded service processor.
    Io,
    /// DRAM controller, no compute minions.
    Memory,
    /// Ordinary compute tile: `NEIGHBORHOODS_PER_COMPUTE_SHIRE` neighborhoods
    /// of `MINIONS_PER_NEIGHBORHOOD` minions each.
    Compute,
}

/// Static description of one shire: its kind and the range of core/hart
/// indices it owns in the chip's flat arrays.
#[derive(Debug, Clone, Copy)]
pub struct ShireDesc {
    pub kind: ShireKind,
    pub core_base: u32,
    pub core_count: u32,
}

impl ShireDesc {
    pub fn hart_base(&self) -> u32 {
        self.core_base * HARTS_PER_MINION
    }

    pub fn hart_count(&self) -> u32 {
        self.core_count * HARTS_PER_MINION
    }

    pub fn contains_hart(&self, h: HartId) -> bool {
        let base = self.hart_base();
        h.0 >= base && h.0 < base + self.hart_count()
    }

    /// Neighborhood index (0-based, within this shire) that owns `core`.
    pub fn neighborhood_of(&self, core: CoreId) -> u32 {
        (core.0 - self.core_base) / MINIONS_PER_NEIGHBORHOOD
    }
}

/// Fixed topology table built once at chip construction from
/// `config::EmulatorConfig`.
#[derive(Debug, Clone)]
pub struct Topology {
    pub shires: Vec<ShireDesc>,
    pub io_shire: u32,
}

impl Topology {
    /// Build a topology with `n_compute_shires` compute shires (each fully
    /// populated with `NEIGHBORHOODS_PER_COMPUTE_SHIRE *
    /// MINIONS_PER_NEIGHBORHOOD` minions), one I/O shire with a single
    /// minion (one active hart, thread 1 unavailable), and
    /// `n_memory_shires` memory shires with no minions.
    pub fn new(n_compute_shires: u32, n_memory_shires: u32) -> Self {
        let mut shires = Vec::new();
        let mut core_base = 0u32;

        shires.push(ShireDesc {
            kind: ShireKind::Io,
            core_base,
            core_count: 1,
        });
        core_base += 1;
        let io_shire = 0;

        for _ in 0..n_compute_shires {
            let count = NEIGHBORHOODS_PER_COMPUTE_SHIRE * MINIONS_PER_NEIGHBORHOOD;
            shires.push(ShireDesc {
                kind: ShireKind::Compute,
                core_base,
                core_count: count,
            });
            core_base += count;
        }

        for _ in 0..n_memory_shires {
            shires.push(ShireDesc {
                kind: ShireKind::Memory,
                core_base,
                core_count: 0,
            });
        }

        Topology { shires, io_shire }
    }

    pub fn total_cores(&self) -> u32 {
        self.shires.iter().map(|s| s.core_count).sum()
    }

    pub fn total_harts(&self) -> u32 {
        self.total_cores() * HARTS_PER_MINION
    }

    pub fn shire_of_hart(&self, h: HartId) -> u32 {
        self.shires
            .iter()
            .position(|s| s.contains_hart(h))
            .expect("hart id must belong to some shire") as u32
    }

    pub fn shire_of_core(&self, c: CoreId) -> u32 {
        self.shires
            .iter()
            .position(|s| c.0 >= s.core_base && c.0 < s.core_base + s.core_count)
            .expect("core id must belong to some shire") as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hart_core_roundtrip() {
        let c = CoreId(5);
        assert_eq!(c.hart(0).core(), c);
        assert_eq!(c.hart(1).core(), c);
        assert_eq!(c.hart(0).thread(), 0);
        assert_eq!(c.hart(1).thread(), 1);
    }

    #[test]
    fn topology_shire_lookup() {
        let t = Topology::new(1, 1);
        // shire 0 is I/O (1 core, 2 harts), shire 1 is compute (32 cores).
        assert_eq!(t.shire_of_hart(HartId(0)), 0);
        assert_eq!(t.shire_of_hart(HartId(1)), 0);
        assert_eq!(t.shire_of_hart(HartId(2)), 1);
        let compute_harts = NEIGHBORHOODS_PER_COMPUTE_SHIRE * MINIONS_PER_NEIGHBORHOOD * 2;
        assert_eq!(
            t.shire_of_hart(HartId(2 + compute_harts - 1)),
            1
        );
    }
}
