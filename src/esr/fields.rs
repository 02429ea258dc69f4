//! Named ESR field offsets and per-entity register banks.
//!
//! A struct-of-distinctly-typed-named-fields layout (`neigh_esrs_t`,
//! `shire_other_esrs_t`, ...) would mirror the hardware register banks
//! field-for-field, but this chip only assigns defined behavior to a
//! subset of those fields; everything else is a plain, side-effect-free
//! storage slot. Rather than reproduce every miscellaneous field (icache
//! counters, PLL config words, ...) this collapses each bank into a keyed
//! register file — a fixed-size array of `u64` words indexed by the field
//! offset encoded in address bits `[11:3]` — and gives the fields with
//! defined behavior explicit named offsets. Unlisted offsets are plain
//! read/write storage.

/// One field per hart sub-region entity.
pub mod hart_field {
    pub const EXCL_MODE: u16 = 0x00;
    pub const DMCTRL: u16 = 0x01;
    pub const HASTATUS0: u16 = 0x02;
    pub const HASTATUS1: u16 = 0x03;
    pub const HACTRL: u16 = 0x04;
    pub const HARTSEL: u16 = 0x05;
    pub const HAWINDOW: u16 = 0x06;
    pub const HARTMASK: u16 = 0x07;
    pub const NXPROGBUF0: u16 = 0x08;
    pub const NXPROGBUF1: u16 = 0x09;
    pub const ABSCMD: u16 = 0x0A;
    pub const SPDMCTRL: u16 = 0x0B;
}

/// One field per neighborhood sub-region entity.
pub mod neigh_field {
    pub const MINION_FEATURE: u16 = 0x00;
    pub const IPI_TRIGGER: u16 = 0x01;
    pub const IPI_TRIGGER_CLEAR: u16 = 0x02;
    pub const IPI_REDIRECT_TRIGGER: u16 = 0x03;
    pub const IPI_REDIRECT_PC: u16 = 0x04;
    pub const IPI_REDIRECT_FILTER: u16 = 0x05;
    pub const MCACHE_CONTROL: u16 = 0x06;
    pub const UCACHE_CONTROL: u16 = 0x07;
    pub const ANDORTREE_L0: u16 = 0x08;
    pub const MPROT: u16 = 0x09;
}

/// One field per shire-other ("rbox"-adjacent) sub-region entity.
pub mod shire_other_field {
    pub const SHIRE_COOP_MODE: u16 = 0x00;
    pub const ANDORTREE_L1: u16 = 0x01;
    pub const RESET_CAUSE: u16 = 0x02;
    pub const SPIN_LOCK: u16 = 0x03;
    pub const WATCHDOG: u16 = 0x04;
    pub const PLL_LOCK_STATUS: u16 = 0x05;
}

/// Fields broadcastable via `{U,S,M}BROADCAST` and the per-chip
/// `ANDORTREE_L2` reduction live in the per-shire "rbox" bank; broadcast
/// payload stash (`BROADCAST_DATA`) lives there too.
pub mod rbox_field {
    pub const BROADCAST_DATA: u16 = 0x00;
    pub const ANDORTREE_L2: u16 = 0x01;
}

pub const BANK_WORDS: usize = 64;

/// A generic keyed register bank: fixed-size word storage plus a small set
/// of "sticky"/read-and-clear bits tracked out of band, since only a
/// couple of such fields exist per entity — not worth a bitmask-per-word.
#[derive(Debug, Clone)]
pub struct RegisterBank {
    words: [u64; BANK_WORDS],
}

impl RegisterBank {
    pub fn new() -> Self {
        RegisterBank {
            words: [0; BANK_WORDS],
        }
    }

    pub fn raw_read(&self, offset: u16) -> Option<u64> {
        self.words.get(offset as usize).copied()
    }

    pub fn raw_write(&mut self, offset: u16, value: u64) -> bool {
        match self.words.get_mut(offset as usize) {
            Some(w) => {
                *w = value;
                true
            }
            None => false,
        }
    }
}

impl Default for RegisterBank {
    fn default() -> Self {
        Self::new()
    }
}
