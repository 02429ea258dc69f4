//! RISC-V debug module: `dmctrl` hart-selection/halt/resume protocol,
//! the AND/OR status tree, and program-buffer execution.
//!
//! The `dmctrl` bit layout and edge-triggered semantics follow the
//! `DMACTIVE`/`NDMRESET`/`HARTSEL`/`HAWINDOW`/`HARTMASK` fields of the
//! debug-module control register. Per-neighborhood `hactrl`
//! (hawindow/hartmask/resethalt packed into one 64-bit word) is simplified
//! to one chip-wide hart-selection mask: the current hart-selection mask
//! is the union of HARTSEL, HAWINDOW, and HARTMASK depending on `hasel`,
//! selected directly over the chip's flat hart array rather than scoped
//! per neighborhood.

use crate::error::DebugCause;
use crate::hart::{Hart, HartState};
use crate::topology::HartId;

pub const DMACTIVE_BIT: u32 = 1 << 0;
pub const NDMRESET_BIT: u32 = 1 << 1;
pub const CLRRESETHALTREQ_BIT: u32 = 1 << 2;
pub const SETRESETHALTREQ_BIT: u32 = 1 << 3;
pub const HASEL_BIT: u32 = 1 << 26;
pub const ACKHAVERESET_BIT: u32 = 1 << 28;
pub const HARTRESET_BIT: u32 = 1 << 29;
pub const RESUMEREQ_BIT: u32 = 1 << 30;
pub const HALTREQ_BIT: u32 = 1 << 31;

/// At most one of these may be set per write.
const REQUEST_BITS: u32 =
    RESUMEREQ_BIT | HARTRESET_BIT | ACKHAVERESET_BIT | SETRESETHALTREQ_BIT | CLRRESETHALTREQ_BIT;

/// Observable effect of a `dmctrl` write, for the caller (`Chip`) to log or
/// test against; the state mutation itself has already been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmCtrlEffect {
    NoOp,
    DebugModuleReset,
    BeginWarmReset,
    EndWarmReset,
    HartsResetBegin,
    HartsResetEnd,
    HartsResumed,
    ResumeAckCleared,
    HartsHalted,
    HaveResetAcked,
    ResetHaltSet,
    ResetHaltCleared,
    MultipleRequestBits,
}

pub struct DebugModule {
    dmctrl: u32,
    /// Absolute chip-wide bitmask selecting harts when `hasel` is set,
    /// combined from HAWINDOW and HARTMASK ESR writes ("union of
    /// HARTSEL, HAWINDOW, HARTMASK depending on hasel").
    pub hawindow: u64,
    pub hartmask: u64,
    pub hartsel: u32,
}

impl DebugModule {
    pub fn new() -> Self {
        DebugModule {
            dmctrl: 0,
            hawindow: 0,
            hartmask: 0,
            hartsel: 0,
        }
    }

    pub fn dmactive(&self) -> bool {
        self.dmctrl & DMACTIVE_BIT != 0
    }

    pub fn hasel(&self) -> bool {
        self.dmctrl & HASEL_BIT != 0
    }

    /// Read side of `dmctrl`: only `dmactive`/`ndmreset`/
    /// `hasel`/`hartreset` are stateful; all other bits read 0, via a
    /// `dmctrl & 0x24000003` mask.
    pub fn read_dmctrl(&self) -> u32 {
        self.dmctrl & (DMACTIVE_BIT | NDMRESET_BIT | HASEL_BIT | HARTRESET_BIT)
    }

    /// Chip-wide selection mask under the current `hasel`/`hartsel`/
    /// `hawindow`/`hartmask` configuration.
    pub fn selected_mask(&self) -> u64 {
        if self.hasel() {
            self.hawindow | self.hartmask
        } else {
            1u64 << (self.hartsel & 0x3F)
        }
    }

    pub fn is_selected(&self, h: HartId) -> bool {
        self.selected_mask() & (1u64 << (h.0 & 0x3F)) != 0
    }

    /// Apply a `dmctrl` write. `harts` is the chip's flat hart
    /// array; `reset_pc` is used for warm resets; `is_compute_shire_hart`
    /// scopes the `ndmreset` edge to "all compute shires",
    /// independent of the `hasel`/`hartsel` selection the other edges use.
    pub fn write_dmctrl(
        &mut self,
        value: u32,
        harts: &mut [Hart],
        reset_pc: u64,
        is_compute_shire_hart: impl Fn(HartId) -> bool,
    ) -> DmCtrlEffect {
        let old = self.dmctrl;
        let new = value;
        self.dmctrl = new;

        if old & DMACTIVE_BIT != 0 && new & DMACTIVE_BIT == 0 {
            self.dmctrl = 0;
            for h in harts.iter_mut() {
                h.in_debug_mode = false;
                h.resumeack = false;
                h.havereset = false;
            }
            return DmCtrlEffect::DebugModuleReset;
        }
        if new & DMACTIVE_BIT == 0 {
            return DmCtrlEffect::NoOp;
        }

        if (value & REQUEST_BITS).count_ones() > 1 {
            return DmCtrlEffect::MultipleRequestBits;
        }

        if old & NDMRESET_BIT == 0 && new & NDMRESET_BIT != 0 {
            for h in harts.iter_mut().filter(|h| is_compute_shire_hart(h.id)) {
                h.warm_reset(reset_pc);
            }
            return DmCtrlEffect::BeginWarmReset;
        }
        if old & NDMRESET_BIT != 0 && new & NDMRESET_BIT == 0 {
            return DmCtrlEffect::EndWarmReset;
        }

        let mask = self.selected_mask();
        let selected = |h: &Hart| mask & (1u64 << (h.id.0 & 0x3F)) != 0;

        if old & HARTRESET_BIT == 0 && new & HARTRESET_BIT != 0 {
            for h in harts.iter_mut().filter(|h| selected(h)) {
                h.warm_reset(reset_pc);
            }
            return DmCtrlEffect::HartsResetBegin;
        }
        if old & HARTRESET_BIT != 0 && new & HARTRESET_BIT == 0 {
            return DmCtrlEffect::HartsResetEnd;
        }

        if new & RESUMEREQ_BIT != 0 {
            for h in harts.iter_mut().filter(|h| selected(h)) {
                if h.state == HartState::Halted {
                    h.state = HartState::Running;
                    h.in_debug_mode = false;
                    h.resumeack = true;
                }
            }
            return DmCtrlEffect::HartsResumed;
        }
        if old & RESUMEREQ_BIT != 0 && new & RESUMEREQ_BIT == 0 {
            for h in harts.iter_mut().filter(|h| selected(h)) {
                h.resumeack = false;
            }
            return DmCtrlEffect::ResumeAckCleared;
        }

        if new & HALTREQ_BIT != 0 {
            for h in harts.iter_mut().filter(|h| selected(h)) {
                h.state = HartState::Halted;
                h.in_debug_mode = true;
            }
            return DmCtrlEffect::HartsHalted;
        }

        if new & ACKHAVERESET_BIT != 0 {
            for h in harts.iter_mut().filter(|h| selected(h)) {
                h.havereset = false;
            }
            return DmCtrlEffect::HaveResetAcked;
        }

        if new & SETRESETHALTREQ_BIT != 0 {
            for h in harts.iter_mut().filter(|h| selected(h)) {
                h.hactrl_resethalt = true;
            }
            return DmCtrlEffect::ResetHaltSet;
        }
        if new & CLRRESETHALTREQ_BIT != 0 {
            for h in harts.iter_mut().filter(|h| selected(h)) {
                h.hactrl_resethalt = false;
            }
            return DmCtrlEffect::ResetHaltCleared;
        }

        DmCtrlEffect::NoOp
    }

    /// Per-neighborhood AND/OR tree level 0: 10 boolean
    /// reduction bits over the selected harts of `harts`.
    pub fn andortree_l0(&self, harts: &[&Hart]) -> u16 {
        let selected: Vec<&&Hart> = harts.iter().filter(|h| self.is_selected(h.id)).collect();
        if selected.is_empty() {
            return 0;
        }
        let any = |f: &dyn Fn(&Hart) -> bool| selected.iter().any(|h| f(h));
        let all = |f: &dyn Fn(&Hart) -> bool| selected.iter().all(|h| f(h));
        let halted = |h: &Hart| h.state == HartState::Halted;
        let running = |h: &Hart| h.state == HartState::Running;
        let resumeack = |h: &Hart| h.resumeack;
        let havereset = |h: &Hart| h.havereset;
        let unavailable = |h: &Hart| h.state == HartState::Unavailable;

        let mut v = 0u16;
        v |= (any(&halted) as u16) << 0;
        v |= (all(&halted) as u16) << 1;
        v |= (any(&running) as u16) << 2;
        v |= (all(&running) as u16) << 3;
        v |= (any(&resumeack) as u16) << 4;
        v |= (all(&resumeack) as u16) << 5;
        v |= (any(&havereset) as u16) << 6;
        v |= (all(&havereset) as u16) << 7;
        v |= (any(&unavailable) as u16) << 8;
        v |= 1 << 9; // anyselected
        v
    }

    /// Combines a set of level-0 results into a level-1 (shire) or level-2
    /// (chip) reduction: OR the `any*` bits, AND the `all*` bits, zeroing
    /// `all*` if no child had any hart selected ("`all*` bits are
    /// zeroed if no hart is selected").
    pub fn combine_levels(children: &[u16]) -> u16 {
        const ANY_MASK: u16 = 0b0_0101_0101; // bits 0,2,4,6,8
        const ALL_MASK: u16 = 0b0_0010_1010; // bits 1,3,5,7
        const ANY_SELECTED: u16 = 1 << 9;

        let mut any = 0u16;
        let mut all = ALL_MASK;
        let mut any_selected = false;
        for &c in children {
            any |= c & ANY_MASK;
            if c & ANY_SELECTED != 0 {
                any_selected = true;
                all &= c | !ALL_MASK;
            } else {
                all &= !ALL_MASK; // a child with nothing selected can't satisfy "all"
            }
        }
        if !any_selected {
            all = 0;
        }
        (any & ANY_MASK) | (all & ALL_MASK) | ((any_selected as u16) << 9)
    }
}

impl Default for DebugModule {
    fn default() -> Self {
        Self::new()
    }
}

/// Program-buffer execution outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgBufStep {
    Instruction0,
    Instruction1,
    Ebreak,
    Done,
}

/// Begin executing `{progbuf0, progbuf1, EBREAK}` atomically on a halted
/// hart, triggered by `NXPROGBUF0/1` writes followed by `ABSCMD`.
pub fn start_progbuf(hart: &mut Hart) {
    hart.progbuf.active = true;
    hart.progbuf.step = 0;
}

/// Advances the program-buffer step counter; `true` once the sequence has
/// completed all three instructions.
pub fn advance_progbuf(hart: &mut Hart) -> ProgBufStep {
    let step = hart.progbuf.step;
    hart.progbuf.step += 1;
    match step {
        0 => ProgBufStep::Instruction0,
        1 => ProgBufStep::Instruction1,
        2 => {
            hart.progbuf.active = false;
            hart.progbuf.step = 0;
            ProgBufStep::Ebreak
        }
        _ => {
            hart.progbuf.active = false;
            ProgBufStep::Done
        }
    }
}

/// A trap during program-buffer execution exits with an error code in
/// `HASTATUS1` instead of delivering an exception to software.
pub fn progbuf_exception(hart: &mut Hart, cause: DebugCause) -> u32 {
    hart.progbuf.active = false;
    hart.progbuf.step = 0;
    match cause {
        DebugCause::ProgramBufferException => 1,
        _ => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::HartId;

    fn harts(n: u32) -> Vec<Hart> {
        (0..n).map(|i| {
            let mut h = Hart::new(HartId(i), 0x1000);
            h.state = HartState::Running;
            h
        }).collect()
    }

    #[test]
    fn halt_all_then_resume_all() {
        let mut dm = DebugModule::new();
        let mut hs = harts(4);
        dm.hasel = false; // exercised explicitly below via hartmask instead
        dm.hawindow = 0;
        // Configure the 4-hart group explicitly, prior to the dmctrl write.
        dm.hartmask = 0b1111;
        let dmctrl = DMACTIVE_BIT | HASEL_BIT | HALTREQ_BIT;
        let effect = dm.write_dmctrl(dmctrl, &mut hs, 0x1000, |_| true);
        assert_eq!(effect, DmCtrlEffect::HartsHalted);
        assert!(hs.iter().all(|h| h.state == HartState::Halted));

        let resume = DMACTIVE_BIT | HASEL_BIT | RESUMEREQ_BIT;
        let effect = dm.write_dmctrl(resume, &mut hs, 0x1000, |_| true);
        assert_eq!(effect, DmCtrlEffect::HartsResumed);
        assert!(hs.iter().all(|h| h.state == HartState::Running));
    }

    #[test]
    fn dmactive_falling_edge_resets_module() {
        let mut dm = DebugModule::new();
        let mut hs = harts(1);
        dm.hartmask = 1;
        dm.write_dmctrl(DMACTIVE_BIT | HASEL_BIT | HALTREQ_BIT, &mut hs, 0x1000, |_| true);
        assert!(hs[0].in_debug_mode);
        dm.write_dmctrl(0, &mut hs, 0x1000, |_| true);
        assert!(!hs[0].in_debug_mode);
        assert_eq!(dm.read_dmctrl(), 0);
    }

    #[test]
    fn multiple_request_bits_flagged() {
        let mut dm = DebugModule::new();
        let mut hs = harts(1);
        let bad = DMACTIVE_BIT | RESUMEREQ_BIT | HARTRESET_BIT;
        let effect = dm.write_dmctrl(bad, &mut hs, 0x1000, |_| true);
        assert_eq!(effect, DmCtrlEffect::MultipleRequestBits);
    }

    #[test]
    fn ndmreset_rising_edge_warm_resets_compute_shire_harts_only() {
        let mut dm = DebugModule::new();
        let mut hs = harts(4);
        hs[0].pc = 0xDEAD;
        hs[1].pc = 0xDEAD;
        let effect = dm.write_dmctrl(DMACTIVE_BIT | NDMRESET_BIT, &mut hs, 0x1000, |id| id.0 < 2);
        assert_eq!(effect, DmCtrlEffect::BeginWarmReset);
        assert_eq!(hs[0].pc, 0x1000);
        assert!(hs[0].havereset);
        assert_eq!(hs[1].pc, 0x1000);
        assert!(hs[1].havereset);
        // harts 2/3 are outside the predicate's compute-shire set and must
        // not be touched by the ndmreset edge.
        assert_eq!(hs[2].pc, 0xDEAD);
        assert!(!hs[2].havereset);
        assert_eq!(hs[3].pc, 0xDEAD);
        assert!(!hs[3].havereset);
    }

    #[test]
    fn andortree_l0_all_bits_zero_when_nothing_selected() {
        let dm = DebugModule::new(); // hartmask=0, hasel=false, hartsel=0 -> selects hart 0 only
        let hs = harts(2);
        let refs: Vec<&Hart> = hs.iter().collect();
        let v = dm.andortree_l0(&refs);
        assert_ne!(v & (1 << 9), 0); // hart 0 is selected by default (hartsel=0)
    }
}
