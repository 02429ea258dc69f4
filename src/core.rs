//! Per-minion shared state: the two harts of a
//! minion share SATP/MATP, L1 scratchpad rows, cache-mode byte, the tensor
//! operation queue, and exclusive-mode state.
//!
//! Built from data model alone, following the same
//! plain-owned-fields struct idiom used throughout this crate.

use crate::mmu::Atp;
use crate::tensor::{TFma, TLoad, TQuant, TReduce, TStore};
use crate::topology::CoreId;
use std::collections::VecDeque;

pub const NUM_SCRATCHPAD_ROWS: usize = 32;
pub const NUM_TENB_SHADOW_ROWS: usize = 32;

/// One kind of in-flight tensor op, as tracked by the core's `tqueue`
/// (: "the queue head is the only FSM allowed to issue memory in
/// a given tick").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorOpKind {
    Load,
    Fma,
    Store,
    Quant,
    Reduce,
}

/// Exclusive-mode ownership: `0` = none, else `1 +
/// ((hartid&1)<<1)` identifying which thread owns it.
pub type ExclMode = u8;

pub struct Core {
    pub id: CoreId,
    pub satp: Atp,
    pub matp: Atp,

    pub scratchpad: Vec<[u8; 64]>, // 32 rows + TenB shadow rows, VLEN bytes each
    pub row_locked: Vec<bool>,
    pub row_locked_pa: Vec<u64>,
    pub mcache_control: u8,
    pub ucache_control: u8,
    /// Cached copy of the neighborhood's `MPROT` ESR, synced on write;
    /// checked by `pma::check_access` for every memory access issued by a
    /// hart in this core. Reset value `0x13` matches
    /// `ESR_MPROT_RESET_VAL` in `examples/original_source/sw-sysemu/pma_er.cpp`.
    pub mprot: u64,

    pub tqueue: VecDeque<TensorOpKind>,
    pub tload: TLoad,
    pub tfma: TFma,
    pub tstore: TStore,
    pub tquant: TQuant,
    pub treduce: TReduce,

    pub excl_mode: ExclMode,
    pub tensor_error: u16,
    pub next_uuid: u64,
}

impl Core {
    pub fn new(id: CoreId) -> Self {
        Core {
            id,
            satp: Atp::decode(0),
            matp: Atp::decode(0),
            scratchpad: vec![[0u8; 64]; NUM_SCRATCHPAD_ROWS + NUM_TENB_SHADOW_ROWS],
            row_locked: vec![false; NUM_SCRATCHPAD_ROWS + NUM_TENB_SHADOW_ROWS],
            row_locked_pa: vec![0; NUM_SCRATCHPAD_ROWS + NUM_TENB_SHADOW_ROWS],
            mcache_control: 0,
            ucache_control: 0,
            mprot: 0x13,
            tqueue: VecDeque::new(),
            tload: TLoad::default(),
            tfma: TFma::default(),
            tstore: TStore::default(),
            tquant: TQuant::default(),
            treduce: TReduce::default(),
            excl_mode: 0,
            tensor_error: 0,
            next_uuid: 0,
        }
    }

    pub fn next_uuid(&mut self) -> u64 {
        let uuid = self.next_uuid;
        self.next_uuid += 1;
        uuid
    }

    /// The op allowed to issue memory this tick, per the `tqueue`
    /// head-of-line rule.
    pub fn head_of_line(&self) -> Option<TensorOpKind> {
        self.tqueue.front().copied()
    }

    pub fn tfma_params(&self) -> Option<crate::tensor::tfma::TFmaParams> {
        self.tfma.params()
    }

    pub fn enqueue(&mut self, kind: TensorOpKind) {
        self.tqueue.push_back(kind);
    }

    pub fn dequeue_if_head(&mut self, kind: TensorOpKind) {
        if self.tqueue.front() == Some(&kind) {
            self.tqueue.pop_front();
        }
    }

    /// L1 scratchpad cache-mode transition table, driven by writes to
    /// `MCACHE_CONTROL`/`UCACHE_CONTROL`: `{0->{0,1}, 1->{1,3}, 3->{1,3}}`.
    pub fn cache_mode_transition_legal(current: u8, next: u8) -> bool {
        matches!(
            (current, next),
            (0, 0) | (0, 1) | (1, 1) | (1, 3) | (3, 1) | (3, 3)
        )
    }

    /// Applies an `MCACHE_CONTROL` write, clearing scratchpad locks if the
    /// new mode disables L1 scratchpad (bit 1 clears). Returns `true` if a
    /// cooperative-in-flight tensor load was still active at that moment —
    /// the caller treats that as a fatal invariant violation.
    pub fn apply_cache_mode(&mut self, new_mode: u8, coop_load_in_flight: bool) -> bool {
        let disables_scratchpad = self.mcache_control & 0x2 != 0 && new_mode & 0x2 == 0;
        if disables_scratchpad {
            for locked in self.row_locked.iter_mut() {
                *locked = false;
            }
        }
        self.mcache_control = new_mode;
        disables_scratchpad && coop_load_in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_mode_transitions() {
        assert!(Core::cache_mode_transition_legal(0, 1));
        assert!(Core::cache_mode_transition_legal(1, 3));
        assert!(Core::cache_mode_transition_legal(3, 1));
        assert!(!Core::cache_mode_transition_legal(0, 3));
    }

    #[test]
    fn disabling_scratchpad_clears_locks() {
        let mut c = Core::new(CoreId(0));
        c.mcache_control = 1;
        c.row_locked[3] = true;
        let fatal = c.apply_cache_mode(0, false);
        assert!(!fatal);
        assert!(!c.row_locked[3]);
    }

    #[test]
    fn disabling_scratchpad_during_coop_load_is_fatal() {
        let mut c = Core::new(CoreId(0));
        c.mcache_control = 1;
        let fatal = c.apply_cache_mode(0, true);
        assert!(fatal);
    }

    #[test]
    fn tqueue_head_of_line() {
        let mut c = Core::new(CoreId(0));
        c.enqueue(TensorOpKind::Load);
        c.enqueue(TensorOpKind::Fma);
        assert_eq!(c.head_of_line(), Some(TensorOpKind::Load));
        c.dequeue_if_head(TensorOpKind::Fma); // not head, no-op
        assert_eq!(c.head_of_line(), Some(TensorOpKind::Load));
        c.dequeue_if_head(TensorOpKind::Load);
        assert_eq!(c.head_of_line(), Some(TensorOpKind::Fma));
    }
}
