//! TensorReduce FSM: pairwise reduce between this hart's and a
//! partner hart's corresponding VLEN-wide register over `count` registers.
//! The receiver drives execution once both sides are ready.

use super::{tensor_error_bit, Uuid};
use crate::topology::HartId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Move,
    Add,
    FAdd,
    Min,
    Max,
    FMin,
    FMax,
}

/// Role this hart plays, decoded from the op's encoded `height`: the
/// encoding implements send, receive, broadcast, and reduce patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceRole {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TReduceState {
    Idle,
    WaitingToSend,
    WaitingToReceive,
    ReadyToSend,
    ReadyToReceive,
}

#[derive(Debug, Clone, Copy)]
pub struct TReduceParams {
    pub op: ReduceOp,
    pub partner: HartId,
    pub count: u8,
    pub src_reg: u8,
    pub dst_reg: u8,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TReduce {
    state_: Option<TReduceStateData>,
}

#[derive(Debug, Clone, Copy)]
struct TReduceStateData {
    role: ReduceRole,
    at_head: bool,
    params: TReduceParams,
    self_id: HartId,
    #[allow(dead_code)]
    uuid: Uuid,
}

impl TReduce {
    pub fn is_idle(&self) -> bool {
        self.state_.is_none()
    }

    pub fn state(&self) -> TReduceState {
        match self.state_ {
            None => TReduceState::Idle,
            Some(d) => match (d.role, d.at_head) {
                (ReduceRole::Send, false) => TReduceState::WaitingToSend,
                (ReduceRole::Send, true) => TReduceState::ReadyToSend,
                (ReduceRole::Receive, false) => TReduceState::WaitingToReceive,
                (ReduceRole::Receive, true) => TReduceState::ReadyToReceive,
            },
        }
    }

    /// Starts the op. A self-targeting reduce (`partner == self`) sets
    /// `tensor_error[9]` and never starts.
    pub fn start(
        &mut self,
        self_id: HartId,
        role: ReduceRole,
        params: TReduceParams,
        uuid: Uuid,
    ) -> u16 {
        if params.partner == self_id {
            return tensor_error_bit::REDUCE_SELF_TARGET;
        }
        self.state_ = Some(TReduceStateData {
            role,
            at_head: false,
            params,
            self_id,
            uuid,
        });
        0
    }

    /// Promotes to `ReadyTo{Send,Receive}` once this op reaches the head
    /// of the core's `tqueue`.
    pub fn promote_to_head(&mut self) {
        if let Some(d) = self.state_.as_mut() {
            d.at_head = true;
        }
    }

    pub fn params(&self) -> Option<TReduceParams> {
        self.state_.map(|d| d.params)
    }

    /// The hart driving this side of the reduce (sender or receiver).
    pub fn self_id(&self) -> Option<HartId> {
        self.state_.map(|d| d.self_id)
    }

    /// The receiver drives execution: once both this (receiver,
    /// `ReadyToReceive`) and the partner (sender, `ReadyToSend`) are ready,
    /// the whole `count` is consumed in one tick and both return to idle
    ///.
    pub fn try_complete(&mut self, partner: &mut TReduce) -> bool {
        if self.state() == TReduceState::ReadyToReceive
            && partner.state() == TReduceState::ReadyToSend
        {
            self.state_ = None;
            partner.state_ = None;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(partner: HartId) -> TReduceParams {
        TReduceParams {
            op: ReduceOp::Add,
            partner,
            count: 4,
            src_reg: 0,
            dst_reg: 0,
        }
    }

    #[test]
    fn self_target_sets_error() {
        let mut r = TReduce::default();
        let err = r.start(HartId(2), ReduceRole::Send, params(HartId(2)), 1);
        assert_eq!(err, tensor_error_bit::REDUCE_SELF_TARGET);
        assert!(r.is_idle());
    }

    #[test]
    fn completes_only_when_both_ready() {
        let mut sender = TReduce::default();
        let mut receiver = TReduce::default();
        sender.start(HartId(0), ReduceRole::Send, params(HartId(1)), 1);
        receiver.start(HartId(1), ReduceRole::Receive, params(HartId(0)), 2);

        assert!(!receiver.try_complete(&mut sender));
        sender.promote_to_head();
        assert!(!receiver.try_complete(&mut sender));
        receiver.promote_to_head();
        assert!(receiver.try_complete(&mut sender));
        assert!(sender.is_idle());
        assert!(receiver.is_idle());
    }
}
