//! TensorFMA FSM: matrix multiply-accumulate, paired with a preceding
//! TensorLoadSetupB into TenB.

use super::{TensorMask, Uuid};
use crate::topology::HartId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TFmaState {
    Idle,
    WaitingTenb,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandType {
    Fp32,
    Fp16AccFp32,
    Int8AccInt32,
}

#[derive(Debug, Clone, Copy)]
pub struct TFmaParams {
    pub acols: u8,
    pub arows: u8,
    pub bcols: u8,
    pub first_pass: bool,
    pub final_pass: bool,
    pub ty: OperandType,
    pub mask: TensorMask,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TFma {
    state_: Option<TFmaStateData>,
    /// Set by a completed `TensorLoadSetupB`, consumed by the next
    /// `start()`. Persists across the busy-restart loop so a TenB load
    /// that lands while the FMA CSR is still being retried isn't lost.
    tenb_loaded: bool,
}

#[derive(Debug, Clone, Copy)]
struct TFmaStateData {
    state: TFmaState,
    params: TFmaParams,
    uuid: Uuid,
    issuer: HartId,
}

impl TFma {
    pub fn is_idle(&self) -> bool {
        self.state_.is_none()
    }

    pub fn state(&self) -> TFmaState {
        self.state_.map(|d| d.state).unwrap_or(TFmaState::Idle)
    }

    pub fn params(&self) -> Option<TFmaParams> {
        self.state_.map(|d| d.params)
    }

    /// The hart that issued the in-flight FMA, if any.
    pub fn issuer(&self) -> Option<HartId> {
        self.state_.map(|d| d.issuer)
    }

    /// `tenb_ready` reflects whether a matching TensorLoadSetupB has
    /// completed into TenB. If not, the FMA parks in `WaitingTenb` until
    /// `tenb_arrived` wakes it; callers that detect a mismatched pairing
    /// should flag `tensor_error[6]` themselves before ever reaching here.
    pub fn start(&mut self, params: TFmaParams, uuid: Uuid, issuer: HartId, tenb_ready: bool) -> u16 {
        let state = if tenb_ready { TFmaState::Ready } else { TFmaState::WaitingTenb };
        self.state_ = Some(TFmaStateData { state, params, uuid, issuer });
        0
    }

    /// Called on a completed `TensorLoadSetupB`: wakes an FMA already
    /// parked in `WaitingTenb` and latches readiness for the next `start()`.
    pub fn tenb_arrived(&mut self) {
        self.tenb_loaded = true;
        if let Some(d) = self.state_.as_mut() {
            if d.state == TFmaState::WaitingTenb {
                d.state = TFmaState::Ready;
            }
        }
    }

    /// Consumes the latched TenB-arrival flag; a fresh `TensorLoadSetupB`
    /// is required to pair with each subsequent FMA.
    pub fn take_tenb_loaded(&mut self) -> bool {
        std::mem::take(&mut self.tenb_loaded)
    }

    /// Execute the multiply-accumulate once ready (head of `tqueue`);
    /// returns the tensor-error bits to OR in (zero on success) and clears
    /// the FSM back to idle.
    pub fn execute(&mut self) -> u16 {
        self.state_.take();
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> TFmaParams {
        TFmaParams {
            acols: 16,
            arows: 16,
            bcols: 16,
            first_pass: true,
            final_pass: true,
            ty: OperandType::Int8AccInt32,
            mask: 0xFFFF,
        }
    }

    #[test]
    fn waits_for_tenb_then_ready() {
        let mut f = TFma::default();
        f.start(params(), 1, HartId(0), false);
        assert_eq!(f.state(), TFmaState::WaitingTenb);
        f.tenb_arrived();
        assert_eq!(f.state(), TFmaState::Ready);
    }

    #[test]
    fn ready_immediately_when_tenb_already_loaded() {
        let mut f = TFma::default();
        f.start(params(), 1, HartId(0), true);
        assert_eq!(f.state(), TFmaState::Ready);
    }

    #[test]
    fn execute_returns_to_idle() {
        let mut f = TFma::default();
        f.start(params(), 1, HartId(0), true);
        let err = f.execute();
        assert_eq!(err, 0);
        assert!(f.is_idle());
    }

    #[test]
    fn take_tenb_loaded_is_one_shot() {
        let mut f = TFma::default();
        f.tenb_arrived();
        assert!(f.take_tenb_loaded());
        assert!(!f.take_tenb_loaded());
    }
}
