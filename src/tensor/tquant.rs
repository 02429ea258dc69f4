//! TensorQuant FSM: applies up to 10 chained per-element
//! transforms to a rectangular subset of the tensor register file.

use super::{tensor_error_bit, TensorMask, Uuid};

pub const MAX_TRANSFORMS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    IntToFp,
    FpToInt,
    Relu,
    AddRowFromScp,
    AddColFromScp,
    MulRowFromScp,
    MulColFromScp,
    SatInt8,
    SatUint8,
    Pack128,
}

impl Transform {
    /// Transforms that read the L1 scratchpad: these require L1SCP to be
    /// enabled, otherwise the op sets `tensor_error[4]` instead of starting.
    pub fn reads_scp(&self) -> bool {
        matches!(
            self,
            Transform::AddRowFromScp
                | Transform::AddColFromScp
                | Transform::MulRowFromScp
                | Transform::MulColFromScp
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TQuantState {
    Idle,
    Ready,
}

#[derive(Debug, Clone)]
pub struct TQuantParams {
    pub row_start: u8,
    pub row_count: u8,
    pub col_start: u8,
    pub col_count: u8,
    pub transforms: Vec<Transform>,
    pub mask: TensorMask,
}

#[derive(Debug, Clone, Default)]
pub struct TQuant {
    state_: Option<TQuantStateData>,
}

#[derive(Debug, Clone)]
struct TQuantStateData {
    params: TQuantParams,
    #[allow(dead_code)]
    uuid: Uuid,
}

impl TQuant {
    pub fn is_idle(&self) -> bool {
        self.state_.is_none()
    }

    pub fn state(&self) -> TQuantState {
        if self.state_.is_some() {
            TQuantState::Ready
        } else {
            TQuantState::Idle
        }
    }

    /// Starts the op. `l1scp_enabled` gates any `reads_scp` transform in
    /// the chain; if one is present and scratchpad is disabled this
    /// returns `tensor_error[4]` instead of starting.
    pub fn start(&mut self, params: TQuantParams, uuid: Uuid, l1scp_enabled: bool) -> u16 {
        if !l1scp_enabled && params.transforms.iter().any(Transform::reads_scp) {
            return tensor_error_bit::QUANT_SCP_DISABLED;
        }
        self.state_ = Some(TQuantStateData { params, uuid });
        0
    }

    /// Runs the whole chained-transform op in one step (head of `tqueue`)
    /// and returns to idle; the rectangular-subset application itself is
    /// driven by the hart's register-file access, this FSM only gates
    /// entry/sequencing.
    pub fn execute(&mut self) -> Option<TQuantParams> {
        self.state_.take().map(|d| d.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(transforms: Vec<Transform>) -> TQuantParams {
        TQuantParams {
            row_start: 0,
            row_count: 4,
            col_start: 0,
            col_count: 4,
            transforms,
            mask: 0xFFFF,
        }
    }

    #[test]
    fn scp_transform_without_l1scp_sets_error() {
        let mut q = TQuant::default();
        let err = q.start(params(vec![Transform::AddRowFromScp]), 1, false);
        assert_eq!(err, tensor_error_bit::QUANT_SCP_DISABLED);
        assert!(q.is_idle());
    }

    #[test]
    fn scp_transform_with_l1scp_starts() {
        let mut q = TQuant::default();
        let err = q.start(params(vec![Transform::AddRowFromScp]), 1, true);
        assert_eq!(err, 0);
        assert!(q.execute().is_some());
        assert!(q.is_idle());
    }

    #[test]
    fn non_scp_transform_always_starts() {
        let mut q = TQuant::default();
        let err = q.start(params(vec![Transform::Relu, Transform::SatInt8]), 1, false);
        assert_eq!(err, 0);
    }
}
