//! TensorStore FSM: writes N×M bytes from the tensor register
//! file (or SCP rows) to memory, optionally cooperating across 1/2/4
//! minions per row.

use super::{tensor_error_bit, TensorMask, Uuid};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TStoreState {
    Idle,
    Ready,
}

#[derive(Debug, Clone, Copy)]
pub struct TStoreParams {
    pub addr: u64,
    pub cols: u8,
    pub rows: u8,
    pub stride: u64, // from X31
    pub from_scp: bool,
    pub coop: u8, // 1, 2, or 4 minions per row
    pub mask: TensorMask,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TStore {
    state_: Option<TStoreStateData>,
}

#[derive(Debug, Clone, Copy)]
struct TStoreStateData {
    params: TStoreParams,
    uuid: Uuid,
    rows_done: u8,
}

/// Legal `(cols, coop)` combinations (: "1, 2, or 4 minions per
/// row; the legal (cols, coop) combinations are enumerated"). Columns must
/// divide evenly across cooperating minions.
pub fn legal_coop_combo(cols: u8, coop: u8) -> bool {
    matches!(coop, 1 | 2 | 4) && cols > 0 && cols % coop == 0
}

impl TStore {
    pub fn is_idle(&self) -> bool {
        self.state_.is_none()
    }

    pub fn state(&self) -> TStoreState {
        if self.state_.is_some() {
            TStoreState::Ready
        } else {
            TStoreState::Idle
        }
    }

    pub fn params(&self) -> Option<TStoreParams> {
        self.state_.map(|d| d.params)
    }

    /// Returns an error bit set (`tensor_error[8]`) instead of starting if
    /// the combo is illegal.
    pub fn start(&mut self, params: TStoreParams, uuid: Uuid) -> u16 {
        if !legal_coop_combo(params.cols, params.coop) {
            return tensor_error_bit::STORE_ILLEGAL_COOP;
        }
        self.state_ = Some(TStoreStateData {
            params,
            uuid,
            rows_done: 0,
        });
        0
    }

    pub fn step_row(&mut self) -> Option<u8> {
        let d = self.state_.as_mut()?;
        let row = d.rows_done;
        d.rows_done += 1;
        if d.rows_done >= d.params.rows {
            self.state_ = None;
        }
        Some(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn illegal_combo_sets_error() {
        assert!(!legal_coop_combo(3, 2));
        let mut t = TStore::default();
        let p = TStoreParams { addr: 0, cols: 3, rows: 1, stride: 0, from_scp: false, coop: 2, mask: 0 };
        let err = t.start(p, 1);
        assert_eq!(err, tensor_error_bit::STORE_ILLEGAL_COOP);
        assert!(t.is_idle());
    }

    #[test]
    fn legal_combo_starts() {
        let mut t = TStore::default();
        let p = TStoreParams { addr: 0, cols: 4, rows: 2, stride: 64, from_scp: false, coop: 4, mask: 0 };
        let err = t.start(p, 1);
        assert_eq!(err, 0);
        assert_eq!(t.step_row(), Some(0));
        assert_eq!(t.step_row(), Some(1));
        assert!(t.is_idle());
    }
}
