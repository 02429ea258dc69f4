//! TensorLoad / TensorLoadL2SCP FSM.

use super::{TensorMask, Uuid};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TLoadState {
    Idle,
    WaitingCoop,
    Ready,
    Loading,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TLoadMode {
    Raw,
    Interleave8,
    Interleave16,
    Transpose8,
    Transpose16,
    Transpose32,
}

#[derive(Debug, Clone, Copy)]
pub struct TLoadParams {
    pub addr: u64,
    pub rows: u8,
    pub start: u8,
    pub tenb: bool,
    pub mode: TLoadMode,
    pub mask: TensorMask,
    pub l2scp: bool,
    pub coop: bool,
    pub tcoop: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TLoad {
    pub state_: Option<TLoadStateData>,
}

#[derive(Debug, Clone, Copy)]
pub struct TLoadStateData {
    pub state: TLoadState,
    pub params: TLoadParams,
    pub uuid: Uuid,
    pub rows_done: u8,
}

impl Default for TLoadState {
    fn default() -> Self {
        TLoadState::Idle
    }
}

impl TLoad {
    pub fn is_idle(&self) -> bool {
        self.state_.is_none()
    }

    pub fn state(&self) -> TLoadState {
        self.state_.map(|d| d.state).unwrap_or(TLoadState::Idle)
    }

    pub fn params(&self) -> Option<TLoadParams> {
        self.state_.map(|d| d.params)
    }

    /// Start the op: transitions to `Ready` for a
    /// non-cooperative load, `WaitingCoop` otherwise.
    pub fn start(&mut self, params: TLoadParams, uuid: Uuid) {
        let state = if params.coop {
            TLoadState::WaitingCoop
        } else {
            TLoadState::Ready
        };
        self.state_ = Some(TLoadStateData {
            state,
            params,
            uuid,
            rows_done: 0,
        });
    }

    /// Called when the cooperative group's `pending` mask has drained
    ///.
    pub fn release_cooperative(&mut self) {
        if let Some(d) = self.state_.as_mut() {
            if d.state == TLoadState::WaitingCoop {
                d.state = TLoadState::Ready;
            }
        }
    }

    /// Begin issuing rows once this is the `tqueue` head (step
    /// 5): `Ready -> Loading`.
    pub fn begin_loading(&mut self) {
        if let Some(d) = self.state_.as_mut() {
            if d.state == TLoadState::Ready {
                d.state = TLoadState::Loading;
            }
        }
    }

    /// Advance one row of the load, copying 16 VLEN-wide rows into
    /// scratchpad rows `[start..start+16) mod 32`; returns the destination
    /// row index for this step, or `None` once all rows are done
    /// (`Loading -> Idle`).
    pub fn step_row(&mut self) -> Option<u8> {
        let d = self.state_.as_mut()?;
        if d.state != TLoadState::Loading {
            return None;
        }
        if d.rows_done >= d.params.rows {
            self.state_ = None;
            return None;
        }
        let row = (d.params.start + d.rows_done) % 32;
        d.rows_done += 1;
        if d.rows_done >= d.params.rows {
            self.state_ = None;
        }
        Some(row)
    }

    pub fn abort(&mut self) {
        self.state_ = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> TLoadParams {
        TLoadParams {
            addr: 0x8000_0000_00,
            rows: 16,
            start: 0,
            tenb: false,
            mode: TLoadMode::Raw,
            mask: 0xFFFF,
            l2scp: false,
            coop: false,
            tcoop: 0,
        }
    }

    #[test]
    fn non_coop_goes_straight_to_ready() {
        let mut t = TLoad::default();
        t.start(params(), 1);
        assert_eq!(t.state(), TLoadState::Ready);
    }

    #[test]
    fn coop_waits_then_releases() {
        let mut t = TLoad::default();
        let mut p = params();
        p.coop = true;
        t.start(p, 1);
        assert_eq!(t.state(), TLoadState::WaitingCoop);
        t.release_cooperative();
        assert_eq!(t.state(), TLoadState::Ready);
    }

    #[test]
    fn rows_wrap_modulo_32() {
        let mut t = TLoad::default();
        let mut p = params();
        p.start = 30;
        p.rows = 4;
        t.start(p, 1);
        t.begin_loading();
        assert_eq!(t.step_row(), Some(30));
        assert_eq!(t.step_row(), Some(31));
        assert_eq!(t.step_row(), Some(0));
        assert_eq!(t.step_row(), Some(1));
        assert_eq!(t.step_row(), None);
        assert!(t.is_idle());
    }
}
