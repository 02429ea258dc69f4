//! Tensor coprocessor state machines: one instance of each FSM kind lives
//! per `Core` (`core.rs`); the hart that issues a tensor CSR write drives
//! the FSM through `start_*`, and the scheduler's `async_execute` step
//! (`scheduler.rs`) advances FSMs that have become `ready`.
//!
//! Each FSM is an enum-with-payload, matching the style used elsewhere in
//! this crate for mode/cause enums.

pub mod coop;
pub mod tfma;
pub mod tload;
pub mod tquant;
pub mod treduce;
pub mod tstore;

pub use tfma::TFma;
pub use tload::TLoad;
pub use tquant::TQuant;
pub use treduce::TReduce;
pub use tstore::TStore;

/// Tensor error bits.
pub mod tensor_error_bit {
    pub const QUANT_SCP_DISABLED: u16 = 1 << 4;
    pub const FMA_PAIRING_MISMATCH: u16 = 1 << 6;
    pub const LOAD_TRAP: u16 = 1 << 7;
    pub const STORE_ILLEGAL_COOP: u16 = 1 << 8;
    pub const REDUCE_SELF_TARGET: u16 = 1 << 9;
}

/// 16-bit row mask gating per-row tensor op effects.
pub type TensorMask = u16;

/// A monotonic per-core op identity, assigned when an FSM starts.
pub type Uuid = u64;
