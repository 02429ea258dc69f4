//! RV64IMFC instruction set: decode and execute for the architectural
//! hart, including the vendor tensor CSR dispatch that feeds the
//! coprocessor FSMs.
//!
//! Decode and execute follow a plain opcode-match idiom
//! (`Op::{Amo,Auipc,Branch,...}` dispatch) with no superblock or
//! microop-cache engine — this decoder is written directly against the
//! public RV64IMFC/C encodings.

pub mod csr;
pub mod decode;
pub mod exec;

pub use decode::{decode, Inst};
pub use exec::{execute, TensorStart};
