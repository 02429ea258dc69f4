//! Architectural traps and bus-level errors.
//!
//! A `Trap` enum for the architectural exception causes, plus the two
//! control-flow sentinels the core relies on (`instruction_restart`,
//! `Debug_entry`) so that suspension and debug-mode entry can unwind through
//! the same `Result<_, Trap>` channel as real exceptions instead of C++-style
//! exceptions.

use thiserror::Error;

/// Why a hart is entering debug mode outside of an explicit `haltreq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugCause {
    HaltRequest,
    ResetHalt,
    TriggerMatch,
    Step,
    ProgramBufferException,
}

/// Architectural trap, or a control-flow sentinel that unwinds like one.
///
/// Variants without a payload comment are exactly the privileged-ISA
/// exception/interrupt causes. `InstructionRestart` and
/// `DebugEntry` are not exceptions: the scheduler catches them and resumes
/// the hart (resp. enters debug mode) without delivering anything to guest
/// software.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Trap {
    #[error("instruction access fault at {0:#x}")]
    InstructionAccessFault(u64),
    #[error("instruction page fault at {0:#x}")]
    InstructionPageFault(u64),
    #[error("instruction address misaligned at {0:#x}")]
    InstructionAddressMisaligned(u64),
    #[error("load access fault at {0:#x}")]
    LoadAccessFault(u64),
    #[error("load page fault at {0:#x}")]
    LoadPageFault(u64),
    #[error("load address misaligned at {0:#x}")]
    LoadAddressMisaligned(u64),
    #[error("store access fault at {0:#x}")]
    StoreAccessFault(u64),
    #[error("store page fault at {0:#x}")]
    StorePageFault(u64),
    #[error("store address misaligned at {0:#x}")]
    StoreAddressMisaligned(u64),
    #[error("illegal instruction {0:#010x}")]
    IllegalInstruction(u32),
    #[error("breakpoint")]
    Breakpoint,
    #[error("environment call from U")]
    EnvironmentCallFromU,
    #[error("environment call from S")]
    EnvironmentCallFromS,
    #[error("environment call from M")]
    EnvironmentCallFromM,

    #[error("machine software interrupt")]
    MachineSoftwareInterrupt,
    #[error("machine timer interrupt")]
    MachineTimerInterrupt,
    #[error("machine external interrupt")]
    MachineExternalInterrupt,
    #[error("supervisor software interrupt")]
    SupervisorSoftwareInterrupt,
    #[error("supervisor timer interrupt")]
    SupervisorTimerInterrupt,
    #[error("supervisor external interrupt")]
    SupervisorExternalInterrupt,

    /// Unmapped or otherwise illegal physical address.
    /// Caught at hart scope and converted into a bus-error interrupt.
    #[error("memory error at {0:#x}")]
    MemoryError(u64),
    /// Unknown ESR field.
    #[error("unknown ESR at offset {0:#x}")]
    SysregError(u64),

    /// Control-flow sentinel: re-fetch and re-execute the same instruction
    /// next tick. Not an error — never delivered to guest software.
    #[error("instruction restart")]
    InstructionRestart,
    /// Control-flow sentinel: enter debug mode instead of taking a trap.
    #[error("debug entry: {0:?}")]
    DebugEntry(DebugCause),

    /// Any other exception escapes as fatal: logged at error severity,
    /// process exits non-zero.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Trap {
    /// Map to `(is_interrupt, cause, tval)` per the privileged spec, or
    /// `None` for sentinels/host-only variants that never reach `take_trap`.
    pub fn cause_tval(&self) -> Option<(bool, u64, u64)> {
        use Trap::*;
        match *self {
            InstructionAddressMisaligned(a) => Some((false, 0, a)),
            InstructionAccessFault(a) => Some((false, 1, a)),
            IllegalInstruction(bits) => Some((false, 2, bits as u64)),
            Breakpoint => Some((false, 3, 0)),
            LoadAddressMisaligned(a) => Some((false, 4, a)),
            LoadAccessFault(a) => Some((false, 5, a)),
            StoreAddressMisaligned(a) => Some((false, 6, a)),
            StoreAccessFault(a) => Some((false, 7, a)),
            EnvironmentCallFromU => Some((false, 8, 0)),
            EnvironmentCallFromS => Some((false, 9, 0)),
            EnvironmentCallFromM => Some((false, 11, 0)),
            InstructionPageFault(a) => Some((false, 12, a)),
            LoadPageFault(a) => Some((false, 13, a)),
            StorePageFault(a) => Some((false, 15, a)),

            SupervisorSoftwareInterrupt => Some((true, 1, 0)),
            MachineSoftwareInterrupt => Some((true, 3, 0)),
            SupervisorTimerInterrupt => Some((true, 5, 0)),
            MachineTimerInterrupt => Some((true, 7, 0)),
            SupervisorExternalInterrupt => Some((true, 9, 0)),
            MachineExternalInterrupt => Some((true, 11, 0)),

            MemoryError(_) | SysregError(_) | InstructionRestart | DebugEntry(_) | Fatal(_) => {
                None
            }
        }
    }

    /// True for the two non-exception control-flow sentinels.
    pub fn is_control_flow(&self) -> bool {
        matches!(self, Trap::InstructionRestart | Trap::DebugEntry(_))
    }
}

/// Bus-level error, raised below the hart boundary by `MemoryRegion`,
/// `PhysicalMemory`, and `EsrPlane` before anything is known about which
/// architectural trap class applies.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BusError {
    #[error("unmapped physical address {0:#x}")]
    Unmapped(u64),
    #[error("access of size {size} not supported at {addr:#x}")]
    BadSize { addr: u64, size: u8 },
    #[error("misaligned access of size {size} at {addr:#x}")]
    Misaligned { addr: u64, size: u8 },
    #[error("access spans two memory regions at {0:#x}")]
    SpansRegions(u64),
    #[error("write to read-only region at {0:#x}")]
    ReadOnly(u64),
    #[error("unknown ESR field at {0:#x}")]
    UnknownEsr(u64),
}
