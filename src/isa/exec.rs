//! Execute stage: dispatches a decoded `Inst` against
//! hart/core architectural state, issuing MMU-translated, PMA-checked
//! memory accesses and starting tensor coprocessor FSMs on the vendor CSR
//! range (5-step start routine, steps 1-3; steps 4-5 —
//! cooperative-table installation and `tqueue` ordering — are applied by
//! the caller since they need the whole-chip `CoopTable`/other cores).

use super::csr;
use super::decode::{
    AluOp, AmoOp, BranchOp, CsrOp, FBinOp, FCmpOp, FCvtOp, FMaddOp, Inst, LoadOp, StoreOp,
};
use crate::core::Core;
use crate::error::Trap;
use crate::hart::{wait_kind, Hart, HartState};
use crate::memory::{Agent, PhysicalMemory};
use crate::mmu::{self, AccessType, Mode};
use crate::pma;
use crate::tensor::{coop::TCoop, tload::TLoadMode, tload::TLoadParams};

/// Outcome of starting (or failing to start) a tensor op, returned to the
/// caller so it can apply the chip-wide effects (cooperative table install,
/// `tqueue` push) that don't fit inside a single hart/core's view.
pub struct TensorStart {
    pub kind: crate::core::TensorOpKind,
    pub coop: Option<(TCoop, u32)>, // (decoded tcoop, this minion's bit)
}

fn mode_for(hart: &Hart, access: AccessType) -> Mode {
    match access {
        AccessType::Instruction => hart.mode,
        _ => hart.effective_data_mode(),
    }
}

fn access_addr(
    hart: &mut Hart,
    mem: &PhysicalMemory,
    addr: u64,
    size: u8,
    access: AccessType,
    is_sp_hart: bool,
    mprot: u64,
) -> Result<u64, Trap> {
    let mode = mode_for(hart, access);
    let atp = mmu::Atp::decode(hart.satp);
    let pa = mmu::translate(mem, &mut hart.tlb, mode, atp, hart.mstatus, addr, access)?;
    let checked = pma::check_access(pa, size, access, false, is_sp_hart, mprot, mode)?;
    Ok(checked.addr)
}

fn do_load(
    hart: &mut Hart,
    mem: &PhysicalMemory,
    addr: u64,
    size: u8,
    signed: bool,
    is_sp_hart: bool,
    mprot: u64,
) -> Result<u64, Trap> {
    if addr % size as u64 != 0 {
        return Err(Trap::LoadAddressMisaligned(addr));
    }
    let pa = access_addr(hart, mem, addr, size, AccessType::Load, is_sp_hart, mprot)?;
    let mut buf = [0u8; 8];
    mem.read(Agent::Hart(hart.id), pa, &mut buf[..size as usize])
        .map_err(|_| Trap::LoadAccessFault(addr))?;
    let raw = u64::from_le_bytes(buf);
    if !signed {
        return Ok(raw);
    }
    let bits = size as u32 * 8;
    let shift = 64 - bits;
    Ok(((raw << shift) as i64 >> shift) as u64)
}

fn do_store(
    hart: &mut Hart,
    mem: &mut PhysicalMemory,
    addr: u64,
    size: u8,
    value: u64,
    is_sp_hart: bool,
    mprot: u64,
) -> Result<(), Trap> {
    if addr % size as u64 != 0 {
        return Err(Trap::StoreAddressMisaligned(addr));
    }
    let pa = access_addr(hart, mem, addr, size, AccessType::Store, is_sp_hart, mprot)?;
    let bytes = value.to_le_bytes();
    mem.write(Agent::Hart(hart.id), pa, &bytes[..size as usize])
        .map_err(|_| Trap::StoreAccessFault(addr))
}

fn alu(op: AluOp, a: u64, b: u64) -> u64 {
    match op {
        AluOp::Add => a.wrapping_add(b),
        AluOp::Sub => a.wrapping_sub(b),
        AluOp::Sll => a.wrapping_shl(b as u32 & 0x3F),
        AluOp::Slt => ((a as i64) < (b as i64)) as u64,
        AluOp::Sltu => (a < b) as u64,
        AluOp::Xor => a ^ b,
        AluOp::Srl => a.wrapping_shr(b as u32 & 0x3F),
        AluOp::Sra => ((a as i64).wrapping_shr(b as u32 & 0x3F)) as u64,
        AluOp::Or => a | b,
        AluOp::And => a & b,
        AluOp::Mul => a.wrapping_mul(b),
        AluOp::MulH => (((a as i64 as i128) * (b as i64 as i128)) >> 64) as u64,
        AluOp::MulHSU => (((a as i64 as i128) * (b as u128 as i128)) >> 64) as u64,
        AluOp::MulHU => (((a as u128) * (b as u128)) >> 64) as u64,
        AluOp::Div => {
            if b == 0 {
                u64::MAX
            } else if a as i64 == i64::MIN && b as i64 == -1 {
                a
            } else {
                ((a as i64) / (b as i64)) as u64
            }
        }
        AluOp::DivU => {
            if b == 0 {
                u64::MAX
            } else {
                a / b
            }
        }
        AluOp::Rem => {
            if b == 0 {
                a
            } else if a as i64 == i64::MIN && b as i64 == -1 {
                0
            } else {
                ((a as i64) % (b as i64)) as u64
            }
        }
        AluOp::RemU => {
            if b == 0 {
                a
            } else {
                a % b
            }
        }
    }
}

fn alu32(op: AluOp, a: u64, b: u64) -> u64 {
    let r = alu(op, a & 0xFFFF_FFFF, b & 0xFFFF_FFFF) as u32;
    r as i32 as i64 as u64
}

/// Executes one already-decoded instruction. Returns `Ok(Some(TensorStart))`
/// when a tensor CSR write began a new FSM so the caller can apply the
/// whole-chip side effects; `Ok(None)` otherwise.
#[allow(clippy::too_many_arguments)]
pub fn execute(
    inst: Inst,
    hart: &mut Hart,
    core: &mut Core,
    mem: &mut PhysicalMemory,
    is_sp_hart: bool,
    minion_feature_enabled: bool,
) -> Result<Option<TensorStart>, Trap> {
    match inst {
        Inst::Lui { rd, imm } => {
            hart.write_reg(rd as usize, imm as u64);
        }
        Inst::Auipc { rd, imm } => {
            hart.write_reg(rd as usize, hart.pc.wrapping_add(imm as u64));
        }
        Inst::Jal { rd, imm } => {
            hart.write_reg(rd as usize, hart.pc.wrapping_add(4));
            hart.npc = hart.pc.wrapping_add(imm as u64);
        }
        Inst::Jalr { rd, rs1, imm } => {
            let target = (hart.read_reg(rs1 as usize).wrapping_add(imm as u64)) & !1u64;
            hart.write_reg(rd as usize, hart.pc.wrapping_add(4));
            hart.npc = target;
        }
        Inst::Branch { op, rs1, rs2, imm } => {
            let a = hart.read_reg(rs1 as usize);
            let b = hart.read_reg(rs2 as usize);
            let taken = match op {
                BranchOp::Beq => a == b,
                BranchOp::Bne => a != b,
                BranchOp::Blt => (a as i64) < (b as i64),
                BranchOp::Bge => (a as i64) >= (b as i64),
                BranchOp::Bltu => a < b,
                BranchOp::Bgeu => a >= b,
            };
            if taken {
                hart.npc = hart.pc.wrapping_add(imm as u64);
            }
        }
        Inst::Load { op, rd, rs1, imm } => {
            let addr = hart.read_reg(rs1 as usize).wrapping_add(imm as u64);
            let (size, signed) = match op {
                LoadOp::Lb => (1, true),
                LoadOp::Lh => (2, true),
                LoadOp::Lw => (4, true),
                LoadOp::Ld => (8, true),
                LoadOp::Lbu => (1, false),
                LoadOp::Lhu => (2, false),
                LoadOp::Lwu => (4, false),
            };
            let v = do_load(hart, mem, addr, size, signed, is_sp_hart, core.mprot)?;
            hart.write_reg(rd as usize, v);
        }
        Inst::Store { op, rs1, rs2, imm } => {
            let addr = hart.read_reg(rs1 as usize).wrapping_add(imm as u64);
            let size = match op {
                StoreOp::Sb => 1,
                StoreOp::Sh => 2,
                StoreOp::Sw => 4,
                StoreOp::Sd => 8,
            };
            let v = hart.read_reg(rs2 as usize);
            do_store(hart, mem, addr, size, v, is_sp_hart, core.mprot)?;
        }
        Inst::AluImm { op, rd, rs1, imm } => {
            let a = hart.read_reg(rs1 as usize);
            hart.write_reg(rd as usize, alu(op, a, imm as u64));
        }
        Inst::AluImm32 { op, rd, rs1, imm } => {
            let a = hart.read_reg(rs1 as usize);
            hart.write_reg(rd as usize, alu32(op, a, imm as u64));
        }
        Inst::Alu { op, rd, rs1, rs2 } => {
            let a = hart.read_reg(rs1 as usize);
            let b = hart.read_reg(rs2 as usize);
            hart.write_reg(rd as usize, alu(op, a, b));
        }
        Inst::Alu32 { op, rd, rs1, rs2 } => {
            let a = hart.read_reg(rs1 as usize);
            let b = hart.read_reg(rs2 as usize);
            hart.write_reg(rd as usize, alu32(op, a, b));
        }
        Inst::Fence | Inst::FenceI => {}
        Inst::SfenceVma { rs1, .. } => {
            if rs1 == 0 {
                hart.tlb.flush();
            } else {
                hart.tlb.flush_va(hart.read_reg(rs1 as usize));
            }
        }
        Inst::Ecall => {
            return Err(match hart.mode {
                Mode::User => Trap::EnvironmentCallFromU,
                Mode::Supervisor => Trap::EnvironmentCallFromS,
                Mode::Machine => Trap::EnvironmentCallFromM,
            });
        }
        Inst::Ebreak => return Err(Trap::Breakpoint),
        Inst::Mret | Inst::Sret => {
            take_return(hart, matches!(inst, Inst::Mret));
        }
        Inst::Wfi => {
            hart.state = HartState::Waiting(wait_kind::INTERRUPT);
            return Err(Trap::InstructionRestart);
        }
        Inst::Amo { op, rd, rs1, rs2, .. } => {
            execute_amo(op, rd, rs1, rs2, hart, mem, is_sp_hart, core.mprot)?;
        }
        Inst::Csr { op, rd, rs_or_uimm, csr } => {
            return execute_csr(op, rd, rs_or_uimm, csr, hart, core, minion_feature_enabled);
        }
        Inst::FLoad { rd, rs1, imm } => {
            let addr = hart.read_reg(rs1 as usize).wrapping_add(imm as u64);
            let raw = do_load(hart, mem, addr, 4, false, is_sp_hart, core.mprot)?;
            hart.write_freg_f32(rd as usize, f32::from_bits(raw as u32));
        }
        Inst::FStore { rs1, rs2, imm } => {
            let addr = hart.read_reg(rs1 as usize).wrapping_add(imm as u64);
            let bits = hart.read_freg_f32(rs2 as usize).to_bits();
            do_store(hart, mem, addr, 4, bits as u64, is_sp_hart, core.mprot)?;
        }
        Inst::FBin { op, rd, rs1, rs2 } => execute_fbin(op, rd, rs1, rs2, hart),
        Inst::FSqrt { rd, rs1 } => {
            let a = hart.read_freg_f32(rs1 as usize);
            if a < 0.0 {
                hart.set_fflags(NV);
            }
            hart.write_freg_f32(rd as usize, a.sqrt());
        }
        Inst::FCmp { op, rd, rs1, rs2 } => execute_fcmp(op, rd, rs1, rs2, hart),
        Inst::FCvt { op, rd, rs1 } => execute_fcvt(op, rd, rs1, hart),
        Inst::FMvXW { rd, rs1 } => {
            let bits = hart.read_freg_f32(rs1 as usize).to_bits();
            hart.write_reg(rd as usize, bits as i32 as i64 as u64);
        }
        Inst::FMvWX { rd, rs1 } => {
            let bits = hart.read_reg(rs1 as usize) as u32;
            hart.write_freg_f32(rd as usize, f32::from_bits(bits));
        }
        Inst::FClass { rd, rs1 } => {
            let v = hart.read_freg_f32(rs1 as usize);
            hart.write_reg(rd as usize, fclass(v));
        }
        Inst::FMadd { op, rd, rs1, rs2, rs3 } => execute_fmadd(op, rd, rs1, rs2, rs3, hart),
    }
    Ok(None)
}

const NV: u64 = 1 << 4;
const DZ: u64 = 1 << 3;

fn execute_fbin(op: FBinOp, rd: u8, rs1: u8, rs2: u8, hart: &mut Hart) {
    let a = hart.read_freg_f32(rs1 as usize);
    let b = hart.read_freg_f32(rs2 as usize);
    let result = match op {
        FBinOp::Add => a + b,
        FBinOp::Sub => a - b,
        FBinOp::Mul => a * b,
        FBinOp::Div => {
            if b == 0.0 {
                hart.set_fflags(DZ);
            }
            a / b
        }
        FBinOp::Sgnj => f32::from_bits((a.to_bits() & 0x7fff_ffff) | (b.to_bits() & 0x8000_0000)),
        FBinOp::Sgnjn => {
            f32::from_bits((a.to_bits() & 0x7fff_ffff) | (!b.to_bits() & 0x8000_0000))
        }
        FBinOp::Sgnjx => f32::from_bits(a.to_bits() ^ (b.to_bits() & 0x8000_0000)),
        FBinOp::Min => {
            if a.is_nan() && b.is_nan() {
                hart.set_fflags(NV);
                f32::from_bits(0x7fc0_0000)
            } else if a.is_nan() {
                b
            } else if b.is_nan() {
                a
            } else if a == 0.0 && b == 0.0 {
                if a.is_sign_negative() {
                    a
                } else {
                    b
                }
            } else {
                a.min(b)
            }
        }
        FBinOp::Max => {
            if a.is_nan() && b.is_nan() {
                hart.set_fflags(NV);
                f32::from_bits(0x7fc0_0000)
            } else if a.is_nan() {
                b
            } else if b.is_nan() {
                a
            } else if a == 0.0 && b == 0.0 {
                if a.is_sign_positive() {
                    a
                } else {
                    b
                }
            } else {
                a.max(b)
            }
        }
    };
    hart.write_freg_f32(rd as usize, result);
}

fn execute_fcmp(op: FCmpOp, rd: u8, rs1: u8, rs2: u8, hart: &mut Hart) {
    let a = hart.read_freg_f32(rs1 as usize);
    let b = hart.read_freg_f32(rs2 as usize);
    if a.is_nan() || b.is_nan() {
        // Signaling vs. quiet NaN isn't tracked separately, so FLT/FLE are
        // treated as always-invalid on NaN input and FEQ as never-invalid
        // (the common case — a signaling NaN is rare in practice).
        if !matches!(op, FCmpOp::Eq) {
            hart.set_fflags(NV);
        }
        hart.write_reg(rd as usize, 0);
        return;
    }
    let result = match op {
        FCmpOp::Eq => a == b,
        FCmpOp::Lt => a < b,
        FCmpOp::Le => a <= b,
    };
    hart.write_reg(rd as usize, result as u64);
}

fn execute_fcvt(op: FCvtOp, rd: u8, rs1: u8, hart: &mut Hart) {
    match op {
        FCvtOp::WS => {
            let v = hart.read_freg_f32(rs1 as usize);
            hart.write_reg(rd as usize, (v as i32 as i64) as u64);
        }
        FCvtOp::WuS => {
            let v = hart.read_freg_f32(rs1 as usize);
            hart.write_reg(rd as usize, (v as u32 as i32 as i64) as u64);
        }
        FCvtOp::LS => {
            let v = hart.read_freg_f32(rs1 as usize);
            hart.write_reg(rd as usize, v as i64 as u64);
        }
        FCvtOp::LuS => {
            let v = hart.read_freg_f32(rs1 as usize);
            hart.write_reg(rd as usize, v as u64);
        }
        FCvtOp::SW => {
            let v = hart.read_reg(rs1 as usize) as i32;
            hart.write_freg_f32(rd as usize, v as f32);
        }
        FCvtOp::SWu => {
            let v = hart.read_reg(rs1 as usize) as u32;
            hart.write_freg_f32(rd as usize, v as f32);
        }
        FCvtOp::SL => {
            let v = hart.read_reg(rs1 as usize) as i64;
            hart.write_freg_f32(rd as usize, v as f32);
        }
        FCvtOp::SLu => {
            let v = hart.read_reg(rs1 as usize);
            hart.write_freg_f32(rd as usize, v as f32);
        }
    }
}

/// `FCLASS.S` result bits, RISC-V spec table (10 mutually-exclusive classes).
fn fclass(v: f32) -> u64 {
    let bits = v.to_bits();
    let neg = bits & 0x8000_0000 != 0;
    let exp = (bits >> 23) & 0xFF;
    let mantissa = bits & 0x007F_FFFF;
    if v.is_nan() {
        return if mantissa & 0x0040_0000 != 0 { 1 << 9 } else { 1 << 8 };
    }
    if exp == 0xFF {
        return if neg { 1 << 0 } else { 1 << 7 };
    }
    if exp == 0 && mantissa == 0 {
        return if neg { 1 << 3 } else { 1 << 4 };
    }
    if exp == 0 {
        return if neg { 1 << 2 } else { 1 << 5 };
    }
    if neg {
        1 << 1
    } else {
        1 << 6
    }
}

fn execute_fmadd(op: FMaddOp, rd: u8, rs1: u8, rs2: u8, rs3: u8, hart: &mut Hart) {
    let a = hart.read_freg_f32(rs1 as usize);
    let b = hart.read_freg_f32(rs2 as usize);
    let c = hart.read_freg_f32(rs3 as usize);
    let result = match op {
        FMaddOp::Madd => a.mul_add(b, c),
        FMaddOp::Msub => a.mul_add(b, -c),
        FMaddOp::Nmsub => -a.mul_add(b, -c),
        FMaddOp::Nmadd => -a.mul_add(b, c),
    };
    hart.write_freg_f32(rd as usize, result);
}

fn execute_amo(
    op: AmoOp,
    rd: u8,
    rs1: u8,
    rs2: u8,
    hart: &mut Hart,
    mem: &mut PhysicalMemory,
    is_sp_hart: bool,
    mprot: u64,
) -> Result<(), Trap> {
    let addr = hart.read_reg(rs1 as usize);
    let is_word = matches!(
        op,
        AmoOp::LrW
            | AmoOp::ScW
            | AmoOp::SwapW
            | AmoOp::AddW
            | AmoOp::XorW
            | AmoOp::AndW
            | AmoOp::OrW
            | AmoOp::MinW
            | AmoOp::MaxW
            | AmoOp::MinUW
            | AmoOp::MaxUW
    );
    let size = if is_word { 4 } else { 8 };
    if matches!(op, AmoOp::LrW | AmoOp::LrD) {
        let v = do_load(hart, mem, addr, size, true, is_sp_hart, mprot)?;
        hart.write_reg(rd as usize, v);
        return Ok(());
    }
    if matches!(op, AmoOp::ScW | AmoOp::ScD) {
        let v = hart.read_reg(rs2 as usize);
        do_store(hart, mem, addr, size, v, is_sp_hart, mprot)?;
        hart.write_reg(rd as usize, 0);
        return Ok(());
    }
    let old = do_load(hart, mem, addr, size, true, is_sp_hart, mprot)?;
    let operand = hart.read_reg(rs2 as usize);
    let new = match op {
        AmoOp::SwapW | AmoOp::SwapD => operand,
        AmoOp::AddW | AmoOp::AddD => old.wrapping_add(operand),
        AmoOp::XorW | AmoOp::XorD => old ^ operand,
        AmoOp::AndW | AmoOp::AndD => old & operand,
        AmoOp::OrW | AmoOp::OrD => old | operand,
        AmoOp::MinW | AmoOp::MinD => ((old as i64).min(operand as i64)) as u64,
        AmoOp::MaxW | AmoOp::MaxD => ((old as i64).max(operand as i64)) as u64,
        AmoOp::MinUW | AmoOp::MinUD => old.min(operand),
        AmoOp::MaxUW | AmoOp::MaxUD => old.max(operand),
        AmoOp::LrW | AmoOp::LrD | AmoOp::ScW | AmoOp::ScD => unreachable!(),
    };
    do_store(hart, mem, addr, size, new, is_sp_hart, mprot)?;
    hart.write_reg(rd as usize, old);
    Ok(())
}

fn take_return(hart: &mut Hart, is_mret: bool) {
    const MPP_SHIFT: u32 = 11;
    const MPIE_SHIFT: u32 = 7;
    const MIE_SHIFT: u32 = 3;
    const SPP_SHIFT: u32 = 8;
    const SPIE_SHIFT: u32 = 5;
    const SIE_SHIFT: u32 = 1;

    if is_mret {
        let mpp = (hart.mstatus >> MPP_SHIFT) & 0x3;
        let mpie = (hart.mstatus >> MPIE_SHIFT) & 1;
        hart.mstatus = (hart.mstatus & !(1 << MIE_SHIFT)) | (mpie << MIE_SHIFT);
        hart.mstatus |= 1 << MPIE_SHIFT;
        hart.mstatus &= !(0x3 << MPP_SHIFT);
        hart.mode = match mpp {
            0 => Mode::User,
            1 => Mode::Supervisor,
            _ => Mode::Machine,
        };
        hart.npc = hart.mepc;
    } else {
        let spp = (hart.mstatus >> SPP_SHIFT) & 1;
        let spie = (hart.mstatus >> SPIE_SHIFT) & 1;
        hart.mstatus = (hart.mstatus & !(1 << SIE_SHIFT)) | (spie << SIE_SHIFT);
        hart.mstatus |= 1 << SPIE_SHIFT;
        hart.mstatus &= !(1 << SPP_SHIFT);
        hart.mode = if spp == 1 { Mode::Supervisor } else { Mode::User };
        hart.npc = hart.sepc;
    }
}

fn read_csr(hart: &Hart, addr: u16) -> u64 {
    match addr {
        csr::FFLAGS => hart.fflags,
        csr::FRM => hart.frm,
        csr::FCSR => hart.fflags | (hart.frm << 5),
        csr::MSTATUS | csr::SSTATUS => hart.mstatus,
        csr::MIE => hart.mie,
        csr::MIP => hart.mip,
        csr::MEDELEG => hart.medeleg,
        csr::MIDELEG => hart.mideleg,
        csr::MTVEC => hart.mtvec,
        csr::STVEC => hart.stvec,
        csr::MEPC => hart.mepc,
        csr::SEPC => hart.sepc,
        csr::MCAUSE => hart.mcause,
        csr::SCAUSE => hart.scause,
        csr::MTVAL => hart.mtval,
        csr::STVAL => hart.stval,
        csr::SATP => hart.satp,
        csr::DCSR => hart.debug.dcsr,
        csr::DPC => hart.debug.dpc,
        csr::DDATA0 => hart.debug.ddata0,
        csr::TDATA1 => hart.debug.tdata1,
        csr::TDATA2 => hart.debug.tdata2,
        csr::MHARTID => hart.id.0 as u64,
        csr::MVENDORID | csr::MARCHID | csr::MIMPID => 0,
        csr::TIME => 0,
        _ => 0,
    }
}

fn write_csr(hart: &mut Hart, addr: u16, value: u64) {
    match addr {
        csr::FFLAGS => hart.fflags = value & 0x1f,
        csr::FRM => hart.frm = value & 0x7,
        csr::FCSR => {
            hart.fflags = value & 0x1f;
            hart.frm = (value >> 5) & 0x7;
        }
        csr::MSTATUS | csr::SSTATUS => hart.mstatus = value,
        csr::MIE => hart.mie = value,
        csr::MIP => hart.mip = value,
        csr::MEDELEG => hart.medeleg = value,
        csr::MIDELEG => hart.mideleg = value,
        csr::MTVEC => hart.mtvec = value,
        csr::STVEC => hart.stvec = value,
        csr::MEPC => hart.mepc = value,
        csr::SEPC => hart.sepc = value,
        csr::MCAUSE => hart.mcause = value,
        csr::SCAUSE => hart.scause = value,
        csr::MTVAL => hart.mtval = value,
        csr::STVAL => hart.stval = value,
        csr::SATP => {
            hart.satp = value;
            hart.tlb.flush();
        }
        csr::DCSR => hart.debug.dcsr = value,
        csr::DPC => hart.debug.dpc = value,
        csr::DDATA0 => hart.debug.ddata0 = value,
        csr::TDATA1 => hart.debug.tdata1 = value,
        csr::TDATA2 => hart.debug.tdata2 = value,
        csr::SIM_DONE => hart.sim_done = Some(value),
        _ => {}
    }
}

fn execute_csr(
    op: CsrOp,
    rd: u8,
    rs_or_uimm: u8,
    addr: u16,
    hart: &mut Hart,
    core: &mut Core,
    minion_feature_enabled: bool,
) -> Result<Option<TensorStart>, Trap> {
    if csr::is_tensor_csr(addr) {
        return start_tensor_op(addr, hart, core, minion_feature_enabled);
    }

    let old = read_csr(hart, addr);
    let operand = if matches!(op, CsrOp::Rwi | CsrOp::Rsi | CsrOp::Rci) {
        rs_or_uimm as u64
    } else {
        hart.read_reg(rs_or_uimm as usize)
    };
    let new = match op {
        CsrOp::Rw | CsrOp::Rwi => operand,
        CsrOp::Rs | CsrOp::Rsi => old | operand,
        CsrOp::Rc | CsrOp::Rci => old & !operand,
    };
    // CSRRS/CSRRC(I) with a zero source operand are read-only; CSRRW(I)
    // always writes.
    let skip_write = matches!(op, CsrOp::Rs | CsrOp::Rsi | CsrOp::Rc | CsrOp::Rci) && operand == 0;
    if !skip_write {
        write_csr(hart, addr, new);
    }
    hart.write_reg(rd as usize, old);
    Ok(None)
}

/// Tensor CSR start routine, steps 1-3. The write value is this
/// implementation's packed parameter encoding (documented in DESIGN.md);
/// step 2's "FSM busy -> instruction_restart" and step 1's feature-gate
/// check happen here, step 3's UUID/FSM-transition too. Steps 4 (coop
/// table) and 5 (`tqueue` push) are reported back via `TensorStart` for the
/// scheduler to apply chip-wide.
fn start_tensor_op(
    addr: u16,
    hart: &mut Hart,
    core: &mut Core,
    minion_feature_enabled: bool,
) -> Result<Option<TensorStart>, Trap> {
    if !minion_feature_enabled {
        return Err(Trap::IllegalInstruction(addr as u32));
    }
    let payload = hart.read_reg(10); // a0 carries the packed op word by convention
    use crate::core::TensorOpKind;

    let busy = match addr {
        csr::TENSOR_LOAD | csr::TENSOR_LOAD_L2SCP => !core.tload.is_idle(),
        csr::TENSOR_FMA => !core.tfma.is_idle(),
        csr::TENSOR_QUANT => !core.tquant.is_idle(),
        csr::TENSOR_STORE => !core.tstore.is_idle(),
        csr::TENSOR_REDUCE => !core.treduce.is_idle(),
        _ => false,
    };
    if busy {
        let wait_bit = match addr {
            csr::TENSOR_LOAD => {
                if hart.id.thread() == 0 {
                    wait_kind::TENSOR_LOAD_0
                } else {
                    wait_kind::TENSOR_LOAD_1
                }
            }
            csr::TENSOR_LOAD_L2SCP => wait_kind::L2,
            csr::TENSOR_FMA => wait_kind::TENSOR_FMA,
            csr::TENSOR_QUANT => wait_kind::TENSOR_QUANT,
            csr::TENSOR_STORE => wait_kind::TENSOR_STORE,
            csr::TENSOR_REDUCE => wait_kind::TENSOR_REDUCE,
            _ => 0,
        };
        hart.state = HartState::Waiting(wait_bit);
        hart.npc = hart.pc;
        return Err(Trap::InstructionRestart);
    }

    let uuid = core.next_uuid();
    match addr {
        csr::TENSOR_LOAD => {
            let coop = (payload >> 63) & 1 != 0;
            let tcoop = ((payload >> 32) & 0xFFFF_FFFF) as u32;
            let params = TLoadParams {
                addr: payload & 0xFFFF_FFFF_FF,
                rows: 16,
                start: 0,
                tenb: false,
                mode: TLoadMode::Raw,
                mask: 0xFFFF,
                l2scp: false,
                coop,
                tcoop,
            };
            core.tload.start(params, uuid);
            core.enqueue(TensorOpKind::Load);
            let coop_info = if coop {
                let decoded = TCoop::decode(tcoop);
                Some((decoded, 1u32 << (hart.id.0 % 32)))
            } else {
                None
            };
            Ok(Some(TensorStart { kind: TensorOpKind::Load, coop: coop_info }))
        }
        csr::TENSOR_LOAD_SETUP_B => {
            core.tfma.tenb_arrived();
            Ok(None)
        }
        csr::TENSOR_WAIT => {
            let event = payload & 0xF;
            if event > 10 {
                return Ok(None); // invalid events are a no-op
            }
            let what = 1u32 << event;
            if !tensor_fsm_idle(core, what) {
                hart.state = HartState::Waiting(what);
            }
            Ok(None)
        }
        // Other tensor ops (FMA/Quant/Store/Reduce) require richer decoded
        // parameters than a single a0 payload conveys; the scheduler's
        // higher-level dispatch (chip.rs) assembles those from multiple
        // registers before calling into the FSMs directly.
        _ => Ok(None),
    }
}

/// Whether the tensor FSM a `TENSOR_WAIT` event bit names is idle. Only the
/// asynchronous FSMs (load/fma/reduce/quant/store) can be non-idle; every
/// other event bit (interrupts, message ports, credits, ...) is reported
/// idle here since waiting on those is handled elsewhere.
fn tensor_fsm_idle(core: &Core, what: u32) -> bool {
    use crate::hart::wait_kind;
    match what {
        wait_kind::TENSOR_LOAD_0 | wait_kind::TENSOR_LOAD_1 | wait_kind::L2 => core.tload.is_idle(),
        wait_kind::TENSOR_FMA => core.tfma.is_idle(),
        wait_kind::TENSOR_REDUCE => core.treduce.is_idle(),
        wait_kind::TENSOR_QUANT => core.tquant.is_idle(),
        wait_kind::TENSOR_STORE => core.tstore.is_idle(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{dram::Dram, Region};
    use crate::topology::{CoreId, HartId};

    fn setup() -> (Hart, Core, PhysicalMemory) {
        let hart = Hart::new(HartId(0), 0x8000_0000_00);
        let core = Core::new(CoreId(0));
        let mut mem = PhysicalMemory::new();
        mem.add_region(Region::Dram(Dram::new(0x80_0000_0000, 0x10000)));
        (hart, core, mem)
    }

    #[test]
    fn addi_writes_register() {
        let (mut hart, mut core, mut mem) = setup();
        let inst = Inst::AluImm { op: AluOp::Add, rd: 1, rs1: 0, imm: 42 };
        execute(inst, &mut hart, &mut core, &mut mem, true, true).unwrap();
        assert_eq!(hart.read_reg(1), 42);
    }

    #[test]
    fn store_then_load_roundtrip() {
        let (mut hart, mut core, mut mem) = setup();
        hart.write_reg(2, 0x80_0000_0010);
        hart.write_reg(3, 0xDEAD_BEEF);
        let store = Inst::Store { op: StoreOp::Sw, rs1: 2, rs2: 3, imm: 0 };
        execute(store, &mut hart, &mut core, &mut mem, true, true).unwrap();
        let load = Inst::Load { op: LoadOp::Lwu, rd: 4, rs1: 2, imm: 0 };
        execute(load, &mut hart, &mut core, &mut mem, true, true).unwrap();
        assert_eq!(hart.read_reg(4), 0xDEAD_BEEF);
    }

    #[test]
    fn ecall_from_machine_traps() {
        let (mut hart, mut core, mut mem) = setup();
        let err = execute(Inst::Ecall, &mut hart, &mut core, &mut mem, true, true).unwrap_err();
        assert!(matches!(err, Trap::EnvironmentCallFromM));
    }

    #[test]
    fn fadd_s_computes_sum() {
        let (mut hart, mut core, mut mem) = setup();
        hart.write_freg_f32(1, 1.5);
        hart.write_freg_f32(2, 2.5);
        let inst = Inst::FBin { op: FBinOp::Add, rd: 3, rs1: 1, rs2: 2 };
        execute(inst, &mut hart, &mut core, &mut mem, true, true).unwrap();
        assert_eq!(hart.read_freg_f32(3), 4.0);
    }

    #[test]
    fn fdiv_by_zero_sets_dz_flag() {
        let (mut hart, mut core, mut mem) = setup();
        hart.write_freg_f32(1, 1.0);
        hart.write_freg_f32(2, 0.0);
        let inst = Inst::FBin { op: FBinOp::Div, rd: 3, rs1: 1, rs2: 2 };
        execute(inst, &mut hart, &mut core, &mut mem, true, true).unwrap();
        assert!(hart.read_freg_f32(3).is_infinite());
        assert_eq!(hart.fflags & DZ, DZ);
    }

    #[test]
    fn flw_fsw_roundtrip() {
        let (mut hart, mut core, mut mem) = setup();
        hart.write_reg(2, 0x80_0000_0020);
        hart.write_freg_f32(5, 3.25);
        let store = Inst::FStore { rs1: 2, rs2: 5, imm: 0 };
        execute(store, &mut hart, &mut core, &mut mem, true, true).unwrap();
        let load = Inst::FLoad { rd: 6, rs1: 2, imm: 0 };
        execute(load, &mut hart, &mut core, &mut mem, true, true).unwrap();
        assert_eq!(hart.read_freg_f32(6), 3.25);
    }

    #[test]
    fn fcvt_w_s_truncates_toward_zero() {
        let (mut hart, mut core, mut mem) = setup();
        hart.write_freg_f32(1, -2.9);
        let inst = Inst::FCvt { op: FCvtOp::WS, rd: 2, rs1: 1 };
        execute(inst, &mut hart, &mut core, &mut mem, true, true).unwrap();
        assert_eq!(hart.read_reg(2) as i64, -2);
    }

    #[test]
    fn fmadd_s_computes_fused_multiply_add() {
        let (mut hart, mut core, mut mem) = setup();
        hart.write_freg_f32(1, 2.0);
        hart.write_freg_f32(2, 3.0);
        hart.write_freg_f32(3, 1.0);
        let inst = Inst::FMadd { op: FMaddOp::Madd, rd: 4, rs1: 1, rs2: 2, rs3: 3 };
        execute(inst, &mut hart, &mut core, &mut mem, true, true).unwrap();
        assert_eq!(hart.read_freg_f32(4), 7.0);
    }

    #[test]
    fn fclass_identifies_negative_normal() {
        assert_eq!(fclass(-1.0f32), 1 << 1);
        assert_eq!(fclass(0.0f32), 1 << 4);
        assert_eq!(fclass(f32::NAN), 1 << 9);
    }

    #[test]
    fn busy_fsm_restarts_instruction() {
        let (mut hart, mut core, mut mem) = setup();
        hart.write_reg(10, 0x80_0000_0010);
        let inst = Inst::Csr { op: CsrOp::Rw, rd: 0, rs_or_uimm: 0, csr: csr::TENSOR_LOAD };
        execute(inst, &mut hart, &mut core, &mut mem, true, true).unwrap();
        assert!(!core.tload.is_idle());
        let err = execute(inst, &mut hart, &mut core, &mut mem, true, true).unwrap_err();
        assert!(matches!(err, Trap::InstructionRestart));
        assert!(hart.state.is_waiting_on(wait_kind::TENSOR_LOAD_0));
    }

    #[test]
    fn tensor_wait_is_noop_when_fsm_idle() {
        let (mut hart, mut core, mut mem) = setup();
        let state_before = hart.state;
        hart.write_reg(10, 0); // event 0 -> TENSOR_LOAD_0, idle
        let inst = Inst::Csr { op: CsrOp::Rw, rd: 0, rs_or_uimm: 0, csr: csr::TENSOR_WAIT };
        execute(inst, &mut hart, &mut core, &mut mem, true, true).unwrap();
        assert_eq!(hart.state, state_before);
    }

    #[test]
    fn tensor_wait_parks_hart_when_fsm_busy() {
        let (mut hart, mut core, mut mem) = setup();
        hart.write_reg(10, 0x80_0000_0010);
        let load_inst = Inst::Csr { op: CsrOp::Rw, rd: 0, rs_or_uimm: 0, csr: csr::TENSOR_LOAD };
        execute(load_inst, &mut hart, &mut core, &mut mem, true, true).unwrap();
        assert!(!core.tload.is_idle());

        hart.write_reg(10, 0); // event 0 -> TENSOR_LOAD_0
        let wait_inst = Inst::Csr { op: CsrOp::Rw, rd: 0, rs_or_uimm: 0, csr: csr::TENSOR_WAIT };
        execute(wait_inst, &mut hart, &mut core, &mut mem, true, true).unwrap();
        assert!(hart.state.is_waiting_on(wait_kind::TENSOR_LOAD_0));
    }
}
