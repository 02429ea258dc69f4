//! Instruction decode: RV64IMFC plus
//! the compressed (`C`) extension, expanded to the same `Inst` the executor
//! dispatches on. Vendor tensor instructions are encoded as CSR writes
//! (`isa::csr::is_tensor_csr`), so no separate tensor opcode space is
//! needed here.

use crate::error::Trap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchOp {
    Beq,
    Bne,
    Blt,
    Bge,
    Bltu,
    Bgeu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOp {
    Lb,
    Lh,
    Lw,
    Ld,
    Lbu,
    Lhu,
    Lwu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Sb,
    Sh,
    Sw,
    Sd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    Sll,
    Slt,
    Sltu,
    Xor,
    Srl,
    Sra,
    Or,
    And,
    Mul,
    MulH,
    MulHSU,
    MulHU,
    Div,
    DivU,
    Rem,
    RemU,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrOp {
    Rw,
    Rs,
    Rc,
    Rwi,
    Rsi,
    Rci,
}

/// Single-precision binary/unary float ops, part of this chip's RV64IMFC
/// base ISA. Rounding mode (`funct3` on the real encoding) is decoded
/// nowhere below —
/// every op rounds via Rust's native `f32` arithmetic (RNE), see
/// `Hart::frm`'s doc comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FBinOp {
    Add,
    Sub,
    Mul,
    Div,
    Sgnj,
    Sgnjn,
    Sgnjx,
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FCmpOp {
    Eq,
    Lt,
    Le,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FCvtOp {
    WS,
    WuS,
    LS,
    LuS,
    SW,
    SWu,
    SL,
    SLu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FMaddOp {
    Madd,
    Msub,
    Nmsub,
    Nmadd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmoOp {
    LrW,
    ScW,
    SwapW,
    AddW,
    XorW,
    AndW,
    OrW,
    MinW,
    MaxW,
    MinUW,
    MaxUW,
    LrD,
    ScD,
    SwapD,
    AddD,
    XorD,
    AndD,
    OrD,
    MinD,
    MaxD,
    MinUD,
    MaxUD,
}

#[derive(Debug, Clone, Copy)]
#[allow(clippy::enum_variant_names)]
pub enum Inst {
    Lui { rd: u8, imm: i64 },
    Auipc { rd: u8, imm: i64 },
    Jal { rd: u8, imm: i64 },
    Jalr { rd: u8, rs1: u8, imm: i64 },
    Branch { op: BranchOp, rs1: u8, rs2: u8, imm: i64 },
    Load { op: LoadOp, rd: u8, rs1: u8, imm: i64 },
    Store { op: StoreOp, rs1: u8, rs2: u8, imm: i64 },
    AluImm { op: AluOp, rd: u8, rs1: u8, imm: i64 },
    AluImm32 { op: AluOp, rd: u8, rs1: u8, imm: i64 },
    Alu { op: AluOp, rd: u8, rs1: u8, rs2: u8 },
    Alu32 { op: AluOp, rd: u8, rs1: u8, rs2: u8 },
    Fence,
    FenceI,
    Ecall,
    Ebreak,
    Mret,
    Sret,
    Wfi,
    SfenceVma { rs1: u8, rs2: u8 },
    Csr { op: CsrOp, rd: u8, rs_or_uimm: u8, csr: u16 },
    Amo { op: AmoOp, rd: u8, rs1: u8, rs2: u8, aq: bool, rl: bool },

    FLoad { rd: u8, rs1: u8, imm: i64 },
    FStore { rs1: u8, rs2: u8, imm: i64 },
    FBin { op: FBinOp, rd: u8, rs1: u8, rs2: u8 },
    FSqrt { rd: u8, rs1: u8 },
    FCmp { op: FCmpOp, rd: u8, rs1: u8, rs2: u8 },
    FCvt { op: FCvtOp, rd: u8, rs1: u8 },
    FMvXW { rd: u8, rs1: u8 },
    FMvWX { rd: u8, rs1: u8 },
    FClass { rd: u8, rs1: u8 },
    FMadd { op: FMaddOp, rd: u8, rs1: u8, rs2: u8, rs3: u8 },
}

fn sext(value: u32, bits: u32) -> i64 {
    let shift = 32 - bits;
    ((value << shift) as i32 >> shift) as i64
}

/// Decode one instruction starting at `pc`. `fetch16`/`fetch32` read the
/// 16/32-bit words already staged in the hart's fetch cache; this function
/// itself is pure decode.
pub fn decode(word: u32, is_compressed_hint: bool) -> Result<(Inst, bool), Trap> {
    if is_compressed_hint || word & 0x3 != 0x3 {
        let inst = decode_compressed((word & 0xFFFF) as u16)?;
        return Ok((inst, true));
    }
    Ok((decode32(word)?, false))
}

fn decode32(w: u32) -> Result<Inst, Trap> {
    let opcode = w & 0x7F;
    let rd = ((w >> 7) & 0x1F) as u8;
    let funct3 = (w >> 12) & 0x7;
    let rs1 = ((w >> 15) & 0x1F) as u8;
    let rs2 = ((w >> 20) & 0x1F) as u8;
    let funct7 = (w >> 25) & 0x7F;

    match opcode {
        0x37 => Ok(Inst::Lui { rd, imm: (w & 0xFFFF_F000) as i32 as i64 }),
        0x17 => Ok(Inst::Auipc { rd, imm: (w & 0xFFFF_F000) as i32 as i64 }),
        0x6F => {
            let imm = ((w >> 31) & 1) << 20
                | ((w >> 21) & 0x3FF) << 1
                | ((w >> 20) & 1) << 11
                | ((w >> 12) & 0xFF) << 12;
            Ok(Inst::Jal { rd, imm: sext(imm, 21) })
        }
        0x67 => {
            let imm = sext(w >> 20, 12);
            Ok(Inst::Jalr { rd, rs1, imm })
        }
        0x63 => {
            let imm = ((w >> 31) & 1) << 12
                | ((w >> 7) & 1) << 11
                | ((w >> 25) & 0x3F) << 5
                | ((w >> 8) & 0xF) << 1;
            let op = match funct3 {
                0 => BranchOp::Beq,
                1 => BranchOp::Bne,
                4 => BranchOp::Blt,
                5 => BranchOp::Bge,
                6 => BranchOp::Bltu,
                7 => BranchOp::Bgeu,
                _ => return Err(Trap::IllegalInstruction(w)),
            };
            Ok(Inst::Branch { op, rs1, rs2, imm: sext(imm, 13) })
        }
        0x03 => {
            let imm = sext(w >> 20, 12);
            let op = match funct3 {
                0 => LoadOp::Lb,
                1 => LoadOp::Lh,
                2 => LoadOp::Lw,
                3 => LoadOp::Ld,
                4 => LoadOp::Lbu,
                5 => LoadOp::Lhu,
                6 => LoadOp::Lwu,
                _ => return Err(Trap::IllegalInstruction(w)),
            };
            Ok(Inst::Load { op, rd, rs1, imm })
        }
        0x23 => {
            let imm = ((w >> 25) & 0x7F) << 5 | ((w >> 7) & 0x1F);
            let op = match funct3 {
                0 => StoreOp::Sb,
                1 => StoreOp::Sh,
                2 => StoreOp::Sw,
                3 => StoreOp::Sd,
                _ => return Err(Trap::IllegalInstruction(w)),
            };
            Ok(Inst::Store { op, rs1, rs2, imm: sext(imm, 12) })
        }
        0x13 => {
            let imm = sext(w >> 20, 12);
            let shamt = (w >> 20) & 0x3F;
            let op = match funct3 {
                0 => AluOp::Add,
                1 => AluOp::Sll,
                2 => AluOp::Slt,
                3 => AluOp::Sltu,
                4 => AluOp::Xor,
                5 => {
                    if funct7 & 0x20 != 0 {
                        AluOp::Sra
                    } else {
                        AluOp::Srl
                    }
                }
                6 => AluOp::Or,
                7 => AluOp::And,
                _ => unreachable!(),
            };
            let imm = if matches!(op, AluOp::Sll | AluOp::Srl | AluOp::Sra) {
                shamt as i64
            } else {
                imm
            };
            Ok(Inst::AluImm { op, rd, rs1, imm })
        }
        0x1B => {
            let imm = sext(w >> 20, 12);
            let shamt = (w >> 20) & 0x1F;
            let op = match funct3 {
                0 => AluOp::Add,
                1 => AluOp::Sll,
                5 => {
                    if funct7 & 0x20 != 0 {
                        AluOp::Sra
                    } else {
                        AluOp::Srl
                    }
                }
                _ => return Err(Trap::IllegalInstruction(w)),
            };
            let imm = if matches!(op, AluOp::Sll | AluOp::Srl | AluOp::Sra) {
                shamt as i64
            } else {
                imm
            };
            Ok(Inst::AluImm32 { op, rd, rs1, imm })
        }
        0x33 => {
            let op = decode_rtype(funct3, funct7, w)?;
            Ok(Inst::Alu { op, rd, rs1, rs2 })
        }
        0x3B => {
            let op = decode_rtype(funct3, funct7, w)?;
            Ok(Inst::Alu32 { op, rd, rs1, rs2 })
        }
        0x0F => {
            if funct3 == 1 {
                Ok(Inst::FenceI)
            } else {
                Ok(Inst::Fence)
            }
        }
        0x2F => decode_amo(w, rd, rs1, rs2, funct3, funct7),
        0x73 => decode_system(w, rd, rs1, funct3, funct7),
        0x07 => {
            if funct3 != 2 {
                return Err(Trap::IllegalInstruction(w));
            }
            Ok(Inst::FLoad { rd, rs1, imm: sext(w >> 20, 12) })
        }
        0x27 => {
            if funct3 != 2 {
                return Err(Trap::IllegalInstruction(w));
            }
            let imm = ((w >> 25) & 0x7F) << 5 | ((w >> 7) & 0x1F);
            Ok(Inst::FStore { rs1, rs2, imm: sext(imm, 12) })
        }
        0x53 => decode_op_fp(w, rd, rs1, rs2, funct3, funct7),
        0x43 => decode_fmadd(w, rd, rs1, rs2, funct7, FMaddOp::Madd),
        0x47 => decode_fmadd(w, rd, rs1, rs2, funct7, FMaddOp::Msub),
        0x4B => decode_fmadd(w, rd, rs1, rs2, funct7, FMaddOp::Nmsub),
        0x4F => decode_fmadd(w, rd, rs1, rs2, funct7, FMaddOp::Nmadd),
        _ => Err(Trap::IllegalInstruction(w)),
    }
}

/// Decodes the OP-FP major opcode (0x53). `funct7`'s low two bits are the
/// format field; only `00` (single-precision) is implemented (no `D`
/// extension in this chip's ISA).
fn decode_op_fp(w: u32, rd: u8, rs1: u8, rs2: u8, funct3: u32, funct7: u32) -> Result<Inst, Trap> {
    match funct7 {
        0x00 => Ok(Inst::FBin { op: FBinOp::Add, rd, rs1, rs2 }),
        0x04 => Ok(Inst::FBin { op: FBinOp::Sub, rd, rs1, rs2 }),
        0x08 => Ok(Inst::FBin { op: FBinOp::Mul, rd, rs1, rs2 }),
        0x0C => Ok(Inst::FBin { op: FBinOp::Div, rd, rs1, rs2 }),
        0x2C => Ok(Inst::FSqrt { rd, rs1 }),
        0x10 => match funct3 {
            0 => Ok(Inst::FBin { op: FBinOp::Sgnj, rd, rs1, rs2 }),
            1 => Ok(Inst::FBin { op: FBinOp::Sgnjn, rd, rs1, rs2 }),
            2 => Ok(Inst::FBin { op: FBinOp::Sgnjx, rd, rs1, rs2 }),
            _ => Err(Trap::IllegalInstruction(w)),
        },
        0x14 => match funct3 {
            0 => Ok(Inst::FBin { op: FBinOp::Min, rd, rs1, rs2 }),
            1 => Ok(Inst::FBin { op: FBinOp::Max, rd, rs1, rs2 }),
            _ => Err(Trap::IllegalInstruction(w)),
        },
        0x50 => match funct3 {
            2 => Ok(Inst::FCmp { op: FCmpOp::Eq, rd, rs1, rs2 }),
            1 => Ok(Inst::FCmp { op: FCmpOp::Lt, rd, rs1, rs2 }),
            0 => Ok(Inst::FCmp { op: FCmpOp::Le, rd, rs1, rs2 }),
            _ => Err(Trap::IllegalInstruction(w)),
        },
        0x60 => {
            let op = match rs2 {
                0 => FCvtOp::WS,
                1 => FCvtOp::WuS,
                2 => FCvtOp::LS,
                3 => FCvtOp::LuS,
                _ => return Err(Trap::IllegalInstruction(w)),
            };
            Ok(Inst::FCvt { op, rd, rs1 })
        }
        0x68 => {
            let op = match rs2 {
                0 => FCvtOp::SW,
                1 => FCvtOp::SWu,
                2 => FCvtOp::SL,
                3 => FCvtOp::SLu,
                _ => return Err(Trap::IllegalInstruction(w)),
            };
            Ok(Inst::FCvt { op, rd, rs1 })
        }
        0x70 if rs2 == 0 => match funct3 {
            0 => Ok(Inst::FMvXW { rd, rs1 }),
            1 => Ok(Inst::FClass { rd, rs1 }),
            _ => Err(Trap::IllegalInstruction(w)),
        },
        0x78 if rs2 == 0 && funct3 == 0 => Ok(Inst::FMvWX { rd, rs1 }),
        _ => Err(Trap::IllegalInstruction(w)),
    }
}

/// R4-type FMADD family (opcodes 0x43/0x47/0x4B/0x4F): `rs3` lives in the
/// top 5 bits, with the low 2 bits of that 7-bit field as the format
/// (single-precision only, matching `decode_op_fp`).
fn decode_fmadd(w: u32, rd: u8, rs1: u8, rs2: u8, funct7: u32, op: FMaddOp) -> Result<Inst, Trap> {
    if funct7 & 0x3 != 0 {
        return Err(Trap::IllegalInstruction(w));
    }
    let rs3 = (funct7 >> 2) as u8;
    Ok(Inst::FMadd { op, rd, rs1, rs2, rs3 })
}

fn decode_rtype(funct3: u32, funct7: u32, w: u32) -> Result<AluOp, Trap> {
    Ok(match (funct3, funct7) {
        (0, 0x00) => AluOp::Add,
        (0, 0x20) => AluOp::Sub,
        (0, 0x01) => AluOp::Mul,
        (1, 0x00) => AluOp::Sll,
        (1, 0x01) => AluOp::MulH,
        (2, 0x00) => AluOp::Slt,
        (2, 0x01) => AluOp::MulHSU,
        (3, 0x00) => AluOp::Sltu,
        (3, 0x01) => AluOp::MulHU,
        (4, 0x00) => AluOp::Xor,
        (4, 0x01) => AluOp::Div,
        (5, 0x00) => AluOp::Srl,
        (5, 0x20) => AluOp::Sra,
        (5, 0x01) => AluOp::DivU,
        (6, 0x00) => AluOp::Or,
        (6, 0x01) => AluOp::Rem,
        (7, 0x00) => AluOp::And,
        (7, 0x01) => AluOp::RemU,
        _ => return Err(Trap::IllegalInstruction(w)),
    })
}

fn decode_amo(w: u32, rd: u8, rs1: u8, rs2: u8, funct3: u32, funct7: u32) -> Result<Inst, Trap> {
    let aq = (funct7 >> 1) & 1 != 0;
    let rl = funct7 & 1 != 0;
    let kind = funct7 >> 2;
    let op = match (funct3, kind) {
        (2, 0x02) => AmoOp::LrW,
        (2, 0x03) => AmoOp::ScW,
        (2, 0x01) => AmoOp::SwapW,
        (2, 0x00) => AmoOp::AddW,
        (2, 0x04) => AmoOp::XorW,
        (2, 0x0C) => AmoOp::AndW,
        (2, 0x08) => AmoOp::OrW,
        (2, 0x10) => AmoOp::MinW,
        (2, 0x14) => AmoOp::MaxW,
        (2, 0x18) => AmoOp::MinUW,
        (2, 0x1C) => AmoOp::MaxUW,
        (3, 0x02) => AmoOp::LrD,
        (3, 0x03) => AmoOp::ScD,
        (3, 0x01) => AmoOp::SwapD,
        (3, 0x00) => AmoOp::AddD,
        (3, 0x04) => AmoOp::XorD,
        (3, 0x0C) => AmoOp::AndD,
        (3, 0x08) => AmoOp::OrD,
        (3, 0x10) => AmoOp::MinD,
        (3, 0x14) => AmoOp::MaxD,
        (3, 0x18) => AmoOp::MinUD,
        (3, 0x1C) => AmoOp::MaxUD,
        _ => return Err(Trap::IllegalInstruction(w)),
    };
    Ok(Inst::Amo { op, rd, rs1, rs2, aq, rl })
}

fn decode_system(w: u32, rd: u8, rs1: u8, funct3: u32, funct7: u32) -> Result<Inst, Trap> {
    if funct3 == 0 {
        return match (rd, rs1, funct7, (w >> 20) & 0x1F) {
            (0, 0, 0x00, 0) => Ok(Inst::Ecall),
            (0, 0, 0x00, 1) => Ok(Inst::Ebreak),
            (0, 0, 0x18, _) => Ok(Inst::Mret),
            (0, 0, 0x08, _) if (w >> 20) & 0x1F == 2 => Ok(Inst::Sret),
            (0, 0, 0x08, _) if (w >> 20) & 0x1F == 5 => Ok(Inst::Wfi),
            (0, _, 0x09, _) => Ok(Inst::SfenceVma {
                rs1,
                rs2: ((w >> 20) & 0x1F) as u8,
            }),
            _ => Err(Trap::IllegalInstruction(w)),
        };
    }
    let csr = ((w >> 20) & 0xFFF) as u16;
    let op = match funct3 {
        1 => CsrOp::Rw,
        2 => CsrOp::Rs,
        3 => CsrOp::Rc,
        5 => CsrOp::Rwi,
        6 => CsrOp::Rsi,
        7 => CsrOp::Rci,
        _ => return Err(Trap::IllegalInstruction(w)),
    };
    Ok(Inst::Csr { op, rd, rs_or_uimm: rs1, csr })
}

/// Expands one 16-bit compressed instruction into its RV64 base-ISA
/// equivalent. The hart's fetch cache keys on the aligned 32-byte buffer,
/// but each fetched unit may be a 2- or 4-byte instruction.
fn decode_compressed(c: u16) -> Result<Inst, Trap> {
    let op = c & 0x3;
    let funct3 = (c >> 13) & 0x7;
    let w = c as u32;

    let rd_rs1p = (((c >> 7) & 0x7) + 8) as u8;
    let rs2p = (((c >> 2) & 0x7) + 8) as u8;
    let rd_rs1 = ((c >> 7) & 0x1F) as u8;

    match op {
        0b00 => match funct3 {
            0b000 => {
                let imm = ((c >> 5) & 1) << 3
                    | ((c >> 6) & 1) << 2
                    | ((c >> 7) & 0xF) << 6
                    | ((c >> 11) & 0x3) << 4;
                if imm == 0 {
                    return Err(Trap::IllegalInstruction(w));
                }
                Ok(Inst::AluImm { op: AluOp::Add, rd: rs2p, rs1: 2, imm: imm as i64 })
            }
            0b010 => {
                let imm = ((c >> 6) & 1) << 2
                    | ((c >> 10) & 0x7) << 3
                    | ((c >> 5) & 1) << 6;
                Ok(Inst::Load { op: LoadOp::Lw, rd: rs2p, rs1: rd_rs1p, imm: imm as i64 })
            }
            0b011 => {
                let imm = ((c >> 10) & 0x7) << 3 | ((c >> 5) & 0x3) << 6;
                Ok(Inst::Load { op: LoadOp::Ld, rd: rs2p, rs1: rd_rs1p, imm: imm as i64 })
            }
            0b110 => {
                let imm = ((c >> 6) & 1) << 2
                    | ((c >> 10) & 0x7) << 3
                    | ((c >> 5) & 1) << 6;
                Ok(Inst::Store { op: StoreOp::Sw, rs1: rd_rs1p, rs2: rs2p, imm: imm as i64 })
            }
            0b111 => {
                let imm = ((c >> 10) & 0x7) << 3 | ((c >> 5) & 0x3) << 6;
                Ok(Inst::Store { op: StoreOp::Sd, rs1: rd_rs1p, rs2: rs2p, imm: imm as i64 })
            }
            _ => Err(Trap::IllegalInstruction(w)),
        },
        0b01 => match funct3 {
            0b000 => {
                let imm = c_imm6(c);
                Ok(Inst::AluImm { op: AluOp::Add, rd: rd_rs1, rs1: rd_rs1, imm })
            }
            0b001 => {
                let imm = c_imm6(c) << 0; // c.addiw (rv64)
                Ok(Inst::AluImm32 { op: AluOp::Add, rd: rd_rs1, rs1: rd_rs1, imm })
            }
            0b010 => {
                let imm = c_imm6(c);
                Ok(Inst::AluImm { op: AluOp::Add, rd: rd_rs1, rs1: 0, imm })
            }
            0b011 if rd_rs1 == 2 => {
                let imm = ((c >> 6) & 1) << 4
                    | ((c >> 2) & 1) << 5
                    | ((c >> 5) & 1) << 6
                    | ((c >> 3) & 0x3) << 7
                    | ((c >> 12) & 1) << 9;
                let imm = sext(imm as u32, 10);
                Ok(Inst::AluImm { op: AluOp::Add, rd: 2, rs1: 2, imm })
            }
            0b011 => {
                let imm = (((c >> 2) & 0x1F) as u32) << 12 | (((c >> 12) & 1) as u32) << 17;
                Ok(Inst::Lui { rd: rd_rs1, imm: sext(imm, 18) })
            }
            0b100 => {
                let sub = (c >> 10) & 0x3;
                match sub {
                    0 | 1 => {
                        let shamt = ((c >> 2) & 0x1F) | ((c >> 12) & 1) << 5;
                        let op = if sub == 0 { AluOp::Srl } else { AluOp::Sra };
                        Ok(Inst::AluImm { op, rd: rd_rs1p, rs1: rd_rs1p, imm: shamt as i64 })
                    }
                    2 => {
                        let imm = c_imm6(c);
                        Ok(Inst::AluImm { op: AluOp::And, rd: rd_rs1p, rs1: rd_rs1p, imm })
                    }
                    _ => {
                        let funct2 = (c >> 5) & 0x3;
                        let op = match ((c >> 12) & 1, funct2) {
                            (0, 0) => AluOp::Sub,
                            (0, 1) => AluOp::Xor,
                            (0, 2) => AluOp::Or,
                            (0, 3) => AluOp::And,
                            _ => return Err(Trap::IllegalInstruction(w)),
                        };
                        Ok(Inst::Alu { op, rd: rd_rs1p, rs1: rd_rs1p, rs2: rs2p })
                    }
                }
            }
            0b101 => {
                let imm = ((c >> 3) & 0x7) << 1
                    | ((c >> 11) & 1) << 4
                    | ((c >> 2) & 1) << 5
                    | ((c >> 7) & 1) << 6
                    | ((c >> 6) & 1) << 7
                    | ((c >> 9) & 0x3) << 8
                    | ((c >> 8) & 1) << 10
                    | ((c >> 12) & 1) << 11;
                Ok(Inst::Jal { rd: 0, imm: sext(imm as u32, 12) })
            }
            0b110 | 0b111 => {
                let imm = ((c >> 3) & 0x3) << 1
                    | ((c >> 10) & 0x3) << 3
                    | ((c >> 2) & 1) << 5
                    | ((c >> 5) & 0x3) << 6
                    | ((c >> 12) & 1) << 8;
                let branch_op = if funct3 == 0b110 { BranchOp::Beq } else { BranchOp::Bne };
                Ok(Inst::Branch { op: branch_op, rs1: rd_rs1p, rs2: 0, imm: sext(imm as u32, 9) })
            }
            _ => Err(Trap::IllegalInstruction(w)),
        },
        0b10 => match funct3 {
            0b000 => {
                let shamt = ((c >> 2) & 0x1F) | ((c >> 12) & 1) << 5;
                Ok(Inst::AluImm { op: AluOp::Sll, rd: rd_rs1, rs1: rd_rs1, imm: shamt as i64 })
            }
            0b010 => {
                let imm = ((c >> 4) & 0x7) << 2 | ((c >> 12) & 1) << 5 | ((c >> 2) & 0x3) << 6;
                Ok(Inst::Load { op: LoadOp::Lw, rd: rd_rs1, rs1: 2, imm: imm as i64 })
            }
            0b011 => {
                let imm = ((c >> 5) & 0x3) << 3 | ((c >> 12) & 1) << 5 | ((c >> 2) & 0x7) << 6;
                Ok(Inst::Load { op: LoadOp::Ld, rd: rd_rs1, rs1: 2, imm: imm as i64 })
            }
            0b100 => {
                let bit12 = (c >> 12) & 1;
                let rs2 = ((c >> 2) & 0x1F) as u8;
                match (bit12, rs2) {
                    (0, 0) => Ok(Inst::Jalr { rd: 0, rs1: rd_rs1, imm: 0 }),
                    (0, _) => Ok(Inst::Alu { op: AluOp::Add, rd: rd_rs1, rs1: 0, rs2 }),
                    (1, 0) if rd_rs1 == 0 => Ok(Inst::Ebreak),
                    (1, 0) => Ok(Inst::Jalr { rd: 1, rs1: rd_rs1, imm: 0 }),
                    (1, _) => Ok(Inst::Alu { op: AluOp::Add, rd: rd_rs1, rs1: rd_rs1, rs2 }),
                    _ => Err(Trap::IllegalInstruction(w)),
                }
            }
            0b110 => {
                let imm = ((c >> 9) & 0xF) << 2 | ((c >> 7) & 0x3) << 6;
                Ok(Inst::Store { op: StoreOp::Sw, rs1: 2, rs2: ((c >> 2) & 0x1F) as u8, imm: imm as i64 })
            }
            0b111 => {
                let imm = ((c >> 10) & 0x7) << 3 | ((c >> 7) & 0x7) << 6;
                Ok(Inst::Store { op: StoreOp::Sd, rs1: 2, rs2: ((c >> 2) & 0x1F) as u8, imm: imm as i64 })
            }
            _ => Err(Trap::IllegalInstruction(w)),
        },
        _ => Err(Trap::IllegalInstruction(w)),
    }
}

fn c_imm6(c: u16) -> i64 {
    let imm = ((c >> 2) & 0x1F) | ((c >> 12) & 1) << 5;
    sext(imm as u32, 6)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_addi() {
        // addi x1, x0, 5
        let w = 0x00500093;
        let (inst, compressed) = decode(w, false).unwrap();
        assert!(!compressed);
        match inst {
            Inst::AluImm { op: AluOp::Add, rd: 1, rs1: 0, imm: 5 } => {}
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn decodes_jal() {
        // jal x1, 0x800 (arbitrary aligned offset)
        let w = 0x800000EF;
        let (inst, _) = decode(w, false).unwrap();
        assert!(matches!(inst, Inst::Jal { rd: 1, .. }));
    }

    #[test]
    fn rejects_illegal_opcode() {
        let w = 0b0000000; // opcode 0, not a legal 32-bit major opcode
        assert!(decode(w, false).is_err());
    }

    #[test]
    fn decodes_fadd_s() {
        // fadd.s f3, f1, f2
        let w: u32 = (0x00 << 25) | (2 << 20) | (1 << 15) | (0 << 12) | (3 << 7) | 0x53;
        let (inst, compressed) = decode(w, false).unwrap();
        assert!(!compressed);
        assert!(matches!(inst, Inst::FBin { op: FBinOp::Add, rd: 3, rs1: 1, rs2: 2 }));
    }

    #[test]
    fn decodes_flw_fsw() {
        // flw f1, 8(x2)
        let w: u32 = (8 << 20) | (2 << 15) | (2 << 12) | (1 << 7) | 0x07;
        let (inst, _) = decode(w, false).unwrap();
        assert!(matches!(inst, Inst::FLoad { rd: 1, rs1: 2, imm: 8 }));

        // fsw f3, 4(x2)
        let w: u32 = (0 << 25) | (3 << 20) | (2 << 15) | (2 << 12) | (4 << 7) | 0x27;
        let (inst, _) = decode(w, false).unwrap();
        assert!(matches!(inst, Inst::FStore { rs1: 2, rs2: 3, imm: 4 }));
    }

    #[test]
    fn decodes_fmadd_s() {
        // fmadd.s f1, f2, f3, f4 (rs3=f4, fmt=00)
        let funct7 = (4u32 << 2) | 0;
        let w: u32 = (funct7 << 25) | (3 << 20) | (2 << 15) | (0 << 12) | (1 << 7) | 0x43;
        let (inst, _) = decode(w, false).unwrap();
        assert!(matches!(
            inst,
            Inst::FMadd { op: FMaddOp::Madd, rd: 1, rs1: 2, rs2: 3, rs3: 4 }
        ));
    }

    #[test]
    fn decodes_fcvt_w_s_and_fmv_x_w() {
        let w: u32 = (0x60 << 25) | (0 << 20) | (5 << 15) | (0 << 12) | (6 << 7) | 0x53;
        let (inst, _) = decode(w, false).unwrap();
        assert!(matches!(inst, Inst::FCvt { op: FCvtOp::WS, rd: 6, rs1: 5 }));

        let w: u32 = (0x70 << 25) | (0 << 20) | (5 << 15) | (0 << 12) | (6 << 7) | 0x53;
        let (inst, _) = decode(w, false).unwrap();
        assert!(matches!(inst, Inst::FMvXW { rd: 6, rs1: 5 }));
    }
}
