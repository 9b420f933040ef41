use super::encode::BranchCond;
use super::{FReg, Reg};

/// A decoded instruction of the subset the compiler emits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Insn {
    Ill,
    Nop,
    Ret,
    Retw,
    Jx { s: Reg },
    Callx0 { s: Reg },
    Callx8 { s: Reg },
    Alu { op: AluOp, r: Reg, s: Reg, t: Reg },
    Neg { r: Reg, t: Reg },
    Ssr { s: Reg },
    Ssl { s: Reg },
    Ssai { sa: u32 },
    Slli { r: Reg, s: Reg, sa: u32 },
    Srai { r: Reg, t: Reg, sa: u32 },
    Srli { r: Reg, t: Reg, sa: u32 },
    Src { r: Reg, s: Reg, t: Reg },
    Srl { r: Reg, t: Reg },
    Sll { r: Reg, s: Reg },
    Sra { r: Reg, t: Reg },
    Extui { r: Reg, t: Reg, shift: u32, bits: u32 },
    CondMove { eqz: bool, r: Reg, s: Reg, t: Reg },
    Fpu { op: FpuOp, r: FReg, s: FReg, t: FReg },
    Rfr { r: Reg, s: FReg },
    Wfr { r: FReg, s: Reg },
    L32r { t: Reg, disp: i32 },
    Load { width: u8, signed: bool, t: Reg, s: Reg, offset: u32 },
    Store { width: u8, t: Reg, s: Reg, offset: u32 },
    Movi { t: Reg, imm: i32 },
    Addi { t: Reg, s: Reg, imm: i32 },
    Addmi { t: Reg, s: Reg, imm: i32 },
    Call8 { disp: i32 },
    J { disp: i32 },
    BranchZ { cond: ZeroCond, s: Reg, disp: i32 },
    Entry { s: Reg, frame: u32 },
    Branch { cond: BranchCond, s: Reg, t: Reg, disp: i32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AluOp {
    And,
    Or,
    Xor,
    Add,
    Addx2,
    Addx4,
    Addx8,
    Sub,
    Mull,
    Muluh,
    Mulsh,
    Quou,
    Quos,
    Remu,
    Rems,
}

impl AluOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            AluOp::And => "and",
            AluOp::Or => "or",
            AluOp::Xor => "xor",
            AluOp::Add => "add",
            AluOp::Addx2 => "addx2",
            AluOp::Addx4 => "addx4",
            AluOp::Addx8 => "addx8",
            AluOp::Sub => "sub",
            AluOp::Mull => "mull",
            AluOp::Muluh => "muluh",
            AluOp::Mulsh => "mulsh",
            AluOp::Quou => "quou",
            AluOp::Quos => "quos",
            AluOp::Remu => "remu",
            AluOp::Rems => "rems",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FpuOp {
    Add,
    Sub,
    Mul,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZeroCond {
    Eqz,
    Nez,
    Ltz,
    Gez,
}

impl ZeroCond {
    pub fn holds(self, value: u32) -> bool {
        match self {
            ZeroCond::Eqz => value == 0,
            ZeroCond::Nez => value != 0,
            ZeroCond::Ltz => (value as i32) < 0,
            ZeroCond::Gez => (value as i32) >= 0,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            ZeroCond::Eqz => "beqz",
            ZeroCond::Nez => "bnez",
            ZeroCond::Ltz => "bltz",
            ZeroCond::Gez => "bgez",
        }
    }
}

fn sext(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

fn a(field: u32) -> Reg {
    // Fields are four bits wide, so this never fails.
    Reg::from_index((field & 0xF) as u8).unwrap_or(super::A0)
}

fn f(field: u32) -> FReg {
    FReg::from_index((field & 0xF) as u8).unwrap_or(super::F0)
}

/// Decodes the low 24 bits of `word`. Returns `None` for encodings outside the
/// supported subset.
pub fn decode_insn(word: u32) -> Option<Insn> {
    let op0 = word & 0xF;
    let t = (word >> 4) & 0xF;
    let s = (word >> 8) & 0xF;
    let r = (word >> 12) & 0xF;
    let op1 = (word >> 16) & 0xF;
    let op2 = (word >> 20) & 0xF;
    let imm8 = (word >> 16) & 0xFF;

    let insn = match op0 {
        0x0 => match op1 {
            0x0 => match op2 {
                0x0 => match (r, t) {
                    (0, 0) if s == 0 => Insn::Ill,
                    (0, 0x8) if s == 0 => Insn::Ret,
                    (0, 0x9) if s == 0 => Insn::Retw,
                    (0, 0xA) => Insn::Jx { s: a(s) },
                    (0, 0xC) => Insn::Callx0 { s: a(s) },
                    (0, 0xE) => Insn::Callx8 { s: a(s) },
                    (2, 0xF) if s == 0 => Insn::Nop,
                    _ => return None,
                },
                0x1 => Insn::Alu {
                    op: AluOp::And,
                    r: a(r),
                    s: a(s),
                    t: a(t),
                },
                0x2 => Insn::Alu {
                    op: AluOp::Or,
                    r: a(r),
                    s: a(s),
                    t: a(t),
                },
                0x3 => Insn::Alu {
                    op: AluOp::Xor,
                    r: a(r),
                    s: a(s),
                    t: a(t),
                },
                0x4 => match r {
                    0 if t == 0 => Insn::Ssr { s: a(s) },
                    1 if t == 0 => Insn::Ssl { s: a(s) },
                    4 if t <= 1 => Insn::Ssai { sa: s | (t << 4) },
                    _ => return None,
                },
                0x6 if s == 0 => Insn::Neg { r: a(r), t: a(t) },
                0x8..=0xC => {
                    let op = match op2 {
                        0x8 => AluOp::Add,
                        0x9 => AluOp::Addx2,
                        0xA => AluOp::Addx4,
                        0xB => AluOp::Addx8,
                        _ => AluOp::Sub,
                    };
                    Insn::Alu {
                        op,
                        r: a(r),
                        s: a(s),
                        t: a(t),
                    }
                }
                _ => return None,
            },
            0x1 => match op2 {
                0x0 | 0x1 => Insn::Slli {
                    r: a(r),
                    s: a(s),
                    sa: 32 - (((op2 & 1) << 4) | t),
                },
                0x2 | 0x3 => Insn::Srai {
                    r: a(r),
                    t: a(t),
                    sa: ((op2 & 1) << 4) | s,
                },
                0x4 => Insn::Srli {
                    r: a(r),
                    t: a(t),
                    sa: s,
                },
                0x8 => Insn::Src {
                    r: a(r),
                    s: a(s),
                    t: a(t),
                },
                0x9 if s == 0 => Insn::Srl { r: a(r), t: a(t) },
                0xA if t == 0 => Insn::Sll { r: a(r), s: a(s) },
                0xB if s == 0 => Insn::Sra { r: a(r), t: a(t) },
                _ => return None,
            },
            0x2 => {
                let op = match op2 {
                    0x8 => AluOp::Mull,
                    0xA => AluOp::Muluh,
                    0xB => AluOp::Mulsh,
                    0xC => AluOp::Quou,
                    0xD => AluOp::Quos,
                    0xE => AluOp::Remu,
                    0xF => AluOp::Rems,
                    _ => return None,
                };
                Insn::Alu {
                    op,
                    r: a(r),
                    s: a(s),
                    t: a(t),
                }
            }
            0x3 => match op2 {
                0x8 | 0x9 => Insn::CondMove {
                    eqz: op2 == 0x8,
                    r: a(r),
                    s: a(s),
                    t: a(t),
                },
                _ => return None,
            },
            0x4 | 0x5 => Insn::Extui {
                r: a(r),
                t: a(t),
                shift: ((op1 & 1) << 4) | s,
                bits: op2 + 1,
            },
            0xA => match op2 {
                0x0..=0x2 => {
                    let op = match op2 {
                        0x0 => FpuOp::Add,
                        0x1 => FpuOp::Sub,
                        _ => FpuOp::Mul,
                    };
                    Insn::Fpu {
                        op,
                        r: f(r),
                        s: f(s),
                        t: f(t),
                    }
                }
                0xF => match t {
                    0x4 => Insn::Rfr { r: a(r), s: f(s) },
                    0x5 => Insn::Wfr { r: f(r), s: a(s) },
                    _ => return None,
                },
                _ => return None,
            },
            _ => return None,
        },
        0x1 => {
            let imm16 = (word >> 8) & 0xFFFF;
            Insn::L32r {
                t: a(t),
                disp: ((0xFFFF_0000 | imm16) << 2) as i32,
            }
        }
        0x2 => match r {
            0x0 => Insn::Load {
                width: 1,
                signed: false,
                t: a(t),
                s: a(s),
                offset: imm8,
            },
            0x1 => Insn::Load {
                width: 2,
                signed: false,
                t: a(t),
                s: a(s),
                offset: imm8 * 2,
            },
            0x2 => Insn::Load {
                width: 4,
                signed: false,
                t: a(t),
                s: a(s),
                offset: imm8 * 4,
            },
            0x4 => Insn::Store {
                width: 1,
                t: a(t),
                s: a(s),
                offset: imm8,
            },
            0x5 => Insn::Store {
                width: 2,
                t: a(t),
                s: a(s),
                offset: imm8 * 2,
            },
            0x6 => Insn::Store {
                width: 4,
                t: a(t),
                s: a(s),
                offset: imm8 * 4,
            },
            0x9 => Insn::Load {
                width: 2,
                signed: true,
                t: a(t),
                s: a(s),
                offset: imm8 * 2,
            },
            0xA => Insn::Movi {
                t: a(t),
                imm: sext((s << 8) | imm8, 12),
            },
            0xC => Insn::Addi {
                t: a(t),
                s: a(s),
                imm: sext(imm8, 8),
            },
            0xD => Insn::Addmi {
                t: a(t),
                s: a(s),
                imm: sext(imm8, 8) << 8,
            },
            _ => return None,
        },
        0x5 => {
            let n = (word >> 4) & 0x3;
            if n != 2 {
                return None;
            }
            Insn::Call8 {
                disp: sext((word >> 6) & 0x3FFFF, 18) << 2,
            }
        }
        0x6 => {
            let n = (word >> 4) & 0x3;
            let m = (word >> 6) & 0x3;
            match n {
                0 => Insn::J {
                    disp: sext((word >> 6) & 0x3FFFF, 18),
                },
                1 => {
                    let cond = match m {
                        0 => ZeroCond::Eqz,
                        1 => ZeroCond::Nez,
                        2 => ZeroCond::Ltz,
                        _ => ZeroCond::Gez,
                    };
                    Insn::BranchZ {
                        cond,
                        s: a(s),
                        disp: sext((word >> 12) & 0xFFF, 12),
                    }
                }
                3 if m == 0 => Insn::Entry {
                    s: a(s),
                    frame: ((word >> 12) & 0xFFF) * 8,
                },
                _ => return None,
            }
        }
        0x7 => Insn::Branch {
            cond: BranchCond::from_field(r)?,
            s: a(s),
            t: a(t),
            disp: sext(imm8, 8),
        },
        _ => return None,
    };
    Some(insn)
}
