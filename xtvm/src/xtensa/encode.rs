//! Instruction encoders. One function per instruction shape; every function
//! returns the 24-bit instruction in the low bits of a `u32`, little-endian
//! byte order when emitted.

use super::{FReg, Reg};

/// An operand that does not fit the field the instruction provides.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodeError {
    pub what: &'static str,
    pub value: i64,
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} is not encodable", self.what, self.value)
    }
}

impl std::error::Error for EncodeError {}

type Encoded = Result<u32, EncodeError>;

fn out_of_range(what: &'static str, value: i64) -> EncodeError {
    EncodeError { what, value }
}

fn rrr(op2: u32, op1: u32, r: u32, s: u32, t: u32) -> u32 {
    (op2 << 20) | (op1 << 16) | (r << 12) | (s << 8) | (t << 4)
}

fn rri8(r: u32, s: u32, t: u32, imm8: u32, op0: u32) -> u32 {
    ((imm8 & 0xFF) << 16) | (r << 12) | (s << 8) | (t << 4) | op0
}

fn reg(r: Reg) -> u32 {
    r.index() as u32
}

fn freg(r: FReg) -> u32 {
    r.index() as u32
}

// ALU, RRR format with op0 = 0, op1 = 0.

pub fn and(ar: Reg, as_: Reg, at: Reg) -> u32 {
    rrr(0x1, 0, reg(ar), reg(as_), reg(at))
}

pub fn or(ar: Reg, as_: Reg, at: Reg) -> u32 {
    rrr(0x2, 0, reg(ar), reg(as_), reg(at))
}

pub fn xor(ar: Reg, as_: Reg, at: Reg) -> u32 {
    rrr(0x3, 0, reg(ar), reg(as_), reg(at))
}

/// `MOV` is the `OR ar, as, as` alias.
pub fn mov(ar: Reg, as_: Reg) -> u32 {
    or(ar, as_, as_)
}

pub fn neg(ar: Reg, at: Reg) -> u32 {
    rrr(0x6, 0, reg(ar), 0, reg(at))
}

pub fn add(ar: Reg, as_: Reg, at: Reg) -> u32 {
    rrr(0x8, 0, reg(ar), reg(as_), reg(at))
}

pub fn addx2(ar: Reg, as_: Reg, at: Reg) -> u32 {
    rrr(0x9, 0, reg(ar), reg(as_), reg(at))
}

pub fn addx4(ar: Reg, as_: Reg, at: Reg) -> u32 {
    rrr(0xA, 0, reg(ar), reg(as_), reg(at))
}

pub fn addx8(ar: Reg, as_: Reg, at: Reg) -> u32 {
    rrr(0xB, 0, reg(ar), reg(as_), reg(at))
}

pub fn sub(ar: Reg, as_: Reg, at: Reg) -> u32 {
    rrr(0xC, 0, reg(ar), reg(as_), reg(at))
}

// Shift amount register setup.

pub fn ssr(as_: Reg) -> u32 {
    rrr(0x4, 0, 0, reg(as_), 0)
}

pub fn ssl(as_: Reg) -> u32 {
    rrr(0x4, 0, 1, reg(as_), 0)
}

pub fn ssai(sa: u32) -> Encoded {
    if sa > 31 {
        return Err(out_of_range("ssai shift", sa as i64));
    }
    Ok(rrr(0x4, 0, 4, sa & 0xF, sa >> 4))
}

// Shifts, op1 = 1.

pub fn slli(ar: Reg, as_: Reg, sa: u32) -> Encoded {
    if !(1..=31).contains(&sa) {
        return Err(out_of_range("slli shift", sa as i64));
    }
    let enc = 32 - sa;
    Ok(rrr(enc >> 4, 1, reg(ar), reg(as_), enc & 0xF))
}

pub fn srai(ar: Reg, at: Reg, sa: u32) -> Encoded {
    if sa > 31 {
        return Err(out_of_range("srai shift", sa as i64));
    }
    Ok(rrr(0x2 | (sa >> 4), 1, reg(ar), sa & 0xF, reg(at)))
}

pub fn srli(ar: Reg, at: Reg, sa: u32) -> Encoded {
    if sa > 15 {
        return Err(out_of_range("srli shift", sa as i64));
    }
    Ok(rrr(0x4, 1, reg(ar), sa, reg(at)))
}

pub fn src(ar: Reg, as_: Reg, at: Reg) -> u32 {
    rrr(0x8, 1, reg(ar), reg(as_), reg(at))
}

pub fn srl(ar: Reg, at: Reg) -> u32 {
    rrr(0x9, 1, reg(ar), 0, reg(at))
}

pub fn sll(ar: Reg, as_: Reg) -> u32 {
    rrr(0xA, 1, reg(ar), reg(as_), 0)
}

pub fn sra(ar: Reg, at: Reg) -> u32 {
    rrr(0xB, 1, reg(ar), 0, reg(at))
}

/// `EXTUI ar, at, shift, bits`: `ar = (at >> shift) & ((1 << bits) - 1)`.
pub fn extui(ar: Reg, at: Reg, shift: u32, bits: u32) -> Encoded {
    if shift > 31 {
        return Err(out_of_range("extui shift", shift as i64));
    }
    if !(1..=16).contains(&bits) {
        return Err(out_of_range("extui width", bits as i64));
    }
    Ok(rrr(bits - 1, 0x4 | (shift >> 4), reg(ar), shift & 0xF, reg(at)))
}

// Multiply and divide, op1 = 2.

pub fn mull(ar: Reg, as_: Reg, at: Reg) -> u32 {
    rrr(0x8, 2, reg(ar), reg(as_), reg(at))
}

pub fn muluh(ar: Reg, as_: Reg, at: Reg) -> u32 {
    rrr(0xA, 2, reg(ar), reg(as_), reg(at))
}

pub fn mulsh(ar: Reg, as_: Reg, at: Reg) -> u32 {
    rrr(0xB, 2, reg(ar), reg(as_), reg(at))
}

pub fn quou(ar: Reg, as_: Reg, at: Reg) -> u32 {
    rrr(0xC, 2, reg(ar), reg(as_), reg(at))
}

pub fn quos(ar: Reg, as_: Reg, at: Reg) -> u32 {
    rrr(0xD, 2, reg(ar), reg(as_), reg(at))
}

pub fn remu(ar: Reg, as_: Reg, at: Reg) -> u32 {
    rrr(0xE, 2, reg(ar), reg(as_), reg(at))
}

pub fn rems(ar: Reg, as_: Reg, at: Reg) -> u32 {
    rrr(0xF, 2, reg(ar), reg(as_), reg(at))
}

// Conditional moves, op1 = 3.

pub fn moveqz(ar: Reg, as_: Reg, at: Reg) -> u32 {
    rrr(0x8, 3, reg(ar), reg(as_), reg(at))
}

pub fn movnez(ar: Reg, as_: Reg, at: Reg) -> u32 {
    rrr(0x9, 3, reg(ar), reg(as_), reg(at))
}

// FPU, op1 = 0xA.

pub fn add_s(fr: FReg, fs: FReg, ft: FReg) -> u32 {
    rrr(0x0, 0xA, freg(fr), freg(fs), freg(ft))
}

pub fn sub_s(fr: FReg, fs: FReg, ft: FReg) -> u32 {
    rrr(0x1, 0xA, freg(fr), freg(fs), freg(ft))
}

pub fn mul_s(fr: FReg, fs: FReg, ft: FReg) -> u32 {
    rrr(0x2, 0xA, freg(fr), freg(fs), freg(ft))
}

pub fn rfr(ar: Reg, fs: FReg) -> u32 {
    rrr(0xF, 0xA, reg(ar), freg(fs), 0x4)
}

pub fn wfr(fr: FReg, as_: Reg) -> u32 {
    rrr(0xF, 0xA, freg(fr), reg(as_), 0x5)
}

// Specials.

pub fn ill() -> u32 {
    0
}

pub fn nop() -> u32 {
    0x0020F0
}

pub fn ret() -> u32 {
    0x000080
}

pub fn retw() -> u32 {
    0x000090
}

pub fn jx(as_: Reg) -> u32 {
    (reg(as_) << 8) | 0xA0
}

pub fn callx0(as_: Reg) -> u32 {
    (reg(as_) << 8) | 0xC0
}

pub fn callx8(as_: Reg) -> u32 {
    (reg(as_) << 8) | 0xE0
}

// Loads, stores and immediates, op0 = 2.

fn scaled(what: &'static str, offset: u32, scale: u32) -> Result<u32, EncodeError> {
    if offset % scale != 0 || offset / scale > 0xFF {
        return Err(out_of_range(what, offset as i64));
    }
    Ok(offset / scale)
}

pub fn l8ui(at: Reg, as_: Reg, offset: u32) -> Encoded {
    let imm = scaled("l8ui offset", offset, 1)?;
    Ok(rri8(0x0, reg(as_), reg(at), imm, 2))
}

pub fn l16ui(at: Reg, as_: Reg, offset: u32) -> Encoded {
    let imm = scaled("l16ui offset", offset, 2)?;
    Ok(rri8(0x1, reg(as_), reg(at), imm, 2))
}

pub fn l16si(at: Reg, as_: Reg, offset: u32) -> Encoded {
    let imm = scaled("l16si offset", offset, 2)?;
    Ok(rri8(0x9, reg(as_), reg(at), imm, 2))
}

pub fn l32i(at: Reg, as_: Reg, offset: u32) -> Encoded {
    let imm = scaled("l32i offset", offset, 4)?;
    Ok(rri8(0x2, reg(as_), reg(at), imm, 2))
}

pub fn s8i(at: Reg, as_: Reg, offset: u32) -> Encoded {
    let imm = scaled("s8i offset", offset, 1)?;
    Ok(rri8(0x4, reg(as_), reg(at), imm, 2))
}

pub fn s16i(at: Reg, as_: Reg, offset: u32) -> Encoded {
    let imm = scaled("s16i offset", offset, 2)?;
    Ok(rri8(0x5, reg(as_), reg(at), imm, 2))
}

pub fn s32i(at: Reg, as_: Reg, offset: u32) -> Encoded {
    let imm = scaled("s32i offset", offset, 4)?;
    Ok(rri8(0x6, reg(as_), reg(at), imm, 2))
}

pub fn movi(at: Reg, imm: i32) -> Encoded {
    if !(-2048..=2047).contains(&imm) {
        return Err(out_of_range("movi immediate", imm as i64));
    }
    let imm = imm as u32 & 0xFFF;
    Ok(rri8(0xA, imm >> 8, reg(at), imm & 0xFF, 2))
}

pub fn addi(at: Reg, as_: Reg, imm: i32) -> Encoded {
    if !(-128..=127).contains(&imm) {
        return Err(out_of_range("addi immediate", imm as i64));
    }
    Ok(rri8(0xC, reg(as_), reg(at), imm as u32, 2))
}

/// `ADDMI at, as, imm` adds a multiple of 256 in `-32768..=32512`.
pub fn addmi(at: Reg, as_: Reg, imm: i32) -> Encoded {
    if imm % 256 != 0 || !(-32768..=32512).contains(&imm) {
        return Err(out_of_range("addmi immediate", imm as i64));
    }
    Ok(rri8(0xD, reg(as_), reg(at), (imm >> 8) as u32, 2))
}

/// `L32R at, disp` where `disp` is the byte displacement from
/// `(pc + 3) & !3` to the literal. Only backward displacements exist.
pub fn l32r(at: Reg, disp: i32) -> Encoded {
    if disp % 4 != 0 || !(-262_144..=-4).contains(&disp) {
        return Err(out_of_range("l32r displacement", disp as i64));
    }
    let imm16 = ((disp >> 2) as u32) & 0xFFFF;
    Ok((imm16 << 8) | (reg(at) << 4) | 0x1)
}

/// `CALL8` with `disp` measured from `(pc & !3) + 4`.
pub fn call8(disp: i32) -> Encoded {
    if disp % 4 != 0 || !(-(1 << 19)..(1 << 19)).contains(&disp) {
        return Err(out_of_range("call8 displacement", disp as i64));
    }
    let off = ((disp >> 2) as u32) & 0x3FFFF;
    Ok((off << 6) | (0x2 << 4) | 0x5)
}

/// `J` with `disp = target - (pc + 4)`.
pub fn j(disp: i32) -> Encoded {
    if !(-(1 << 17)..(1 << 17)).contains(&disp) {
        return Err(out_of_range("j displacement", disp as i64));
    }
    Ok(((disp as u32 & 0x3FFFF) << 6) | 0x6)
}

fn bz(m: u32, as_: Reg, disp: i32) -> Encoded {
    if !(-2048..=2047).contains(&disp) {
        return Err(out_of_range("bz displacement", disp as i64));
    }
    Ok(((disp as u32 & 0xFFF) << 12) | (reg(as_) << 8) | (m << 6) | (0x1 << 4) | 0x6)
}

pub fn beqz(as_: Reg, disp: i32) -> Encoded {
    bz(0, as_, disp)
}

pub fn bnez(as_: Reg, disp: i32) -> Encoded {
    bz(1, as_, disp)
}

pub fn bltz(as_: Reg, disp: i32) -> Encoded {
    bz(2, as_, disp)
}

pub fn bgez(as_: Reg, disp: i32) -> Encoded {
    bz(3, as_, disp)
}

/// `ENTRY as, frame`: the frame size is a multiple of 8 below 32 KiB.
pub fn entry(as_: Reg, frame: u32) -> Encoded {
    if frame % 8 != 0 || frame / 8 > 0xFFF {
        return Err(out_of_range("entry frame", frame as i64));
    }
    Ok(((frame / 8) << 12) | (reg(as_) << 8) | (0x3 << 4) | 0x6)
}

/// Two-register compare-and-branch condition, the `r` field of op0 = 7.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BranchCond {
    Eq,
    Lt,
    Ltu,
    Ne,
    Ge,
    Geu,
}

impl BranchCond {
    pub fn field(self) -> u32 {
        match self {
            BranchCond::Eq => 0x1,
            BranchCond::Lt => 0x2,
            BranchCond::Ltu => 0x3,
            BranchCond::Ne => 0x9,
            BranchCond::Ge => 0xA,
            BranchCond::Geu => 0xB,
        }
    }

    pub fn from_field(field: u32) -> Option<Self> {
        match field {
            0x1 => Some(BranchCond::Eq),
            0x2 => Some(BranchCond::Lt),
            0x3 => Some(BranchCond::Ltu),
            0x9 => Some(BranchCond::Ne),
            0xA => Some(BranchCond::Ge),
            0xB => Some(BranchCond::Geu),
            _ => None,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            BranchCond::Eq => "beq",
            BranchCond::Lt => "blt",
            BranchCond::Ltu => "bltu",
            BranchCond::Ne => "bne",
            BranchCond::Ge => "bge",
            BranchCond::Geu => "bgeu",
        }
    }

    pub fn holds(self, a: u32, b: u32) -> bool {
        match self {
            BranchCond::Eq => a == b,
            BranchCond::Lt => (a as i32) < (b as i32),
            BranchCond::Ltu => a < b,
            BranchCond::Ne => a != b,
            BranchCond::Ge => (a as i32) >= (b as i32),
            BranchCond::Geu => a >= b,
        }
    }
}

/// `B<cond> as, at, disp` with `disp = target - (pc + 4)`.
pub fn branch(cond: BranchCond, as_: Reg, at: Reg, disp: i32) -> Encoded {
    if !(-128..=127).contains(&disp) {
        return Err(out_of_range("branch displacement", disp as i64));
    }
    Ok(rri8(cond.field(), reg(as_), reg(at), disp as u32, 7))
}

/// Splits an instruction into the three bytes that land in memory.
pub fn bytes(insn: u32) -> [u8; 3] {
    let [b0, b1, b2, _] = insn.to_le_bytes();
    [b0, b1, b2]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xtensa::{A1, A2, A3, A4, A5, A9, A10};

    #[test]
    fn encodings_match_the_reference_bit_patterns() {
        assert_eq!(add(A2, A3, A4), 0x802340);
        assert_eq!(sub(A2, A3, A4), 0xC02340);
        assert_eq!(mov(A10, A2), 0x20A220);
        assert_eq!(retw(), 0x000090);
        assert_eq!(callx8(A9), 0x0009E0);
        assert_eq!(nop(), 0x0020F0);
        assert_eq!(l32i(A2, A3, 8), Ok(0x022322));
        assert_eq!(s32i(A4, A1, 0), Ok(0x006142));
        assert_eq!(movi(A2, -1), Ok(0xFFAF22));
        assert_eq!(entry(A1, 32), Ok(0x004136));
        assert_eq!(j(-4), Ok(0xFFFF06));
        assert_eq!(l32r(A5, -4), Ok(0xFFFF51));
        assert_eq!(beqz(A4, 2), Ok(0x002416));
        assert_eq!(branch(BranchCond::Ne, A4, A5, 2), Ok(0x029457));
    }

    #[test]
    fn shift_immediates_use_the_split_fields() {
        // slli encodes 32 - sa across op2[0] and t.
        assert_eq!(slli(A2, A3, 24), Ok(rrr(0, 1, 2, 3, 8)));
        assert_eq!(slli(A2, A3, 1), Ok(rrr(1, 1, 2, 3, 0xF)));
        assert_eq!(srai(A2, A3, 31), Ok(rrr(3, 1, 2, 0xF, 3)));
        assert_eq!(extui(A2, A3, 0, 8), Ok(rrr(7, 4, 2, 0, 3)));
    }

    #[test]
    fn out_of_range_operands_are_rejected() {
        assert!(movi(A2, 2048).is_err());
        assert!(addi(A2, A2, 128).is_err());
        assert!(addmi(A2, A2, 100).is_err());
        assert!(l32i(A2, A3, 1024).is_err());
        assert!(l32i(A2, A3, 2).is_err());
        assert!(l32r(A2, 0).is_err());
        assert!(j(1 << 17).is_err());
        assert!(branch(BranchCond::Eq, A2, A3, 128).is_err());
        assert!(entry(A1, 12).is_err());
        assert!(slli(A2, A2, 0).is_err());
    }
}
