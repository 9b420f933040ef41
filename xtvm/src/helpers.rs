//! Runtime helpers: the routines compiled code calls instead of inlining.
//!
//! Each helper has a stub address `HELPER_BASE + 4 * id`. Arguments arrive
//! as six words in the order of the calling convention's argument
//! registers; word 0 is always the instance header address. Results come
//! back as a `(lo, hi)` word pair. The interpreter calls the same routines
//! so both tiers agree bit for bit.
//!
//! | helper        | words 1..                              | result        |
//! |---------------|----------------------------------------|---------------|
//! | Arith64       | op, a.lo, a.hi, b.lo, b.hi             | (lo, hi)      |
//! | Cmp64         | cond, a.lo, a.hi, b.lo, b.hi           | 0 / 1         |
//! | ArithF32      | op, a, b                               | bits          |
//! | ArithF64      | op, a.lo, a.hi, b.lo, b.hi             | (lo, hi)      |
//! | CmpF32        | cond, a, b                             | 0 / 1         |
//! | CmpF64        | cond, a.lo, a.hi, b.lo, b.hi           | 0 / 1         |
//! | Convert       | conv, lo, hi                           | (lo, hi)      |
//! | GlobalGet     | index                                  | (lo, hi)      |
//! | GlobalSet     | index, lo, hi                          | -             |
//! | GlobalAddr    | index                                  | address       |
//! | MemCopy       | dst, src, len                          | -             |
//! | MemSet        | dst, byte, len                         | -             |
//! | TableGet      | index                                  | function ptr  |
//! | TableSet      | index, function ptr                    | -             |
//! | Alloca        | size                                   | address       |
//! | HeapAlloc     | size                                   | address or 0  |
//! | HeapFree      | address                                | -             |
//! | AtomicAdd     | address, value                         | old value     |
//! | AtomicCas     | address, expected, new                 | old value     |
//! | CallFunction  | func, register file                    | -             |
//! | CallIndirect  | function ptr, register file, caller, base | -          |
//! | FuncAddr      | func                                   | function ptr  |
//! | CallVariadic  | import, tags, count, register file     | -             |
//! | MakeClosure   | function ptr                           | trampoline    |

use crate::bytecode::{Bin32, Bin64, Cond, Conv, FloatCond, FloatOp};
use crate::error::{VmError, VmResult};
use crate::instance::Instance;
use crate::xtensa::HELPER_BASE;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Helper {
    Arith64 = 0,
    Cmp64 = 1,
    ArithF32 = 2,
    ArithF64 = 3,
    CmpF32 = 4,
    CmpF64 = 5,
    Convert = 6,
    GlobalGet = 7,
    GlobalSet = 8,
    GlobalAddr = 9,
    MemCopy = 10,
    MemSet = 11,
    TableGet = 12,
    TableSet = 13,
    Alloca = 14,
    HeapAlloc = 15,
    HeapFree = 16,
    AtomicAdd = 17,
    AtomicCas = 18,
    CallFunction = 19,
    CallIndirect = 20,
    FuncAddr = 21,
    CallVariadic = 22,
    MakeClosure = 23,
}

impl Helper {
    pub const ALL: [Helper; 24] = [
        Helper::Arith64,
        Helper::Cmp64,
        Helper::ArithF32,
        Helper::ArithF64,
        Helper::CmpF32,
        Helper::CmpF64,
        Helper::Convert,
        Helper::GlobalGet,
        Helper::GlobalSet,
        Helper::GlobalAddr,
        Helper::MemCopy,
        Helper::MemSet,
        Helper::TableGet,
        Helper::TableSet,
        Helper::Alloca,
        Helper::HeapAlloc,
        Helper::HeapFree,
        Helper::AtomicAdd,
        Helper::AtomicCas,
        Helper::CallFunction,
        Helper::CallIndirect,
        Helper::FuncAddr,
        Helper::CallVariadic,
        Helper::MakeClosure,
    ];

    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }

    pub fn address(self) -> u32 {
        HELPER_BASE + 4 * self as u32
    }

    pub fn from_address(address: u32) -> Option<Self> {
        let offset = address.checked_sub(HELPER_BASE)?;
        if offset % 4 != 0 {
            return None;
        }
        Self::from_id(offset / 4)
    }

    pub fn name(self) -> &'static str {
        match self {
            Helper::Arith64 => "arith64",
            Helper::Cmp64 => "cmp64",
            Helper::ArithF32 => "arith_f32",
            Helper::ArithF64 => "arith_f64",
            Helper::CmpF32 => "cmp_f32",
            Helper::CmpF64 => "cmp_f64",
            Helper::Convert => "convert",
            Helper::GlobalGet => "global_get",
            Helper::GlobalSet => "global_set",
            Helper::GlobalAddr => "global_addr",
            Helper::MemCopy => "memcpy",
            Helper::MemSet => "memset",
            Helper::TableGet => "table_get",
            Helper::TableSet => "table_set",
            Helper::Alloca => "alloca",
            Helper::HeapAlloc => "heap_alloc",
            Helper::HeapFree => "heap_free",
            Helper::AtomicAdd => "atomic_add",
            Helper::AtomicCas => "atomic_cas",
            Helper::CallFunction => "call_function",
            Helper::CallIndirect => "call_indirect",
            Helper::FuncAddr => "func_addr",
            Helper::CallVariadic => "call_variadic",
            Helper::MakeClosure => "make_closure",
        }
    }
}

pub fn bin64_code(op: Bin64) -> u32 {
    match op {
        Bin64::Add => 0,
        Bin64::Sub => 1,
        Bin64::Mul => 2,
        Bin64::And => 3,
        Bin64::Or => 4,
        Bin64::Xor => 5,
        Bin64::Shl => 6,
        Bin64::ShrS => 7,
        Bin64::ShrU => 8,
        Bin64::DivS => 9,
        Bin64::DivU => 10,
        Bin64::RemS => 11,
        Bin64::RemU => 12,
    }
}

fn bin64_from_code(code: u32) -> Option<Bin64> {
    let op = match code {
        0 => Bin64::Add,
        1 => Bin64::Sub,
        2 => Bin64::Mul,
        3 => Bin64::And,
        4 => Bin64::Or,
        5 => Bin64::Xor,
        6 => Bin64::Shl,
        7 => Bin64::ShrS,
        8 => Bin64::ShrU,
        9 => Bin64::DivS,
        10 => Bin64::DivU,
        11 => Bin64::RemS,
        12 => Bin64::RemU,
        _ => return None,
    };
    Some(op)
}

pub fn float_op_code(op: FloatOp) -> u32 {
    match op {
        FloatOp::Add => 0,
        FloatOp::Sub => 1,
        FloatOp::Mul => 2,
        FloatOp::Div => 3,
    }
}

fn float_op_from_code(code: u32) -> Option<FloatOp> {
    match code {
        0 => Some(FloatOp::Add),
        1 => Some(FloatOp::Sub),
        2 => Some(FloatOp::Mul),
        3 => Some(FloatOp::Div),
        _ => None,
    }
}

/// 64-bit integer arithmetic. Division and remainder by zero give 0,
/// overflow wraps, shift counts are taken modulo 64.
pub fn arith64(op: Bin64, a: u64, b: u64) -> u64 {
    let (sa, sb) = (a as i64, b as i64);
    match op {
        Bin64::Add => a.wrapping_add(b),
        Bin64::Sub => a.wrapping_sub(b),
        Bin64::Mul => a.wrapping_mul(b),
        Bin64::And => a & b,
        Bin64::Or => a | b,
        Bin64::Xor => a ^ b,
        Bin64::Shl => a.wrapping_shl((b & 63) as u32),
        Bin64::ShrS => sa.wrapping_shr((b & 63) as u32) as u64,
        Bin64::ShrU => a.wrapping_shr((b & 63) as u32),
        Bin64::DivS | Bin64::DivU | Bin64::RemS | Bin64::RemU if b == 0 => 0,
        Bin64::DivS => sa.wrapping_div(sb) as u64,
        Bin64::DivU => a / b,
        Bin64::RemS => sa.wrapping_rem(sb) as u64,
        Bin64::RemU => a % b,
    }
}

/// 32-bit counterpart of [`arith64`], shift counts modulo 32.
pub fn arith32(op: Bin32, a: u32, b: u32) -> u32 {
    let (sa, sb) = (a as i32, b as i32);
    match op {
        Bin32::Add => a.wrapping_add(b),
        Bin32::Sub => a.wrapping_sub(b),
        Bin32::Mul => a.wrapping_mul(b),
        Bin32::And => a & b,
        Bin32::Or => a | b,
        Bin32::Xor => a ^ b,
        Bin32::Shl => a.wrapping_shl(b & 31),
        Bin32::ShrS => sa.wrapping_shr(b & 31) as u32,
        Bin32::ShrU => a.wrapping_shr(b & 31),
        Bin32::DivS | Bin32::DivU | Bin32::RemS | Bin32::RemU if b == 0 => 0,
        Bin32::DivS => sa.wrapping_div(sb) as u32,
        Bin32::DivU => a / b,
        Bin32::RemS => sa.wrapping_rem(sb) as u32,
        Bin32::RemU => a % b,
    }
}

pub fn arith_f32(op: FloatOp, a: f32, b: f32) -> f32 {
    match op {
        FloatOp::Add => a + b,
        FloatOp::Sub => a - b,
        FloatOp::Mul => a * b,
        FloatOp::Div => a / b,
    }
}

pub fn arith_f64(op: FloatOp, a: f64, b: f64) -> f64 {
    match op {
        FloatOp::Add => a + b,
        FloatOp::Sub => a - b,
        FloatOp::Mul => a * b,
        FloatOp::Div => a / b,
    }
}

pub fn cmp_float<T: PartialOrd>(cond: FloatCond, a: T, b: T) -> bool {
    match cond {
        FloatCond::Eq => a == b,
        FloatCond::Lt => a < b,
        FloatCond::Le => a <= b,
    }
}

/// Applies `conv` to the slot bits `value`. Narrow results leave the high
/// word zero; float to integer conversions saturate and map NaN to 0.
pub fn convert(conv: Conv, value: u64) -> u64 {
    let lo = value as u32;
    match conv {
        Conv::ExtendI32S => lo as i32 as i64 as u64,
        Conv::ExtendI32U => lo as u64,
        Conv::WrapI64 => lo as u64,
        Conv::Sext8 => lo as i8 as i32 as u32 as u64,
        Conv::Sext16 => lo as i16 as i32 as u32 as u64,
        Conv::Zext8 => (lo & 0xFF) as u64,
        Conv::Zext16 => (lo & 0xFFFF) as u64,
        Conv::I32ToF32 => (lo as i32 as f32).to_bits() as u64,
        Conv::F32ToI32 => f32::from_bits(lo) as i32 as u32 as u64,
        Conv::I32ToF64 => (lo as i32 as f64).to_bits(),
        Conv::F64ToI32 => f64::from_bits(value) as i32 as u32 as u64,
        Conv::I64ToF64 => (value as i64 as f64).to_bits(),
        Conv::F64ToI64 => f64::from_bits(value) as i64 as u64,
        Conv::F32ToF64 => (f32::from_bits(lo) as f64).to_bits(),
        Conv::F64ToF32 => (f64::from_bits(value) as f32).to_bits() as u64,
    }
}

fn pair(lo: u32, hi: u32) -> u64 {
    ((hi as u64) << 32) | lo as u64
}

fn split(value: u64) -> (u32, u32) {
    (value as u32, (value >> 32) as u32)
}

fn operand(what: &'static str, code: u32) -> VmError {
    VmError::HostError(format!("helper received invalid {what} code {code}"))
}

/// Runs `helper` with the argument words a native call site passed.
pub fn invoke(inst: &mut Instance, helper: Helper, w: [u32; 6]) -> VmResult<(u32, u32)> {
    let out = match helper {
        Helper::Arith64 => {
            let op = bin64_from_code(w[1]).ok_or_else(|| operand("arith64 op", w[1]))?;
            split(arith64(op, pair(w[2], w[3]), pair(w[4], w[5])))
        }
        Helper::Cmp64 => {
            let cond = Cond::from_u8(w[1] as u8).ok_or_else(|| operand("condition", w[1]))?;
            (cond.eval_i64(pair(w[2], w[3]), pair(w[4], w[5])) as u32, 0)
        }
        Helper::ArithF32 => {
            let op = float_op_from_code(w[1]).ok_or_else(|| operand("float op", w[1]))?;
            let value = arith_f32(op, f32::from_bits(w[2]), f32::from_bits(w[3]));
            (value.to_bits(), 0)
        }
        Helper::ArithF64 => {
            let op = float_op_from_code(w[1]).ok_or_else(|| operand("float op", w[1]))?;
            let a = f64::from_bits(pair(w[2], w[3]));
            let b = f64::from_bits(pair(w[4], w[5]));
            split(arith_f64(op, a, b).to_bits())
        }
        Helper::CmpF32 => {
            let cond =
                FloatCond::from_u8(w[1] as u8).ok_or_else(|| operand("condition", w[1]))?;
            let result = cmp_float(cond, f32::from_bits(w[2]), f32::from_bits(w[3]));
            (result as u32, 0)
        }
        Helper::CmpF64 => {
            let cond =
                FloatCond::from_u8(w[1] as u8).ok_or_else(|| operand("condition", w[1]))?;
            let a = f64::from_bits(pair(w[2], w[3]));
            let b = f64::from_bits(pair(w[4], w[5]));
            (cmp_float(cond, a, b) as u32, 0)
        }
        Helper::Convert => {
            let conv = Conv::from_u8(w[1] as u8).ok_or_else(|| operand("conversion", w[1]))?;
            split(convert(conv, pair(w[2], w[3])))
        }
        Helper::GlobalGet => split(inst.global_bits(w[1])?),
        Helper::GlobalSet => {
            inst.set_global_bits(w[1], pair(w[2], w[3]))?;
            (0, 0)
        }
        Helper::GlobalAddr => (inst.global_address(w[1])?, 0),
        Helper::MemCopy => {
            inst.mem.copy_within(w[1], w[2], w[3])?;
            (0, 0)
        }
        Helper::MemSet => {
            inst.mem.fill(w[1], w[2] as u8, w[3])?;
            (0, 0)
        }
        Helper::TableGet => (inst.table_get(w[1])?, 0),
        Helper::TableSet => {
            inst.table_set(w[1], w[2])?;
            (0, 0)
        }
        Helper::Alloca => (inst.alloca(w[1])?, 0),
        Helper::HeapAlloc => (inst.heap_alloc(w[1]), 0),
        Helper::HeapFree => {
            inst.heap_free(w[1]);
            (0, 0)
        }
        Helper::AtomicAdd => {
            let old = inst.mem.read_u32(w[1])?;
            inst.mem.write_u32(w[1], old.wrapping_add(w[2]))?;
            (old, 0)
        }
        Helper::AtomicCas => {
            let old = inst.mem.read_u32(w[1])?;
            if old == w[2] {
                inst.mem.write_u32(w[1], w[3])?;
            }
            (old, 0)
        }
        Helper::CallFunction => {
            inst.call_slots(w[1], w[2])?;
            (0, 0)
        }
        Helper::CallIndirect => {
            inst.call_indirect_slots(w[1], w[3], w[2], w[4])?;
            (0, 0)
        }
        Helper::FuncAddr => (inst.function_pointer(w[1])?, 0),
        Helper::CallVariadic => {
            inst.call_variadic(w[1], w[2], w[3], w[4])?;
            (0, 0)
        }
        Helper::MakeClosure => (inst.make_closure(w[1])?, 0),
    };
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn division_by_zero_yields_zero_and_overflow_wraps() {
        assert_eq!(arith64(Bin64::DivS, 7, 0), 0);
        assert_eq!(arith64(Bin64::RemU, 7, 0), 0);
        assert_eq!(
            arith64(Bin64::DivS, i64::MIN as u64, -1i64 as u64),
            i64::MIN as u64
        );
        assert_eq!(arith64(Bin64::RemS, i64::MIN as u64, -1i64 as u64), 0);
        assert_eq!(arith64(Bin64::Add, 0xFFFF_FFFF, 1), 0x1_0000_0000);
        assert_eq!(arith64(Bin64::Shl, 1, 65), 2);
    }

    #[test]
    fn conversions_saturate() {
        assert_eq!(convert(Conv::F64ToI32, f64::NAN.to_bits()), 0);
        assert_eq!(
            convert(Conv::F32ToI32, 3.0e10f32.to_bits() as u64),
            i32::MAX as u32 as u64
        );
        assert_eq!(convert(Conv::ExtendI32S, 0xFFFF_FFFE), -2i64 as u64);
        assert_eq!(convert(Conv::Sext8, 0x80), 0xFFFF_FF80);
    }

    #[test]
    fn helper_addresses_round_trip() {
        for helper in Helper::ALL {
            assert_eq!(Helper::from_address(helper.address()), Some(helper));
        }
        assert_eq!(Helper::from_address(HELPER_BASE + 2), None);
    }
}
