use crate::bytecode::{Bin32, Bin64, Cond, Conv, FloatCond, FloatOp};
use crate::helpers::{Helper, bin64_code, float_op_code};
use crate::xtensa::encode::{self, BranchCond};
use crate::xtensa::{A4, A5, A6, A7, A8, A9, F0, F1, F2};

use crate::jit::JitFailure;
use crate::jit::callconv::{ArgWord, ResultDest};
use crate::jit::context::CompileContext;

/// Displacement of a branch that skips exactly the next instruction.
const SKIP_NEXT: i32 = 2;

pub(super) fn mov(ctx: &mut CompileContext<'_, '_>, d: u8, s: u8) -> Result<(), JitFailure> {
    ctx.load_lo(A4, s)?;
    ctx.load_hi(A5, s)?;
    ctx.store_lo(A4, d)?;
    ctx.store_hi(A5, d)
}

pub(super) fn const32(ctx: &mut CompileContext<'_, '_>, d: u8, value: u32) -> Result<(), JitFailure> {
    ctx.load_const(A4, value)?;
    ctx.store_lo(A4, d)
}

pub(super) fn const64(ctx: &mut CompileContext<'_, '_>, d: u8, value: u64) -> Result<(), JitFailure> {
    ctx.load_const(A4, value as u32)?;
    ctx.load_const(A5, (value >> 32) as u32)?;
    ctx.store_lo(A4, d)?;
    ctx.store_hi(A5, d)
}

pub(super) fn bin32(ctx: &mut CompileContext<'_, '_>, op: Bin32, d: u8, a: u8, b: u8) -> Result<(), JitFailure> {
    ctx.load_lo(A4, a)?;
    ctx.load_lo(A5, b)?;
    match op {
        Bin32::Add => ctx.emit(encode::add(A6, A4, A5))?,
        Bin32::Sub => ctx.emit(encode::sub(A6, A4, A5))?,
        Bin32::Mul => ctx.emit(encode::mull(A6, A4, A5))?,
        Bin32::And => ctx.emit(encode::and(A6, A4, A5))?,
        Bin32::Or => ctx.emit(encode::or(A6, A4, A5))?,
        Bin32::Xor => ctx.emit(encode::xor(A6, A4, A5))?,
        Bin32::Shl => {
            ctx.emit(encode::ssl(A5))?;
            ctx.emit(encode::sll(A6, A4))?;
        }
        Bin32::ShrS => {
            ctx.emit(encode::ssr(A5))?;
            ctx.emit(encode::sra(A6, A4))?;
        }
        Bin32::ShrU => {
            ctx.emit(encode::ssr(A5))?;
            ctx.emit(encode::srl(A6, A4))?;
        }
        Bin32::DivS | Bin32::DivU | Bin32::RemS | Bin32::RemU => {
            // A zero divisor leaves the preloaded 0 in place.
            let divide = match op {
                Bin32::DivS => encode::quos(A6, A4, A5),
                Bin32::DivU => encode::quou(A6, A4, A5),
                Bin32::RemS => encode::rems(A6, A4, A5),
                _ => encode::remu(A6, A4, A5),
            };
            ctx.emit(encode::movi(A6, 0)?)?;
            ctx.emit(encode::beqz(A5, SKIP_NEXT)?)?;
            ctx.emit(divide)?;
        }
    }
    ctx.store_lo(A6, d)
}

pub(super) fn add_imm32(ctx: &mut CompileContext<'_, '_>, d: u8, a: u8, imm: i8) -> Result<(), JitFailure> {
    ctx.load_lo(A4, a)?;
    ctx.emit(encode::addi(A6, A4, imm as i32)?)?;
    ctx.store_lo(A6, d)
}

/// `a6 = 1`, then `skip` decides whether the reset to 0 runs.
fn set_flag(ctx: &mut CompileContext<'_, '_>, skip: u32, d: u8) -> Result<(), JitFailure> {
    ctx.emit(encode::movi(A6, 1)?)?;
    ctx.emit(skip)?;
    ctx.emit(encode::movi(A6, 0)?)?;
    ctx.store_lo(A6, d)
}

pub(super) fn eqz32(ctx: &mut CompileContext<'_, '_>, d: u8, a: u8) -> Result<(), JitFailure> {
    ctx.load_lo(A4, a)?;
    let skip = encode::beqz(A4, SKIP_NEXT)?;
    set_flag(ctx, skip, d)
}

/// Native branch condition and operand order for `cond(a4, a5)`.
fn branch_for(cond: Cond) -> (BranchCond, bool) {
    match cond {
        Cond::Eq => (BranchCond::Eq, false),
        Cond::Ne => (BranchCond::Ne, false),
        Cond::LtS => (BranchCond::Lt, false),
        Cond::LtU => (BranchCond::Ltu, false),
        Cond::GeS => (BranchCond::Ge, false),
        Cond::GeU => (BranchCond::Geu, false),
        Cond::GtS => (BranchCond::Lt, true),
        Cond::GtU => (BranchCond::Ltu, true),
        Cond::LeS => (BranchCond::Ge, true),
        Cond::LeU => (BranchCond::Geu, true),
    }
}

pub(super) fn cmp32(ctx: &mut CompileContext<'_, '_>, cond: Cond, d: u8, a: u8, b: u8) -> Result<(), JitFailure> {
    ctx.load_lo(A4, a)?;
    ctx.load_lo(A5, b)?;
    let (native, swapped) = branch_for(cond);
    let (lhs, rhs) = if swapped { (A5, A4) } else { (A4, A5) };
    let skip = encode::branch(native, lhs, rhs, SKIP_NEXT)?;
    set_flag(ctx, skip, d)
}

/// Loads `a` into a4:a5 and `b` into a6:a7 (lo:hi).
fn load_pairs(ctx: &mut CompileContext<'_, '_>, a: u8, b: u8) -> Result<(), JitFailure> {
    ctx.load_lo(A4, a)?;
    ctx.load_hi(A5, a)?;
    ctx.load_lo(A6, b)?;
    ctx.load_hi(A7, b)
}

fn wide_operands(a: u8, b: u8) -> [ArgWord; 4] {
    [
        ArgWord::Lo(a),
        ArgWord::Hi(a),
        ArgWord::Lo(b),
        ArgWord::Hi(b),
    ]
}

pub(super) fn bin64(ctx: &mut CompileContext<'_, '_>, op: Bin64, d: u8, a: u8, b: u8) -> Result<(), JitFailure> {
    match op {
        Bin64::Add => {
            load_pairs(ctx, a, b)?;
            ctx.emit(encode::add(A8, A4, A6))?;
            ctx.emit(encode::add(A5, A5, A7))?;
            ctx.emit(encode::branch(BranchCond::Geu, A8, A4, SKIP_NEXT)?)?;
            ctx.emit(encode::addi(A5, A5, 1)?)?;
        }
        Bin64::Sub => {
            load_pairs(ctx, a, b)?;
            ctx.emit(encode::sub(A8, A4, A6))?;
            ctx.emit(encode::sub(A5, A5, A7))?;
            ctx.emit(encode::branch(BranchCond::Geu, A4, A6, SKIP_NEXT)?)?;
            ctx.emit(encode::addi(A5, A5, -1)?)?;
        }
        Bin64::Mul => {
            load_pairs(ctx, a, b)?;
            ctx.emit(encode::mull(A8, A4, A6))?;
            ctx.emit(encode::muluh(A9, A4, A6))?;
            ctx.emit(encode::mull(A7, A4, A7))?;
            ctx.emit(encode::add(A9, A9, A7))?;
            ctx.emit(encode::mull(A5, A5, A6))?;
            ctx.emit(encode::add(A5, A5, A9))?;
        }
        Bin64::And | Bin64::Or | Bin64::Xor => {
            load_pairs(ctx, a, b)?;
            let pairwise = match op {
                Bin64::And => encode::and,
                Bin64::Or => encode::or,
                _ => encode::xor,
            };
            ctx.emit(pairwise(A8, A4, A6))?;
            ctx.emit(pairwise(A5, A5, A7))?;
        }
        _ => {
            let [alo, ahi, blo, bhi] = wide_operands(a, b);
            let args = [
                ArgWord::Instance,
                ArgWord::Const(bin64_code(op)),
                alo,
                ahi,
                blo,
                bhi,
            ];
            return ctx.call_helper(Helper::Arith64, &args, ResultDest::Wide(d));
        }
    }
    ctx.store_lo(A8, d)?;
    ctx.store_hi(A5, d)
}

pub(super) fn cmp64(ctx: &mut CompileContext<'_, '_>, cond: Cond, d: u8, a: u8, b: u8) -> Result<(), JitFailure> {
    match cond {
        Cond::Eq | Cond::Ne => {
            load_pairs(ctx, a, b)?;
            ctx.emit(encode::xor(A4, A4, A6))?;
            ctx.emit(encode::xor(A5, A5, A7))?;
            ctx.emit(encode::or(A4, A4, A5))?;
            let skip = if cond == Cond::Eq {
                encode::beqz(A4, SKIP_NEXT)?
            } else {
                encode::bnez(A4, SKIP_NEXT)?
            };
            set_flag(ctx, skip, d)
        }
        _ => {
            let [alo, ahi, blo, bhi] = wide_operands(a, b);
            let args = [
                ArgWord::Instance,
                ArgWord::Const(cond as u8 as u32),
                alo,
                ahi,
                blo,
                bhi,
            ];
            ctx.call_helper(Helper::Cmp64, &args, ResultDest::Lo(d))
        }
    }
}

pub(super) fn convert(ctx: &mut CompileContext<'_, '_>, conv: Conv, d: u8, s: u8) -> Result<(), JitFailure> {
    if conv.is_float() {
        let args = [
            ArgWord::Instance,
            ArgWord::Const(conv as u8 as u32),
            ArgWord::Lo(s),
            ArgWord::Hi(s),
        ];
        let result = if conv.wide_result() {
            ResultDest::Wide(d)
        } else {
            ResultDest::Lo(d)
        };
        return ctx.call_helper(Helper::Convert, &args, result);
    }
    ctx.load_lo(A4, s)?;
    match conv {
        Conv::ExtendI32S => {
            ctx.emit(encode::srai(A5, A4, 31)?)?;
            ctx.store_lo(A4, d)?;
            return ctx.store_hi(A5, d);
        }
        Conv::ExtendI32U => {
            ctx.emit(encode::movi(A5, 0)?)?;
            ctx.store_lo(A4, d)?;
            return ctx.store_hi(A5, d);
        }
        Conv::Sext8 => {
            ctx.emit(encode::slli(A4, A4, 24)?)?;
            ctx.emit(encode::srai(A4, A4, 24)?)?;
        }
        Conv::Sext16 => {
            ctx.emit(encode::slli(A4, A4, 16)?)?;
            ctx.emit(encode::srai(A4, A4, 16)?)?;
        }
        Conv::Zext8 => ctx.emit(encode::extui(A4, A4, 0, 8)?)?,
        Conv::Zext16 => ctx.emit(encode::extui(A4, A4, 0, 16)?)?,
        // Wrap keeps the low word; float conversions went to the helper.
        _ => {}
    }
    ctx.store_lo(A4, d)
}

pub(super) fn float_f32(ctx: &mut CompileContext<'_, '_>, op: FloatOp, d: u8, a: u8, b: u8) -> Result<(), JitFailure> {
    let fpu = match op {
        FloatOp::Add => encode::add_s(F2, F0, F1),
        FloatOp::Sub => encode::sub_s(F2, F0, F1),
        FloatOp::Mul => encode::mul_s(F2, F0, F1),
        FloatOp::Div => {
            let args = [
                ArgWord::Instance,
                ArgWord::Const(float_op_code(op)),
                ArgWord::Lo(a),
                ArgWord::Lo(b),
            ];
            return ctx.call_helper(Helper::ArithF32, &args, ResultDest::Lo(d));
        }
    };
    ctx.load_lo(A4, a)?;
    ctx.load_lo(A5, b)?;
    ctx.emit(encode::wfr(F0, A4))?;
    ctx.emit(encode::wfr(F1, A5))?;
    ctx.emit(fpu)?;
    ctx.emit(encode::rfr(A6, F2))?;
    ctx.store_lo(A6, d)
}

pub(super) fn float_f64(ctx: &mut CompileContext<'_, '_>, op: FloatOp, d: u8, a: u8, b: u8) -> Result<(), JitFailure> {
    let [alo, ahi, blo, bhi] = wide_operands(a, b);
    let args = [
        ArgWord::Instance,
        ArgWord::Const(float_op_code(op)),
        alo,
        ahi,
        blo,
        bhi,
    ];
    ctx.call_helper(Helper::ArithF64, &args, ResultDest::Wide(d))
}

pub(super) fn cmp_f32(ctx: &mut CompileContext<'_, '_>, cond: FloatCond, d: u8, a: u8, b: u8) -> Result<(), JitFailure> {
    let args = [
        ArgWord::Instance,
        ArgWord::Const(cond as u8 as u32),
        ArgWord::Lo(a),
        ArgWord::Lo(b),
    ];
    ctx.call_helper(Helper::CmpF32, &args, ResultDest::Lo(d))
}

pub(super) fn cmp_f64(ctx: &mut CompileContext<'_, '_>, cond: FloatCond, d: u8, a: u8, b: u8) -> Result<(), JitFailure> {
    let [alo, ahi, blo, bhi] = wide_operands(a, b);
    let args = [
        ArgWord::Instance,
        ArgWord::Const(cond as u8 as u32),
        alo,
        ahi,
        blo,
        bhi,
    ];
    ctx.call_helper(Helper::CmpF64, &args, ResultDest::Lo(d))
}

/// `d = c != 0 ? a : b` over the whole slot.
pub(super) fn select(ctx: &mut CompileContext<'_, '_>, d: u8, c: u8, a: u8, b: u8) -> Result<(), JitFailure> {
    ctx.load_lo(A4, c)?;
    ctx.load_lo(A5, a)?;
    ctx.load_lo(A6, b)?;
    ctx.load_hi(A7, a)?;
    ctx.load_hi(A8, b)?;
    ctx.emit(encode::moveqz(A5, A6, A4))?;
    ctx.emit(encode::moveqz(A7, A8, A4))?;
    ctx.store_lo(A5, d)?;
    ctx.store_hi(A7, d)
}
