use crate::ffi::{ARG_REGS, Placement, arg_layout};
use crate::helpers::Helper;
use crate::layout::{HDR_CALL_DEPTH, HDR_DEPTH_LIMIT, HDR_ENTRY_TABLE, HDR_FUNC_PTRS};
use crate::value::{SLOT_SIZE, ValueType};
use crate::xtensa::encode::{self, BranchCond};
use crate::xtensa::{A1, A2, A3, A4, A5, A6, A7, A10, A11, CallKind, IMPORT_BASE};

use crate::jit::JitFailure;
use crate::jit::callconv::{self, ArgWord, ResultDest};
use crate::jit::context::{CompileContext, slot};

/// Direct call to VM function `func` with its arguments at register `base`.
///
/// When the callee is compiled its entry table word is non-zero and the
/// call goes straight to it with a register file built in this frame's
/// scratch area, counting itself in the header's call depth. Otherwise, or
/// once the depth limit is reached, the call-function helper runs it through
/// the dispatcher, which may compile it on the way or report the limit.
pub(super) fn call(ctx: &mut CompileContext<'_, '_>, func: u32, base: u8) -> Result<(), JitFailure> {
    let module = ctx.module;
    let callee = module
        .functions
        .get(func as usize)
        .ok_or_else(|| ctx.out_of_range("function index"))?;
    let params = module
        .function_type(func)
        .map(|ty| ty.params.len() as u32)
        .ok_or_else(|| ctx.out_of_range("function type"))?;
    let slots = (callee.register_count as u32).max(1);
    let scratch = ctx.frame.scratch;

    ctx.load_word(A4, A2, HDR_ENTRY_TABLE)?;
    ctx.load_word(A4, A4, 4 * func)?;
    ctx.emit(encode::bnez(A4, 2)?)?;
    let slow = ctx.jump_placeholder()?;
    ctx.load_word(A5, A2, HDR_CALL_DEPTH)?;
    ctx.load_word(A6, A2, HDR_DEPTH_LIMIT)?;
    ctx.emit(encode::branch(BranchCond::Ltu, A5, A6, 2)?)?;
    let at_limit = ctx.jump_placeholder()?;
    ctx.emit(encode::addi(A5, A5, 1)?)?;
    ctx.store_word(A5, A2, HDR_CALL_DEPTH)?;

    for param in 0..params {
        let from = slot(base) + param * SLOT_SIZE;
        let to = scratch + param * SLOT_SIZE;
        ctx.load_word(A5, A3, from)?;
        ctx.store_word(A5, A1, to)?;
        ctx.load_word(A5, A3, from + 4)?;
        ctx.store_word(A5, A1, to + 4)?;
    }
    if slots > params {
        // Zero the callee's remaining registers, one slot per iteration.
        ctx.add_offset(A5, A1, scratch + params * SLOT_SIZE)?;
        ctx.load_const(A6, slots - params)?;
        ctx.emit(encode::movi(A7, 0)?)?;
        let top = ctx.em.position();
        ctx.emit(encode::s32i(A7, A5, 0)?)?;
        ctx.emit(encode::s32i(A7, A5, 4)?)?;
        ctx.emit(encode::addi(A5, A5, SLOT_SIZE as i32)?)?;
        ctx.emit(encode::addi(A6, A6, -1)?)?;
        let back = top as i64 - (ctx.em.position() as i64 + 4);
        ctx.emit(encode::bnez(A6, back as i32)?)?;
    }

    ctx.emit(encode::mov(A10, A2))?;
    ctx.add_offset(A11, A1, scratch)?;
    ctx.emit(encode::callx8(A4))?;
    ctx.load_word(A5, A2, HDR_CALL_DEPTH)?;
    ctx.emit(encode::addi(A5, A5, -1)?)?;
    ctx.store_word(A5, A2, HDR_CALL_DEPTH)?;
    ctx.load_word(A5, A1, scratch)?;
    ctx.store_lo(A5, base)?;
    ctx.load_word(A5, A1, scratch + 4)?;
    ctx.store_hi(A5, base)?;
    let done = ctx.jump_placeholder()?;

    ctx.patch_jump_here(slow)?;
    ctx.patch_jump_here(at_limit)?;
    let args = [
        ArgWord::Instance,
        ArgWord::Const(func),
        ArgWord::SlotAddr(base),
    ];
    ctx.call_helper(Helper::CallFunction, &args, ResultDest::None)?;
    ctx.patch_jump_here(done)
}

/// Indirect calls always go through the helper, which resolves the pointer
/// and checks the argument window against this function's registers.
pub(super) fn call_indirect(ctx: &mut CompileContext<'_, '_>, callee: u8, base: u8) -> Result<(), JitFailure> {
    let args = [
        ArgWord::Instance,
        ArgWord::Lo(callee),
        ArgWord::SlotAddr(0),
        ArgWord::Const(ctx.func),
        ArgWord::Const(base as u32),
    ];
    ctx.call_helper(Helper::CallIndirect, &args, ResultDest::None)
}

pub(super) fn func_addr(ctx: &mut CompileContext<'_, '_>, d: u8, func: u32) -> Result<(), JitFailure> {
    ctx.load_word(A4, A2, HDR_FUNC_PTRS)?;
    ctx.add_offset(A4, A4, 4 * func)?;
    ctx.store_lo(A4, d)
}

/// Host import call with the native argument layout. Callback parameters
/// are swapped for trampoline addresses first; all six argument registers
/// are written so unused ones read as zero.
pub(super) fn call_import(ctx: &mut CompileContext<'_, '_>, import: u32, base: u8) -> Result<(), JitFailure> {
    let module = ctx.module;
    let descriptor = module
        .imports
        .get(import as usize)
        .ok_or_else(|| ctx.out_of_range("import index"))?;
    let ty = module
        .import_type(import)
        .ok_or_else(|| ctx.out_of_range("import type"))?;

    let mut closures: Vec<(usize, u32)> = Vec::new();
    for index in 0..ty.params.len() {
        if !descriptor.is_callback_slot(index) {
            continue;
        }
        let offset = ctx.frame.callbacks + 4 * closures.len() as u32;
        let reg = register(ctx, base, index)?;
        let args = [ArgWord::Instance, ArgWord::Lo(reg)];
        ctx.call_helper(Helper::MakeClosure, &args, ResultDest::FrameWord(offset))?;
        closures.push((index, offset));
    }

    let layout = arg_layout(&ty.params);
    let mut regs = [ArgWord::Const(0); ARG_REGS];
    let mut stack = vec![ArgWord::Const(0); layout.stack_words];
    for (index, (param, placement)) in ty.params.iter().zip(&layout.placements).enumerate() {
        let reg = register(ctx, base, index)?;
        let lo = closures
            .iter()
            .find(|(slot, _)| *slot == index)
            .map(|(_, offset)| ArgWord::FrameWord(*offset))
            .unwrap_or(ArgWord::Lo(reg));
        let words = if param.is_wide() {
            vec![lo, ArgWord::Hi(reg)]
        } else {
            vec![lo]
        };
        for (word_index, word) in words.into_iter().enumerate() {
            let target = match *placement {
                Placement::Reg(start) => regs.get_mut(start + word_index),
                Placement::Stack(start) => stack.get_mut(start + word_index),
            };
            *target.ok_or_else(|| ctx.out_of_range("argument word"))? = word;
        }
    }

    let result = match ty.result() {
        ValueType::Void => ResultDest::None,
        wide if wide.is_wide() => ResultDest::Wide(base),
        _ => ResultDest::Lo(base),
    };
    callconv::emit_call(
        ctx,
        CallKind::Windowed,
        IMPORT_BASE + 4 * import,
        &regs,
        &stack,
        result,
    )
}

/// Variadic calls pass their per-call type tags through the frame and let
/// the helper marshal the values.
pub(super) fn call_import_va(
    ctx: &mut CompileContext<'_, '_>,
    import: u32,
    base: u8,
    tags: &[ValueType],
) -> Result<(), JitFailure> {
    let offset = ctx.frame.tags;
    if !tags.is_empty() {
        ctx.add_offset(A5, A1, offset)?;
        for (index, tag) in tags.iter().enumerate() {
            ctx.emit(encode::movi(A4, tag.tag() as i32)?)?;
            ctx.emit(encode::s8i(A4, A5, index as u32)?)?;
        }
    }
    let args = [
        ArgWord::Instance,
        ArgWord::Const(import),
        ArgWord::FrameAddr(offset),
        ArgWord::Const(tags.len() as u32),
        ArgWord::SlotAddr(base),
    ];
    ctx.call_helper(Helper::CallVariadic, &args, ResultDest::None)
}

fn register(ctx: &CompileContext<'_, '_>, base: u8, index: usize) -> Result<u8, JitFailure> {
    u8::try_from(base as usize + index).map_err(|_| ctx.out_of_range("register"))
}
