use crate::bytecode::{LoadKind, StoreKind};
use crate::helpers::Helper;
use crate::layout::HDR_MEMORY;
use crate::xtensa::encode;
use crate::xtensa::{A2, A4, A5, A6};

use crate::jit::JitFailure;
use crate::jit::callconv::{ArgWord, ResultDest};
use crate::jit::context::CompileContext;

/// Largest immediate offset and required alignment of a native access.
fn direct_reach(width: u8) -> (u32, u32) {
    match width {
        1 => (255, 1),
        2 => (510, 2),
        // The second word of a 64-bit access sits at offset + 4.
        8 => (1016, 4),
        _ => (1020, 4),
    }
}

/// Puts the address base in a4 and returns the immediate offset left for
/// the access itself.
fn address(ctx: &mut CompileContext<'_, '_>, p: u8, offset: u16, width: u8) -> Result<u32, JitFailure> {
    ctx.load_lo(A4, p)?;
    let offset = offset as u32;
    let (reach, align) = direct_reach(width);
    if offset <= reach && offset % align == 0 {
        return Ok(offset);
    }
    ctx.add_offset(A4, A4, offset)?;
    Ok(0)
}

pub(super) fn load(
    ctx: &mut CompileContext<'_, '_>,
    kind: LoadKind,
    d: u8,
    p: u8,
    offset: u16,
) -> Result<(), JitFailure> {
    let at = address(ctx, p, offset, kind.width())?;
    match kind {
        LoadKind::I32 => ctx.emit(encode::l32i(A5, A4, at)?)?,
        LoadKind::I64 => {
            ctx.emit(encode::l32i(A5, A4, at)?)?;
            ctx.emit(encode::l32i(A6, A4, at + 4)?)?;
            ctx.store_lo(A5, d)?;
            return ctx.store_hi(A6, d);
        }
        LoadKind::U8 => ctx.emit(encode::l8ui(A5, A4, at)?)?,
        LoadKind::S8 => {
            ctx.emit(encode::l8ui(A5, A4, at)?)?;
            ctx.emit(encode::slli(A5, A5, 24)?)?;
            ctx.emit(encode::srai(A5, A5, 24)?)?;
        }
        LoadKind::U16 => ctx.emit(encode::l16ui(A5, A4, at)?)?,
        LoadKind::S16 => ctx.emit(encode::l16si(A5, A4, at)?)?,
    }
    ctx.store_lo(A5, d)
}

pub(super) fn store(
    ctx: &mut CompileContext<'_, '_>,
    kind: StoreKind,
    s: u8,
    p: u8,
    offset: u16,
) -> Result<(), JitFailure> {
    let at = address(ctx, p, offset, kind.width())?;
    ctx.load_lo(A5, s)?;
    match kind {
        StoreKind::I32 => ctx.emit(encode::s32i(A5, A4, at)?),
        StoreKind::I64 => {
            ctx.load_hi(A6, s)?;
            ctx.emit(encode::s32i(A5, A4, at)?)?;
            ctx.emit(encode::s32i(A6, A4, at + 4)?)
        }
        StoreKind::I8 => ctx.emit(encode::s8i(A5, A4, at)?),
        StoreKind::I16 => ctx.emit(encode::s16i(A5, A4, at)?),
    }
}

/// Linear memory base from the instance header plus a constant offset.
pub(super) fn mem_addr(ctx: &mut CompileContext<'_, '_>, d: u8, offset: u32) -> Result<(), JitFailure> {
    ctx.load_word(A4, A2, HDR_MEMORY)?;
    if offset != 0 {
        ctx.add_offset(A4, A4, offset)?;
    }
    ctx.store_lo(A4, d)
}

fn global_is_wide(ctx: &CompileContext<'_, '_>, index: u16) -> bool {
    ctx.module
        .globals
        .get(index as usize)
        .is_some_and(|global| global.ty.is_wide())
}

pub(super) fn global_get(ctx: &mut CompileContext<'_, '_>, d: u8, index: u16) -> Result<(), JitFailure> {
    let result = if global_is_wide(ctx, index) {
        ResultDest::Wide(d)
    } else {
        ResultDest::Lo(d)
    };
    let args = [ArgWord::Instance, ArgWord::Const(index as u32)];
    ctx.call_helper(Helper::GlobalGet, &args, result)
}

pub(super) fn global_set(ctx: &mut CompileContext<'_, '_>, index: u16, s: u8) -> Result<(), JitFailure> {
    let args = [
        ArgWord::Instance,
        ArgWord::Const(index as u32),
        ArgWord::Lo(s),
        ArgWord::Hi(s),
    ];
    ctx.call_helper(Helper::GlobalSet, &args, ResultDest::None)
}

pub(super) fn global_addr(ctx: &mut CompileContext<'_, '_>, d: u8, index: u16) -> Result<(), JitFailure> {
    let args = [ArgWord::Instance, ArgWord::Const(index as u32)];
    ctx.call_helper(Helper::GlobalAddr, &args, ResultDest::Lo(d))
}

pub(super) fn mem_copy(ctx: &mut CompileContext<'_, '_>, dst: u8, src: u8, len: u8) -> Result<(), JitFailure> {
    let args = [
        ArgWord::Instance,
        ArgWord::Lo(dst),
        ArgWord::Lo(src),
        ArgWord::Lo(len),
    ];
    ctx.call_helper(Helper::MemCopy, &args, ResultDest::None)
}

pub(super) fn mem_set(ctx: &mut CompileContext<'_, '_>, dst: u8, val: u8, len: u8) -> Result<(), JitFailure> {
    let args = [
        ArgWord::Instance,
        ArgWord::Lo(dst),
        ArgWord::Lo(val),
        ArgWord::Lo(len),
    ];
    ctx.call_helper(Helper::MemSet, &args, ResultDest::None)
}

pub(super) fn table_get(ctx: &mut CompileContext<'_, '_>, d: u8, index: u8) -> Result<(), JitFailure> {
    let args = [ArgWord::Instance, ArgWord::Lo(index)];
    ctx.call_helper(Helper::TableGet, &args, ResultDest::Lo(d))
}

pub(super) fn table_set(ctx: &mut CompileContext<'_, '_>, index: u8, s: u8) -> Result<(), JitFailure> {
    let args = [ArgWord::Instance, ArgWord::Lo(index), ArgWord::Lo(s)];
    ctx.call_helper(Helper::TableSet, &args, ResultDest::None)
}

pub(super) fn alloca(ctx: &mut CompileContext<'_, '_>, d: u8, size: u8) -> Result<(), JitFailure> {
    let args = [ArgWord::Instance, ArgWord::Lo(size)];
    ctx.call_helper(Helper::Alloca, &args, ResultDest::Lo(d))
}

pub(super) fn heap_alloc(ctx: &mut CompileContext<'_, '_>, d: u8, size: u8) -> Result<(), JitFailure> {
    let args = [ArgWord::Instance, ArgWord::Lo(size)];
    ctx.call_helper(Helper::HeapAlloc, &args, ResultDest::Lo(d))
}

pub(super) fn heap_free(ctx: &mut CompileContext<'_, '_>, p: u8) -> Result<(), JitFailure> {
    let args = [ArgWord::Instance, ArgWord::Lo(p)];
    ctx.call_helper(Helper::HeapFree, &args, ResultDest::None)
}

pub(super) fn atomic_add(ctx: &mut CompileContext<'_, '_>, d: u8, p: u8, v: u8) -> Result<(), JitFailure> {
    let args = [ArgWord::Instance, ArgWord::Lo(p), ArgWord::Lo(v)];
    ctx.call_helper(Helper::AtomicAdd, &args, ResultDest::Lo(d))
}

pub(super) fn atomic_cas(
    ctx: &mut CompileContext<'_, '_>,
    d: u8,
    p: u8,
    expected: u8,
    new: u8,
) -> Result<(), JitFailure> {
    let args = [
        ArgWord::Instance,
        ArgWord::Lo(p),
        ArgWord::Lo(expected),
        ArgWord::Lo(new),
    ];
    ctx.call_helper(Helper::AtomicCas, &args, ResultDest::Lo(d))
}
