//! Per-opcode lowering to Xtensa.
//!
//! On entry to generated code `a2` holds the instance header and `a3` the
//! register file base; both stay live for the whole function. `a4..a8` are
//! free scratch inside one lowering, `a9` is reserved for far offsets and
//! `a10..a15` carry outgoing arguments. No value lives in a native register
//! across two bytecode instructions.

mod arith;
mod calls;
mod control;
mod memory;

use crate::bytecode::Instr;

use super::JitFailure;
use super::context::CompileContext;

/// Lowers the instruction at `ctx.offset`; `next` is the offset after it.
pub(super) fn lower(
    ctx: &mut CompileContext<'_, '_>,
    instr: &Instr,
    next: usize,
) -> Result<(), JitFailure> {
    match instr {
        Instr::Nop => Ok(()),
        Instr::Mov { d, s } => arith::mov(ctx, *d, *s),
        Instr::Const32 { d, value } => arith::const32(ctx, *d, *value),
        Instr::Const64 { d, value } => arith::const64(ctx, *d, *value),
        Instr::Bin32 { op, d, a, b } => arith::bin32(ctx, *op, *d, *a, *b),
        Instr::AddImm32 { d, a, imm } => arith::add_imm32(ctx, *d, *a, *imm),
        Instr::Eqz32 { d, a } => arith::eqz32(ctx, *d, *a),
        Instr::Cmp32 { cond, d, a, b } => arith::cmp32(ctx, *cond, *d, *a, *b),
        Instr::Bin64 { op, d, a, b } => arith::bin64(ctx, *op, *d, *a, *b),
        Instr::Cmp64 { cond, d, a, b } => arith::cmp64(ctx, *cond, *d, *a, *b),
        Instr::Convert { conv, d, s } => arith::convert(ctx, *conv, *d, *s),
        Instr::FloatF32 { op, d, a, b } => arith::float_f32(ctx, *op, *d, *a, *b),
        Instr::FloatF64 { op, d, a, b } => arith::float_f64(ctx, *op, *d, *a, *b),
        Instr::CmpF32 { cond, d, a, b } => arith::cmp_f32(ctx, *cond, *d, *a, *b),
        Instr::CmpF64 { cond, d, a, b } => arith::cmp_f64(ctx, *cond, *d, *a, *b),
        Instr::Select { d, c, a, b } => arith::select(ctx, *d, *c, *a, *b),
        Instr::Load { kind, d, p, offset } => memory::load(ctx, *kind, *d, *p, *offset),
        Instr::Store { kind, s, p, offset } => memory::store(ctx, *kind, *s, *p, *offset),
        Instr::MemAddr { d, offset } => memory::mem_addr(ctx, *d, *offset),
        Instr::GlobalGet { d, index } => memory::global_get(ctx, *d, *index),
        Instr::GlobalSet { index, s } => memory::global_set(ctx, *index, *s),
        Instr::GlobalAddr { d, index } => memory::global_addr(ctx, *d, *index),
        Instr::MemCopy { dst, src, len } => memory::mem_copy(ctx, *dst, *src, *len),
        Instr::MemSet { dst, val, len } => memory::mem_set(ctx, *dst, *val, *len),
        Instr::TableGet { d, index } => memory::table_get(ctx, *d, *index),
        Instr::TableSet { index, s } => memory::table_set(ctx, *index, *s),
        Instr::Alloca { d, size } => memory::alloca(ctx, *d, *size),
        Instr::HeapAlloc { d, size } => memory::heap_alloc(ctx, *d, *size),
        Instr::HeapFree { p } => memory::heap_free(ctx, *p),
        Instr::AtomicAdd { d, p, v } => memory::atomic_add(ctx, *d, *p, *v),
        Instr::AtomicCas {
            d,
            p,
            expected,
            new,
        } => memory::atomic_cas(ctx, *d, *p, *expected, *new),
        Instr::Jmp { target } => control::jmp(ctx, *target),
        Instr::BrIf { c, target, negate } => control::br_if(ctx, *c, *target, *negate),
        Instr::BrTable {
            index,
            cases,
            default,
        } => control::br_table(ctx, *index, cases, *default),
        Instr::End => control::end(ctx, next),
        Instr::Call { func, base } => calls::call(ctx, *func as u32, *base),
        Instr::CallIndirect { callee, base } => calls::call_indirect(ctx, *callee, *base),
        Instr::FuncAddr { d, func } => calls::func_addr(ctx, *d, *func as u32),
        Instr::CallImport { import, base } => calls::call_import(ctx, *import as u32, *base),
        Instr::CallImportVa { import, base, tags } => {
            calls::call_import_va(ctx, *import as u32, *base, tags)
        }
    }
}
