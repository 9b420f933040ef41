use crate::xtensa::encode::{self, BranchCond};
use crate::xtensa::{A4, A5};

use crate::jit::JitFailure;
use crate::jit::context::CompileContext;

pub(super) fn jmp(ctx: &mut CompileContext<'_, '_>, target: usize) -> Result<(), JitFailure> {
    ctx.branches.emit_branch_to(&mut ctx.em, target)
}

/// Conditional branches skip over an unconditional `J`, so the bytecode
/// target is never limited by the short conditional displacement.
pub(super) fn br_if(
    ctx: &mut CompileContext<'_, '_>,
    c: u8,
    target: usize,
    negate: bool,
) -> Result<(), JitFailure> {
    ctx.load_lo(A4, c)?;
    let skip = if negate {
        encode::bnez(A4, 2)?
    } else {
        encode::beqz(A4, 2)?
    };
    ctx.emit(skip)?;
    ctx.branches.emit_branch_to(&mut ctx.em, target)
}

pub(super) fn br_table(
    ctx: &mut CompileContext<'_, '_>,
    index: u8,
    cases: &[usize],
    default: usize,
) -> Result<(), JitFailure> {
    ctx.load_lo(A4, index)?;
    for (case, target) in cases.iter().enumerate() {
        ctx.load_const(A5, case as u32)?;
        ctx.emit(encode::branch(BranchCond::Ne, A4, A5, 2)?)?;
        ctx.branches.emit_branch_to(&mut ctx.em, *target)?;
    }
    ctx.branches.emit_branch_to(&mut ctx.em, default)
}

/// `End` falls into the epilogue when it is the last instruction.
pub(super) fn end(ctx: &mut CompileContext<'_, '_>, next: usize) -> Result<(), JitFailure> {
    let epilogue = ctx.branches.epilogue();
    if next == epilogue {
        return Ok(());
    }
    ctx.branches.emit_branch_to(&mut ctx.em, epilogue)
}
