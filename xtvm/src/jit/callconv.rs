//! Every call that leaves generated code: runtime helpers, host imports and
//! other compiled functions.
//!
//! Windowed calls (`CALLX8`) put the argument words in `a10..a15`, which the
//! callee sees as `a2..a7`; results come back in `a10`/`a11`. The caller's
//! `a0..a7` survive, so the register file base in `a3` and the instance
//! header in `a2` stay live across the call.
//!
//! Call0 calls (`CALLX0`) share one register window with the callee: the
//! argument words go to `a2..a7`, results come back in `a2`/`a3` and the
//! callee may clobber `a2..a11`. The live values are parked in `a12..a14`
//! (callee-saved under this convention) for the duration of the call.

use crate::xtensa::{A0, A1, A2, A3, A4, A7, A10, A11, A12, A13, A14, A15, CallKind, Reg, encode};

use super::JitFailure;
use super::context::{CompileContext, slot};

/// One argument word, described by where its value comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum ArgWord {
    /// The instance header address.
    Instance,
    /// Low word of a virtual register.
    Lo(u8),
    Hi(u8),
    /// Address of a virtual register's slot.
    SlotAddr(u8),
    Const(u32),
    /// `a1 + offset`.
    FrameAddr(u32),
    /// The word stored at `a1 + offset`.
    FrameWord(u32),
}

/// Where the result registers go after the call returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum ResultDest {
    None,
    Lo(u8),
    Wide(u8),
    FrameWord(u32),
}

/// Registers the live values are addressed through during one call.
struct Bases {
    regs: Reg,
    header: Reg,
}

/// Emits a call to `target`. `reg_args` fill the argument registers in
/// order, `stack_args` the outgoing words at `a1`.
pub(super) fn emit_call(
    ctx: &mut CompileContext<'_, '_>,
    kind: CallKind,
    target: u32,
    reg_args: &[ArgWord],
    stack_args: &[ArgWord],
    result: ResultDest,
) -> Result<(), JitFailure> {
    let (bases, first_arg, target_reg) = match kind {
        CallKind::Windowed => (
            Bases {
                regs: A3,
                header: A2,
            },
            A10.index(),
            A7,
        ),
        CallKind::Call0 => {
            ctx.emit(encode::mov(A12, A3))?;
            ctx.emit(encode::mov(A13, A2))?;
            ctx.emit(encode::mov(A14, A0))?;
            (
                Bases {
                    regs: A12,
                    header: A13,
                },
                A2.index(),
                A15,
            )
        }
    };

    for (index, word) in stack_args.iter().enumerate() {
        materialize(ctx, A4, *word, &bases)?;
        ctx.store_word(A4, A1, 4 * index as u32)?;
    }
    for (index, word) in reg_args.iter().enumerate() {
        let reg = index
            .checked_add(first_arg as usize)
            .and_then(|index| u8::try_from(index).ok())
            .filter(|index| *index < first_arg + 6)
            .and_then(Reg::from_index)
            .ok_or_else(|| ctx.out_of_range("argument word"))?;
        materialize(ctx, reg, *word, &bases)?;
    }

    ctx.load_const(target_reg, target)?;
    let (lo, hi) = match kind {
        CallKind::Windowed => {
            ctx.emit(encode::callx8(target_reg))?;
            (A10, A11)
        }
        CallKind::Call0 => {
            ctx.emit(encode::callx0(target_reg))?;
            (A2, A3)
        }
    };

    match result {
        ResultDest::None => {}
        ResultDest::Lo(reg) => ctx.store_word(lo, bases.regs, slot(reg))?,
        ResultDest::Wide(reg) => {
            ctx.store_word(lo, bases.regs, slot(reg))?;
            ctx.store_word(hi, bases.regs, slot(reg) + 4)?;
        }
        ResultDest::FrameWord(offset) => ctx.store_word(lo, A1, offset)?,
    }

    if kind == CallKind::Call0 {
        ctx.emit(encode::mov(A3, A12))?;
        ctx.emit(encode::mov(A2, A13))?;
        ctx.emit(encode::mov(A0, A14))?;
    }
    Ok(())
}

fn materialize(
    ctx: &mut CompileContext<'_, '_>,
    dst: Reg,
    word: ArgWord,
    bases: &Bases,
) -> Result<(), JitFailure> {
    match word {
        ArgWord::Instance => ctx.emit(encode::mov(dst, bases.header)),
        ArgWord::Lo(reg) => ctx.load_word(dst, bases.regs, slot(reg)),
        ArgWord::Hi(reg) => ctx.load_word(dst, bases.regs, slot(reg) + 4),
        ArgWord::SlotAddr(reg) => ctx.add_offset(dst, bases.regs, slot(reg)),
        ArgWord::Const(value) => ctx.load_const(dst, value),
        ArgWord::FrameAddr(offset) => ctx.add_offset(dst, A1, offset),
        ArgWord::FrameWord(offset) => ctx.load_word(dst, A1, offset),
    }
}
