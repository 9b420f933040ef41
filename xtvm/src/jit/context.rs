use crate::helpers::Helper;
use crate::memory::{AddressSpace, round_up};
use crate::module::Module;
use crate::value::SLOT_SIZE;
use crate::xtensa::{A3, A9, Reg, encode};

use super::callconv::{self, ArgWord, ResultDest};
use super::emitter::CodeEmitter;
use super::fixups::BranchResolver;
use super::literal_pool::LiteralPool;
use super::{JitConfig, JitFailure};

/// Largest offset `L32I`/`S32I` reach directly.
const WORD_OFFSET_REACH: u32 = 1020;

/// Native stack frame of one compiled function. Offsets are from `a1`.
///
/// ```text
///   a1 + 0         outgoing stack arguments of import calls
///   a1 + callbacks trampoline addresses built for callback parameters
///   a1 + tags      type tag bytes of variadic calls
///   a1 + scratch   callee register file for direct calls
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(super) struct FrameLayout {
    pub callbacks: u32,
    pub tags: u32,
    pub scratch: u32,
    pub size: u32,
}

impl FrameLayout {
    pub fn new(out_words: usize, callback_words: usize, tag_bytes: usize, scratch_slots: usize) -> Self {
        let callbacks = out_words as u32 * 4;
        let tags = callbacks + callback_words as u32 * 4;
        let scratch = round_up(tags + tag_bytes as u32, SLOT_SIZE);
        let size = round_up(scratch + scratch_slots as u32 * SLOT_SIZE, 16).max(16);
        Self {
            callbacks,
            tags,
            scratch,
            size,
        }
    }
}

/// Everything one compilation threads through the lowerings.
pub(super) struct CompileContext<'a, 'm> {
    pub em: CodeEmitter<'a, AddressSpace>,
    pub pool: LiteralPool,
    pub branches: BranchResolver,
    pub module: &'m Module,
    pub config: &'m JitConfig,
    pub func: u32,
    pub frame: FrameLayout,
    /// Bytecode offset of the instruction being lowered.
    pub offset: usize,
}

impl CompileContext<'_, '_> {
    pub fn emit(&mut self, insn: u32) -> Result<(), JitFailure> {
        self.em.emit_insn(insn)
    }

    pub fn out_of_range(&self, what: &'static str) -> JitFailure {
        JitFailure::OperandOutOfRange {
            offset: self.offset,
            what,
        }
    }

    /// `MOVI` when the value fits 12 signed bits, a pooled `L32R` otherwise.
    pub fn load_const(&mut self, reg: Reg, value: u32) -> Result<(), JitFailure> {
        let signed = value as i32;
        if (-2048..=2047).contains(&signed) {
            return self.emit(encode::movi(reg, signed)?);
        }
        self.pool.load(&mut self.em, reg, value)
    }

    /// Base register and in-range offset for a word access at
    /// `base + offset`. Far offsets go through `a9`.
    fn reach(&mut self, base: Reg, offset: u32) -> Result<(Reg, u32), JitFailure> {
        if offset <= WORD_OFFSET_REACH {
            return Ok((base, offset));
        }
        let high = offset & !0xFF;
        if high <= 32512 {
            self.emit(encode::addmi(A9, base, high as i32)?)?;
        } else {
            self.load_const(A9, high)?;
            self.emit(encode::add(A9, A9, base))?;
        }
        Ok((A9, offset & 0xFF))
    }

    pub fn load_word(&mut self, reg: Reg, base: Reg, offset: u32) -> Result<(), JitFailure> {
        let (base, offset) = self.reach(base, offset)?;
        self.emit(encode::l32i(reg, base, offset)?)
    }

    pub fn store_word(&mut self, reg: Reg, base: Reg, offset: u32) -> Result<(), JitFailure> {
        let (base, offset) = self.reach(base, offset)?;
        self.emit(encode::s32i(reg, base, offset)?)
    }

    /// `reg = base + offset`. `base` must not be `a9`.
    pub fn add_offset(&mut self, reg: Reg, base: Reg, offset: u32) -> Result<(), JitFailure> {
        let signed = offset as i32;
        if (-128..=127).contains(&signed) {
            return self.emit(encode::addi(reg, base, signed)?);
        }
        self.load_const(A9, offset)?;
        self.emit(encode::add(reg, base, A9))
    }

    pub fn load_lo(&mut self, reg: Reg, vreg: u8) -> Result<(), JitFailure> {
        self.load_word(reg, A3, slot(vreg))
    }

    pub fn load_hi(&mut self, reg: Reg, vreg: u8) -> Result<(), JitFailure> {
        self.load_word(reg, A3, slot(vreg) + 4)
    }

    pub fn store_lo(&mut self, reg: Reg, vreg: u8) -> Result<(), JitFailure> {
        self.store_word(reg, A3, slot(vreg))
    }

    pub fn store_hi(&mut self, reg: Reg, vreg: u8) -> Result<(), JitFailure> {
        self.store_word(reg, A3, slot(vreg) + 4)
    }

    /// Emits a `J` to be aimed later with [`Self::patch_jump_here`].
    pub fn jump_placeholder(&mut self) -> Result<u32, JitFailure> {
        let at = self.em.position();
        self.emit(encode::j(0)?)?;
        Ok(at)
    }

    pub fn patch_jump_here(&mut self, at: u32) -> Result<(), JitFailure> {
        let disp = self.em.position() as i64 - (at as i64 + 4);
        let insn = encode::j(disp as i32)?;
        self.em.patch_insn(at, insn)
    }

    /// Calls a runtime helper with the configured convention.
    pub fn call_helper(
        &mut self,
        helper: Helper,
        args: &[ArgWord],
        result: ResultDest,
    ) -> Result<(), JitFailure> {
        let kind = self.config.helper_convention.call_kind();
        callconv::emit_call(self, kind, helper.address(), args, &[], result)
    }
}

/// Byte offset of virtual register `vreg` in the register file.
pub(super) fn slot(vreg: u8) -> u32 {
    vreg as u32 * SLOT_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_regions_are_stacked_and_rounded() {
        let frame = FrameLayout::new(3, 1, 2, 4);
        assert_eq!(frame.callbacks, 12);
        assert_eq!(frame.tags, 16);
        assert_eq!(frame.scratch, 24);
        assert_eq!(frame.size, 64);
    }

    #[test]
    fn empty_frame_keeps_the_minimum_size() {
        assert_eq!(FrameLayout::new(0, 0, 0, 0).size, 16);
    }
}
