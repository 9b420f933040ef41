use tracing::warn;

use crate::memory::WordStore;
use crate::xtensa::encode;

use super::emitter::CodeEmitter;
use super::{JitFailure, UnresolvedBranchPolicy};

#[derive(Clone, Copy, Debug)]
struct Fixup {
    /// Code offset of the placeholder `J`.
    at: u32,
    target: usize,
}

/// Bytecode offset to native offset table plus the forward branches still
/// waiting for their target.
///
/// The table has one entry past the last instruction: the epilogue, where
/// `END` lands.
#[derive(Debug)]
pub struct BranchResolver {
    native: Vec<Option<u32>>,
    fixups: Vec<Fixup>,
    resolved: usize,
    traps: usize,
}

impl BranchResolver {
    pub fn new(code_len: usize) -> Self {
        Self {
            native: vec![None; code_len + 1],
            fixups: Vec::new(),
            resolved: 0,
            traps: 0,
        }
    }

    pub fn epilogue(&self) -> usize {
        self.native.len() - 1
    }

    /// Records where bytecode `offset` starts. First write wins; returns
    /// whether this call recorded it.
    pub fn mark(&mut self, offset: usize, native: u32) -> bool {
        match self.native.get_mut(offset) {
            Some(slot) if slot.is_none() => {
                *slot = Some(native);
                true
            }
            _ => false,
        }
    }

    pub fn native_offset(&self, offset: usize) -> Option<u32> {
        self.native.get(offset).copied().flatten()
    }

    pub fn pending(&self) -> usize {
        self.fixups.len()
    }

    /// Fixups patched with their real target so far.
    pub fn resolved(&self) -> usize {
        self.resolved
    }

    pub fn traps(&self) -> usize {
        self.traps
    }

    /// Emits `J` to bytecode `target`: direct when the target is already
    /// known, a placeholder plus fixup otherwise.
    pub fn emit_branch_to<S: WordStore + ?Sized>(
        &mut self,
        em: &mut CodeEmitter<'_, S>,
        target: usize,
    ) -> Result<(), JitFailure> {
        if target >= self.native.len() {
            return Err(JitFailure::OperandOutOfRange {
                offset: target,
                what: "branch target",
            });
        }
        let at = em.position();
        match self.native[target] {
            Some(dest) => em.emit_insn(jump(at, dest)?),
            None => {
                self.fixups.push(Fixup { at, target });
                em.emit_insn(encode::j(0)?)
            }
        }
    }

    /// Patches every pending placeholder. Targets that never got a native
    /// offset follow `policy`.
    pub fn resolve<S: WordStore + ?Sized>(
        &mut self,
        em: &mut CodeEmitter<'_, S>,
        policy: UnresolvedBranchPolicy,
    ) -> Result<(), JitFailure> {
        for fixup in std::mem::take(&mut self.fixups) {
            match self.native_offset(fixup.target) {
                Some(dest) => {
                    em.patch_insn(fixup.at, jump(fixup.at, dest)?)?;
                    self.resolved += 1;
                }
                None => match policy {
                    UnresolvedBranchPolicy::Fail => {
                        return Err(JitFailure::UnresolvedBranch {
                            target: fixup.target,
                        });
                    }
                    UnresolvedBranchPolicy::Trap => {
                        warn!(
                            target = fixup.target,
                            native_offset = fixup.at,
                            "unresolved branch target, patched to a trap"
                        );
                        em.patch_insn(fixup.at, jump(fixup.at, fixup.at)?)?;
                        self.traps += 1;
                    }
                },
            }
        }
        Ok(())
    }
}

fn jump(at: u32, dest: u32) -> Result<u32, JitFailure> {
    let disp = dest as i64 - (at as i64 + 4);
    let disp = i32::try_from(disp).map_err(|_| JitFailure::EncodingRange {
        what: "jump displacement",
        value: disp,
    })?;
    Ok(encode::j(disp)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{AddressSpace, IRAM_BASE};
    use crate::xtensa::{Insn, decode_insn};

    fn jump_target(em: &CodeEmitter<'_, AddressSpace>, at: u32) -> u32 {
        match decode_insn(em.read_insn(at).expect("read")) {
            Some(Insn::J { disp }) => (at as i64 + 4 + disp as i64) as u32,
            other => panic!("expected a jump at {at}, found {other:?}"),
        }
    }

    #[test]
    fn backward_branches_are_emitted_directly() {
        let mut mem = AddressSpace::new(256, 64);
        let mut em = CodeEmitter::new(&mut mem, IRAM_BASE, 128);
        let mut branches = BranchResolver::new(4);
        branches.mark(0, 0);
        em.emit_insn(encode::nop()).expect("nop");
        branches.mark(1, em.position());
        branches.emit_branch_to(&mut em, 0).expect("branch");
        assert_eq!(branches.pending(), 0);
        assert_eq!(jump_target(&em, 3), 0);
    }

    #[test]
    fn forward_branches_are_patched_on_resolve() {
        let mut mem = AddressSpace::new(256, 64);
        let mut em = CodeEmitter::new(&mut mem, IRAM_BASE, 128);
        let mut branches = BranchResolver::new(4);
        branches.mark(0, 0);
        branches.emit_branch_to(&mut em, 2).expect("forward");
        branches.emit_branch_to(&mut em, 4).expect("epilogue");
        branches.mark(1, em.position());
        em.emit_insn(encode::nop()).expect("nop");
        branches.mark(2, em.position());
        em.emit_insn(encode::nop()).expect("nop");
        branches.mark(branches.epilogue(), em.position());
        em.emit_insn(encode::retw()).expect("retw");
        assert_eq!(branches.pending(), 2);
        branches
            .resolve(&mut em, UnresolvedBranchPolicy::Fail)
            .expect("resolve");
        assert_eq!(branches.resolved(), 2);
        assert_eq!(jump_target(&em, 0), 9);
        assert_eq!(jump_target(&em, 3), 12);
    }

    #[test]
    fn first_mark_wins() {
        let mut branches = BranchResolver::new(2);
        assert!(branches.mark(1, 12));
        assert!(!branches.mark(1, 30));
        assert_eq!(branches.native_offset(1), Some(12));
        assert_eq!(branches.native_offset(0), None);
    }

    #[test]
    fn unresolved_targets_follow_the_policy() {
        let mut mem = AddressSpace::new(256, 64);
        let mut em = CodeEmitter::new(&mut mem, IRAM_BASE, 128);
        let mut branches = BranchResolver::new(8);
        branches.emit_branch_to(&mut em, 5).expect("branch");
        assert_eq!(
            branches.resolve(&mut em, UnresolvedBranchPolicy::Fail),
            Err(JitFailure::UnresolvedBranch { target: 5 })
        );

        let mut branches = BranchResolver::new(8);
        branches.emit_branch_to(&mut em, 5).expect("branch");
        branches
            .resolve(&mut em, UnresolvedBranchPolicy::Trap)
            .expect("trap");
        assert_eq!(branches.traps(), 1);
        assert_eq!(jump_target(&em, 3), 3);
    }

    #[test]
    fn targets_past_the_epilogue_are_rejected() {
        let mut mem = AddressSpace::new(256, 64);
        let mut em = CodeEmitter::new(&mut mem, IRAM_BASE, 128);
        let mut branches = BranchResolver::new(4);
        assert!(matches!(
            branches.emit_branch_to(&mut em, 5),
            Err(JitFailure::OperandOutOfRange { .. })
        ));
    }
}
