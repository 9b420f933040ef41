use tracing::debug;

use crate::bytecode::{Bin64, Cond, FloatOp, Instr, decode_all};
use crate::ffi::arg_layout;
use crate::helpers::Helper;
use crate::memory::AddressSpace;
use crate::module::{Function, Module};
use crate::xtensa::{A1, encode};

use super::context::{CompileContext, FrameLayout};
use super::emitter::CodeEmitter;
use super::fixups::BranchResolver;
use super::literal_pool::LiteralPool;
use super::{CompiledCode, JitConfig, JitFailure, lower};

/// Smallest code buffer worth trying: the prologue and epilogue alone.
const MIN_CODE_BYTES: u32 = 16;

/// What a first pass over the bytecode learns before any code is emitted.
#[derive(Debug, Default)]
struct Plan {
    out_words: usize,
    callback_words: usize,
    tag_bytes: usize,
    scratch_slots: usize,
    helpers: Vec<Helper>,
}

impl Plan {
    fn uses(&mut self, helper: Helper) {
        if !self.helpers.contains(&helper) {
            self.helpers.push(helper);
        }
    }
}

/// Compiles function `func` of `module` into instruction RAM.
///
/// The whole function is validated before any native byte is written: an
/// unknown opcode, a register outside the function's register file, a bad
/// index or a branch past the end fails the compilation and leaves the
/// function to the interpreter. The code buffer is carved from the free
/// executable memory and trimmed to the emitted size; on failure it is
/// released again.
pub fn compile_function(
    mem: &mut AddressSpace,
    module: &Module,
    func: u32,
    config: &JitConfig,
) -> Result<CompiledCode, JitFailure> {
    if !config.enabled {
        return Err(JitFailure::Disabled);
    }
    let function = module
        .functions
        .get(func as usize)
        .ok_or(JitFailure::OperandOutOfRange {
            offset: 0,
            what: "function index",
        })?;
    let instrs = decode_all(&function.code)?;
    let plan = plan(module, function, &instrs)?;
    let frame = FrameLayout::new(
        plan.out_words,
        plan.callback_words,
        plan.tag_bytes,
        plan.scratch_slots,
    );

    let capacity = config.max_code_bytes.min(mem.exec_largest_free()) & !3;
    if capacity < MIN_CODE_BYTES {
        return Err(JitFailure::ExecMemoryExhausted {
            requested: config.max_code_bytes,
        });
    }
    let base = mem
        .alloc_exec(capacity)
        .map_err(|_| JitFailure::ExecMemoryExhausted {
            requested: capacity,
        })?;

    let emitted = emit(
        mem, base, capacity, module, func, function, &instrs, &plan, frame, config,
    );
    match emitted {
        Ok(code) => {
            mem.shrink_exec(base, code.size);
            debug!(
                function = func,
                name = %function.name,
                entry = format_args!("{:#010x}", code.entry),
                size = code.size,
                frame = frame.size,
                pool_flushes = code.pool_flushes,
                fixups = code.fixups,
                traps = code.traps,
                "compiled function"
            );
            Ok(code)
        }
        Err(failure) => {
            mem.free_exec(base);
            Err(failure)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn emit(
    mem: &mut AddressSpace,
    base: u32,
    capacity: u32,
    module: &Module,
    func: u32,
    function: &Function,
    instrs: &[(usize, Instr)],
    plan: &Plan,
    frame: FrameLayout,
    config: &JitConfig,
) -> Result<CompiledCode, JitFailure> {
    let code_len = function.code.len();
    let mut ctx = CompileContext {
        em: CodeEmitter::new(mem, base, capacity),
        pool: LiteralPool::new(config.literal_pool_capacity),
        branches: BranchResolver::new(code_len),
        module,
        config,
        func,
        frame,
        offset: 0,
    };

    ctx.emit(encode::entry(A1, frame.size)?)?;
    if config.seed_helper_literals && !plan.helpers.is_empty() {
        ctx.pool
            .seed(plan.helpers.iter().map(|helper| helper.address()));
        ctx.pool.flush(&mut ctx.em)?;
    }

    for (index, (offset, instr)) in instrs.iter().enumerate() {
        let next = instrs
            .get(index + 1)
            .map(|(next, _)| *next)
            .unwrap_or(code_len);
        ctx.offset = *offset;
        let position = ctx.em.position();
        ctx.branches.mark(*offset, position);
        lower::lower(&mut ctx, instr, next)?;
    }

    let epilogue = ctx.branches.epilogue();
    let position = ctx.em.position();
    ctx.branches.mark(epilogue, position);
    ctx.emit(encode::retw())?;
    ctx.branches
        .resolve(&mut ctx.em, config.unresolved_branch_policy)?;

    let CompileContext {
        em, pool, branches, ..
    } = ctx;
    let size = em.finish()?;
    Ok(CompiledCode {
        entry: base,
        size,
        literal_ranges: pool
            .ranges()
            .iter()
            .map(|(start, end)| (base + start, base + end))
            .collect(),
        pool_flushes: pool.flushes(),
        fixups: branches.resolved(),
        traps: branches.traps(),
    })
}

/// Validates every operand and sizes the native frame.
fn plan(module: &Module, function: &Function, instrs: &[(usize, Instr)]) -> Result<Plan, JitFailure> {
    let count = (function.register_count as usize).max(1);
    let code_len = function.code.len();
    let mut plan = Plan::default();

    for (offset, instr) in instrs {
        let offset = *offset;
        let fail = |what: &'static str| JitFailure::OperandOutOfRange { offset, what };
        let window = |base: u8, len: usize| {
            if base as usize + len.max(1) > count {
                Err(fail("argument window"))
            } else {
                Ok(())
            }
        };

        if operand_registers(instr).iter().any(|reg| *reg as usize >= count) {
            return Err(fail("register"));
        }
        for target in branch_targets(instr) {
            if target > code_len {
                return Err(fail("branch target"));
            }
        }

        match instr {
            Instr::Bin64 { op, .. } => {
                if !matches!(
                    op,
                    Bin64::Add | Bin64::Sub | Bin64::Mul | Bin64::And | Bin64::Or | Bin64::Xor
                ) {
                    plan.uses(Helper::Arith64);
                }
            }
            Instr::Cmp64 { cond, .. } => {
                if !matches!(cond, Cond::Eq | Cond::Ne) {
                    plan.uses(Helper::Cmp64);
                }
            }
            Instr::Convert { conv, .. } if conv.is_float() => plan.uses(Helper::Convert),
            Instr::FloatF32 { op, .. } if *op == FloatOp::Div => {
                plan.uses(Helper::ArithF32)
            }
            Instr::FloatF64 { .. } => plan.uses(Helper::ArithF64),
            Instr::CmpF32 { .. } => plan.uses(Helper::CmpF32),
            Instr::CmpF64 { .. } => plan.uses(Helper::CmpF64),
            Instr::GlobalGet { index, .. } | Instr::GlobalAddr { index, .. } => {
                if module.globals.get(*index as usize).is_none() {
                    return Err(fail("global index"));
                }
                plan.uses(if matches!(instr, Instr::GlobalGet { .. }) {
                    Helper::GlobalGet
                } else {
                    Helper::GlobalAddr
                });
            }
            Instr::GlobalSet { index, .. } => {
                match module.globals.get(*index as usize) {
                    Some(global) if global.mutable => {}
                    Some(_) => return Err(fail("mutable global")),
                    None => return Err(fail("global index")),
                }
                plan.uses(Helper::GlobalSet);
            }
            Instr::MemCopy { .. } => plan.uses(Helper::MemCopy),
            Instr::MemSet { .. } => plan.uses(Helper::MemSet),
            Instr::TableGet { .. } => plan.uses(Helper::TableGet),
            Instr::TableSet { .. } => plan.uses(Helper::TableSet),
            Instr::Alloca { .. } => plan.uses(Helper::Alloca),
            Instr::HeapAlloc { .. } => plan.uses(Helper::HeapAlloc),
            Instr::HeapFree { .. } => plan.uses(Helper::HeapFree),
            Instr::AtomicAdd { .. } => plan.uses(Helper::AtomicAdd),
            Instr::AtomicCas { .. } => plan.uses(Helper::AtomicCas),
            Instr::Call { func, base } => {
                let callee = module
                    .functions
                    .get(*func as usize)
                    .ok_or_else(|| fail("function index"))?;
                let ty = module
                    .function_type(*func as u32)
                    .ok_or_else(|| fail("function type"))?;
                window(*base, ty.params.len())?;
                plan.scratch_slots = plan
                    .scratch_slots
                    .max((callee.register_count as usize).max(1));
                plan.uses(Helper::CallFunction);
            }
            Instr::CallIndirect { .. } => plan.uses(Helper::CallIndirect),
            Instr::FuncAddr { func, .. } => {
                if module.functions.get(*func as usize).is_none() {
                    return Err(fail("function index"));
                }
            }
            Instr::CallImport { import, base } => {
                let descriptor = module
                    .imports
                    .get(*import as usize)
                    .ok_or_else(|| fail("import index"))?;
                let ty = module
                    .import_type(*import as u32)
                    .ok_or_else(|| fail("import type"))?;
                window(*base, ty.params.len())?;
                let callbacks = (0..ty.params.len())
                    .filter(|index| descriptor.is_callback_slot(*index))
                    .count();
                if callbacks > 0 {
                    plan.uses(Helper::MakeClosure);
                }
                plan.callback_words = plan.callback_words.max(callbacks);
                plan.out_words = plan.out_words.max(arg_layout(&ty.params).stack_words);
            }
            Instr::CallImportVa { import, base, tags } => {
                if module.imports.get(*import as usize).is_none() {
                    return Err(fail("import index"));
                }
                window(*base, tags.len())?;
                plan.tag_bytes = plan.tag_bytes.max(tags.len());
                plan.uses(Helper::CallVariadic);
            }
            _ => {}
        }
    }
    Ok(plan)
}

/// Every virtual register an instruction names directly.
fn operand_registers(instr: &Instr) -> Vec<u8> {
    match instr {
        Instr::Nop | Instr::Jmp { .. } | Instr::End => Vec::new(),
        Instr::Mov { d, s } => vec![*d, *s],
        Instr::Const32 { d, .. } | Instr::Const64 { d, .. } => vec![*d],
        Instr::Bin32 { d, a, b, .. }
        | Instr::Cmp32 { d, a, b, .. }
        | Instr::Bin64 { d, a, b, .. }
        | Instr::Cmp64 { d, a, b, .. }
        | Instr::FloatF32 { d, a, b, .. }
        | Instr::FloatF64 { d, a, b, .. }
        | Instr::CmpF32 { d, a, b, .. }
        | Instr::CmpF64 { d, a, b, .. } => vec![*d, *a, *b],
        Instr::AddImm32 { d, a, .. } | Instr::Eqz32 { d, a } => vec![*d, *a],
        Instr::Convert { d, s, .. } => vec![*d, *s],
        Instr::Select { d, c, a, b } => vec![*d, *c, *a, *b],
        Instr::Load { d, p, .. } => vec![*d, *p],
        Instr::Store { s, p, .. } => vec![*s, *p],
        Instr::MemAddr { d, .. }
        | Instr::GlobalGet { d, .. }
        | Instr::GlobalAddr { d, .. }
        | Instr::FuncAddr { d, .. } => vec![*d],
        Instr::GlobalSet { s, .. } => vec![*s],
        Instr::MemCopy { dst, src, len } => vec![*dst, *src, *len],
        Instr::MemSet { dst, val, len } => vec![*dst, *val, *len],
        Instr::TableGet { d, index } => vec![*d, *index],
        Instr::TableSet { index, s } => vec![*index, *s],
        Instr::Alloca { d, size } | Instr::HeapAlloc { d, size } => vec![*d, *size],
        Instr::HeapFree { p } => vec![*p],
        Instr::AtomicAdd { d, p, v } => vec![*d, *p, *v],
        Instr::AtomicCas {
            d,
            p,
            expected,
            new,
        } => vec![*d, *p, *expected, *new],
        Instr::BrIf { c, .. } => vec![*c],
        Instr::BrTable { index, .. } => vec![*index],
        Instr::Call { base, .. } | Instr::CallImport { base, .. } | Instr::CallImportVa { base, .. } => {
            vec![*base]
        }
        Instr::CallIndirect { callee, base } => vec![*callee, *base],
    }
}

fn branch_targets(instr: &Instr) -> Vec<usize> {
    match instr {
        Instr::Jmp { target } | Instr::BrIf { target, .. } => vec![*target],
        Instr::BrTable { cases, default, .. } => {
            let mut targets = cases.clone();
            targets.push(*default);
            targets
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::assembler::BytecodeBuilder;
    use crate::bytecode::{Bin32, OpCode};
    use crate::jit::UnresolvedBranchPolicy;
    use crate::memory::IRAM_BASE;
    use crate::module::{FuncType, ModuleBuilder};
    use crate::value::ValueType;
    use crate::xtensa::{Insn, decode_insn};

    fn address_space() -> AddressSpace {
        AddressSpace::new(64 * 1024, 64 * 1024)
    }

    fn single(name: &str, ty: FuncType, registers: u16, code: Vec<u8>) -> Arc<Module> {
        let mut builder = ModuleBuilder::new();
        builder.add_function(name, ty, registers, code, true);
        builder.build().expect("module")
    }

    fn add_module() -> Arc<Module> {
        let mut code = BytecodeBuilder::new();
        code.bin32(Bin32::Add, 0, 0, 1).end();
        single(
            "add",
            FuncType::new(&[ValueType::I32, ValueType::I32], &[ValueType::I32]),
            2,
            code.finish().expect("bytecode"),
        )
    }

    #[test]
    fn compiled_code_starts_with_entry_and_is_trimmed() {
        let module = add_module();
        let mut mem = address_space();
        let free_before = mem.exec_available();
        let code =
            compile_function(&mut mem, &module, 0, &JitConfig::default()).expect("compile");
        assert_eq!(code.entry, IRAM_BASE);
        let word = mem.read_u32(code.entry).expect("code word");
        assert!(matches!(
            decode_insn(word & 0xFF_FFFF),
            Some(Insn::Entry { .. })
        ));
        assert!(code.size < JitConfig::default().max_code_bytes);
        assert!(free_before - mem.exec_available() < JitConfig::default().max_code_bytes);
    }

    #[test]
    fn disabled_config_refuses_to_compile() {
        let module = add_module();
        let mut mem = address_space();
        let config = JitConfig {
            enabled: false,
            ..JitConfig::default()
        };
        assert_eq!(
            compile_function(&mut mem, &module, 0, &config),
            Err(JitFailure::Disabled)
        );
    }

    #[test]
    fn register_outside_the_file_fails_before_emitting() {
        let mut code = BytecodeBuilder::new();
        code.bin32(Bin32::Add, 0, 0, 7).end();
        let module = single(
            "bad",
            FuncType::new(&[ValueType::I32], &[ValueType::I32]),
            2,
            code.finish().expect("bytecode"),
        );
        let mut mem = address_space();
        let free = mem.exec_available();
        assert_eq!(
            compile_function(&mut mem, &module, 0, &JitConfig::default()),
            Err(JitFailure::OperandOutOfRange {
                offset: 0,
                what: "register"
            })
        );
        assert_eq!(mem.exec_available(), free);
    }

    #[test]
    fn unknown_opcode_is_reported_with_its_offset() {
        let module = single("junk", FuncType::new(&[], &[]), 1, vec![0x00, 0xEE]);
        let mut mem = address_space();
        assert_eq!(
            compile_function(&mut mem, &module, 0, &JitConfig::default()),
            Err(JitFailure::UnsupportedOpcode {
                offset: 1,
                opcode: 0xEE
            })
        );
    }

    /// A jump one byte into the following `const` never gets a native offset.
    fn mid_instruction_jump() -> Arc<Module> {
        let mut code = BytecodeBuilder::new();
        code.const_i32(0, 1)
            .jmp("skip")
            .const_i32(0, 2)
            .label("skip")
            .end();
        let mut bytes = code.finish().expect("bytecode");
        let jmp_at = bytes
            .iter()
            .position(|byte| *byte == OpCode::Jmp as u8)
            .expect("jmp");
        bytes[jmp_at + 1..jmp_at + 5].copy_from_slice(&1i32.to_le_bytes());
        single("odd", FuncType::new(&[], &[ValueType::I32]), 1, bytes)
    }

    #[test]
    fn unresolved_branch_becomes_a_trap_or_a_failure() {
        let module = mid_instruction_jump();
        let mut mem = address_space();
        let code = compile_function(&mut mem, &module, 0, &JitConfig::default())
            .expect("trap policy compiles");
        assert_eq!(code.traps, 1);

        let config = JitConfig {
            unresolved_branch_policy: UnresolvedBranchPolicy::Fail,
            ..JitConfig::default()
        };
        assert!(matches!(
            compile_function(&mut mem, &module, 0, &config),
            Err(JitFailure::UnresolvedBranch { .. })
        ));
    }

    #[test]
    fn exhausted_instruction_ram_fails_cleanly() {
        let module = add_module();
        let mut mem = AddressSpace::new(8, 64 * 1024);
        assert!(matches!(
            compile_function(&mut mem, &module, 0, &JitConfig::default()),
            Err(JitFailure::ExecMemoryExhausted { .. })
        ));
    }

    #[test]
    fn helper_addresses_are_seeded_once_per_function() {
        let mut code = BytecodeBuilder::new();
        code.bin64(Bin64::DivS, 0, 0, 1)
            .bin64(Bin64::RemS, 0, 0, 1)
            .end();
        let module = single(
            "div",
            FuncType::new(&[ValueType::I64, ValueType::I64], &[ValueType::I64]),
            2,
            code.finish().expect("bytecode"),
        );
        let mut mem = address_space();
        let code =
            compile_function(&mut mem, &module, 0, &JitConfig::default()).expect("compile");
        assert_eq!(code.pool_flushes, 1);
        assert_eq!(code.literal_ranges.len(), 1);
        let (start, end) = code.literal_ranges[0];
        assert_eq!(end - start, 4);
        assert_eq!(mem.read_u32(start), Ok(Helper::Arith64.address()));
    }
}
