//! Reference interpreter.
//!
//! Works directly on the register file in data RAM and goes through the same
//! helper routines and marshalling as compiled code, so a function gives the
//! same result in either tier.
//!
//! Calls between interpreted functions push an [`Activation`] instead of
//! recursing, so the host stack only grows when a call leaves for native
//! code or a host function.

use std::sync::Arc;

use crate::bytecode::{Instr, LoadKind, StoreKind, decode};
use crate::error::{VmError, VmResult};
use crate::helpers::{arith_f32, arith_f64, arith32, arith64, cmp_float, convert};
use crate::instance::{Instance, SlotCall};
use crate::memory::AddressSpace;
use crate::module::Module;
use crate::value::SLOT_SIZE;

/// The register file of one activation.
struct Frame {
    func: u32,
    base: u32,
    count: u32,
}

impl Frame {
    fn slot(&self, reg: u8) -> VmResult<u32> {
        if reg as u32 >= self.count {
            return Err(VmError::InvalidRegister {
                function: self.func,
                register: reg,
            });
        }
        Ok(self.base + reg as u32 * SLOT_SIZE)
    }

    /// Start of an argument window of `len` slots at `reg`.
    fn window(&self, reg: u8, len: usize) -> VmResult<u32> {
        let last = reg as usize + len.max(1) - 1;
        if last >= self.count as usize {
            return Err(VmError::InvalidRegister {
                function: self.func,
                register: last.min(u8::MAX as usize) as u8,
            });
        }
        self.slot(reg)
    }

    fn lo(&self, mem: &AddressSpace, reg: u8) -> VmResult<u32> {
        mem.read_u32(self.slot(reg)?)
    }

    fn wide(&self, mem: &AddressSpace, reg: u8) -> VmResult<u64> {
        mem.read_u64(self.slot(reg)?)
    }

    fn set_lo(&self, mem: &mut AddressSpace, reg: u8, value: u32) -> VmResult<()> {
        mem.write_u32(self.slot(reg)?, value)
    }

    fn set_wide(&self, mem: &mut AddressSpace, reg: u8, value: u64) -> VmResult<()> {
        mem.write_u64(self.slot(reg)?, value)
    }
}

enum Flow {
    Next,
    Jump(usize),
    Return,
    /// Call `func` with its parameters at `args`.
    Call { func: u32, args: u32 },
}

/// One interpreted function in progress.
struct Activation<'m> {
    frame: Frame,
    code: &'m [u8],
    pc: usize,
    /// The call that started this activation. `None` for the entry function,
    /// whose frame belongs to the caller of [`execute`].
    call: Option<SlotCall>,
}

impl<'m> Activation<'m> {
    /// Hands `call` back when `func` does not exist.
    fn new(
        module: &'m Module,
        func: u32,
        regs: u32,
        call: Option<SlotCall>,
    ) -> Result<Self, Option<SlotCall>> {
        match module.functions.get(func as usize) {
            Some(function) => Ok(Self {
                frame: Frame {
                    func,
                    base: regs,
                    count: function.register_count.max(1) as u32,
                },
                code: function.code.as_slice(),
                pc: 0,
                call,
            }),
            None => Err(call),
        }
    }
}

/// Interprets `func` on the register file at `regs`.
pub(crate) fn execute(inst: &mut Instance, func: u32, regs: u32) -> VmResult<()> {
    let module = Arc::clone(&inst.module);
    let entry = Activation::new(&module, func, regs, None)
        .map_err(|_| VmError::InvalidFunction(func))?;
    let mut stack = vec![entry];
    let result = run(inst, &module, &mut stack);
    // An error leaves the activations it unwound through on the stack.
    while let Some(activation) = stack.pop() {
        if let Some(call) = activation.call {
            let _ = inst.finish_slots(call, false);
        }
    }
    result
}

fn run<'m>(
    inst: &mut Instance,
    module: &'m Module,
    stack: &mut Vec<Activation<'m>>,
) -> VmResult<()> {
    while let Some(top) = stack.last_mut() {
        let flow = if top.pc < top.code.len() {
            let (instr, next) = decode(top.code, top.pc)?;
            let flow = step(inst, &top.frame, &instr)?;
            if matches!(flow, Flow::Next | Flow::Call { .. }) {
                top.pc = next;
            }
            flow
        } else {
            Flow::Return
        };
        match flow {
            Flow::Next => {}
            Flow::Jump(target) if target <= top.code.len() => top.pc = target,
            Flow::Jump(_) => return Err(VmError::BranchOutOfRange { offset: top.pc }),
            Flow::Return => {
                if let Some(call) = stack.pop().and_then(|done| done.call) {
                    inst.finish_slots(call, true)?;
                }
            }
            Flow::Call { func, args } => {
                let call = inst.begin_slots(func, args)?;
                let native = match inst.native_entry(func) {
                    Ok(native) => native,
                    Err(err) => {
                        inst.finish_slots(call, false)?;
                        return Err(err);
                    }
                };
                match native {
                    Some(entry) => {
                        let regs = call.regs;
                        let result = inst.run_entry(func, entry, regs);
                        let copied = inst.finish_slots(call, result.is_ok());
                        result.and(copied)?;
                    }
                    None => {
                        let regs = call.regs;
                        match Activation::new(module, func, regs, Some(call)) {
                            Ok(callee) => stack.push(callee),
                            Err(call) => {
                                if let Some(call) = call {
                                    inst.finish_slots(call, false)?;
                                }
                                return Err(VmError::InvalidFunction(func));
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

fn step(inst: &mut Instance, frame: &Frame, instr: &Instr) -> VmResult<Flow> {
    let mem = &mut inst.mem;
    match instr {
        Instr::Nop => {}
        Instr::Mov { d, s } => {
            let value = frame.wide(mem, *s)?;
            frame.set_wide(mem, *d, value)?;
        }
        Instr::Const32 { d, value } => frame.set_lo(mem, *d, *value)?,
        Instr::Const64 { d, value } => frame.set_wide(mem, *d, *value)?,
        Instr::Bin32 { op, d, a, b } => {
            let value = arith32(*op, frame.lo(mem, *a)?, frame.lo(mem, *b)?);
            frame.set_lo(mem, *d, value)?;
        }
        Instr::AddImm32 { d, a, imm } => {
            let value = frame.lo(mem, *a)?.wrapping_add(*imm as i32 as u32);
            frame.set_lo(mem, *d, value)?;
        }
        Instr::Eqz32 { d, a } => {
            let value = (frame.lo(mem, *a)? == 0) as u32;
            frame.set_lo(mem, *d, value)?;
        }
        Instr::Cmp32 { cond, d, a, b } => {
            let value = cond.eval_i32(frame.lo(mem, *a)?, frame.lo(mem, *b)?);
            frame.set_lo(mem, *d, value as u32)?;
        }
        Instr::Bin64 { op, d, a, b } => {
            let value = arith64(*op, frame.wide(mem, *a)?, frame.wide(mem, *b)?);
            frame.set_wide(mem, *d, value)?;
        }
        Instr::Cmp64 { cond, d, a, b } => {
            let value = cond.eval_i64(frame.wide(mem, *a)?, frame.wide(mem, *b)?);
            frame.set_lo(mem, *d, value as u32)?;
        }
        Instr::Convert { conv, d, s } => {
            let value = convert(*conv, frame.wide(mem, *s)?);
            if conv.wide_result() {
                frame.set_wide(mem, *d, value)?;
            } else {
                frame.set_lo(mem, *d, value as u32)?;
            }
        }
        Instr::FloatF32 { op, d, a, b } => {
            let a = f32::from_bits(frame.lo(mem, *a)?);
            let b = f32::from_bits(frame.lo(mem, *b)?);
            frame.set_lo(mem, *d, arith_f32(*op, a, b).to_bits())?;
        }
        Instr::FloatF64 { op, d, a, b } => {
            let a = f64::from_bits(frame.wide(mem, *a)?);
            let b = f64::from_bits(frame.wide(mem, *b)?);
            frame.set_wide(mem, *d, arith_f64(*op, a, b).to_bits())?;
        }
        Instr::CmpF32 { cond, d, a, b } => {
            let a = f32::from_bits(frame.lo(mem, *a)?);
            let b = f32::from_bits(frame.lo(mem, *b)?);
            frame.set_lo(mem, *d, cmp_float(*cond, a, b) as u32)?;
        }
        Instr::CmpF64 { cond, d, a, b } => {
            let a = f64::from_bits(frame.wide(mem, *a)?);
            let b = f64::from_bits(frame.wide(mem, *b)?);
            frame.set_lo(mem, *d, cmp_float(*cond, a, b) as u32)?;
        }
        Instr::Select { d, c, a, b } => {
            let pick = if frame.lo(mem, *c)? != 0 { *a } else { *b };
            let value = frame.wide(mem, pick)?;
            frame.set_wide(mem, *d, value)?;
        }
        Instr::Load { kind, d, p, offset } => {
            let address = frame.lo(mem, *p)?.wrapping_add(*offset as u32);
            match kind {
                LoadKind::I64 => {
                    let value = mem.read_u64(address)?;
                    frame.set_wide(mem, *d, value)?;
                }
                _ => {
                    let value = match kind {
                        LoadKind::U8 => mem.read_u8(address)? as u32,
                        LoadKind::S8 => mem.read_u8(address)? as i8 as i32 as u32,
                        LoadKind::U16 => mem.read_u16(address)? as u32,
                        LoadKind::S16 => mem.read_u16(address)? as i16 as i32 as u32,
                        _ => mem.read_u32(address)?,
                    };
                    frame.set_lo(mem, *d, value)?;
                }
            }
        }
        Instr::Store { kind, s, p, offset } => {
            let address = frame.lo(mem, *p)?.wrapping_add(*offset as u32);
            let value = frame.wide(mem, *s)?;
            match kind {
                StoreKind::I32 => mem.write_u32(address, value as u32)?,
                StoreKind::I64 => mem.write_u64(address, value)?,
                StoreKind::I8 => mem.write_u8(address, value as u8)?,
                StoreKind::I16 => mem.write_u16(address, value as u16)?,
            }
        }
        Instr::MemAddr { d, offset } => {
            let address = inst.layout.memory.wrapping_add(*offset);
            frame.set_lo(mem, *d, address)?;
        }
        Instr::GlobalGet { d, index } => {
            let index = *index as u32;
            let bits = inst.global_bits(index)?;
            let wide = inst
                .module
                .globals
                .get(index as usize)
                .is_some_and(|global| global.ty.is_wide());
            if wide {
                frame.set_wide(&mut inst.mem, *d, bits)?;
            } else {
                frame.set_lo(&mut inst.mem, *d, bits as u32)?;
            }
        }
        Instr::GlobalSet { index, s } => {
            let bits = frame.wide(mem, *s)?;
            inst.set_global_bits(*index as u32, bits)?;
        }
        Instr::GlobalAddr { d, index } => {
            let address = inst.global_address(*index as u32)?;
            frame.set_lo(&mut inst.mem, *d, address)?;
        }
        Instr::MemCopy { dst, src, len } => {
            let (dst, src, len) = (
                frame.lo(mem, *dst)?,
                frame.lo(mem, *src)?,
                frame.lo(mem, *len)?,
            );
            mem.copy_within(dst, src, len)?;
        }
        Instr::MemSet { dst, val, len } => {
            let (dst, val, len) = (
                frame.lo(mem, *dst)?,
                frame.lo(mem, *val)?,
                frame.lo(mem, *len)?,
            );
            mem.fill(dst, val as u8, len)?;
        }
        Instr::TableGet { d, index } => {
            let index = frame.lo(mem, *index)?;
            let pointer = inst.table_get(index)?;
            frame.set_lo(&mut inst.mem, *d, pointer)?;
        }
        Instr::TableSet { index, s } => {
            let index = frame.lo(mem, *index)?;
            let pointer = frame.lo(mem, *s)?;
            inst.table_set(index, pointer)?;
        }
        Instr::Alloca { d, size } => {
            let size = frame.lo(mem, *size)?;
            let address = inst.alloca(size)?;
            frame.set_lo(&mut inst.mem, *d, address)?;
        }
        Instr::HeapAlloc { d, size } => {
            let size = frame.lo(mem, *size)?;
            let address = inst.heap_alloc(size);
            frame.set_lo(&mut inst.mem, *d, address)?;
        }
        Instr::HeapFree { p } => {
            let pointer = frame.lo(mem, *p)?;
            inst.heap_free(pointer);
        }
        Instr::AtomicAdd { d, p, v } => {
            let address = frame.lo(mem, *p)?;
            let addend = frame.lo(mem, *v)?;
            let old = mem.read_u32(address)?;
            mem.write_u32(address, old.wrapping_add(addend))?;
            frame.set_lo(mem, *d, old)?;
        }
        Instr::AtomicCas {
            d,
            p,
            expected,
            new,
        } => {
            let address = frame.lo(mem, *p)?;
            let expected = frame.lo(mem, *expected)?;
            let new = frame.lo(mem, *new)?;
            let old = mem.read_u32(address)?;
            if old == expected {
                mem.write_u32(address, new)?;
            }
            frame.set_lo(mem, *d, old)?;
        }
        Instr::Jmp { target } => return Ok(Flow::Jump(*target)),
        Instr::BrIf { c, target, negate } => {
            let taken = (frame.lo(mem, *c)? != 0) != *negate;
            if taken {
                return Ok(Flow::Jump(*target));
            }
        }
        Instr::BrTable {
            index,
            cases,
            default,
        } => {
            let index = frame.lo(mem, *index)? as usize;
            return Ok(Flow::Jump(cases.get(index).copied().unwrap_or(*default)));
        }
        Instr::End => return Ok(Flow::Return),
        Instr::Call { func, base } => {
            let func = *func as u32;
            let params = inst
                .module
                .function_type(func)
                .ok_or(VmError::InvalidFunction(func))?
                .params
                .len();
            let args = frame.window(*base, params)?;
            return Ok(Flow::Call { func, args });
        }
        Instr::CallIndirect { callee, base } => {
            let pointer = frame.lo(mem, *callee)?;
            let base = *base as u32;
            let func = inst.indirect_target(pointer, frame.func, base)?;
            return Ok(Flow::Call {
                func,
                args: frame.base + base * SLOT_SIZE,
            });
        }
        Instr::FuncAddr { d, func } => {
            let pointer = inst.function_pointer(*func as u32)?;
            frame.set_lo(&mut inst.mem, *d, pointer)?;
        }
        Instr::CallImport { import, base } => {
            let import = *import as u32;
            let params = inst
                .module
                .import_type(import)
                .ok_or(VmError::InvalidImport(import))?
                .params
                .len();
            let args = frame.window(*base, params)?;
            inst.call_import_slots(import, args)?;
        }
        Instr::CallImportVa { import, base, tags } => {
            let args = frame.window(*base, tags.len())?;
            inst.call_variadic_types(*import as u32, tags.clone(), args)?;
        }
    }
    Ok(Flow::Next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::BytecodeBuilder;
    use crate::bytecode::{Bin32, Cond};
    use crate::jit::JitConfig;
    use crate::module::{FuncType, ModuleBuilder};
    use crate::runtime::{Runtime, RuntimeConfig};
    use crate::value::{Value, ValueType};

    fn interpreter_only() -> Runtime {
        Runtime::new(RuntimeConfig {
            jit: JitConfig {
                enabled: false,
                ..JitConfig::default()
            },
            ..RuntimeConfig::default()
        })
    }

    #[test]
    fn loop_sums_down_to_zero() {
        // r0 = n, r1 = acc
        let mut code = BytecodeBuilder::new();
        code.const_i32(1, 0)
            .label("loop")
            .eqz_i32(2, 0)
            .br_if(2, "done")
            .add_i32(1, 1, 0)
            .addi_i32(0, 0, -1)
            .jmp("loop")
            .label("done")
            .mov(0, 1)
            .end();
        let mut builder = ModuleBuilder::new();
        builder.add_function(
            "sum",
            FuncType::new(&[ValueType::I32], &[ValueType::I32]),
            3,
            code.finish().expect("bytecode"),
            true,
        );
        let module = builder.build().expect("module");
        let mut instance = interpreter_only().instantiate(module).expect("instance");
        assert_eq!(instance.call(0, &[Value::i32(10)]), Ok(Value::i32(55)));
        assert!(!instance.is_compiled(0));
    }

    #[test]
    fn deep_recursion_runs_on_the_activation_stack() {
        let mut code = BytecodeBuilder::new();
        code.eqz_i32(1, 0)
            .br_if(1, "zero")
            .addi_i32(1, 0, -1)
            .call(0, 1)
            .addi_i32(0, 1, 1)
            .end()
            .label("zero")
            .end();
        let mut builder = ModuleBuilder::new();
        builder.add_function(
            "countdown",
            FuncType::new(&[ValueType::I32], &[ValueType::I32]),
            2,
            code.finish().expect("bytecode"),
            false,
        );
        let module = builder.build().expect("module");
        let config = RuntimeConfig {
            max_call_depth: 8_000,
            frame_arena_bytes: 160 * 1024,
            jit: JitConfig {
                enabled: false,
                ..JitConfig::default()
            },
            ..RuntimeConfig::default()
        };
        let mut instance = Runtime::new(config).instantiate(module).expect("instance");
        assert_eq!(instance.call(0, &[Value::i32(7_000)]), Ok(Value::i32(7_000)));
        assert_eq!(
            instance.call(0, &[Value::i32(9_000)]),
            Err(VmError::CallDepthExceeded(8_000))
        );
        assert_eq!(instance.call(0, &[Value::i32(3)]), Ok(Value::i32(3)));
    }

    #[test]
    fn register_outside_the_file_is_an_error() {
        let mut code = BytecodeBuilder::new();
        code.bin32(Bin32::Add, 0, 0, 7).end();
        let mut builder = ModuleBuilder::new();
        builder.add_function(
            "bad",
            FuncType::new(&[ValueType::I32], &[ValueType::I32]),
            2,
            code.finish().expect("bytecode"),
            false,
        );
        let module = builder.build().expect("module");
        let mut instance = interpreter_only().instantiate(module).expect("instance");
        assert_eq!(
            instance.call(0, &[Value::i32(1)]),
            Err(VmError::InvalidRegister {
                function: 0,
                register: 7
            })
        );
    }

    #[test]
    fn unknown_opcode_fails_at_run_time() {
        let mut builder = ModuleBuilder::new();
        builder.add_function(
            "broken",
            FuncType::new(&[], &[ValueType::I32]),
            1,
            vec![0x02, 0x00, 0x05, 0x00, 0x00, 0x00, 0xEE],
            false,
        );
        let module = builder.build().expect("module");
        let mut instance = interpreter_only().instantiate(module).expect("instance");
        assert_eq!(
            instance.call(0, &[]),
            Err(VmError::InvalidOpcode {
                offset: 6,
                opcode: 0xEE
            })
        );
    }

    #[test]
    fn comparisons_write_zero_or_one() {
        let mut code = BytecodeBuilder::new();
        code.cmp_i32(Cond::LtS, 0, 0, 1).end();
        let mut builder = ModuleBuilder::new();
        builder.add_function(
            "lt",
            FuncType::new(&[ValueType::I32, ValueType::I32], &[ValueType::I32]),
            2,
            code.finish().expect("bytecode"),
            false,
        );
        let module = builder.build().expect("module");
        let mut instance = interpreter_only().instantiate(module).expect("instance");
        assert_eq!(
            instance.call(0, &[Value::i32(-3), Value::i32(2)]),
            Ok(Value::i32(1))
        );
        assert_eq!(
            instance.call(0, &[Value::i32(3), Value::i32(2)]),
            Ok(Value::i32(0))
        );
    }
}
