use std::collections::HashMap;

use crate::bytecode::{Bin32, Bin64, Cond, Conv, FloatCond, FloatOp, LoadKind, OpCode, StoreKind};
use crate::value::ValueType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblerError {
    DuplicateLabel(String),
    UnknownLabel(String),
    TooManyCases(usize),
    TooManyVariadicArgs(usize),
}

impl std::fmt::Display for AssemblerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssemblerError::DuplicateLabel(name) => write!(f, "duplicate label '{name}'"),
            AssemblerError::UnknownLabel(name) => write!(f, "unknown label '{name}'"),
            AssemblerError::TooManyCases(count) => {
                write!(f, "br_table with {count} cases exceeds u16")
            }
            AssemblerError::TooManyVariadicArgs(count) => {
                write!(f, "variadic call with {count} arguments exceeds u8")
            }
        }
    }
}

impl std::error::Error for AssemblerError {}

/// A branch offset awaiting its label. `base` is the position the stored
/// offset is relative to.
struct Fixup {
    at: usize,
    base: usize,
    label: String,
}

/// Assembles one function body. Branches name labels; offsets are patched in
/// `finish`.
#[derive(Default)]
pub struct BytecodeBuilder {
    code: Vec<u8>,
    labels: HashMap<String, usize>,
    fixups: Vec<Fixup>,
    error: Option<AssemblerError>,
}

impl BytecodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> usize {
        self.code.len()
    }

    pub fn label(&mut self, name: &str) -> &mut Self {
        if self.labels.contains_key(name) {
            self.record_error(AssemblerError::DuplicateLabel(name.to_string()));
        } else {
            self.labels.insert(name.to_string(), self.code.len());
        }
        self
    }

    pub fn finish(mut self) -> Result<Vec<u8>, AssemblerError> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }
        for fixup in self.fixups.drain(..) {
            let target = self
                .labels
                .get(&fixup.label)
                .copied()
                .ok_or_else(|| AssemblerError::UnknownLabel(fixup.label.clone()))?;
            let rel = (target as i64 - fixup.base as i64) as i32;
            self.code[fixup.at..fixup.at + 4].copy_from_slice(&rel.to_le_bytes());
        }
        Ok(self.code)
    }

    /// Appends raw bytes, for hand-built or deliberately malformed bodies.
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.code.extend_from_slice(bytes);
        self
    }

    pub fn nop(&mut self) -> &mut Self {
        self.emit_opcode(OpCode::Nop)
    }

    pub fn mov(&mut self, d: u8, s: u8) -> &mut Self {
        self.emit_opcode(OpCode::Mov).emit_u8(d).emit_u8(s)
    }

    pub fn const_i32(&mut self, d: u8, value: i32) -> &mut Self {
        self.emit_opcode(OpCode::ConstI32)
            .emit_u8(d)
            .emit_u32(value as u32)
    }

    pub fn const_i64(&mut self, d: u8, value: i64) -> &mut Self {
        self.emit_opcode(OpCode::ConstI64)
            .emit_u8(d)
            .emit_u64(value as u64)
    }

    pub fn const_f32(&mut self, d: u8, value: f32) -> &mut Self {
        self.emit_opcode(OpCode::ConstF32)
            .emit_u8(d)
            .emit_u32(value.to_bits())
    }

    pub fn const_f64(&mut self, d: u8, value: f64) -> &mut Self {
        self.emit_opcode(OpCode::ConstF64)
            .emit_u8(d)
            .emit_u64(value.to_bits())
    }

    pub fn bin32(&mut self, op: Bin32, d: u8, a: u8, b: u8) -> &mut Self {
        let opcode = match op {
            Bin32::Add => OpCode::AddI32,
            Bin32::Sub => OpCode::SubI32,
            Bin32::Mul => OpCode::MulI32,
            Bin32::And => OpCode::AndI32,
            Bin32::Or => OpCode::OrI32,
            Bin32::Xor => OpCode::XorI32,
            Bin32::Shl => OpCode::ShlI32,
            Bin32::ShrS => OpCode::ShrSI32,
            Bin32::ShrU => OpCode::ShrUI32,
            Bin32::DivS => OpCode::DivSI32,
            Bin32::DivU => OpCode::DivUI32,
            Bin32::RemS => OpCode::RemSI32,
            Bin32::RemU => OpCode::RemUI32,
        };
        self.emit_opcode(opcode).emit_regs(&[d, a, b])
    }

    pub fn add_i32(&mut self, d: u8, a: u8, b: u8) -> &mut Self {
        self.bin32(Bin32::Add, d, a, b)
    }

    pub fn sub_i32(&mut self, d: u8, a: u8, b: u8) -> &mut Self {
        self.bin32(Bin32::Sub, d, a, b)
    }

    pub fn addi_i32(&mut self, d: u8, a: u8, imm: i8) -> &mut Self {
        self.emit_opcode(OpCode::AddiI32)
            .emit_u8(d)
            .emit_u8(a)
            .emit_u8(imm as u8)
    }

    pub fn eqz_i32(&mut self, d: u8, a: u8) -> &mut Self {
        self.emit_opcode(OpCode::EqzI32).emit_u8(d).emit_u8(a)
    }

    pub fn cmp_i32(&mut self, cond: Cond, d: u8, a: u8, b: u8) -> &mut Self {
        self.emit_u8(OpCode::EqI32 as u8 + cond as u8)
            .emit_regs(&[d, a, b])
    }

    pub fn bin64(&mut self, op: Bin64, d: u8, a: u8, b: u8) -> &mut Self {
        let opcode = match op {
            Bin64::Add => OpCode::AddI64,
            Bin64::Sub => OpCode::SubI64,
            Bin64::Mul => OpCode::MulI64,
            Bin64::And => OpCode::AndI64,
            Bin64::Or => OpCode::OrI64,
            Bin64::Xor => OpCode::XorI64,
            Bin64::Shl => OpCode::ShlI64,
            Bin64::ShrS => OpCode::ShrSI64,
            Bin64::ShrU => OpCode::ShrUI64,
            Bin64::DivS => OpCode::DivSI64,
            Bin64::DivU => OpCode::DivUI64,
            Bin64::RemS => OpCode::RemSI64,
            Bin64::RemU => OpCode::RemUI64,
        };
        self.emit_opcode(opcode).emit_regs(&[d, a, b])
    }

    pub fn cmp_i64(&mut self, cond: Cond, d: u8, a: u8, b: u8) -> &mut Self {
        self.emit_u8(OpCode::EqI64 as u8 + cond as u8)
            .emit_regs(&[d, a, b])
    }

    pub fn convert(&mut self, conv: Conv, d: u8, s: u8) -> &mut Self {
        self.emit_u8(OpCode::ExtendI32S as u8 + conv as u8)
            .emit_u8(d)
            .emit_u8(s)
    }

    pub fn float_f32(&mut self, op: FloatOp, d: u8, a: u8, b: u8) -> &mut Self {
        self.emit_u8(OpCode::AddF32 as u8 + float_index(op))
            .emit_regs(&[d, a, b])
    }

    pub fn float_f64(&mut self, op: FloatOp, d: u8, a: u8, b: u8) -> &mut Self {
        self.emit_u8(OpCode::AddF64 as u8 + float_index(op))
            .emit_regs(&[d, a, b])
    }

    pub fn cmp_f32(&mut self, cond: FloatCond, d: u8, a: u8, b: u8) -> &mut Self {
        self.emit_u8(OpCode::EqF32 as u8 + cond as u8)
            .emit_regs(&[d, a, b])
    }

    pub fn cmp_f64(&mut self, cond: FloatCond, d: u8, a: u8, b: u8) -> &mut Self {
        self.emit_u8(OpCode::EqF64 as u8 + cond as u8)
            .emit_regs(&[d, a, b])
    }

    pub fn select(&mut self, d: u8, c: u8, a: u8, b: u8) -> &mut Self {
        self.emit_opcode(OpCode::Select).emit_regs(&[d, c, a, b])
    }

    pub fn load(&mut self, kind: LoadKind, d: u8, p: u8, offset: u16) -> &mut Self {
        let opcode = match kind {
            LoadKind::I32 => OpCode::LoadI32,
            LoadKind::I64 => OpCode::LoadI64,
            LoadKind::U8 => OpCode::LoadU8,
            LoadKind::S8 => OpCode::LoadS8,
            LoadKind::U16 => OpCode::LoadU16,
            LoadKind::S16 => OpCode::LoadS16,
        };
        self.emit_opcode(opcode)
            .emit_u8(d)
            .emit_u8(p)
            .emit_u16(offset)
    }

    pub fn store(&mut self, kind: StoreKind, s: u8, p: u8, offset: u16) -> &mut Self {
        let opcode = match kind {
            StoreKind::I32 => OpCode::StoreI32,
            StoreKind::I64 => OpCode::StoreI64,
            StoreKind::I8 => OpCode::StoreI8,
            StoreKind::I16 => OpCode::StoreI16,
        };
        self.emit_opcode(opcode)
            .emit_u8(s)
            .emit_u8(p)
            .emit_u16(offset)
    }

    pub fn mem_addr(&mut self, d: u8, offset: u32) -> &mut Self {
        self.emit_opcode(OpCode::MemAddr).emit_u8(d).emit_u32(offset)
    }

    pub fn global_get(&mut self, d: u8, index: u16) -> &mut Self {
        self.emit_opcode(OpCode::GlobalGet).emit_u8(d).emit_u16(index)
    }

    pub fn global_set(&mut self, index: u16, s: u8) -> &mut Self {
        self.emit_opcode(OpCode::GlobalSet).emit_u16(index).emit_u8(s)
    }

    pub fn global_addr(&mut self, d: u8, index: u16) -> &mut Self {
        self.emit_opcode(OpCode::GlobalAddr)
            .emit_u8(d)
            .emit_u16(index)
    }

    pub fn memcpy(&mut self, dst: u8, src: u8, len: u8) -> &mut Self {
        self.emit_opcode(OpCode::MemCopy).emit_regs(&[dst, src, len])
    }

    pub fn memset(&mut self, dst: u8, val: u8, len: u8) -> &mut Self {
        self.emit_opcode(OpCode::MemSet).emit_regs(&[dst, val, len])
    }

    pub fn table_get(&mut self, d: u8, index: u8) -> &mut Self {
        self.emit_opcode(OpCode::TableGet).emit_u8(d).emit_u8(index)
    }

    pub fn table_set(&mut self, index: u8, s: u8) -> &mut Self {
        self.emit_opcode(OpCode::TableSet).emit_u8(index).emit_u8(s)
    }

    pub fn alloca(&mut self, d: u8, size: u8) -> &mut Self {
        self.emit_opcode(OpCode::Alloca).emit_u8(d).emit_u8(size)
    }

    pub fn heap_alloc(&mut self, d: u8, size: u8) -> &mut Self {
        self.emit_opcode(OpCode::HeapAlloc).emit_u8(d).emit_u8(size)
    }

    pub fn heap_free(&mut self, p: u8) -> &mut Self {
        self.emit_opcode(OpCode::HeapFree).emit_u8(p)
    }

    pub fn atomic_add_i32(&mut self, d: u8, p: u8, v: u8) -> &mut Self {
        self.emit_opcode(OpCode::AtomicAddI32).emit_regs(&[d, p, v])
    }

    pub fn atomic_cas_i32(&mut self, d: u8, p: u8, expected: u8, new: u8) -> &mut Self {
        self.emit_opcode(OpCode::AtomicCasI32)
            .emit_regs(&[d, p, expected, new])
    }

    pub fn jmp(&mut self, label: &str) -> &mut Self {
        self.emit_opcode(OpCode::Jmp);
        let at = self.code.len();
        self.emit_u32(0);
        self.fixups.push(Fixup {
            at,
            base: at + 4,
            label: label.to_string(),
        });
        self
    }

    pub fn br_if(&mut self, c: u8, label: &str) -> &mut Self {
        self.emit_cond_branch(OpCode::BrIf, c, label)
    }

    pub fn br_if_not(&mut self, c: u8, label: &str) -> &mut Self {
        self.emit_cond_branch(OpCode::BrIfNot, c, label)
    }

    pub fn br_table(&mut self, index: u8, cases: &[&str], default: &str) -> &mut Self {
        let Ok(count) = u16::try_from(cases.len()) else {
            self.record_error(AssemblerError::TooManyCases(cases.len()));
            return self;
        };
        self.emit_opcode(OpCode::BrTable)
            .emit_u8(index)
            .emit_u16(count);
        let first = self.code.len();
        let base = first + 4 * (cases.len() + 1);
        for (i, label) in cases.iter().chain(std::iter::once(&default)).enumerate() {
            self.fixups.push(Fixup {
                at: first + 4 * i,
                base,
                label: label.to_string(),
            });
            self.emit_u32(0);
        }
        self
    }

    pub fn end(&mut self) -> &mut Self {
        self.emit_opcode(OpCode::End)
    }

    pub fn call(&mut self, func: u16, base: u8) -> &mut Self {
        self.emit_opcode(OpCode::Call).emit_u16(func).emit_u8(base)
    }

    pub fn call_indirect(&mut self, callee: u8, base: u8) -> &mut Self {
        self.emit_opcode(OpCode::CallIndirect)
            .emit_u8(callee)
            .emit_u8(base)
    }

    pub fn func_addr(&mut self, d: u8, func: u16) -> &mut Self {
        self.emit_opcode(OpCode::FuncAddr).emit_u8(d).emit_u16(func)
    }

    pub fn call_import(&mut self, import: u16, base: u8) -> &mut Self {
        self.emit_opcode(OpCode::CallImport)
            .emit_u16(import)
            .emit_u8(base)
    }

    pub fn call_import_va(&mut self, import: u16, base: u8, tags: &[ValueType]) -> &mut Self {
        let Ok(count) = u8::try_from(tags.len()) else {
            self.record_error(AssemblerError::TooManyVariadicArgs(tags.len()));
            return self;
        };
        self.emit_opcode(OpCode::CallImportVa)
            .emit_u16(import)
            .emit_u8(base)
            .emit_u8(count);
        for ty in tags {
            self.emit_u8(ty.tag());
        }
        self
    }

    fn emit_cond_branch(&mut self, opcode: OpCode, c: u8, label: &str) -> &mut Self {
        self.emit_opcode(opcode).emit_u8(c);
        let at = self.code.len();
        self.emit_u32(0);
        self.fixups.push(Fixup {
            at,
            base: at + 4,
            label: label.to_string(),
        });
        self
    }

    fn record_error(&mut self, error: AssemblerError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    fn emit_regs(&mut self, regs: &[u8]) -> &mut Self {
        self.code.extend_from_slice(regs);
        self
    }

    fn emit_opcode(&mut self, opcode: OpCode) -> &mut Self {
        self.code.push(opcode as u8);
        self
    }

    fn emit_u8(&mut self, value: u8) -> &mut Self {
        self.code.push(value);
        self
    }

    fn emit_u16(&mut self, value: u16) -> &mut Self {
        self.code.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn emit_u32(&mut self, value: u32) -> &mut Self {
        self.code.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn emit_u64(&mut self, value: u64) -> &mut Self {
        self.code.extend_from_slice(&value.to_le_bytes());
        self
    }
}

fn float_index(op: FloatOp) -> u8 {
    match op {
        FloatOp::Add => 0,
        FloatOp::Sub => 1,
        FloatOp::Mul => 2,
        FloatOp::Div => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Instr, decode, decode_all};

    #[test]
    fn forward_and_backward_labels_decode_to_absolute_targets() {
        let mut b = BytecodeBuilder::new();
        b.label("top")
            .br_if(0, "out")
            .jmp("top")
            .label("out")
            .end();
        let code = b.finish().expect("assemble");
        let instrs = decode_all(&code).expect("decode");
        assert_eq!(
            instrs[0].1,
            Instr::BrIf {
                c: 0,
                target: 11,
                negate: false
            }
        );
        assert_eq!(instrs[1].1, Instr::Jmp { target: 0 });
        assert_eq!(instrs[2], (11, Instr::End));
    }

    #[test]
    fn br_table_targets_every_label() {
        let mut b = BytecodeBuilder::new();
        b.br_table(1, &["a", "b"], "d")
            .label("a")
            .nop()
            .label("b")
            .nop()
            .label("d")
            .end();
        let code = b.finish().expect("assemble");
        let (instr, next) = decode(&code, 0).expect("decode");
        assert_eq!(
            instr,
            Instr::BrTable {
                index: 1,
                cases: vec![next, next + 1],
                default: next + 2,
            }
        );
    }

    #[test]
    fn unknown_and_duplicate_labels_are_errors() {
        let mut b = BytecodeBuilder::new();
        b.jmp("nowhere");
        assert_eq!(
            b.finish(),
            Err(AssemblerError::UnknownLabel("nowhere".to_string()))
        );

        let mut b = BytecodeBuilder::new();
        b.label("x").label("x");
        assert_eq!(
            b.finish(),
            Err(AssemblerError::DuplicateLabel("x".to_string()))
        );
    }
}
