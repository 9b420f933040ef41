use crate::error::VmError;
use crate::value::ValueType;

/// Opcode bytes of the register bytecode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Nop = 0x00,
    Mov = 0x01,
    ConstI32 = 0x02,
    ConstI64 = 0x03,
    ConstF32 = 0x04,
    ConstF64 = 0x05,

    AddI32 = 0x10,
    SubI32 = 0x11,
    MulI32 = 0x12,
    AndI32 = 0x13,
    OrI32 = 0x14,
    XorI32 = 0x15,
    ShlI32 = 0x16,
    ShrSI32 = 0x17,
    ShrUI32 = 0x18,
    DivSI32 = 0x19,
    DivUI32 = 0x1A,
    RemSI32 = 0x1B,
    RemUI32 = 0x1C,
    AddiI32 = 0x1D,
    EqzI32 = 0x1E,

    EqI32 = 0x20,
    NeI32 = 0x21,
    LtSI32 = 0x22,
    LtUI32 = 0x23,
    GtSI32 = 0x24,
    GtUI32 = 0x25,
    LeSI32 = 0x26,
    LeUI32 = 0x27,
    GeSI32 = 0x28,
    GeUI32 = 0x29,

    AddI64 = 0x30,
    SubI64 = 0x31,
    MulI64 = 0x32,
    AndI64 = 0x33,
    OrI64 = 0x34,
    XorI64 = 0x35,
    ShlI64 = 0x36,
    ShrSI64 = 0x37,
    ShrUI64 = 0x38,
    DivSI64 = 0x39,
    DivUI64 = 0x3A,
    RemSI64 = 0x3B,
    RemUI64 = 0x3C,

    EqI64 = 0x40,
    NeI64 = 0x41,
    LtSI64 = 0x42,
    LtUI64 = 0x43,
    GtSI64 = 0x44,
    GtUI64 = 0x45,
    LeSI64 = 0x46,
    LeUI64 = 0x47,
    GeSI64 = 0x48,
    GeUI64 = 0x49,

    ExtendI32S = 0x50,
    ExtendI32U = 0x51,
    WrapI64 = 0x52,
    Sext8 = 0x53,
    Sext16 = 0x54,
    Zext8 = 0x55,
    Zext16 = 0x56,
    I32ToF32 = 0x57,
    F32ToI32 = 0x58,
    I32ToF64 = 0x59,
    F64ToI32 = 0x5A,
    I64ToF64 = 0x5B,
    F64ToI64 = 0x5C,
    F32ToF64 = 0x5D,
    F64ToF32 = 0x5E,

    AddF32 = 0x60,
    SubF32 = 0x61,
    MulF32 = 0x62,
    DivF32 = 0x63,
    AddF64 = 0x64,
    SubF64 = 0x65,
    MulF64 = 0x66,
    DivF64 = 0x67,
    EqF32 = 0x68,
    LtF32 = 0x69,
    LeF32 = 0x6A,
    EqF64 = 0x6B,
    LtF64 = 0x6C,
    LeF64 = 0x6D,

    Select = 0x70,

    LoadI32 = 0x80,
    LoadI64 = 0x81,
    LoadU8 = 0x82,
    LoadS8 = 0x83,
    LoadU16 = 0x84,
    LoadS16 = 0x85,
    StoreI32 = 0x86,
    StoreI64 = 0x87,
    StoreI8 = 0x88,
    StoreI16 = 0x89,
    MemAddr = 0x8A,

    GlobalGet = 0x90,
    GlobalSet = 0x91,
    GlobalAddr = 0x92,
    MemCopy = 0x93,
    MemSet = 0x94,
    TableGet = 0x95,
    TableSet = 0x96,
    Alloca = 0x97,
    HeapAlloc = 0x98,
    HeapFree = 0x99,
    AtomicAddI32 = 0x9A,
    AtomicCasI32 = 0x9B,

    Jmp = 0xA0,
    BrIf = 0xA1,
    BrIfNot = 0xA2,
    BrTable = 0xA3,
    End = 0xA4,

    Call = 0xB0,
    CallIndirect = 0xB1,
    FuncAddr = 0xB2,
    CallImport = 0xB3,
    CallImportVa = 0xB4,
}

impl OpCode {
    pub fn from_u8(byte: u8) -> Option<Self> {
        use OpCode::*;
        let op = match byte {
            0x00 => Nop,
            0x01 => Mov,
            0x02 => ConstI32,
            0x03 => ConstI64,
            0x04 => ConstF32,
            0x05 => ConstF64,
            0x10 => AddI32,
            0x11 => SubI32,
            0x12 => MulI32,
            0x13 => AndI32,
            0x14 => OrI32,
            0x15 => XorI32,
            0x16 => ShlI32,
            0x17 => ShrSI32,
            0x18 => ShrUI32,
            0x19 => DivSI32,
            0x1A => DivUI32,
            0x1B => RemSI32,
            0x1C => RemUI32,
            0x1D => AddiI32,
            0x1E => EqzI32,
            0x20 => EqI32,
            0x21 => NeI32,
            0x22 => LtSI32,
            0x23 => LtUI32,
            0x24 => GtSI32,
            0x25 => GtUI32,
            0x26 => LeSI32,
            0x27 => LeUI32,
            0x28 => GeSI32,
            0x29 => GeUI32,
            0x30 => AddI64,
            0x31 => SubI64,
            0x32 => MulI64,
            0x33 => AndI64,
            0x34 => OrI64,
            0x35 => XorI64,
            0x36 => ShlI64,
            0x37 => ShrSI64,
            0x38 => ShrUI64,
            0x39 => DivSI64,
            0x3A => DivUI64,
            0x3B => RemSI64,
            0x3C => RemUI64,
            0x40 => EqI64,
            0x41 => NeI64,
            0x42 => LtSI64,
            0x43 => LtUI64,
            0x44 => GtSI64,
            0x45 => GtUI64,
            0x46 => LeSI64,
            0x47 => LeUI64,
            0x48 => GeSI64,
            0x49 => GeUI64,
            0x50 => ExtendI32S,
            0x51 => ExtendI32U,
            0x52 => WrapI64,
            0x53 => Sext8,
            0x54 => Sext16,
            0x55 => Zext8,
            0x56 => Zext16,
            0x57 => I32ToF32,
            0x58 => F32ToI32,
            0x59 => I32ToF64,
            0x5A => F64ToI32,
            0x5B => I64ToF64,
            0x5C => F64ToI64,
            0x5D => F32ToF64,
            0x5E => F64ToF32,
            0x60 => AddF32,
            0x61 => SubF32,
            0x62 => MulF32,
            0x63 => DivF32,
            0x64 => AddF64,
            0x65 => SubF64,
            0x66 => MulF64,
            0x67 => DivF64,
            0x68 => EqF32,
            0x69 => LtF32,
            0x6A => LeF32,
            0x6B => EqF64,
            0x6C => LtF64,
            0x6D => LeF64,
            0x70 => Select,
            0x80 => LoadI32,
            0x81 => LoadI64,
            0x82 => LoadU8,
            0x83 => LoadS8,
            0x84 => LoadU16,
            0x85 => LoadS16,
            0x86 => StoreI32,
            0x87 => StoreI64,
            0x88 => StoreI8,
            0x89 => StoreI16,
            0x8A => MemAddr,
            0x90 => GlobalGet,
            0x91 => GlobalSet,
            0x92 => GlobalAddr,
            0x93 => MemCopy,
            0x94 => MemSet,
            0x95 => TableGet,
            0x96 => TableSet,
            0x97 => Alloca,
            0x98 => HeapAlloc,
            0x99 => HeapFree,
            0x9A => AtomicAddI32,
            0x9B => AtomicCasI32,
            0xA0 => Jmp,
            0xA1 => BrIf,
            0xA2 => BrIfNot,
            0xA3 => BrTable,
            0xA4 => End,
            0xB0 => Call,
            0xB1 => CallIndirect,
            0xB2 => FuncAddr,
            0xB3 => CallImport,
            0xB4 => CallImportVa,
            _ => return None,
        };
        Some(op)
    }

    pub fn mnemonic(self) -> &'static str {
        use OpCode::*;
        match self {
            Nop => "nop",
            Mov => "mov",
            ConstI32 => "const.i32",
            ConstI64 => "const.i64",
            ConstF32 => "const.f32",
            ConstF64 => "const.f64",
            AddI32 => "add.i32",
            SubI32 => "sub.i32",
            MulI32 => "mul.i32",
            AndI32 => "and.i32",
            OrI32 => "or.i32",
            XorI32 => "xor.i32",
            ShlI32 => "shl.i32",
            ShrSI32 => "shr_s.i32",
            ShrUI32 => "shr_u.i32",
            DivSI32 => "div_s.i32",
            DivUI32 => "div_u.i32",
            RemSI32 => "rem_s.i32",
            RemUI32 => "rem_u.i32",
            AddiI32 => "addi.i32",
            EqzI32 => "eqz.i32",
            EqI32 => "eq.i32",
            NeI32 => "ne.i32",
            LtSI32 => "lt_s.i32",
            LtUI32 => "lt_u.i32",
            GtSI32 => "gt_s.i32",
            GtUI32 => "gt_u.i32",
            LeSI32 => "le_s.i32",
            LeUI32 => "le_u.i32",
            GeSI32 => "ge_s.i32",
            GeUI32 => "ge_u.i32",
            AddI64 => "add.i64",
            SubI64 => "sub.i64",
            MulI64 => "mul.i64",
            AndI64 => "and.i64",
            OrI64 => "or.i64",
            XorI64 => "xor.i64",
            ShlI64 => "shl.i64",
            ShrSI64 => "shr_s.i64",
            ShrUI64 => "shr_u.i64",
            DivSI64 => "div_s.i64",
            DivUI64 => "div_u.i64",
            RemSI64 => "rem_s.i64",
            RemUI64 => "rem_u.i64",
            EqI64 => "eq.i64",
            NeI64 => "ne.i64",
            LtSI64 => "lt_s.i64",
            LtUI64 => "lt_u.i64",
            GtSI64 => "gt_s.i64",
            GtUI64 => "gt_u.i64",
            LeSI64 => "le_s.i64",
            LeUI64 => "le_u.i64",
            GeSI64 => "ge_s.i64",
            GeUI64 => "ge_u.i64",
            ExtendI32S => "extend_s.i32",
            ExtendI32U => "extend_u.i32",
            WrapI64 => "wrap.i64",
            Sext8 => "sext8",
            Sext16 => "sext16",
            Zext8 => "zext8",
            Zext16 => "zext16",
            I32ToF32 => "i32_to_f32",
            F32ToI32 => "f32_to_i32",
            I32ToF64 => "i32_to_f64",
            F64ToI32 => "f64_to_i32",
            I64ToF64 => "i64_to_f64",
            F64ToI64 => "f64_to_i64",
            F32ToF64 => "f32_to_f64",
            F64ToF32 => "f64_to_f32",
            AddF32 => "add.f32",
            SubF32 => "sub.f32",
            MulF32 => "mul.f32",
            DivF32 => "div.f32",
            AddF64 => "add.f64",
            SubF64 => "sub.f64",
            MulF64 => "mul.f64",
            DivF64 => "div.f64",
            EqF32 => "eq.f32",
            LtF32 => "lt.f32",
            LeF32 => "le.f32",
            EqF64 => "eq.f64",
            LtF64 => "lt.f64",
            LeF64 => "le.f64",
            Select => "select",
            LoadI32 => "load.i32",
            LoadI64 => "load.i64",
            LoadU8 => "load.u8",
            LoadS8 => "load.s8",
            LoadU16 => "load.u16",
            LoadS16 => "load.s16",
            StoreI32 => "store.i32",
            StoreI64 => "store.i64",
            StoreI8 => "store.i8",
            StoreI16 => "store.i16",
            MemAddr => "mem_addr",
            GlobalGet => "global.get",
            GlobalSet => "global.set",
            GlobalAddr => "global.addr",
            MemCopy => "memcpy",
            MemSet => "memset",
            TableGet => "table.get",
            TableSet => "table.set",
            Alloca => "alloca",
            HeapAlloc => "heap.alloc",
            HeapFree => "heap.free",
            AtomicAddI32 => "atomic.add.i32",
            AtomicCasI32 => "atomic.cas.i32",
            Jmp => "jmp",
            BrIf => "br_if",
            BrIfNot => "br_if_not",
            BrTable => "br_table",
            End => "end",
            Call => "call",
            CallIndirect => "call_indirect",
            FuncAddr => "func_addr",
            CallImport => "call_import",
            CallImportVa => "call_import_va",
        }
    }
}

/// Integer comparison condition. The numeric value is passed to the 64-bit
/// compare helper.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    Eq = 0,
    Ne = 1,
    LtS = 2,
    LtU = 3,
    GtS = 4,
    GtU = 5,
    LeS = 6,
    LeU = 7,
    GeS = 8,
    GeU = 9,
}

impl Cond {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Cond::Eq),
            1 => Some(Cond::Ne),
            2 => Some(Cond::LtS),
            3 => Some(Cond::LtU),
            4 => Some(Cond::GtS),
            5 => Some(Cond::GtU),
            6 => Some(Cond::LeS),
            7 => Some(Cond::LeU),
            8 => Some(Cond::GeS),
            9 => Some(Cond::GeU),
            _ => None,
        }
    }

    pub fn eval_i32(self, a: u32, b: u32) -> bool {
        let (sa, sb) = (a as i32, b as i32);
        match self {
            Cond::Eq => a == b,
            Cond::Ne => a != b,
            Cond::LtS => sa < sb,
            Cond::LtU => a < b,
            Cond::GtS => sa > sb,
            Cond::GtU => a > b,
            Cond::LeS => sa <= sb,
            Cond::LeU => a <= b,
            Cond::GeS => sa >= sb,
            Cond::GeU => a >= b,
        }
    }

    pub fn eval_i64(self, a: u64, b: u64) -> bool {
        let (sa, sb) = (a as i64, b as i64);
        match self {
            Cond::Eq => a == b,
            Cond::Ne => a != b,
            Cond::LtS => sa < sb,
            Cond::LtU => a < b,
            Cond::GtS => sa > sb,
            Cond::GtU => a > b,
            Cond::LeS => sa <= sb,
            Cond::LeU => a <= b,
            Cond::GeS => sa >= sb,
            Cond::GeU => a >= b,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FloatCond {
    Eq = 0,
    Lt = 1,
    Le = 2,
}

impl FloatCond {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(FloatCond::Eq),
            1 => Some(FloatCond::Lt),
            2 => Some(FloatCond::Le),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bin32 {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    ShrS,
    ShrU,
    DivS,
    DivU,
    RemS,
    RemU,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bin64 {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    ShrS,
    ShrU,
    DivS,
    DivU,
    RemS,
    RemU,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FloatOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Conversions. The numeric value of the float conversions is passed to the
/// conversion helper.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Conv {
    ExtendI32S = 0,
    ExtendI32U = 1,
    WrapI64 = 2,
    Sext8 = 3,
    Sext16 = 4,
    Zext8 = 5,
    Zext16 = 6,
    I32ToF32 = 7,
    F32ToI32 = 8,
    I32ToF64 = 9,
    F64ToI32 = 10,
    I64ToF64 = 11,
    F64ToI64 = 12,
    F32ToF64 = 13,
    F64ToF32 = 14,
}

impl Conv {
    pub fn from_u8(value: u8) -> Option<Self> {
        use Conv::*;
        let conv = match value {
            0 => ExtendI32S,
            1 => ExtendI32U,
            2 => WrapI64,
            3 => Sext8,
            4 => Sext16,
            5 => Zext8,
            6 => Zext16,
            7 => I32ToF32,
            8 => F32ToI32,
            9 => I32ToF64,
            10 => F64ToI32,
            11 => I64ToF64,
            12 => F64ToI64,
            13 => F32ToF64,
            14 => F64ToF32,
            _ => return None,
        };
        Some(conv)
    }

    /// Whether the result fills the whole slot.
    pub fn wide_result(self) -> bool {
        matches!(
            self,
            Conv::ExtendI32S | Conv::ExtendI32U | Conv::I32ToF64 | Conv::I64ToF64 | Conv::F64ToI64
                | Conv::F32ToF64
        )
    }

    pub fn is_float(self) -> bool {
        (self as u8) >= Conv::I32ToF32 as u8
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadKind {
    I32,
    I64,
    U8,
    S8,
    U16,
    S16,
}

impl LoadKind {
    pub fn width(self) -> u8 {
        match self {
            LoadKind::I32 => 4,
            LoadKind::I64 => 8,
            LoadKind::U8 | LoadKind::S8 => 1,
            LoadKind::U16 | LoadKind::S16 => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreKind {
    I32,
    I64,
    I8,
    I16,
}

impl StoreKind {
    pub fn width(self) -> u8 {
        match self {
            StoreKind::I32 => 4,
            StoreKind::I64 => 8,
            StoreKind::I8 => 1,
            StoreKind::I16 => 2,
        }
    }
}

/// One decoded instruction. Branch targets are absolute bytecode offsets.
#[derive(Clone, Debug, PartialEq)]
pub enum Instr {
    Nop,
    Mov { d: u8, s: u8 },
    Const32 { d: u8, value: u32 },
    Const64 { d: u8, value: u64 },
    Bin32 { op: Bin32, d: u8, a: u8, b: u8 },
    AddImm32 { d: u8, a: u8, imm: i8 },
    Eqz32 { d: u8, a: u8 },
    Cmp32 { cond: Cond, d: u8, a: u8, b: u8 },
    Bin64 { op: Bin64, d: u8, a: u8, b: u8 },
    Cmp64 { cond: Cond, d: u8, a: u8, b: u8 },
    Convert { conv: Conv, d: u8, s: u8 },
    FloatF32 { op: FloatOp, d: u8, a: u8, b: u8 },
    FloatF64 { op: FloatOp, d: u8, a: u8, b: u8 },
    CmpF32 { cond: FloatCond, d: u8, a: u8, b: u8 },
    CmpF64 { cond: FloatCond, d: u8, a: u8, b: u8 },
    Select { d: u8, c: u8, a: u8, b: u8 },
    Load { kind: LoadKind, d: u8, p: u8, offset: u16 },
    Store { kind: StoreKind, s: u8, p: u8, offset: u16 },
    MemAddr { d: u8, offset: u32 },
    GlobalGet { d: u8, index: u16 },
    GlobalSet { index: u16, s: u8 },
    GlobalAddr { d: u8, index: u16 },
    MemCopy { dst: u8, src: u8, len: u8 },
    MemSet { dst: u8, val: u8, len: u8 },
    TableGet { d: u8, index: u8 },
    TableSet { index: u8, s: u8 },
    Alloca { d: u8, size: u8 },
    HeapAlloc { d: u8, size: u8 },
    HeapFree { p: u8 },
    AtomicAdd { d: u8, p: u8, v: u8 },
    AtomicCas { d: u8, p: u8, expected: u8, new: u8 },
    Jmp { target: usize },
    BrIf { c: u8, target: usize, negate: bool },
    BrTable { index: u8, cases: Vec<usize>, default: usize },
    End,
    Call { func: u16, base: u8 },
    CallIndirect { callee: u8, base: u8 },
    FuncAddr { d: u8, func: u16 },
    CallImport { import: u16, base: u8 },
    CallImportVa { import: u16, base: u8, tags: Vec<ValueType> },
}

impl Instr {
    /// Whether control never falls through to the next instruction.
    pub fn is_terminator(&self) -> bool {
        matches!(self, Instr::Jmp { .. } | Instr::BrTable { .. } | Instr::End)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodeError {
    Truncated { offset: usize },
    UnknownOpcode { offset: usize, opcode: u8 },
    NegativeTarget { offset: usize },
    BadTypeTag { offset: usize, tag: u8 },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Truncated { offset } => {
                write!(f, "truncated operand stream at offset {offset}")
            }
            DecodeError::UnknownOpcode { offset, opcode } => {
                write!(f, "unknown opcode {opcode:#04x} at offset {offset}")
            }
            DecodeError::NegativeTarget { offset } => {
                write!(f, "branch at offset {offset} targets a negative offset")
            }
            DecodeError::BadTypeTag { offset, tag } => {
                write!(f, "invalid type tag {tag} at offset {offset}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<DecodeError> for VmError {
    fn from(error: DecodeError) -> Self {
        match error {
            DecodeError::Truncated { offset } | DecodeError::BadTypeTag { offset, .. } => {
                VmError::TruncatedOperand { offset }
            }
            DecodeError::UnknownOpcode { offset, opcode } => {
                VmError::InvalidOpcode { offset, opcode }
            }
            DecodeError::NegativeTarget { offset } => VmError::BranchOutOfRange { offset },
        }
    }
}

struct Reader<'a> {
    code: &'a [u8],
    start: usize,
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let end = self.pos.saturating_add(N);
        let bytes = self
            .code
            .get(self.pos..end)
            .ok_or(DecodeError::Truncated { offset: self.start })?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.take()?))
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(self.u32()? as i32)
    }

    fn regs3(&mut self) -> Result<(u8, u8, u8), DecodeError> {
        Ok((self.u8()?, self.u8()?, self.u8()?))
    }

    /// Resolves an offset relative to `end` into an absolute position.
    fn target(&self, end: usize, rel: i32) -> Result<usize, DecodeError> {
        let target = end as i64 + rel as i64;
        usize::try_from(target).map_err(|_| DecodeError::NegativeTarget { offset: self.start })
    }
}

/// Decodes the instruction at `offset` and returns it with the offset of the
/// next instruction.
pub fn decode(code: &[u8], offset: usize) -> Result<(Instr, usize), DecodeError> {
    let opcode = *code.get(offset).ok_or(DecodeError::Truncated { offset })?;
    let op = OpCode::from_u8(opcode).ok_or(DecodeError::UnknownOpcode { offset, opcode })?;
    let mut r = Reader {
        code,
        start: offset,
        pos: offset + 1,
    };

    let instr = match op {
        OpCode::Nop => Instr::Nop,
        OpCode::Mov => Instr::Mov {
            d: r.u8()?,
            s: r.u8()?,
        },
        OpCode::ConstI32 | OpCode::ConstF32 => Instr::Const32 {
            d: r.u8()?,
            value: r.u32()?,
        },
        OpCode::ConstI64 | OpCode::ConstF64 => Instr::Const64 {
            d: r.u8()?,
            value: r.u64()?,
        },
        OpCode::AddI32
        | OpCode::SubI32
        | OpCode::MulI32
        | OpCode::AndI32
        | OpCode::OrI32
        | OpCode::XorI32
        | OpCode::ShlI32
        | OpCode::ShrSI32
        | OpCode::ShrUI32
        | OpCode::DivSI32
        | OpCode::DivUI32
        | OpCode::RemSI32
        | OpCode::RemUI32 => {
            let bin = match op {
                OpCode::AddI32 => Bin32::Add,
                OpCode::SubI32 => Bin32::Sub,
                OpCode::MulI32 => Bin32::Mul,
                OpCode::AndI32 => Bin32::And,
                OpCode::OrI32 => Bin32::Or,
                OpCode::XorI32 => Bin32::Xor,
                OpCode::ShlI32 => Bin32::Shl,
                OpCode::ShrSI32 => Bin32::ShrS,
                OpCode::ShrUI32 => Bin32::ShrU,
                OpCode::DivSI32 => Bin32::DivS,
                OpCode::DivUI32 => Bin32::DivU,
                OpCode::RemSI32 => Bin32::RemS,
                _ => Bin32::RemU,
            };
            let (d, a, b) = r.regs3()?;
            Instr::Bin32 { op: bin, d, a, b }
        }
        OpCode::AddiI32 => Instr::AddImm32 {
            d: r.u8()?,
            a: r.u8()?,
            imm: r.u8()? as i8,
        },
        OpCode::EqzI32 => Instr::Eqz32 {
            d: r.u8()?,
            a: r.u8()?,
        },
        OpCode::EqI32
        | OpCode::NeI32
        | OpCode::LtSI32
        | OpCode::LtUI32
        | OpCode::GtSI32
        | OpCode::GtUI32
        | OpCode::LeSI32
        | OpCode::LeUI32
        | OpCode::GeSI32
        | OpCode::GeUI32 => {
            let cond = Cond::from_u8(opcode - OpCode::EqI32 as u8)
                .ok_or(DecodeError::UnknownOpcode { offset, opcode })?;
            let (d, a, b) = r.regs3()?;
            Instr::Cmp32 { cond, d, a, b }
        }
        OpCode::AddI64
        | OpCode::SubI64
        | OpCode::MulI64
        | OpCode::AndI64
        | OpCode::OrI64
        | OpCode::XorI64
        | OpCode::ShlI64
        | OpCode::ShrSI64
        | OpCode::ShrUI64
        | OpCode::DivSI64
        | OpCode::DivUI64
        | OpCode::RemSI64
        | OpCode::RemUI64 => {
            let bin = match op {
                OpCode::AddI64 => Bin64::Add,
                OpCode::SubI64 => Bin64::Sub,
                OpCode::MulI64 => Bin64::Mul,
                OpCode::AndI64 => Bin64::And,
                OpCode::OrI64 => Bin64::Or,
                OpCode::XorI64 => Bin64::Xor,
                OpCode::ShlI64 => Bin64::Shl,
                OpCode::ShrSI64 => Bin64::ShrS,
                OpCode::ShrUI64 => Bin64::ShrU,
                OpCode::DivSI64 => Bin64::DivS,
                OpCode::DivUI64 => Bin64::DivU,
                OpCode::RemSI64 => Bin64::RemS,
                _ => Bin64::RemU,
            };
            let (d, a, b) = r.regs3()?;
            Instr::Bin64 { op: bin, d, a, b }
        }
        OpCode::EqI64
        | OpCode::NeI64
        | OpCode::LtSI64
        | OpCode::LtUI64
        | OpCode::GtSI64
        | OpCode::GtUI64
        | OpCode::LeSI64
        | OpCode::LeUI64
        | OpCode::GeSI64
        | OpCode::GeUI64 => {
            let cond = Cond::from_u8(opcode - OpCode::EqI64 as u8)
                .ok_or(DecodeError::UnknownOpcode { offset, opcode })?;
            let (d, a, b) = r.regs3()?;
            Instr::Cmp64 { cond, d, a, b }
        }
        OpCode::ExtendI32S
        | OpCode::ExtendI32U
        | OpCode::WrapI64
        | OpCode::Sext8
        | OpCode::Sext16
        | OpCode::Zext8
        | OpCode::Zext16
        | OpCode::I32ToF32
        | OpCode::F32ToI32
        | OpCode::I32ToF64
        | OpCode::F64ToI32
        | OpCode::I64ToF64
        | OpCode::F64ToI64
        | OpCode::F32ToF64
        | OpCode::F64ToF32 => {
            let conv = Conv::from_u8(opcode - OpCode::ExtendI32S as u8)
                .ok_or(DecodeError::UnknownOpcode { offset, opcode })?;
            Instr::Convert {
                conv,
                d: r.u8()?,
                s: r.u8()?,
            }
        }
        OpCode::AddF32 | OpCode::SubF32 | OpCode::MulF32 | OpCode::DivF32 => {
            let (d, a, b) = r.regs3()?;
            Instr::FloatF32 {
                op: float_op(opcode - OpCode::AddF32 as u8),
                d,
                a,
                b,
            }
        }
        OpCode::AddF64 | OpCode::SubF64 | OpCode::MulF64 | OpCode::DivF64 => {
            let (d, a, b) = r.regs3()?;
            Instr::FloatF64 {
                op: float_op(opcode - OpCode::AddF64 as u8),
                d,
                a,
                b,
            }
        }
        OpCode::EqF32 | OpCode::LtF32 | OpCode::LeF32 => {
            let cond = FloatCond::from_u8(opcode - OpCode::EqF32 as u8)
                .ok_or(DecodeError::UnknownOpcode { offset, opcode })?;
            let (d, a, b) = r.regs3()?;
            Instr::CmpF32 { cond, d, a, b }
        }
        OpCode::EqF64 | OpCode::LtF64 | OpCode::LeF64 => {
            let cond = FloatCond::from_u8(opcode - OpCode::EqF64 as u8)
                .ok_or(DecodeError::UnknownOpcode { offset, opcode })?;
            let (d, a, b) = r.regs3()?;
            Instr::CmpF64 { cond, d, a, b }
        }
        OpCode::Select => Instr::Select {
            d: r.u8()?,
            c: r.u8()?,
            a: r.u8()?,
            b: r.u8()?,
        },
        OpCode::LoadI32
        | OpCode::LoadI64
        | OpCode::LoadU8
        | OpCode::LoadS8
        | OpCode::LoadU16
        | OpCode::LoadS16 => {
            let kind = match op {
                OpCode::LoadI32 => LoadKind::I32,
                OpCode::LoadI64 => LoadKind::I64,
                OpCode::LoadU8 => LoadKind::U8,
                OpCode::LoadS8 => LoadKind::S8,
                OpCode::LoadU16 => LoadKind::U16,
                _ => LoadKind::S16,
            };
            Instr::Load {
                kind,
                d: r.u8()?,
                p: r.u8()?,
                offset: r.u16()?,
            }
        }
        OpCode::StoreI32 | OpCode::StoreI64 | OpCode::StoreI8 | OpCode::StoreI16 => {
            let kind = match op {
                OpCode::StoreI32 => StoreKind::I32,
                OpCode::StoreI64 => StoreKind::I64,
                OpCode::StoreI8 => StoreKind::I8,
                _ => StoreKind::I16,
            };
            Instr::Store {
                kind,
                s: r.u8()?,
                p: r.u8()?,
                offset: r.u16()?,
            }
        }
        OpCode::MemAddr => Instr::MemAddr {
            d: r.u8()?,
            offset: r.u32()?,
        },
        OpCode::GlobalGet => Instr::GlobalGet {
            d: r.u8()?,
            index: r.u16()?,
        },
        OpCode::GlobalSet => Instr::GlobalSet {
            index: r.u16()?,
            s: r.u8()?,
        },
        OpCode::GlobalAddr => Instr::GlobalAddr {
            d: r.u8()?,
            index: r.u16()?,
        },
        OpCode::MemCopy => {
            let (dst, src, len) = r.regs3()?;
            Instr::MemCopy { dst, src, len }
        }
        OpCode::MemSet => {
            let (dst, val, len) = r.regs3()?;
            Instr::MemSet { dst, val, len }
        }
        OpCode::TableGet => Instr::TableGet {
            d: r.u8()?,
            index: r.u8()?,
        },
        OpCode::TableSet => Instr::TableSet {
            index: r.u8()?,
            s: r.u8()?,
        },
        OpCode::Alloca => Instr::Alloca {
            d: r.u8()?,
            size: r.u8()?,
        },
        OpCode::HeapAlloc => Instr::HeapAlloc {
            d: r.u8()?,
            size: r.u8()?,
        },
        OpCode::HeapFree => Instr::HeapFree { p: r.u8()? },
        OpCode::AtomicAddI32 => {
            let (d, p, v) = r.regs3()?;
            Instr::AtomicAdd { d, p, v }
        }
        OpCode::AtomicCasI32 => Instr::AtomicCas {
            d: r.u8()?,
            p: r.u8()?,
            expected: r.u8()?,
            new: r.u8()?,
        },
        OpCode::Jmp => {
            let rel = r.i32()?;
            Instr::Jmp {
                target: r.target(r.pos, rel)?,
            }
        }
        OpCode::BrIf | OpCode::BrIfNot => {
            let c = r.u8()?;
            let rel = r.i32()?;
            Instr::BrIf {
                c,
                target: r.target(r.pos, rel)?,
                negate: op == OpCode::BrIfNot,
            }
        }
        OpCode::BrTable => {
            let index = r.u8()?;
            let count = r.u16()? as usize;
            let mut rels = Vec::with_capacity(count);
            for _ in 0..count {
                rels.push(r.i32()?);
            }
            let default_rel = r.i32()?;
            let end = r.pos;
            let mut cases = Vec::with_capacity(count);
            for rel in rels {
                cases.push(r.target(end, rel)?);
            }
            Instr::BrTable {
                index,
                cases,
                default: r.target(end, default_rel)?,
            }
        }
        OpCode::End => Instr::End,
        OpCode::Call => Instr::Call {
            func: r.u16()?,
            base: r.u8()?,
        },
        OpCode::CallIndirect => Instr::CallIndirect {
            callee: r.u8()?,
            base: r.u8()?,
        },
        OpCode::FuncAddr => Instr::FuncAddr {
            d: r.u8()?,
            func: r.u16()?,
        },
        OpCode::CallImport => Instr::CallImport {
            import: r.u16()?,
            base: r.u8()?,
        },
        OpCode::CallImportVa => {
            let import = r.u16()?;
            let base = r.u8()?;
            let count = r.u8()? as usize;
            let mut tags = Vec::with_capacity(count);
            for _ in 0..count {
                let tag = r.u8()?;
                let ty = ValueType::from_tag(tag)
                    .filter(|ty| *ty != ValueType::Void)
                    .ok_or(DecodeError::BadTypeTag { offset, tag })?;
                tags.push(ty);
            }
            Instr::CallImportVa { import, base, tags }
        }
    };
    Ok((instr, r.pos))
}

fn float_op(index: u8) -> FloatOp {
    match index {
        0 => FloatOp::Add,
        1 => FloatOp::Sub,
        2 => FloatOp::Mul,
        _ => FloatOp::Div,
    }
}

/// Decodes a whole function body into `(offset, instruction)` pairs.
pub fn decode_all(code: &[u8]) -> Result<Vec<(usize, Instr)>, DecodeError> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    while offset < code.len() {
        let (instr, next) = decode(code, offset)?;
        out.push((offset, instr));
        offset = next;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_offsets_are_relative_to_the_instruction_end() {
        let mut code = vec![OpCode::Jmp as u8];
        code.extend_from_slice(&(-5i32).to_le_bytes());
        let (instr, next) = decode(&code, 0).expect("decode");
        assert_eq!(next, 5);
        assert_eq!(instr, Instr::Jmp { target: 0 });
    }

    #[test]
    fn br_table_offsets_are_relative_to_the_end_of_the_table() {
        let mut code = vec![OpCode::BrTable as u8, 3];
        code.extend_from_slice(&2u16.to_le_bytes());
        code.extend_from_slice(&0i32.to_le_bytes());
        code.extend_from_slice(&1i32.to_le_bytes());
        code.extend_from_slice(&2i32.to_le_bytes());
        let (instr, next) = decode(&code, 0).expect("decode");
        assert_eq!(next, 16);
        assert_eq!(
            instr,
            Instr::BrTable {
                index: 3,
                cases: vec![16, 17],
                default: 18,
            }
        );
    }

    #[test]
    fn truncated_operands_are_reported_at_the_instruction_start() {
        let code = [OpCode::Nop as u8, OpCode::ConstI32 as u8, 1, 0xFF];
        assert_eq!(
            decode_all(&code),
            Err(DecodeError::Truncated { offset: 1 })
        );
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        assert_eq!(
            decode(&[0xEE], 0),
            Err(DecodeError::UnknownOpcode {
                offset: 0,
                opcode: 0xEE
            })
        );
    }

    #[test]
    fn negative_targets_are_malformed() {
        let mut code = vec![OpCode::Jmp as u8];
        code.extend_from_slice(&(-6i32).to_le_bytes());
        assert_eq!(
            decode(&code, 0),
            Err(DecodeError::NegativeTarget { offset: 0 })
        );
    }

    #[test]
    fn every_opcode_byte_round_trips_through_from_u8() {
        for byte in 0..=255u8 {
            if let Some(op) = OpCode::from_u8(byte) {
                assert_eq!(op as u8, byte, "{}", op.mnemonic());
            }
        }
    }
}
