//! The native target: a windowed Xtensa LX core.
//!
//! Everything that knows about instruction bits lives here. `encode` has one
//! function per instruction shape, `decode` turns words back into [`Insn`],
//! `cpu` executes them against an [`AddressSpace`](crate::memory::AddressSpace)
//! and `disasm` renders them for dumps.

pub mod cpu;
pub mod decode;
pub mod disasm;
pub mod encode;

pub use cpu::{CallKind, Cpu, CpuExit};
pub use decode::{Insn, decode_insn};
pub use encode::EncodeError;

/// Host routine stubs. Calls into this range are intercepted by the
/// simulator and served by Rust code.
pub const STUB_BASE: u32 = 0x4000_0000;
pub const HELPER_BASE: u32 = STUB_BASE;
pub const IMPORT_BASE: u32 = STUB_BASE + 0x1000;
pub const TRAMPOLINE_BASE: u32 = STUB_BASE + 0x2000;
pub const MAX_TRAMPOLINES: u32 = 0x400;
/// Return address handed to native code entered from the host.
pub const RETURN_SENTINEL: u32 = STUB_BASE + 0x3FFC;
pub const STUB_END: u32 = STUB_BASE + 0x4000;

/// Every instruction the compiler emits is three bytes wide.
pub const INSN_LEN: u32 = 3;

/// Address register `a0..a15` of the current window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Reg(u8);

impl Reg {
    pub fn index(self) -> u8 {
        self.0
    }

    pub fn from_index(index: u8) -> Option<Self> {
        (index < 16).then_some(Reg(index))
    }
}

impl std::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "a{}", self.0)
    }
}

pub const A0: Reg = Reg(0);
pub const A1: Reg = Reg(1);
pub const A2: Reg = Reg(2);
pub const A3: Reg = Reg(3);
pub const A4: Reg = Reg(4);
pub const A5: Reg = Reg(5);
pub const A6: Reg = Reg(6);
pub const A7: Reg = Reg(7);
pub const A8: Reg = Reg(8);
pub const A9: Reg = Reg(9);
pub const A10: Reg = Reg(10);
pub const A11: Reg = Reg(11);
pub const A12: Reg = Reg(12);
pub const A13: Reg = Reg(13);
pub const A14: Reg = Reg(14);
pub const A15: Reg = Reg(15);

/// Single-precision FPU register `f0..f15`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FReg(u8);

impl FReg {
    pub fn index(self) -> u8 {
        self.0
    }

    pub fn from_index(index: u8) -> Option<Self> {
        (index < 16).then_some(FReg(index))
    }
}

impl std::fmt::Display for FReg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "f{}", self.0)
    }
}

pub const F0: FReg = FReg(0);
pub const F1: FReg = FReg(1);
pub const F2: FReg = FReg(2);

pub fn is_stub(address: u32) -> bool {
    (STUB_BASE..STUB_END).contains(&address)
}
