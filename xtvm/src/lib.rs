//! A register bytecode VM for Xtensa microcontrollers with a method JIT.
//!
//! Modules are built with [`ModuleBuilder`] and [`BytecodeBuilder`], linked
//! against host functions by a [`Runtime`] and executed by an [`Instance`].
//! Every function starts out interpreted. Functions marked hot are compiled
//! to native Xtensa code in instruction RAM on their first call and from
//! then on entered through the instance's entry table; a function that
//! fails to compile keeps running in the interpreter. The native tier runs
//! on a simulated LX core, so both tiers can be compared bit for bit on any
//! host.

pub mod assembler;
pub mod bytecode;
pub mod error;
pub mod ffi;
pub mod helpers;
pub mod instance;
mod interp;
pub mod jit;
pub mod layout;
#[cfg(feature = "cli")]
pub mod logging;
pub mod memory;
pub mod module;
pub mod runtime;
pub mod value;
pub mod xtensa;

pub use assembler::{AssemblerError, BytecodeBuilder};
pub use bytecode::{Bin32, Bin64, Cond, Conv, FloatCond, FloatOp, Instr, LoadKind, OpCode, StoreKind};
pub use error::{VmError, VmResult};
pub use ffi::{NativeArgs, NativeCall, NativeReturn};
pub use instance::Instance;
pub use jit::{
    CompileState, CompiledCode, HelperConvention, JitConfig, JitFailure, JitSnapshot,
    UnresolvedBranchPolicy,
};
pub use module::{FuncType, Module, ModuleBuilder, ModuleError};
pub use runtime::{HostFunction, HostFunctionRegistry, Runtime, RuntimeConfig, StaticHostFunction};
pub use value::{Value, ValueType};
