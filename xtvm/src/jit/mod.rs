//! Method JIT for the Xtensa target.
//!
//! One compilation turns one function's bytecode into native code in
//! instruction RAM. The pieces, leaves first: [`emitter`] writes bytes with
//! word-only stores, [`literal_pool`] places 32-bit constants behind the
//! code that loads them, [`fixups`] maps bytecode offsets to native offsets,
//! `lower` translates opcodes and `callconv` bridges every call that leaves
//! generated code. [`JitState`] is the per-instance tiering state and
//! [`CodeCache`] owns the installed code.

pub mod cache;
mod callconv;
mod compiler;
mod context;
pub mod emitter;
pub mod fixups;
pub mod literal_pool;
mod lower;

use serde::Serialize;

use crate::bytecode::DecodeError;
use crate::module::Module;
use crate::xtensa::{CallKind, EncodeError};

pub use cache::CodeCache;
pub use compiler::compile_function;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct JitConfig {
    pub enabled: bool,
    /// Distinct constants the literal pool holds before it starts over.
    pub literal_pool_capacity: usize,
    /// Instruction RAM reserved per compilation; the unused tail is returned.
    pub max_code_bytes: u32,
    /// Materialize the helper addresses a function uses once in its prologue.
    pub seed_helper_literals: bool,
    pub unresolved_branch_policy: UnresolvedBranchPolicy,
    /// Convention used for runtime helper calls. Imports and compiled VM
    /// functions are always called windowed.
    pub helper_convention: HelperConvention,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            literal_pool_capacity: 16,
            max_code_bytes: 16 * 1024,
            seed_helper_literals: true,
            unresolved_branch_policy: UnresolvedBranchPolicy::Trap,
            helper_convention: HelperConvention::Windowed,
        }
    }
}

/// What to do with a branch whose target never got a native offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum UnresolvedBranchPolicy {
    /// Patch a self-jump, which the core reports as a trap if reached.
    Trap,
    /// Fail the whole compilation.
    Fail,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum HelperConvention {
    Windowed,
    Call0,
}

impl HelperConvention {
    pub fn call_kind(self) -> CallKind {
        match self {
            HelperConvention::Windowed => CallKind::Windowed,
            HelperConvention::Call0 => CallKind::Call0,
        }
    }
}

/// Why one function did not compile. Never fatal beyond that function.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum JitFailure {
    Disabled,
    UnsupportedOpcode { offset: usize, opcode: u8 },
    TruncatedOperand { offset: usize },
    OperandOutOfRange { offset: usize, what: &'static str },
    CodeBufferExhausted { capacity: u32 },
    ExecMemoryExhausted { requested: u32 },
    EncodingRange { what: &'static str, value: i64 },
    UnresolvedBranch { target: usize },
    InstructionMemory { address: u32 },
    /// The entry table slot for the function could not be written.
    Install { address: u32 },
}

impl JitFailure {
    pub fn message(&self) -> String {
        match self {
            JitFailure::Disabled => "jit is disabled by configuration".to_string(),
            JitFailure::UnsupportedOpcode { offset, opcode } => {
                format!("unsupported opcode 0x{opcode:02X} at offset {offset}")
            }
            JitFailure::TruncatedOperand { offset } => {
                format!("operand stream truncated at offset {offset}")
            }
            JitFailure::OperandOutOfRange { offset, what } => {
                format!("{what} out of range at offset {offset}")
            }
            JitFailure::CodeBufferExhausted { capacity } => {
                format!("code buffer of {capacity} bytes exhausted")
            }
            JitFailure::ExecMemoryExhausted { requested } => {
                format!("no executable memory for {requested} bytes")
            }
            JitFailure::EncodingRange { what, value } => {
                format!("{what} {value} does not fit its instruction field")
            }
            JitFailure::UnresolvedBranch { target } => {
                format!("branch target {target} never received a native offset")
            }
            JitFailure::InstructionMemory { address } => {
                format!("instruction memory rejected a store at {address:#010x}")
            }
            JitFailure::Install { address } => {
                format!("entry table slot {address:#010x} is not writable")
            }
        }
    }
}

impl std::fmt::Display for JitFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message())
    }
}

impl std::error::Error for JitFailure {}

impl From<EncodeError> for JitFailure {
    fn from(error: EncodeError) -> Self {
        JitFailure::EncodingRange {
            what: error.what,
            value: error.value,
        }
    }
}

impl From<DecodeError> for JitFailure {
    fn from(error: DecodeError) -> Self {
        match error {
            DecodeError::Truncated { offset } => JitFailure::TruncatedOperand { offset },
            DecodeError::UnknownOpcode { offset, opcode } => {
                JitFailure::UnsupportedOpcode { offset, opcode }
            }
            DecodeError::NegativeTarget { offset } => JitFailure::OperandOutOfRange {
                offset,
                what: "branch target",
            },
            DecodeError::BadTypeTag { offset, .. } => JitFailure::OperandOutOfRange {
                offset,
                what: "variadic type tag",
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CompileState {
    NotCompiled,
    Compiled,
    Failed,
}

/// Native code for one function, installed in instruction RAM.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CompiledCode {
    pub entry: u32,
    pub size: u32,
    /// Absolute `(start, end)` of each literal table inside the code.
    pub literal_ranges: Vec<(u32, u32)>,
    pub pool_flushes: u32,
    pub fixups: usize,
    /// Unresolved branches patched into traps.
    pub traps: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct JitAttempt {
    pub function: u32,
    pub name: String,
    pub result: Result<u32, JitFailure>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FunctionJitState {
    pub index: u32,
    pub name: String,
    pub hot: bool,
    pub state: CompileState,
    pub entry: Option<u32>,
    pub code_size: u32,
    pub native_calls: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct JitSnapshot {
    pub arch: &'static str,
    pub config: JitConfig,
    pub functions: Vec<FunctionJitState>,
    pub attempts: Vec<JitAttempt>,
    pub native_calls: u64,
    pub exec_bytes_free: u32,
}

pub const ARCH: &str = "xtensa-lx (simulated)";

/// Tiering state of one instance: what is compiled, what failed, what ran.
#[derive(Debug)]
pub struct JitState {
    config: JitConfig,
    functions: Vec<FunctionJitState>,
    attempts: Vec<JitAttempt>,
    pub(crate) cache: CodeCache,
}

impl JitState {
    pub fn new(config: JitConfig, module: &Module, entry_table: u32) -> Self {
        let functions = module
            .functions
            .iter()
            .enumerate()
            .map(|(index, function)| FunctionJitState {
                index: index as u32,
                name: function.name.clone(),
                hot: function.hot,
                state: CompileState::NotCompiled,
                entry: None,
                code_size: 0,
                native_calls: 0,
            })
            .collect();
        Self {
            config,
            functions,
            attempts: Vec::new(),
            cache: CodeCache::new(entry_table),
        }
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: JitConfig) {
        self.config = config;
    }

    pub fn state(&self, func: u32) -> CompileState {
        self.functions
            .get(func as usize)
            .map(|entry| entry.state)
            .unwrap_or(CompileState::NotCompiled)
    }

    pub fn attempts(&self) -> &[JitAttempt] {
        &self.attempts
    }

    /// Records the outcome of one compilation and moves the function to its
    /// new state.
    pub(crate) fn record(&mut self, func: u32, result: Result<&CompiledCode, JitFailure>) {
        let Some(entry) = self.functions.get_mut(func as usize) else {
            return;
        };
        let outcome = match result {
            Ok(code) => {
                entry.state = CompileState::Compiled;
                entry.entry = Some(code.entry);
                entry.code_size = code.size;
                Ok(code.size)
            }
            Err(failure) => {
                if entry.state != CompileState::Compiled {
                    entry.state = CompileState::Failed;
                }
                Err(failure)
            }
        };
        self.attempts.push(JitAttempt {
            function: func,
            name: entry.name.clone(),
            result: outcome,
        });
    }

    pub(crate) fn note_native_call(&mut self, func: u32) {
        if let Some(entry) = self.functions.get_mut(func as usize) {
            entry.native_calls = entry.native_calls.saturating_add(1);
        }
    }

    pub fn native_calls(&self) -> u64 {
        self.functions.iter().map(|entry| entry.native_calls).sum()
    }

    pub fn snapshot(&self, exec_bytes_free: u32) -> JitSnapshot {
        JitSnapshot {
            arch: ARCH,
            config: self.config.clone(),
            functions: self.functions.clone(),
            attempts: self.attempts.clone(),
            native_calls: self.native_calls(),
            exec_bytes_free,
        }
    }

    pub fn dump_text(&self, exec_bytes_free: u32) -> String {
        let mut out = String::new();
        out.push_str("method-jit:\n");
        out.push_str(&format!("  arch: {ARCH}\n"));
        out.push_str(&format!("  enabled: {}\n", self.config.enabled));
        out.push_str(&format!(
            "  literal_pool_capacity: {}\n",
            self.config.literal_pool_capacity
        ));
        out.push_str(&format!("  max_code_bytes: {}\n", self.config.max_code_bytes));
        out.push_str(&format!(
            "  unresolved_branch_policy: {:?}\n",
            self.config.unresolved_branch_policy
        ));
        out.push_str(&format!(
            "  helper_convention: {:?}\n",
            self.config.helper_convention
        ));
        out.push_str(&format!("  compiled functions: {}\n", self.cache.len()));
        out.push_str(&format!("  compile attempts: {}\n", self.attempts.len()));
        out.push_str(&format!("  native calls: {}\n", self.native_calls()));
        out.push_str(&format!("  exec bytes free: {exec_bytes_free}\n"));

        for function in &self.functions {
            let entry = function
                .entry
                .map(|address| format!("{address:#010x}"))
                .unwrap_or_else(|| "-".to_string());
            out.push_str(&format!(
                "  fn#{} {} hot={} state={:?} entry={} size={} native_calls={}\n",
                function.index,
                function.name,
                function.hot,
                function.state,
                entry,
                function.code_size,
                function.native_calls
            ));
        }

        let mut failed = 0usize;
        for attempt in &self.attempts {
            if let Err(reason) = &attempt.result {
                failed = failed.saturating_add(1);
                out.push_str(&format!(
                    "  failed fn#{} {} reason={}\n",
                    attempt.function,
                    attempt.name,
                    reason.message()
                ));
            }
        }
        out.push_str(&format!("  failed attempts: {failed}\n"));
        out
    }
}
