use crate::value::ValueType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    TypeMismatch {
        expected: ValueType,
        got: ValueType,
    },
    ArgumentCount {
        function: u32,
        expected: usize,
        got: usize,
    },
    InvalidFunction(u32),
    InvalidImport(u32),
    InvalidGlobal(u32),
    InvalidTableIndex(u32),
    InvalidRegister {
        function: u32,
        register: u8,
    },
    InvalidIndirectTarget(u32),
    UnboundImport(String),
    InvalidOpcode {
        offset: usize,
        opcode: u8,
    },
    TruncatedOperand {
        offset: usize,
    },
    BranchOutOfRange {
        offset: usize,
    },
    MemoryFault {
        address: u32,
        width: u8,
    },
    MisalignedAccess {
        address: u32,
        width: u8,
    },
    NarrowInstructionWrite {
        address: u32,
        width: u8,
    },
    OutOfMemory(&'static str),
    ExecMemoryExhausted {
        requested: u32,
    },
    NativeFault {
        pc: u32,
        message: String,
    },
    NativeTrap {
        pc: u32,
    },
    StepBudgetExceeded(u64),
    CallDepthExceeded(u32),
    HostReentered(String),
    HostError(String),
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmError::TypeMismatch { expected, got } => {
                write!(f, "type mismatch: expected {expected}, got {got}")
            }
            VmError::ArgumentCount {
                function,
                expected,
                got,
            } => write!(
                f,
                "function {function} expects {expected} arguments, got {got}"
            ),
            VmError::InvalidFunction(index) => write!(f, "invalid function index {index}"),
            VmError::InvalidImport(index) => write!(f, "invalid import index {index}"),
            VmError::InvalidGlobal(index) => write!(f, "invalid global index {index}"),
            VmError::InvalidTableIndex(index) => write!(f, "invalid table index {index}"),
            VmError::InvalidRegister { function, register } => write!(
                f,
                "register r{register} exceeds the register count of function {function}"
            ),
            VmError::InvalidIndirectTarget(value) => {
                write!(f, "indirect call target {value:#010x} is not a function")
            }
            VmError::UnboundImport(name) => write!(f, "unbound host import '{name}'"),
            VmError::InvalidOpcode { offset, opcode } => {
                write!(f, "invalid opcode {opcode:#04x} at offset {offset}")
            }
            VmError::TruncatedOperand { offset } => {
                write!(f, "truncated operand stream at offset {offset}")
            }
            VmError::BranchOutOfRange { offset } => {
                write!(f, "branch at offset {offset} leaves the function body")
            }
            VmError::MemoryFault { address, width } => {
                write!(f, "{width}-byte access to unmapped address {address:#010x}")
            }
            VmError::MisalignedAccess { address, width } => {
                write!(f, "misaligned {width}-byte access at {address:#010x}")
            }
            VmError::NarrowInstructionWrite { address, width } => write!(
                f,
                "{width}-byte store to instruction memory at {address:#010x}, only aligned 4-byte stores are allowed"
            ),
            VmError::OutOfMemory(region) => write!(f, "{region} exhausted"),
            VmError::ExecMemoryExhausted { requested } => write!(
                f,
                "no executable memory available for {requested} bytes"
            ),
            VmError::NativeFault { pc, message } => {
                write!(f, "native fault at {pc:#010x}: {message}")
            }
            VmError::NativeTrap { pc } => write!(f, "native trap at {pc:#010x}"),
            VmError::StepBudgetExceeded(steps) => {
                write!(f, "native execution exceeded {steps} steps")
            }
            VmError::CallDepthExceeded(depth) => write!(f, "call depth {depth} exceeded"),
            VmError::HostReentered(name) => {
                write!(f, "host function '{name}' re-entered while running")
            }
            VmError::HostError(message) => write!(f, "host error: {message}"),
        }
    }
}

impl std::error::Error for VmError {}

pub type VmResult<T> = Result<T, VmError>;
