//! Native call marshalling and callback trampolines.
//!
//! Arguments follow the windowed ABI: six argument words, 64-bit values in
//! an even-aligned register pair, and once one argument does not fit the
//! registers, it and everything after it go to the caller's outgoing stack
//! area in order (64-bit values 8-byte aligned).

use std::collections::HashMap;

use crate::error::{VmError, VmResult};
use crate::instance::Instance;
use crate::value::{Value, ValueType};
use crate::xtensa::{MAX_TRAMPOLINES, TRAMPOLINE_BASE};

pub const ARG_REGS: usize = 6;

/// Where one argument's first word goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    Reg(usize),
    /// Word index into the outgoing stack area at `sp`.
    Stack(usize),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArgLayout {
    pub placements: Vec<Placement>,
    pub reg_words: usize,
    pub stack_words: usize,
}

pub fn arg_layout(types: &[ValueType]) -> ArgLayout {
    let mut placements = Vec::with_capacity(types.len());
    let mut reg = 0usize;
    let mut stack = 0usize;
    let mut spilled = false;
    for ty in types {
        let words = if ty.is_wide() { 2 } else { 1 };
        if !spilled {
            let start = if ty.is_wide() { reg.next_multiple_of(2) } else { reg };
            if start + words <= ARG_REGS {
                placements.push(Placement::Reg(start));
                reg = start + words;
                continue;
            }
            spilled = true;
        }
        let start = if ty.is_wide() {
            stack.next_multiple_of(2)
        } else {
            stack
        };
        placements.push(Placement::Stack(start));
        stack = start + words;
    }
    ArgLayout {
        placements,
        reg_words: reg,
        stack_words: stack,
    }
}

/// Argument words exactly as a native callee observes them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NativeArgs {
    pub regs: [u32; ARG_REGS],
    pub stack: Vec<u32>,
}

impl NativeArgs {
    fn word(&self, placement: Placement, index: usize) -> u32 {
        match placement {
            Placement::Reg(start) => self.regs.get(start + index).copied().unwrap_or(0),
            Placement::Stack(start) => self.stack.get(start + index).copied().unwrap_or(0),
        }
    }

    fn set_word(&mut self, placement: Placement, index: usize, value: u32) {
        match placement {
            Placement::Reg(start) => {
                if let Some(slot) = self.regs.get_mut(start + index) {
                    *slot = value;
                }
            }
            Placement::Stack(start) => {
                if self.stack.len() <= start + index {
                    self.stack.resize(start + index + 1, 0);
                }
                self.stack[start + index] = value;
            }
        }
    }
}

pub fn marshal_args(types: &[ValueType], values: &[Value]) -> NativeArgs {
    let layout = arg_layout(types);
    let mut args = NativeArgs {
        regs: [0; ARG_REGS],
        stack: vec![0; layout.stack_words],
    };
    for ((ty, value), placement) in types.iter().zip(values).zip(&layout.placements) {
        args.set_word(*placement, 0, value.lo());
        if ty.is_wide() {
            args.set_word(*placement, 1, value.hi());
        }
    }
    args
}

pub fn unmarshal_args(types: &[ValueType], args: &NativeArgs) -> Vec<Value> {
    let layout = arg_layout(types);
    types
        .iter()
        .zip(&layout.placements)
        .map(|(ty, placement)| {
            let lo = args.word(*placement, 0) as u64;
            let hi = if ty.is_wide() {
                args.word(*placement, 1) as u64
            } else {
                0
            };
            Value::from_slot(*ty, (hi << 32) | lo)
        })
        .collect()
}

/// Result of a native call: the two result registers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NativeReturn {
    pub lo: u32,
    pub hi: u32,
}

impl NativeReturn {
    pub fn void() -> Self {
        Self::default()
    }

    pub fn word(value: u32) -> Self {
        Self { lo: value, hi: 0 }
    }

    pub fn value(value: Value) -> Self {
        Self {
            lo: value.lo(),
            hi: value.hi(),
        }
    }
}

/// One host call in progress: the callee's view of its arguments plus access
/// to the calling instance.
pub struct NativeCall<'a> {
    instance: &'a mut Instance,
    import: u32,
    types: Vec<ValueType>,
    args: NativeArgs,
}

impl<'a> NativeCall<'a> {
    pub(crate) fn new(
        instance: &'a mut Instance,
        import: u32,
        types: Vec<ValueType>,
        args: NativeArgs,
    ) -> Self {
        Self {
            instance,
            import,
            types,
            args,
        }
    }

    pub fn import(&self) -> u32 {
        self.import
    }

    /// Argument types: the declared parameters, or the per-call tag list of a
    /// variadic call.
    pub fn types(&self) -> &[ValueType] {
        &self.types
    }

    pub fn reg_words(&self) -> &[u32; ARG_REGS] {
        &self.args.regs
    }

    pub fn stack_words(&self) -> &[u32] {
        &self.args.stack
    }

    pub fn raw(&self) -> &NativeArgs {
        &self.args
    }

    pub fn values(&self) -> Vec<Value> {
        unmarshal_args(&self.types, &self.args)
    }

    pub fn arg(&self, index: usize) -> Option<Value> {
        self.values().get(index).copied()
    }

    pub fn read_memory(&self, address: u32, len: u32) -> VmResult<Vec<u8>> {
        Ok(self.instance.mem.read_bytes(address, len)?.to_vec())
    }

    pub fn write_memory(&mut self, address: u32, bytes: &[u8]) -> VmResult<()> {
        self.instance.mem.write_bytes(address, bytes)
    }

    /// Reads a NUL-terminated string from data RAM.
    pub fn read_cstr(&self, address: u32) -> VmResult<String> {
        let mut bytes = Vec::new();
        let mut cursor = address;
        loop {
            let byte = self.instance.mem.read_u8(cursor)?;
            if byte == 0 {
                break;
            }
            bytes.push(byte);
            cursor = cursor.wrapping_add(1);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Calls a function pointer or trampoline address the host received.
    pub fn invoke_callback(&mut self, address: u32, args: &[Value]) -> VmResult<Value> {
        let func = self.instance.resolve_function(address)?;
        self.instance.call(func, args)
    }

    pub fn instance(&mut self) -> &mut Instance {
        self.instance
    }
}

/// One trampoline stub per VM function. Native code calling a trampoline
/// address lands in the dispatcher with the native arguments.
#[derive(Clone, Debug, Default)]
pub struct ClosureRegistry {
    slots: Vec<u32>,
    by_func: HashMap<u32, u32>,
}

impl ClosureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, func: u32) -> VmResult<u32> {
        if let Some(address) = self.by_func.get(&func) {
            return Ok(*address);
        }
        if self.slots.len() as u32 >= MAX_TRAMPOLINES {
            return Err(VmError::OutOfMemory("trampoline slots"));
        }
        let address = TRAMPOLINE_BASE + 4 * self.slots.len() as u32;
        self.slots.push(func);
        self.by_func.insert(func, address);
        Ok(address)
    }

    pub fn lookup(&self, address: u32) -> Option<u32> {
        let offset = address.checked_sub(TRAMPOLINE_BASE)?;
        if offset % 4 != 0 {
            return None;
        }
        self.slots.get((offset / 4) as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wide_values_take_even_register_pairs() {
        let layout = arg_layout(&[ValueType::Ptr, ValueType::I32, ValueType::F64]);
        assert_eq!(
            layout.placements,
            vec![Placement::Reg(0), Placement::Reg(1), Placement::Reg(2)]
        );
        let layout = arg_layout(&[ValueType::I32, ValueType::I64]);
        assert_eq!(layout.placements, vec![Placement::Reg(0), Placement::Reg(2)]);
        assert_eq!(layout.reg_words, 4);
    }

    #[test]
    fn overflow_goes_to_the_stack_in_order() {
        let types = [
            ValueType::I32,
            ValueType::I32,
            ValueType::I32,
            ValueType::I32,
            ValueType::I32,
            ValueType::I64,
            ValueType::I32,
        ];
        let layout = arg_layout(&types);
        assert_eq!(layout.placements[4], Placement::Reg(4));
        assert_eq!(layout.placements[5], Placement::Stack(0));
        assert_eq!(layout.placements[6], Placement::Stack(2));
        assert_eq!(layout.stack_words, 3);
    }

    #[test]
    fn variadic_words_match_the_native_convention() {
        let types = [ValueType::Ptr, ValueType::I32, ValueType::F64];
        let values = [Value::ptr(0x3FFB_0100), Value::i32(-7), Value::f64(2.5)];
        let args = marshal_args(&types, &values);
        let bits = 2.5f64.to_bits();
        assert_eq!(
            args.regs,
            [
                0x3FFB_0100,
                -7i32 as u32,
                bits as u32,
                (bits >> 32) as u32,
                0,
                0
            ]
        );
        assert!(args.stack.is_empty());
        assert_eq!(unmarshal_args(&types, &args), values.to_vec());
    }

    #[test]
    fn closures_are_reused_per_function() {
        let mut closures = ClosureRegistry::new();
        let a = closures.get_or_create(3).expect("first");
        let b = closures.get_or_create(5).expect("second");
        assert_eq!(closures.get_or_create(3), Ok(a));
        assert_eq!(b, a + 4);
        assert_eq!(closures.lookup(b), Some(5));
        assert_eq!(closures.lookup(b + 4), None);
    }
}
