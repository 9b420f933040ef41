//! Where an instance's structures live in data RAM.
//!
//! Compiled code only knows the instance header address (passed in a2 on
//! entry); everything else is reached through the header words below.

use crate::memory::{DRAM_BASE, round_up};
use crate::module::Module;
use crate::runtime::RuntimeConfig;
use crate::value::SLOT_SIZE;

pub const HDR_MAGIC: u32 = 0;
/// Address of the per-function native entry table (0 = not compiled).
pub const HDR_ENTRY_TABLE: u32 = 4;
pub const HDR_GLOBALS: u32 = 8;
/// Base address of linear memory.
pub const HDR_MEMORY: u32 = 12;
pub const HDR_MEMORY_SIZE: u32 = 16;
pub const HDR_FUNC_PTRS: u32 = 20;
pub const HDR_FUNC_COUNT: u32 = 24;
/// VM call depth of the running native code. Written on every native entry
/// and kept current by direct calls between compiled functions.
pub const HDR_CALL_DEPTH: u32 = 28;
pub const HDR_DEPTH_LIMIT: u32 = 32;
pub const HEADER_SIZE: u32 = 36;

pub const INSTANCE_MAGIC: u32 = 0x4D56_5458;

const REGION_ALIGN: u32 = 16;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceLayout {
    pub header: u32,
    pub globals: u32,
    pub entry_table: u32,
    /// One word per function holding its index. The address of that word is
    /// the function's pointer value.
    pub func_ptrs: u32,
    pub memory: u32,
    pub memory_size: u32,
    pub frames: u32,
    pub frames_size: u32,
    pub alloca: u32,
    pub alloca_size: u32,
    pub heap: u32,
    pub heap_size: u32,
    /// Lowest address the native stack may grow down to.
    pub stack_limit: u32,
    pub stack_top: u32,
    pub dram_size: u32,
}

impl InstanceLayout {
    pub fn compute(module: &Module, config: &RuntimeConfig) -> Self {
        let mut cursor = DRAM_BASE;
        let mut region = |size: u32| {
            let start = round_up(cursor, REGION_ALIGN);
            cursor = start + size;
            start
        };
        let functions = module.functions.len() as u32;
        let header = region(HEADER_SIZE);
        let globals = region(module.globals.len() as u32 * SLOT_SIZE);
        let entry_table = region(functions * 4);
        let func_ptrs = region(functions * 4);
        let memory = region(module.memory_size);
        let frames = region(config.frame_arena_bytes);
        let alloca = region(config.alloca_bytes);
        let heap = region(config.heap_bytes);
        let stack_limit = region(config.native_stack_bytes);
        let stack_top = round_up(cursor, REGION_ALIGN);
        Self {
            header,
            globals,
            entry_table,
            func_ptrs,
            memory,
            memory_size: module.memory_size,
            frames,
            frames_size: config.frame_arena_bytes,
            alloca,
            alloca_size: config.alloca_bytes,
            heap,
            heap_size: config.heap_bytes,
            stack_limit,
            stack_top,
            dram_size: stack_top - DRAM_BASE,
        }
    }

    pub fn global_addr(&self, index: u32) -> u32 {
        self.globals + index * SLOT_SIZE
    }

    pub fn entry_slot(&self, func: u32) -> u32 {
        self.entry_table + func * 4
    }

    pub fn func_ptr(&self, func: u32) -> u32 {
        self.func_ptrs + func * 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{FuncType, ModuleBuilder};
    use crate::value::{Value, ValueType};

    #[test]
    fn regions_are_disjoint_and_aligned() {
        let mut builder = ModuleBuilder::new();
        builder.add_function("a", FuncType::new(&[], &[]), 1, vec![0xA4], false);
        builder.add_function("b", FuncType::new(&[], &[]), 1, vec![0xA4], false);
        builder.add_global(ValueType::I32, true, Value::i32(0));
        builder.memory_size(100);
        let module = builder.build().expect("module");
        let layout = InstanceLayout::compute(&module, &RuntimeConfig::default());
        let starts = [
            layout.header,
            layout.globals,
            layout.entry_table,
            layout.func_ptrs,
            layout.memory,
            layout.frames,
            layout.alloca,
            layout.heap,
            layout.stack_limit,
            layout.stack_top,
        ];
        assert!(starts.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(starts.iter().all(|start| start % 16 == 0));
        assert_eq!(layout.func_ptr(1), layout.func_ptrs + 4);
        assert_eq!(layout.dram_size, layout.stack_top - DRAM_BASE);
    }
}
