use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{VmError, VmResult};
use crate::ffi::{
    ClosureRegistry, NativeArgs, NativeCall, NativeReturn, arg_layout, marshal_args,
    unmarshal_args,
};
use crate::helpers::{self, Helper};
use crate::interp;
use crate::jit::{self, CompileState, CompiledCode, JitConfig, JitFailure, JitSnapshot, JitState};
use crate::layout::{
    HDR_CALL_DEPTH, HDR_DEPTH_LIMIT, HDR_ENTRY_TABLE, HDR_FUNC_COUNT, HDR_FUNC_PTRS,
    HDR_GLOBALS, HDR_MAGIC, HDR_MEMORY, HDR_MEMORY_SIZE, INSTANCE_MAGIC, InstanceLayout,
};
use crate::memory::{AddressSpace, Arena, FirstFit};
use crate::module::{FunctionPointerMap, Module};
use crate::runtime::{BoundHost, RuntimeConfig};
use crate::value::{SLOT_SIZE, Value, ValueType};
use crate::xtensa::cpu::arg_registers;
use crate::xtensa::{A1, Cpu, CpuExit, IMPORT_BASE, TRAMPOLINE_BASE, disasm};

/// A VM-to-VM call in progress.
pub(crate) struct SlotCall {
    /// The callee's register file.
    pub(crate) regs: u32,
    args: u32,
    mark: u32,
}

/// One instantiated module: its data RAM, bound host functions and tiering
/// state.
///
/// Calls from the host, from helpers and from callback trampolines go
/// through the dispatcher, which decides per call between native code and
/// the interpreter. Interpreted code makes the same decision for its own
/// calls without leaving its loop, and compiled callers jump straight to
/// compiled callees.
pub struct Instance {
    pub(crate) module: Arc<Module>,
    config: RuntimeConfig,
    pub(crate) layout: InstanceLayout,
    pub(crate) mem: AddressSpace,
    hosts: Vec<Option<BoundHost>>,
    closures: ClosureRegistry,
    func_ptrs: FunctionPointerMap,
    table: Vec<Option<u32>>,
    frames: Arena,
    alloca: Arena,
    heap: FirstFit,
    pub(crate) jit: JitState,
    depth: u32,
    /// Where the next native entry puts its stack pointer. Moves down while
    /// native code is parked on a host call.
    native_stack_top: u32,
}

impl Instance {
    pub(crate) fn new(
        module: Arc<Module>,
        config: RuntimeConfig,
        layout: InstanceLayout,
        hosts: Vec<Option<BoundHost>>,
    ) -> VmResult<Self> {
        let mut mem = AddressSpace::new(config.iram_bytes, layout.dram_size);
        let functions = module.functions.len() as u32;
        let header = [
            (HDR_MAGIC, INSTANCE_MAGIC),
            (HDR_ENTRY_TABLE, layout.entry_table),
            (HDR_GLOBALS, layout.globals),
            (HDR_MEMORY, layout.memory),
            (HDR_MEMORY_SIZE, layout.memory_size),
            (HDR_FUNC_PTRS, layout.func_ptrs),
            (HDR_FUNC_COUNT, functions),
            (HDR_CALL_DEPTH, 0),
            (HDR_DEPTH_LIMIT, config.max_call_depth),
        ];
        for (offset, value) in header {
            mem.write_u32(layout.header + offset, value)?;
        }
        for (index, global) in module.globals.iter().enumerate() {
            mem.write_u64(layout.global_addr(index as u32), global.init.bits)?;
        }
        for segment in &module.data {
            mem.write_bytes(layout.memory + segment.offset, &segment.bytes)?;
        }
        let mut pointers = Vec::with_capacity(functions as usize);
        for func in 0..functions {
            mem.write_u32(layout.func_ptr(func), func)?;
            pointers.push((layout.func_ptr(func), func));
        }

        let jit = JitState::new(config.jit.clone(), &module, layout.entry_table);
        Ok(Self {
            table: module.table.clone(),
            func_ptrs: FunctionPointerMap::new(pointers),
            frames: Arena::new(layout.frames, layout.frames_size),
            alloca: Arena::new(layout.alloca, layout.alloca_size),
            heap: FirstFit::new(layout.heap, layout.heap_size, 8),
            native_stack_top: layout.stack_top,
            closures: ClosureRegistry::new(),
            depth: 0,
            module,
            config,
            layout,
            mem,
            hosts,
            jit,
        })
    }

    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn layout(&self) -> &InstanceLayout {
        &self.layout
    }

    pub fn memory(&self) -> &AddressSpace {
        &self.mem
    }

    pub fn memory_mut(&mut self) -> &mut AddressSpace {
        &mut self.mem
    }

    /// Address of byte 0 of linear memory.
    pub fn memory_base(&self) -> u32 {
        self.layout.memory
    }

    /// Reads `len` bytes at `offset` into linear memory.
    pub fn read_memory(&self, offset: u32, len: u32) -> VmResult<&[u8]> {
        self.check_linear(offset, len)?;
        self.mem.read_bytes(self.layout.memory + offset, len)
    }

    pub fn write_memory(&mut self, offset: u32, bytes: &[u8]) -> VmResult<()> {
        self.check_linear(offset, bytes.len() as u32)?;
        self.mem.write_bytes(self.layout.memory + offset, bytes)
    }

    fn check_linear(&self, offset: u32, len: u32) -> VmResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.layout.memory_size => Ok(()),
            _ => Err(VmError::MemoryFault {
                address: self.layout.memory.wrapping_add(offset),
                width: len.min(u8::MAX as u32) as u8,
            }),
        }
    }

    pub fn global(&self, index: u32) -> VmResult<Value> {
        let global = self
            .module
            .globals
            .get(index as usize)
            .ok_or(VmError::InvalidGlobal(index))?;
        Ok(Value::from_slot(global.ty, self.global_bits(index)?))
    }

    /// Host-side write; type-checked and refused for immutable globals.
    pub fn set_global(&mut self, index: u32, value: Value) -> VmResult<()> {
        let global = self
            .module
            .globals
            .get(index as usize)
            .ok_or(VmError::InvalidGlobal(index))?;
        if global.ty != value.ty {
            return Err(VmError::TypeMismatch {
                expected: global.ty,
                got: value.ty,
            });
        }
        self.set_global_bits(index, value.bits)
    }

    pub fn jit_config(&self) -> &JitConfig {
        self.jit.config()
    }

    /// Replaces the JIT configuration. Already installed code stays.
    pub fn set_jit_config(&mut self, config: JitConfig) {
        self.config.jit = config.clone();
        self.jit.set_config(config);
    }

    pub fn compile_state(&self, func: u32) -> CompileState {
        self.jit.state(func)
    }

    pub fn is_compiled(&self, func: u32) -> bool {
        self.jit.cache.lookup(func).is_some()
    }

    pub fn compiled_code(&self, func: u32) -> Option<&CompiledCode> {
        self.jit.cache.lookup(func)
    }

    pub fn jit_snapshot(&self) -> JitSnapshot {
        self.jit.snapshot(self.mem.exec_available())
    }

    pub fn dump_jit_info(&self) -> String {
        self.jit.dump_text(self.mem.exec_available())
    }

    /// Disassembly of the installed code for `func`, literal tables shown as
    /// data.
    pub fn disassemble(&self, func: u32) -> Option<Vec<String>> {
        let code = self.jit.cache.lookup(func)?;
        Some(disasm::disassemble(
            &self.mem,
            code.entry,
            code.size,
            &code.literal_ranges,
        ))
    }

    pub fn call_by_name(&mut self, name: &str, args: &[Value]) -> VmResult<Value> {
        let func = self
            .module
            .function_index(name)
            .ok_or_else(|| VmError::HostError(format!("no function named '{name}'")))?;
        self.call(func, args)
    }

    /// Calls `func` with typed arguments and returns its typed result.
    pub fn call(&mut self, func: u32, args: &[Value]) -> VmResult<Value> {
        let result_ty = self.check_args(func, args)?;
        let mark = self.frames.mark();
        let bits = self.run_with_args(func, args, None);
        self.frames.reset_to(mark);
        if self.depth == 0 {
            self.alloca.reset();
        }
        Ok(Value::from_slot(result_ty, bits?))
    }

    fn check_args(&self, func: u32, args: &[Value]) -> VmResult<ValueType> {
        let ty = self
            .module
            .function_type(func)
            .ok_or(VmError::InvalidFunction(func))?;
        if args.len() != ty.params.len() {
            return Err(VmError::ArgumentCount {
                function: func,
                expected: ty.params.len(),
                got: args.len(),
            });
        }
        for (expected, arg) in ty.params.iter().zip(args) {
            if *expected != arg.ty {
                return Err(VmError::TypeMismatch {
                    expected: *expected,
                    got: arg.ty,
                });
            }
        }
        Ok(ty.result())
    }

    /// Pushes a frame, writes `args` and runs `func` through the dispatcher,
    /// or straight at `native` when given. Returns the raw result slot.
    fn run_with_args(&mut self, func: u32, args: &[Value], native: Option<u32>) -> VmResult<u64> {
        let regs = self.push_frame(func)?;
        for (index, arg) in args.iter().enumerate() {
            self.mem.write_u64(regs + index as u32 * SLOT_SIZE, arg.bits)?;
        }
        match native {
            Some(entry) => {
                self.enter_call()?;
                let result = self.run_native(entry, regs);
                self.depth -= 1;
                result?;
            }
            None => self.invoke(func, regs)?,
        }
        self.mem.read_u64(regs)
    }

    fn push_frame(&mut self, func: u32) -> VmResult<u32> {
        let function = self
            .module
            .functions
            .get(func as usize)
            .ok_or(VmError::InvalidFunction(func))?;
        let bytes = (function.register_count.max(1) as u32) * SLOT_SIZE;
        let regs = self
            .frames
            .push(bytes)
            .ok_or(VmError::OutOfMemory("frame arena"))?;
        self.mem.fill(regs, 0, bytes)?;
        Ok(regs)
    }

    fn enter_call(&mut self) -> VmResult<()> {
        if self.depth >= self.config.max_call_depth {
            return Err(VmError::CallDepthExceeded(self.config.max_call_depth));
        }
        self.depth += 1;
        Ok(())
    }

    /// Runs `func` on the register file at `regs`. Arguments are already in
    /// the low slots; the result is left in slot 0.
    pub(crate) fn invoke(&mut self, func: u32, regs: u32) -> VmResult<()> {
        self.enter_call()?;
        let result = self.dispatch(func, regs);
        self.depth -= 1;
        result
    }

    fn dispatch(&mut self, func: u32, regs: u32) -> VmResult<()> {
        match self.native_entry(func)? {
            Some(entry) => self.run_entry(func, entry, regs),
            None => interp::execute(self, func, regs),
        }
    }

    /// Native entry point `func` should run at, compiling it first when it
    /// is hot and has never been tried. `None` means interpret it.
    pub(crate) fn native_entry(&mut self, func: u32) -> VmResult<Option<u32>> {
        let hot = self
            .module
            .functions
            .get(func as usize)
            .ok_or(VmError::InvalidFunction(func))?
            .hot;
        if !self.jit.config().enabled {
            return Ok(None);
        }
        if hot && self.jit.state(func) == CompileState::NotCompiled {
            // A failure is recorded and logged; the call is interpreted.
            let _ = self.compile_and_install(func);
        }
        Ok(self.jit.cache.lookup(func).map(|code| code.entry))
    }

    pub(crate) fn run_entry(&mut self, func: u32, entry: u32, regs: u32) -> VmResult<()> {
        self.jit.note_native_call(func);
        self.run_native(entry, regs)
    }

    /// Compiles `func` now regardless of its hot flag. Returns the code size.
    /// A function that already has code is not recompiled; one that failed
    /// before is retried.
    pub fn compile(&mut self, func: u32) -> Result<u32, JitFailure> {
        if func as usize >= self.module.functions.len() {
            return Err(JitFailure::OperandOutOfRange {
                offset: 0,
                what: "function index",
            });
        }
        if let Some(code) = self.jit.cache.lookup(func) {
            return Ok(code.size);
        }
        self.compile_and_install(func)
    }

    fn compile_and_install(&mut self, func: u32) -> Result<u32, JitFailure> {
        let result = jit::compile_function(&mut self.mem, &self.module, func, self.jit.config())
            .and_then(|code| {
                let size = code.size;
                let entry = code.entry;
                let slot = self.layout.entry_slot(func);
                match self.jit.cache.insert(&mut self.mem, func, code) {
                    Ok(_) => Ok((entry, size)),
                    Err(_) => Err(JitFailure::Install { address: slot }),
                }
            });
        match result {
            Ok((entry, size)) => {
                if let Some(code) = self.jit.cache.lookup(func).cloned() {
                    self.jit.record(func, Ok(&code));
                }
                debug!(function = func, entry, size, "installed native code");
                Ok(size)
            }
            Err(failure) => {
                let name = self
                    .module
                    .functions
                    .get(func as usize)
                    .map(|function| function.name.as_str())
                    .unwrap_or("?");
                warn!(
                    function = func,
                    name,
                    reason = %failure.message(),
                    "compilation failed, function stays interpreted"
                );
                self.jit.record(func, Err(failure.clone()));
                Err(failure)
            }
        }
    }

    /// Compiles every hot function that has no code yet. `progress` sees
    /// `(index, total, name)` before each attempt. Returns how many compiled.
    pub fn precompile<F>(&mut self, mut progress: F) -> usize
    where
        F: FnMut(usize, usize, Option<&str>),
    {
        let eligible: Vec<u32> = self
            .module
            .functions
            .iter()
            .enumerate()
            .filter(|(index, function)| function.hot && !self.is_compiled(*index as u32))
            .map(|(index, _)| index as u32)
            .collect();
        let total = eligible.len();
        let mut compiled = 0usize;
        for (index, func) in eligible.into_iter().enumerate() {
            let module = Arc::clone(&self.module);
            let name = module.functions.get(func as usize).map(|f| f.name.as_str());
            progress(index, total, name);
            if let Ok(size) = self.compile(func) {
                compiled += 1;
                info!(function = func, name = name.unwrap_or("?"), size, "precompiled");
            }
        }
        compiled
    }

    /// Compiles `func` into fresh instruction memory without installing it.
    pub fn compile_artifact(&mut self, func: u32) -> Result<CompiledCode, JitFailure> {
        jit::compile_function(&mut self.mem, &self.module, func, self.jit.config())
    }

    /// Runs a code artifact from [`Instance::compile_artifact`] as `func`.
    pub fn run_compiled(
        &mut self,
        code: &CompiledCode,
        func: u32,
        args: &[Value],
    ) -> VmResult<Value> {
        let result_ty = self.check_args(func, args)?;
        let mark = self.frames.mark();
        let bits = self.run_with_args(func, args, Some(code.entry));
        self.frames.reset_to(mark);
        if self.depth == 0 {
            self.alloca.reset();
        }
        Ok(Value::from_slot(result_ty, bits?))
    }

    pub fn release_artifact(&mut self, code: CompiledCode) -> bool {
        self.mem.free_exec(code.entry)
    }

    /// Runs native code at `entry` with the instance header in a2 and the
    /// register file in a3, serving host calls until it returns.
    fn run_native(&mut self, entry: u32, regs: u32) -> VmResult<()> {
        let depth_word = self.layout.header + HDR_CALL_DEPTH;
        self.mem.write_u32(depth_word, self.depth)?;
        let mut cpu = Cpu::new(self.layout.stack_limit, self.config.native_step_budget);
        cpu.enter(entry, self.native_stack_top, &[self.layout.header, regs]);
        loop {
            match cpu.run(&mut self.mem)? {
                CpuExit::Returned => return Ok(()),
                CpuExit::HostCall { target, kind } => {
                    let sp = cpu.reg(A1);
                    let mut words = [0u32; 6];
                    for (word, reg) in words.iter_mut().zip(arg_registers(kind)) {
                        *word = cpu.reg(reg);
                    }
                    let saved_top = self.native_stack_top;
                    self.native_stack_top = sp & !15;
                    // Direct calls between compiled functions only moved the
                    // header word, so calls made from here count from it.
                    let native_depth = self.mem.read_u32(depth_word)?;
                    let outer_depth = std::mem::replace(&mut self.depth, native_depth);
                    let result = self.host_call(target, words, sp);
                    self.depth = outer_depth;
                    self.native_stack_top = saved_top;
                    self.mem.write_u32(depth_word, native_depth)?;
                    let (lo, hi) = result?;
                    cpu.complete_host_call(kind, lo, hi);
                }
            }
        }
    }

    /// Serves a call from native code to a stub address.
    fn host_call(&mut self, target: u32, words: [u32; 6], sp: u32) -> VmResult<(u32, u32)> {
        if let Some(helper) = Helper::from_address(target) {
            return helpers::invoke(self, helper, words);
        }
        if (IMPORT_BASE..TRAMPOLINE_BASE).contains(&target) && target % 4 == 0 {
            let import = (target - IMPORT_BASE) / 4;
            let types = self
                .module
                .import_type(import)
                .ok_or(VmError::InvalidImport(import))?
                .params
                .clone();
            let args = self.native_args(&types, words, sp)?;
            let ret = self.call_host(import, types, args)?;
            return Ok((ret.lo, ret.hi));
        }
        if let Some(func) = self.closures.lookup(target) {
            let types = self
                .module
                .function_type(func)
                .ok_or(VmError::InvalidFunction(func))?
                .params
                .clone();
            let args = self.native_args(&types, words, sp)?;
            let values = unmarshal_args(&types, &args);
            let result = self.call(func, &values)?;
            return Ok((result.lo(), result.hi()));
        }
        Err(VmError::NativeFault {
            pc: target,
            message: "call to an unknown host routine".to_string(),
        })
    }

    /// Collects the argument words a native caller passed for `types`.
    fn native_args(&self, types: &[ValueType], regs: [u32; 6], sp: u32) -> VmResult<NativeArgs> {
        let layout = arg_layout(types);
        let mut stack = Vec::with_capacity(layout.stack_words);
        for word in 0..layout.stack_words as u32 {
            stack.push(self.mem.read_u32(sp + 4 * word)?);
        }
        Ok(NativeArgs { regs, stack })
    }

    /// Calls the host function bound to `import`. A stateful host function is
    /// taken out of its slot for the duration of the call, so re-entering it
    /// is reported instead of aliased.
    fn call_host(
        &mut self,
        import: u32,
        types: Vec<ValueType>,
        args: NativeArgs,
    ) -> VmResult<NativeReturn> {
        let bound = self
            .hosts
            .get_mut(import as usize)
            .ok_or(VmError::InvalidImport(import))?
            .take();
        match bound {
            Some(BoundHost::Static(function)) => {
                if let Some(slot) = self.hosts.get_mut(import as usize) {
                    *slot = Some(BoundHost::Static(function));
                }
                let mut call = NativeCall::new(self, import, types, args);
                function(&mut call)
            }
            Some(BoundHost::Dynamic(mut function)) => {
                let result = {
                    let mut call = NativeCall::new(self, import, types, args);
                    function.call(&mut call)
                };
                if let Some(slot) = self.hosts.get_mut(import as usize) {
                    *slot = Some(BoundHost::Dynamic(function));
                }
                result
            }
            None => {
                let name = self
                    .module
                    .imports
                    .get(import as usize)
                    .map(|import| import.name.clone())
                    .unwrap_or_default();
                Err(VmError::HostReentered(name))
            }
        }
    }

    /// Calls `import` with its declared parameters taken from the register
    /// file at `regs`; the result goes to slot 0.
    pub(crate) fn call_import_slots(&mut self, import: u32, regs: u32) -> VmResult<()> {
        let descriptor = self
            .module
            .imports
            .get(import as usize)
            .ok_or(VmError::InvalidImport(import))?;
        let callbacks = descriptor.callback_slots;
        let ty = self
            .module
            .import_type(import)
            .ok_or(VmError::InvalidImport(import))?
            .clone();
        let mut values = Vec::with_capacity(ty.params.len());
        for (index, param) in ty.params.iter().enumerate() {
            let bits = self.mem.read_u64(regs + index as u32 * SLOT_SIZE)?;
            let mut value = Value::from_slot(*param, bits);
            if index < 32 && callbacks & (1 << index) != 0 {
                value.bits = self.make_closure(value.lo())? as u64;
            }
            values.push(value);
        }
        let args = marshal_args(&ty.params, &values);
        let ret = self.call_host(import, ty.params.clone(), args)?;
        self.store_result(ty.result(), regs, ret)
    }

    /// Calls a variadic import with the per-call types `types`.
    pub(crate) fn call_variadic_types(
        &mut self,
        import: u32,
        types: Vec<ValueType>,
        regs: u32,
    ) -> VmResult<()> {
        let result = self
            .module
            .import_type(import)
            .ok_or(VmError::InvalidImport(import))?
            .result();
        let mut values = Vec::with_capacity(types.len());
        for (index, ty) in types.iter().enumerate() {
            let bits = self.mem.read_u64(regs + index as u32 * SLOT_SIZE)?;
            values.push(Value::from_slot(*ty, bits));
        }
        let args = marshal_args(&types, &values);
        let ret = self.call_host(import, types, args)?;
        self.store_result(result, regs, ret)
    }

    /// Helper entry for variadic calls: the tag bytes live in data RAM.
    pub(crate) fn call_variadic(
        &mut self,
        import: u32,
        tags: u32,
        count: u32,
        regs: u32,
    ) -> VmResult<()> {
        let mut types = Vec::with_capacity(count as usize);
        for index in 0..count {
            let tag = self.mem.read_u8(tags + index)?;
            let ty = ValueType::from_tag(tag)
                .filter(|ty| *ty != ValueType::Void)
                .ok_or_else(|| VmError::HostError(format!("invalid variadic type tag {tag}")))?;
            types.push(ty);
        }
        self.call_variadic_types(import, types, regs)
    }

    fn store_result(&mut self, ty: ValueType, regs: u32, ret: NativeReturn) -> VmResult<()> {
        match ty {
            ValueType::Void => Ok(()),
            ty if ty.is_wide() => self
                .mem
                .write_u64(regs, ((ret.hi as u64) << 32) | ret.lo as u64),
            _ => self.mem.write_u32(regs, ret.lo),
        }
    }

    /// Runs `func` with its parameters copied from the register file at
    /// `args`, then copies its result slot back to `args`.
    pub(crate) fn call_slots(&mut self, func: u32, args: u32) -> VmResult<()> {
        let call = self.begin_slots(func, args)?;
        let result = self.dispatch(func, call.regs);
        let copied = self.finish_slots(call, result.is_ok());
        result.and(copied)
    }

    /// Starts a call to `func` with its parameters copied from the register
    /// file at `args`. The call counts towards the depth limit until it is
    /// handed to [`Instance::finish_slots`].
    pub(crate) fn begin_slots(&mut self, func: u32, args: u32) -> VmResult<SlotCall> {
        let params = self
            .module
            .function_type(func)
            .ok_or(VmError::InvalidFunction(func))?
            .params
            .len() as u32;
        self.enter_call()?;
        let mark = self.frames.mark();
        let regs = self.push_frame(func).and_then(|regs| {
            self.mem.copy_within(regs, args, params * SLOT_SIZE)?;
            Ok(regs)
        });
        match regs {
            Ok(regs) => Ok(SlotCall { regs, args, mark }),
            Err(err) => {
                self.frames.reset_to(mark);
                self.depth -= 1;
                Err(err)
            }
        }
    }

    /// Releases the callee's frame, copying its result slot back first when
    /// it returned normally.
    pub(crate) fn finish_slots(&mut self, call: SlotCall, returned: bool) -> VmResult<()> {
        let result = if returned {
            self.mem.copy_within(call.args, call.regs, SLOT_SIZE)
        } else {
            Ok(())
        };
        self.frames.reset_to(call.mark);
        self.depth -= 1;
        result
    }

    /// Indirect call through `pointer`. The callee's parameters start at
    /// register `base` of `caller`'s register file at `regs`.
    pub(crate) fn call_indirect_slots(
        &mut self,
        pointer: u32,
        caller: u32,
        regs: u32,
        base: u32,
    ) -> VmResult<()> {
        let func = self.indirect_target(pointer, caller, base)?;
        self.call_slots(func, regs + base * SLOT_SIZE)
    }

    /// Resolves `pointer` and checks that the callee's parameters, starting
    /// at register `base`, fit in `caller`'s register file.
    pub(crate) fn indirect_target(&self, pointer: u32, caller: u32, base: u32) -> VmResult<u32> {
        let func = self.resolve_function(pointer)?;
        let params = self
            .module
            .function_type(func)
            .ok_or(VmError::InvalidFunction(func))?
            .params
            .len() as u32;
        let count = self
            .module
            .functions
            .get(caller as usize)
            .map(|function| function.register_count.max(1) as u32)
            .ok_or(VmError::InvalidFunction(caller))?;
        let last = base + params.max(1) - 1;
        if last >= count {
            return Err(VmError::InvalidRegister {
                function: caller,
                register: last.min(u8::MAX as u32) as u8,
            });
        }
        Ok(func)
    }

    pub(crate) fn function_pointer(&self, func: u32) -> VmResult<u32> {
        if func as usize >= self.module.functions.len() {
            return Err(VmError::InvalidFunction(func));
        }
        Ok(self.layout.func_ptr(func))
    }

    /// Maps a function pointer or trampoline address back to its function.
    pub(crate) fn resolve_function(&self, pointer: u32) -> VmResult<u32> {
        self.func_ptrs
            .lookup(pointer)
            .or_else(|| self.closures.lookup(pointer))
            .ok_or(VmError::InvalidIndirectTarget(pointer))
    }

    /// Native trampoline for a function pointer. Null stays null.
    pub(crate) fn make_closure(&mut self, pointer: u32) -> VmResult<u32> {
        if pointer == 0 || self.closures.lookup(pointer).is_some() {
            return Ok(pointer);
        }
        let func = self
            .func_ptrs
            .lookup(pointer)
            .ok_or(VmError::InvalidIndirectTarget(pointer))?;
        self.closures.get_or_create(func)
    }

    pub(crate) fn global_address(&self, index: u32) -> VmResult<u32> {
        if index as usize >= self.module.globals.len() {
            return Err(VmError::InvalidGlobal(index));
        }
        Ok(self.layout.global_addr(index))
    }

    pub(crate) fn global_bits(&self, index: u32) -> VmResult<u64> {
        self.mem.read_u64(self.global_address(index)?)
    }

    pub(crate) fn set_global_bits(&mut self, index: u32, bits: u64) -> VmResult<()> {
        let global = self
            .module
            .globals
            .get(index as usize)
            .ok_or(VmError::InvalidGlobal(index))?;
        if !global.mutable {
            return Err(VmError::InvalidGlobal(index));
        }
        let address = self.layout.global_addr(index);
        if global.ty.is_wide() {
            self.mem.write_u64(address, bits)
        } else {
            self.mem.write_u32(address, bits as u32)
        }
    }

    pub(crate) fn table_get(&self, index: u32) -> VmResult<u32> {
        match self.table.get(index as usize) {
            Some(Some(func)) => Ok(self.layout.func_ptr(*func)),
            Some(None) => Ok(0),
            None => Err(VmError::InvalidTableIndex(index)),
        }
    }

    pub(crate) fn table_set(&mut self, index: u32, pointer: u32) -> VmResult<()> {
        let entry = if pointer == 0 {
            None
        } else {
            Some(self.resolve_function(pointer)?)
        };
        let slot = self
            .table
            .get_mut(index as usize)
            .ok_or(VmError::InvalidTableIndex(index))?;
        *slot = entry;
        Ok(())
    }

    /// Bump allocation released when the outermost call returns.
    pub(crate) fn alloca(&mut self, size: u32) -> VmResult<u32> {
        self.alloca
            .push(size)
            .ok_or(VmError::OutOfMemory("alloca arena"))
    }

    /// Heap allocation; 0 when the heap is exhausted.
    pub(crate) fn heap_alloc(&mut self, size: u32) -> u32 {
        self.heap.alloc(size).unwrap_or(0)
    }

    pub(crate) fn heap_free(&mut self, pointer: u32) {
        if pointer != 0 && !self.heap.free(pointer) {
            debug!(pointer, "free of an address the heap does not own");
        }
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        self.jit.cache.free_all(&mut self.mem);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::BytecodeBuilder;
    use crate::module::{FuncType, ModuleBuilder};
    use crate::runtime::Runtime;

    fn identity_module() -> Arc<Module> {
        let mut code = BytecodeBuilder::new();
        code.end();
        let mut builder = ModuleBuilder::new();
        builder.add_function(
            "id",
            FuncType::new(&[ValueType::I32], &[ValueType::I32]),
            1,
            code.finish().expect("bytecode"),
            false,
        );
        builder.add_global(ValueType::I32, false, Value::i32(9));
        builder.memory_size(64);
        builder.build().expect("module")
    }

    #[test]
    fn call_checks_argument_count_and_types() {
        let mut instance = Runtime::default()
            .instantiate(identity_module())
            .expect("instance");
        assert_eq!(instance.call(0, &[Value::i32(4)]), Ok(Value::i32(4)));
        assert!(matches!(
            instance.call(0, &[]),
            Err(VmError::ArgumentCount { expected: 1, got: 0, .. })
        ));
        assert_eq!(
            instance.call(0, &[Value::i64(4)]),
            Err(VmError::TypeMismatch {
                expected: ValueType::I32,
                got: ValueType::I64
            })
        );
    }

    #[test]
    fn header_and_globals_are_initialized() {
        let instance = Runtime::default()
            .instantiate(identity_module())
            .expect("instance");
        let header = instance.layout().header;
        assert_eq!(instance.memory().read_u32(header), Ok(INSTANCE_MAGIC));
        assert_eq!(instance.global(0), Ok(Value::i32(9)));
        let ptr = instance.function_pointer(0).expect("pointer");
        assert_eq!(instance.resolve_function(ptr), Ok(0));
        assert_eq!(
            instance.resolve_function(ptr + 1),
            Err(VmError::InvalidIndirectTarget(ptr + 1))
        );
    }

    #[test]
    fn immutable_globals_reject_writes() {
        let mut instance = Runtime::default()
            .instantiate(identity_module())
            .expect("instance");
        assert_eq!(
            instance.set_global(0, Value::i32(1)),
            Err(VmError::InvalidGlobal(0))
        );
    }

    #[test]
    fn linear_memory_accessors_are_bounds_checked() {
        let mut instance = Runtime::default()
            .instantiate(identity_module())
            .expect("instance");
        instance.write_memory(60, &[1, 2, 3, 4]).expect("in bounds");
        assert_eq!(instance.read_memory(60, 4), Ok(&[1u8, 2, 3, 4][..]));
        assert!(instance.write_memory(62, &[0; 4]).is_err());
    }
}
