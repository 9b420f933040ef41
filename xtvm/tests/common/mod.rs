#![allow(dead_code, unused_imports)]

use std::sync::{Arc, Mutex};

pub use xtvm::{
    Bin32, Bin64, BytecodeBuilder, CompileState, Cond, Conv, FloatCond, FloatOp, FuncType,
    HelperConvention, HostFunction, Instance, JitConfig, JitFailure, LoadKind, Module,
    ModuleBuilder, NativeCall, NativeReturn, Runtime, RuntimeConfig, StoreKind,
    UnresolvedBranchPolicy, Value, ValueType, VmError, VmResult,
};

pub fn bytes(code: &mut BytecodeBuilder) -> Vec<u8> {
    std::mem::take(code).finish().expect("bytecode should assemble")
}

pub fn i32_fn(params: usize) -> FuncType {
    FuncType::new(&vec![ValueType::I32; params], &[ValueType::I32])
}

pub fn runtime(jit: bool) -> Runtime {
    let mut config = RuntimeConfig::default();
    config.jit.enabled = jit;
    Runtime::new(config)
}

pub fn runtime_with(jit: JitConfig) -> Runtime {
    Runtime::new(RuntimeConfig {
        jit,
        ..RuntimeConfig::default()
    })
}

/// Runs `entry` once interpreted and once with the JIT on and returns both
/// results, asserting the native run really went through compiled code.
pub fn both_tiers(
    module: &Arc<Module>,
    setup: impl Fn(&mut Runtime),
    entry: &str,
    args: &[Value],
) -> (VmResult<Value>, VmResult<Value>) {
    let mut interp = runtime(false);
    setup(&mut interp);
    let mut interp = interp
        .instantiate(Arc::clone(module))
        .expect("interpreted instance");
    let slow = interp.call_by_name(entry, args);
    assert_eq!(interp.jit_snapshot().native_calls, 0);

    let mut native = runtime(true);
    setup(&mut native);
    let mut native = native
        .instantiate(Arc::clone(module))
        .expect("native instance");
    let fast = native.call_by_name(entry, args);
    let func = module.function_index(entry).expect("entry exists");
    assert!(
        native.is_compiled(func),
        "{entry} did not compile:\n{}",
        native.dump_jit_info()
    );
    (slow, fast)
}

pub fn no_hosts(_: &mut Runtime) {}

/// Recursive Fibonacci as function `me` of its module.
pub fn fib_code(me: u16) -> Vec<u8> {
    let mut code = BytecodeBuilder::new();
    code.const_i32(1, 2)
        .cmp_i32(Cond::LtS, 2, 0, 1)
        .br_if(2, "base")
        .addi_i32(1, 0, -1)
        .call(me, 1)
        .addi_i32(2, 0, -2)
        .call(me, 2)
        .add_i32(0, 1, 2)
        .end()
        .label("base")
        .end();
    bytes(&mut code)
}

pub fn fib_module(hot: bool) -> Arc<Module> {
    let mut builder = ModuleBuilder::new();
    builder.add_function("fib", i32_fn(1), 3, fib_code(0), hot);
    builder.build().expect("module")
}

/// `countdown(n)` recurses once per level and returns `n`.
pub fn countdown_module() -> Arc<Module> {
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
    builder.add_function("countdown", i32_fn(1), 2, bytes(&mut code), true);
    builder.build().expect("module")
}

/// Every argument word a host function saw, one entry per call.
#[derive(Clone, Default)]
pub struct CallLog {
    pub calls: Arc<Mutex<Vec<([u32; 6], Vec<u32>, Vec<Value>)>>>,
}

impl CallLog {
    pub fn take(&self) -> Vec<([u32; 6], Vec<u32>, Vec<Value>)> {
        std::mem::take(&mut *self.calls.lock().expect("log lock"))
    }
}

/// Records its argument words and returns `result`.
pub struct RecordingHost {
    pub log: CallLog,
    pub result: NativeReturn,
}

impl HostFunction for RecordingHost {
    fn call(&mut self, call: &mut NativeCall<'_>) -> VmResult<NativeReturn> {
        self.log.calls.lock().expect("log lock").push((
            *call.reg_words(),
            call.stack_words().to_vec(),
            call.values(),
        ));
        Ok(self.result)
    }
}

pub fn register_recorder(runtime: &mut Runtime, name: &str, log: &CallLog, result: NativeReturn) {
    let log = log.clone();
    runtime.register(name, move || {
        Box::new(RecordingHost {
            log: log.clone(),
            result,
        })
    });
}
