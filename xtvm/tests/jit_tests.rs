mod common;

use common::*;

fn single(name: &str, ty: FuncType, regs: u16, code: Vec<u8>) -> std::sync::Arc<Module> {
    let mut builder = ModuleBuilder::new();
    builder.add_function(name, ty, regs, code, true);
    builder.memory_size(4096);
    builder.build().expect("module")
}

fn iterative_fib() -> std::sync::Arc<Module> {
    let mut code = BytecodeBuilder::new();
    code.const_i32(1, 0)
        .const_i32(2, 1)
        .label("loop")
        .eqz_i32(4, 0)
        .br_if(4, "done")
        .add_i32(3, 1, 2)
        .mov(1, 2)
        .mov(2, 3)
        .addi_i32(0, 0, -1)
        .jmp("loop")
        .label("done")
        .mov(0, 1)
        .end();
    single("fib_loop", i32_fn(1), 5, bytes(&mut code))
}

#[test]
fn backward_loop_fibonacci_compiles_and_returns_55() {
    let mut instance = runtime(true)
        .instantiate(iterative_fib())
        .expect("instance");
    assert_eq!(instance.call(0, &[Value::i32(10)]), Ok(Value::i32(55)));
    assert_eq!(instance.compile_state(0), CompileState::Compiled);
    assert_eq!(instance.jit_snapshot().native_calls, 1);

    let lines = instance.disassemble(0).expect("native code");
    assert!(lines.first().is_some_and(|line| line.contains("entry")));
    assert!(lines.iter().any(|line| line.contains("retw")));
}

#[test]
fn recursive_fibonacci_uses_direct_native_calls() {
    let mut instance = runtime(true)
        .instantiate(fib_module(true))
        .expect("instance");
    assert_eq!(instance.call(0, &[Value::i32(10)]), Ok(Value::i32(55)));
    assert_eq!(instance.call(0, &[Value::i32(20)]), Ok(Value::i32(6765)));
    // Recursion runs native to native; only host entries go through the
    // dispatcher.
    assert_eq!(instance.jit_snapshot().native_calls, 2);
}

#[test]
fn long_running_hot_functions_finish_in_both_tiers() {
    let (slow, fast) = both_tiers(&fib_module(true), no_hosts, "fib", &[Value::i32(25)]);
    assert_eq!(slow, Ok(Value::i32(75025)));
    assert_eq!(fast, slow);
}

#[test]
fn step_budget_bounds_native_entries_when_set() {
    let config = RuntimeConfig {
        native_step_budget: Some(1000),
        ..RuntimeConfig::default()
    };
    let mut instance = Runtime::new(config)
        .instantiate(fib_module(true))
        .expect("instance");
    assert_eq!(
        instance.call(0, &[Value::i32(25)]),
        Err(VmError::StepBudgetExceeded(1000))
    );
    assert_eq!(instance.call(0, &[Value::i32(2)]), Ok(Value::i32(1)));
}

#[test]
fn call_depth_limit_is_the_same_in_both_tiers() {
    let limit = RuntimeConfig::default().max_call_depth;
    let module = countdown_module();

    // The outermost call is depth 1, so n = limit - 1 is the deepest that fits.
    let deepest = Value::i32(limit as i32 - 1);
    let (slow, fast) = both_tiers(&module, no_hosts, "countdown", &[deepest]);
    assert_eq!(slow, Ok(deepest));
    assert_eq!(fast, slow);

    let too_deep = Value::i32(limit as i32);
    let (slow, fast) = both_tiers(&module, no_hosts, "countdown", &[too_deep]);
    assert_eq!(slow, Err(VmError::CallDepthExceeded(limit)));
    assert_eq!(fast, slow);
}

#[test]
fn hitting_the_depth_limit_leaves_the_instance_usable() {
    for jit in [false, true] {
        let mut instance = runtime(jit)
            .instantiate(countdown_module())
            .expect("instance");
        assert!(matches!(
            instance.call(0, &[Value::i32(1000)]),
            Err(VmError::CallDepthExceeded(_))
        ));
        assert_eq!(instance.call(0, &[Value::i32(200)]), Ok(Value::i32(200)));
        assert_eq!(instance.is_compiled(0), jit);
    }
}

#[test]
fn cold_functions_stay_interpreted_until_forced() {
    let mut instance = runtime(true)
        .instantiate(fib_module(false))
        .expect("instance");
    assert_eq!(instance.call(0, &[Value::i32(12)]), Ok(Value::i32(144)));
    assert_eq!(instance.compile_state(0), CompileState::NotCompiled);
    assert_eq!(instance.precompile(|_, _, _| {}), 0);

    let size = instance.compile(0).expect("forced compile");
    assert!(size > 0);
    assert_eq!(instance.compile(0), Ok(size));
    assert_eq!(instance.call(0, &[Value::i32(12)]), Ok(Value::i32(144)));
    assert_eq!(instance.jit_snapshot().native_calls, 1);
}

#[test]
fn precompile_reports_progress_for_hot_functions() {
    let mut builder = ModuleBuilder::new();
    builder.add_function("fib", i32_fn(1), 3, fib_code(0), true);
    builder.add_function("cold", i32_fn(1), 3, fib_code(1), false);
    builder.add_function("fib2", i32_fn(1), 3, fib_code(2), true);
    let module = builder.build().expect("module");
    let mut instance = runtime(true).instantiate(module).expect("instance");

    let mut seen = Vec::new();
    let compiled = instance.precompile(|index, total, name| {
        seen.push((index, total, name.map(str::to_string)));
    });
    assert_eq!(compiled, 2);
    assert_eq!(
        seen,
        vec![
            (0, 2, Some("fib".to_string())),
            (1, 2, Some("fib2".to_string())),
        ]
    );
    assert!(!instance.is_compiled(1));
    assert_eq!(instance.precompile(|_, _, _| {}), 0);
}

#[test]
fn arithmetic_agrees_between_tiers() {
    let mut code = BytecodeBuilder::new();
    code.bin32(Bin32::Mul, 2, 0, 1)
        .bin32(Bin32::DivS, 3, 0, 1)
        .bin32(Bin32::RemU, 4, 0, 1)
        .bin32(Bin32::Shl, 5, 0, 1)
        .bin32(Bin32::ShrS, 6, 0, 1)
        .bin32(Bin32::Xor, 2, 2, 3)
        .add_i32(2, 2, 4)
        .bin32(Bin32::Xor, 2, 2, 5)
        .sub_i32(2, 2, 6)
        .cmp_i32(Cond::GtU, 7, 0, 1)
        .add_i32(2, 2, 7)
        .bin32(Bin32::ShrU, 7, 0, 1)
        .bin32(Bin32::Or, 0, 2, 7)
        .end();
    let module = single("mix32", i32_fn(2), 8, bytes(&mut code));
    let inputs = [
        (7, 3),
        (-7, 2),
        (5, 0),
        (i32::MIN, -1),
        (123_456, 33),
        (-1, 31),
        (0x1234_5678, 0x7FFF_FFFF),
    ];
    for (a, b) in inputs {
        let args = [Value::i32(a), Value::i32(b)];
        let (slow, fast) = both_tiers(&module, no_hosts, "mix32", &args);
        assert!(slow.is_ok(), "interpreter failed on ({a}, {b}): {slow:?}");
        assert_eq!(slow, fast, "tiers disagree on ({a}, {b})");
    }
}

#[test]
fn division_by_zero_yields_zero_in_both_tiers() {
    let mut code = BytecodeBuilder::new();
    code.bin32(Bin32::DivU, 2, 0, 1)
        .bin32(Bin32::RemS, 3, 0, 1)
        .add_i32(0, 2, 3)
        .end();
    let module = single("div", i32_fn(2), 4, bytes(&mut code));
    let (slow, fast) = both_tiers(&module, no_hosts, "div", &[Value::i32(9), Value::i32(0)]);
    assert_eq!(slow, Ok(Value::i32(0)));
    assert_eq!(fast, Ok(Value::i32(0)));

    let mut code = BytecodeBuilder::new();
    code.bin64(Bin64::DivS, 0, 0, 1).end();
    let ty = FuncType::new(&[ValueType::I64, ValueType::I64], &[ValueType::I64]);
    let module = single("div64", ty, 2, bytes(&mut code));
    let (slow, fast) = both_tiers(&module, no_hosts, "div64", &[Value::i64(-9), Value::i64(0)]);
    assert_eq!(slow, Ok(Value::i64(0)));
    assert_eq!(fast, Ok(Value::i64(0)));
}

#[test]
fn wide_arithmetic_carries_across_words() {
    let ty = FuncType::new(&[ValueType::I64, ValueType::I64], &[ValueType::I64]);
    let cases: [(Bin64, i64, i64, i64); 5] = [
        (Bin64::Add, u32::MAX as i64, 1, 1 << 32),
        (Bin64::Sub, 1 << 32, 1, u32::MAX as i64),
        (Bin64::Mul, 0x1_0000_0001, 3, 0x3_0000_0003),
        (Bin64::Xor, -1, 0x0F0F_0000_F0F0, !0x0F0F_0000_F0F0),
        (Bin64::ShrU, -1, 60, 0xF),
    ];
    for (op, a, b, expected) in cases {
        let mut code = BytecodeBuilder::new();
        code.bin64(op, 0, 0, 1).end();
        let module = single("op64", ty.clone(), 2, bytes(&mut code));
        let (slow, fast) = both_tiers(&module, no_hosts, "op64", &[Value::i64(a), Value::i64(b)]);
        assert_eq!(slow, Ok(Value::i64(expected)), "{op:?} interpreted");
        assert_eq!(fast, Ok(Value::i64(expected)), "{op:?} native");
    }
}

#[test]
fn wide_comparisons_and_conversions_agree() {
    let mut code = BytecodeBuilder::new();
    code.cmp_i64(Cond::LtS, 2, 0, 1)
        .cmp_i64(Cond::Eq, 3, 0, 1)
        .convert(Conv::WrapI64, 4, 0)
        .convert(Conv::Sext8, 4, 4)
        .bin32(Bin32::Shl, 3, 3, 2)
        .add_i32(2, 2, 3)
        .add_i32(2, 2, 4)
        .convert(Conv::ExtendI32S, 0, 2)
        .end();
    let ty = FuncType::new(&[ValueType::I64, ValueType::I64], &[ValueType::I64]);
    let module = single("cmp64", ty, 5, bytes(&mut code));
    for (a, b) in [(-5i64, 3i64), (7, 7), (0x1_0000_00F0, 0x1_0000_00F0), (1 << 40, -1)] {
        let args = [Value::i64(a), Value::i64(b)];
        let (slow, fast) = both_tiers(&module, no_hosts, "cmp64", &args);
        assert!(slow.is_ok());
        assert_eq!(slow, fast, "tiers disagree on ({a}, {b})");
    }
}

#[test]
fn float_math_agrees_between_tiers() {
    let mut code = BytecodeBuilder::new();
    code.convert(Conv::I32ToF32, 2, 0)
        .convert(Conv::I32ToF32, 3, 1)
        .float_f32(FloatOp::Mul, 4, 2, 3)
        .float_f32(FloatOp::Add, 4, 4, 2)
        .float_f32(FloatOp::Div, 4, 4, 3)
        .cmp_f32(FloatCond::Lt, 5, 2, 3)
        .convert(Conv::F32ToF64, 6, 4)
        .const_f64(7, 0.25)
        .float_f64(FloatOp::Sub, 6, 6, 7)
        .convert(Conv::F64ToI32, 0, 6)
        .add_i32(0, 0, 5)
        .end();
    let module = single("fmix", i32_fn(2), 8, bytes(&mut code));
    for (a, b) in [(3, 4), (10, -2), (-7, 7), (1000, 3)] {
        let args = [Value::i32(a), Value::i32(b)];
        let (slow, fast) = both_tiers(&module, no_hosts, "fmix", &args);
        assert!(slow.is_ok());
        assert_eq!(slow, fast, "tiers disagree on ({a}, {b})");
    }
    let (slow, _) = both_tiers(&module, no_hosts, "fmix", &[Value::i32(3), Value::i32(4)]);
    // (3 * 4 + 3) / 4 - 0.25 = 3.5 truncates to 3, plus (3 < 4).
    assert_eq!(slow, Ok(Value::i32(4)));
}

#[test]
fn select_and_switch_agree_between_tiers() {
    let mut code = BytecodeBuilder::new();
    code.br_table(0, &["zero", "one", "two"], "other")
        .label("zero")
        .const_i32(1, 100)
        .jmp("out")
        .label("one")
        .const_i32(1, 200)
        .jmp("out")
        .label("two")
        .const_i32(1, 300_000)
        .jmp("out")
        .label("other")
        .const_i32(1, -1)
        .label("out")
        .cmp_i32(Cond::GeS, 2, 1, 0)
        .const_i32(3, 7)
        .select(0, 2, 1, 3)
        .end();
    let module = single("switch", i32_fn(1), 4, bytes(&mut code));
    let expected = [(0, 100), (1, 200), (2, 300_000), (3, 7), (-4, -1), (99, 7)];
    for (input, want) in expected {
        let (slow, fast) = both_tiers(&module, no_hosts, "switch", &[Value::i32(input)]);
        assert_eq!(slow, Ok(Value::i32(want)), "interpreted switch({input})");
        assert_eq!(fast, Ok(Value::i32(want)), "native switch({input})");
    }
}

#[test]
fn memory_access_widths_and_far_offsets_agree() {
    let mut code = BytecodeBuilder::new();
    code.mem_addr(1, 0)
        .store(StoreKind::I32, 0, 1, 0)
        .store(StoreKind::I8, 0, 1, 1001)
        .store(StoreKind::I16, 0, 1, 2050)
        .convert(Conv::ExtendI32S, 2, 0)
        .store(StoreKind::I64, 2, 1, 3000)
        .load(LoadKind::S8, 3, 1, 1001)
        .load(LoadKind::U8, 4, 1, 1)
        .load(LoadKind::S16, 5, 1, 2050)
        .load(LoadKind::U16, 6, 1, 2)
        .load(LoadKind::I64, 7, 1, 3000)
        .convert(Conv::WrapI64, 7, 7)
        .add_i32(0, 3, 4)
        .add_i32(0, 0, 5)
        .add_i32(0, 0, 6)
        .add_i32(0, 0, 7)
        .end();
    let module = single("mem", i32_fn(1), 8, bytes(&mut code));
    for input in [0x1234_5678, -2, 0x80, 0x7FFF_FF81] {
        let (slow, fast) = both_tiers(&module, no_hosts, "mem", &[Value::i32(input)]);
        assert!(slow.is_ok(), "interpreter failed: {slow:?}");
        assert_eq!(slow, fast, "tiers disagree on {input:#x}");
    }
}

#[test]
fn globals_are_shared_between_tiers() {
    let mut code = BytecodeBuilder::new();
    code.global_get(1, 0)
        .bin64(Bin64::Add, 1, 1, 0)
        .global_set(0, 1)
        .global_get(0, 0)
        .end();
    let ty = FuncType::new(&[ValueType::I64], &[ValueType::I64]);
    let mut builder = ModuleBuilder::new();
    builder.add_function("acc", ty, 2, bytes(&mut code), true);
    builder.add_global(ValueType::I64, true, Value::i64(1 << 33));
    let module = builder.build().expect("module");

    let mut instance = runtime(true).instantiate(module).expect("instance");
    assert_eq!(instance.call(0, &[Value::i64(5)]), Ok(Value::i64((1 << 33) + 5)));
    assert_eq!(instance.call(0, &[Value::i64(-6)]), Ok(Value::i64((1 << 33) - 1)));
    assert!(instance.is_compiled(0));
    assert_eq!(instance.global(0), Ok(Value::i64((1 << 33) - 1)));
}

#[test]
fn direct_calls_to_cold_functions_go_through_the_dispatcher() {
    let mut outer = BytecodeBuilder::new();
    outer.mov(1, 0).call(1, 1).addi_i32(0, 1, 1).end();
    let mut builder = ModuleBuilder::new();
    builder.add_function("outer", i32_fn(1), 2, bytes(&mut outer), true);
    builder.add_function("fib", i32_fn(1), 3, fib_code(1), false);
    let module = builder.build().expect("module");

    let mut instance = runtime(true).instantiate(module).expect("instance");
    assert_eq!(instance.call(0, &[Value::i32(10)]), Ok(Value::i32(56)));
    assert!(instance.is_compiled(0));
    assert!(!instance.is_compiled(1));

    // Once the callee has code the fast path takes over.
    instance.compile(1).expect("callee compiles");
    assert_eq!(instance.call(0, &[Value::i32(11)]), Ok(Value::i32(90)));
}

#[test]
fn literal_pool_reuses_constants_and_survives_capacity_resets() {
    let mut repeated = BytecodeBuilder::new();
    repeated.const_i32(0, 0);
    for _ in 0..10 {
        repeated.const_i32(1, 0x1234_5678).add_i32(0, 0, 1);
    }
    repeated.end();
    let module = single("repeat", FuncType::new(&[], &[ValueType::I32]), 2, bytes(&mut repeated));
    let mut instance = runtime(true).instantiate(module).expect("instance");
    assert_eq!(
        instance.call(0, &[]),
        Ok(Value::i32(0x1234_5678u32.wrapping_mul(10) as i32))
    );
    let code = instance.compiled_code(0).expect("compiled");
    assert_eq!(code.pool_flushes, 1);
    assert_eq!(code.literal_ranges.len(), 1);

    let mut distinct = BytecodeBuilder::new();
    let mut expected = 0u32;
    distinct.const_i32(0, 0);
    for index in 0..40u32 {
        let value = 0x0100_0000 + index * 0x1_0101;
        expected = expected.wrapping_add(value);
        distinct.const_i32(1, value as i32).add_i32(0, 0, 1);
    }
    distinct.end();
    let module = single("distinct", FuncType::new(&[], &[ValueType::I32]), 2, bytes(&mut distinct));
    for capacity in [2, 16, 64] {
        let mut instance = runtime_with(JitConfig {
            literal_pool_capacity: capacity,
            ..JitConfig::default()
        })
        .instantiate(module.clone())
        .expect("instance");
        assert_eq!(instance.call(0, &[]), Ok(Value::i32(expected as i32)));
        let code = instance.compiled_code(0).expect("compiled");
        assert!(code.pool_flushes >= 1);
        assert_eq!(code.literal_ranges.len() as u32, code.pool_flushes);
    }
}

#[test]
fn unsupported_opcode_fails_compilation_but_still_interprets() {
    let mut code = BytecodeBuilder::new();
    code.addi_i32(0, 0, 1).end().raw(&[0xEE]);
    let module = single("odd", i32_fn(1), 1, bytes(&mut code));
    let mut instance = runtime(true).instantiate(module).expect("instance");

    assert_eq!(instance.call(0, &[Value::i32(41)]), Ok(Value::i32(42)));
    assert_eq!(instance.compile_state(0), CompileState::Failed);
    assert!(!instance.is_compiled(0));
    let snapshot = instance.jit_snapshot();
    assert_eq!(snapshot.attempts.len(), 1);
    assert!(matches!(
        snapshot.attempts[0].result,
        Err(JitFailure::UnsupportedOpcode { opcode: 0xEE, .. })
    ));

    // A failed function is not retried on every call.
    assert_eq!(instance.call(0, &[Value::i32(1)]), Ok(Value::i32(2)));
    assert_eq!(instance.jit_snapshot().attempts.len(), 1);
    assert!(instance.dump_jit_info().contains("unsupported opcode 0xEE"));
}

fn mid_instruction_jump() -> std::sync::Arc<Module> {
    let mut code = BytecodeBuilder::new();
    code.const_i32(0, 1)
        .jmp("skip")
        .const_i32(0, 2)
        .label("skip")
        .end();
    let mut bytes = bytes(&mut code);
    let jmp_at = bytes
        .iter()
        .position(|byte| *byte == xtvm::OpCode::Jmp as u8)
        .expect("jmp");
    bytes[jmp_at + 1..jmp_at + 5].copy_from_slice(&1i32.to_le_bytes());
    single("odd", FuncType::new(&[], &[ValueType::I32]), 1, bytes)
}

#[test]
fn unresolved_branch_follows_the_configured_policy() {
    let mut trapping = runtime(true)
        .instantiate(mid_instruction_jump())
        .expect("instance");
    assert!(matches!(
        trapping.call(0, &[]),
        Err(VmError::NativeTrap { .. })
    ));
    assert_eq!(trapping.compiled_code(0).map(|code| code.traps), Some(1));

    let mut strict = runtime_with(JitConfig {
        unresolved_branch_policy: UnresolvedBranchPolicy::Fail,
        ..JitConfig::default()
    })
    .instantiate(mid_instruction_jump())
    .expect("instance");
    assert!(matches!(
        strict.compile(0),
        Err(JitFailure::UnresolvedBranch { .. })
    ));
    assert_eq!(strict.compile_state(0), CompileState::Failed);
}

#[test]
fn call0_helpers_match_windowed_helpers() {
    let mut code = BytecodeBuilder::new();
    code.bin64(Bin64::DivS, 2, 0, 1)
        .bin64(Bin64::RemU, 3, 0, 1)
        .bin64(Bin64::Shl, 4, 0, 1)
        .global_get(5, 0)
        .bin64(Bin64::Add, 5, 5, 2)
        .global_set(0, 5)
        .cmp_i64(Cond::LtU, 6, 0, 1)
        .convert(Conv::ExtendI32U, 6, 6)
        .bin64(Bin64::Xor, 0, 3, 4)
        .bin64(Bin64::Add, 0, 0, 5)
        .bin64(Bin64::Add, 0, 0, 6)
        .end();
    let ty = FuncType::new(&[ValueType::I64, ValueType::I64], &[ValueType::I64]);
    let mut builder = ModuleBuilder::new();
    builder.add_function("helpers", ty, 7, bytes(&mut code), true);
    builder.add_global(ValueType::I64, true, Value::i64(-3));
    let module = builder.build().expect("module");

    let run = |convention: HelperConvention, jit: bool| {
        let mut instance = runtime_with(JitConfig {
            enabled: jit,
            helper_convention: convention,
            ..JitConfig::default()
        })
        .instantiate(module.clone())
        .expect("instance");
        let mut results = Vec::new();
        for (a, b) in [(1_000_000_007i64, 13i64), (-1, 7), (5, 0), (1 << 40, 3)] {
            results.push(instance.call(0, &[Value::i64(a), Value::i64(b)]));
        }
        assert_eq!(instance.is_compiled(0), jit);
        (results, instance.global(0))
    };
    let reference = run(HelperConvention::Windowed, false);
    assert!(reference.0.iter().all(Result::is_ok));
    assert_eq!(run(HelperConvention::Windowed, true), reference);
    assert_eq!(run(HelperConvention::Call0, true), reference);
}

#[test]
fn compile_artifacts_are_repeatable() {
    let mut instance = runtime(true)
        .instantiate(iterative_fib())
        .expect("instance");
    let first = instance.compile_artifact(0).expect("first artifact");
    let second = instance.compile_artifact(0).expect("second artifact");
    assert_ne!(first.entry, second.entry);
    assert_eq!(first.size, second.size);
    assert_eq!(first.pool_flushes, second.pool_flushes);

    let a = instance.run_compiled(&first, 0, &[Value::i32(15)]);
    let b = instance.run_compiled(&second, 0, &[Value::i32(15)]);
    assert_eq!(a, Ok(Value::i32(610)));
    assert_eq!(a, b);
    // Artifacts are never installed.
    assert!(!instance.is_compiled(0));

    let free = instance.jit_snapshot().exec_bytes_free;
    assert!(instance.release_artifact(first));
    assert!(instance.release_artifact(second));
    assert!(instance.jit_snapshot().exec_bytes_free > free);
}

#[test]
fn exhausted_instruction_ram_falls_back_to_the_interpreter() {
    let config = RuntimeConfig {
        iram_bytes: 8,
        ..RuntimeConfig::default()
    };
    let mut instance = Runtime::new(config)
        .instantiate(fib_module(true))
        .expect("instance");
    assert_eq!(instance.call(0, &[Value::i32(10)]), Ok(Value::i32(55)));
    assert_eq!(instance.compile_state(0), CompileState::Failed);
    assert!(matches!(
        instance.jit_snapshot().attempts[0].result,
        Err(JitFailure::ExecMemoryExhausted { .. })
    ));
}

#[test]
fn disabling_the_jit_stops_native_entries() {
    let mut instance = runtime(true)
        .instantiate(fib_module(true))
        .expect("instance");
    assert_eq!(instance.call(0, &[Value::i32(8)]), Ok(Value::i32(21)));
    assert_eq!(instance.jit_snapshot().native_calls, 1);

    let config = JitConfig {
        enabled: false,
        ..instance.jit_config().clone()
    };
    instance.set_jit_config(config);
    assert_eq!(instance.call(0, &[Value::i32(8)]), Ok(Value::i32(21)));
    assert_eq!(instance.jit_snapshot().native_calls, 1);
    assert!(instance.is_compiled(0));
    assert!(matches!(instance.compile_artifact(0), Err(JitFailure::Disabled)));
}

#[test]
fn snapshot_serializes_to_json() {
    let mut instance = runtime(true)
        .instantiate(fib_module(true))
        .expect("instance");
    instance.call(0, &[Value::i32(5)]).expect("fib");
    let json = serde_json::to_value(instance.jit_snapshot()).expect("json");
    assert_eq!(json["native_calls"], 1);
    assert_eq!(json["functions"][0]["state"], "Compiled");
    assert_eq!(json["config"]["unresolved_branch_policy"], "Trap");
}
