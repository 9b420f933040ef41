use std::io;
use std::sync::Arc;

use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};
use xtvm::logging;
use xtvm::{
    Bin32, Bin64, BytecodeBuilder, CompileState, Cond, Conv, FloatOp, FuncType, HelperConvention,
    JitSnapshot, Module, ModuleBuilder, NativeCall, NativeReturn, Runtime, RuntimeConfig, Value,
    ValueType, VmError, VmResult,
};

const FORMAT_OFFSET: u32 = 0;
const FORMAT: &[u8] = b"fib(%d) = %d, ratio %f\n\0";

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliConfig {
    filter: Option<String>,
    input: i32,
    json: bool,
    disasm: bool,
    jit_dump: bool,
    jit: bool,
    call0_helpers: bool,
    help: bool,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            filter: None,
            input: 20,
            json: false,
            disasm: false,
            jit_dump: false,
            jit: true,
            call0_helpers: false,
            help: false,
        }
    }
}

#[derive(Serialize)]
struct DemoReport {
    name: &'static str,
    entry: String,
    result: Option<String>,
    error: Option<String>,
    native_calls: u64,
    jit: JitSnapshot,
}

struct Demo {
    name: &'static str,
    entry: &'static str,
    build: fn() -> Result<Arc<Module>, String>,
    args: fn(i32) -> Vec<Value>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_cli_args(&args).map_err(io::Error::other)?;
    if cli.help {
        print_usage();
        return Ok(());
    }
    logging::init()?;

    let filter = cli
        .filter
        .as_deref()
        .map(Regex::new)
        .transpose()
        .map_err(|err| io::Error::other(format!("invalid demo filter: {err}")))?;

    let runtime = build_runtime(&cli);
    let mut reports = Vec::new();
    for demo in demos() {
        if let Some(filter) = &filter
            && !filter.is_match(demo.name)
        {
            continue;
        }
        let module = (demo.build)().map_err(io::Error::other)?;
        reports.push(run_demo(&runtime, &demo, module, &cli)?);
    }
    if reports.is_empty() {
        warn!("no demo matched the filter");
    }
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    }
    Ok(())
}

fn build_runtime(cli: &CliConfig) -> Runtime {
    let mut config = RuntimeConfig::default();
    config.jit.enabled = cli.jit;
    if cli.call0_helpers {
        config.jit.helper_convention = HelperConvention::Call0;
    }
    let mut runtime = Runtime::new(config);
    runtime.register_static("printf", host_printf);
    runtime.register_static("apply", host_apply);
    runtime
}

fn run_demo(
    runtime: &Runtime,
    demo: &Demo,
    module: Arc<Module>,
    cli: &CliConfig,
) -> Result<DemoReport, Box<dyn std::error::Error>> {
    let mut instance = runtime.instantiate(module)?;
    let args = (demo.args)(cli.input);
    let outcome = instance.call_by_name(demo.entry, &args);
    let entry_index = instance.module().function_index(demo.entry);
    let native = entry_index.is_some_and(|func| instance.is_compiled(func));

    if !cli.json {
        println!("{}", logging::heading(&format!("== {} ==", demo.name)));
        match &outcome {
            Ok(value) => println!(
                "  {}({}) = {} [{}] {}",
                demo.entry,
                render_args(&args),
                value,
                logging::tier_label(native),
                logging::status_label(true)
            ),
            Err(err) => println!(
                "  {}({}) {}: {}",
                demo.entry,
                render_args(&args),
                logging::status_label(false),
                err
            ),
        }
        if cli.jit_dump {
            print!("{}", instance.dump_jit_info());
        }
        if cli.disasm {
            for func in 0..instance.module().functions.len() as u32 {
                if let Some(lines) = instance.disassemble(func) {
                    println!("  -- fn#{func} native code --");
                    for line in lines {
                        println!("    {line}");
                    }
                }
            }
        }
    }
    let snapshot = instance.jit_snapshot();
    let compiled = snapshot
        .functions
        .iter()
        .filter(|function| function.state == CompileState::Compiled)
        .count();
    info!(
        demo = demo.name,
        compiled,
        native_calls = snapshot.native_calls,
        "demo finished"
    );
    Ok(DemoReport {
        name: demo.name,
        entry: demo.entry.to_string(),
        result: outcome.as_ref().ok().map(|value| value.to_string()),
        error: outcome.as_ref().err().map(|err| err.to_string()),
        native_calls: snapshot.native_calls,
        jit: snapshot,
    })
}

fn render_args(args: &[Value]) -> String {
    args.iter()
        .map(|value| value.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn demos() -> Vec<Demo> {
    vec![
        Demo {
            name: "fib",
            entry: "fib",
            build: fib_module,
            args: |n| vec![Value::i32(n.min(25))],
        },
        Demo {
            name: "sum",
            entry: "sum",
            build: sum_module,
            args: |n| vec![Value::i32(n)],
        },
        Demo {
            name: "wide",
            entry: "mix64",
            build: wide_module,
            args: |n| vec![Value::i64(n as i64 * 0x1_0000_0001), Value::i64(-3)],
        },
        Demo {
            name: "printf",
            entry: "report",
            build: printf_module,
            args: |n| vec![Value::i32(n.min(25))],
        },
        Demo {
            name: "callback",
            entry: "apply_square",
            build: callback_module,
            args: |n| vec![Value::i32(n)],
        },
    ]
}

fn finish(code: BytecodeBuilder) -> Result<Vec<u8>, String> {
    code.finish().map_err(|err| err.to_string())
}

/// Recursive fib; `me` is the function's own index in its module.
fn fib_body(me: u16) -> Result<Vec<u8>, String> {
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
    finish(code)
}

fn fib_module() -> Result<Arc<Module>, String> {
    let mut builder = ModuleBuilder::new();
    builder.add_function(
        "fib",
        FuncType::new(&[ValueType::I32], &[ValueType::I32]),
        3,
        fib_body(0)?,
        true,
    );
    builder.build().map_err(|err| err.to_string())
}

fn sum_module() -> Result<Arc<Module>, String> {
    let mut code = BytecodeBuilder::new();
    code.const_i32(1, 0)
        .label("loop")
        .eqz_i32(2, 0)
        .br_if(2, "done")
        .add_i32(1, 1, 0)
        .addi_i32(0, 0, -1)
        .jmp("loop")
        .label("done")
        .mov(0, 1)
        .end();
    let mut builder = ModuleBuilder::new();
    builder.add_function(
        "sum",
        FuncType::new(&[ValueType::I32], &[ValueType::I32]),
        3,
        finish(code)?,
        true,
    );
    builder.build().map_err(|err| err.to_string())
}

/// `((a + b) * b / 7) ^ (a >> 3)` on 64-bit values.
fn wide_module() -> Result<Arc<Module>, String> {
    let mut code = BytecodeBuilder::new();
    code.bin64(Bin64::Add, 2, 0, 1)
        .bin64(Bin64::Mul, 2, 2, 1)
        .const_i64(3, 7)
        .bin64(Bin64::DivS, 2, 2, 3)
        .const_i64(3, 3)
        .bin64(Bin64::ShrS, 3, 0, 3)
        .bin64(Bin64::Xor, 0, 2, 3)
        .end();
    let mut builder = ModuleBuilder::new();
    builder.add_function(
        "mix64",
        FuncType::new(&[ValueType::I64, ValueType::I64], &[ValueType::I64]),
        4,
        finish(code)?,
        true,
    );
    builder.build().map_err(|err| err.to_string())
}

/// Computes `fib(n)` and reports it through a variadic host `printf`.
fn printf_module() -> Result<Arc<Module>, String> {
    let mut code = BytecodeBuilder::new();
    code.mem_addr(1, FORMAT_OFFSET)
        .mov(2, 0)
        .mov(3, 0)
        .call(1, 3)
        .addi_i32(5, 0, -1)
        .call(1, 5)
        .convert(Conv::I32ToF64, 4, 3)
        .convert(Conv::I32ToF64, 6, 5)
        .float_f64(FloatOp::Div, 4, 4, 6)
        .call_import_va(
            0,
            1,
            &[ValueType::Ptr, ValueType::I32, ValueType::I32, ValueType::F64],
        )
        .mov(0, 3)
        .end();
    let mut builder = ModuleBuilder::new();
    builder.memory_size(256);
    builder.add_data(FORMAT_OFFSET, FORMAT.to_vec());
    builder.add_variadic_import("printf", FuncType::new(&[ValueType::Ptr], &[ValueType::I32]));
    builder.add_function(
        "report",
        FuncType::new(&[ValueType::I32], &[ValueType::I32]),
        7,
        finish(code)?,
        true,
    );
    builder.add_function(
        "fib",
        FuncType::new(&[ValueType::I32], &[ValueType::I32]),
        3,
        fib_body(1)?,
        true,
    );
    builder.build().map_err(|err| err.to_string())
}

/// Hands a VM function to a host routine that calls it back natively.
fn callback_module() -> Result<Arc<Module>, String> {
    let mut square = BytecodeBuilder::new();
    square.bin32(Bin32::Mul, 0, 0, 0).end();
    let mut main = BytecodeBuilder::new();
    main.func_addr(1, 1)
        .mov(2, 0)
        .call_import(0, 1)
        .mov(0, 1)
        .end();
    let mut builder = ModuleBuilder::new();
    builder.add_callback_import(
        "apply",
        FuncType::new(&[ValueType::Func, ValueType::I32], &[ValueType::I32]),
        0b1,
    );
    builder.add_function(
        "apply_square",
        FuncType::new(&[ValueType::I32], &[ValueType::I32]),
        3,
        finish(main)?,
        true,
    );
    builder.add_function(
        "square",
        FuncType::new(&[ValueType::I32], &[ValueType::I32]),
        1,
        finish(square)?,
        true,
    );
    builder.build().map_err(|err| err.to_string())
}

/// Minimal `printf`: `%d`, `%u`, `%x`, `%f`, `%s` and `%%`.
fn host_printf(call: &mut NativeCall<'_>) -> VmResult<NativeReturn> {
    let values = call.values();
    let format = match values.first() {
        Some(pointer) => call.read_cstr(pointer.lo())?,
        None => return Err(VmError::HostError("printf without a format".to_string())),
    };
    let mut rest = values.iter().skip(1);
    let mut out = String::new();
    let mut chars = format.chars();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        let Some(conv) = chars.next() else {
            out.push('%');
            break;
        };
        if conv == '%' {
            out.push('%');
            continue;
        }
        let value = rest.next().copied().unwrap_or_else(Value::void);
        match conv {
            'd' => out.push_str(&value.as_i32().to_string()),
            'u' => out.push_str(&value.as_u32().to_string()),
            'x' => out.push_str(&format!("{:x}", value.as_u32())),
            'f' => out.push_str(&format!("{:.6}", value.as_f64())),
            's' => out.push_str(&call.read_cstr(value.lo())?),
            other => {
                out.push('%');
                out.push(other);
            }
        }
    }
    print!("{out}");
    Ok(NativeReturn::word(out.len() as u32))
}

fn host_apply(call: &mut NativeCall<'_>) -> VmResult<NativeReturn> {
    let values = call.values();
    let (Some(callback), Some(argument)) = (values.first(), values.get(1)) else {
        return Err(VmError::HostError("apply expects two arguments".to_string()));
    };
    let result = call.invoke_callback(callback.lo(), &[*argument])?;
    Ok(NativeReturn::value(result))
}

fn parse_cli_args(args: &[String]) -> Result<CliConfig, String> {
    let mut cfg = CliConfig::default();
    let mut index = 0usize;
    while index < args.len() {
        match args[index].as_str() {
            "-h" | "--help" => {
                cfg.help = true;
                index += 1;
            }
            "--json" => {
                cfg.json = true;
                index += 1;
            }
            "--disasm" => {
                cfg.disasm = true;
                index += 1;
            }
            "--jit-dump" => {
                cfg.jit_dump = true;
                index += 1;
            }
            "--no-jit" => {
                cfg.jit = false;
                index += 1;
            }
            "--call0" => {
                cfg.call0_helpers = true;
                index += 1;
            }
            "-n" | "--input" => {
                let raw = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --input".to_string())?;
                cfg.input = raw
                    .parse::<i32>()
                    .map_err(|_| format!("invalid --input value '{raw}'"))?;
                index += 2;
            }
            other if other.starts_with('-') => {
                return Err(format!("unknown option '{other}'"));
            }
            other => {
                if cfg.filter.is_some() {
                    return Err(format!("unexpected argument '{other}'"));
                }
                cfg.filter = Some(other.to_string());
                index += 1;
            }
        }
    }
    Ok(cfg)
}

fn print_usage() {
    println!("Usage:");
    println!("  xtvm-run [options] [demo_filter_regex]");
    println!();
    println!("Options:");
    println!("  -n, --input <n>   argument passed to every demo (default 20)");
    println!("  --no-jit          interpret everything");
    println!("  --call0           call runtime helpers with the Call0 convention");
    println!("  --jit-dump        print the tiering state after each demo");
    println!("  --disasm          disassemble the native code of compiled functions");
    println!("  --json            print one JSON report for all demos");
    println!();
    println!("Demos: fib, sum, wide, printf, callback");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn parses_flags_and_filter() {
        let cfg = parse_cli_args(&args(&["--no-jit", "-n", "7", "fib|sum"])).expect("parse");
        assert!(!cfg.jit);
        assert_eq!(cfg.input, 7);
        assert_eq!(cfg.filter.as_deref(), Some("fib|sum"));
    }

    #[test]
    fn rejects_unknown_options() {
        assert!(parse_cli_args(&args(&["--frobnicate"])).is_err());
        assert!(parse_cli_args(&args(&["-n"])).is_err());
    }

    #[test]
    fn every_demo_module_builds() {
        for demo in demos() {
            assert!((demo.build)().is_ok(), "{} failed to build", demo.name);
        }
    }

    #[test]
    fn demos_agree_between_tiers() {
        for jit in [false, true] {
            let cli = CliConfig {
                jit,
                ..CliConfig::default()
            };
            let runtime = build_runtime(&cli);
            let module = fib_module().expect("fib");
            let mut instance = runtime.instantiate(module).expect("instance");
            let value = instance
                .call_by_name("fib", &[Value::i32(15)])
                .expect("fib");
            assert_eq!(value, Value::i32(610));
        }
    }
}
