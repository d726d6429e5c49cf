use std::io;
use std::rc::Rc;

use moon::diagnostics::{render_source_error, render_vm_error};
use moon::logging;
use moon::{
    CompilerOptions, MachineOptions, NativeRegistry, Value, Vm, compile_source, decode_program,
    disassemble_bytes, dump_ast, encode_program, validate_program,
};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct CliConfig {
    source: Option<String>,
    options_path: Option<String>,
    no_debug_info: bool,
    implicit_globals: bool,
    root_global: bool,
    emit_path: Option<String>,
    disasm_path: Option<String>,
    run_bytecode_path: Option<String>,
    dump_ast: bool,
    repl: bool,
    help: bool,
}

/// Both option blocks of a `--options` JSON file; either may be omitted.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct OptionsFile {
    compiler: CompilerOptions,
    machine: MachineOptions,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init()?;
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_cli_args(&args).map_err(io::Error::other)?;
    if cli.help {
        print_usage();
        return Ok(());
    }

    let (mut compiler, machine) = load_options(&cli)?;
    let natives = NativeRegistry::standard();
    compiler.globals.extend(natives.names().map(str::to_string));

    if cli.repl {
        return run_repl(compiler, machine, &natives);
    }
    if let Some(path) = cli.disasm_path.as_ref() {
        let bytes = std::fs::read(path)?;
        info!("{} disassembling {path}", logging::category_bytecode());
        print!("{}", disassemble_bytes(&bytes)?);
        return Ok(());
    }
    if let Some(path) = cli.run_bytecode_path.as_ref() {
        let bytes = std::fs::read(path)?;
        let program = decode_program(&bytes)?;
        validate_program(&program)?;
        info!("{} loaded {} bytes from {path}", logging::category_bytecode(), bytes.len());
        let mut vm = Vm::with_natives(machine, &natives);
        return match vm.load(Rc::new(program)) {
            Ok(value) => {
                print_result(&value);
                Ok(())
            }
            Err(err) => Err(io::Error::other(render_vm_error(&err, None)).into()),
        };
    }

    let Some(path) = cli.source.as_ref() else {
        return Err(io::Error::other("missing source path").into());
    };
    let source = std::fs::read_to_string(path)?;
    compiler.file_name = path.clone();

    if cli.dump_ast {
        let tree = dump_ast(&source, &compiler)
            .map_err(|err| io::Error::other(render_source_error(&source, &err)))?;
        print!("{tree}");
        return Ok(());
    }

    let program = compile_source(&source, &compiler)
        .map_err(|err| io::Error::other(render_source_error(&source, &err)))?;
    info!(
        "{} compiled {path} ({} bytes of code)",
        logging::category_compile(),
        program.code.len()
    );

    if let Some(output) = cli.emit_path.as_ref() {
        let encoded = encode_program(&program)?;
        std::fs::write(output, &encoded)?;
        info!("{} wrote {} bytes to {output}", logging::category_bytecode(), encoded.len());
        return Ok(());
    }

    let mut vm = Vm::with_natives(machine, &natives);
    info!("{} {path}", logging::category_run());
    match vm.load(Rc::new(program)) {
        Ok(value) => {
            debug!(peak_call_depth = vm.peak_call_depth(), "run finished");
            print_result(&value);
            Ok(())
        }
        Err(err) => Err(io::Error::other(render_vm_error(&err, Some(&source))).into()),
    }
}

fn load_options(cli: &CliConfig) -> Result<(CompilerOptions, MachineOptions), Box<dyn std::error::Error>> {
    let file = match cli.options_path.as_ref() {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            serde_json::from_str::<OptionsFile>(&text)?
        }
        None => OptionsFile::default(),
    };
    let mut compiler = file.compiler;
    if cli.no_debug_info {
        compiler.generate_debug_info = false;
    }
    if cli.implicit_globals {
        compiler.use_implicit_globals = true;
    }
    if cli.root_global {
        compiler.root_declarations_global = true;
    }
    Ok((compiler, file.machine))
}

fn print_result(value: &Value) {
    if !matches!(value, Value::Nil) {
        println!("{value}");
    }
}

fn parse_cli_args(args: &[String]) -> Result<CliConfig, String> {
    let mut cfg = CliConfig::default();
    if args.is_empty() {
        cfg.repl = true;
        return Ok(cfg);
    }

    let mut index = 0usize;
    while index < args.len() {
        let flag = args[index].as_str();
        match flag {
            "-h" | "--help" => cfg.help = true,
            "--no-debug-info" => cfg.no_debug_info = true,
            "--implicit-globals" => cfg.implicit_globals = true,
            "--root-global" => cfg.root_global = true,
            "--dump-ast" => cfg.dump_ast = true,
            "--repl" => cfg.repl = true,
            "--options" => {
                cfg.options_path = Some(flag_value(args, index)?);
                index += 1;
            }
            "--emit" => {
                cfg.emit_path = Some(flag_value(args, index)?);
                index += 1;
            }
            "--disasm" => {
                cfg.disasm_path = Some(flag_value(args, index)?);
                index += 1;
            }
            "--run-bytecode" => {
                cfg.run_bytecode_path = Some(flag_value(args, index)?);
                index += 1;
            }
            other if other.starts_with('-') => return Err(format!("unknown flag '{other}'")),
            path => {
                if cfg.source.is_some() {
                    return Err("multiple source paths provided".to_string());
                }
                cfg.source = Some(path.to_string());
            }
        }
        index += 1;
    }

    let bytecode_mode = cfg.disasm_path.is_some() || cfg.run_bytecode_path.is_some();
    if cfg.repl && (cfg.source.is_some() || bytecode_mode || cfg.emit_path.is_some() || cfg.dump_ast) {
        return Err("repl mode cannot be combined with a source path or file modes".to_string());
    }
    if bytecode_mode {
        if cfg.source.is_some() {
            return Err("bytecode modes do not accept a source path".to_string());
        }
        if cfg.disasm_path.is_some() && cfg.run_bytecode_path.is_some() {
            return Err("--disasm and --run-bytecode are exclusive".to_string());
        }
        if cfg.emit_path.is_some() || cfg.dump_ast {
            return Err("bytecode modes cannot be combined with --emit or --dump-ast".to_string());
        }
    }
    if cfg.emit_path.is_some() && cfg.dump_ast {
        return Err("--emit and --dump-ast are exclusive".to_string());
    }
    if !cfg.help && !cfg.repl && !bytecode_mode && cfg.source.is_none() {
        return Err("missing source path".to_string());
    }
    Ok(cfg)
}

fn flag_value(args: &[String], index: usize) -> Result<String, String> {
    args.get(index + 1)
        .cloned()
        .ok_or_else(|| format!("missing value for {}", args[index]))
}

fn print_usage() {
    println!("usage: moon-run [flags] <source.moon>");
    println!("       moon-run --disasm <program.mbc>");
    println!("       moon-run --run-bytecode <program.mbc>");
    println!("       moon-run [--repl]");
    println!();
    println!("flags:");
    println!("  --options <file.json>   compiler/machine options ({{\"compiler\": .., \"machine\": ..}})");
    println!("  --no-debug-info         omit function and line tables");
    println!("  --implicit-globals      resolve undefined names through the global table");
    println!("  --root-global           store root-level locals in the global table");
    println!("  --emit <out.mbc>        write the compiled program instead of running it");
    println!("  --disasm <in.mbc>       print a listing of a compiled program");
    println!("  --run-bytecode <in.mbc> run a compiled program");
    println!("  --dump-ast              print the folded expression tree");
    println!("  --repl                  interactive session (default without arguments)");
    println!("  -h, --help              show this help");
}

/// Every entry is compiled as its own chunk; root declarations go to the
/// global table so they survive into the next entry.
fn run_repl(
    mut options: CompilerOptions,
    machine: MachineOptions,
    natives: &NativeRegistry,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("moon REPL");
    println!("history: up/down arrows, commands: .help, .quit");
    options.root_declarations_global = true;
    options.use_implicit_globals = true;
    options.file_name = "<repl>".to_string();

    let mut editor = DefaultEditor::new()?;
    let mut vm = Vm::with_natives(machine, natives);
    loop {
        match editor.readline("moon> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match line {
                    ".quit" | ".exit" => break,
                    ".help" => {
                        println!("enter statements; `return expr` or a bare expression prints its value");
                        continue;
                    }
                    _ => {}
                }
                let _ = editor.add_history_entry(line);
                let program = match compile_repl_entry(line, &options) {
                    Ok(program) => program,
                    Err(message) => {
                        println!("{message}");
                        continue;
                    }
                };
                match vm.load(Rc::new(program)) {
                    Ok(value) => {
                        if !matches!(value, Value::Nil) {
                            println!("=> {value}");
                        }
                    }
                    Err(err) => println!("{}", render_vm_error(&err, Some(line))),
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                println!("bye");
                break;
            }
            Err(err) => return Err(Box::new(io::Error::other(err.to_string()))),
        }
    }
    Ok(())
}

/// Tries the entry as an expression first so `1 + 2` prints `3`.
fn compile_repl_entry(line: &str, options: &CompilerOptions) -> Result<moon::Program, String> {
    let as_expression = format!("return {line}");
    if let Ok(program) = compile_source(&as_expression, options) {
        return Ok(program);
    }
    compile_source(line, options).map_err(|err| render_source_error(line, &err))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(value: &str) -> String {
        value.to_string()
    }

    #[test]
    fn parse_cli_defaults_to_repl() {
        let cfg = parse_cli_args(&[]).expect("parse should succeed");
        assert!(cfg.repl);
        assert!(cfg.source.is_none());
        assert!(!cfg.no_debug_info);
    }

    #[test]
    fn parse_cli_source_with_compiler_flags() {
        let cfg = parse_cli_args(&[
            s("--no-debug-info"),
            s("--implicit-globals"),
            s("--root-global"),
            s("--emit"),
            s("out.mbc"),
            s("main.moon"),
        ])
        .expect("parse should succeed");
        assert!(cfg.no_debug_info && cfg.implicit_globals && cfg.root_global);
        assert_eq!(cfg.emit_path.as_deref(), Some("out.mbc"));
        assert_eq!(cfg.source.as_deref(), Some("main.moon"));
    }

    #[test]
    fn parse_cli_rejects_bad_combinations() {
        let err = parse_cli_args(&[s("a.moon"), s("b.moon")]).expect_err("two sources");
        assert!(err.contains("multiple source paths"));
        let err = parse_cli_args(&[s("--disasm"), s("a.mbc"), s("a.moon")]).expect_err("disasm");
        assert!(err.contains("do not accept a source path"));
        let err = parse_cli_args(&[s("--emit")]).expect_err("missing value");
        assert_eq!(err, "missing value for --emit");
        let err = parse_cli_args(&[s("--bogus")]).expect_err("unknown");
        assert_eq!(err, "unknown flag '--bogus'");
        let err = parse_cli_args(&[s("--dump-ast")]).expect_err("no source");
        assert_eq!(err, "missing source path");
    }

    #[test]
    fn options_file_overrides_defaults_and_flags_win() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        std::io::Write::write_all(
            &mut file,
            br#"{"compiler": {"use_implicit_globals": true}, "machine": {"call_stack_capacity": 8}}"#,
        )
        .expect("write options");
        let cli = CliConfig {
            options_path: Some(file.path().to_string_lossy().into_owned()),
            no_debug_info: true,
            ..CliConfig::default()
        };
        let (compiler, machine) = load_options(&cli).expect("load options");
        assert!(compiler.use_implicit_globals);
        assert!(!compiler.generate_debug_info);
        assert_eq!(machine.call_stack_capacity, 8);
        assert_eq!(machine.eval_stack_capacity, 250);
    }

    #[test]
    fn repl_entry_prefers_expression_form() {
        let options = CompilerOptions {
            use_implicit_globals: true,
            root_declarations_global: true,
            ..CompilerOptions::default()
        };
        let mut vm = Vm::default();
        let program = compile_repl_entry("1 + 2", &options).expect("expression");
        assert_eq!(vm.load(Rc::new(program)).expect("run"), Value::Number(3.0));
        let program = compile_repl_entry("local x = 4", &options).expect("statement");
        vm.load(Rc::new(program)).expect("run");
        assert_eq!(vm.global("x"), Value::Number(4.0));
    }
}
