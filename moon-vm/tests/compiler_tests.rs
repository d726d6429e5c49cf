#![cfg(feature = "runtime")]
mod common;
use common::*;

use moon::{dump_ast, parse_source};

#[test]
fn constant_arithmetic_folds_into_one_literal() {
    let program = compile("return 1 + 2 * 3");
    assert_eq!(program.numbers, vec![7.0]);
    let tree = dump_ast("local x = (4 - 1) * -2", &options()).expect("dump");
    assert_eq!(tree, "local\n-x\n  number: -6\n");
}

#[test]
fn folding_is_idempotent_on_parsed_trees() {
    let tree = parse_source("local y = 2 ^ 3 + z * (1 + 1)", &options())
        .expect("parse")
        .fold();
    assert_eq!(tree.clone().fold(), tree);
}

#[test]
fn exponent_is_right_associative_and_binds_tighter_than_multiplication() {
    assert_eq!(run_ok("return 2 ^ 3 ^ 2"), number(512.0));
    let x = "local x = 2 return 3 * x ^ 2";
    assert_eq!(run_ok(x), number(12.0));
    assert_eq!(run_ok("local x = 2 return -x ^ 2"), number(4.0));
}

#[test]
fn undefined_identifier_reports_file_and_line() {
    let err = compile_error("local a = 1\nreturn b");
    assert_eq!(err.kind, CompileErrorKind::UndefinedIdentifier("b".to_string()));
    assert_eq!(err.line, 2);
    assert_eq!(err.file, "<source>");
    assert_eq!(err.to_string(), "<source>(2): undefined identifier 'b'");
}

#[test]
fn syntax_errors_name_what_was_expected() {
    let err = compile_error("local = 1");
    assert_eq!(
        err.kind,
        CompileErrorKind::ExpectedButFound {
            expected: "identifier".to_string(),
            found: "'='".to_string(),
        }
    );
    let err = compile_error("if true then return 1");
    assert_eq!(
        err.kind,
        CompileErrorKind::ExpectedButFound {
            expected: "'end'".to_string(),
            found: "end of file".to_string(),
        }
    );
}

#[test]
fn semantic_errors() {
    assert_eq!(
        compile_error("local limit <const> = 3\nlimit = 4").kind,
        CompileErrorKind::CantModifyReadOnly("limit".to_string())
    );
    assert_eq!(
        compile_error("local a = 1 local a = 2").kind,
        CompileErrorKind::IdentifierAlreadyDefined("a".to_string())
    );
    assert_eq!(
        compile_error("local t = {1, k = 2}").kind,
        CompileErrorKind::MixedTableConstructor
    );
    assert_eq!(
        compile_error("1 + 2 = 3").kind,
        CompileErrorKind::LeftSideMustBeStorable
    );
    assert!(matches!(
        compile_error("local function f() break end").kind,
        CompileErrorKind::UnresolvedJump(_)
    ));
    assert!(matches!(
        compile_error("::label::").kind,
        CompileErrorKind::UnsupportedExpression(_)
    ));
}

#[test]
fn shadowing_in_nested_block_is_allowed() {
    assert_eq!(run_ok("local x = 1 do local x = 2 end return x"), number(1.0));
    let source = "local x = 1 local r do local x = 2 r = x end return r + x * 10";
    assert_eq!(run_ok(source), number(12.0));
}

#[test]
fn local_initializers_see_the_outer_binding() {
    let source = "local x = 1 do local x = x + 1 return x end";
    assert_eq!(run_ok(source), number(2.0));
    assert_eq!(run_ok("local a, b = 1, 2 local a2, b2 = b, a return a2 * 10 + b2"), number(21.0));
}

#[test]
fn implicit_globals_are_opt_in() {
    let err = compile_source("counter = 1", &options()).expect_err("undefined");
    assert_eq!(err.kind, CompileErrorKind::UndefinedIdentifier("counter".to_string()));

    let options = CompilerOptions {
        use_implicit_globals: true,
        ..options()
    };
    let mut vm = machine();
    let value = moon::run_source(&mut vm, "counter = 41 return counter + 1", &options)
        .expect("implicit globals");
    assert_eq!(value, number(42.0));
    assert_eq!(vm.global("counter"), number(41.0));
}

#[test]
fn function_statements_declare_globals() {
    let source = "function twice(x) return x * 2 end return twice(21)";
    let mut vm = machine();
    let value = moon::run_source(&mut vm, source, &options()).expect("run");
    assert_eq!(value, number(42.0));
    assert!(matches!(vm.global("twice"), Value::Function(_)));
}

#[test]
fn root_declarations_can_target_the_global_table() {
    let options = CompilerOptions {
        root_declarations_global: true,
        ..options()
    };
    let mut vm = machine();
    moon::run_source(&mut vm, "local answer = 42 local function hello() return 'hi' end", &options)
        .expect("run");
    assert_eq!(vm.global("answer"), number(42.0));
    assert!(matches!(vm.global("hello"), Value::Function(_)));

    let options = options.with_globals(["answer"]);
    let nested = moon::run_source(&mut vm, "do local inner = 1 end return answer", &options)
        .expect("run");
    assert_eq!(nested, number(42.0));
    assert_eq!(vm.global("inner"), Value::Nil);
}

#[test]
fn debug_info_is_optional() {
    let with_debug = compile("local x = 1\nreturn x");
    let debug = with_debug.debug.as_ref().expect("debug info");
    assert_eq!(debug.functions.len(), 1);
    assert!(debug.lines.iter().any(|entry| entry.line == 2));

    let options = CompilerOptions {
        generate_debug_info: false,
        ..options()
    };
    let bare = compile_source("local x = 1\nreturn x", &options).expect("compile");
    assert!(bare.debug.is_none());
    assert!(bare.strings.is_empty());
    assert!(bare.code.len() == with_debug.code.len());
}

#[test]
fn options_load_from_partial_json() {
    let options = CompilerOptions::from_json(r#"{"use_implicit_globals": true, "globals": ["host"]}"#)
        .expect("options");
    assert!(options.use_implicit_globals);
    assert!(options.generate_debug_info);
    assert_eq!(options.file_name, "<source>");
    assert_eq!(options.globals, vec!["host".to_string()]);
}

#[test]
fn too_many_splats_is_rejected() {
    let args = vec!["...xs"; 256].join(", ");
    let source = format!("local xs = {{}} local function f() end f({args})");
    assert_eq!(
        compile_source(&source, &options()).expect_err("too many").kind,
        CompileErrorKind::TooManyArguments(256)
    );
}
