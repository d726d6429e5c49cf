#![cfg(feature = "runtime")]
mod common;
use common::*;

use std::rc::Rc;

use moon::{
    Instruction, Operand, ValidationError, WireError, decode_program, disassemble_bytes,
    encode_program, link, validate_program,
};

const SOURCE: &str = r#"
    local function fib(n)
        if n < 2 then return n end
        return fib(n - 1) + fib(n - 2)
    end
    return fib(10) .. "!"
"#;

#[test]
fn encoded_program_round_trips_and_runs_the_same() {
    let program = compile(SOURCE);
    let bytes = encode_program(&program).expect("encode");
    let decoded = decode_program(&bytes).expect("decode");
    assert_eq!(decoded, program);

    let direct = machine().load(Rc::new(program)).expect("run direct");
    let mut vm = machine();
    let loaded = moon::run_bytecode(&mut vm, &bytes).expect("run bytes");
    assert_eq!(direct, loaded);
    assert_eq!(loaded, Value::string("55!"));
}

#[test]
fn programs_without_debug_info_round_trip() {
    let mut options = options();
    options.generate_debug_info = false;
    let program = compile_source(SOURCE, &options).expect("compile");
    assert!(program.debug.is_none());
    let bytes = encode_program(&program).expect("encode");
    assert_eq!(decode_program(&bytes).expect("decode"), program);
}

#[test]
fn header_is_checked() {
    let bytes = encode_program(&compile("return 1")).expect("encode");

    let mut bad_magic = bytes.clone();
    bad_magic[0] ^= 0xFF;
    assert!(matches!(
        decode_program(&bad_magic),
        Err(WireError::InvalidMagic(_))
    ));
    assert!(matches!(
        decode_program(&[0, 0, 0, 0]),
        Err(WireError::InvalidMagic(0))
    ));

    let mut bad_version = bytes.clone();
    bad_version[4] = 9;
    assert_eq!(
        decode_program(&bad_version),
        Err(WireError::UnsupportedVersion(9))
    );

    let mut trailing = bytes.clone();
    trailing.push(0);
    assert_eq!(decode_program(&trailing), Err(WireError::TrailingBytes));

    assert_eq!(
        decode_program(&bytes[..bytes.len() - 1]),
        Err(WireError::UnexpectedEof)
    );
}

#[test]
fn compiled_programs_validate() {
    for source in [
        SOURCE,
        "local s = 0 for i = 1, 3 do s = s + i end return s",
        "local t = {a = 1} t.b = {1, 2} return t.b[1]",
        "local function f(...rest) return len(rest) end return f(...{1, 2})",
    ] {
        validate_program(&compile(source)).expect(source);
    }
}

#[test]
fn jump_into_an_operand_is_rejected() {
    let mut code = vec![OpCode::Jmp as u8];
    code.extend_from_slice(&3u32.to_le_bytes());
    code.push(OpCode::Ret as u8);
    let program = Program::new(code, Vec::new(), Vec::new());
    assert_eq!(
        validate_program(&program),
        Err(ValidationError::InvalidJumpTarget {
            offset: 0,
            target: 3
        })
    );
}

#[test]
fn constant_ids_are_checked() {
    let mut code = vec![OpCode::LdStr as u8];
    code.extend_from_slice(&0u32.to_le_bytes());
    let program = Program::new(code, Vec::new(), Vec::new());
    assert!(matches!(
        validate_program(&program),
        Err(ValidationError::InvalidConstant { pool: "string", .. })
    ));
}

fn jump_table_program() -> Program {
    let table = Operand::Table {
        start: 0,
        labels: vec![1, 2],
    };
    let instructions = vec![
        Instruction::with(OpCode::Enter, Operand::Immediate(0)),
        Instruction::with(OpCode::LdGlobal, Operand::None),
        Instruction::with(OpCode::LdFld, Operand::String(3)),
        Instruction::with(OpCode::JmpTable, table),
        Instruction::with(OpCode::LdStr, Operand::String(0)),
        Instruction::new(OpCode::Ret),
        Instruction::with(OpCode::Label, Operand::Label(1)),
        Instruction::with(OpCode::LdStr, Operand::String(1)),
        Instruction::new(OpCode::Ret),
        Instruction::with(OpCode::Label, Operand::Label(2)),
        Instruction::with(OpCode::LdStr, Operand::String(2)),
        Instruction::new(OpCode::Ret),
    ];
    let strings = ["none", "zero", "one", "selector"]
        .map(String::from)
        .to_vec();
    link(&instructions, Vec::new(), strings, false).expect("link")
}

#[test]
fn jump_table_dispatches_on_selector() {
    let program = Rc::new(jump_table_program());
    validate_program(&program).expect("valid");

    let run = |selector: Value| {
        let mut vm = Vm::default();
        vm.set_global("selector", selector);
        vm.load(program.clone()).expect("run")
    };
    assert_eq!(run(Value::Number(1.0)), Value::string("one"));
    assert_eq!(run(Value::Number(0.0)), Value::string("zero"));
    assert_eq!(run(Value::Number(2.0)), Value::string("none"));
    assert_eq!(run(Value::Number(0.5)), Value::string("none"));
    assert_eq!(run(Value::string("1")), Value::string("none"));
}

#[test]
fn disassembly_lists_mnemonics() {
    let bytes = encode_program(&compile("return 1 + 2")).expect("encode");
    let text = disassemble_bytes(&bytes).expect("disassemble");
    assert!(text.contains("ldnum"), "{text}");
    assert!(text.contains("ret"), "{text}");
}
