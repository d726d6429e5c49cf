#![allow(dead_code, unused_imports)]

use std::rc::Rc;

pub use moon::{
    CompileError, CompileErrorKind, CompilerOptions, MachineOptions, NativeRegistry, OpCode,
    Program, RuntimeError, Table, Value, Vm, VmError, compile_source,
};

/// Compiler options that know about the standard natives.
pub fn options() -> CompilerOptions {
    CompilerOptions::default().with_globals(NativeRegistry::standard().names())
}

pub fn machine() -> Vm {
    Vm::with_natives(MachineOptions::default(), &NativeRegistry::standard())
}

pub fn compile(source: &str) -> Program {
    compile_source(source, &options()).expect("compile should succeed")
}

pub fn compile_error(source: &str) -> CompileError {
    compile_source(source, &options()).expect_err("compile should fail")
}

pub fn run_source(source: &str) -> Result<Value, moon::Error> {
    let mut vm = machine();
    moon::run_source(&mut vm, source, &options())
}

pub fn run_ok(source: &str) -> Value {
    run_source(source).expect("program should run")
}

pub fn runtime_error(source: &str) -> VmError {
    let program = compile(source);
    machine()
        .load(Rc::new(program))
        .expect_err("program should fail at runtime")
}

pub fn number(value: f64) -> Value {
    Value::Number(value)
}

/// `apply(f, ...)` calls back into the machine with the remaining arguments.
pub fn registry_with_apply() -> NativeRegistry {
    let mut natives = NativeRegistry::standard();
    natives.register("apply", |vm, args| {
        let callee = args.first().cloned().unwrap_or_default();
        vm.call(&callee, args.get(1..).unwrap_or_default())
    });
    natives
}

/// An object whose `next` method increments its own `n` field.
pub fn counter_object() -> Value {
    let mut table = Table::new();
    table.set(Value::string("n"), Value::Number(0.0));
    table.set(
        Value::string("next"),
        Value::method(|_vm, receiver, args| {
            let step = args.first().and_then(Value::as_number).unwrap_or(1.0);
            let next = receiver.field("n").as_number().unwrap_or(0.0) + step;
            receiver.set_field("n", Value::Number(next))?;
            Ok(Value::Number(next))
        }),
    );
    Value::object(table)
}
