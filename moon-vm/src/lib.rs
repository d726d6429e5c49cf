pub mod assembler;
pub mod bytecode;
pub mod compiler;
pub mod debug_info;
pub mod diagnostics;
pub mod program;
pub mod wire;

#[cfg(feature = "runtime")]
pub mod builtins;
#[cfg(feature = "cli")]
pub mod logging;
#[cfg(feature = "runtime")]
pub mod value;
#[cfg(feature = "runtime")]
pub mod vm;

pub use assembler::{AssemblerError, Instruction, LabelId, Operand, link};
pub use bytecode::OpCode;
pub use compiler::{
    CompileError, CompileErrorKind, CompilerOptions, Expr, compile_source, dump_ast, parse_source,
};
pub use debug_info::{DebugInfo, FunctionEntry, LineEntry};
pub use program::{ConstantPool, Program};
pub use wire::{
    ValidationError, WireError, decode_program, disassemble_bytes, disassemble_program,
    encode_program, validate_program,
};

#[cfg(feature = "runtime")]
pub use builtins::{BuiltinFunction, NativeRegistry};
#[cfg(feature = "runtime")]
pub use value::{Table, Value};
#[cfg(feature = "runtime")]
pub use vm::{Closure, MachineOptions, RuntimeError, Vm, VmError, VmResult};

/// Any failure on the way from source or bytes to a result.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[cfg(feature = "runtime")]
    #[error(transparent)]
    Runtime(#[from] VmError),
}

/// Compiles `source` and runs it to completion on `vm`.
#[cfg(feature = "runtime")]
pub fn run_source(vm: &mut Vm, source: &str, options: &CompilerOptions) -> Result<Value, Error> {
    let program = compile_source(source, options)?;
    Ok(vm.load(std::rc::Rc::new(program))?)
}

/// Decodes and validates a serialized program, then runs it on `vm`.
#[cfg(feature = "runtime")]
pub fn run_bytecode(vm: &mut Vm, bytes: &[u8]) -> Result<Value, Error> {
    let program = decode_program(bytes)?;
    validate_program(&program)?;
    Ok(vm.load(std::rc::Rc::new(program))?)
}
