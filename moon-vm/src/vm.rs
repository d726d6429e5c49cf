use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::bytecode::OpCode;
use crate::program::Program;
use crate::value::{Table, TableRef, Value};

mod closure;
pub mod diagnostics;
mod frame;
mod stacks;

pub use closure::{Closure, NativeFn, NativeMethodFn, ScriptClosure};
pub use frame::{Frame, FrameRef};
pub use stacks::StackKind;

use stacks::{BoundedStack, ReturnAddress};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuntimeError {
    #[error("{0} stack overflow")]
    StackOverflow(StackKind),
    #[error("{0} stack underflow")]
    StackUnderflow(StackKind),
    #[error("can't use {op} operator on {left} and {right}")]
    CantUseOperatorOnTypes {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },
    #[error("can't use {op} operator on {operand}")]
    CantUseOperatorOnType {
        op: &'static str,
        operand: &'static str,
    },
    #[error("index {index} out of bounds for array of length {len}")]
    IndexOutOfBounds { index: f64, len: usize },
    #[error("value of type {0} is not callable")]
    ValueNotCallable(&'static str),
    #[error("can't create field on value of type {0}")]
    CantCreateField(&'static str),
    #[error("value of type {0} is not enumerable")]
    NotEnumerable(&'static str),
    #[error("no frame at depth {0}")]
    UnresolvedFrame(i32),
    #[error("invalid opcode {0:#04x}")]
    InvalidOpcode(u8),
    #[error("bytecode bounds")]
    BytecodeBounds,
    #[error("invalid {pool} constant {index}")]
    InvalidConstant { pool: &'static str, index: u32 },
    #[error("{0}")]
    Native(String),
}

/// A runtime failure together with the guest frames it unwound through.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}{}", format_trace(.trace))]
pub struct VmError {
    pub kind: RuntimeError,
    pub trace: Vec<String>,
    /// Source line of the innermost failing instruction, when debug info exists.
    pub line: Option<u32>,
}

impl VmError {
    pub fn native(message: impl Into<String>) -> Self {
        RuntimeError::Native(message.into()).into()
    }
}

impl From<RuntimeError> for VmError {
    fn from(kind: RuntimeError) -> Self {
        Self {
            kind,
            trace: Vec::new(),
            line: None,
        }
    }
}

fn format_trace(trace: &[String]) -> String {
    trace.iter().map(|line| format!("\n  {line}")).collect()
}

pub type VmResult<T> = Result<T, VmError>;

fn default_stack_capacity() -> usize {
    250
}

/// Capacities of the three interpreter stacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineOptions {
    pub call_stack_capacity: usize,
    pub local_stack_capacity: usize,
    pub eval_stack_capacity: usize,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            call_stack_capacity: default_stack_capacity(),
            local_stack_capacity: default_stack_capacity(),
            eval_stack_capacity: default_stack_capacity(),
        }
    }
}

impl MachineOptions {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// The mutable execution position.
#[derive(Clone, Default)]
struct Cursor {
    program: Option<Rc<Program>>,
    ip: usize,
    args: Option<FrameRef>,
    locals: Option<FrameRef>,
}

pub struct Vm {
    cursor: Cursor,
    instruction_start: usize,
    calls: BoundedStack<ReturnAddress>,
    locals: BoundedStack<Option<FrameRef>>,
    eval: BoundedStack<Value>,
    globals: TableRef,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new(MachineOptions::default())
    }
}

impl Vm {
    pub fn new(options: MachineOptions) -> Self {
        Self {
            cursor: Cursor::default(),
            instruction_start: 0,
            calls: BoundedStack::new(StackKind::Call, options.call_stack_capacity),
            locals: BoundedStack::new(StackKind::Local, options.local_stack_capacity),
            eval: BoundedStack::new(StackKind::Eval, options.eval_stack_capacity),
            globals: Rc::new(RefCell::new(Table::new())),
        }
    }

    pub fn with_natives(options: MachineOptions, natives: &crate::builtins::NativeRegistry) -> Self {
        let mut vm = Self::new(options);
        natives.install(&mut vm);
        vm
    }

    /// Runs a program's top-level function and returns its result.
    pub fn load(&mut self, program: Rc<Program>) -> VmResult<Value> {
        debug!(code_len = program.code.len(), "loading program");
        let entry = Value::Function(Rc::new(Closure::program(program)));
        self.call(&entry, &[])
    }

    pub fn globals(&self) -> Value {
        Value::Object(self.globals.clone())
    }

    pub fn global(&self, key: &str) -> Value {
        self.globals.borrow().get_str(key).cloned().unwrap_or_default()
    }

    pub fn set_global(&mut self, key: &str, value: Value) {
        self.globals.borrow_mut().set(Value::string(key), value);
    }

    pub fn call_depth(&self) -> usize {
        self.calls.len()
    }

    /// Deepest call stack seen since the last [`Vm::reset_peak_call_depth`].
    pub fn peak_call_depth(&self) -> usize {
        self.calls.peak()
    }

    pub fn reset_peak_call_depth(&mut self) {
        self.calls.reset_peak();
    }

    /// Calls any value. Guest functions run to completion on a fresh `run`
    /// boundary, so natives may call back in while the machine is busy.
    pub fn call(&mut self, callee: &Value, args: &[Value]) -> VmResult<Value> {
        let closure = match callee {
            Value::Function(closure) => closure.clone(),
            other => return Err(RuntimeError::ValueNotCallable(other.type_name()).into()),
        };
        self.invoke(&closure, args)
    }

    /// Collects the values of an array or an enumerable object.
    pub fn enumerate(&mut self, value: &Value) -> VmResult<Vec<Value>> {
        match value {
            Value::Array(items) => Ok(items.borrow().clone()),
            Value::Object(_) if value.is_enumerable() => {
                let mut enumerator = value.clone();
                let mut move_next = enumerator.field("moveNext");
                if !matches!(move_next, Value::Function(_)) {
                    enumerator = self.call(&value.field("getEnumerator"), &[])?;
                    move_next = enumerator.field("moveNext");
                    if !matches!(move_next, Value::Function(_)) {
                        return Err(RuntimeError::NotEnumerable(enumerator.type_name()).into());
                    }
                }
                let mut out = Vec::new();
                while self.call(&move_next, &[])?.is_truthy() {
                    out.push(enumerator.field("current"));
                }
                Ok(out)
            }
            other => Err(RuntimeError::NotEnumerable(other.type_name()).into()),
        }
    }

    fn run(&mut self, script: &ScriptClosure, args: Vec<Value>) -> VmResult<Value> {
        let saved = self.cursor.clone();
        let saved_start = self.instruction_start;
        let call_depth = self.calls.len();
        let local_depth = self.locals.len();
        let eval_depth = self.eval.len();

        let result = self
            .begin_call(script, args)
            .map_err(VmError::from)
            .and_then(|()| self.execute(call_depth));

        let result = result.map_err(|err| self.unwind(err, call_depth, local_depth, eval_depth));
        self.cursor = saved;
        self.instruction_start = saved_start;
        result
    }

    fn unwind(
        &mut self,
        mut err: VmError,
        call_depth: usize,
        local_depth: usize,
        eval_depth: usize,
    ) -> VmError {
        // Frames of a nested run started by a native come first, innermost on top.
        let mut trace = std::mem::take(&mut err.trace);
        if !trace.is_empty() {
            trace.push("[... native ...]".to_string());
        }
        let location = self.describe(self.cursor.program.as_ref(), self.instruction_start);
        if err.line.is_none() {
            err.line = self
                .cursor
                .program
                .as_ref()
                .and_then(|program| program.debug.as_ref())
                .and_then(|debug| debug.line_for_offset(self.instruction_start))
                .map(|entry| entry.line);
        }
        trace.push(location);
        // The record at `call_depth` belongs to whoever entered this run.
        for address in self.calls.above(call_depth + 1).iter().rev() {
            trace.push(self.describe(address.program.as_ref(), address.ip.saturating_sub(1)));
        }
        debug!(error = %err.kind, frames = trace.len(), "unwinding guest stacks");

        self.calls.truncate(call_depth);
        self.locals.truncate(local_depth);
        self.eval.truncate(eval_depth);

        err.trace = trace;
        err
    }

    fn describe(&self, program: Option<&Rc<Program>>, offset: usize) -> String {
        match program.and_then(|program| program.describe_offset(offset)) {
            Some(text) => text,
            None => format!("at {offset:08X}"),
        }
    }

    fn begin_call(&mut self, script: &ScriptClosure, args: Vec<Value>) -> Result<(), RuntimeError> {
        let depth = Frame::depth_after(script.args.as_ref());
        let frame = Frame::with_values(depth, script.args.clone(), args);
        trace!(entry = script.entry, depth, "enter guest function");
        self.calls.push(ReturnAddress {
            program: self.cursor.program.clone(),
            ip: self.cursor.ip,
            args: self.cursor.args.clone(),
        })?;
        self.locals.push(script.locals.clone())?;
        self.cursor = Cursor {
            program: Some(script.program.clone()),
            ip: script.entry,
            args: Some(frame),
            locals: script.locals.clone(),
        };
        Ok(())
    }

    fn begin_tail_call(
        &mut self,
        script: &ScriptClosure,
        args: Vec<Value>,
    ) -> Result<(), RuntimeError> {
        let address = self.calls.pop()?;
        self.locals.pop()?;
        let frame = Frame::recycle(self.cursor.args.take(), script.args.as_ref(), args);
        trace!(entry = script.entry, depth = frame.depth(), "tail call");
        self.calls.push(address)?;
        self.locals.push(script.locals.clone())?;
        self.cursor = Cursor {
            program: Some(script.program.clone()),
            ip: script.entry,
            args: Some(frame),
            locals: script.locals.clone(),
        };
        Ok(())
    }

    /// Returns `Some(result)` once the `run` boundary at `call_depth` is reached.
    fn finish_return(&mut self, call_depth: usize) -> Result<Option<Value>, RuntimeError> {
        let address = self.calls.pop()?;
        self.locals.pop()?;
        if self.calls.len() == call_depth {
            return self.eval.pop().map(Some);
        }
        self.cursor.program = address.program;
        self.cursor.ip = address.ip;
        self.cursor.args = address.args;
        self.cursor.locals = self.locals.peek()?.clone();
        Ok(None)
    }

    fn execute(&mut self, call_depth: usize) -> VmResult<Value> {
        loop {
            self.instruction_start = self.cursor.ip;
            let byte = self.read_u8()?;
            let opcode = OpCode::from_u8(byte).ok_or(RuntimeError::InvalidOpcode(byte))?;
            match opcode {
                OpCode::Function | OpCode::Line | OpCode::Label => {
                    return Err(RuntimeError::InvalidOpcode(byte).into());
                }
                OpCode::Dup => {
                    let value = self.eval.peek()?.clone();
                    self.eval.push(value)?;
                }
                OpCode::Drop => {
                    self.eval.pop()?;
                }
                OpCode::Swap => {
                    let top = self.eval.pop()?;
                    let below = self.eval.pop()?;
                    self.eval.push(top)?;
                    self.eval.push(below)?;
                }
                OpCode::LdNil => self.eval.push(Value::Nil)?,
                OpCode::LdTrue => self.eval.push(Value::Bool(true))?,
                OpCode::LdFalse => self.eval.push(Value::Bool(false))?,
                OpCode::LdNum => {
                    let index = self.read_u32()?;
                    let value = self
                        .program()?
                        .number(index)
                        .ok_or(RuntimeError::InvalidConstant {
                            pool: "number",
                            index,
                        })?;
                    self.eval.push(Value::Number(value))?;
                }
                OpCode::LdStr => {
                    let value = Value::string(self.read_string()?);
                    self.eval.push(value)?;
                }
                OpCode::LdGlobal => self.eval.push(Value::Object(self.globals.clone()))?,
                OpCode::LdLocF => {
                    let index = self.read_i32()?;
                    let value = self.current_locals()?.get_local(index);
                    self.eval.push(value)?;
                }
                OpCode::StLocF => {
                    let index = self.read_i32()?;
                    let value = self.eval.pop()?;
                    self.current_locals()?.set_local(index, value);
                }
                OpCode::LdLoc => {
                    let depth = self.read_i32()?;
                    let index = self.read_i32()?;
                    let value = self.frame_for(depth)?.get(depth.abs(), index)?;
                    self.eval.push(value)?;
                }
                OpCode::StLoc => {
                    let depth = self.read_i32()?;
                    let index = self.read_i32()?;
                    let value = self.eval.pop()?;
                    self.frame_for(depth)?.set(depth.abs(), index, value)?;
                }
                OpCode::LdFld => {
                    let name = self.read_string()?;
                    let target = self.eval.pop()?;
                    self.eval.push(target.field(&name))?;
                }
                OpCode::StFld => {
                    let name = self.read_string()?;
                    let target = self.eval.pop()?;
                    let value = self.eval.pop()?;
                    target.set_field(&name, value)?;
                }
                OpCode::LdArr => {
                    let index = self.eval.pop()?;
                    let target = self.eval.pop()?;
                    self.eval.push(target.index(&index)?)?;
                }
                OpCode::StArr => {
                    let index = self.eval.pop()?;
                    let target = self.eval.pop()?;
                    let value = self.eval.pop()?;
                    target.set_index(index, value)?;
                }
                OpCode::NewObject => {
                    let count = self.read_count()?;
                    let mut entries = Vec::with_capacity(count);
                    for _ in 0..count {
                        let key = self.eval.pop()?;
                        let value = self.eval.pop()?;
                        entries.push((key, value));
                    }
                    let mut table = Table::new();
                    for (key, value) in entries.into_iter().rev() {
                        table.set(key, value);
                    }
                    self.eval.push(Value::object(table))?;
                }
                OpCode::NewArray => {
                    let count = self.read_count()?;
                    let items = self.eval.pop_many(count)?;
                    self.eval.push(Value::array(items))?;
                }
                OpCode::Concat => self.binary(Value::concat)?,
                OpCode::Add => self.binary(Value::add)?,
                OpCode::Sub => self.binary(Value::sub)?,
                OpCode::Mul => self.binary(Value::mul)?,
                OpCode::Div => self.binary(Value::div)?,
                OpCode::Mod => self.binary(Value::rem)?,
                OpCode::Exp => self.binary(Value::pow)?,
                OpCode::Neg => {
                    let value = self.eval.pop()?;
                    self.eval.push(value.neg()?)?;
                }
                OpCode::Eq => self.binary(|left, right| Ok(Value::Bool(left == right)))?,
                OpCode::Neq => self.binary(|left, right| Ok(Value::Bool(left != right)))?,
                OpCode::Gt => self.relational(|ordering| ordering.is_gt())?,
                OpCode::Gte => self.relational(|ordering| ordering.is_ge())?,
                OpCode::Lt => self.relational(|ordering| ordering.is_lt())?,
                OpCode::Lte => self.relational(|ordering| ordering.is_le())?,
                OpCode::Not => {
                    let value = self.eval.pop()?;
                    self.eval.push(Value::Bool(!value.is_truthy()))?;
                }
                OpCode::Closure => {
                    let entry = self.read_target()?;
                    let closure = ScriptClosure {
                        program: self.program()?.clone(),
                        entry,
                        args: self.cursor.args.clone(),
                        locals: self.cursor.locals.clone(),
                    };
                    self.eval
                        .push(Value::Function(Rc::new(Closure::Script(closure))))?;
                }
                OpCode::Call => {
                    let (callee, args) = self.pop_call()?;
                    match callee.as_ref() {
                        Closure::Script(script) => self.begin_call(script, args)?,
                        _ => {
                            let result = self.invoke(&callee, &args)?;
                            self.eval.push(result)?;
                        }
                    }
                }
                OpCode::TailCall => {
                    let (callee, args) = self.pop_call()?;
                    match callee.as_ref() {
                        Closure::Script(script) => self.begin_tail_call(script, args)?,
                        _ => {
                            let result = self.invoke(&callee, &args)?;
                            self.eval.push(result)?;
                            if let Some(result) = self.finish_return(call_depth)? {
                                return Ok(result);
                            }
                        }
                    }
                }
                OpCode::Enter => {
                    let count = self.read_count()?;
                    let previous = self.locals.pop()?;
                    let depth = Frame::depth_after(previous.as_ref());
                    let frame = Frame::new(depth, previous, count);
                    self.locals.push(Some(frame.clone()))?;
                    self.cursor.locals = Some(frame);
                }
                OpCode::Ret => {
                    if let Some(result) = self.finish_return(call_depth)? {
                        trace!(call_depth, "guest run finished");
                        return Ok(result);
                    }
                }
                OpCode::VarArgs => {
                    let fixed = self.read_count()?;
                    self.current_args()?.collect_rest(fixed);
                }
                OpCode::Jmp => {
                    let target = self.read_target()?;
                    self.jump_to(target)?;
                }
                OpCode::JmpTrueP | OpCode::JmpFalseP => {
                    let target = self.read_target()?;
                    let truthy = self.eval.peek()?.is_truthy();
                    if truthy == (opcode == OpCode::JmpTrueP) {
                        self.jump_to(target)?;
                    }
                }
                OpCode::JmpTrue | OpCode::JmpFalse => {
                    let target = self.read_target()?;
                    let truthy = self.eval.pop()?.is_truthy();
                    if truthy == (opcode == OpCode::JmpTrue) {
                        self.jump_to(target)?;
                    }
                }
                OpCode::JmpTable => {
                    let start = self.read_i32()?;
                    let count = self.read_count()?;
                    let mut labels = Vec::with_capacity(count);
                    for _ in 0..count {
                        labels.push(self.read_target()?);
                    }
                    let value = self.eval.pop()?;
                    if let Value::Number(number) = value
                        && number.fract() == 0.0
                    {
                        let slot = number - f64::from(start);
                        if slot >= 0.0 && slot < count as f64 {
                            self.jump_to(labels[slot as usize])?;
                        }
                    }
                }
            }
        }
    }

    fn pop_call(&mut self) -> Result<(Rc<Closure>, Vec<Value>), VmError> {
        let argc = self.read_count()?;
        let splat_count = self.read_u8()?;
        let mut splats = Vec::with_capacity(splat_count as usize);
        for _ in 0..splat_count {
            splats.push(self.read_count()?);
        }

        let callee = match self.eval.pop()? {
            Value::Function(closure) => closure,
            other => return Err(RuntimeError::ValueNotCallable(other.type_name()).into()),
        };
        let args = self.eval.pop_many(argc)?;
        if splats.is_empty() {
            return Ok((callee, args));
        }

        let mut expanded = Vec::with_capacity(args.len());
        for (position, arg) in args.into_iter().enumerate() {
            if splats.contains(&position) {
                expanded.extend(self.enumerate(&arg)?);
            } else {
                expanded.push(arg);
            }
        }
        Ok((callee, expanded))
    }

    fn invoke(&mut self, callee: &Rc<Closure>, args: &[Value]) -> VmResult<Value> {
        match callee.as_ref() {
            Closure::Native(function) => {
                let function = function.clone();
                function(self, args)
            }
            Closure::Method { function, receiver } => {
                let function = function.clone();
                let receiver = receiver.clone().unwrap_or_default();
                function(self, &receiver, args)
            }
            Closure::Script(script) => self.run(script, args.to_vec()),
        }
    }

    fn binary(
        &mut self,
        apply: impl Fn(&Value, &Value) -> Result<Value, RuntimeError>,
    ) -> Result<(), RuntimeError> {
        let left = self.eval.pop()?;
        let right = self.eval.pop()?;
        let result = apply(&left, &right)?;
        self.eval.push(result)
    }

    fn relational(
        &mut self,
        test: impl Fn(std::cmp::Ordering) -> bool,
    ) -> Result<(), RuntimeError> {
        self.binary(|left, right| Ok(Value::Bool(left.compare(right)?.is_some_and(&test))))
    }

    fn program(&self) -> Result<&Rc<Program>, RuntimeError> {
        self.cursor
            .program
            .as_ref()
            .ok_or(RuntimeError::BytecodeBounds)
    }

    fn current_locals(&self) -> Result<&FrameRef, RuntimeError> {
        self.cursor
            .locals
            .as_ref()
            .ok_or(RuntimeError::UnresolvedFrame(0))
    }

    fn current_args(&self) -> Result<&FrameRef, RuntimeError> {
        self.cursor
            .args
            .as_ref()
            .ok_or(RuntimeError::UnresolvedFrame(0))
    }

    /// Negative depths address the argument chain, others the local chain.
    fn frame_for(&self, depth: i32) -> Result<&FrameRef, RuntimeError> {
        let frame = if depth < 0 {
            self.cursor.args.as_ref()
        } else {
            self.cursor.locals.as_ref()
        };
        frame.ok_or(RuntimeError::UnresolvedFrame(depth))
    }

    fn jump_to(&mut self, target: usize) -> Result<(), RuntimeError> {
        if target >= self.program()?.code.len() {
            return Err(RuntimeError::BytecodeBounds);
        }
        self.cursor.ip = target;
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8, RuntimeError> {
        let ip = self.cursor.ip;
        let byte = *self
            .program()?
            .code
            .get(ip)
            .ok_or(RuntimeError::BytecodeBounds)?;
        self.cursor.ip = ip + 1;
        Ok(byte)
    }

    fn read_u32(&mut self) -> Result<u32, RuntimeError> {
        let ip = self.cursor.ip;
        let bytes = self
            .program()?
            .code
            .get(ip..ip + 4)
            .ok_or(RuntimeError::BytecodeBounds)?;
        let value = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        self.cursor.ip = ip + 4;
        Ok(value)
    }

    fn read_i32(&mut self) -> Result<i32, RuntimeError> {
        self.read_u32().map(|value| value as i32)
    }

    fn read_count(&mut self) -> Result<usize, RuntimeError> {
        let value = self.read_i32()?;
        usize::try_from(value).map_err(|_| RuntimeError::BytecodeBounds)
    }

    fn read_target(&mut self) -> Result<usize, RuntimeError> {
        self.read_count()
    }

    fn read_string(&mut self) -> Result<Rc<str>, RuntimeError> {
        let index = self.read_u32()?;
        self.program()?
            .string(index)
            .map(Rc::from)
            .ok_or(RuntimeError::InvalidConstant {
                pool: "string",
                index,
            })
    }
}
