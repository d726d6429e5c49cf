use std::collections::HashSet;

use tracing::trace;

use crate::assembler::{self, LabelId, Operand};
use crate::bytecode::OpCode;
use crate::program::{ConstantPool, Program};

use super::ast::{BinaryOp, Branch, CallArg, Expr, ExprKind, FunctionBody, LocalName, TableEntry};
use super::context::FunctionContext;
use super::scope::{Address, ScopeChain};
use super::{CompileError, CompileErrorKind, CompilerOptions};

type Result<T> = std::result::Result<T, CompileError>;

/// Compiles a folded tree into a linked program.
pub(super) fn generate(tree: &Expr, options: &CompilerOptions) -> Result<Program> {
    let mut generator = Generator::new(options);
    generator.program(tree)?;
    generator.link()
}

/// Where a declaration ends up: a frame slot or a field of the global table.
#[derive(Debug, Clone, Copy)]
enum Binding {
    Slot(Address),
    Global,
}

struct Generator<'o> {
    options: &'o CompilerOptions,
    numbers: ConstantPool<f64>,
    strings: ConstantPool<String>,
    scopes: ScopeChain,
    current: FunctionContext,
    finished: Vec<FunctionContext>,
    next_label: LabelId,
    lambdas: u32,
    globals: HashSet<String>,
    read_only_globals: HashSet<String>,
}

impl<'o> Generator<'o> {
    fn new(options: &'o CompilerOptions) -> Self {
        Self {
            options,
            numbers: ConstantPool::new(),
            strings: ConstantPool::new(),
            scopes: ScopeChain::new(),
            current: FunctionContext::new("main", 0, 0),
            finished: Vec::new(),
            next_label: 1,
            lambdas: 0,
            globals: options.globals.iter().cloned().collect(),
            read_only_globals: HashSet::new(),
        }
    }

    fn error(&self, line: u32, kind: CompileErrorKind) -> CompileError {
        CompileError::new(&self.options.file_name, line, kind)
    }

    fn label(&mut self) -> LabelId {
        let label = self.next_label;
        self.next_label += 1;
        label
    }

    fn string(&mut self, value: &str) -> u32 {
        self.strings.add(value.to_string())
    }

    fn program(&mut self, tree: &Expr) -> Result<()> {
        let body = match &tree.kind {
            ExprKind::Block(body) => body.as_slice(),
            _ => std::slice::from_ref(tree),
        };
        self.scopes.push_function();
        let entry = self.current.entry;
        self.current.bind(entry);
        self.prologue("main", 1);
        self.statements(body)?;
        self.epilogue(tree.line)
    }

    fn link(self) -> Result<Program> {
        let file_name = self.options.file_name.clone();
        let mut instructions = self.current.into_instructions();
        for function in self.finished {
            instructions.extend(function.into_instructions());
        }
        trace!(instructions = instructions.len(), "linking");
        assembler::link(
            &instructions,
            self.numbers.into_vec(),
            self.strings.into_vec(),
            self.options.generate_debug_info,
        )
        .map_err(|err| CompileError::new(file_name, 0, err.into()))
    }

    fn prologue(&mut self, name: &str, line: u32) {
        if self.options.generate_debug_info {
            let name = self.string(name);
            self.current.function_marker(name);
            self.mark_line(line);
        }
        self.current.enter();
    }

    fn epilogue(&mut self, line: u32) -> Result<()> {
        self.current.op(OpCode::LdNil);
        self.current.op(OpCode::Ret);
        let count = self.scopes.pop_function();
        self.current.patch_enter(count);
        let actual = self.current.stack_depth();
        if actual != 0 {
            return Err(self.error(line, CompileErrorKind::StackMismatch { expected: 0, actual }));
        }
        trace!(function = %self.current.name, depth = self.current.depth, locals = count, "function compiled");
        Ok(())
    }

    fn mark_line(&mut self, line: u32) {
        let file = self.strings.add(self.options.file_name.clone());
        self.current.line(file, line);
    }

    fn statements(&mut self, body: &[Expr]) -> Result<()> {
        body.iter().try_for_each(|statement| self.statement(statement))
    }

    fn block(&mut self, body: &[Expr]) -> Result<()> {
        self.scopes.push_block();
        self.statements(body)?;
        self.scopes.pop_block();
        Ok(())
    }

    fn statement(&mut self, expr: &Expr) -> Result<()> {
        if self.options.generate_debug_info && !matches!(expr.kind, ExprKind::Block(_)) {
            self.mark_line(expr.line);
        }
        match self.generate(expr, true)? {
            0 => Ok(()),
            1 => {
                self.current.op(OpCode::Drop);
                Ok(())
            }
            actual => Err(self.error(expr.line, CompileErrorKind::StackMismatch { expected: 0, actual })),
        }
    }

    /// Emits `expr` and checks its claimed stack effect against the simulated one.
    fn generate(&mut self, expr: &Expr, in_statement: bool) -> Result<i32> {
        let before = self.current.stack_depth();
        let expected = self.node(expr, in_statement)?;
        let actual = self.current.stack_depth() - before;
        if actual != expected {
            return Err(self.error(expr.line, CompileErrorKind::StackMismatch { expected, actual }));
        }
        Ok(expected)
    }

    /// Emits `expr` in a position that needs exactly one value.
    fn value(&mut self, expr: &Expr) -> Result<()> {
        match self.generate(expr, false)? {
            1 => Ok(()),
            actual => Err(self.error(expr.line, CompileErrorKind::StackMismatch { expected: 1, actual })),
        }
    }

    fn node(&mut self, expr: &Expr, in_statement: bool) -> Result<i32> {
        let line = expr.line;
        match &expr.kind {
            ExprKind::Identifier(name) => {
                self.load_name(name, line)?;
                Ok(1)
            }
            ExprKind::Number(value) => {
                let id = self.numbers.add(*value);
                self.current.load_number(id);
                Ok(1)
            }
            ExprKind::String(value) => {
                let id = self.string(value);
                self.current.load_string(id);
                Ok(1)
            }
            ExprKind::Nil => {
                self.current.op(OpCode::LdNil);
                Ok(1)
            }
            ExprKind::Bool(value) => {
                self.current.op(if *value { OpCode::LdTrue } else { OpCode::LdFalse });
                Ok(1)
            }
            ExprKind::Binary { op, left, right } => {
                self.binary(*op, left, right)?;
                Ok(1)
            }
            ExprKind::Prefix { op, operand } => {
                self.value(operand)?;
                self.current.prefix(*op);
                Ok(1)
            }
            ExprKind::Assign { target, value } => self.assign(target, value, in_statement, line),
            ExprKind::Block(body) => {
                self.statements(body)?;
                Ok(0)
            }
            ExprKind::Scope(body) => {
                self.block(body)?;
                Ok(0)
            }
            ExprKind::Local { names, values } => {
                self.local(names, values, line)?;
                Ok(0)
            }
            ExprKind::Function { local, function } => {
                self.function(*local, function, in_statement, line)
            }
            ExprKind::If {
                branches,
                otherwise,
            } => {
                self.if_chain(branches, otherwise.as_deref())?;
                Ok(0)
            }
            ExprKind::While { condition, body } => {
                self.while_loop(condition, body)?;
                Ok(0)
            }
            ExprKind::RepeatUntil { body, condition } => {
                self.repeat_until(body, condition)?;
                Ok(0)
            }
            ExprKind::NumericFor {
                variable,
                start,
                limit,
                step,
                body,
            } => {
                self.numeric_for(variable, start, limit, step.as_deref(), body, line)?;
                Ok(0)
            }
            ExprKind::Break => {
                let label = self.current.break_label().ok_or_else(|| {
                    self.error(
                        line,
                        CompileErrorKind::UnresolvedJump("'break' outside of a loop".to_string()),
                    )
                })?;
                self.current.jump(OpCode::Jmp, label);
                Ok(0)
            }
            ExprKind::Return(value) => {
                self.return_statement(value.as_deref())?;
                Ok(0)
            }
            ExprKind::Table(entries) => {
                self.table(entries, line)?;
                Ok(1)
            }
            ExprKind::Index { target, index } => {
                self.value(target)?;
                self.value(index)?;
                self.current.op(OpCode::LdArr);
                Ok(1)
            }
            ExprKind::Field { target, name } => {
                self.value(target)?;
                let id = self.string(name);
                self.current.load_field(id);
                Ok(1)
            }
            ExprKind::Call { callee, args } => {
                self.call(callee, args, OpCode::Call, line)?;
                Ok(1)
            }
        }
    }

    fn binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr) -> Result<()> {
        let short_circuit = match op {
            BinaryOp::And => Some(OpCode::JmpFalseP),
            BinaryOp::Or => Some(OpCode::JmpTrueP),
            _ => None,
        };
        if let Some(jump) = short_circuit {
            let end = self.label();
            self.value(left)?;
            self.current.jump(jump, end);
            self.current.op(OpCode::Drop);
            self.value(right)?;
            self.current.bind(end);
            return Ok(());
        }
        // The machine pops the left operand first.
        self.value(right)?;
        self.value(left)?;
        self.current.binary(op);
        Ok(())
    }

    fn check_global(&self, name: &str, line: u32) -> Result<()> {
        if self.globals.contains(name) || self.options.use_implicit_globals {
            Ok(())
        } else {
            Err(self.error(line, CompileErrorKind::UndefinedIdentifier(name.to_string())))
        }
    }

    fn load_name(&mut self, name: &str, line: u32) -> Result<()> {
        if let Some(address) = self.scopes.resolve(name) {
            self.current.load(address);
            return Ok(());
        }
        self.check_global(name, line)?;
        self.current.op(OpCode::LdGlobal);
        let id = self.string(name);
        self.current.load_field(id);
        Ok(())
    }

    fn store_name(&mut self, name: &str, line: u32) -> Result<()> {
        let binding = match self.scopes.resolve(name) {
            Some(address) => Binding::Slot(address),
            None => {
                self.check_global(name, line)?;
                Binding::Global
            }
        };
        self.check_writable(name, binding, line)?;
        self.store(name, binding);
        Ok(())
    }

    fn check_writable(&self, name: &str, binding: Binding, line: u32) -> Result<()> {
        let read_only = match binding {
            Binding::Slot(address) => address.read_only,
            Binding::Global => self.read_only_globals.contains(name),
        };
        if read_only {
            Err(self.error(line, CompileErrorKind::CantModifyReadOnly(name.to_string())))
        } else {
            Ok(())
        }
    }

    /// Pops the value on top of the stack into `binding`.
    fn store(&mut self, name: &str, binding: Binding) {
        match binding {
            Binding::Slot(address) => self.current.store(address),
            Binding::Global => {
                self.current.op(OpCode::LdGlobal);
                let id = self.string(name);
                self.current.store_field(id);
            }
        }
    }

    /// Binds a new name in the innermost block, or in the global table for
    /// root declarations when configured so.
    fn declare(&mut self, name: &str, read_only: bool, line: u32) -> Result<Binding> {
        if self.options.root_declarations_global && self.scopes.is_root() {
            self.globals.insert(name.to_string());
            if read_only {
                self.read_only_globals.insert(name.to_string());
            }
            return Ok(Binding::Global);
        }
        self.scopes
            .define(name, read_only)
            .map(Binding::Slot)
            .ok_or_else(|| {
                self.error(line, CompileErrorKind::IdentifierAlreadyDefined(name.to_string()))
            })
    }

    fn assign(&mut self, target: &Expr, value: &Expr, in_statement: bool, line: u32) -> Result<i32> {
        match &target.kind {
            ExprKind::Identifier(name) => {
                self.value(value)?;
                if !in_statement {
                    self.current.op(OpCode::Dup);
                }
                self.store_name(name, line)?;
            }
            ExprKind::Field { target: object, name } => {
                self.value(value)?;
                if !in_statement {
                    self.current.op(OpCode::Dup);
                }
                self.value(object)?;
                let id = self.string(name);
                self.current.store_field(id);
            }
            ExprKind::Index {
                target: object,
                index,
            } => {
                self.value(value)?;
                if !in_statement {
                    self.current.op(OpCode::Dup);
                }
                self.value(object)?;
                self.value(index)?;
                self.current.op(OpCode::StArr);
            }
            _ => return Err(self.error(line, CompileErrorKind::LeftSideMustBeStorable)),
        }
        Ok(if in_statement { 0 } else { 1 })
    }

    /// Initializers are evaluated before any of the names come into scope.
    fn local(&mut self, names: &[LocalName], values: &[Expr], line: u32) -> Result<()> {
        for value in values {
            self.value(value)?;
        }
        for _ in names.len()..values.len() {
            self.current.op(OpCode::Drop);
        }
        for _ in values.len()..names.len() {
            self.current.op(OpCode::LdNil);
        }
        let mut bindings = Vec::with_capacity(names.len());
        for local in names {
            bindings.push(self.declare(&local.name, local.read_only, line)?);
        }
        for (local, binding) in names.iter().zip(bindings).rev() {
            self.store(&local.name, binding);
        }
        Ok(())
    }

    fn function(
        &mut self,
        local: bool,
        function: &FunctionBody,
        in_statement: bool,
        line: u32,
    ) -> Result<i32> {
        let Some(name) = &function.name else {
            if in_statement {
                return Err(self.error(line, CompileErrorKind::FunctionNeverUsed));
            }
            let name = format!("<lambda{}>", self.lambdas);
            self.lambdas += 1;
            let entry = self.compile_function(function, &name, line)?;
            self.current.jump(OpCode::Closure, entry);
            return Ok(1);
        };

        // The name is bound before the body is compiled so the body can recurse.
        let binding = if local {
            self.declare(name, false, line)?
        } else {
            match self.scopes.resolve(name) {
                Some(address) => Binding::Slot(address),
                None => {
                    self.globals.insert(name.clone());
                    Binding::Global
                }
            }
        };
        self.check_writable(name, binding, line)?;

        let entry = self.compile_function(function, name, line)?;
        self.current.jump(OpCode::Closure, entry);
        if !in_statement {
            self.current.op(OpCode::Dup);
        }
        self.store(name, binding);
        Ok(if in_statement { 0 } else { 1 })
    }

    fn compile_function(&mut self, function: &FunctionBody, name: &str, line: u32) -> Result<LabelId> {
        let entry = self.label();
        let depth = self.current.depth + 1;
        let outer = std::mem::replace(&mut self.current, FunctionContext::new(name, depth, entry));
        let result = self.function_body(function, name, line);
        let inner = std::mem::replace(&mut self.current, outer);
        result?;
        self.finished.push(inner);
        Ok(entry)
    }

    fn function_body(&mut self, function: &FunctionBody, name: &str, line: u32) -> Result<()> {
        self.scopes.push_function();
        let fixed = function.params.len() as i32;
        let params = function.params.iter().zip(0..);
        let rest = function.rest.iter().map(|rest| (rest, fixed));
        for (param, index) in params.chain(rest) {
            if self.scopes.define_argument(index, param).is_none() {
                return Err(self.error(
                    line,
                    CompileErrorKind::IdentifierAlreadyDefined(param.clone()),
                ));
            }
        }

        let entry = self.current.entry;
        self.current.bind(entry);
        self.prologue(name, line);
        if function.rest.is_some() {
            self.current.op_with(OpCode::VarArgs, Operand::Immediate(fixed));
        }
        self.statements(&function.body)?;
        self.epilogue(line)
    }

    fn if_chain(&mut self, branches: &[Branch], otherwise: Option<&[Expr]>) -> Result<()> {
        let end = self.label();
        for branch in branches {
            let next = self.label();
            self.value(&branch.condition)?;
            self.current.jump(OpCode::JmpFalse, next);
            self.block(&branch.body)?;
            self.current.jump(OpCode::Jmp, end);
            self.current.bind(next);
        }
        if let Some(body) = otherwise {
            self.block(body)?;
        }
        self.current.bind(end);
        Ok(())
    }

    fn while_loop(&mut self, condition: &Expr, body: &[Expr]) -> Result<()> {
        let start = self.label();
        let end = self.label();
        self.current.bind(start);
        if condition.kind != ExprKind::Bool(true) {
            self.value(condition)?;
            self.current.jump(OpCode::JmpFalse, end);
        }
        self.current.push_loop(end);
        self.block(body)?;
        self.current.pop_loop();
        self.current.jump(OpCode::Jmp, start);
        self.current.bind(end);
        Ok(())
    }

    /// The condition sees the body's locals; the loop repeats while it is falsy.
    fn repeat_until(&mut self, body: &[Expr], condition: &Expr) -> Result<()> {
        let start = self.label();
        let end = self.label();
        self.current.bind(start);
        self.current.push_loop(end);
        self.scopes.push_block();
        self.statements(body)?;
        self.value(condition)?;
        self.scopes.pop_block();
        self.current.pop_loop();
        self.current.jump(OpCode::JmpFalse, start);
        self.current.bind(end);
        Ok(())
    }

    fn numeric_for(
        &mut self,
        variable: &str,
        start: &Expr,
        limit: &Expr,
        step: Option<&Expr>,
        body: &[Expr],
        line: u32,
    ) -> Result<()> {
        self.scopes.push_block();
        self.value(start)?;
        let counter = self
            .scopes
            .define(variable, false)
            .ok_or_else(|| {
                self.error(line, CompileErrorKind::IdentifierAlreadyDefined(variable.to_string()))
            })?;
        self.current.store(counter);
        self.value(limit)?;
        let limit = self.scopes.define_internal("limit");
        self.current.store(limit);
        match step {
            Some(step) => self.value(step)?,
            None => {
                let one = self.numbers.add(1.0);
                self.current.load_number(one);
            }
        }
        let step = self.scopes.define_internal("step");
        self.current.store(step);

        let test = self.label();
        let descending = self.label();
        let enter_body = self.label();
        let end = self.label();
        let zero = self.numbers.add(0.0);

        self.current.bind(test);
        // step >= 0
        self.current.load_number(zero);
        self.current.load(step);
        self.current.op(OpCode::Gte);
        self.current.jump(OpCode::JmpFalse, descending);
        // counter <= limit
        self.current.load(limit);
        self.current.load(counter);
        self.current.op(OpCode::Lte);
        self.current.jump(OpCode::JmpFalse, end);
        self.current.jump(OpCode::Jmp, enter_body);
        self.current.bind(descending);
        // counter >= limit
        self.current.load(limit);
        self.current.load(counter);
        self.current.op(OpCode::Gte);
        self.current.jump(OpCode::JmpFalse, end);

        self.current.bind(enter_body);
        self.current.push_loop(end);
        self.block(body)?;
        self.current.pop_loop();
        self.current.load(step);
        self.current.load(counter);
        self.current.op(OpCode::Add);
        self.current.store(counter);
        self.current.jump(OpCode::Jmp, test);
        self.current.bind(end);
        self.scopes.pop_block();
        Ok(())
    }

    fn return_statement(&mut self, value: Option<&Expr>) -> Result<()> {
        match value {
            None => {
                self.current.op(OpCode::LdNil);
                self.current.op(OpCode::Ret);
            }
            Some(Expr {
                kind: ExprKind::Call { callee, args },
                line,
            }) => self.call(callee, args, OpCode::TailCall, *line)?,
            Some(value) => {
                self.value(value)?;
                self.current.op(OpCode::Ret);
            }
        }
        Ok(())
    }

    fn call(&mut self, callee: &Expr, args: &[CallArg], opcode: OpCode, line: u32) -> Result<()> {
        let mut splats = Vec::new();
        for (position, arg) in args.iter().enumerate() {
            self.value(&arg.value)?;
            if arg.splat {
                splats.push(position as i32);
            }
        }
        if splats.len() > usize::from(u8::MAX) {
            return Err(self.error(line, CompileErrorKind::TooManyArguments(splats.len())));
        }
        let argc = i32::try_from(args.len())
            .map_err(|_| self.error(line, CompileErrorKind::TooManyArguments(args.len())))?;
        self.value(callee)?;
        self.current.call(opcode, argc, splats);
        Ok(())
    }

    fn table(&mut self, entries: &[TableEntry], line: u32) -> Result<()> {
        let keyed = entries
            .iter()
            .filter(|entry| matches!(entry, TableEntry::Keyed { .. }))
            .count();
        let count = i32::try_from(entries.len())
            .map_err(|_| self.error(line, CompileErrorKind::TooManyArguments(entries.len())))?;
        if keyed == entries.len() {
            for entry in entries {
                if let TableEntry::Keyed { key, value } = entry {
                    self.value(value)?;
                    self.value(key)?;
                }
            }
            self.current.op_with(OpCode::NewObject, Operand::Immediate(count));
        } else if keyed == 0 {
            for entry in entries {
                if let TableEntry::Positional(value) = entry {
                    self.value(value)?;
                }
            }
            self.current.op_with(OpCode::NewArray, Operand::Immediate(count));
        } else {
            return Err(self.error(line, CompileErrorKind::MixedTableConstructor));
        }
        Ok(())
    }
}
