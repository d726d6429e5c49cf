use crate::assembler::{Instruction, LabelId, Operand};
use crate::bytecode::OpCode;

use super::ast::{BinaryOp, PrefixOp};
use super::scope::Address;

/// Instruction buffer of one function under compilation.
///
/// Every emit adds the instruction's stack delta to `stack_depth`, so the
/// generator can compare what an expression claims to leave on the stack with
/// what its instructions actually do.
#[derive(Debug)]
pub struct FunctionContext {
    pub name: String,
    pub depth: i32,
    pub entry: LabelId,
    instructions: Vec<Instruction>,
    stack_depth: i32,
    break_labels: Vec<LabelId>,
    enter_at: Option<usize>,
}

impl FunctionContext {
    pub fn new(name: impl Into<String>, depth: i32, entry: LabelId) -> Self {
        Self {
            name: name.into(),
            depth,
            entry,
            instructions: Vec::new(),
            stack_depth: 0,
            break_labels: Vec::new(),
            enter_at: None,
        }
    }

    pub fn stack_depth(&self) -> i32 {
        self.stack_depth
    }

    pub fn into_instructions(self) -> Vec<Instruction> {
        self.instructions
    }

    pub fn emit(&mut self, instruction: Instruction) {
        self.stack_depth += instruction.stack_delta();
        self.instructions.push(instruction);
    }

    pub fn op(&mut self, opcode: OpCode) {
        self.emit(Instruction::new(opcode));
    }

    pub fn op_with(&mut self, opcode: OpCode, operand: Operand) {
        self.emit(Instruction::with(opcode, operand));
    }

    pub fn bind(&mut self, label: LabelId) {
        self.op_with(OpCode::Label, Operand::Label(label));
    }

    pub fn jump(&mut self, opcode: OpCode, label: LabelId) {
        self.op_with(opcode, Operand::Label(label));
    }

    pub fn function_marker(&mut self, name: u32) {
        self.op_with(OpCode::Function, Operand::String(name));
    }

    pub fn line(&mut self, file: u32, line: u32) {
        self.op_with(OpCode::Line, Operand::Line { file, line });
    }

    /// Emits `enter` with a placeholder count; see [`FunctionContext::patch_enter`].
    pub fn enter(&mut self) {
        self.enter_at = Some(self.instructions.len());
        self.op_with(OpCode::Enter, Operand::Immediate(0));
    }

    pub fn patch_enter(&mut self, count: i32) {
        if let Some(instruction) = self
            .enter_at
            .and_then(|index| self.instructions.get_mut(index))
        {
            instruction.operand = Operand::Immediate(count);
        }
    }

    pub fn load_number(&mut self, id: u32) {
        self.op_with(OpCode::LdNum, Operand::Number(id));
    }

    pub fn load_string(&mut self, id: u32) {
        self.op_with(OpCode::LdStr, Operand::String(id));
    }

    pub fn load_field(&mut self, name: u32) {
        self.op_with(OpCode::LdFld, Operand::String(name));
    }

    pub fn store_field(&mut self, name: u32) {
        self.op_with(OpCode::StFld, Operand::String(name));
    }

    /// Locals of this function use the short form; everything else walks the
    /// frame chain.
    pub fn load(&mut self, address: Address) {
        if !address.is_argument && address.depth == self.depth {
            self.op_with(OpCode::LdLocF, Operand::Immediate(address.slot));
        } else {
            self.op_with(OpCode::LdLoc, identifier(address));
        }
    }

    pub fn store(&mut self, address: Address) {
        if !address.is_argument && address.depth == self.depth {
            self.op_with(OpCode::StLocF, Operand::Immediate(address.slot));
        } else {
            self.op_with(OpCode::StLoc, identifier(address));
        }
    }

    pub fn binary(&mut self, op: BinaryOp) {
        let opcode = match op {
            BinaryOp::Add => OpCode::Add,
            BinaryOp::Sub => OpCode::Sub,
            BinaryOp::Mul => OpCode::Mul,
            BinaryOp::Div => OpCode::Div,
            BinaryOp::Mod => OpCode::Mod,
            BinaryOp::Pow => OpCode::Exp,
            BinaryOp::Concat => OpCode::Concat,
            BinaryOp::Eq => OpCode::Eq,
            BinaryOp::Neq => OpCode::Neq,
            BinaryOp::Lt => OpCode::Lt,
            BinaryOp::Lte => OpCode::Lte,
            BinaryOp::Gt => OpCode::Gt,
            BinaryOp::Gte => OpCode::Gte,
            // Short-circuit operators are lowered to jumps by the generator.
            BinaryOp::And | BinaryOp::Or => return,
        };
        self.op(opcode);
    }

    pub fn prefix(&mut self, op: PrefixOp) {
        self.op(match op {
            PrefixOp::Neg => OpCode::Neg,
            PrefixOp::Not => OpCode::Not,
        });
    }

    pub fn call(&mut self, opcode: OpCode, argc: i32, splats: Vec<i32>) {
        self.op_with(opcode, Operand::Call { argc, splats });
    }

    pub fn push_loop(&mut self, break_label: LabelId) {
        self.break_labels.push(break_label);
    }

    pub fn pop_loop(&mut self) {
        self.break_labels.pop();
    }

    pub fn break_label(&self) -> Option<LabelId> {
        self.break_labels.last().copied()
    }
}

fn identifier(address: Address) -> Operand {
    Operand::Identifier {
        depth: address.encoded_depth(),
        slot: address.slot,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(depth: i32, slot: i32) -> Address {
        Address {
            depth,
            slot,
            is_argument: false,
            read_only: false,
        }
    }

    #[test]
    fn current_depth_locals_use_short_form() {
        let mut ctx = FunctionContext::new("f", 1, 0);
        ctx.load(local(1, 2));
        ctx.load(local(0, 3));
        ctx.load(Address {
            is_argument: true,
            ..local(1, 0)
        });
        let ops: Vec<_> = ctx
            .into_instructions()
            .into_iter()
            .map(|instruction| (instruction.opcode, instruction.operand))
            .collect();
        assert_eq!(
            ops,
            vec![
                (OpCode::LdLocF, Operand::Immediate(2)),
                (OpCode::LdLoc, Operand::Identifier { depth: 0, slot: 3 }),
                (OpCode::LdLoc, Operand::Identifier { depth: -1, slot: 0 }),
            ]
        );
    }

    #[test]
    fn stack_depth_tracks_emitted_deltas() {
        let mut ctx = FunctionContext::new("main", 0, 0);
        ctx.enter();
        ctx.load_number(0);
        ctx.load_number(1);
        ctx.binary(BinaryOp::Add);
        assert_eq!(ctx.stack_depth(), 1);
        ctx.op(OpCode::Ret);
        assert_eq!(ctx.stack_depth(), 0);
        ctx.patch_enter(4);
        let instructions = ctx.into_instructions();
        assert_eq!(instructions[0].operand, Operand::Immediate(4));
    }
}
