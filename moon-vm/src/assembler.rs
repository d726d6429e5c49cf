use std::collections::HashMap;
use std::fmt;

use crate::bytecode::{OpCode, OperandLayout};
use crate::debug_info::DebugInfoBuilder;
use crate::program::Program;

pub type LabelId = u32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssemblerError {
    #[error("label L{0} is never bound")]
    UnboundLabel(LabelId),
    #[error("label L{0} is bound twice")]
    DuplicateLabel(LabelId),
    #[error("operand does not fit opcode {0}")]
    OperandMismatch(&'static str),
    #[error("program too large: {0} bytes")]
    ProgramTooLarge(usize),
}

/// Symbolic operand. Labels stay unresolved until [`link`] assigns offsets.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    None,
    Immediate(i32),
    Number(u32),
    String(u32),
    Identifier { depth: i32, slot: i32 },
    Label(LabelId),
    Call { argc: i32, splats: Vec<i32> },
    Table { start: i32, labels: Vec<LabelId> },
    /// Operand of the zero-length line marker.
    Line { file: u32, line: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub opcode: OpCode,
    pub operand: Operand,
}

impl Instruction {
    pub fn new(opcode: OpCode) -> Self {
        Self {
            opcode,
            operand: Operand::None,
        }
    }

    pub fn with(opcode: OpCode, operand: Operand) -> Self {
        Self { opcode, operand }
    }

    /// Net evaluation-stack change caused by executing this instruction.
    pub fn stack_delta(&self) -> i32 {
        let count = match &self.operand {
            Operand::Immediate(value) => *value,
            Operand::Call { argc, .. } => *argc,
            _ => 0,
        };
        match self.opcode {
            OpCode::Dup
            | OpCode::LdNil
            | OpCode::LdTrue
            | OpCode::LdFalse
            | OpCode::LdNum
            | OpCode::LdStr
            | OpCode::LdGlobal
            | OpCode::LdLocF
            | OpCode::LdLoc
            | OpCode::Closure => 1,
            OpCode::Drop
            | OpCode::StLocF
            | OpCode::StLoc
            | OpCode::JmpTrue
            | OpCode::JmpFalse
            | OpCode::JmpTable
            | OpCode::Ret => -1,
            OpCode::Function
            | OpCode::Line
            | OpCode::Label
            | OpCode::LdFld
            | OpCode::Swap
            | OpCode::Neg
            | OpCode::Not
            | OpCode::Enter
            | OpCode::VarArgs
            | OpCode::Jmp
            | OpCode::JmpTrueP
            | OpCode::JmpFalseP => 0,
            OpCode::LdArr
            | OpCode::Concat
            | OpCode::Add
            | OpCode::Sub
            | OpCode::Mul
            | OpCode::Div
            | OpCode::Mod
            | OpCode::Exp
            | OpCode::Eq
            | OpCode::Neq
            | OpCode::Gt
            | OpCode::Gte
            | OpCode::Lt
            | OpCode::Lte => -1,
            OpCode::StFld => -2,
            OpCode::StArr => -3,
            OpCode::NewObject => -2 * count + 1,
            OpCode::NewArray => -count + 1,
            OpCode::Call => -count,
            OpCode::TailCall => -(count + 1),
        }
    }

    /// Encoded size in bytes; markers occupy none.
    pub fn encoded_len(&self) -> usize {
        if self.opcode.is_marker() {
            return 0;
        }
        1 + match &self.operand {
            Operand::None | Operand::Line { .. } => 0,
            Operand::Immediate(_) | Operand::Number(_) | Operand::String(_) | Operand::Label(_) => 4,
            Operand::Identifier { .. } => 8,
            Operand::Call { splats, .. } => 5 + 4 * splats.len(),
            Operand::Table { labels, .. } => 8 + 4 * labels.len(),
        }
    }

    fn check_operand(&self) -> Result<(), AssemblerError> {
        let fits = match self.opcode {
            OpCode::Function => matches!(self.operand, Operand::String(_)),
            OpCode::Line => matches!(self.operand, Operand::Line { .. }),
            OpCode::Label => matches!(self.operand, Operand::Label(_)),
            opcode => match (opcode.layout(), &self.operand) {
                (OperandLayout::None, Operand::None)
                | (OperandLayout::Immediate, Operand::Immediate(_))
                | (OperandLayout::Number, Operand::Number(_))
                | (OperandLayout::String, Operand::String(_))
                | (OperandLayout::Identifier, Operand::Identifier { .. })
                | (OperandLayout::Label, Operand::Label(_))
                | (OperandLayout::Call, Operand::Call { .. })
                | (OperandLayout::Table, Operand::Table { .. }) => true,
                _ => false,
            },
        };
        if fits {
            Ok(())
        } else {
            Err(AssemblerError::OperandMismatch(self.opcode.mnemonic()))
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.opcode {
            OpCode::Label => {
                if let Operand::Label(id) = self.operand {
                    return write!(f, "L{id}:");
                }
            }
            OpCode::Function => {
                if let Operand::String(name) = self.operand {
                    return write!(f, "; function s{name}");
                }
            }
            OpCode::Line => {
                if let Operand::Line { file, line } = self.operand {
                    return write!(f, "; line s{file}:{line}");
                }
            }
            _ => {}
        }
        write!(f, "    {}", self.opcode.mnemonic())?;
        match &self.operand {
            Operand::None | Operand::Line { .. } => Ok(()),
            Operand::Immediate(value) => write!(f, " {value}"),
            Operand::Number(id) => write!(f, " n{id}"),
            Operand::String(id) => write!(f, " s{id}"),
            Operand::Identifier { depth, slot } => write!(f, " {depth}:{slot}"),
            Operand::Label(id) => write!(f, " L{id}"),
            Operand::Call { argc, splats } => {
                write!(f, " {argc}")?;
                for splat in splats {
                    write!(f, " ...{splat}")?;
                }
                Ok(())
            }
            Operand::Table { start, labels } => {
                write!(f, " {start}")?;
                for label in labels {
                    write!(f, " L{label}")?;
                }
                Ok(())
            }
        }
    }
}

/// Resolves labels and serializes the instruction stream into a [`Program`].
///
/// The first pass assigns every instruction its byte offset and binds each
/// label marker to the offset of the instruction that follows it. The second
/// pass writes bytes with label operands replaced by those offsets. Function and
/// line markers become debug tables when `generate_debug_info` is set.
pub fn link(
    instructions: &[Instruction],
    numbers: Vec<f64>,
    strings: Vec<String>,
    generate_debug_info: bool,
) -> Result<Program, AssemblerError> {
    let mut labels: HashMap<LabelId, u32> = HashMap::new();
    let mut offset = 0usize;
    for instruction in instructions {
        instruction.check_operand()?;
        if let (OpCode::Label, Operand::Label(id)) = (instruction.opcode, &instruction.operand)
            && labels.insert(*id, offset_u32(offset)?).is_some()
        {
            return Err(AssemblerError::DuplicateLabel(*id));
        }
        offset += instruction.encoded_len();
    }
    offset_u32(offset)?;

    let resolve = |id: &LabelId| -> Result<u32, AssemblerError> {
        labels
            .get(id)
            .copied()
            .ok_or(AssemblerError::UnboundLabel(*id))
    };

    let mut code = Vec::with_capacity(offset);
    let mut debug = DebugInfoBuilder::new();
    for instruction in instructions {
        let here = code.len() as u32;
        match (instruction.opcode, &instruction.operand) {
            (OpCode::Function, Operand::String(name)) => {
                if generate_debug_info {
                    debug.mark_function(here, *name);
                }
                continue;
            }
            (OpCode::Line, Operand::Line { file, line }) => {
                if generate_debug_info {
                    debug.mark_line(here, *file, *line);
                }
                continue;
            }
            (OpCode::Label, _) => continue,
            _ => {}
        }

        code.push(instruction.opcode as u8);
        match &instruction.operand {
            Operand::None | Operand::Line { .. } => {}
            Operand::Immediate(value) => code.extend_from_slice(&value.to_le_bytes()),
            Operand::Number(id) | Operand::String(id) => code.extend_from_slice(&id.to_le_bytes()),
            Operand::Identifier { depth, slot } => {
                code.extend_from_slice(&depth.to_le_bytes());
                code.extend_from_slice(&slot.to_le_bytes());
            }
            Operand::Label(id) => code.extend_from_slice(&resolve(id)?.to_le_bytes()),
            Operand::Call { argc, splats } => {
                code.extend_from_slice(&argc.to_le_bytes());
                let splat_count = u8::try_from(splats.len())
                    .map_err(|_| AssemblerError::OperandMismatch(instruction.opcode.mnemonic()))?;
                code.push(splat_count);
                for splat in splats {
                    code.extend_from_slice(&splat.to_le_bytes());
                }
            }
            Operand::Table { start, labels } => {
                code.extend_from_slice(&start.to_le_bytes());
                code.extend_from_slice(&(labels.len() as i32).to_le_bytes());
                for label in labels {
                    code.extend_from_slice(&resolve(label)?.to_le_bytes());
                }
            }
        }
    }

    let debug = generate_debug_info.then(|| debug.finish());
    Ok(Program::with_debug(code, numbers, strings, debug))
}

fn offset_u32(offset: usize) -> Result<u32, AssemblerError> {
    u32::try_from(offset)
        .ok()
        .filter(|value| *value <= i32::MAX as u32)
        .ok_or(AssemblerError::ProgramTooLarge(offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_bind_to_following_instruction() {
        let instructions = vec![
            Instruction::with(OpCode::Jmp, Operand::Label(7)),
            Instruction::new(OpCode::LdNil),
            Instruction::with(OpCode::Label, Operand::Label(7)),
            Instruction::with(OpCode::Line, Operand::Line { file: 0, line: 3 }),
            Instruction::new(OpCode::LdTrue),
            Instruction::new(OpCode::Ret),
        ];
        let program = link(&instructions, Vec::new(), vec!["main".to_string()], true)
            .expect("link");
        assert_eq!(
            program.code,
            vec![
                OpCode::Jmp as u8,
                6,
                0,
                0,
                0,
                OpCode::LdNil as u8,
                OpCode::LdTrue as u8,
                OpCode::Ret as u8,
            ]
        );
        let debug = program.debug.expect("debug info");
        assert_eq!(debug.line_for_offset(6).map(|entry| entry.line), Some(3));
    }

    #[test]
    fn unbound_and_duplicate_labels_are_rejected() {
        let unbound = [Instruction::with(OpCode::Jmp, Operand::Label(1))];
        assert_eq!(
            link(&unbound, Vec::new(), Vec::new(), false),
            Err(AssemblerError::UnboundLabel(1))
        );
        let duplicate = [
            Instruction::with(OpCode::Label, Operand::Label(2)),
            Instruction::with(OpCode::Label, Operand::Label(2)),
        ];
        assert_eq!(
            link(&duplicate, Vec::new(), Vec::new(), false),
            Err(AssemblerError::DuplicateLabel(2))
        );
    }

    #[test]
    fn operand_kind_is_checked_against_opcode() {
        let bad = [Instruction::with(OpCode::LdNum, Operand::String(0))];
        assert_eq!(
            link(&bad, Vec::new(), Vec::new(), false),
            Err(AssemblerError::OperandMismatch("ldnum"))
        );
    }

    #[test]
    fn call_and_table_deltas_depend_on_counts() {
        let call = Instruction::with(
            OpCode::Call,
            Operand::Call {
                argc: 3,
                splats: vec![2],
            },
        );
        assert_eq!(call.stack_delta(), -3);
        assert_eq!(call.encoded_len(), 1 + 4 + 1 + 4);
        let tail = Instruction::with(
            OpCode::TailCall,
            Operand::Call {
                argc: 2,
                splats: Vec::new(),
            },
        );
        assert_eq!(tail.stack_delta(), -3);
        assert_eq!(
            Instruction::with(OpCode::NewObject, Operand::Immediate(2)).stack_delta(),
            -3
        );
        assert_eq!(
            Instruction::with(OpCode::NewArray, Operand::Immediate(0)).stack_delta(),
            1
        );
    }
}
