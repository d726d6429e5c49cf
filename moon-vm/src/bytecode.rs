/// Instruction set shared by the assembler, the wire format and the interpreter.
///
/// The byte value of each opcode is its position in this list. `Function`, `Line`
/// and `Label` are markers that occupy no bytes in the encoded program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Function = 0x00,
    Line = 0x01,
    Label = 0x02,
    Dup = 0x03,
    Drop = 0x04,
    Swap = 0x05,
    LdNil = 0x06,
    LdTrue = 0x07,
    LdFalse = 0x08,
    LdNum = 0x09,
    LdStr = 0x0A,
    LdGlobal = 0x0B,
    LdLocF = 0x0C,
    StLocF = 0x0D,
    LdLoc = 0x0E,
    StLoc = 0x0F,
    LdFld = 0x10,
    StFld = 0x11,
    LdArr = 0x12,
    StArr = 0x13,
    NewObject = 0x14,
    NewArray = 0x15,
    Concat = 0x16,
    Add = 0x17,
    Sub = 0x18,
    Mul = 0x19,
    Div = 0x1A,
    Mod = 0x1B,
    Exp = 0x1C,
    Neg = 0x1D,
    Eq = 0x1E,
    Neq = 0x1F,
    Gt = 0x20,
    Gte = 0x21,
    Lt = 0x22,
    Lte = 0x23,
    Not = 0x24,
    Closure = 0x25,
    Call = 0x26,
    TailCall = 0x27,
    Enter = 0x28,
    Ret = 0x29,
    VarArgs = 0x2A,
    Jmp = 0x2B,
    JmpTrueP = 0x2C,
    JmpFalseP = 0x2D,
    JmpTrue = 0x2E,
    JmpFalse = 0x2F,
    JmpTable = 0x30,
}

/// Shape of the operand bytes that follow an opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperandLayout {
    None,
    Immediate,
    Number,
    String,
    Identifier,
    Label,
    /// `argc i32, splat_count u8, splat_count x i32`
    Call,
    /// `start i32, count i32, count x label`
    Table,
}

const ALL: [OpCode; 49] = [
    OpCode::Function,
    OpCode::Line,
    OpCode::Label,
    OpCode::Dup,
    OpCode::Drop,
    OpCode::Swap,
    OpCode::LdNil,
    OpCode::LdTrue,
    OpCode::LdFalse,
    OpCode::LdNum,
    OpCode::LdStr,
    OpCode::LdGlobal,
    OpCode::LdLocF,
    OpCode::StLocF,
    OpCode::LdLoc,
    OpCode::StLoc,
    OpCode::LdFld,
    OpCode::StFld,
    OpCode::LdArr,
    OpCode::StArr,
    OpCode::NewObject,
    OpCode::NewArray,
    OpCode::Concat,
    OpCode::Add,
    OpCode::Sub,
    OpCode::Mul,
    OpCode::Div,
    OpCode::Mod,
    OpCode::Exp,
    OpCode::Neg,
    OpCode::Eq,
    OpCode::Neq,
    OpCode::Gt,
    OpCode::Gte,
    OpCode::Lt,
    OpCode::Lte,
    OpCode::Not,
    OpCode::Closure,
    OpCode::Call,
    OpCode::TailCall,
    OpCode::Enter,
    OpCode::Ret,
    OpCode::VarArgs,
    OpCode::Jmp,
    OpCode::JmpTrueP,
    OpCode::JmpFalseP,
    OpCode::JmpTrue,
    OpCode::JmpFalse,
    OpCode::JmpTable,
];

impl OpCode {
    pub fn from_u8(byte: u8) -> Option<Self> {
        ALL.get(byte as usize).copied()
    }

    /// Markers only feed debug info and label binding.
    pub fn is_marker(self) -> bool {
        matches!(self, OpCode::Function | OpCode::Line | OpCode::Label)
    }

    pub fn layout(self) -> OperandLayout {
        match self {
            OpCode::Function | OpCode::Line | OpCode::Label => OperandLayout::None,
            OpCode::LdNum => OperandLayout::Number,
            OpCode::LdStr | OpCode::LdFld | OpCode::StFld => OperandLayout::String,
            OpCode::LdLocF
            | OpCode::StLocF
            | OpCode::NewObject
            | OpCode::NewArray
            | OpCode::Enter
            | OpCode::VarArgs => OperandLayout::Immediate,
            OpCode::LdLoc | OpCode::StLoc => OperandLayout::Identifier,
            OpCode::Closure
            | OpCode::Jmp
            | OpCode::JmpTrueP
            | OpCode::JmpFalseP
            | OpCode::JmpTrue
            | OpCode::JmpFalse => OperandLayout::Label,
            OpCode::Call | OpCode::TailCall => OperandLayout::Call,
            OpCode::JmpTable => OperandLayout::Table,
            _ => OperandLayout::None,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            OpCode::Function => "function",
            OpCode::Line => "line",
            OpCode::Label => "label",
            OpCode::Dup => "dup",
            OpCode::Drop => "drop",
            OpCode::Swap => "swap",
            OpCode::LdNil => "ldnil",
            OpCode::LdTrue => "ldtrue",
            OpCode::LdFalse => "ldfalse",
            OpCode::LdNum => "ldnum",
            OpCode::LdStr => "ldstr",
            OpCode::LdGlobal => "ldglobal",
            OpCode::LdLocF => "ldlocf",
            OpCode::StLocF => "stlocf",
            OpCode::LdLoc => "ldloc",
            OpCode::StLoc => "stloc",
            OpCode::LdFld => "ldfld",
            OpCode::StFld => "stfld",
            OpCode::LdArr => "ldarr",
            OpCode::StArr => "starr",
            OpCode::NewObject => "newobject",
            OpCode::NewArray => "newarray",
            OpCode::Concat => "concat",
            OpCode::Add => "add",
            OpCode::Sub => "sub",
            OpCode::Mul => "mul",
            OpCode::Div => "div",
            OpCode::Mod => "mod",
            OpCode::Exp => "exp",
            OpCode::Neg => "neg",
            OpCode::Eq => "eq",
            OpCode::Neq => "neq",
            OpCode::Gt => "gt",
            OpCode::Gte => "gte",
            OpCode::Lt => "lt",
            OpCode::Lte => "lte",
            OpCode::Not => "not",
            OpCode::Closure => "closure",
            OpCode::Call => "call",
            OpCode::TailCall => "tailcall",
            OpCode::Enter => "enter",
            OpCode::Ret => "ret",
            OpCode::VarArgs => "varargs",
            OpCode::Jmp => "jmp",
            OpCode::JmpTrueP => "jmptruep",
            OpCode::JmpFalseP => "jmpfalsep",
            OpCode::JmpTrue => "jmptrue",
            OpCode::JmpFalse => "jmpfalse",
            OpCode::JmpTable => "jmptable",
        }
    }

    pub fn parse_mnemonic(op: &str) -> Option<Self> {
        ALL.iter().copied().find(|opcode| opcode.mnemonic() == op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_value_matches_position() {
        for (index, opcode) in ALL.iter().enumerate() {
            assert_eq!(*opcode as u8 as usize, index);
            assert_eq!(OpCode::from_u8(index as u8), Some(*opcode));
        }
        assert_eq!(OpCode::from_u8(ALL.len() as u8), None);
    }

    #[test]
    fn mnemonics_round_trip() {
        for opcode in ALL {
            assert_eq!(OpCode::parse_mnemonic(opcode.mnemonic()), Some(opcode));
        }
    }
}
