use std::collections::{BTreeMap, HashSet};
use std::fmt::Write;

use crate::bytecode::{OpCode, OperandLayout};
use crate::debug_info::{DebugInfo, FunctionEntry, LineEntry};
use crate::program::Program;

pub const MAGIC: u32 = 0xFA57_C0DE;
pub const VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("invalid magic: {0:#010X}")]
    InvalidMagic(u32),
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),
    #[error("invalid debug flag: {0}")]
    InvalidDebugFlag(u8),
    #[error("invalid utf-8 string")]
    InvalidUtf8,
    #[error("{0} length too large: {1}")]
    LengthTooLarge(&'static str, usize),
    #[error("trailing bytes after program payload")]
    TrailingBytes,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("truncated operand at offset {offset} for opcode {opcode:#04x}")]
    TruncatedOperand { offset: usize, opcode: u8 },
    #[error("invalid opcode {opcode:#04x} at offset {offset}")]
    InvalidOpcode { offset: usize, opcode: u8 },
    #[error("marker opcode {opcode:#04x} encoded at offset {offset}")]
    EncodedMarker { offset: usize, opcode: u8 },
    #[error("invalid {pool} constant {index} at offset {offset}")]
    InvalidConstant {
        offset: usize,
        pool: &'static str,
        index: u32,
    },
    #[error("invalid jump target {target} referenced by instruction at offset {offset}")]
    InvalidJumpTarget { offset: usize, target: i32 },
    #[error("negative operand {value} at offset {offset}")]
    NegativeOperand { offset: usize, value: i32 },
}

pub fn encode_program(program: &Program) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC.to_le_bytes());
    out.push(VERSION);
    out.push(u8::from(program.debug.is_some()));

    write_u32_count("strings", program.strings.len(), &mut out)?;
    for value in &program.strings {
        write_string("string constant", value, &mut out)?;
    }

    write_u32_count("numbers", program.numbers.len(), &mut out)?;
    for value in &program.numbers {
        out.extend_from_slice(&value.to_le_bytes());
    }

    write_u32_len("code", program.code.len(), &mut out)?;
    out.extend_from_slice(&program.code);

    if let Some(debug) = &program.debug {
        write_debug_info(debug, &mut out)?;
    }

    Ok(out)
}

pub fn decode_program(bytes: &[u8]) -> Result<Program, WireError> {
    let mut cursor = Cursor::new(bytes);

    let magic = cursor.read_u32()?;
    if magic != MAGIC {
        return Err(WireError::InvalidMagic(magic));
    }

    let version = cursor.read_u8()?;
    if version != VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }

    let has_debug = match cursor.read_u8()? {
        0 => false,
        1 => true,
        other => return Err(WireError::InvalidDebugFlag(other)),
    };

    let string_count = cursor.read_u32()? as usize;
    let mut strings = Vec::with_capacity(string_count.min(bytes.len()));
    for _ in 0..string_count {
        strings.push(cursor.read_string()?);
    }

    let number_count = cursor.read_u32()? as usize;
    let mut numbers = Vec::with_capacity(number_count.min(bytes.len()));
    for _ in 0..number_count {
        numbers.push(cursor.read_f64()?);
    }

    let code_len = cursor.read_u32()? as usize;
    let code = cursor.read_exact(code_len)?.to_vec();

    let debug = if has_debug {
        Some(read_debug_info(&mut cursor)?)
    } else {
        None
    };

    if !cursor.is_eof() {
        return Err(WireError::TrailingBytes);
    }

    Ok(Program::with_debug(code, numbers, strings, debug))
}

/// Checks opcodes, operand lengths, constant ids and jump targets.
pub fn validate_program(program: &Program) -> Result<(), ValidationError> {
    let code = &program.code;
    let mut ip = 0usize;
    let mut instruction_starts = HashSet::new();
    let mut jump_targets: Vec<(usize, i32)> = Vec::new();

    while ip < code.len() {
        let start = ip;
        instruction_starts.insert(start);
        let instruction = decode_instruction(code, &mut ip)?;
        match instruction.operands {
            DecodedOperands::Number(index) if index as usize >= program.numbers.len() => {
                return Err(ValidationError::InvalidConstant {
                    offset: start,
                    pool: "number",
                    index,
                });
            }
            DecodedOperands::String(index) if index as usize >= program.strings.len() => {
                return Err(ValidationError::InvalidConstant {
                    offset: start,
                    pool: "string",
                    index,
                });
            }
            DecodedOperands::Immediate(value) if value < 0 => {
                return Err(ValidationError::NegativeOperand {
                    offset: start,
                    value,
                });
            }
            DecodedOperands::Label(target) => jump_targets.push((start, target)),
            DecodedOperands::Table { count, labels, .. } => {
                if count < 0 {
                    return Err(ValidationError::NegativeOperand {
                        offset: start,
                        value: count,
                    });
                }
                jump_targets.extend(labels.into_iter().map(|target| (start, target)));
            }
            _ => {}
        }
    }

    for (offset, target) in jump_targets {
        let valid = usize::try_from(target)
            .map(|target| target < code.len() && instruction_starts.contains(&target))
            .unwrap_or(false);
        if !valid {
            return Err(ValidationError::InvalidJumpTarget { offset, target });
        }
    }

    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DecodedOperands {
    None,
    Immediate(i32),
    Number(u32),
    String(u32),
    Identifier { depth: i32, slot: i32 },
    Label(i32),
    Call { argc: i32, splats: Vec<i32> },
    Table {
        start: i32,
        count: i32,
        labels: Vec<i32>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DecodedInstruction {
    pub opcode: OpCode,
    pub operands: DecodedOperands,
}

pub(crate) fn decode_instruction(
    code: &[u8],
    ip: &mut usize,
) -> Result<DecodedInstruction, ValidationError> {
    let offset = *ip;
    let byte = read_u8(code, ip).ok_or(ValidationError::TruncatedOperand { offset, opcode: 0 })?;
    let opcode = OpCode::from_u8(byte).ok_or(ValidationError::InvalidOpcode {
        offset,
        opcode: byte,
    })?;
    if opcode.is_marker() {
        return Err(ValidationError::EncodedMarker {
            offset,
            opcode: byte,
        });
    }
    let truncated = ValidationError::TruncatedOperand {
        offset,
        opcode: byte,
    };
    let operands = match opcode.layout() {
        OperandLayout::None => DecodedOperands::None,
        OperandLayout::Immediate => {
            DecodedOperands::Immediate(read_i32(code, ip).ok_or(truncated)?)
        }
        OperandLayout::Number => DecodedOperands::Number(read_u32(code, ip).ok_or(truncated)?),
        OperandLayout::String => DecodedOperands::String(read_u32(code, ip).ok_or(truncated)?),
        OperandLayout::Identifier => {
            let depth = read_i32(code, ip).ok_or(truncated.clone())?;
            let slot = read_i32(code, ip).ok_or(truncated)?;
            DecodedOperands::Identifier { depth, slot }
        }
        OperandLayout::Label => DecodedOperands::Label(read_i32(code, ip).ok_or(truncated)?),
        OperandLayout::Call => {
            let argc = read_i32(code, ip).ok_or(truncated.clone())?;
            let splat_count = read_u8(code, ip).ok_or(truncated.clone())?;
            let mut splats = Vec::with_capacity(splat_count as usize);
            for _ in 0..splat_count {
                splats.push(read_i32(code, ip).ok_or(truncated.clone())?);
            }
            DecodedOperands::Call { argc, splats }
        }
        OperandLayout::Table => {
            let start = read_i32(code, ip).ok_or(truncated.clone())?;
            let count = read_i32(code, ip).ok_or(truncated.clone())?;
            let mut labels = Vec::new();
            for _ in 0..count.max(0) {
                labels.push(read_i32(code, ip).ok_or(truncated.clone())?);
            }
            DecodedOperands::Table {
                start,
                count,
                labels,
            }
        }
    };
    Ok(DecodedInstruction { opcode, operands })
}

pub fn disassemble_bytes(bytes: &[u8]) -> Result<String, WireError> {
    let program = decode_program(bytes)?;
    Ok(disassemble_program(&program))
}

pub fn disassemble_program(program: &Program) -> String {
    let mut out = String::new();
    let _ = writeln!(&mut out, "strings ({}):", program.strings.len());
    for (index, value) in program.strings.iter().enumerate() {
        let _ = writeln!(&mut out, "  [{index:04}] {value:?}");
    }
    let _ = writeln!(&mut out, "numbers ({}):", program.numbers.len());
    for (index, value) in program.numbers.iter().enumerate() {
        let _ = writeln!(&mut out, "  [{index:04}] {value}");
    }
    let _ = writeln!(&mut out, "code ({} bytes):", program.code.len());

    let mut annotations = debug_annotations(program);
    let code = &program.code;
    let mut ip = 0usize;
    while ip < code.len() {
        let start = ip;
        if let Some(notes) = annotations.remove(&start) {
            for note in notes {
                let _ = writeln!(&mut out, "      ; {note}");
            }
        }
        let text = match decode_instruction(code, &mut ip) {
            Ok(instruction) => format_instruction(program, &instruction),
            Err(err) => {
                let _ = writeln!(&mut out, "{start:04}\t.byte 0x{:02X} ; {err}", code[start]);
                break;
            }
        };
        let encoded = format_hex_bytes(&code[start..ip]);
        let _ = writeln!(&mut out, "{start:04}\t{encoded:<14}\t{text}");
    }

    out
}

fn format_instruction(program: &Program, instruction: &DecodedInstruction) -> String {
    let mnemonic = instruction.opcode.mnemonic();
    match &instruction.operands {
        DecodedOperands::None => mnemonic.to_string(),
        DecodedOperands::Immediate(value) => format!("{mnemonic} {value}"),
        DecodedOperands::Number(index) => match program.number(*index) {
            Some(value) => format!("{mnemonic} {index} ; {value}"),
            None => format!("{mnemonic} {index} ; <invalid>"),
        },
        DecodedOperands::String(index) => match program.string(*index) {
            Some(value) => format!("{mnemonic} {index} ; {value:?}"),
            None => format!("{mnemonic} {index} ; <invalid>"),
        },
        DecodedOperands::Identifier { depth, slot } => {
            if *depth < 0 {
                format!("{mnemonic} {depth} {slot} ; arg frame {} slot {slot}", -depth)
            } else {
                format!("{mnemonic} {depth} {slot} ; local frame {depth} slot {slot}")
            }
        }
        DecodedOperands::Label(target) => format!("{mnemonic} {target:04}"),
        DecodedOperands::Call { argc, splats } => {
            if splats.is_empty() {
                format!("{mnemonic} {argc}")
            } else {
                let splats = splats
                    .iter()
                    .map(|index| index.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                format!("{mnemonic} {argc} ; splat {splats}")
            }
        }
        DecodedOperands::Table {
            start,
            count,
            labels,
        } => {
            let labels = labels
                .iter()
                .map(|target| format!("{target:04}"))
                .collect::<Vec<_>>()
                .join(" ");
            format!("{mnemonic} {start} {count} [{labels}]")
        }
    }
}

fn debug_annotations(program: &Program) -> BTreeMap<usize, Vec<String>> {
    let mut annotations = BTreeMap::<usize, Vec<String>>::new();
    let Some(debug) = program.debug.as_ref() else {
        return annotations;
    };
    for function in &debug.functions {
        let name = program.string(function.name).unwrap_or("<invalid>");
        annotations
            .entry(function.offset as usize)
            .or_default()
            .push(format!("function {name}"));
    }
    for line in &debug.lines {
        let file = program.string(line.file).unwrap_or("<invalid>");
        annotations
            .entry(line.offset as usize)
            .or_default()
            .push(format!("{file}:{}", line.line));
    }
    annotations
}

fn write_debug_info(debug: &DebugInfo, out: &mut Vec<u8>) -> Result<(), WireError> {
    write_u32_count("debug functions", debug.functions.len(), out)?;
    for function in &debug.functions {
        out.extend_from_slice(&function.offset.to_le_bytes());
        out.extend_from_slice(&function.name.to_le_bytes());
    }

    write_u32_count("debug lines", debug.lines.len(), out)?;
    for line in &debug.lines {
        out.extend_from_slice(&line.offset.to_le_bytes());
        out.extend_from_slice(&line.file.to_le_bytes());
        out.extend_from_slice(&line.line.to_le_bytes());
    }
    Ok(())
}

fn read_debug_info(cursor: &mut Cursor<'_>) -> Result<DebugInfo, WireError> {
    let function_count = cursor.read_u32()? as usize;
    let mut functions = Vec::with_capacity(function_count.min(cursor.remaining()));
    for _ in 0..function_count {
        functions.push(FunctionEntry {
            offset: cursor.read_u32()?,
            name: cursor.read_u32()?,
        });
    }

    let line_count = cursor.read_u32()? as usize;
    let mut lines = Vec::with_capacity(line_count.min(cursor.remaining()));
    for _ in 0..line_count {
        lines.push(LineEntry {
            offset: cursor.read_u32()?,
            file: cursor.read_u32()?,
            line: cursor.read_u32()?,
        });
    }

    Ok(DebugInfo { functions, lines })
}

fn write_string(field: &'static str, value: &str, out: &mut Vec<u8>) -> Result<(), WireError> {
    write_u32_len(field, value.len(), out)?;
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

fn write_u32_len(field: &'static str, len: usize, out: &mut Vec<u8>) -> Result<(), WireError> {
    let len_u32 = u32::try_from(len).map_err(|_| WireError::LengthTooLarge(field, len))?;
    out.extend_from_slice(&len_u32.to_le_bytes());
    Ok(())
}

fn write_u32_count(field: &'static str, count: usize, out: &mut Vec<u8>) -> Result<(), WireError> {
    write_u32_len(field, count, out)
}

struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn read_u8(&mut self) -> Result<u8, WireError> {
        let value = self
            .bytes
            .get(self.offset)
            .ok_or(WireError::UnexpectedEof)?;
        self.offset += 1;
        Ok(*value)
    }

    fn read_u32(&mut self) -> Result<u32, WireError> {
        let bytes = self.read_exact_array::<4>()?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn read_f64(&mut self) -> Result<f64, WireError> {
        let bytes = self.read_exact_array::<8>()?;
        Ok(f64::from_le_bytes(bytes))
    }

    fn read_string(&mut self) -> Result<String, WireError> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_exact(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }

    fn read_exact_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let bytes = self.read_exact(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn read_exact(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        let end = self
            .offset
            .checked_add(len)
            .ok_or(WireError::UnexpectedEof)?;
        if end > self.bytes.len() {
            return Err(WireError::UnexpectedEof);
        }
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    fn is_eof(&self) -> bool {
        self.offset == self.bytes.len()
    }
}

fn read_u8(code: &[u8], ip: &mut usize) -> Option<u8> {
    let value = *code.get(*ip)?;
    *ip += 1;
    Some(value)
}

fn read_u32(code: &[u8], ip: &mut usize) -> Option<u32> {
    let bytes = code.get(*ip..(*ip + 4))?;
    *ip += 4;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_i32(code: &[u8], ip: &mut usize) -> Option<i32> {
    read_u32(code, ip).map(|value| value as i32)
}

fn format_hex_bytes(bytes: &[u8]) -> String {
    let mut out = String::new();
    for (idx, byte) in bytes.iter().enumerate() {
        if idx > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{byte:02X}"));
    }
    out
}
