// File: src/assembler.rs
//
// Parser for the textual instruction-list form: an ordered sequence of
// `[NAME]` or `[NAME, operand]` pairs, usually arriving as JSON, e.g.
// `[["PUSH", 1], ["PUSH", 2], ["ADD"], ["HALT"]]`.

use crate::bytecode::Item;
use crate::errors::VmError;
use crate::opcode::OpCode;
use crate::value::Value;

/// One textual instruction: a case-sensitive mnemonic plus an optional
/// operand. Only `PUSH` consumes the operand; on any other instruction it
/// is ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub mnemonic: String,
    pub operand: Option<Value>,
}

impl Instruction {
    pub fn new(mnemonic: impl Into<String>) -> Self {
        Self { mnemonic: mnemonic.into(), operand: None }
    }

    pub fn with_operand(mnemonic: impl Into<String>, operand: Value) -> Self {
        Self { mnemonic: mnemonic.into(), operand: Some(operand) }
    }
}

/// Lowers instructions into the linear bytecode stream.
pub fn assemble(instructions: &[Instruction]) -> Result<Vec<Item>, VmError> {
    let mut bytecode = Vec::new();
    for instruction in instructions {
        let op = OpCode::from_mnemonic(&instruction.mnemonic).ok_or_else(|| {
            VmError::invalid_opcode(format!("invalid opcode: {}", instruction.mnemonic))
        })?;
        bytecode.push(Item::Op(op));
        if op == OpCode::Push {
            let operand = instruction
                .operand
                .clone()
                .ok_or_else(|| VmError::invalid_opcode("PUSH requires an operand"))?;
            bytecode.push(Item::Value(operand));
        }
    }
    Ok(bytecode)
}

/// Parses a JSON instruction list and lowers it in one step.
pub fn parse_json(source: &str) -> Result<Vec<Item>, VmError> {
    let raw: serde_json::Value = serde_json::from_str(source)
        .map_err(|e| VmError::syntax(format!("instruction list is not valid JSON: {e}")))?;
    let rows = raw
        .as_array()
        .ok_or_else(|| VmError::syntax("instruction list must be a JSON array"))?;

    let mut instructions = Vec::with_capacity(rows.len());
    for row in rows {
        let cells = row
            .as_array()
            .ok_or_else(|| VmError::syntax(format!("each instruction must be an array: {row}")))?;
        let mnemonic = cells
            .first()
            .and_then(|cell| cell.as_str())
            .ok_or_else(|| VmError::syntax(format!("each instruction needs a mnemonic: {row}")))?;
        let operand = match cells.get(1) {
            Some(cell) => Some(Value::from_json(cell)?),
            None => None,
        };
        instructions.push(Instruction { mnemonic: mnemonic.to_string(), operand });
    }
    assemble(&instructions)
}
