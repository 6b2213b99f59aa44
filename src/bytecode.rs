// File: src/bytecode.rs
//
// The linear bytecode stream executed by the VM: opcode tags interleaved
// with the inline operands they consume. Also hosts label fix-up, the JSON
// wire form, and a disassembler.

use crate::errors::VmError;
use crate::opcode::OpCode;
use crate::value::Value;
use ahash::AHashMap;

/// One slot in the bytecode stream.
///
/// `PUSH`, `JMP`, and `IF` are followed by exactly one `Value` slot; every
/// other slot holding a `Value` is either a label placeholder (executes as
/// `NOP`) or a malformed stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Op(OpCode),
    Value(Value),
}

impl From<OpCode> for Item {
    fn from(op: OpCode) -> Self {
        Item::Op(op)
    }
}

impl From<Value> for Item {
    fn from(value: Value) -> Self {
        Item::Value(value)
    }
}

/// Rewrites every `JMP` operand naming a label to the stream index where
/// that label sits. Label slots stay in place (the VM runs them as `NOP`)
/// so recorded addresses stay valid. Operands of a jump are skipped during
/// the definition scan, so a label name used only as a target is never
/// mistaken for a definition.
pub fn resolve_labels(stream: &mut [Item]) {
    let mut positions: AHashMap<String, usize> = AHashMap::new();

    let mut i = 0;
    while i < stream.len() {
        match &stream[i] {
            Item::Op(op) => i += 1 + op.operand_count(),
            Item::Value(Value::Label(name)) => {
                positions.insert(name.clone(), i);
                i += 1;
            }
            Item::Value(_) => i += 1,
        }
    }

    let mut i = 0;
    while i < stream.len() {
        let advance = match &stream[i] {
            Item::Op(op) => 1 + op.operand_count(),
            Item::Value(_) => 1,
        };
        if matches!(stream[i], Item::Op(OpCode::Jmp)) {
            let target = match stream.get(i + 1) {
                Some(Item::Value(Value::Label(name))) => positions.get(name.as_str()).copied(),
                _ => None,
            };
            if let Some(target) = target {
                stream[i + 1] = Item::Value(Value::Int(target as i64));
            }
        }
        i += advance;
    }
}

/// Encodes a stream into the wire form: opcodes become their integer tags,
/// operands follow as plain JSON values.
pub fn to_wire(stream: &[Item]) -> Vec<serde_json::Value> {
    stream
        .iter()
        .map(|item| match item {
            Item::Op(op) => serde_json::Value::from(op.as_byte()),
            Item::Value(value) => value.to_json(),
        })
        .collect()
}

/// Decodes the wire form back into a stream. Decoding is positional: after
/// an opcode tag, as many slots as it consumes are read back as operands.
pub fn from_wire(items: &[serde_json::Value]) -> Result<Vec<Item>, VmError> {
    let mut stream = Vec::with_capacity(items.len());
    let mut i = 0;
    while i < items.len() {
        let tag = items[i]
            .as_u64()
            .and_then(|n| u8::try_from(n).ok())
            .ok_or_else(|| VmError::invalid_opcode(format!("invalid opcode tag: {}", items[i])))?;
        let op = OpCode::from_byte(tag)
            .ok_or_else(|| VmError::invalid_opcode(format!("invalid opcode tag: {tag:#04x}")))?;
        stream.push(Item::Op(op));
        i += 1;
        for _ in 0..op.operand_count() {
            let operand = items.get(i).ok_or_else(|| {
                VmError::index_error(format!("stream ended inside a {} operand", op.mnemonic()))
            })?;
            stream.push(Item::Value(Value::from_json(operand)?));
            i += 1;
        }
    }
    Ok(stream)
}

/// Human-readable listing of a stream, one instruction per line.
pub fn disassemble(stream: &[Item]) -> String {
    let mut out = String::new();
    let mut i = 0;
    while i < stream.len() {
        match &stream[i] {
            Item::Op(op) => {
                out.push_str(&format!("{i:04}  {}", op.mnemonic()));
                for k in 0..op.operand_count() {
                    match stream.get(i + 1 + k) {
                        Some(Item::Value(value)) => out.push_str(&format!(" {value}")),
                        Some(Item::Op(next)) => out.push_str(&format!(" <{}>", next.mnemonic())),
                        None => out.push_str(" <truncated>"),
                    }
                }
                out.push('\n');
                i += 1 + op.operand_count();
            }
            Item::Value(Value::Label(name)) => {
                out.push_str(&format!("{i:04}  {name}:\n"));
                i += 1;
            }
            Item::Value(value) => {
                out.push_str(&format!("{i:04}  .value {value}\n"));
                i += 1;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(o: OpCode) -> Item {
        Item::Op(o)
    }

    fn val(v: Value) -> Item {
        Item::Value(v)
    }

    #[test]
    fn test_resolve_labels_rewrites_jump_operands() {
        // 0: JMP LABEL_1   2: NOP   3: LABEL_1
        let mut stream = vec![
            op(OpCode::Jmp),
            val(Value::Label("LABEL_1".into())),
            op(OpCode::Nop),
            val(Value::Label("LABEL_1".into())),
        ];
        resolve_labels(&mut stream);

        assert_eq!(stream[1], val(Value::Int(3)));
        // The definition slot stays in the stream as a placeholder.
        assert_eq!(stream[3], val(Value::Label("LABEL_1".into())));
    }

    #[test]
    fn test_resolve_labels_ignores_push_operands() {
        // A pushed string must never be treated as a label definition.
        let mut stream = vec![
            op(OpCode::Push),
            val(Value::str("LABEL_1")),
            op(OpCode::Jmp),
            val(Value::Label("LABEL_1".into())),
        ];
        resolve_labels(&mut stream);
        assert_eq!(stream[3], val(Value::Label("LABEL_1".into())));
    }

    #[test]
    fn test_unknown_label_operand_is_left_alone() {
        let mut stream = vec![op(OpCode::Jmp), val(Value::Label("LABEL_9".into()))];
        resolve_labels(&mut stream);
        assert_eq!(stream[1], val(Value::Label("LABEL_9".into())));
    }

    #[test]
    fn test_wire_round_trip() {
        let stream = vec![
            op(OpCode::Push),
            val(Value::Int(10)),
            op(OpCode::Push),
            val(Value::str("xs")),
            op(OpCode::Add),
            op(OpCode::Halt),
        ];
        let decoded = from_wire(&to_wire(&stream)).expect("decodes");
        assert_eq!(decoded, stream);
    }

    #[test]
    fn test_from_wire_rejects_unknown_tags() {
        let wire = vec![serde_json::Value::from(0x10u8)];
        let err = from_wire(&wire).expect_err("0x10 is unassigned");
        assert_eq!(err.kind, crate::errors::ErrorKind::InvalidOpcode);
    }

    #[test]
    fn test_from_wire_rejects_truncated_operand() {
        let wire = vec![serde_json::Value::from(OpCode::Push.as_byte())];
        assert!(from_wire(&wire).is_err());
    }

    #[test]
    fn test_disassemble_shows_operands() {
        let stream = vec![op(OpCode::Push), val(Value::Int(41)), op(OpCode::Halt)];
        let listing = disassemble(&stream);
        assert!(listing.contains("PUSH 41"));
        assert!(listing.contains("HALT"));
    }
}
