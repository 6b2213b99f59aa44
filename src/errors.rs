// File: src/errors.rs
//
// Error handling for the SANVM runtime and the Pena toolchain.
// One structured error type with a kind tag and a pretty-printed message;
// the dispatch loop attaches the faulting program counter.

use colored::Colorize;
use std::fmt;

/// Categories of failure surfaced to callers of the VM, the contract
/// manager, and the two bytecode front ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The dispatcher met something that is not an executable opcode.
    UnknownOpcode,
    /// Division or modulo by zero.
    Arithmetic,
    /// An opcode was applied to a value of the wrong kind.
    Type,
    /// An unbound container variable or a missing dict key.
    Key,
    /// A list index out of range, or a truncated bytecode stream.
    Index,
    /// An invalid operand: bad loop bound, arity mismatch, bad jump target.
    Value,
    /// `CALL_FUNC` referenced a name with no registered function.
    UnknownFunction,
    /// A deploy collided with an existing contract id.
    ContractExists,
    /// A call referenced a contract id that was never deployed.
    UnknownContract,
    /// The instruction-list parser met an unknown mnemonic.
    InvalidOpcode,
    /// The Pena compiler rejected a source line.
    Syntax,
    /// The configured step budget ran out.
    StepLimit,
    /// The output sink failed.
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::UnknownOpcode => write!(f, "Unknown Opcode"),
            ErrorKind::Arithmetic => write!(f, "Arithmetic Error"),
            ErrorKind::Type => write!(f, "Type Error"),
            ErrorKind::Key => write!(f, "Key Error"),
            ErrorKind::Index => write!(f, "Index Error"),
            ErrorKind::Value => write!(f, "Value Error"),
            ErrorKind::UnknownFunction => write!(f, "Unknown Function"),
            ErrorKind::ContractExists => write!(f, "Contract Exists"),
            ErrorKind::UnknownContract => write!(f, "Unknown Contract"),
            ErrorKind::InvalidOpcode => write!(f, "Invalid Opcode"),
            ErrorKind::Syntax => write!(f, "Syntax Error"),
            ErrorKind::StepLimit => write!(f, "Step Limit Exceeded"),
            ErrorKind::Io => write!(f, "I/O Error"),
        }
    }
}

/// A structured runtime or compile error.
#[derive(Debug, Clone)]
pub struct VmError {
    pub kind: ErrorKind,
    pub message: String,
    /// Stream position of the faulting opcode, when the fault happened
    /// inside a running VM.
    pub pc: Option<usize>,
}

impl VmError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), pc: None }
    }

    /// Attaches the faulting pc; the innermost position wins.
    pub fn at(mut self, pc: usize) -> Self {
        if self.pc.is_none() {
            self.pc = Some(pc);
        }
        self
    }

    pub fn unknown_opcode(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnknownOpcode, message)
    }

    pub fn arithmetic(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Arithmetic, message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Type, message)
    }

    pub fn key_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Key, message)
    }

    pub fn index_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Index, message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Value, message)
    }

    pub fn unknown_function(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnknownFunction, message)
    }

    pub fn contract_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ContractExists, message)
    }

    pub fn unknown_contract(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnknownContract, message)
    }

    pub fn invalid_opcode(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidOpcode, message)
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Syntax, message)
    }

    pub fn step_limit(limit: u64) -> Self {
        Self::new(ErrorKind::StepLimit, format!("aborted after {limit} opcodes"))
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = format!("{}", self.kind);
        write!(f, "{}: {}", kind.red().bold(), self.message.bold())?;
        if let Some(pc) = self.pc {
            write!(f, "\n{}", format!("  --> pc {pc:04}").bright_blue())?;
        }
        Ok(())
    }
}

impl std::error::Error for VmError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at_keeps_innermost_pc() {
        let err = VmError::arithmetic("division by zero").at(7).at(99);
        assert_eq!(err.pc, Some(7));
    }

    #[test]
    fn test_display_carries_kind_and_message() {
        colored::control::set_override(false);
        let err = VmError::key_error("unknown list: xs").at(3);
        let rendered = err.to_string();
        assert!(rendered.contains("Key Error"));
        assert!(rendered.contains("unknown list: xs"));
        assert!(rendered.contains("pc 0003"));
    }
}
