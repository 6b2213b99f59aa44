// File: src/vm.rs
//
// The SANVM bytecode interpreter: a single-threaded fetch-decode-dispatch
// loop over a linear stream, with operand, call, and loop stacks bound to
// one exclusively-owned variable store.

use crate::bytecode::Item;
use crate::errors::VmError;
use crate::opcode::OpCode;
use crate::storage::Storage;
use crate::value::Value;
use std::cmp::Ordering;
use std::io::{self, Write};

/// A call-stack frame. `CALL` pushes the primitive form, `CALL_FUNC` the
/// function form; `RET` restores either.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Primitive { return_pc: usize },
    Function { return_pc: usize, params: Vec<Value> },
}

impl Frame {
    pub fn return_pc(&self) -> usize {
        match self {
            Frame::Primitive { return_pc } | Frame::Function { return_pc, .. } => *return_pc,
        }
    }

    /// The argument snapshot captured by `CALL_FUNC`, in declaration
    /// order. Primitive frames carry none.
    pub fn params(&self) -> Option<&[Value]> {
        match self {
            Frame::Primitive { .. } => None,
            Frame::Function { params, .. } => Some(params),
        }
    }
}

/// Bookkeeping for one active counted loop.
#[derive(Debug, Clone, PartialEq)]
struct LoopFrame {
    counter: String,
    iterations: i64,
    /// First body instruction; `CONTINUE_LOOP` jumps back here.
    start_pc: usize,
    /// First position after the closing `CONTINUE_LOOP`; `BREAK_LOOP`
    /// jumps here.
    end_pc: usize,
}

/// A virtual machine instance. Created per run, discarded afterwards; the
/// storage survives through `into_storage`.
pub struct VM {
    stack: Vec<Value>,
    call_stack: Vec<Frame>,
    loop_stack: Vec<LoopFrame>,
    pc: usize,
    running: bool,
    steps: u64,
    step_limit: Option<u64>,
    bytecode: Vec<Item>,
    storage: Storage,
    output: Box<dyn Write>,
    trace: bool,
}

impl VM {
    pub fn new() -> Self {
        Self::with_storage(Storage::new())
    }

    pub fn with_storage(storage: Storage) -> Self {
        Self {
            stack: Vec::new(),
            call_stack: Vec::new(),
            loop_stack: Vec::new(),
            pc: 0,
            running: true,
            steps: 0,
            step_limit: None,
            bytecode: Vec::new(),
            storage,
            output: Box::new(io::stdout()),
            trace: std::env::var("SANVM_TRACE").is_ok(),
        }
    }

    /// Redirects `PRINT` away from stdout.
    pub fn set_output(&mut self, sink: Box<dyn Write>) {
        self.output = sink;
    }

    /// Caps the number of executed opcodes; `None` means unbounded.
    pub fn set_step_limit(&mut self, limit: Option<u64>) {
        self.step_limit = limit;
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut Storage {
        &mut self.storage
    }

    pub fn into_storage(self) -> Storage {
        self.storage
    }

    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    pub fn stack_top(&self) -> Option<&Value> {
        self.stack.last()
    }

    /// Runs one bytecode stream to completion. Execution stops when `HALT`
    /// runs, when the pc walks off the end of the stream, or with the first
    /// fault. A faulting error carries the pc of the opcode that raised it.
    pub fn run(&mut self, bytecode: Vec<Item>) -> Result<(), VmError> {
        self.bytecode = bytecode;
        self.pc = 0;
        self.running = true;

        while self.running && self.pc < self.bytecode.len() {
            if let Some(limit) = self.step_limit {
                if self.steps >= limit {
                    return Err(VmError::step_limit(limit).at(self.pc));
                }
            }
            self.steps += 1;

            let at = self.pc;
            let item = self.bytecode[self.pc].clone();
            self.pc += 1;

            if self.trace {
                eprintln!("sanvm: pc={at:04} item={item:?} stack={:?}", self.stack);
            }

            let result = match item {
                Item::Op(op) => self.dispatch(op),
                // A label that survived fix-up marks a stream address and
                // nothing else.
                Item::Value(Value::Label(_)) => Ok(()),
                Item::Value(value) => Err(VmError::unknown_opcode(format!(
                    "bare {} in instruction position",
                    value.type_name()
                ))),
            };
            result.map_err(|e| e.at(at))?;
        }
        Ok(())
    }

    fn dispatch(&mut self, op: OpCode) -> Result<(), VmError> {
        match op {
            OpCode::Push => self.op_push(),
            OpCode::Pop | OpCode::Drop => {
                self.stack.pop();
                Ok(())
            }
            OpCode::Dup => {
                // Duplicates the top element only, never a slice of the
                // stack.
                if let Some(top) = self.stack.last().cloned() {
                    self.stack.push(top);
                }
                Ok(())
            }
            OpCode::Swap => {
                let n = self.stack.len();
                if n >= 2 {
                    self.stack.swap(n - 1, n - 2);
                }
                Ok(())
            }
            OpCode::Over => {
                let n = self.stack.len();
                if n >= 2 {
                    self.stack.push(self.stack[n - 2].clone());
                }
                Ok(())
            }
            OpCode::Rot => {
                let n = self.stack.len();
                if n >= 3 {
                    let bottom = self.stack.remove(n - 3);
                    self.stack.push(bottom);
                }
                Ok(())
            }
            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod => {
                self.binary_arith(op)
            }
            OpCode::And | OpCode::Or | OpCode::Xor => self.binary_logic(op),
            OpCode::Eq | OpCode::Neq | OpCode::Lt | OpCode::Lte | OpCode::Gt | OpCode::Gte => {
                self.binary_compare(op)
            }
            OpCode::Print => self.op_print(),
            OpCode::Jmp => self.op_jmp(),
            OpCode::If => self.op_if(),
            OpCode::Call => self.op_call(),
            OpCode::Ret => {
                if let Some(frame) = self.call_stack.pop() {
                    self.pc = frame.return_pc();
                }
                Ok(())
            }
            OpCode::Nop => Ok(()),
            OpCode::Halt => {
                self.running = false;
                Ok(())
            }
            OpCode::Set => self.op_set(),
            OpCode::Get => self.op_get(),
            OpCode::Delete => self.op_delete(),
            OpCode::Has => self.op_has(),
            OpCode::ListAppend => self.op_list_append(),
            OpCode::ListRemove => self.op_list_remove(),
            OpCode::ListLen => self.op_list_len(),
            OpCode::ListGet => self.op_list_get(),
            OpCode::DictSet => self.op_dict_set(),
            OpCode::DictGet => self.op_dict_get(),
            OpCode::DictKeys => self.op_dict_keys(),
            OpCode::ForLoop => self.op_for_loop(),
            OpCode::BreakLoop => {
                if let Some(frame) = self.loop_stack.pop() {
                    self.pc = frame.end_pc;
                }
                Ok(())
            }
            OpCode::ContinueLoop => self.op_continue_loop(),
            OpCode::DefFunc => self.op_def_func(),
            OpCode::CallFunc => self.op_call_func(),
        }
    }

    /// Reads the inline operand at the current pc and advances past it.
    fn read_operand(&mut self, mnemonic: &str) -> Result<Value, VmError> {
        match self.bytecode.get(self.pc) {
            Some(Item::Value(value)) => {
                let value = value.clone();
                self.pc += 1;
                Ok(value)
            }
            Some(Item::Op(op)) => Err(VmError::value_error(format!(
                "{mnemonic} expected an inline operand, found opcode {}",
                op.mnemonic()
            ))),
            None => Err(VmError::index_error(format!(
                "bytecode ended while {mnemonic} was reading its operand"
            ))),
        }
    }

    fn pop_pair(&mut self) -> Option<(Value, Value)> {
        if self.stack.len() < 2 {
            return None;
        }
        let b = self.stack.pop()?;
        let a = self.stack.pop()?;
        Some((a, b))
    }

    fn pop_three(&mut self) -> Option<(Value, Value, Value)> {
        if self.stack.len() < 3 {
            return None;
        }
        let c = self.stack.pop()?;
        let b = self.stack.pop()?;
        let a = self.stack.pop()?;
        Some((a, b, c))
    }

    fn op_push(&mut self) -> Result<(), VmError> {
        let value = self.read_operand("PUSH")?;
        self.stack.push(value);
        Ok(())
    }

    fn binary_arith(&mut self, op: OpCode) -> Result<(), VmError> {
        let Some((a, b)) = self.pop_pair() else { return Ok(()) };
        let result = match (op, &a, &b) {
            (OpCode::Add, Value::Str(x), Value::Str(y)) => Value::Str(format!("{x}{y}")),
            (_, Value::Int(x), Value::Int(y)) => {
                let (x, y) = (*x, *y);
                match op {
                    OpCode::Add => Value::Int(x.wrapping_add(y)),
                    OpCode::Sub => Value::Int(x.wrapping_sub(y)),
                    OpCode::Mul => Value::Int(x.wrapping_mul(y)),
                    OpCode::Div => {
                        if y == 0 {
                            return Err(VmError::arithmetic("division by zero"));
                        }
                        Value::Int(floor_div(x, y))
                    }
                    OpCode::Mod => {
                        if y == 0 {
                            return Err(VmError::arithmetic("modulo by zero"));
                        }
                        Value::Int(floor_mod(x, y))
                    }
                    _ => unreachable!("non-arithmetic opcode in binary_arith"),
                }
            }
            _ => {
                return Err(VmError::type_error(format!(
                    "{} expects integers, got {} and {}",
                    op.mnemonic(),
                    a.type_name(),
                    b.type_name()
                )));
            }
        };
        self.stack.push(result);
        Ok(())
    }

    fn binary_logic(&mut self, op: OpCode) -> Result<(), VmError> {
        let Some((a, b)) = self.pop_pair() else { return Ok(()) };
        let (x, y) = (a.is_truthy(), b.is_truthy());
        let result = match op {
            OpCode::And => x && y,
            OpCode::Or => x || y,
            OpCode::Xor => x != y,
            _ => unreachable!("non-boolean opcode in binary_logic"),
        };
        self.stack.push(Value::Int(result as i64));
        Ok(())
    }

    fn binary_compare(&mut self, op: OpCode) -> Result<(), VmError> {
        let Some((a, b)) = self.pop_pair() else { return Ok(()) };
        let result = match op {
            OpCode::Eq => a == b,
            OpCode::Neq => a != b,
            _ => {
                let ordering = match (&a, &b) {
                    (Value::Int(x), Value::Int(y)) => x.cmp(y),
                    (Value::Str(x), Value::Str(y)) => x.cmp(y),
                    _ => {
                        return Err(VmError::type_error(format!(
                            "cannot order {} against {}",
                            a.type_name(),
                            b.type_name()
                        )));
                    }
                };
                match op {
                    OpCode::Lt => ordering == Ordering::Less,
                    OpCode::Lte => ordering != Ordering::Greater,
                    OpCode::Gt => ordering == Ordering::Greater,
                    OpCode::Gte => ordering != Ordering::Less,
                    _ => unreachable!("non-comparison opcode in binary_compare"),
                }
            }
        };
        self.stack.push(Value::Int(result as i64));
        Ok(())
    }

    /// Writes the top of the stack to the output sink without popping it.
    fn op_print(&mut self) -> Result<(), VmError> {
        if let Some(top) = self.stack.last() {
            writeln!(self.output, "{top}").map_err(|e| VmError::io(e.to_string()))?;
        }
        Ok(())
    }

    fn op_jmp(&mut self) -> Result<(), VmError> {
        // No operand left in the stream means nowhere to go; the run ends
        // at end of stream anyway.
        let Some(item) = self.bytecode.get(self.pc) else { return Ok(()) };
        match item {
            Item::Value(Value::Int(target)) => {
                if *target < 0 {
                    return Err(VmError::value_error(format!("negative jump target {target}")));
                }
                self.pc = *target as usize;
                Ok(())
            }
            Item::Value(other) => Err(VmError::type_error(format!(
                "jump target must be an integer, got {}",
                other.type_name()
            ))),
            Item::Op(op) => Err(VmError::value_error(format!(
                "JMP expected an inline target, found opcode {}",
                op.mnemonic()
            ))),
        }
    }

    fn op_if(&mut self) -> Result<(), VmError> {
        let condition = self.stack.pop();
        // The inline operand belongs to this opcode and is consumed even
        // when the stack was empty.
        let expected = self.read_operand("IF")?;
        let Some(condition) = condition else { return Ok(()) };
        if condition != expected {
            // Skip the next instruction wholesale, inline operand included.
            if let Some(Item::Op(next)) = self.bytecode.get(self.pc) {
                self.pc += 1 + next.operand_count();
            } else {
                self.pc += 1;
            }
        }
        Ok(())
    }

    fn op_call(&mut self) -> Result<(), VmError> {
        let Some(target) = self.stack.pop() else { return Ok(()) };
        let target = match target {
            Value::Int(t) if t >= 0 => t as usize,
            Value::Int(t) => {
                return Err(VmError::value_error(format!("negative call target {t}")));
            }
            other => {
                return Err(VmError::type_error(format!(
                    "call target must be an integer, got {}",
                    other.type_name()
                )));
            }
        };
        self.call_stack.push(Frame::Primitive { return_pc: self.pc });
        self.pc = target;
        Ok(())
    }

    fn op_set(&mut self) -> Result<(), VmError> {
        let Some((key, value)) = self.pop_pair() else { return Ok(()) };
        let key = expect_name(key, "SET")?;
        self.storage.set(key, value);
        Ok(())
    }

    fn op_get(&mut self) -> Result<(), VmError> {
        let Some(key) = self.stack.pop() else { return Ok(()) };
        let key = expect_name(key, "GET")?;
        let value = self.storage.get(&key);
        self.stack.push(value);
        Ok(())
    }

    fn op_delete(&mut self) -> Result<(), VmError> {
        let Some(key) = self.stack.pop() else { return Ok(()) };
        let key = expect_name(key, "DELETE")?;
        self.storage.delete(&key);
        Ok(())
    }

    fn op_has(&mut self) -> Result<(), VmError> {
        let Some(key) = self.stack.pop() else { return Ok(()) };
        let key = expect_name(key, "HAS")?;
        self.stack.push(Value::Int(self.storage.has(&key) as i64));
        Ok(())
    }

    fn op_list_append(&mut self) -> Result<(), VmError> {
        let Some((key, value)) = self.pop_pair() else { return Ok(()) };
        let key = expect_name(key, "LIST_APPEND")?;
        let mut items = self.bound_list(&key)?;
        items.push(value);
        self.storage.set(key, Value::List(items));
        Ok(())
    }

    fn op_list_remove(&mut self) -> Result<(), VmError> {
        let Some((key, value)) = self.pop_pair() else { return Ok(()) };
        let key = expect_name(key, "LIST_REMOVE")?;
        let mut items = self.bound_list(&key)?;
        // First occurrence only; absent values are ignored.
        if let Some(position) = items.iter().position(|item| item == &value) {
            items.remove(position);
        }
        self.storage.set(key, Value::List(items));
        Ok(())
    }

    fn op_list_len(&mut self) -> Result<(), VmError> {
        let Some(key) = self.stack.pop() else { return Ok(()) };
        let key = expect_name(key, "LIST_LEN")?;
        // Unbound names measure zero; a bound non-list is still a fault.
        if !self.storage.has(&key) {
            self.stack.push(Value::Int(0));
            return Ok(());
        }
        let items = self.bound_list(&key)?;
        self.stack.push(Value::Int(items.len() as i64));
        Ok(())
    }

    fn op_list_get(&mut self) -> Result<(), VmError> {
        let Some((key, index)) = self.pop_pair() else { return Ok(()) };
        let key = expect_name(key, "LIST_GET")?;
        let items = self.bound_list(&key)?;
        let index = match index {
            Value::Int(i) => i,
            other => {
                return Err(VmError::type_error(format!(
                    "list index must be an integer, got {}",
                    other.type_name()
                )));
            }
        };
        if index < 0 || index as usize >= items.len() {
            return Err(VmError::index_error(format!("{index} is an invalid index for {key}")));
        }
        self.stack.push(items[index as usize].clone());
        Ok(())
    }

    fn op_dict_set(&mut self) -> Result<(), VmError> {
        let Some((name, entry_key, value)) = self.pop_three() else { return Ok(()) };
        let name = expect_name(name, "DICT_SET")?;
        let entry_key = expect_name(entry_key, "DICT_SET")?;
        let mut map = self.bound_dict(&name)?;
        map.insert(entry_key, value);
        self.storage.set(name, Value::Dict(map));
        Ok(())
    }

    fn op_dict_get(&mut self) -> Result<(), VmError> {
        let Some((name, entry_key)) = self.pop_pair() else { return Ok(()) };
        let name = expect_name(name, "DICT_GET")?;
        let entry_key = expect_name(entry_key, "DICT_GET")?;
        let map = self.bound_dict(&name)?;
        let value = map
            .get(&entry_key)
            .cloned()
            .ok_or_else(|| VmError::key_error(format!("{entry_key} not found in {name}")))?;
        self.stack.push(value);
        Ok(())
    }

    fn op_dict_keys(&mut self) -> Result<(), VmError> {
        let Some(name) = self.stack.pop() else { return Ok(()) };
        let name = expect_name(name, "DICT_KEYS")?;
        let map = self.bound_dict(&name)?;
        let keys = map.keys().cloned().map(Value::Str).collect();
        self.stack.push(Value::List(keys));
        Ok(())
    }

    /// Fetches a variable that must be bound to a list.
    fn bound_list(&self, key: &str) -> Result<Vec<Value>, VmError> {
        if !self.storage.has(key) {
            return Err(VmError::key_error(format!("unknown list: {key}")));
        }
        match self.storage.get(key) {
            Value::List(items) => Ok(items),
            other => {
                Err(VmError::type_error(format!("{key} is bound to {}, not a list", other.type_name())))
            }
        }
    }

    /// Fetches a variable that must be bound to a dict.
    fn bound_dict(&self, key: &str) -> Result<std::collections::BTreeMap<String, Value>, VmError> {
        if !self.storage.has(key) {
            return Err(VmError::key_error(format!("unknown dict: {key}")));
        }
        match self.storage.get(key) {
            Value::Dict(map) => Ok(map),
            other => {
                Err(VmError::type_error(format!("{key} is bound to {}, not a dict", other.type_name())))
            }
        }
    }

    fn op_for_loop(&mut self) -> Result<(), VmError> {
        let Some((counter, iterations)) = self.pop_pair() else { return Ok(()) };
        let counter = expect_name(counter, "FOR_LOOP")?;
        let iterations = match iterations {
            Value::Int(n) if n > 0 => n,
            Value::Int(n) => {
                return Err(VmError::value_error(format!("loop count must be positive, got {n}")));
            }
            other => {
                return Err(VmError::value_error(format!(
                    "loop count must be an integer, got {}",
                    other.type_name()
                )));
            }
        };
        let start_pc = self.pc;
        let end_pc = self.find_loop_end(start_pc);
        self.loop_stack.push(LoopFrame {
            counter: counter.clone(),
            iterations,
            start_pc,
            end_pc,
        });
        self.storage.set(counter, Value::Int(0));
        Ok(())
    }

    /// Position after the `CONTINUE_LOOP` that closes the body starting at
    /// `start_pc`, accounting for nested counted loops. Falls back to end
    /// of stream when the body is unterminated.
    fn find_loop_end(&self, start_pc: usize) -> usize {
        let mut depth = 0usize;
        let mut i = start_pc;
        while i < self.bytecode.len() {
            match &self.bytecode[i] {
                Item::Op(OpCode::ForLoop) => {
                    depth += 1;
                    i += 1;
                }
                Item::Op(OpCode::ContinueLoop) => {
                    if depth == 0 {
                        return i + 1;
                    }
                    depth -= 1;
                    i += 1;
                }
                Item::Op(op) => i += 1 + op.operand_count(),
                Item::Value(_) => i += 1,
            }
        }
        self.bytecode.len()
    }

    fn op_continue_loop(&mut self) -> Result<(), VmError> {
        let Some(frame) = self.loop_stack.last() else { return Ok(()) };
        let counter = frame.counter.clone();
        let (iterations, start_pc) = (frame.iterations, frame.start_pc);

        let count = match self.storage.get(&counter) {
            Value::Int(n) => n,
            other => {
                return Err(VmError::type_error(format!(
                    "loop counter {counter} is bound to {}, not an integer",
                    other.type_name()
                )));
            }
        };
        if count + 1 >= iterations {
            self.loop_stack.pop();
            return Ok(());
        }
        self.storage.set(counter, Value::Int(count + 1));
        self.pc = start_pc;
        Ok(())
    }

    fn op_def_func(&mut self) -> Result<(), VmError> {
        if let Some((name, param_count)) = self.pop_pair() {
            let name = expect_name(name, "DEF_FUNC")?;
            let param_count = match param_count {
                Value::Int(n) if n >= 0 => n as usize,
                other => {
                    return Err(VmError::value_error(format!(
                        "parameter count must be a non-negative integer, got {other}"
                    )));
                }
            };
            self.storage.define_function(name, self.pc, param_count);
        }
        // The body is skipped at definition time; the scan runs even when
        // the stack was short of operands. The first RET terminates the
        // body, so nested function definitions are not supported.
        while self.pc < self.bytecode.len()
            && !matches!(self.bytecode[self.pc], Item::Op(OpCode::Ret))
        {
            self.pc += 1;
        }
        Ok(())
    }

    fn op_call_func(&mut self) -> Result<(), VmError> {
        let Some((param_count, name)) = self.pop_pair() else { return Ok(()) };
        let name = expect_name(name, "CALL_FUNC")?;
        let supplied = match param_count {
            Value::Int(n) if n >= 0 => n as usize,
            other => {
                return Err(VmError::value_error(format!(
                    "CALL_FUNC expects an argument count, got {other}"
                )));
            }
        };
        let info = self
            .storage
            .lookup_function(&name)
            .ok_or_else(|| VmError::unknown_function(format!("unknown function: {name}")))?;
        if info.param_count != supplied {
            return Err(VmError::value_error(format!(
                "{name} takes {} parameter(s), {supplied} supplied",
                info.param_count
            )));
        }
        if self.stack.len() < info.param_count {
            return Err(VmError::index_error(format!(
                "{name} called with {} value(s) on the stack, needs {}",
                self.stack.len(),
                info.param_count
            )));
        }
        // Snapshot the arguments into the frame, first argument first, and
        // leave them on the stack for the callee's binding prologue.
        let params: Vec<Value> = self.stack[self.stack.len() - info.param_count..]
            .iter()
            .rev()
            .cloned()
            .collect();
        self.call_stack.push(Frame::Function { return_pc: self.pc, params });
        self.pc = info.entry_pc;
        Ok(())
    }
}

impl Default for VM {
    fn default() -> Self {
        Self::new()
    }
}

fn expect_name(value: Value, mnemonic: &str) -> Result<String, VmError> {
    match value {
        Value::Str(name) => Ok(name),
        other => Err(VmError::type_error(format!(
            "{mnemonic} expects a variable name, got {}",
            other.type_name()
        ))),
    }
}

/// Floor division, matching the semantics the bytecode was written
/// against: the quotient rounds toward negative infinity.
fn floor_div(a: i64, b: i64) -> i64 {
    let q = a.wrapping_div(b);
    let r = a.wrapping_rem(b);
    if r != 0 && (r < 0) != (b < 0) {
        q - 1
    } else {
        q
    }
}

/// Remainder taking the sign of the divisor, the counterpart of
/// `floor_div`.
fn floor_mod(a: i64, b: i64) -> i64 {
    let r = a.wrapping_rem(b);
    if r != 0 && (r < 0) != (b < 0) {
        r + b
    } else {
        r
    }
}
