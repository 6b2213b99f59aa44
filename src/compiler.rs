// File: src/compiler.rs
//
// Compiler for the Pena surface language. Line-oriented: each recognized
// statement appends directly to the bytecode stream, infix arithmetic goes
// through shunting-yard, and jump labels are fixed up before the stream is
// returned.

use crate::bytecode::{self, Item};
use crate::errors::VmError;
use crate::opcode::OpCode;
use crate::value::Value;
use once_cell::sync::Lazy;
use regex::Regex;

static FUNCTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^function\s+(\w+)\((.*?)\)").expect("function pattern"));
static CALL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\w+)\((.*)\)").expect("call pattern"));
static FOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^for\s+(\w+),\s*(\d+)\s*->\s*(\d+)").expect("for pattern"));
static COND_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\((.*?)\)").expect("condition pattern"));
static PRINT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^print\((.*)\)").expect("print pattern"));
static EXPR_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\w+|[()+\-*/]").expect("expression tokenizer"));

/// Compiles Pena source into an executable bytecode stream.
pub struct PenaCompiler {
    bytecode: Vec<Item>,
    label_counter: usize,
    fn_depth: usize,
}

impl PenaCompiler {
    pub fn new() -> Self {
        Self { bytecode: Vec::new(), label_counter: 0, fn_depth: 0 }
    }

    /// Compiles a whole source text. The returned stream has all jump
    /// labels resolved to integer addresses; label placeholders stay in
    /// the stream and execute as `NOP`.
    pub fn compile(&mut self, source: &str) -> Result<Vec<Item>, VmError> {
        self.bytecode.clear();
        self.label_counter = 0;
        self.fn_depth = 0;

        let lines = preprocess(source);
        let mut i = 0;
        while i < lines.len() {
            i = self.compile_line(&lines, i)?;
        }

        let mut stream = std::mem::take(&mut self.bytecode);
        bytecode::resolve_labels(&mut stream);
        Ok(stream)
    }

    /// Compiles the statement starting at line `i` and returns the index
    /// of the next unconsumed line.
    fn compile_line(&mut self, lines: &[String], i: usize) -> Result<usize, VmError> {
        let line = lines[i].as_str();
        if line.starts_with("function") {
            self.compile_function(lines, i)
        } else if line.starts_with("for") {
            self.compile_for(lines, i)
        } else if line.starts_with("while") {
            self.compile_while(lines, i)
        } else if line.starts_with("if") {
            self.compile_if(lines, i)
        } else if let Some(call) = line.strip_prefix("woof ") {
            self.compile_call(call)?;
            Ok(i + 1)
        } else if line.starts_with("print(") {
            self.compile_print(line)?;
            Ok(i + 1)
        } else if line.starts_with("return") {
            self.compile_return(line)?;
            Ok(i + 1)
        } else if line == "break" {
            self.emit(OpCode::BreakLoop);
            Ok(i + 1)
        } else if line == "continue" {
            self.emit(OpCode::ContinueLoop);
            Ok(i + 1)
        } else if line.contains(":=") {
            self.compile_literal(line)?;
            Ok(i + 1)
        } else if line.contains('=') {
            self.compile_assignment(line)?;
            Ok(i + 1)
        } else {
            // Unrecognized lines are skipped.
            Ok(i + 1)
        }
    }

    /// Compiles statements until the closing brace and returns its index.
    fn compile_block(&mut self, lines: &[String], mut i: usize) -> Result<usize, VmError> {
        while i < lines.len() && !lines[i].starts_with('}') {
            i = self.compile_line(lines, i)?;
        }
        Ok(i)
    }

    fn emit(&mut self, op: OpCode) {
        self.bytecode.push(Item::Op(op));
    }

    fn emit_push(&mut self, value: Value) {
        self.emit(OpCode::Push);
        self.bytecode.push(Item::Value(value));
    }

    fn emit_jmp(&mut self, label: &str) {
        self.emit(OpCode::Jmp);
        self.bytecode.push(Item::Value(Value::Label(label.to_string())));
    }

    fn emit_label(&mut self, label: &str) {
        self.bytecode.push(Item::Value(Value::Label(label.to_string())));
    }

    /// The guard shared by `while` and `if`: a condition equal to 1 falls
    /// through to the exit jump, anything else enters the block.
    fn emit_guard(&mut self, exit_label: &str) {
        self.emit(OpCode::If);
        self.bytecode.push(Item::Value(Value::Int(1)));
        self.emit_jmp(exit_label);
    }

    fn new_label(&mut self) -> String {
        self.label_counter += 1;
        format!("LABEL_{}", self.label_counter)
    }

    /// `var = expr`: the name goes under the value, matching what `SET`
    /// pops.
    fn compile_assignment(&mut self, line: &str) -> Result<(), VmError> {
        let (var, expr) = line
            .split_once('=')
            .ok_or_else(|| VmError::syntax(format!("malformed assignment: {line}")))?;
        self.emit_push(Value::str(var.trim()));
        self.compile_expression(expr.trim())?;
        self.emit(OpCode::Set);
        Ok(())
    }

    /// `var := [a, b, c]` or `var := {}`, container initialization.
    fn compile_literal(&mut self, line: &str) -> Result<(), VmError> {
        let (var, value) = line
            .split_once(":=")
            .ok_or_else(|| VmError::syntax(format!("malformed literal: {line}")))?;
        let (var, value) = (var.trim(), value.trim());
        if value.starts_with('[') {
            self.emit_push(Value::str(var));
            self.emit_push(Value::empty_list());
            self.emit(OpCode::Set);
            let inner = value.trim_matches(|c| c == '[' || c == ']' || c == ' ');
            for item in inner.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                self.emit_push(Value::str(var));
                self.emit_push(literal_value(item));
                self.emit(OpCode::ListAppend);
            }
        } else if value.starts_with('{') {
            self.emit_push(Value::str(var));
            self.emit_push(Value::empty_dict());
            self.emit(OpCode::Set);
        }
        Ok(())
    }

    fn compile_print(&mut self, line: &str) -> Result<(), VmError> {
        let caps = PRINT_RE
            .captures(line)
            .ok_or_else(|| VmError::syntax(format!("malformed print: {line}")))?;
        self.compile_expression(caps[1].trim())?;
        self.emit(OpCode::Print);
        Ok(())
    }

    fn compile_return(&mut self, line: &str) -> Result<(), VmError> {
        let expr = line.strip_prefix("return").unwrap_or("").trim();
        self.compile_expression(expr)?;
        self.emit(OpCode::Ret);
        Ok(())
    }

    /// `woof name(arg1, ...)`: arguments are pushed in reverse so the first
    /// one ends up on top, then count and name for `CALL_FUNC`.
    fn compile_call(&mut self, call: &str) -> Result<(), VmError> {
        let caps = CALL_RE
            .captures(call.trim())
            .ok_or_else(|| VmError::syntax(format!("malformed call: {call}")))?;
        let name = caps[1].to_string();
        let args: Vec<&str> =
            caps[2].split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
        for arg in args.iter().rev() {
            self.emit_push(literal_value(arg));
        }
        self.emit_push(Value::Int(args.len() as i64));
        self.emit_push(Value::str(name));
        self.emit(OpCode::CallFunc);
        Ok(())
    }

    fn compile_function(&mut self, lines: &[String], start: usize) -> Result<usize, VmError> {
        if self.fn_depth > 0 {
            return Err(VmError::syntax("nested function definitions are not supported"));
        }
        let header = &lines[start];
        let caps = FUNCTION_RE
            .captures(header)
            .ok_or_else(|| VmError::syntax(format!("malformed function header: {header}")))?;
        let name = caps[1].to_string();
        let params: Vec<String> =
            caps[2].split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect();

        self.emit_push(Value::Str(name));
        self.emit_push(Value::Int(params.len() as i64));
        self.emit(OpCode::DefFunc);

        // Bind arguments to parameter names; the first argument sits on
        // top of the stack at entry.
        for param in &params {
            self.emit_push(Value::str(param));
            self.emit(OpCode::Swap);
            self.emit(OpCode::Set);
        }

        self.fn_depth += 1;
        let end = self.compile_block(lines, start + 1);
        self.fn_depth -= 1;
        let i = end?;
        self.emit(OpCode::Ret);
        Ok(i + 1)
    }

    /// `for v, s -> e { ... }`: the counter always starts at 0; the start
    /// bound is accepted and ignored. `CONTINUE_LOOP` closes the body.
    fn compile_for(&mut self, lines: &[String], start: usize) -> Result<usize, VmError> {
        let header = &lines[start];
        let caps = FOR_RE
            .captures(header)
            .ok_or_else(|| VmError::syntax(format!("malformed for header: {header}")))?;
        let var = caps[1].to_string();
        let end: i64 = caps[3]
            .parse()
            .map_err(|_| VmError::syntax(format!("loop bound out of range: {}", &caps[3])))?;

        self.emit_push(Value::Str(var));
        self.emit_push(Value::Int(end));
        self.emit(OpCode::ForLoop);
        let i = self.compile_block(lines, start + 1)?;
        self.emit(OpCode::ContinueLoop);
        Ok(i + 1)
    }

    fn compile_while(&mut self, lines: &[String], start: usize) -> Result<usize, VmError> {
        let header = &lines[start];
        let cond = COND_RE
            .captures(header)
            .ok_or_else(|| VmError::syntax(format!("malformed while header: {header}")))?[1]
            .to_string();
        let label_start = self.new_label();
        let label_end = self.new_label();

        self.emit_label(&label_start);
        self.compile_expression(&cond)?;
        self.emit_guard(&label_end);
        let i = self.compile_block(lines, start + 1)?;
        self.emit_jmp(&label_start);
        self.emit_label(&label_end);
        Ok(i + 1)
    }

    /// `if/else if/else`: each guarded branch
    /// jumps to the shared end label when taken.
    fn compile_if(&mut self, lines: &[String], start: usize) -> Result<usize, VmError> {
        let end_label = self.new_label();
        let mut i = start;
        while i < lines.len() {
            let line = lines[i].as_str();
            if line.starts_with("if") || line.starts_with("else if") {
                let cond = COND_RE
                    .captures(line)
                    .ok_or_else(|| VmError::syntax(format!("malformed condition: {line}")))?[1]
                    .to_string();
                self.compile_expression(&cond)?;
                let branch_label = self.new_label();
                self.emit_guard(&branch_label);
                i = self.compile_block(lines, i + 1)?;
                self.emit_jmp(&end_label);
                self.emit_label(&branch_label);
                i += 1;
            } else if line.starts_with("else") {
                i = self.compile_block(lines, i + 1)?;
                i += 1;
                break;
            } else {
                break;
            }
        }
        self.emit_label(&end_label);
        Ok(i)
    }

    /// Shunting-yard over `+ - * /` with parentheses. Operands emit
    /// `PUSH literal` or `PUSH name; GET`, operators emit their opcode.
    fn compile_expression(&mut self, expr: &str) -> Result<(), VmError> {
        let tokens: Vec<&str> = EXPR_TOKEN_RE.find_iter(expr).map(|m| m.as_str()).collect();

        let mut output: Vec<&str> = Vec::new();
        let mut ops: Vec<&str> = Vec::new();
        for token in tokens {
            if is_numeric(token) || is_identifier(token) {
                output.push(token);
            } else if let Some(prec) = precedence(token) {
                while ops
                    .last()
                    .is_some_and(|top| precedence(top).is_some_and(|p| p >= prec))
                {
                    if let Some(top) = ops.pop() {
                        output.push(top);
                    }
                }
                ops.push(token);
            } else if token == "(" {
                ops.push(token);
            } else if token == ")" {
                while ops.last().is_some_and(|&top| top != "(") {
                    if let Some(top) = ops.pop() {
                        output.push(top);
                    }
                }
                ops.pop();
            }
        }
        while let Some(top) = ops.pop() {
            output.push(top);
        }

        for token in output {
            if is_numeric(token) {
                let value: i64 = token
                    .parse()
                    .map_err(|_| VmError::syntax(format!("integer literal out of range: {token}")))?;
                self.emit_push(Value::Int(value));
            } else if is_identifier(token) {
                self.emit_push(Value::str(token));
                self.emit(OpCode::Get);
            } else {
                match token {
                    "+" => self.emit(OpCode::Add),
                    "-" => self.emit(OpCode::Sub),
                    "*" => self.emit(OpCode::Mul),
                    "/" => self.emit(OpCode::Div),
                    // A stray parenthesis emits nothing.
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

impl Default for PenaCompiler {
    fn default() -> Self {
        Self::new()
    }
}

/// Strips blank lines, comments, and surrounding whitespace.
fn preprocess(source: &str) -> Vec<String> {
    source
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("//"))
        .map(String::from)
        .collect()
}

/// A decimal numeral becomes an integer, anything else a string with its
/// surrounding quotes removed.
fn literal_value(text: &str) -> Value {
    if is_numeric(text) {
        if let Ok(n) = text.parse::<i64>() {
            return Value::Int(n);
        }
    }
    Value::str(text.trim_matches('"'))
}

fn is_numeric(token: &str) -> bool {
    !token.is_empty() && token.chars().all(|c| c.is_ascii_digit())
}

fn is_identifier(token: &str) -> bool {
    let mut chars = token.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn precedence(token: &str) -> Option<u8> {
    match token {
        "+" | "-" => Some(1),
        "*" | "/" => Some(2),
        _ => None,
    }
}
