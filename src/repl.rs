// File: src/repl.rs
//
// Interactive shell for the Pena language. Provides:
// - Multi-line input while braces are unbalanced
// - Command history with line editing
// - Special commands (:help, :vars, :bytecode, :reset, :quit)
// - In-memory contract commands (:deploy, :call)
// - Variable state that persists across inputs

use crate::bytecode::{self, Item};
use crate::compiler::PenaCompiler;
use crate::contracts::ContractManager;
use crate::storage::Storage;
use crate::value::Value;
use crate::vm::VM;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::fs;

/// REPL session holding the persistent variable state and an in-memory
/// contract registry.
pub struct Repl {
    editor: DefaultEditor,
    storage: Storage,
    contracts: ContractManager,
    last_bytecode: Vec<Item>,
}

impl Repl {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Repl {
            editor: DefaultEditor::new()?,
            storage: Storage::new(),
            contracts: ContractManager::new(),
            last_bytecode: Vec::new(),
        })
    }

    fn show_banner(&self) {
        println!("{}", "SANVM / Pena interactive shell".bright_cyan().bold());
        println!(
            "  {} {} for commands, {} to leave",
            "Use".bright_blue(),
            ":help".bright_yellow(),
            ":quit".bright_yellow()
        );
        println!("  {} blocks stay open until their braces close", "Tip:".bright_magenta());
        println!();
    }

    /// Starts the interactive loop.
    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.show_banner();

        let mut buffer = String::new();
        loop {
            let prompt = if buffer.is_empty() {
                "pena> ".bright_green().to_string()
            } else {
                "....> ".bright_blue().to_string()
            };

            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());

                    if buffer.is_empty() && line.trim().starts_with(':') {
                        if self.handle_command(line.trim()) {
                            continue;
                        } else {
                            break;
                        }
                    }

                    buffer.push_str(&line);
                    buffer.push('\n');

                    if braces_balanced(&buffer) {
                        self.eval_input(&buffer);
                        buffer.clear();
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "^C (use :quit to exit)".bright_yellow());
                    buffer.clear();
                }
                Err(ReadlineError::Eof) => {
                    println!("{}", "Goodbye!".bright_cyan());
                    break;
                }
                Err(err) => {
                    eprintln!("{} {}", "Error:".bright_red(), err);
                    break;
                }
            }
        }

        Ok(())
    }

    /// Compiles and runs one buffered input against the persistent state.
    fn eval_input(&mut self, source: &str) {
        let mut compiler = PenaCompiler::new();
        let stream = match compiler.compile(source) {
            Ok(stream) => stream,
            Err(e) => {
                eprintln!("{e}");
                return;
            }
        };
        self.last_bytecode = stream.clone();

        let mut vm = VM::with_storage(std::mem::take(&mut self.storage));
        match vm.run(stream) {
            Ok(()) => {
                if let Some(top) = vm.stack_top() {
                    println!("{} {}", "=>".bright_black(), top);
                }
            }
            Err(e) => eprintln!("{e}"),
        }
        self.storage = vm.into_storage();
    }

    /// Handles special commands starting with ':'.
    /// Returns true to continue the loop, false to quit.
    fn handle_command(&mut self, command: &str) -> bool {
        let parts: Vec<&str> = command.split_whitespace().collect();
        match parts.first().copied().unwrap_or("") {
            ":help" | ":h" => {
                self.show_help();
                true
            }
            ":quit" | ":q" | ":exit" => false,
            ":vars" => {
                self.show_vars();
                true
            }
            ":bytecode" => {
                if self.last_bytecode.is_empty() {
                    println!("{}", "nothing compiled yet".bright_yellow());
                } else {
                    print!("{}", bytecode::disassemble(&self.last_bytecode));
                }
                true
            }
            ":reset" => {
                self.storage = Storage::new();
                self.last_bytecode.clear();
                println!("{}", "variable state cleared".bright_yellow());
                true
            }
            ":contracts" => {
                let mut ids: Vec<_> = self.contracts.ids().collect();
                if ids.is_empty() {
                    println!("{}", "no contracts deployed".bright_yellow());
                } else {
                    ids.sort();
                    for id in ids {
                        println!("  {}", id.bright_green());
                    }
                }
                true
            }
            ":deploy" => {
                self.cmd_deploy(&parts);
                true
            }
            ":call" => {
                self.cmd_call(&parts);
                true
            }
            other => {
                println!("{} {}", "Unknown command:".bright_red(), other);
                true
            }
        }
    }

    fn show_help(&self) {
        println!("{}", "Commands:".bright_cyan().bold());
        println!("  {}                  show this help", ":help".bright_yellow());
        println!("  {}                  list bound variables", ":vars".bright_yellow());
        println!("  {}              disassemble the last input", ":bytecode".bright_yellow());
        println!("  {}                 clear variable state", ":reset".bright_yellow());
        println!("  {}             list deployed contracts", ":contracts".bright_yellow());
        println!("  {}  deploy a contract from a file", ":deploy <id> <file>".bright_yellow());
        println!("  {}  invoke a contract function", ":call <id> <fn> [args]".bright_yellow());
        println!("  {}                  leave the shell", ":quit".bright_yellow());
        println!();
    }

    fn show_vars(&self) {
        let mut vars: Vec<_> = self.storage.vars().collect();
        if vars.is_empty() {
            println!("{}", "no variables bound".bright_yellow());
            return;
        }
        vars.sort_by(|a, b| a.0.cmp(b.0));
        for (name, value) in vars {
            println!("  {} = {}", name.bright_green(), value);
        }
    }

    fn cmd_deploy(&mut self, parts: &[&str]) {
        let [_, id, path] = parts else {
            eprintln!("{}", "usage: :deploy <id> <file>".bright_yellow());
            return;
        };
        let source = match fs::read_to_string(path) {
            Ok(source) => source,
            Err(e) => {
                eprintln!("{} {}: {e}", "Failed to read".bright_red(), path);
                return;
            }
        };
        let stream = match PenaCompiler::new().compile(&source) {
            Ok(stream) => stream,
            Err(e) => {
                eprintln!("{e}");
                return;
            }
        };
        match self.contracts.deploy(id, stream) {
            Ok(()) => println!("{} {}", "deployed".bright_green(), id),
            Err(e) => eprintln!("{e}"),
        }
    }

    fn cmd_call(&mut self, parts: &[&str]) {
        if parts.len() < 3 {
            eprintln!("{}", "usage: :call <id> <fn> [args...]".bright_yellow());
            return;
        }
        let (id, function) = (parts[1], parts[2]);
        let args: Vec<Value> = parts[3..].iter().map(|raw| parse_argument(raw)).collect();
        match self.contracts.call(id, function, &args) {
            Ok(Some(value)) => println!("{} {}", "=>".bright_black(), value),
            Ok(None) => println!("{} {}", "=>".bright_black(), "(empty stack)"),
            Err(e) => eprintln!("{e}"),
        }
    }
}

/// A decimal argument becomes an integer, anything else a string with
/// optional surrounding quotes removed.
fn parse_argument(raw: &str) -> Value {
    match raw.parse::<i64>() {
        Ok(n) => Value::Int(n),
        Err(_) => Value::str(raw.trim_matches('"')),
    }
}

/// Input is complete once every opened brace has closed.
fn braces_balanced(source: &str) -> bool {
    let mut depth = 0i64;
    for c in source.chars() {
        match c {
            '{' => depth += 1,
            '}' => depth -= 1,
            _ => {}
        }
    }
    depth <= 0
}
