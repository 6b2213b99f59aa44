// File: src/main.rs
//
// Command-line entry point for SANVM. Dispatches to the appropriate
// subcommand: run a Pena source file, execute an instruction list, or
// launch the interactive shell.

use clap::{Parser, Subcommand};
use sanvm::{assembler, bytecode, compiler::PenaCompiler, repl::Repl, vm::VM};
use std::fs;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(
    name = "sanvm",
    about = "SANVM: a stack-based smart-contract virtual machine",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[command(arg_required_else_help = true)]
enum Commands {
    /// Compile and run a Pena source file
    Run {
        /// Path to the .pena file
        file: PathBuf,

        /// Print the compiled bytecode before running
        #[arg(long)]
        dump_bytecode: bool,

        /// Abort execution after this many opcodes
        #[arg(long)]
        max_steps: Option<u64>,
    },

    /// Execute a JSON instruction list ([["PUSH", 1], ["ADD"], ...])
    Exec {
        /// Path to the instruction file
        file: PathBuf,

        /// Treat the input as the integer-tagged wire form instead
        #[arg(long)]
        wire: bool,

        /// Abort execution after this many opcodes
        #[arg(long)]
        max_steps: Option<u64>,
    },

    /// Launch the interactive Pena shell
    Repl,
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file, dump_bytecode, max_steps } => {
            let source = read_file(&file);
            let stream = match PenaCompiler::new().compile(&source) {
                Ok(stream) => stream,
                Err(e) => {
                    eprintln!("{e}");
                    process::exit(1);
                }
            };
            if dump_bytecode {
                print!("{}", bytecode::disassemble(&stream));
            }
            run_stream(stream, max_steps, false);
        }

        Commands::Exec { file, wire, max_steps } => {
            let source = read_file(&file);
            let parsed = if wire {
                serde_json::from_str::<Vec<serde_json::Value>>(&source)
                    .map_err(|e| sanvm::errors::VmError::syntax(format!("invalid wire JSON: {e}")))
                    .and_then(|items| bytecode::from_wire(&items))
            } else {
                assembler::parse_json(&source)
            };
            match parsed {
                Ok(stream) => run_stream(stream, max_steps, true),
                Err(e) => {
                    eprintln!("{e}");
                    process::exit(1);
                }
            }
        }

        Commands::Repl => match Repl::new() {
            Ok(mut repl) => {
                if let Err(e) = repl.run() {
                    eprintln!("REPL error: {e}");
                    process::exit(1);
                }
            }
            Err(e) => {
                eprintln!("Failed to start REPL: {e}");
                process::exit(1);
            }
        },
    }
}

fn read_file(path: &PathBuf) -> String {
    match fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Failed to read {}: {e}", path.display());
            process::exit(1);
        }
    }
}

fn run_stream(stream: Vec<bytecode::Item>, max_steps: Option<u64>, print_top: bool) {
    let mut machine = VM::new();
    machine.set_step_limit(max_steps);
    match machine.run(stream) {
        Ok(()) => {
            if print_top {
                if let Some(top) = machine.stack_top() {
                    println!("=> {top}");
                }
            }
        }
        Err(e) => {
            eprintln!("{e}");
            process::exit(1);
        }
    }
}
