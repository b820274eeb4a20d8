#![warn(rust_2018_idioms)]
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

mod compiler;
mod debug;
mod memory;
mod vm;

use vm::{VMError, VM};

// sysexits-style codes.
const EXIT_BAD_USAGE: u8 = 64;
const EXIT_DATA_FORMAT: u8 = 65;
const EXIT_SOFTWARE: u8 = 70;
const EXIT_IO: u8 = 74;

#[derive(Parser)]
#[command(name = "rlox", about = "Bytecode interpreter for the Lox language")]
struct Cli {
    /// Script to run; starts a REPL when omitted.
    script: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(EXIT_BAD_USAGE);
        }
    };

    let mut vm = VM::new();
    match cli.script {
        Some(path) => run_file(&mut vm, &path),
        None => repl(&mut vm),
    }
}

fn run_file(vm: &mut VM, path: &Path) -> ExitCode {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Unable to open file '{}': {}", path.display(), err);
            return ExitCode::from(EXIT_IO);
        }
    };

    match vm.interpret(&source) {
        Ok(()) => ExitCode::SUCCESS,
        Err(VMError::CompileError(_)) => ExitCode::from(EXIT_DATA_FORMAT),
        Err(_) => ExitCode::from(EXIT_SOFTWARE),
    }
}

fn repl(vm: &mut VM) -> ExitCode {
    println!("Lox REPL. 'exit' or 'quit' to stop.");

    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(err) => {
            eprintln!("Unable to start line editor: {}", err);
            return ExitCode::from(EXIT_IO);
        }
    };

    loop {
        match editor.readline(" > ") {
            Ok(line) => {
                if line == "exit" || line == "quit" {
                    break;
                }
                let _ = editor.add_history_entry(&line);
                // Diagnostics were already printed; the next line gets a
                // fresh start.
                let _ = vm.interpret(&line);
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Input error: {}", err);
                return ExitCode::from(EXIT_IO);
            }
        }
    }
    ExitCode::SUCCESS
}
