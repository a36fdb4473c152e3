mod args;

use std::fs;
use std::process::exit;

use args::{get_action, Action, ArgsError};
use rustyline::error::ReadlineError;
use rustyline::Editor;
use vm::{InterpretError, Vm};

fn main() {
    let action = get_action().unwrap_or_else(|err: ArgsError| {
        eprintln!("{err}");
        exit(exitcode::USAGE);
    });
    match action {
        Action::Repl => run_repl(),
        Action::RunFile { path, disassemble } => run_file(path, disassemble),
    }
}

fn run_file(path: std::path::PathBuf, disassemble: bool) {
    let source = fs::read_to_string(&path).unwrap_or_else(|err| {
        eprintln!("can't read file '{}': {err}", path.display());
        exit(exitcode::IOERR);
    });
    let mut vm = Vm::new();
    if disassemble {
        match vm.compile_for_disassembly(&source) {
            Ok(text) => {
                print!("{text}");
                exit(exitcode::OK);
            }
            Err(errors) => {
                for err in errors {
                    eprintln!("{err}");
                }
                exit(exitcode::DATAERR);
            }
        }
    }
    match vm.interpret(&source) {
        Ok(()) => exit(exitcode::OK),
        Err(InterpretError::Compile(_)) => exit(exitcode::DATAERR),
        Err(InterpretError::Runtime(_)) => exit(exitcode::SOFTWARE),
    }
}

/// Line-oriented REPL (spec.md §6): an empty line is a no-op, `exit` or EOF
/// on stdin terminates with 0, and neither compile nor runtime errors end
/// the session — the same `Vm` keeps its globals across lines.
fn run_repl() {
    let mut vm = Vm::new();
    let mut rl = Editor::<()>::new();
    loop {
        match rl.readline("> ") {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                rl.add_history_entry(&line);
                if trimmed == "exit" {
                    break;
                }
                if let Err(err) = vm.interpret(&line) {
                    eprintln!("{err}");
                }
            }
            Err(ReadlineError::Eof) | Err(ReadlineError::Interrupted) => break,
            Err(err) => {
                eprintln!("readline error: {err}");
                break;
            }
        }
    }
    exit(exitcode::OK);
}
