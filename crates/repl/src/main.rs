//! lox - command-line interpreter for the Lox language.
//!
//! Usage:
//!   lox                # Start an interactive REPL
//!   lox program.lox    # Interpret a file
//!
//! Globals persist across REPL lines, so a session can build up state
//! incrementally. Exit codes follow the BSD sysexits convention:
//! 64 usage, 65 compile error, 70 runtime error, 74 I/O error.

use clap::Parser;
use lox_vm::{InterpretError, Vm};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

const EX_USAGE: u8 = 64;
const EX_DATAERR: u8 = 65;
const EX_SOFTWARE: u8 = 70;
const EX_IOERR: u8 = 74;

#[derive(Parser)]
#[command(name = "lox")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Lox interpreter - run a script or start a REPL", long_about = None)]
struct Cli {
    /// Script to interpret; starts an interactive session when omitted
    script: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            use clap::error::ErrorKind;
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => EX_USAGE,
            };
            let _ = err.print();
            return ExitCode::from(code);
        }
    };

    let code = match cli.script {
        Some(path) => run_file(&path),
        None => repl(),
    };
    ExitCode::from(code)
}

fn run_file(path: &Path) -> u8 {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(_) => {
            eprintln!("Could not open file \"{}\".", path.display());
            return EX_IOERR;
        }
    };
    let mut vm = Vm::new();
    exit_code(vm.interpret(&source))
}

fn exit_code(result: Result<(), InterpretError>) -> u8 {
    match result {
        Ok(()) => 0,
        Err(InterpretError::Compile) => EX_DATAERR,
        Err(InterpretError::Runtime) => EX_SOFTWARE,
    }
}

fn repl() -> u8 {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(err) => {
            eprintln!("Could not start line editor: {err}");
            return EX_IOERR;
        }
    };
    let history = history_path();
    if let Some(path) = &history {
        let _ = editor.load_history(path);
    }

    let mut vm = Vm::new();
    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line.as_str());
                // Diagnostics already went to stderr; the session
                // continues either way.
                let _ = vm.interpret(&line);
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Input error: {err}");
                return EX_IOERR;
            }
        }
    }

    if let Some(path) = &history {
        let _ = editor.save_history(path);
    }
    0
}

fn history_path() -> Option<PathBuf> {
    home::home_dir().map(|dir| dir.join(".lox_history"))
}
