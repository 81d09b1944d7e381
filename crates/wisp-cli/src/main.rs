//! `wisp` — the command-line driver for `wisp-runtime`.
//!
//! Thin by design: all language behavior lives in `wisp-runtime`, this
//! crate only does argument parsing, file I/O, REPL line editing, and
//! translating an `InterpretResult` into the process exit code.

mod repl;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use colored::Colorize;
use wisp_runtime::InterpretResult;

/// Exit codes, per the base spec's §4.6/§6 (matching the sysexits.h
/// convention the reference implementation borrows: 65 = data error, 70 =
/// internal software error, 74 = I/O error).
const EX_OK: u8 = 0;
const EX_DATAERR: u8 = 65;
const EX_SOFTWARE: u8 = 70;
const EX_IOERR: u8 = 74;

/// The wisp scripting language: compile and run a script, or start an
/// interactive session.
#[derive(Debug, Parser)]
#[command(name = "wisp", version, about)]
struct Cli {
    /// Script file to run. Omit to start a REPL.
    script: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.script {
        Some(path) => ExitCode::from(run_file(&path)),
        None => {
            repl::run();
            ExitCode::from(EX_OK)
        }
    }
}

fn run_file(path: &PathBuf) -> u8 {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("{} {}: {err}", "Failed to read".red().bold(), path.display());
            return EX_IOERR;
        }
    };
    match wisp_runtime::interpret(&source) {
        InterpretResult::Ok => EX_OK,
        InterpretResult::CompileError => EX_DATAERR,
        InterpretResult::RuntimeError => EX_SOFTWARE,
    }
}
