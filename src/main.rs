// File: src/main.rs
//
// Entry point: with no arguments, launches the REPL; with one positional
// argument, compiles and runs that file. Exit codes follow the sysexits.h
// convention the language's diagnostics are modeled on: 0 clean, 64 usage
// error, 65 compile error, 70 runtime error, 74 I/O error.

mod builtins;
mod bytecode;
mod compiler;
mod errors;
mod gc;
mod lexer;
mod repl;
mod table;
mod value;
mod vm;

use clap::Parser as ClapParser;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(ClapParser)]
#[command(
    name = "wisp",
    about = "Wisp: a small bytecode-compiled scripting language",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    /// Path to a .wisp script. Omit to start the REPL.
    script: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.script {
        None => match repl::Repl::new() {
            Ok(mut repl) => {
                if let Err(err) = repl.run() {
                    eprintln!("{err}");
                    return ExitCode::from(74);
                }
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("{err}");
                ExitCode::from(74)
            }
        },
        Some(path) => {
            let source = match std::fs::read_to_string(&path) {
                Ok(source) => source,
                Err(err) => {
                    eprintln!("Could not read file '{}': {err}", path.display());
                    return ExitCode::from(74);
                }
            };
            let mut vm = vm::Vm::new();
            let result = vm.interpret(&source);
            ExitCode::from(result.exit_code() as u8)
        }
    }
}
