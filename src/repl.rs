// File: src/repl.rs
//
// Interactive REPL for the language. One persistent `Vm` across the whole
// session, so globals and classes defined on one line are visible on the
// next — each line is its own `interpret` call, not its own VM.

use crate::errors::InterpretResult;
use crate::vm::Vm;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

pub struct Repl {
    vm: Vm,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        Ok(Repl { vm: Vm::new(), editor })
    }

    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            match self.editor.readline("wisp> ") {
                Ok(line) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let _ = self.editor.add_history_entry(line.as_str());

                    match trimmed {
                        ":exit" | ":quit" => break,
                        ":help" => {
                            self.show_help();
                            continue;
                        }
                        _ => {}
                    }

                    // Exit code is irrelevant here; only the host process's
                    // exit code (set when running a file) is spec-visible.
                    let _: InterpretResult = self.vm.interpret(&line);
                }
                Err(ReadlineError::Interrupted) => continue,
                Err(ReadlineError::Eof) => break,
                Err(err) => {
                    eprintln!("{} {}", "Error:".red().bold(), err);
                    break;
                }
            }
        }
        Ok(())
    }

    fn show_help(&self) {
        println!("{}", "Commands:".bright_cyan().bold());
        println!("  :help   show this message");
        println!("  :exit   leave the REPL (:quit works too)");
    }
}
