// File: src/lib.rs
//
// Library interface for the interpreter. Exposes every module for
// integration testing and external embedding.

pub mod builtins;
pub mod bytecode;
pub mod compiler;
pub mod errors;
pub mod gc;
pub mod lexer;
pub mod repl;
pub mod table;
pub mod value;
pub mod vm;

use errors::InterpretResult;
use std::cell::RefCell;
use std::io;
use std::rc::Rc;

/// Compiles and runs `source` against a fresh VM, returning whatever
/// `InterpretResult` the run produced. Test tooling's main entry point —
/// each call gets an isolated heap and globals, matching the spec's
/// requirement that VMs can be created and destroyed freely.
pub fn run_source(source: &str) -> InterpretResult {
    let mut vm = vm::Vm::new();
    vm.interpret(source)
}

/// `Write` sink over a shared buffer, so the buffer is still reachable
/// after the `Vm` that was writing into it is done with it.
struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Like `run_source`, but also returns everything the script printed.
/// Lets tests check what a script actually computed rather than only
/// whether it ran without crashing.
pub fn run_source_capturing(source: &str) -> (InterpretResult, String) {
    let buffer = Rc::new(RefCell::new(Vec::new()));
    let mut vm = vm::Vm::with_output(Box::new(SharedBuffer(buffer.clone())));
    let result = vm.interpret(source);
    let output = String::from_utf8_lossy(&buffer.borrow()).into_owned();
    (result, output)
}
