// File: src/builtins.rs
//
// Native function registry. `clock()` is the only native the language
// guarantees; it exists so test scripts and benchmarks can measure
// elapsed time without the interpreter depending on wall-clock state
// anywhere else.

use crate::value::Value;
use crate::vm::Vm;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn install(vm: &mut Vm) {
    vm.define_native("clock", 0, clock_native);
}

fn clock_native(_args: &[Value]) -> Result<Value, String> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| "System clock is before the Unix epoch.".to_string())?;
    Ok(Value::Number(elapsed.as_secs_f64()))
}
