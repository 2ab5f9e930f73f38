// File: src/vm.rs
//
// The stack-based virtual machine: a flat value stack, a bounded stack of
// call frames, an open-upvalue list sorted by descending stack slot, and
// garbage collection orchestration over the `Heap` from gc.rs. This is the
// one place that knows the whole root set, so it (not gc.rs) decides when
// to collect and what counts as reachable.

use crate::builtins;
use crate::bytecode::{Chunk, OpCode};
use crate::compiler;
use crate::errors::{find_closest_match, InterpretResult, RuntimeError};
use crate::gc::{Heap, GC_GROWTH_FACTOR};
use crate::table::Table;
use crate::value::{
    NativeFn, Obj, ObjBoundMethod, ObjClass, ObjClosure, ObjInstance, ObjNative, ObjRef,
    ObjUpvalue, Value,
};
use std::io::{self, Write};

/// Matches clox's bound: 64 nested calls before "Stack overflow."
const FRAMES_MAX: usize = 64;

struct CallFrame {
    closure: ObjRef,
    ip: usize,
    /// Index into the value stack of this frame's slot 0 (the callee, or
    /// the receiver for a method call).
    slot_base: usize,
}

pub struct Vm {
    pub heap: Heap,
    pub strings: Table,
    globals: Table,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    /// Sorted by descending stack slot, newest-open-first, matching the
    /// spec's singly-linked open-upvalue list.
    open_upvalues: Vec<ObjRef>,
    /// The canonical interned `"init"`, compared by reference so method
    /// installation doesn't re-hash and re-compare a literal on every call.
    init_string: ObjRef,
    /// Where `print` writes. Defaults to stdout; tests swap in an in-memory
    /// sink so they can assert on what a script actually printed instead of
    /// only on whether it ran to completion.
    output: Box<dyn Write>,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_output(Box::new(io::stdout()))
    }

    pub fn with_output(output: Box<dyn Write>) -> Self {
        let mut heap = Heap::new();
        let mut strings = Table::new();
        let init_string = heap.intern_string(&mut strings, "init");
        let mut vm = Self {
            heap,
            strings,
            globals: Table::new(),
            stack: Vec::new(),
            frames: Vec::new(),
            open_upvalues: Vec::new(),
            init_string,
            output,
        };
        builtins::install(&mut vm);
        vm
    }

    pub fn define_native(&mut self, name: &'static str, arity: usize, function: NativeFn) {
        let name_ref = self.heap.intern_string(&mut self.strings, name);
        let native_ref = self.heap.alloc_native(ObjNative { arity, name, function });
        self.globals.set(&self.heap, name_ref, Value::Obj(native_ref));
    }

    /// Compiles and runs one script to completion against this VM's
    /// persistent heap and globals (the REPL calls this once per line).
    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let function_ref = match compiler::compile(source, &mut self.heap, &mut self.strings) {
            Ok(function_ref) => function_ref,
            Err(errors) => {
                for error in &errors {
                    eprintln!("{error}");
                }
                return InterpretResult::CompileError;
            }
        };

        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();

        let closure_ref = self.heap.alloc_closure(ObjClosure { function: function_ref, upvalues: Vec::new() });
        self.push(Value::Obj(closure_ref));
        self.frames.push(CallFrame { closure: closure_ref, ip: 0, slot_base: 0 });

        match self.run() {
            Ok(()) => InterpretResult::Ok,
            Err(err) => {
                eprint!("{err}");
                InterpretResult::RuntimeError
            }
        }
    }

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("VM invariant violated: no active call frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("VM invariant violated: no active call frame")
    }

    fn current_chunk(&self) -> &Chunk {
        let closure_ref = self.frame().closure;
        let function_ref = self.heap.get_closure(closure_ref).function;
        &self.heap.get_function(function_ref).chunk
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("compiler invariant violated: value stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    /// The string constant at `idx` in the current chunk; the compiler only
    /// ever emits an operand like this over `identifier_constant`, so the
    /// constant is guaranteed to be a string.
    fn constant_string(&self, idx: usize) -> ObjRef {
        match self.current_chunk().constants[idx] {
            Value::Obj(r) => r,
            _ => panic!("compiler invariant violated: expected string constant"),
        }
    }

    fn is_string(&self, r: ObjRef) -> bool {
        matches!(self.heap.get(r), Obj::String(_))
    }

    fn is_instance(&self, r: ObjRef) -> bool {
        matches!(self.heap.get(r), Obj::Instance(_))
    }

    fn is_class(&self, r: ObjRef) -> bool {
        matches!(self.heap.get(r), Obj::Class(_))
    }

    // --- Main loop ---

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            if self.heap.should_collect() {
                self.collect_garbage();
            }

            let ip = self.frame().ip;
            let instruction = self.current_chunk().code[ip].clone();
            self.frame_mut().ip += 1;

            match instruction {
                OpCode::Constant(idx) | OpCode::ConstantLong(idx) => {
                    let value = self.current_chunk().constants[idx];
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Dup => {
                    let value = self.peek(0);
                    self.push(value);
                }
                OpCode::Pop => {
                    self.pop();
                }

                OpCode::DefineGlobal(idx) => {
                    let name_ref = self.constant_string(idx);
                    let value = self.pop();
                    self.globals.set(&self.heap, name_ref, value);
                }
                OpCode::GetGlobal(idx) => {
                    let name_ref = self.constant_string(idx);
                    match self.globals.get_by(&self.heap, name_ref) {
                        Some(value) => self.push(value),
                        None => return Err(self.undefined_global_error(name_ref)),
                    }
                }
                OpCode::SetGlobal(idx) => {
                    let name_ref = self.constant_string(idx);
                    if self.globals.get_by(&self.heap, name_ref).is_none() {
                        return Err(self.undefined_global_error(name_ref));
                    }
                    let value = self.peek(0);
                    self.globals.set(&self.heap, name_ref, value);
                }

                OpCode::GetLocal(slot) => {
                    let value = self.stack[self.frame().slot_base + slot];
                    self.push(value);
                }
                OpCode::SetLocal(slot) => {
                    let value = self.peek(0);
                    let index = self.frame().slot_base + slot;
                    self.stack[index] = value;
                }

                OpCode::GetUpvalue(idx) => {
                    let closure_ref = self.frame().closure;
                    let upvalue_ref = self.heap.get_closure(closure_ref).upvalues[idx];
                    self.push(self.read_upvalue(upvalue_ref));
                }
                OpCode::SetUpvalue(idx) => {
                    let closure_ref = self.frame().closure;
                    let upvalue_ref = self.heap.get_closure(closure_ref).upvalues[idx];
                    let value = self.peek(0);
                    match self.heap.get_upvalue(upvalue_ref).location {
                        Some(slot) => self.stack[slot] = value,
                        None => self.heap.get_upvalue_mut(upvalue_ref).closed = value,
                    }
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }

                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => self.numeric_compare(|x, y| x > y)?,
                OpCode::Less => self.numeric_compare(|x, y| x < y)?,
                OpCode::Add => self.add()?,
                OpCode::Subtract => self.numeric_binary(|x, y| x - y)?,
                OpCode::Multiply => self.numeric_binary(|x, y| x * y)?,
                OpCode::Divide => self.numeric_binary(|x, y| x / y)?,
                OpCode::Modulo => self.modulo()?,
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => {
                    let value = self.pop();
                    match value.as_number() {
                        Some(n) => self.push(Value::Number(-n)),
                        None => return Err(self.runtime_error("Operand must be a number.")),
                    }
                }

                OpCode::Print => {
                    let value = self.pop();
                    let _ = writeln!(self.output, "{}", self.display_value(value));
                }

                OpCode::Jump(target) => self.frame_mut().ip = target,
                OpCode::JumpIfFalse(target) => {
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip = target;
                    }
                }
                OpCode::JumpIfTrue(target) => {
                    if !self.peek(0).is_falsey() {
                        self.frame_mut().ip = target;
                    }
                }
                OpCode::Loop(target) => self.frame_mut().ip = target,

                OpCode::Call(arg_count) => {
                    let arg_count = arg_count as usize;
                    let callee = self.peek(arg_count);
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Return => {
                    let result = self.pop();
                    let slot_base = self.frame().slot_base;
                    self.close_upvalues(slot_base);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(slot_base);
                    self.push(result);
                }
                OpCode::Closure { function_index, upvalues } => {
                    let function_ref = match self.current_chunk().constants[function_index] {
                        Value::Obj(r) => r,
                        _ => panic!("compiler invariant violated: expected function constant"),
                    };
                    let slot_base = self.frame().slot_base;
                    let enclosing_closure = self.frame().closure;
                    let mut closure_upvalues = Vec::with_capacity(upvalues.len());
                    for desc in &upvalues {
                        if desc.is_local {
                            closure_upvalues.push(self.capture_upvalue(slot_base + desc.index));
                        } else {
                            closure_upvalues.push(self.heap.get_closure(enclosing_closure).upvalues[desc.index]);
                        }
                    }
                    let closure_ref = self.heap.alloc_closure(ObjClosure { function: function_ref, upvalues: closure_upvalues });
                    self.push(Value::Obj(closure_ref));
                }

                OpCode::Class(idx) => {
                    let name_ref = self.constant_string(idx);
                    let class_ref = self.heap.alloc_class(ObjClass { name: name_ref, methods: Table::new(), init: None });
                    self.push(Value::Obj(class_ref));
                }
                OpCode::Inherit => {
                    let superclass_ref = match self.peek(1) {
                        Value::Obj(r) if self.is_class(r) => r,
                        _ => return Err(self.runtime_error("Superclass must be a class.")),
                    };
                    let subclass_ref = match self.peek(0) {
                        Value::Obj(r) => r,
                        _ => unreachable!("compiler always pushes a class before Inherit"),
                    };
                    let methods = self.heap.get_class(superclass_ref).methods.clone();
                    let init = self.heap.get_class(superclass_ref).init;
                    let subclass = self.heap.get_class_mut(subclass_ref);
                    subclass.methods = methods;
                    subclass.init = init;
                    self.pop();
                }
                OpCode::Method(idx) => {
                    let name_ref = self.constant_string(idx);
                    let closure_ref = match self.pop() {
                        Value::Obj(r) => r,
                        _ => unreachable!("compiler always pushes a closure before Method"),
                    };
                    let class_ref = match self.peek(0) {
                        Value::Obj(r) => r,
                        _ => unreachable!("compiler always pushes a class around its method loop"),
                    };
                    let mut methods = self.heap.get_class(class_ref).methods.clone();
                    methods.set(&self.heap, name_ref, Value::Obj(closure_ref));
                    let class = self.heap.get_class_mut(class_ref);
                    class.methods = methods;
                    if name_ref == self.init_string {
                        class.init = Some(closure_ref);
                    }
                }
                OpCode::GetProperty(idx) => {
                    let name_ref = self.constant_string(idx);
                    let instance_ref = match self.peek(0) {
                        Value::Obj(r) if self.is_instance(r) => r,
                        _ => return Err(self.runtime_error("Only instances have properties.")),
                    };
                    let fields = self.heap.get_instance(instance_ref).fields.clone();
                    if let Some(value) = fields.get_by(&self.heap, name_ref) {
                        self.pop();
                        self.push(value);
                    } else {
                        let class_ref = self.heap.get_instance(instance_ref).class;
                        if !self.bind_method(class_ref, name_ref) {
                            return Err(self.undefined_property_error(name_ref));
                        }
                    }
                }
                OpCode::SetProperty(idx) => {
                    let name_ref = self.constant_string(idx);
                    let instance_ref = match self.peek(1) {
                        Value::Obj(r) if self.is_instance(r) => r,
                        _ => return Err(self.runtime_error("Only instances have fields.")),
                    };
                    let value = self.pop();
                    self.pop();
                    let mut fields = self.heap.get_instance(instance_ref).fields.clone();
                    fields.set(&self.heap, name_ref, value);
                    self.heap.get_instance_mut(instance_ref).fields = fields;
                    self.push(value);
                }
                OpCode::GetSuper(idx) => {
                    let name_ref = self.constant_string(idx);
                    let superclass_ref = match self.pop() {
                        Value::Obj(r) => r,
                        _ => unreachable!("compiler always pushes the superclass before GetSuper"),
                    };
                    if !self.bind_method(superclass_ref, name_ref) {
                        return Err(self.undefined_property_error(name_ref));
                    }
                }
                OpCode::Invoke { name_index, arg_count } => {
                    let name_ref = self.constant_string(name_index);
                    let arg_count = arg_count as usize;
                    let receiver = self.peek(arg_count);
                    self.invoke(receiver, name_ref, arg_count)?;
                }
                OpCode::SuperInvoke { name_index, arg_count } => {
                    let name_ref = self.constant_string(name_index);
                    let arg_count = arg_count as usize;
                    let superclass_ref = match self.pop() {
                        Value::Obj(r) => r,
                        _ => unreachable!("compiler always pushes the superclass before SuperInvoke"),
                    };
                    self.invoke_from_class(superclass_ref, name_ref, arg_count)?;
                }
            }
        }
    }

    // --- Arithmetic ---

    fn add(&mut self) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        let result = match (a, b) {
            (Value::Number(x), Value::Number(y)) => Value::Number(x + y),
            (Value::Obj(ra), Value::Obj(rb)) if self.is_string(ra) && self.is_string(rb) => {
                let mut concatenated = self.heap.get_string(ra).s.clone();
                concatenated.push_str(&self.heap.get_string(rb).s);
                Value::Obj(self.heap.intern_string(&mut self.strings, &concatenated))
            }
            _ => return Err(self.runtime_error("Operands must be two numbers or two strings.")),
        };
        self.push(result);
        Ok(())
    }

    fn numeric_binary(&mut self, op: impl Fn(f64, f64) -> f64) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => {
                self.push(Value::Number(op(x, y)));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    fn numeric_compare(&mut self, op: impl Fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => {
                self.push(Value::Bool(op(x, y)));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    /// `%` rounds both operands to the nearest integer via `floor(x+0.5)`
    /// before taking the remainder — not IEEE `fmod`. Preserved verbatim
    /// since changing it would silently change every program's output for
    /// fractional operands.
    fn modulo(&mut self) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => {
                let xi = (x + 0.5).floor() as i64;
                let yi = (y + 0.5).floor() as i64;
                if yi == 0 {
                    return Err(self.runtime_error("Modulo by zero."));
                }
                self.push(Value::Number((xi % yi) as f64));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    // --- Printing ---

    fn display_value(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => {
                if n.is_infinite() {
                    if n > 0.0 { "inf".to_string() } else { "-inf".to_string() }
                } else {
                    n.to_string()
                }
            }
            Value::Obj(r) => self.display_object(r),
        }
    }

    fn display_object(&self, r: ObjRef) -> String {
        match self.heap.get(r) {
            Obj::String(s) => s.s.clone(),
            Obj::Function(f) => match f.name {
                Some(name_ref) => format!("<fn {}>", self.heap.get_string(name_ref).s),
                None => "<script>".to_string(),
            },
            Obj::Native(n) => format!("<native fn {}>", n.name),
            Obj::Upvalue(_) => "<upvalue>".to_string(),
            Obj::Closure(c) => self.display_object(c.function),
            Obj::Class(c) => self.heap.get_string(c.name).s.clone(),
            Obj::Instance(i) => format!("{} instance", self.heap.get_string(self.heap.get_class(i.class).name).s),
            Obj::BoundMethod(b) => self.display_object(b.method),
        }
    }

    // --- Calling convention ---

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), RuntimeError> {
        let r = match callee {
            Value::Obj(r) => r,
            _ => return Err(self.runtime_error("Can only call functions and classes.")),
        };
        enum Callable {
            Closure,
            Native,
            Class,
            BoundMethod,
        }
        let kind = match self.heap.get(r) {
            Obj::Closure(_) => Callable::Closure,
            Obj::Native(_) => Callable::Native,
            Obj::Class(_) => Callable::Class,
            Obj::BoundMethod(_) => Callable::BoundMethod,
            _ => return Err(self.runtime_error("Can only call functions and classes.")),
        };
        match kind {
            Callable::Closure => self.call(r, arg_count),
            Callable::Native => self.call_native(r, arg_count),
            Callable::Class => self.call_class(r, arg_count),
            Callable::BoundMethod => {
                let receiver = self.heap.get_bound_method(r).receiver;
                let method_ref = self.heap.get_bound_method(r).method;
                let stack_len = self.stack.len();
                self.stack[stack_len - arg_count - 1] = receiver;
                self.call(method_ref, arg_count)
            }
        }
    }

    fn call(&mut self, closure_ref: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        let function_ref = self.heap.get_closure(closure_ref).function;
        let arity = self.heap.get_function(function_ref).arity;
        if arg_count != arity {
            return Err(self.runtime_error(format!("Expected {arity} arguments but got {arg_count}.")));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        let slot_base = self.stack.len() - arg_count - 1;
        self.frames.push(CallFrame { closure: closure_ref, ip: 0, slot_base });
        Ok(())
    }

    fn call_native(&mut self, native_ref: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        let native = self.heap.get_native(native_ref);
        let arity = native.arity;
        let function = native.function;
        if arg_count != arity {
            return Err(self.runtime_error(format!("Expected {arity} arguments but got {arg_count}.")));
        }
        let stack_len = self.stack.len();
        let args: Vec<Value> = self.stack[stack_len - arg_count..].to_vec();
        match function(&args) {
            Ok(value) => {
                self.stack.truncate(stack_len - arg_count - 1);
                self.push(value);
                Ok(())
            }
            Err(message) => Err(self.runtime_error(message)),
        }
    }

    fn call_class(&mut self, class_ref: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        let instance_ref = self.heap.alloc_instance(ObjInstance { class: class_ref, fields: Table::new() });
        let stack_len = self.stack.len();
        self.stack[stack_len - arg_count - 1] = Value::Obj(instance_ref);
        match self.heap.get_class(class_ref).init {
            Some(init_ref) => self.call(init_ref, arg_count),
            None => {
                if arg_count != 0 {
                    return Err(self.runtime_error(format!("Expected 0 arguments but got {arg_count}.")));
                }
                Ok(())
            }
        }
    }

    fn invoke(&mut self, receiver: Value, name_ref: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        let instance_ref = match receiver {
            Value::Obj(r) if self.is_instance(r) => r,
            _ => return Err(self.runtime_error("Only instances have methods.")),
        };
        let fields = self.heap.get_instance(instance_ref).fields.clone();
        if let Some(value) = fields.get_by(&self.heap, name_ref) {
            let stack_len = self.stack.len();
            self.stack[stack_len - arg_count - 1] = value;
            return self.call_value(value, arg_count);
        }
        let class_ref = self.heap.get_instance(instance_ref).class;
        self.invoke_from_class(class_ref, name_ref, arg_count)
    }

    fn invoke_from_class(&mut self, class_ref: ObjRef, name_ref: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        let methods = self.heap.get_class(class_ref).methods.clone();
        match methods.get_by(&self.heap, name_ref) {
            Some(Value::Obj(method_ref)) => self.call(method_ref, arg_count),
            _ => Err(self.undefined_property_error(name_ref)),
        }
    }

    /// Looks up `name` in `class`'s methods; on a hit, pops the receiver and
    /// pushes a `BoundMethod` pairing it with the closure. Returns `false`
    /// (no lookup error of its own — callers decide the message) on a miss.
    fn bind_method(&mut self, class_ref: ObjRef, name_ref: ObjRef) -> bool {
        let methods = self.heap.get_class(class_ref).methods.clone();
        match methods.get_by(&self.heap, name_ref) {
            Some(Value::Obj(method_ref)) => {
                let receiver = self.pop();
                let bound_ref = self.heap.alloc_bound_method(ObjBoundMethod { receiver, method: method_ref });
                self.push(Value::Obj(bound_ref));
                true
            }
            _ => false,
        }
    }

    // --- Upvalues ---

    fn read_upvalue(&self, upvalue_ref: ObjRef) -> Value {
        let upvalue = self.heap.get_upvalue(upvalue_ref);
        match upvalue.location {
            Some(slot) => self.stack[slot],
            None => upvalue.closed,
        }
    }

    /// Returns the existing open upvalue for `slot` if one exists, else
    /// allocates one and splices it into `open_upvalues` so the list stays
    /// sorted by descending slot.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        for &upvalue_ref in &self.open_upvalues {
            if self.heap.get_upvalue(upvalue_ref).location == Some(slot) {
                return upvalue_ref;
            }
        }
        let upvalue_ref = self.heap.alloc_upvalue(ObjUpvalue { location: Some(slot), closed: Value::Nil });
        let insert_at = self
            .open_upvalues
            .iter()
            .position(|&r| self.heap.get_upvalue(r).location.map_or(false, |s| s < slot))
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(insert_at, upvalue_ref);
        upvalue_ref
    }

    /// Closes every open upvalue at or above `from_slot`, copying its
    /// current stack value into its own `closed` storage.
    fn close_upvalues(&mut self, from_slot: usize) {
        let mut i = 0;
        while i < self.open_upvalues.len() {
            let upvalue_ref = self.open_upvalues[i];
            match self.heap.get_upvalue(upvalue_ref).location {
                Some(slot) if slot >= from_slot => {
                    let value = self.stack[slot];
                    let upvalue = self.heap.get_upvalue_mut(upvalue_ref);
                    upvalue.closed = value;
                    upvalue.location = None;
                    self.open_upvalues.remove(i);
                }
                _ => i += 1,
            }
        }
    }

    // --- Errors ---

    fn frame_line(&self, frame: &CallFrame) -> usize {
        let function_ref = self.heap.get_closure(frame.closure).function;
        self.heap.get_function(function_ref).chunk.get_line(frame.ip.saturating_sub(1))
    }

    fn frame_name(&self, frame: &CallFrame) -> String {
        let function_ref = self.heap.get_closure(frame.closure).function;
        match self.heap.get_function(function_ref).name {
            Some(name_ref) => self.heap.get_string(name_ref).s.clone(),
            None => "script".to_string(),
        }
    }

    /// Builds the diagnostic and unwinds every frame: runtime errors never
    /// leave the VM in a state a later `interpret` call could trip over.
    fn runtime_error(&mut self, message: impl Into<String>) -> RuntimeError {
        let message = message.into();
        let top_line = self.frames.last().map(|f| self.frame_line(f)).unwrap_or(0);
        let stack_trace: Vec<String> = self
            .frames
            .iter()
            .rev()
            .map(|frame| format!("[line {}] in {}", self.frame_line(frame), self.frame_name(frame)))
            .collect();

        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();

        RuntimeError::new(message, top_line).with_stack_trace(stack_trace)
    }

    fn undefined_global_error(&mut self, name_ref: ObjRef) -> RuntimeError {
        let name = self.heap.get_string(name_ref).s.clone();
        let candidates: Vec<String> = self.globals.iter().map(|(key, _)| self.heap.get_string(key).s.clone()).collect();
        let message = match find_closest_match(&name, &candidates) {
            Some(suggestion) => format!("Undefined variable '{name}'. Did you mean '{suggestion}'?"),
            None => format!("Undefined variable '{name}'."),
        };
        self.runtime_error(message)
    }

    fn undefined_property_error(&mut self, name_ref: ObjRef) -> RuntimeError {
        let name = self.heap.get_string(name_ref).s.clone();
        self.runtime_error(format!("Undefined property '{name}'."))
    }

    // --- Garbage collection ---

    /// Marks every root, traces from them to a fixed point, weakens the
    /// string table, then sweeps. Roots are: the value stack, each frame's
    /// closure, every open upvalue, the globals table, and the interned
    /// `"init"` string (the compiler's in-progress state is not a root
    /// here — collection only ever runs between opcodes of already-compiled
    /// code, never mid-compile).
    fn collect_garbage(&mut self) {
        let mut gray_stack: Vec<ObjRef> = Vec::new();

        for &value in &self.stack {
            self.heap.mark_value(value, &mut gray_stack);
        }
        for frame in &self.frames {
            self.heap.mark_object(frame.closure, &mut gray_stack);
        }
        for &upvalue_ref in &self.open_upvalues {
            self.heap.mark_object(upvalue_ref, &mut gray_stack);
        }
        let global_entries: Vec<(ObjRef, Value)> = self.globals.iter().collect();
        for (key, value) in global_entries {
            self.heap.mark_object(key, &mut gray_stack);
            self.heap.mark_value(value, &mut gray_stack);
        }
        self.heap.mark_object(self.init_string, &mut gray_stack);

        while let Some(r) = gray_stack.pop() {
            self.heap.blacken_object(r, &mut gray_stack);
        }

        self.strings.retain_keys(|r| self.heap.is_marked(r));
        self.heap.sweep();
        self.heap.next_gc = self.heap.bytes_allocated * GC_GROWTH_FACTOR;
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
