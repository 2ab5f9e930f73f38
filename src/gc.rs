// File: src/gc.rs
//
// The managed heap and the primitives of the precise, non-moving,
// stop-the-world mark–sweep collector. Orchestration (deciding *when* to
// collect and what the root set is) lives in `vm.rs`, since only the VM
// knows about the value stack, call frames and open upvalues; this module
// owns object storage plus the mark/blacken/sweep mechanics.

use crate::table::Table;
use crate::value::{fnv1a_hash, Obj, ObjBox, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction,
                    ObjInstance, ObjNative, ObjRef, ObjString, ObjUpvalue, Value};

/// Heap-growth trigger: start small so a debug build collects early and
/// often (cheap to verify correctness against), grow geometrically after.
pub const INITIAL_NEXT_GC: usize = 1024 * 1024;
pub const GC_GROWTH_FACTOR: usize = 2;

pub struct Heap {
    objects: Vec<Option<ObjBox>>,
    free_list: Vec<ObjRef>,
    pub bytes_allocated: usize,
    pub next_gc: usize,
    /// Forces a collection on every allocation instead of waiting for
    /// `bytes_allocated > next_gc`. Wired to `WISP_GC_STRESS=1`.
    pub stress_mode: bool,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            objects: Vec::new(),
            free_list: Vec::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_NEXT_GC,
            stress_mode: std::env::var("WISP_GC_STRESS").is_ok(),
        }
    }

    pub fn should_collect(&self) -> bool {
        self.stress_mode || self.bytes_allocated > self.next_gc
    }

    fn approx_size(obj: &Obj) -> usize {
        use std::mem::size_of_val;
        match obj {
            Obj::String(s) => size_of_val(s) + s.s.len(),
            Obj::Function(f) => size_of_val(f) + f.chunk.code.len() * 8,
            Obj::Native(n) => size_of_val(n),
            Obj::Upvalue(u) => size_of_val(u),
            Obj::Closure(c) => size_of_val(c) + c.upvalues.len() * 8,
            Obj::Class(c) => size_of_val(c),
            Obj::Instance(i) => size_of_val(i),
            Obj::BoundMethod(b) => size_of_val(b),
        }
    }

    pub fn allocate(&mut self, data: Obj) -> ObjRef {
        self.bytes_allocated += Self::approx_size(&data);
        let boxed = ObjBox { marked: false, data };
        if let Some(slot) = self.free_list.pop() {
            self.objects[slot] = Some(boxed);
            slot
        } else {
            self.objects.push(Some(boxed));
            self.objects.len() - 1
        }
    }

    pub fn alloc_string(&mut self, s: String) -> ObjRef {
        self.allocate(Obj::String(ObjString::new(s)))
    }

    pub fn alloc_function(&mut self, f: ObjFunction) -> ObjRef {
        self.allocate(Obj::Function(f))
    }

    pub fn alloc_native(&mut self, n: ObjNative) -> ObjRef {
        self.allocate(Obj::Native(n))
    }

    pub fn alloc_upvalue(&mut self, u: ObjUpvalue) -> ObjRef {
        self.allocate(Obj::Upvalue(u))
    }

    pub fn alloc_closure(&mut self, c: ObjClosure) -> ObjRef {
        self.allocate(Obj::Closure(c))
    }

    pub fn alloc_class(&mut self, c: ObjClass) -> ObjRef {
        self.allocate(Obj::Class(c))
    }

    pub fn alloc_instance(&mut self, i: ObjInstance) -> ObjRef {
        self.allocate(Obj::Instance(i))
    }

    pub fn alloc_bound_method(&mut self, b: ObjBoundMethod) -> ObjRef {
        self.allocate(Obj::BoundMethod(b))
    }

    /// Interns `s`: returns the existing `ObjRef` if an equal string is
    /// already in `strings`, else allocates and registers a new one. This
    /// is how the compiler's identifier/literal constants and the VM's
    /// runtime string concatenation both end up sharing one copy per
    /// distinct string, which is what makes `Value::Obj` equality on
    /// strings collapse to reference equality.
    pub fn intern_string(&mut self, strings: &mut Table, s: &str) -> ObjRef {
        let hash = fnv1a_hash(s.as_bytes());
        if let Some(r) = strings.find_string(self, s, hash) {
            return r;
        }
        let r = self.alloc_string(s.to_string());
        strings.set(self, r, Value::Bool(true));
        r
    }

    fn slot(&self, r: ObjRef) -> &ObjBox {
        self.objects[r].as_ref().expect("dangling ObjRef: object was already freed")
    }

    fn slot_mut(&mut self, r: ObjRef) -> &mut ObjBox {
        self.objects[r].as_mut().expect("dangling ObjRef: object was already freed")
    }

    pub fn get(&self, r: ObjRef) -> &Obj {
        &self.slot(r).data
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        &mut self.slot_mut(r).data
    }

    pub fn get_string(&self, r: ObjRef) -> &ObjString {
        match &self.slot(r).data {
            Obj::String(s) => s,
            other => panic!("expected string object, found {}", other.kind_name()),
        }
    }

    pub fn get_function(&self, r: ObjRef) -> &ObjFunction {
        match &self.slot(r).data {
            Obj::Function(f) => f,
            other => panic!("expected function object, found {}", other.kind_name()),
        }
    }

    pub fn get_closure(&self, r: ObjRef) -> &ObjClosure {
        match &self.slot(r).data {
            Obj::Closure(c) => c,
            other => panic!("expected closure object, found {}", other.kind_name()),
        }
    }

    pub fn get_native(&self, r: ObjRef) -> &ObjNative {
        match &self.slot(r).data {
            Obj::Native(n) => n,
            other => panic!("expected native object, found {}", other.kind_name()),
        }
    }

    pub fn get_upvalue(&self, r: ObjRef) -> &ObjUpvalue {
        match &self.slot(r).data {
            Obj::Upvalue(u) => u,
            other => panic!("expected upvalue object, found {}", other.kind_name()),
        }
    }

    pub fn get_upvalue_mut(&mut self, r: ObjRef) -> &mut ObjUpvalue {
        match &mut self.slot_mut(r).data {
            Obj::Upvalue(u) => u,
            other => panic!("expected upvalue object, found {}", other.kind_name()),
        }
    }

    pub fn get_class(&self, r: ObjRef) -> &ObjClass {
        match &self.slot(r).data {
            Obj::Class(c) => c,
            other => panic!("expected class object, found {}", other.kind_name()),
        }
    }

    pub fn get_class_mut(&mut self, r: ObjRef) -> &mut ObjClass {
        match &mut self.slot_mut(r).data {
            Obj::Class(c) => c,
            other => panic!("expected class object, found {}", other.kind_name()),
        }
    }

    pub fn get_instance(&self, r: ObjRef) -> &ObjInstance {
        match &self.slot(r).data {
            Obj::Instance(i) => i,
            other => panic!("expected instance object, found {}", other.kind_name()),
        }
    }

    pub fn get_instance_mut(&mut self, r: ObjRef) -> &mut ObjInstance {
        match &mut self.slot_mut(r).data {
            Obj::Instance(i) => i,
            other => panic!("expected instance object, found {}", other.kind_name()),
        }
    }

    pub fn get_bound_method(&self, r: ObjRef) -> &ObjBoundMethod {
        match &self.slot(r).data {
            Obj::BoundMethod(b) => b,
            other => panic!("expected bound method object, found {}", other.kind_name()),
        }
    }

    pub fn is_marked(&self, r: ObjRef) -> bool {
        self.objects[r].as_ref().map(|b| b.marked).unwrap_or(false)
    }

    /// Marks `r` and, unless it is a leaf kind (String, Native), pushes it
    /// onto the gray worklist so its outgoing edges get traced later.
    pub fn mark_object(&mut self, r: ObjRef, gray_stack: &mut Vec<ObjRef>) {
        let already = &mut self.slot_mut(r).marked;
        if *already {
            return;
        }
        *already = true;
        match &self.objects[r].as_ref().unwrap().data {
            Obj::String(_) | Obj::Native(_) => {}
            _ => gray_stack.push(r),
        }
    }

    pub fn mark_value(&mut self, value: Value, gray_stack: &mut Vec<ObjRef>) {
        if let Value::Obj(r) = value {
            self.mark_object(r, gray_stack);
        }
    }

    fn mark_table(&mut self, table: &Table, gray_stack: &mut Vec<ObjRef>) {
        let entries: Vec<(ObjRef, Value)> = table.iter().collect();
        for (key, value) in entries {
            self.mark_object(key, gray_stack);
            self.mark_value(value, gray_stack);
        }
    }

    /// Walks the outgoing edges of one gray object, marking everything it
    /// points to. Called repeatedly until the gray stack is empty.
    pub fn blacken_object(&mut self, r: ObjRef, gray_stack: &mut Vec<ObjRef>) {
        match &self.objects[r].as_ref().unwrap().data {
            Obj::String(_) | Obj::Native(_) => {}
            Obj::Function(f) => {
                let name = f.name;
                let constants: Vec<Value> = f.chunk.constants.clone();
                if let Some(n) = name {
                    self.mark_object(n, gray_stack);
                }
                for c in constants {
                    self.mark_value(c, gray_stack);
                }
            }
            Obj::Closure(c) => {
                let function = c.function;
                let upvalues = c.upvalues.clone();
                self.mark_object(function, gray_stack);
                for u in upvalues {
                    self.mark_object(u, gray_stack);
                }
            }
            Obj::Upvalue(u) => {
                if u.location.is_none() {
                    let closed = u.closed;
                    self.mark_value(closed, gray_stack);
                }
            }
            Obj::Class(c) => {
                let name = c.name;
                let methods = c.methods.clone();
                let init = c.init;
                self.mark_object(name, gray_stack);
                self.mark_table(&methods, gray_stack);
                if let Some(i) = init {
                    self.mark_object(i, gray_stack);
                }
            }
            Obj::Instance(i) => {
                let class = i.class;
                let fields = i.fields.clone();
                self.mark_object(class, gray_stack);
                self.mark_table(&fields, gray_stack);
            }
            Obj::BoundMethod(b) => {
                let receiver = b.receiver;
                let method = b.method;
                self.mark_value(receiver, gray_stack);
                self.mark_object(method, gray_stack);
            }
        }
    }

    /// Frees every unmarked object and clears the mark bit on survivors.
    /// Returns the number of objects freed (purely informational).
    pub fn sweep(&mut self) -> usize {
        let mut freed = 0;
        for (index, slot) in self.objects.iter_mut().enumerate() {
            match slot {
                Some(obj) if !obj.marked => {
                    self.bytes_allocated = self.bytes_allocated.saturating_sub(Self::approx_size(&obj.data));
                    *slot = None;
                    self.free_list.push(index);
                    freed += 1;
                }
                Some(obj) => obj.marked = false,
                None => {}
            }
        }
        freed
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}
