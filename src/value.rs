// File: src/value.rs
//
// The runtime value model: the tagged `Value` union and the heap object
// representations it can point into. Mirrors the data model in the spec —
// nil / bool / number / object-reference, with strings interned and every
// other object kind carrying a GC header.

use crate::bytecode::Chunk;
use crate::table::Table;
use std::fmt;

/// A handle into the VM's heap. Cheap to copy; equality is identity, which
/// is exactly what reference equality on heap objects needs to mean.
pub type ObjRef = usize;

/// A tagged runtime value.
///
/// `#[derive(PartialEq)]` already gives the right semantics here: different
/// variants never compare equal, `f64` comparison follows IEEE-754 (so
/// `NaN != NaN`), and `Obj` equality is `ObjRef` equality — i.e. reference
/// equality, which collapses to string equality for interned strings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Number(f64),
    Obj(ObjRef),
}

impl Value {
    /// `nil` and `false` are falsey; everything else is truthy.
    pub fn is_falsey(&self) -> bool {
        matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_obj(&self) -> Option<ObjRef> {
        match self {
            Value::Obj(r) => Some(*r),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => {
                if n.is_infinite() {
                    write!(f, "{}", if *n > 0.0 { "inf" } else { "-inf" })
                } else {
                    write!(f, "{n}")
                }
            }
            // Objects need heap access to print their contents; the VM's
            // `Heap::display_value` is the real entry point callers use.
            Value::Obj(r) => write!(f, "<obj #{r}>"),
        }
    }
}

/// Every heap object carries the same GC header: its kind-specific payload
/// plus a mark bit used by the tracing collector.
pub struct ObjBox {
    pub marked: bool,
    pub data: Obj,
}

/// FNV-1a over raw bytes, as specified for String object hashing.
pub fn fnv1a_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

pub struct ObjString {
    pub s: String,
    pub hash: u32,
}

impl ObjString {
    pub fn new(s: String) -> Self {
        let hash = fnv1a_hash(s.as_bytes());
        Self { s, hash }
    }
}

/// A compiled function: immutable once compile finishes, shared by every
/// closure created over it.
pub struct ObjFunction {
    pub arity: usize,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    /// `None` for the implicit top-level script.
    pub name: Option<ObjRef>,
}

pub type NativeFn = fn(&[Value]) -> Result<Value, String>;

pub struct ObjNative {
    pub arity: usize,
    pub name: &'static str,
    pub function: NativeFn,
}

/// Open while `location` is `Some(slot)` (an index into the VM's value
/// stack); closed once the owning frame returns, at which point the value
/// has been copied into `closed` and `location` becomes `None`.
pub struct ObjUpvalue {
    pub location: Option<usize>,
    pub closed: Value,
}

pub struct ObjClosure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

pub struct ObjClass {
    pub name: ObjRef,
    pub methods: Table,
    /// Cached `init` closure, if the class (or an ancestor, via `OP_INHERIT`
    /// copy-down) defines one.
    pub init: Option<ObjRef>,
}

pub struct ObjInstance {
    pub class: ObjRef,
    pub fields: Table,
}

pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}

/// The tagged sum of every heap object kind. Dispatch for marking, freeing
/// and printing is by tag (`match`), not virtual dispatch — there is no
/// polymorphism in the target language's object model.
pub enum Obj {
    String(ObjString),
    Function(ObjFunction),
    Native(ObjNative),
    Upvalue(ObjUpvalue),
    Closure(ObjClosure),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
}

impl Obj {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Obj::String(_) => "string",
            Obj::Function(_) => "function",
            Obj::Native(_) => "native",
            Obj::Upvalue(_) => "upvalue",
            Obj::Closure(_) => "closure",
            Obj::Class(_) => "class",
            Obj::Instance(_) => "instance",
            Obj::BoundMethod(_) => "bound method",
        }
    }
}
