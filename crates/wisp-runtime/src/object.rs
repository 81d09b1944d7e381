//! Heap object kinds.
//!
//! Every kind a [`crate::value::Value::Obj`] can point at. In the base
//! spec these share a common header (kind tag, mark bit, intrusive
//! next-pointer into the allocator's object list); here the "header" is
//! the arena slot itself ([`crate::heap::Slot`]) — the mark bit and list
//! membership live there, not on these structs, so `HeapObject` only
//! needs to carry kind-specific payload.

use crate::chunk::Chunk;
use crate::error::RuntimeError;
use crate::heap::{Heap, ObjRef};
use crate::table::Table;
use crate::value::Value;

pub enum HeapObject {
    String(ObjString),
    Function(ObjFunction),
    Native(ObjNative),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
}

/// Closed, finite tag for exhaustive `match`-based dispatch in the VM,
/// rather than the stringly-typed [`HeapObject::kind_name`] — per the base
/// spec's Design Notes: "tagged variants ... should prefer sum types with
/// exhaustive dispatch."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjKind {
    String,
    Function,
    Native,
    Closure,
    Upvalue,
    Class,
    Instance,
    BoundMethod,
}

impl HeapObject {
    pub fn kind(&self) -> ObjKind {
        match self {
            HeapObject::String(_) => ObjKind::String,
            HeapObject::Function(_) => ObjKind::Function,
            HeapObject::Native(_) => ObjKind::Native,
            HeapObject::Closure(_) => ObjKind::Closure,
            HeapObject::Upvalue(_) => ObjKind::Upvalue,
            HeapObject::Class(_) => ObjKind::Class,
            HeapObject::Instance(_) => ObjKind::Instance,
            HeapObject::BoundMethod(_) => ObjKind::BoundMethod,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            HeapObject::String(_) => "string",
            HeapObject::Function(_) => "function",
            HeapObject::Native(_) => "native",
            HeapObject::Closure(_) => "closure",
            HeapObject::Upvalue(_) => "upvalue",
            HeapObject::Class(_) => "class",
            HeapObject::Instance(_) => "instance",
            HeapObject::BoundMethod(_) => "bound method",
        }
    }

    /// Rough byte cost used to drive the GC threshold. Not meant to be an
    /// exact `size_of`, only monotonic with the object's real footprint.
    pub fn approx_size(&self) -> usize {
        match self {
            HeapObject::String(s) => std::mem::size_of::<ObjString>() + s.chars.len(),
            HeapObject::Function(f) => {
                std::mem::size_of::<ObjFunction>()
                    + f.chunk.code.len()
                    + f.chunk.constants.len() * std::mem::size_of::<Value>()
            }
            HeapObject::Native(_) => std::mem::size_of::<ObjNative>(),
            HeapObject::Closure(c) => {
                std::mem::size_of::<ObjClosure>() + c.upvalues.len() * std::mem::size_of::<ObjRef>()
            }
            HeapObject::Upvalue(_) => std::mem::size_of::<ObjUpvalue>(),
            HeapObject::Class(c) => std::mem::size_of::<ObjClass>() + c.methods.approx_size(),
            HeapObject::Instance(i) => std::mem::size_of::<ObjInstance>() + i.fields.approx_size(),
            HeapObject::BoundMethod(_) => std::mem::size_of::<ObjBoundMethod>(),
        }
    }
}

/// Immutable interned byte string with its cached hash.
pub struct ObjString {
    pub chars: Box<str>,
    pub hash: u32,
}

/// A compiled routine: arity, declared upvalue count, optional name, and
/// the [`Chunk`] the compiler emitted into. Never mutated after
/// `end_compiler` returns.
pub struct ObjFunction {
    pub arity: u8,
    pub upvalue_count: u8,
    pub name: Option<ObjRef>,
    pub chunk: Chunk,
}

impl ObjFunction {
    pub fn new() -> Self {
        Self {
            arity: 0,
            upvalue_count: 0,
            name: None,
            chunk: Chunk::new(),
        }
    }
}

pub type NativeFn = fn(&mut Heap, &[Value]) -> Result<Value, RuntimeError>;

pub struct ObjNative {
    pub name: ObjRef,
    pub arity: u8,
    pub func: NativeFn,
}

/// Runtime pairing of a [`ObjFunction`] with its captured upvalues.
pub struct ObjClosure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// A captured variable slot: open while it still points at a live stack
/// slot, closed once that slot has gone out of scope.
pub enum UpvalueLocation {
    /// Stack index of the captured slot, while still open.
    Stack(usize),
    /// The value, copied out once the owning frame returned.
    Closed(Value),
}

pub struct ObjUpvalue {
    pub location: UpvalueLocation,
}

impl ObjUpvalue {
    pub fn is_open(&self) -> bool {
        matches!(self.location, UpvalueLocation::Stack(_))
    }
}

pub struct ObjClass {
    pub name: ObjRef,
    pub methods: Table,
}

pub struct ObjInstance {
    pub class: ObjRef,
    pub fields: Table,
}

pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}
