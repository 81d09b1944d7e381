//! The memory manager: a precise, non-moving, mark-sweep tracing garbage
//! collector, plus the string-interning table that shares its sweep pass.
//!
//! Representation: rather than the raw-pointer intrusive object list a
//! C-flavored implementation would use, `Heap` owns a slot arena
//! (`Vec<Option<Slot>>`) with a free list for slot reuse, and objects are
//! referred to by [`ObjRef`], a `Copy` index handle. The base spec's
//! Design Notes explicitly sanction this as one valid mapping of the
//! object graph ("an arena holding all objects behind typed indices");
//! it keeps the collector free of `unsafe` while preserving every
//! invariant in the spec's §3/§8 — "on the allocator's object list"
//! becomes "occupies a slot", "on the gray work list" becomes membership
//! in `Heap::gray_stack`. Grounded on the free-slot recycling style of
//! `ouros::heap` (`HeapStats`, slot reuse), adapted from a refcounted
//! slab to a traced one.

use std::time::Instant;

use crate::object::{HeapObject, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjInstance, ObjNative, ObjString, ObjUpvalue, UpvalueLocation};
use crate::table::Table;
use crate::value::Value;

/// Initial GC threshold: 1 MiB of tracked allocation, per the base spec.
const INITIAL_NEXT_GC: usize = 1 << 20;
/// `next_gc = bytes_allocated * HEAP_GROW_FACTOR` after each collection.
const HEAP_GROW_FACTOR: usize = 2;

/// FNV-1a, 32-bit, exactly as the base spec's §4.5 prescribes.
pub fn fnv1a_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// A handle into the heap arena. `Copy`, cheap, and reference-identity
/// comparable — two `ObjRef`s are equal iff they name the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(u32);

impl ObjRef {
    pub fn index(&self) -> u32 {
        self.0
    }
}

pub(crate) struct Slot {
    pub(crate) obj: HeapObject,
    pub(crate) marked: bool,
}

/// Implemented by whoever is driving a GC cycle (the compiler while a
/// function is mid-compilation, the VM while a program is running) to
/// supply the root set for that cycle — the base spec's "pluggable root
/// providers".
pub trait RootProvider {
    fn mark_roots(&self, heap: &mut Heap);
}

pub struct Heap {
    objects: Vec<Option<Slot>>,
    free: Vec<u32>,
    pub strings: Table,
    gray_stack: Vec<ObjRef>,
    bytes_allocated: usize,
    next_gc: usize,
    pub stress_gc: bool,
    pub init_string: ObjRef,
    /// Captured at heap creation so the `clock` native can report elapsed
    /// time without a bare `fn` pointer needing closure state of its own.
    pub start_time: Instant,
}

impl Heap {
    pub fn new() -> Self {
        let mut heap = Heap {
            objects: Vec::new(),
            free: Vec::new(),
            strings: Table::new(),
            gray_stack: Vec::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_NEXT_GC,
            stress_gc: false,
            init_string: ObjRef(0),
            start_time: Instant::now(),
        };
        heap.init_string = heap.intern_str("init");
        heap
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn should_collect(&self) -> bool {
        self.stress_gc || self.bytes_allocated > self.next_gc
    }

    // ---- allocation hook -------------------------------------------------

    fn alloc(&mut self, obj: HeapObject) -> ObjRef {
        self.bytes_allocated += obj.approx_size();
        if let Some(idx) = self.free.pop() {
            self.objects[idx as usize] = Some(Slot { obj, marked: false });
            ObjRef(idx)
        } else {
            self.objects.push(Some(Slot { obj, marked: false }));
            ObjRef((self.objects.len() - 1) as u32)
        }
    }

    fn free_slot(&mut self, r: ObjRef) {
        if let Some(slot) = self.objects[r.0 as usize].take() {
            self.bytes_allocated = self.bytes_allocated.saturating_sub(slot.obj.approx_size());
        }
        self.free.push(r.0);
    }

    // ---- typed constructors ----------------------------------------------

    /// Intern a string, allocating a new `ObjString` only if this exact
    /// byte sequence isn't already live. Per §5's allocation-safety
    /// discipline: the caller must attach the returned reference to a
    /// root (push it to the value stack, store it in a local, etc.)
    /// before triggering any further allocation, since interning itself
    /// does not root the result beyond the intern table's weak entry.
    pub fn intern_str(&mut self, s: &str) -> ObjRef {
        let hash = fnv1a_hash(s.as_bytes());
        if let Some(existing) = self.strings.find_string(self, s, hash) {
            return existing;
        }
        let r = self.alloc(HeapObject::String(ObjString {
            chars: s.into(),
            hash,
        }));
        self.strings.set(r, hash, Value::Nil);
        r
    }

    pub fn alloc_function(&mut self) -> ObjRef {
        self.alloc(HeapObject::Function(ObjFunction::new()))
    }

    pub fn alloc_native(&mut self, name: ObjRef, arity: u8, func: crate::object::NativeFn) -> ObjRef {
        self.alloc(HeapObject::Native(ObjNative { name, arity, func }))
    }

    pub fn alloc_closure(&mut self, function: ObjRef, upvalues: Vec<ObjRef>) -> ObjRef {
        self.alloc(HeapObject::Closure(ObjClosure { function, upvalues }))
    }

    pub fn alloc_open_upvalue(&mut self, stack_index: usize) -> ObjRef {
        self.alloc(HeapObject::Upvalue(ObjUpvalue {
            location: UpvalueLocation::Stack(stack_index),
        }))
    }

    pub fn alloc_class(&mut self, name: ObjRef) -> ObjRef {
        self.alloc(HeapObject::Class(ObjClass {
            name,
            methods: Table::new(),
        }))
    }

    pub fn alloc_instance(&mut self, class: ObjRef) -> ObjRef {
        self.alloc(HeapObject::Instance(ObjInstance {
            class,
            fields: Table::new(),
        }))
    }

    pub fn alloc_bound_method(&mut self, receiver: Value, method: ObjRef) -> ObjRef {
        self.alloc(HeapObject::BoundMethod(ObjBoundMethod { receiver, method }))
    }

    // ---- typed accessors ---------------------------------------------------

    fn slot(&self, r: ObjRef) -> &HeapObject {
        &self.objects[r.0 as usize].as_ref().expect("dangling ObjRef").obj
    }

    fn slot_mut(&mut self, r: ObjRef) -> &mut HeapObject {
        &mut self.objects[r.0 as usize].as_mut().expect("dangling ObjRef").obj
    }

    pub fn get_string(&self, r: ObjRef) -> &ObjString {
        match self.slot(r) {
            HeapObject::String(s) => s,
            other => panic!("expected string, found {}", other.kind_name()),
        }
    }

    pub fn get_function(&self, r: ObjRef) -> &ObjFunction {
        match self.slot(r) {
            HeapObject::Function(f) => f,
            other => panic!("expected function, found {}", other.kind_name()),
        }
    }

    pub fn get_function_mut(&mut self, r: ObjRef) -> &mut ObjFunction {
        match self.slot_mut(r) {
            HeapObject::Function(f) => f,
            other => panic!("expected function, found {}", other.kind_name()),
        }
    }

    pub fn get_native(&self, r: ObjRef) -> &ObjNative {
        match self.slot(r) {
            HeapObject::Native(n) => n,
            other => panic!("expected native, found {}", other.kind_name()),
        }
    }

    pub fn get_closure(&self, r: ObjRef) -> &ObjClosure {
        match self.slot(r) {
            HeapObject::Closure(c) => c,
            other => panic!("expected closure, found {}", other.kind_name()),
        }
    }

    pub fn get_upvalue(&self, r: ObjRef) -> &ObjUpvalue {
        match self.slot(r) {
            HeapObject::Upvalue(u) => u,
            other => panic!("expected upvalue, found {}", other.kind_name()),
        }
    }

    pub fn get_upvalue_mut(&mut self, r: ObjRef) -> &mut ObjUpvalue {
        match self.slot_mut(r) {
            HeapObject::Upvalue(u) => u,
            other => panic!("expected upvalue, found {}", other.kind_name()),
        }
    }

    pub fn get_class(&self, r: ObjRef) -> &ObjClass {
        match self.slot(r) {
            HeapObject::Class(c) => c,
            other => panic!("expected class, found {}", other.kind_name()),
        }
    }

    pub fn get_class_mut(&mut self, r: ObjRef) -> &mut ObjClass {
        match self.slot_mut(r) {
            HeapObject::Class(c) => c,
            other => panic!("expected class, found {}", other.kind_name()),
        }
    }

    pub fn get_instance(&self, r: ObjRef) -> &ObjInstance {
        match self.slot(r) {
            HeapObject::Instance(i) => i,
            other => panic!("expected instance, found {}", other.kind_name()),
        }
    }

    pub fn get_instance_mut(&mut self, r: ObjRef) -> &mut ObjInstance {
        match self.slot_mut(r) {
            HeapObject::Instance(i) => i,
            other => panic!("expected instance, found {}", other.kind_name()),
        }
    }

    pub fn get_bound_method(&self, r: ObjRef) -> &ObjBoundMethod {
        match self.slot(r) {
            HeapObject::BoundMethod(b) => b,
            other => panic!("expected bound method, found {}", other.kind_name()),
        }
    }

    pub fn kind_name(&self, r: ObjRef) -> &'static str {
        self.slot(r).kind_name()
    }

    pub fn kind_of(&self, r: ObjRef) -> crate::object::ObjKind {
        self.slot(r).kind()
    }

    /// Render a value's textual form for `print`/string conversion,
    /// resolving heap references through the heap.
    pub fn display_value(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Obj(r) => match self.slot(r) {
                HeapObject::String(s) => s.chars.to_string(),
                HeapObject::Function(f) => match f.name {
                    Some(n) => format!("<fn {}>", self.get_string(n).chars),
                    None => "<script>".to_string(),
                },
                HeapObject::Native(_) => "<native fn>".to_string(),
                HeapObject::Closure(c) => self.display_value(Value::Obj(c.function)),
                HeapObject::Upvalue(_) => "<upvalue>".to_string(),
                HeapObject::Class(c) => self.get_string(c.name).chars.to_string(),
                HeapObject::Instance(i) => {
                    format!("{} instance", self.get_string(self.get_class(i.class).name).chars)
                }
                HeapObject::BoundMethod(b) => self.display_value(Value::Obj(b.method)),
            },
        }
    }

    // ---- mark-sweep GC -----------------------------------------------------

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    /// White -> gray: if not yet marked, mark it and push onto the gray
    /// work list so its children get traced later.
    pub fn mark_object(&mut self, r: ObjRef) {
        let Some(slot) = self.objects[r.0 as usize].as_mut() else {
            return;
        };
        if slot.marked {
            return;
        }
        slot.marked = true;
        self.gray_stack.push(r);
    }

    /// Gray -> black: mark every value this object directly owns.
    /// Children are collected into a flat `Vec<Value>` first (object refs
    /// wrapped as `Value::Obj`) so the recursive `mark_value` calls below
    /// don't need to hold a borrow of `self.slot(r)`.
    fn blacken(&mut self, r: ObjRef) {
        let mut children: Vec<Value> = Vec::new();
        match self.slot(r) {
            HeapObject::String(_) | HeapObject::Native(_) => {}
            HeapObject::Function(f) => {
                children.extend(f.chunk.constants.iter().copied());
                if let Some(name) = f.name {
                    children.push(Value::Obj(name));
                }
            }
            HeapObject::Closure(c) => {
                children.push(Value::Obj(c.function));
                children.extend(c.upvalues.iter().map(|u| Value::Obj(*u)));
            }
            HeapObject::Upvalue(u) => {
                if let UpvalueLocation::Closed(v) = u.location {
                    children.push(v);
                }
            }
            HeapObject::Class(c) => {
                children.push(Value::Obj(c.name));
                for (k, v) in c.methods.iter() {
                    children.push(Value::Obj(k));
                    children.push(v);
                }
            }
            HeapObject::Instance(i) => {
                children.push(Value::Obj(i.class));
                for (k, v) in i.fields.iter() {
                    children.push(Value::Obj(k));
                    children.push(v);
                }
            }
            HeapObject::BoundMethod(b) => {
                children.push(b.receiver);
                children.push(Value::Obj(b.method));
            }
        }
        for v in children {
            self.mark_value(v);
        }
    }

    fn trace_references(&mut self) {
        while let Some(r) = self.gray_stack.pop() {
            self.blacken(r);
        }
    }

    /// Sweep: unlink and free every unmarked object, then clear the mark
    /// bit on survivors. Runs the interning table's weak-reference
    /// fix-up first, since a white string might only be "referenced" by
    /// the intern table itself.
    fn sweep(&mut self) {
        // Weak-reference fix-up over the intern table. `objects` and
        // `strings` are disjoint fields, so this closure borrows only
        // `self.objects` while `remove_unmarked` mutably borrows only
        // `self.strings`.
        let objects = &self.objects;
        let is_marked = |r: ObjRef| objects[r.0 as usize].as_ref().map(|s| s.marked).unwrap_or(false);
        self.strings.remove_unmarked(is_marked);

        for idx in 0..self.objects.len() {
            let is_live = match &self.objects[idx] {
                Some(slot) => slot.marked,
                None => continue,
            };
            if is_live {
                self.objects[idx].as_mut().unwrap().marked = false;
            } else {
                self.free_slot(ObjRef(idx as u32));
            }
        }
    }

    pub fn collect_garbage(&mut self, roots: &dyn RootProvider) {
        roots.mark_roots(self);
        self.mark_object(self.init_string);
        self.trace_references();
        self.sweep();
        self.next_gc = self.bytes_allocated * HEAP_GROW_FACTOR;
    }

    #[cfg(test)]
    pub(crate) fn live_object_count(&self) -> usize {
        self.objects.iter().filter(|s| s.is_some()).count()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoRoots;
    impl RootProvider for NoRoots {
        fn mark_roots(&self, _heap: &mut Heap) {}
    }

    #[test]
    fn interning_returns_the_same_ref_for_equal_bytes() {
        let mut heap = Heap::new();
        let a = heap.intern_str("hello");
        let b = heap.intern_str("hello");
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_strings_get_distinct_refs() {
        let mut heap = Heap::new();
        let a = heap.intern_str("hello");
        let b = heap.intern_str("world");
        assert_ne!(a, b);
    }

    #[test]
    fn unreferenced_interned_string_is_collected_and_untabled() {
        let mut heap = Heap::new();
        let s = heap.intern_str("transient");
        assert!(heap.strings.find_string(&heap, "transient", fnv1a_hash(b"transient")).is_some());
        heap.collect_garbage(&NoRoots);
        assert!(heap.strings.find_string(&heap, "transient", fnv1a_hash(b"transient")).is_none());
        let _ = s;
    }

    #[test]
    fn rooted_object_survives_collection() {
        struct KeepOne(ObjRef);
        impl RootProvider for KeepOne {
            fn mark_roots(&self, heap: &mut Heap) {
                heap.mark_object(self.0);
            }
        }
        let mut heap = Heap::new();
        let s = heap.intern_str("kept");
        heap.collect_garbage(&KeepOne(s));
        assert_eq!(heap.get_string(s).chars.as_ref(), "kept");
    }

    #[test]
    fn fnv1a_matches_known_vector() {
        // FNV-1a 32-bit of the empty string is the offset basis itself.
        assert_eq!(fnv1a_hash(b""), 2166136261);
    }
}
