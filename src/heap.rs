//! # Heap — tagged-arena allocator and mark-sweep collector
//!
//! Every heap object in this VM (strings, functions, closures, upvalues,
//! classes, instances, bound methods) lives in one arena, addressed by an
//! [`ObjRef`] index rather than a raw pointer. This sidesteps the `unsafe`
//! a pointer-chasing, intrusively-linked mark-sweep collector would need in
//! safe Rust: sweeping never moves anything, so an `ObjRef` a caller is
//! still holding is either still valid or it was never reachable and the
//! caller shouldn't have had it.
//!
//! Freed slots are threaded onto a freelist populated by [`Heap::sweep`],
//! so a long-running program with high allocation/collection turnover
//! reuses arena indices instead of growing the `Vec` unboundedly — the
//! arena equivalent of the global-allocation-list-with-next-pointer shape
//! a pointer-based collector would use.
//!
//! Collection is mark-sweep, tri-color, with an explicit gray worklist
//! ([`Heap::gray`]) rather than recursion, so tracing a deep object graph
//! can't overflow the native stack. A collection may only happen at an
//! allocation call site: [`Heap::maybe_collect`] is that single entry
//! point, and every `alloc_*` method is required to call it first.

use std::collections::BTreeMap;

use crate::value::{
    BoundMethodObj, ClassObj, ClosureObj, FunctionObj, InstanceObj, NativeFn, NativeObj, Object,
    ObjRef, UpvalueLoc, UpvalueObj, Value,
};

/// Rough, fixed per-object cost used to drive the allocation-triggered GC
/// threshold. The collector doesn't need an exact byte count, only a
/// monotonic proxy for "how much garbage exists" — one unit per object
/// keeps the arithmetic simple and host-independent.
const OBJECT_COST: usize = 1;

enum Slot {
    Occupied { marked: bool, object: Object },
    Free { next: Option<u32> },
}

pub struct Heap {
    slots: Vec<Slot>,
    free_head: Option<u32>,
    gray: Vec<ObjRef>,
    bytes_allocated: usize,
    next_gc: usize,
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            slots: Vec::new(),
            free_head: None,
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: 1024 * OBJECT_COST,
        }
    }

    fn insert(&mut self, object: Object) -> ObjRef {
        self.bytes_allocated += OBJECT_COST;
        if let Some(index) = self.free_head {
            let next = match &self.slots[index as usize] {
                Slot::Free { next } => *next,
                Slot::Occupied { .. } => unreachable!("freelist points at a live slot"),
            };
            self.free_head = next;
            self.slots[index as usize] = Slot::Occupied {
                marked: false,
                object,
            };
            ObjRef(index)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot::Occupied {
                marked: false,
                object,
            });
            ObjRef(index)
        }
    }

    /// Returns true once allocated cost has caught up with the threshold
    /// set by the previous collection (or the initial default, before the
    /// first one). Every `alloc_*` method checks this before inserting.
    pub fn should_collect(&self) -> bool {
        self.bytes_allocated >= self.next_gc
    }

    /// Runs a full mark-sweep pass. `mark_roots` is supplied by the caller
    /// (the VM, optionally composed with the active compiler chain) since
    /// the heap itself has no notion of what's a root; it only knows how to
    /// mark and trace once seeded.
    pub fn collect_garbage(&mut self, mark_roots: impl FnOnce(&mut Heap)) {
        mark_roots(self);
        self.trace_references();
        self.sweep();
        self.next_gc = self.bytes_allocated.max(1) * 2;
    }

    pub fn mark(&mut self, r: ObjRef) {
        if let Some(Slot::Occupied { marked, .. }) = self.slots.get_mut(r.0 as usize) {
            if !*marked {
                *marked = true;
                self.gray.push(r);
            }
        }
    }

    pub fn mark_value(&mut self, v: Value) {
        if let Value::Obj(r) = v {
            self.mark(r);
        }
    }

    fn trace_references(&mut self) {
        while let Some(r) = self.gray.pop() {
            self.blacken(r);
        }
    }

    /// Visits `r`'s outgoing references and marks each of them. The refs
    /// are collected into small local vectors first so this doesn't need
    /// to hold a borrow of `self.slots` while calling back into `self.mark`.
    fn blacken(&mut self, r: ObjRef) {
        let (obj_refs, values): (Vec<ObjRef>, Vec<Value>) = match self.get(r) {
            Object::Str(_) | Object::Native(_) => (Vec::new(), Vec::new()),
            Object::Function(f) => {
                let vals: Vec<Value> = f.chunk.constants.clone();
                (Vec::new(), vals)
            }
            Object::Closure(c) => {
                let mut refs = c.upvalues.clone();
                refs.push(c.function);
                (refs, Vec::new())
            }
            Object::Upvalue(u) => match u.location {
                UpvalueLoc::Closed(v) => (Vec::new(), vec![v]),
                UpvalueLoc::Open(_) => (Vec::new(), Vec::new()),
            },
            Object::Class(c) => (c.methods.values().copied().collect(), Vec::new()),
            Object::Instance(inst) => {
                let refs: Vec<ObjRef> = inst.class.into_iter().collect();
                (refs, inst.fields.values().copied().collect())
            }
            Object::BoundMethod(bm) => (vec![bm.closure], vec![bm.receiver]),
        };
        for r in obj_refs {
            self.mark(r);
        }
        for v in values {
            self.mark_value(v);
        }
    }

    fn sweep(&mut self) {
        for index in 0..self.slots.len() {
            if let Slot::Occupied { marked, .. } = &mut self.slots[index] {
                if *marked {
                    *marked = false;
                } else {
                    self.slots[index] = Slot::Free {
                        next: self.free_head,
                    };
                    self.free_head = Some(index as u32);
                    self.bytes_allocated = self.bytes_allocated.saturating_sub(OBJECT_COST);
                }
            }
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    // --- typed accessors -------------------------------------------------

    pub fn get(&self, r: ObjRef) -> &Object {
        match &self.slots[r.0 as usize] {
            Slot::Occupied { object, .. } => object,
            Slot::Free { .. } => panic!("dangling ObjRef {}", r.0),
        }
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Object {
        match &mut self.slots[r.0 as usize] {
            Slot::Occupied { object, .. } => object,
            Slot::Free { .. } => panic!("dangling ObjRef {}", r.0),
        }
    }

    pub fn string(&self, r: ObjRef) -> &str {
        match self.get(r) {
            Object::Str(s) => s.as_str(),
            other => panic!("expected string, found {}", other.kind_name()),
        }
    }

    pub fn function(&self, r: ObjRef) -> &FunctionObj {
        match self.get(r) {
            Object::Function(f) => f,
            other => panic!("expected function, found {}", other.kind_name()),
        }
    }

    pub fn function_mut(&mut self, r: ObjRef) -> &mut FunctionObj {
        match self.get_mut(r) {
            Object::Function(f) => f,
            other => panic!("expected function, found {}", other.kind_name()),
        }
    }

    pub fn closure(&self, r: ObjRef) -> &ClosureObj {
        match self.get(r) {
            Object::Closure(c) => c,
            other => panic!("expected closure, found {}", other.kind_name()),
        }
    }

    pub fn closure_mut(&mut self, r: ObjRef) -> &mut ClosureObj {
        match self.get_mut(r) {
            Object::Closure(c) => c,
            other => panic!("expected closure, found {}", other.kind_name()),
        }
    }

    pub fn class(&self, r: ObjRef) -> &ClassObj {
        match self.get(r) {
            Object::Class(c) => c,
            other => panic!("expected class, found {}", other.kind_name()),
        }
    }

    pub fn class_mut(&mut self, r: ObjRef) -> &mut ClassObj {
        match self.get_mut(r) {
            Object::Class(c) => c,
            other => panic!("expected class, found {}", other.kind_name()),
        }
    }

    pub fn instance(&self, r: ObjRef) -> &InstanceObj {
        match self.get(r) {
            Object::Instance(i) => i,
            other => panic!("expected instance, found {}", other.kind_name()),
        }
    }

    pub fn instance_mut(&mut self, r: ObjRef) -> &mut InstanceObj {
        match self.get_mut(r) {
            Object::Instance(i) => i,
            other => panic!("expected instance, found {}", other.kind_name()),
        }
    }

    pub fn upvalue(&self, r: ObjRef) -> &UpvalueObj {
        match self.get(r) {
            Object::Upvalue(u) => u,
            other => panic!("expected upvalue, found {}", other.kind_name()),
        }
    }

    pub fn upvalue_mut(&mut self, r: ObjRef) -> &mut UpvalueObj {
        match self.get_mut(r) {
            Object::Upvalue(u) => u,
            other => panic!("expected upvalue, found {}", other.kind_name()),
        }
    }

    // --- allocation --------------------------------------------------------
    //
    // Each of these is a GC safety point: `maybe_collect` runs *before* the
    // new object is inserted, so the value being constructed is never
    // itself visible to the collector it might trigger. Callers that chain
    // several allocations together (e.g. building an array literal) must
    // push already-built intermediate values onto the operand stack first,
    // so they're reachable as roots across the next allocation.

    pub fn alloc_string(&mut self, s: String, mark_roots: impl FnOnce(&mut Heap)) -> ObjRef {
        self.maybe_collect(mark_roots);
        self.insert(Object::Str(s))
    }

    pub fn alloc_function(
        &mut self,
        f: FunctionObj,
        mark_roots: impl FnOnce(&mut Heap),
    ) -> ObjRef {
        self.maybe_collect(mark_roots);
        self.insert(Object::Function(f))
    }

    pub fn alloc_native(
        &mut self,
        name: &'static str,
        arity: u8,
        func: NativeFn,
    ) -> ObjRef {
        // Natives are installed once at startup before any collection
        // could plausibly run; no roots to seed.
        self.maybe_collect(|_| {});
        self.insert(Object::Native(NativeObj { name, arity, func }))
    }

    pub fn alloc_closure(&mut self, c: ClosureObj, mark_roots: impl FnOnce(&mut Heap)) -> ObjRef {
        self.maybe_collect(mark_roots);
        self.insert(Object::Closure(c))
    }

    pub fn alloc_upvalue(&mut self, slot: usize, mark_roots: impl FnOnce(&mut Heap)) -> ObjRef {
        self.maybe_collect(mark_roots);
        self.insert(Object::Upvalue(UpvalueObj {
            location: UpvalueLoc::Open(slot),
        }))
    }

    pub fn alloc_class(&mut self, name: String, mark_roots: impl FnOnce(&mut Heap)) -> ObjRef {
        self.maybe_collect(mark_roots);
        self.insert(Object::Class(ClassObj {
            name,
            methods: BTreeMap::new(),
        }))
    }

    pub fn alloc_instance(
        &mut self,
        class: Option<ObjRef>,
        mark_roots: impl FnOnce(&mut Heap),
    ) -> ObjRef {
        self.maybe_collect(mark_roots);
        self.insert(Object::Instance(InstanceObj {
            class,
            fields: BTreeMap::new(),
        }))
    }

    pub fn alloc_bound_method(
        &mut self,
        receiver: Value,
        closure: ObjRef,
        mark_roots: impl FnOnce(&mut Heap),
    ) -> ObjRef {
        self.maybe_collect(mark_roots);
        self.insert(Object::BoundMethod(BoundMethodObj { receiver, closure }))
    }

    fn maybe_collect(&mut self, mark_roots: impl FnOnce(&mut Heap)) {
        if self.should_collect() {
            self.collect_garbage(mark_roots);
        }
    }
}

impl Default for Heap {
    fn default() -> Heap {
        Heap::new()
    }
}
