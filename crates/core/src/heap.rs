//! Object heap, string interning, and the mark-sweep collector.
//!
//! The heap owns every object behind the [`ObjRef`] handles and threads
//! them onto an intrusive list for the sweep phase. Collection is split
//! into phases so the root owner (the VM) can drive it: the VM marks its
//! roots with [`Heap::mark_value`] / [`Heap::mark_object`] /
//! [`Heap::mark_table`], then calls [`Heap::trace_references`],
//! [`Heap::remove_white_strings`], and [`Heap::sweep`].
//!
//! The intern table holds every string but must not keep dead strings
//! alive, so its entries are swept by key mark before the object sweep.

use crate::object::{Class, Closure, Function, Instance, Native, Obj, ObjRef, StrObj, Upvalue};
use crate::table::{Table, hash_str};
use crate::value::{Value, format_number};

const GC_HEAP_GROW_FACTOR: usize = 2;
const FIRST_GC_THRESHOLD: usize = 1024 * 1024;

/// One heap cell: the object plus its GC header. `size` is the byte
/// count charged at allocation time so the sweep refunds exactly what
/// was charged.
#[derive(Debug)]
struct Slot {
    marked: bool,
    next: Option<ObjRef>,
    size: usize,
    obj: Obj,
}

/// The object heap and memory manager.
#[derive(Debug)]
pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    /// Head of the intrusive all-objects list.
    head: Option<ObjRef>,
    /// Intern set: every live string, keyed by itself.
    strings: Table,
    /// Reached-but-unscanned objects during a collection.
    gray: Vec<ObjRef>,
    bytes_allocated: usize,
    next_gc: usize,
}

impl Default for Heap {
    fn default() -> Heap {
        Heap::new()
    }
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            strings: Table::new(),
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_THRESHOLD,
        }
    }

    /// Allocate an object and link it into the all-objects list.
    ///
    /// The heap never collects on its own; callers that can enumerate
    /// roots decide when to run a collection (see [`Heap::should_collect`]).
    pub fn alloc(&mut self, obj: Obj) -> ObjRef {
        let size = obj_size(&obj);
        self.bytes_allocated += size;
        let slot = Slot {
            marked: false,
            next: self.head,
            size,
            obj,
        };
        let r = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(slot);
                ObjRef::from_raw(index)
            }
            None => {
                self.slots.push(Some(slot));
                ObjRef::from_raw((self.slots.len() - 1) as u32)
            }
        };
        self.head = Some(r);
        tracing::trace!(target: "lox_core::gc", "allocate {size} bytes for {:?}", r);
        r
    }

    /// Intern a string: return the canonical object for this content,
    /// allocating and registering it on first sight.
    pub fn intern(&mut self, chars: &str) -> ObjRef {
        let hash = hash_str(chars);
        if let Some(existing) = self.find_string(chars, hash) {
            return existing;
        }
        let r = self.alloc(Obj::Str(StrObj {
            chars: chars.into(),
            hash,
        }));
        self.strings.set(r, hash, Value::Nil);
        r
    }

    /// Content-probing lookup in the intern set (the one place where
    /// strings are compared by bytes rather than identity).
    pub fn find_string(&self, chars: &str, hash: u32) -> Option<ObjRef> {
        if self.strings.count() == 0 {
            return None;
        }
        let mask = self.strings.capacity() - 1;
        let mut index = hash as usize & mask;
        loop {
            let entry = &self.strings.entries[index];
            match entry.key {
                None => {
                    if entry.value == Value::Nil {
                        return None;
                    }
                    // Tombstone: keep probing.
                }
                Some(key) => {
                    let s = self.str_obj(key);
                    if s.hash == hash && &*s.chars == chars {
                        return Some(key);
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn next_gc(&self) -> usize {
        self.next_gc
    }

    /// True once allocation has crossed the collection threshold.
    pub fn should_collect(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }

    // --- accessors ------------------------------------------------------

    fn slot(&self, r: ObjRef) -> &Slot {
        match &self.slots[r.index()] {
            Some(slot) => slot,
            None => unreachable!("use of freed object {:?}", r),
        }
    }

    fn slot_mut(&mut self, r: ObjRef) -> &mut Slot {
        match &mut self.slots[r.index()] {
            Some(slot) => slot,
            None => unreachable!("use of freed object {:?}", r),
        }
    }

    pub fn obj(&self, r: ObjRef) -> &Obj {
        &self.slot(r).obj
    }

    pub fn as_str(&self, r: ObjRef) -> &str {
        &self.str_obj(r).chars
    }

    pub fn str_obj(&self, r: ObjRef) -> &StrObj {
        match self.obj(r) {
            Obj::Str(s) => s,
            _ => unreachable!("object is not a string"),
        }
    }

    /// Cached FNV-1a hash of an interned string.
    pub fn str_hash(&self, r: ObjRef) -> u32 {
        self.str_obj(r).hash
    }

    pub fn function(&self, r: ObjRef) -> &Function {
        match self.obj(r) {
            Obj::Function(f) => f,
            _ => unreachable!("object is not a function"),
        }
    }

    pub fn closure(&self, r: ObjRef) -> &Closure {
        match self.obj(r) {
            Obj::Closure(c) => c,
            _ => unreachable!("object is not a closure"),
        }
    }

    pub fn closure_mut(&mut self, r: ObjRef) -> &mut Closure {
        match &mut self.slot_mut(r).obj {
            Obj::Closure(c) => c,
            _ => unreachable!("object is not a closure"),
        }
    }

    pub fn upvalue(&self, r: ObjRef) -> &Upvalue {
        match self.obj(r) {
            Obj::Upvalue(u) => u,
            _ => unreachable!("object is not an upvalue"),
        }
    }

    pub fn upvalue_mut(&mut self, r: ObjRef) -> &mut Upvalue {
        match &mut self.slot_mut(r).obj {
            Obj::Upvalue(u) => u,
            _ => unreachable!("object is not an upvalue"),
        }
    }

    pub fn class(&self, r: ObjRef) -> &Class {
        match self.obj(r) {
            Obj::Class(c) => c,
            _ => unreachable!("object is not a class"),
        }
    }

    pub fn class_mut(&mut self, r: ObjRef) -> &mut Class {
        match &mut self.slot_mut(r).obj {
            Obj::Class(c) => c,
            _ => unreachable!("object is not a class"),
        }
    }

    pub fn instance(&self, r: ObjRef) -> &Instance {
        match self.obj(r) {
            Obj::Instance(i) => i,
            _ => unreachable!("object is not an instance"),
        }
    }

    pub fn instance_mut(&mut self, r: ObjRef) -> &mut Instance {
        match &mut self.slot_mut(r).obj {
            Obj::Instance(i) => i,
            _ => unreachable!("object is not an instance"),
        }
    }

    pub fn native(&self, r: ObjRef) -> &Native {
        match self.obj(r) {
            Obj::Native(n) => n,
            _ => unreachable!("object is not a native"),
        }
    }

    /// Copy-down inheritance: install every method of `from` on `to`.
    pub fn copy_methods(&mut self, from: ObjRef, to: ObjRef) {
        let methods = self.class(from).methods.live_entries();
        let subclass = self.class_mut(to);
        for (key, hash, value) in methods {
            subclass.methods.set(key, hash, value);
        }
    }

    // --- collection -----------------------------------------------------

    /// Mark a root value gray.
    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    /// Mark a root object gray (idempotent within one collection).
    pub fn mark_object(&mut self, r: ObjRef) {
        let slot = self.slot_mut(r);
        if slot.marked {
            return;
        }
        slot.marked = true;
        self.gray.push(r);
        tracing::trace!(target: "lox_core::gc", "mark {:?}", r);
    }

    /// Mark every key and value of a table held outside the heap
    /// (the VM's globals).
    pub fn mark_table(&mut self, table: &Table) {
        for (key, value) in table.iter() {
            self.mark_object(key);
            self.mark_value(value);
        }
    }

    /// Drain the gray worklist, marking each object's children by kind.
    pub fn trace_references(&mut self) {
        while let Some(r) = self.gray.pop() {
            self.blacken(r);
        }
    }

    fn blacken(&mut self, r: ObjRef) {
        tracing::trace!(target: "lox_core::gc", "blacken {:?}", r);
        let mut refs: Vec<ObjRef> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        match &self.slot(r).obj {
            Obj::Str(_) => {}
            Obj::Upvalue(Upvalue::Open(_)) => {}
            Obj::Upvalue(Upvalue::Closed(value)) => values.push(*value),
            Obj::Function(f) => {
                refs.extend(f.name);
                values.extend(f.chunk.constants.iter().copied());
            }
            Obj::Closure(c) => {
                refs.push(c.function);
                refs.extend(c.upvalues.iter().copied());
            }
            Obj::Native(n) => refs.push(n.name),
            Obj::Class(c) => {
                refs.push(c.name);
                for (key, value) in c.methods.iter() {
                    refs.push(key);
                    values.push(value);
                }
            }
            Obj::Instance(i) => {
                refs.push(i.class);
                for (key, value) in i.fields.iter() {
                    refs.push(key);
                    values.push(value);
                }
            }
            Obj::BoundMethod(b) => {
                values.push(b.receiver);
                refs.push(b.method);
            }
        }
        for value in values {
            self.mark_value(value);
        }
        for child in refs {
            self.mark_object(child);
        }
    }

    /// Drop intern entries whose string was not reached. Runs between
    /// tracing and the sweep so the table's weak keys never resurrect
    /// (or dangle into) dead strings.
    pub fn remove_white_strings(&mut self) {
        let entries = self.strings.live_entries();
        for (key, hash, _) in entries {
            if !self.slot(key).marked {
                self.strings.delete(key, hash);
            }
        }
    }

    /// Walk the intrusive object list: free unmarked objects, clear the
    /// mark on survivors, then set the next collection threshold.
    pub fn sweep(&mut self) {
        let mut prev: Option<ObjRef> = None;
        let mut cur = self.head;
        while let Some(r) = cur {
            let slot = self.slot_mut(r);
            let next = slot.next;
            if slot.marked {
                slot.marked = false;
                prev = Some(r);
            } else {
                match prev {
                    Some(p) => self.slot_mut(p).next = next,
                    None => self.head = next,
                }
                self.free_object(r);
            }
            cur = next;
        }
        self.next_gc = self.bytes_allocated * GC_HEAP_GROW_FACTOR;
    }

    fn free_object(&mut self, r: ObjRef) {
        let slot = match self.slots[r.index()].take() {
            Some(slot) => slot,
            None => unreachable!("double free of {:?}", r),
        };
        let size = slot.size;
        tracing::trace!(target: "lox_core::gc", "free {size} bytes for {:?}", r);
        self.bytes_allocated -= size;
        self.free.push(r.index() as u32);
    }

    // --- rendering ------------------------------------------------------

    /// Render a value for `print`, error messages, and disassembly.
    pub fn show_value(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(n),
            Value::Obj(r) => self.show_object(r),
        }
    }

    fn show_object(&self, r: ObjRef) -> String {
        match self.obj(r) {
            Obj::Str(s) => s.chars.to_string(),
            Obj::Function(f) => self.show_function(f),
            Obj::Closure(c) => self.show_function(self.function(c.function)),
            Obj::Upvalue(_) => "upvalue".to_string(),
            Obj::Native(_) => "<native fn>".to_string(),
            Obj::Class(c) => self.as_str(c.name).to_string(),
            Obj::Instance(i) => format!("{} instance", self.as_str(self.class(i.class).name)),
            Obj::BoundMethod(b) => {
                self.show_function(self.function(self.closure(b.method).function))
            }
        }
    }

    fn show_function(&self, f: &Function) -> String {
        match f.name {
            Some(name) => format!("<fn {}>", self.as_str(name)),
            None => "<script>".to_string(),
        }
    }
}

fn obj_size(obj: &Obj) -> usize {
    let payload = match obj {
        Obj::Str(s) => s.chars.len(),
        Obj::Function(f) => {
            f.chunk.code.len()
                + f.chunk.lines.len() * std::mem::size_of::<u32>()
                + f.chunk.constants.len() * std::mem::size_of::<Value>()
        }
        Obj::Closure(c) => c.upvalues.len() * std::mem::size_of::<ObjRef>(),
        _ => 0,
    };
    std::mem::size_of::<Slot>() + payload
}
