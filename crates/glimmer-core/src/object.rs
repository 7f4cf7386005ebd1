//! Heap object model: a single arena of tagged [`Obj`] variants addressed
//! by [`Handle`], plus the allocator that tracks `bytes_allocated` for the
//! GC's growth heuristic (§4.5).
//!
//! There is no `next`-pointer intrusive list here (Design Notes §9): the
//! arena's own `Vec` index *is* the intrusive list, and sweep walks the
//! arena directly instead of following `next` pointers. Freed slots are
//! pushed onto a free list and reused by later allocations.

use crate::chunk::Chunk;
use crate::table::Table;
use crate::value::Value;

/// A non-owning reference into a [`Heap`] arena. Two handles are equal iff
/// they name the same arena slot; after string interning, content-equal
/// strings always share one handle (invariant 2 in §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u32);

impl Handle {
    pub fn index(self) -> u32 {
        self.0
    }
}

pub type NativeFn = fn(args: &[Value]) -> Result<Value, String>;

#[derive(Debug)]
pub struct ObjString {
    pub chars: Box<str>,
    pub hash: u32,
}

#[derive(Debug)]
pub struct ObjFunction {
    pub arity: u8,
    pub upvalue_count: u8,
    pub chunk: Chunk,
    /// `None` for the synthetic top-level script function.
    pub name: Option<Handle>,
}

pub struct ObjNative {
    pub name: Handle,
    pub arity: u8,
    pub function: NativeFn,
}

impl std::fmt::Debug for ObjNative {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjNative").field("name", &self.name).finish()
    }
}

#[derive(Debug)]
pub struct ObjClosure {
    pub function: Handle,
    pub upvalues: Vec<Handle>,
}

/// Open while `location` is `Open(slot)` indexing into the live value
/// stack; closed once the enclosing scope exits and the value has been
/// copied into `Closed`.
#[derive(Debug)]
pub enum UpvalueLocation {
    Open(usize),
    Closed(Value),
}

#[derive(Debug)]
pub struct ObjUpvalue {
    pub location: UpvalueLocation,
}

#[derive(Debug)]
pub struct ObjClass {
    pub name: Handle,
    pub methods: Table,
}

#[derive(Debug)]
pub struct ObjInstance {
    pub class: Handle,
    pub fields: Table,
}

#[derive(Debug)]
pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: Handle,
}

#[derive(Debug)]
pub enum Obj {
    String(ObjString),
    Function(ObjFunction),
    Native(ObjNative),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
}

impl Obj {
    pub fn type_name(&self) -> &'static str {
        match self {
            Obj::String(_) => "string",
            Obj::Function(_) => "function",
            Obj::Native(_) => "native",
            Obj::Closure(_) => "closure",
            Obj::Upvalue(_) => "upvalue",
            Obj::Class(_) => "class",
            Obj::Instance(_) => "instance",
            Obj::BoundMethod(_) => "bound method",
        }
    }

    pub fn as_string(&self) -> Option<&ObjString> {
        match self {
            Obj::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&ObjFunction> {
        match self {
            Obj::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_function_mut(&mut self) -> Option<&mut ObjFunction> {
        match self {
            Obj::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_closure(&self) -> Option<&ObjClosure> {
        match self {
            Obj::Closure(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_class(&self) -> Option<&ObjClass> {
        match self {
            Obj::Class(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_instance(&self) -> Option<&ObjInstance> {
        match self {
            Obj::Instance(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_instance_mut(&mut self) -> Option<&mut ObjInstance> {
        match self {
            Obj::Instance(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_class_mut(&mut self) -> Option<&mut ObjClass> {
        match self {
            Obj::Class(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_closure_mut(&mut self) -> Option<&mut ObjClosure> {
        match self {
            Obj::Closure(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_upvalue_mut(&mut self) -> Option<&mut ObjUpvalue> {
        match self {
            Obj::Upvalue(u) => Some(u),
            _ => None,
        }
    }

    pub fn as_bound_method(&self) -> Option<&ObjBoundMethod> {
        match self {
            Obj::BoundMethod(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_native(&self) -> Option<&ObjNative> {
        match self {
            Obj::Native(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_upvalue(&self) -> Option<&ObjUpvalue> {
        match self {
            Obj::Upvalue(u) => Some(u),
            _ => None,
        }
    }

    /// Renders the way `print` shows this value (§6): functions as
    /// `<fn NAME>`/`<script>`, classes by name, instances as `NAME
    /// instance`, bound methods as `<fn NAME>`.
    pub fn render(&self, heap: &Heap) -> String {
        match self {
            Obj::String(s) => s.chars.to_string(),
            Obj::Function(f) => match f.name {
                Some(n) => format!("<fn {}>", heap.get(n).as_string().unwrap().chars),
                None => "<script>".to_string(),
            },
            Obj::Native(n) => format!("<native fn {}>", heap.get(n.name).as_string().unwrap().chars),
            Obj::Closure(c) => heap.get(c.function).render(heap),
            Obj::Upvalue(_) => "upvalue".to_string(),
            Obj::Class(c) => heap.get(c.name).as_string().unwrap().chars.to_string(),
            Obj::Instance(i) => {
                let class = heap.get(i.class).as_class().unwrap();
                format!("{} instance", heap.get(class.name).as_string().unwrap().chars)
            }
            Obj::BoundMethod(b) => heap.get(b.method).render(heap),
        }
    }
}

struct Slot {
    marked: bool,
    obj: Obj,
}

/// FNV-1a, 32-bit, matching §3's required string hash.
pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// The object arena. Owns every live heap object; a [`Handle`] is only
/// ever valid against the `Heap` that produced it.
pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    strings: Table,
    pub bytes_allocated: usize,
    pub next_gc: usize,
}

const INITIAL_NEXT_GC: usize = 1024 * 1024;

impl Heap {
    pub fn new() -> Self {
        Heap {
            slots: Vec::new(),
            free: Vec::new(),
            strings: Table::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_NEXT_GC,
        }
    }

    fn alloc(&mut self, obj: Obj, size: usize) -> Handle {
        self.bytes_allocated += size;
        let slot = Some(Slot { marked: false, obj });
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = slot;
            Handle(idx)
        } else {
            self.slots.push(slot);
            Handle((self.slots.len() - 1) as u32)
        }
    }

    pub fn get(&self, handle: Handle) -> &Obj {
        &self.slots[handle.0 as usize].as_ref().expect("dangling handle").obj
    }

    pub fn get_mut(&mut self, handle: Handle) -> &mut Obj {
        &mut self.slots[handle.0 as usize].as_mut().expect("dangling handle").obj
    }

    pub fn is_marked(&self, handle: Handle) -> bool {
        self.slots[handle.0 as usize].as_ref().map(|s| s.marked).unwrap_or(false)
    }

    /// Marks an object, returning `true` the first time (so callers can
    /// push it onto the gray stack) and `false` on repeat marks — marking
    /// is idempotent (§8).
    pub fn mark_object(&mut self, handle: Handle) -> bool {
        let slot = self.slots[handle.0 as usize].as_mut().expect("dangling handle");
        if slot.marked {
            false
        } else {
            slot.marked = true;
            true
        }
    }

    /// Sweeps every unmarked slot, freeing it and updating
    /// `bytes_allocated`; every surviving slot has its mark cleared for the
    /// next cycle (§4.5).
    pub fn sweep(&mut self) {
        for idx in 0..self.slots.len() {
            match &mut self.slots[idx] {
                Some(slot) if slot.marked => slot.marked = false,
                Some(_) => {
                    if let Some(slot) = self.slots[idx].take() {
                        self.bytes_allocated = self.bytes_allocated.saturating_sub(obj_size(&slot.obj));
                    }
                    self.free.push(idx as u32);
                }
                None => {}
            }
        }
    }

    /// Interns a string by content, allocating a new `ObjString` only if no
    /// equal-content string already lives in the intern table (invariant 2
    /// in §3). Returns the canonical handle either way.
    pub fn intern_string(&mut self, s: &str) -> Handle {
        let hash = fnv1a(s.as_bytes());
        if let Some(existing) = self.strings.find_string(self, s, hash) {
            return existing;
        }
        let handle = self.alloc(
            Obj::String(ObjString { chars: s.into(), hash }),
            std::mem::size_of::<ObjString>() + s.len(),
        );
        self.strings.set(handle, hash, Value::Bool(true));
        handle
    }

    /// The cached FNV-1a hash of a string object; every [`Table`] operation
    /// except [`Table::find_string`] takes this as an explicit parameter.
    pub fn hash_of(&self, handle: Handle) -> u32 {
        self.get(handle).as_string().expect("hash_of on a non-string handle").hash
    }

    pub fn alloc_function(&mut self, f: ObjFunction) -> Handle {
        self.alloc(Obj::Function(f), std::mem::size_of::<ObjFunction>())
    }

    pub fn alloc_native(&mut self, n: ObjNative) -> Handle {
        self.alloc(Obj::Native(n), std::mem::size_of::<ObjNative>())
    }

    pub fn alloc_closure(&mut self, c: ObjClosure) -> Handle {
        self.alloc(Obj::Closure(c), std::mem::size_of::<ObjClosure>())
    }

    pub fn alloc_upvalue(&mut self, u: ObjUpvalue) -> Handle {
        self.alloc(Obj::Upvalue(u), std::mem::size_of::<ObjUpvalue>())
    }

    pub fn alloc_class(&mut self, c: ObjClass) -> Handle {
        self.alloc(Obj::Class(c), std::mem::size_of::<ObjClass>())
    }

    pub fn alloc_instance(&mut self, i: ObjInstance) -> Handle {
        self.alloc(Obj::Instance(i), std::mem::size_of::<ObjInstance>())
    }

    pub fn alloc_bound_method(&mut self, b: ObjBoundMethod) -> Handle {
        self.alloc(Obj::BoundMethod(b), std::mem::size_of::<ObjBoundMethod>())
    }

    /// Drops intern-table entries whose string is unreachable, so a weak
    /// reference from the intern table can never resurrect garbage (§3
    /// Lifecycles, §4.5 "white-string pruning").
    pub fn prune_unmarked_strings(&mut self) {
        let slots = &self.slots;
        self.strings.remove_white(&mut |key| {
            slots[key.index() as usize].as_ref().map(|s| s.marked).unwrap_or(false)
        });
    }

    pub fn string_table_mut(&mut self) -> &mut Table {
        &mut self.strings
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

fn obj_size(obj: &Obj) -> usize {
    match obj {
        Obj::String(s) => std::mem::size_of::<ObjString>() + s.chars.len(),
        Obj::Function(_) => std::mem::size_of::<ObjFunction>(),
        Obj::Native(_) => std::mem::size_of::<ObjNative>(),
        Obj::Closure(c) => std::mem::size_of::<ObjClosure>() + c.upvalues.len() * 4,
        Obj::Upvalue(_) => std::mem::size_of::<ObjUpvalue>(),
        Obj::Class(_) => std::mem::size_of::<ObjClass>(),
        Obj::Instance(_) => std::mem::size_of::<ObjInstance>(),
        Obj::BoundMethod(_) => std::mem::size_of::<ObjBoundMethod>(),
    }
}
