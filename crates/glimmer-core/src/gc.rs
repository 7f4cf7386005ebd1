//! Tri-color mark-sweep collector (§4.5).
//!
//! `Heap` owns the arena and the allocation accounting; it does not own the
//! VM's stack, call frames, globals, or the compiler's in-progress function
//! chain — those live in `glimmer-vm`/`glimmer-compiler`. Each registers its
//! roots by implementing [`GcRoots`], so the collector never needs a single
//! global `vm` the way the reference implementation does (Design Notes §9).

use crate::object::{Handle, Heap, Obj};
use crate::value::Value;

/// Implemented by anything that holds GC roots (the VM's live state, the
/// compiler's chain of in-progress functions). `mark_roots` should call
/// `heap.mark_value` for every root value/handle it holds.
pub trait GcRoots {
    fn mark_roots(&mut self, heap: &mut Heap, gray: &mut Vec<Handle>);
}

const GC_HEAP_GROW_FACTOR: usize = 2;

impl Heap {
    /// Marks `value`; if it is an object newly marked (not already black or
    /// gray), pushes its handle onto the gray worklist. Marking is
    /// idempotent (§8).
    pub fn mark_value(&mut self, gray: &mut Vec<Handle>, value: Value) {
        if let Value::Object(handle) = value {
            self.mark_handle(gray, handle);
        }
    }

    pub fn mark_handle(&mut self, gray: &mut Vec<Handle>, handle: Handle) {
        if self.mark_object(handle) {
            gray.push(handle);
        }
    }

    /// Pops gray objects one at a time and blackens them: marks every
    /// outgoing reference named in §4.5's table, which may push more
    /// objects onto the gray stack.
    pub fn trace_references(&mut self, gray: &mut Vec<Handle>) {
        while let Some(handle) = gray.pop() {
            self.blacken(handle, gray);
        }
    }

    fn blacken(&mut self, handle: Handle, gray: &mut Vec<Handle>) {
        // Outgoing references are read before any further marking so we
        // never hold a borrow of `self` across mark calls.
        enum Refs {
            None,
            One(Handle),
            Values(Vec<Value>),
            Handles(Vec<Handle>),
        }

        let refs = match self.get(handle) {
            Obj::String(_) | Obj::Native(_) => Refs::None,
            Obj::Upvalue(u) => match u.location {
                crate::object::UpvalueLocation::Closed(v) => Refs::Values(vec![v]),
                crate::object::UpvalueLocation::Open(_) => Refs::None,
            },
            Obj::Function(f) => {
                let mut vs: Vec<Value> = f.name.into_iter().map(Value::Object).collect();
                vs.extend(f.chunk.constants().iter().copied());
                Refs::Values(vs)
            }
            Obj::Closure(c) => {
                let mut hs = vec![c.function];
                hs.extend(c.upvalues.iter().copied());
                Refs::Handles(hs)
            }
            Obj::Class(c) => {
                let mut vs = vec![Value::Object(c.name)];
                c.methods.mark(&mut |v| vs.push(v));
                Refs::Values(vs)
            }
            Obj::Instance(i) => {
                let mut vs = vec![Value::Object(i.class)];
                i.fields.mark(&mut |v| vs.push(v));
                Refs::Values(vs)
            }
            Obj::BoundMethod(b) => {
                let mut vs = vec![b.receiver];
                vs.push(Value::Object(b.method));
                Refs::Values(vs)
            }
        };

        match refs {
            Refs::None => {}
            Refs::One(h) => self.mark_handle(gray, h),
            Refs::Values(vs) => {
                for v in vs {
                    self.mark_value(gray, v);
                }
            }
            Refs::Handles(hs) => {
                for h in hs {
                    self.mark_handle(gray, h);
                }
            }
        }
    }

    /// True once `bytes_allocated` has grown past `next_gc`; callers should
    /// run a collection before the next allocation when this holds.
    pub fn should_collect(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }

    /// Runs one full mark-trace-sweep cycle rooted at `roots`, then grows
    /// `next_gc` by the fixed 2x factor (§4.5).
    pub fn collect_garbage(&mut self, roots: &mut dyn GcRoots) {
        #[cfg(feature = "tracing")]
        let before = self.bytes_allocated;

        let mut gray = Vec::new();
        roots.mark_roots(self, &mut gray);
        self.trace_references(&mut gray);
        self.prune_unmarked_strings();
        self.sweep();
        self.next_gc = self.bytes_allocated * GC_HEAP_GROW_FACTOR;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            collected = before.saturating_sub(self.bytes_allocated),
            next_gc = self.next_gc,
            "gc cycle"
        );
    }

    /// Convenience for allocation call sites: collect first if we're over
    /// budget, mirroring the reference's inline `reallocate`-triggered GC.
    pub fn maybe_collect(&mut self, roots: &mut dyn GcRoots) {
        if self.should_collect() {
            self.collect_garbage(roots);
        }
    }
}
