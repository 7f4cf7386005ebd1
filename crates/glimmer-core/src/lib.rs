//! glimmer-core — value model, heap/object model, hash table, string
//! interning, and the tracing garbage collector.
//!
//! This crate has no notion of frames, a call stack, or a compiler; it is
//! the leaf layer everything else builds on (`glimmer-compiler` emits
//! `Chunk`s, `glimmer-vm` drives `Heap::collect_garbage` with its own live
//! roots via [`gc::GcRoots`]).

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

pub mod chunk;
pub mod error;
pub mod gc;
pub mod object;
pub mod table;
pub mod value;

pub mod prelude {
    pub use crate::chunk::{disassemble_chunk, disassemble_instruction, Chunk, OpCode};
    pub use crate::error::{CoreError, CoreResult};
    pub use crate::gc::GcRoots;
    pub use crate::object::{
        fnv1a, Handle, Heap, NativeFn, Obj, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction,
        ObjInstance, ObjNative, ObjString, ObjUpvalue, UpvalueLocation,
    };
    pub use crate::table::Table;
    pub use crate::value::{format_number, Value};
}

#[cfg(test)]
mod tests {
    use crate::object::{Heap, ObjFunction};
    use crate::value::Value;

    #[test]
    fn string_interning_is_identity() {
        let mut heap = Heap::new();
        let a = heap.intern_string("hello");
        let b = heap.intern_string("hello");
        assert_eq!(a, b, "content-equal strings must be the same object");
    }

    #[test]
    fn distinct_strings_get_distinct_handles() {
        let mut heap = Heap::new();
        let a = heap.intern_string("foo");
        let b = heap.intern_string("bar");
        assert_ne!(a, b);
    }

    #[test]
    fn marking_is_idempotent() {
        let mut heap = Heap::new();
        let h = heap.intern_string("x");
        let mut gray = Vec::new();
        heap.mark_handle(&mut gray, h);
        assert_eq!(gray.len(), 1);
        gray.clear();
        heap.mark_handle(&mut gray, h);
        assert!(gray.is_empty(), "re-marking an already-marked object pushes nothing new");
    }

    #[test]
    fn sweep_frees_unreached_objects() {
        let mut heap = Heap::new();
        let before = heap.bytes_allocated;
        let _garbage = heap.intern_string("unreached");
        assert!(heap.bytes_allocated > before);
        heap.sweep(); // nothing marked, so sweep should reclaim it
        assert_eq!(heap.bytes_allocated, before);
    }

    #[test]
    fn function_renders_as_script_without_a_name() {
        let mut heap = Heap::new();
        let f = heap.alloc_function(ObjFunction {
            arity: 0,
            upvalue_count: 0,
            chunk: crate::chunk::Chunk::new(),
            name: None,
        });
        assert_eq!(Value::Object(f).render(&heap), "<script>");
    }
}
