//! One active function invocation (§4.4, Glossary "Frame").

use glimmer_core::object::Handle;

pub struct CallFrame {
    /// The `ObjClosure` being executed.
    pub closure: Handle,
    /// Index of the next byte to fetch in the closure's function's chunk.
    pub ip: usize,
    /// Stack index of local slot 0 for this frame.
    pub slot_base: usize,
}
