//! The VM's user-facing status (§6, §7). This is a plain three-way enum,
//! not a `thiserror` chain — runtime failures are reported to stderr as
//! they happen (with a stack trace) and collapse to one status value; there
//! is no user-level catch to hand a richer error object to (§7).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}
