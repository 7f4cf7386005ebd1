//! Errors raised by the core crate itself (chunk/constant-pool bookkeeping).
//!
//! Compile-time diagnostics and VM runtime errors are *not* routed through
//! this type — they have their own user-facing representations in
//! `glimmer-compiler` and `glimmer-vm` respectively (see SPEC_FULL.md
//! §10.1). `CoreError` only covers invariant violations inside `Chunk`.

use thiserror::Error;

/// Errors produced while building or reading a [`crate::chunk::Chunk`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoreError {
    /// A chunk's constant pool is capped at 256 entries (u8 operand width).
    #[error("too many constants in one chunk (max 256)")]
    TooManyConstants,

    /// `JUMP`/`JUMP_IF_FALSE`/`LOOP` operands are unsigned 16-bit.
    #[error("jump distance too large to encode (max 65535)")]
    JumpTooLarge,
}

pub type CoreResult<T> = Result<T, CoreError>;
