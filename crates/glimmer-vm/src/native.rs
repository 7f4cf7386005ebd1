//! Host-provided native functions (§6: "the host may register `(name, fn)`
//! entries"). Only `clock()` is required by the spec; it is installed by
//! default and can be skipped via [`crate::vm::VmOptions::install_stdlib`].

use std::time::Instant;

use glimmer_core::value::Value;

/// Seconds elapsed since this native was first installed, as an `f64`.
/// clox measures wall-clock time since process start; we anchor to
/// first-use instead since Rust has no portable "process start" instant.
pub fn clock(_args: &[Value]) -> Result<Value, String> {
    use std::sync::OnceLock;
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    Ok(Value::Number(start.elapsed().as_secs_f64()))
}
