//! Compile-error collection in panic-mode, matching §7's model: the first
//! error in a statement latches `panic_mode`; further errors are swallowed
//! until `synchronize` resets at the next statement boundary.

/// One rendered diagnostic line, `"[line N] Error[ at TOK]: MESSAGE"` (§6).
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub line: u32,
    pub rendered: String,
}

#[derive(Debug, Default)]
pub struct Diagnostics {
    pub had_error: bool,
    pub panic_mode: bool,
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, line: u32, location: &str, message: &str) {
        self.had_error = true;
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.entries.push(Diagnostic { line, rendered: format!("[line {line}] Error{location}: {message}") });
    }

    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    /// Writes every collected diagnostic to stderr, one per line (§6).
    pub fn report_to_stderr(&self) {
        for entry in &self.entries {
            eprintln!("{}", entry.rendered);
        }
    }
}
