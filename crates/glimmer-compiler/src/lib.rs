//! glimmer-compiler — tokenizer and single-pass Pratt compiler.
//!
//! Turns source text directly into a [`glimmer_core::chunk::Chunk`] wrapped
//! in an `ObjFunction`, with no intermediate AST (§4.3). Depends only on
//! `glimmer-core` for the value/object model it emits bytecode against.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

mod compiler;
mod diagnostics;
mod lexer;

pub use compiler::{compile, FunctionType, NoExtraRoots};
pub use diagnostics::{Diagnostic, Diagnostics};
pub use lexer::{Lexer, Token, TokenKind};

#[cfg(test)]
mod tests {
    use super::*;
    use glimmer_core::object::Heap;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    fn compile_ok(source: &str) -> (glimmer_core::object::Handle, Heap) {
        let mut heap = Heap::new();
        let mut extra = NoExtraRoots;
        let (func, diags) = compile(source, &mut heap, &mut extra);
        assert!(!diags.had_error, "unexpected compile errors: {:?}", diags.entries());
        (func.expect("compile_ok expects success"), heap)
    }

    #[test]
    fn compiles_arithmetic_and_print() {
        compile_ok("print 1 + 2 * 3;");
    }

    #[test]
    fn compiles_closures() {
        compile_ok("fun makeAdder(x) { fun add(y) { return x + y; } return add; }");
    }

    #[test]
    fn compiles_classes_and_inheritance() {
        compile_ok(indoc! {r#"
            class A { greet() { print "hi"; } }
            class B < A { greet() { super.greet(); } }
        "#});
    }

    #[test]
    fn rejects_reading_own_initializer() {
        let mut heap = Heap::new();
        let mut extra = NoExtraRoots;
        let (func, diags) = compile("{ var a = a; }", &mut heap, &mut extra);
        assert!(func.is_none());
        assert!(diags.had_error);
    }

    #[test]
    fn rejects_invalid_assignment_target() {
        let mut heap = Heap::new();
        let mut extra = NoExtraRoots;
        let (func, diags) = compile("fun a(b) { return b; } a(1) = 2;", &mut heap, &mut extra);
        assert!(func.is_none());
        assert!(diags.had_error);
    }

    #[test]
    fn bang_emits_a_single_not() {
        // Regression test for the source's missing `break` after OP_NOT
        // (§9): `!true;` must not also emit OP_NEGATE.
        let (func, heap) = compile_ok("!true;");
        let chunk = &heap.get(func).as_function().unwrap().chunk;
        let negate_count = chunk
            .code()
            .iter()
            .filter(|&&b| glimmer_core::chunk::OpCode::from_byte(b) == Some(glimmer_core::chunk::OpCode::Negate))
            .count();
        assert_eq!(negate_count, 0, "unary `!` must not also emit OP_NEGATE");
    }

    #[test]
    fn too_many_locals_is_a_compile_error() {
        let mut source = String::from("{ ");
        for i in 0..257 {
            source.push_str(&format!("var v{i} = {i};\n"));
        }
        source.push('}');
        let mut heap = Heap::new();
        let mut extra = NoExtraRoots;
        let (func, diags) = compile(&source, &mut heap, &mut extra);
        assert!(func.is_none());
        assert!(diags.had_error);
    }
}
