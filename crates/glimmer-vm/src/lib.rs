//! Call-frame execution engine for compiled Glimmer bytecode (§4, §6).
//!
//! [`Vm::interpret`] runs [`glimmer_compiler::compile`] over a source string
//! and executes the result; [`InterpretResult`] is the three-way status a
//! host checks afterward (§7 — there is no richer error object, runtime
//! failures are reported to stderr as they happen).

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

mod error;
mod frame;
mod native;
mod vm;

pub use error::InterpretResult;
pub use vm::{DefaultHost, Host, StringHost, Vm, VmOptions, FRAMES_MAX, STACK_MAX};

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn run(source: &str) -> (InterpretResult, String) {
        let mut vm: Vm<StringHost> = Vm::new(VmOptions::default());
        let result = vm.interpret(source);
        (result, vm.host_output().to_string())
    }

    #[test]
    fn arithmetic_and_print() {
        let (result, output) = run("print 1 + 2 * 3;");
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(output, "7\n");
    }

    #[test]
    fn string_concatenation() {
        let (result, output) = run(r#"print "foo" + "bar";"#);
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(output, "foobar\n");
    }

    #[test]
    fn globals_round_trip() {
        let (result, output) = run("var a = 1; a = a + 1; print a;");
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(output, "2\n");
    }

    #[test]
    fn closures_capture_and_mutate_upvalues() {
        let source = r#"
            fun counter() {
                var n = 0;
                fun inc() {
                    n = n + 1;
                    return n;
                }
                return inc;
            }
            var c = counter();
            print c();
            print c();
            print c();
        "#;
        let (result, output) = run(source);
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(output, "1\n2\n3\n");
    }

    #[test]
    fn classes_methods_and_this() {
        let source = r#"
            class Counter {
                init() {
                    this.n = 0;
                }
                bump() {
                    this.n = this.n + 1;
                    return this.n;
                }
            }
            var c = Counter();
            print c.bump();
            print c.bump();
        "#;
        let (result, output) = run(source);
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(output, "1\n2\n");
    }

    #[test]
    fn single_inheritance_and_super() {
        let source = r#"
            class Animal {
                speak() {
                    return "...";
                }
            }
            class Dog < Animal {
                speak() {
                    return "Woof (" + super.speak() + ")";
                }
            }
            print Dog().speak();
        "#;
        let (result, output) = run(source);
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(output, "Woof (...)\n");
    }

    #[test]
    fn control_flow_and_loops() {
        let source = r#"
            var total = 0;
            for (var i = 0; i < 5; i = i + 1) {
                total = total + i;
            }
            print total;
        "#;
        let (result, output) = run(source);
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(output, "10\n");
    }

    #[test]
    fn stack_is_empty_after_normal_termination() {
        let mut vm: Vm<StringHost> = Vm::new(VmOptions::default());
        let result = vm.interpret("var a = 1; print a;");
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(vm.stack_len(), 0);
    }

    #[test]
    fn runtime_error_reports_and_resets() {
        let (result, _) = run("print 1 + \"a\";");
        assert_eq!(result, InterpretResult::RuntimeError);
    }

    #[test]
    fn undefined_global_is_a_runtime_error() {
        let (result, _) = run("print nope;");
        assert_eq!(result, InterpretResult::RuntimeError);
    }

    #[test]
    fn calling_a_non_callable_is_a_runtime_error() {
        let (result, _) = run("var x = 1; x();");
        assert_eq!(result, InterpretResult::RuntimeError);
    }

    #[test]
    fn wrong_arity_is_a_runtime_error() {
        let (result, _) = run("fun f(a, b) { return a + b; } f(1);");
        assert_eq!(result, InterpretResult::RuntimeError);
    }

    #[test]
    fn compile_error_short_circuits_before_running() {
        let (result, output) = run("print ;");
        assert_eq!(result, InterpretResult::CompileError);
        assert_eq!(output, "");
    }

    #[test]
    fn clock_native_is_installed_by_default() {
        let mut vm: Vm<StringHost> = Vm::new(VmOptions::default());
        let result = vm.interpret("print clock() >= 0;");
        assert_eq!(result, InterpretResult::Ok);
    }

    #[test]
    fn field_shadows_method_of_same_name() {
        let source = r#"
            class Box {
                value() { return "method"; }
            }
            var b = Box();
            b.value = "field";
            print b.value;
        "#;
        let (result, output) = run(source);
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(output, "field\n");
    }
}
