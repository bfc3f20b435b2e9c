// src/lib.rs

// --- Module Declarations ---
pub mod config;
pub mod error;
pub mod memory;
pub mod scanner;
pub mod table;
pub mod value;
pub mod vm;

// --- Public API Re-exports ---
// The embedding surface: configure a VM, feed it source, inspect the outcome.
pub use config::VmConfig;
pub use error::{CompileError, Diagnostic, InterpretError, InterpretResult, RuntimeError, RuntimeErrorKind};
pub use memory::{Heap, HeapStats, ObjRef};
pub use value::Value;
pub use vm::natives::NativeFn;
pub use vm::{Completion, Vm};

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn quiet_vm() -> Vm {
        Vm::with_output(VmConfig::default(), io::sink(), io::sink())
    }

    fn number(vm: &Vm, name: &str) -> Option<f64> {
        vm.global(name).and_then(|v| v.as_number())
    }

    #[test]
    fn test_assignment_and_arithmetic() {
        let mut vm = quiet_vm();
        assert_eq!(vm.interpret("var a = 1; a = a + 1; print a;"), InterpretResult::Ok);
        assert_eq!(number(&vm, "a"), Some(2.0));
    }

    #[test]
    fn test_closure_keeps_captured_local() {
        let mut vm = quiet_vm();
        let source = "fun f() { var i = 1; fun g() { return i; } return g; } var h = f(); assert(h() == 1);";
        assert_eq!(vm.interpret(source), InterpretResult::Ok);
    }

    #[test]
    fn test_exit_states() {
        assert_eq!(quiet_vm().interpret("exit(0);"), InterpretResult::ExitOk);
        assert_eq!(quiet_vm().interpret("exit(-1);"), InterpretResult::Exit(-1));
        assert_eq!(quiet_vm().interpret("exit;"), InterpretResult::ExitOk);
        assert_eq!(quiet_vm().interpret("exit(\"no\");"), InterpretResult::RuntimeError);
    }

    #[test]
    fn test_calling_nil_is_runtime_error() {
        let mut vm = quiet_vm();
        assert_eq!(vm.interpret("var x; x();"), InterpretResult::RuntimeError);
        let err = vm.last_error().expect("error recorded");
        assert_eq!(err.kind, RuntimeErrorKind::NotCallable);
        assert_eq!(err.to_string(), "Can only call functions and classes.");
    }

    #[test]
    fn test_division_by_zero_is_infinity() {
        let mut vm = quiet_vm();
        assert_eq!(vm.interpret("var q = 1/0; var n = -1/0;"), InterpretResult::Ok);
        assert_eq!(number(&vm, "q"), Some(f64::INFINITY));
        assert_eq!(number(&vm, "n"), Some(f64::NEG_INFINITY));
    }

    #[test]
    fn test_vm_survives_errors_and_keeps_globals() {
        let mut vm = quiet_vm();
        assert_eq!(vm.interpret("var kept = 10;"), InterpretResult::Ok);
        assert_eq!(vm.interpret("kept = kept +;"), InterpretResult::CompileError);
        assert_eq!(vm.interpret("fun f() { return missing; } f();"), InterpretResult::RuntimeError);
        assert_eq!(vm.interpret("kept = kept + 1;"), InterpretResult::Ok);
        assert_eq!(number(&vm, "kept"), Some(11.0));
    }

    #[test]
    fn test_execute_returns_typed_errors() {
        let mut vm = quiet_vm();
        match vm.execute("print ;") {
            Err(InterpretError::Compile(err)) => {
                assert_eq!(err.messages().collect::<Vec<_>>(), vec!["Expect expression."]);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        match vm.execute("-\"s\";") {
            Err(InterpretError::Runtime(err)) => assert_eq!(err.kind, RuntimeErrorKind::OperandMustBeNumber),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(vm.execute("exit(3);"), Ok(Completion::Exit(3)));
    }

    #[test]
    fn test_independent_vms() {
        let mut first = quiet_vm();
        let mut second = quiet_vm();
        first.interpret("var shared = 1;");
        second.interpret("var shared = 2;");
        assert_eq!(number(&first, "shared"), Some(1.0));
        assert_eq!(number(&second, "shared"), Some(2.0));
        first.teardown();
        assert_eq!(number(&second, "shared"), Some(2.0));
    }
}
