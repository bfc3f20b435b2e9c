// src/error.rs

use std::fmt;

use thiserror::Error;

// --- Compile-time errors ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorLocation {
    AtEnd,
    At(String),
    /// Lexical errors: the message already describes the offending text.
    Unspecified,
}

impl fmt::Display for ErrorLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorLocation::AtEnd => write!(f, " at end"),
            ErrorLocation::At(lexeme) => write!(f, " at '{}'", lexeme),
            ErrorLocation::Unspecified => Ok(()),
        }
    }
}

/// One reported syntax error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[line {line}] Error{location}: {message}")]
pub struct Diagnostic {
    pub line: usize,
    pub location: ErrorLocation,
    pub message: String,
}

/// Every error surfaced by one compilation pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("compilation failed with {} error(s)", .diagnostics.len())]
pub struct CompileError {
    pub diagnostics: Vec<Diagnostic>,
}

impl CompileError {
    pub fn messages(&self) -> impl Iterator<Item = &str> {
        self.diagnostics.iter().map(|d| d.message.as_str())
    }
}

// --- Runtime errors ---

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeErrorKind {
    #[error("Operands must be numbers.")]
    OperandsMustBeNumbers,
    #[error("Operand must be a number.")]
    OperandMustBeNumber,
    #[error("Operands must be two numbers or two strings.")]
    OperandsMustBeNumbersOrStrings,
    #[error("Undefined variable '{0}'.")]
    UndefinedVariable(String),
    #[error("Undefined property '{0}'.")]
    UndefinedProperty(String),
    #[error("Only instances have properties.")]
    OnlyInstancesHaveProperties,
    #[error("Only instances have fields.")]
    OnlyInstancesHaveFields,
    #[error("Only instances have methods.")]
    OnlyInstancesHaveMethods,
    #[error("Can only call functions and classes.")]
    NotCallable,
    #[error("Expected {expected} arguments but got {got}.")]
    ArityMismatch { expected: usize, got: usize },
    #[error("Stack overflow.")]
    StackOverflow,
    #[error("Superclass must be a class.")]
    SuperclassMustBeClass,
    #[error("Assertion failed.")]
    AssertionFailed,
    #[error("Exit code must be a number.")]
    ExitCodeMustBeNumber,
    #[error("Unknown opcode {0}.")]
    UnknownOpcode(u8),
    #[error("Stack underflow.")]
    StackUnderflow,
    #[error("Malformed bytecode.")]
    MalformedBytecode,
}

/// A runtime failure together with the source line and the call trace
/// (innermost frame first) at the moment it was raised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}")]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub line: usize,
    pub trace: Vec<String>,
}

impl RuntimeError {
    /// The message followed by one `[line N] in f()` line per frame.
    pub fn report(&self) -> String {
        let mut out = self.kind.to_string();
        for frame in &self.trace {
            out.push('\n');
            out.push_str(frame);
        }
        out
    }
}

/// Terminal state of one `interpret` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
    /// The script called `exit` with code 0.
    ExitOk,
    /// The script called `exit` with a nonzero code.
    Exit(i32),
}

impl InterpretResult {
    /// Process exit status used by the command-line runner.
    pub fn exit_code(self) -> i32 {
        match self {
            InterpretResult::Ok | InterpretResult::ExitOk => 0,
            InterpretResult::CompileError => 65,
            InterpretResult::RuntimeError => 70,
            InterpretResult::Exit(code) => code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InterpretError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_format() {
        let at = Diagnostic { line: 3, location: ErrorLocation::At("=".into()), message: "Invalid assignment target.".into() };
        assert_eq!(at.to_string(), "[line 3] Error at '=': Invalid assignment target.");

        let end = Diagnostic { line: 1, location: ErrorLocation::AtEnd, message: "Expect ';' after value.".into() };
        assert_eq!(end.to_string(), "[line 1] Error at end: Expect ';' after value.");

        let lexical = Diagnostic { line: 2, location: ErrorLocation::Unspecified, message: "Unexpected character.".into() };
        assert_eq!(lexical.to_string(), "[line 2] Error: Unexpected character.");
    }

    #[test]
    fn test_runtime_report_includes_trace() {
        let err = RuntimeError {
            kind: RuntimeErrorKind::ArityMismatch { expected: 1, got: 2 },
            line: 4,
            trace: vec!["[line 4] in f()".into(), "[line 6] in script".into()],
        };
        assert_eq!(err.to_string(), "Expected 1 arguments but got 2.");
        assert_eq!(err.report(), "Expected 1 arguments but got 2.\n[line 4] in f()\n[line 6] in script");
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(InterpretResult::Ok.exit_code(), 0);
        assert_eq!(InterpretResult::ExitOk.exit_code(), 0);
        assert_eq!(InterpretResult::CompileError.exit_code(), 65);
        assert_eq!(InterpretResult::RuntimeError.exit_code(), 70);
        assert_eq!(InterpretResult::Exit(-1).exit_code(), -1);
    }
}
