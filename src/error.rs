//! # Error Types
//!
//! Two error kinds flow out of this crate, mirroring the two phases of
//! running a program:
//!
//! - [`CompileError`] — a single lex/parse diagnostic, collected by the
//!   compiler's panic/synchronize protocol rather than thrown; a compile can
//!   produce several before giving up.
//! - [`RuntimeError`] — a single runtime fault, produced by the VM once
//!   execution is already under way. Only one can ever escape [`Vm::run`];
//!   the language has no catch construct, so the first runtime error ends
//!   the program.
//!
//! Both implement [`std::fmt::Display`] and [`std::error::Error`] by hand,
//! one match arm per variant, no `thiserror`/`anyhow` — the error surface
//! here is small and fixed, so derive machinery would buy nothing.
//!
//! [`Vm::run`]: crate::vm::Vm::run

use std::fmt;

/// Where a [`CompileError`] points, for the `at '...'` clause in its
/// rendering. A scanner-level error (unterminated string, stray byte) has
/// no real lexeme to show — its token's text *is* the message — so it gets
/// no location clause at all, matching the rest at a concrete token or at
/// end-of-input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorLocation {
    AtLexeme(String),
    AtEnd,
    None,
}

/// A single diagnostic produced while scanning or parsing a source file.
///
/// Formatted as `[line L] Error at '<lexeme>': <message>`,
/// `[line L] Error at end: <message>`, or `[line L] Error: <message>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub line: usize,
    pub location: ErrorLocation,
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] Error", self.line)?;
        match &self.location {
            ErrorLocation::AtLexeme(lexeme) => write!(f, " at '{}'", lexeme)?,
            ErrorLocation::AtEnd => write!(f, " at end")?,
            ErrorLocation::None => {}
        }
        write!(f, ": {}", self.message)
    }
}

impl std::error::Error for CompileError {}

/// A runtime fault raised while executing bytecode.
///
/// Carries only the message; the frame-by-frame backtrace that accompanies
/// it on stderr is rendered by [`Vm::runtime_error`] while the frame stack
/// still exists, then the stack is cleared and this value is returned.
///
/// [`Vm::runtime_error`]: crate::vm::Vm::runtime_error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    pub message: String,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        RuntimeError {
            message: message.into(),
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RuntimeError {}

/// Outcome of [`crate::vm::Vm::interpret`]; the driver maps this to a
/// process exit code (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}
