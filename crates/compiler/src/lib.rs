//! Lox compiler library.
//!
//! Provides single-pass compilation from Lox source text to bytecode:
//! the scanner produces tokens on demand and the Pratt-driven compiler
//! emits a chunk as it parses, with no intermediate tree. The result is
//! the implicit top-level script function; the VM wraps it in a closure
//! and executes it.

pub mod compiler;
pub mod scanner;

pub use compiler::{CompileError, compile};
pub use scanner::{Scanner, Token, TokenKind};
