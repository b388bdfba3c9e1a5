// This module defines error types for the hotloop backend using the thiserror crate
// for idiomatic Rust error handling. CompileError covers the non-recoverable failure
// kinds of the backend: register exhaustion (no spillable register left, which
// signals a bug in the incoming trace or the allocator itself), a missing
// (mnemonic, operand-shape) encoding combination, encoder rejections, and failures
// of the executable-memory finalization step. None of these are caught or retried
// inside the backend; guard failures are designed control flow and do not appear
// here.

//! Error types for the backend.
//!
//! Using thiserror for more idiomatic error handling.

use thiserror::Error;

/// Main error type for trace compilation.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("no spillable register in bank {bank} at operation {position}")]
    RegisterExhausted { bank: u8, position: usize },

    #[error("not implemented: {what}")]
    NotImplemented { what: String },

    #[error("instruction encoding rejected: {reason}")]
    Encoding { reason: String },

    #[error("executable memory: {reason}")]
    Memory { reason: String },
}

impl CompileError {
    /// Shorthand for the missing-encoding case.
    pub fn not_implemented(what: impl Into<String>) -> Self {
        CompileError::NotImplemented { what: what.into() }
    }
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;
