//! Runtime error types for the interpreter.
//!
//! JIT failures never show up here: the runtime turns them into "keep
//! interpreting". These are the errors of the guest program itself.

use strand_core::Value;
use strand_jit::CodeId;
use thiserror::Error;

/// Result of interpreter operations.
pub type VmResult<T> = Result<T, VmError>;

/// Errors raised while executing bytecode.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    /// A builtin raised an exception.
    #[error("exception raised: {0}")]
    Raised(Value),

    /// Field or array access through null.
    #[error("null reference at {code}:{pc}")]
    NullReference {
        /// Code object.
        code: CodeId,
        /// Instruction index.
        pc: usize,
    },

    /// Array index outside `0..length`.
    #[error("index {index} out of range for length {length}")]
    IndexError {
        /// Offending index.
        index: i64,
        /// Array length.
        length: usize,
    },

    /// Integer arithmetic overflowed.
    #[error("integer overflow in {0}")]
    Overflow(&'static str),

    /// A value had the wrong shape for the operation.
    #[error("type error: {0}")]
    TypeError(String),

    /// Reference to a code object, class, field or global that does not
    /// exist.
    #[error("undefined {what} {index}")]
    Undefined {
        /// What was looked up.
        what: &'static str,
        /// The index used.
        index: usize,
    },

    /// Execution ran past the last instruction of a code object.
    #[error("fell off the end of code {0}")]
    FellOff(CodeId),

    /// Calls nested deeper than the interpreter allows.
    #[error("maximum recursion depth exceeded")]
    RecursionLimit,

    /// The interpreter was asked to step with no frame on its stack.
    #[error("no frame to execute")]
    NoFrame,
}

impl VmError {
    /// Whether this is a guest-level exception rather than a fault.
    #[inline]
    pub fn is_exception(&self) -> bool {
        matches!(self, VmError::Raised(_))
    }
}
