//! Error types and result definitions for the JIT runtime.
//!
//! Errors never escape the interpreter-facing entry points: the runtime
//! turns every `Err` into "keep interpreting" and reports it on a log
//! channel. The variants mirror the abort policies of the JIT:
//!
//! - Recorder aborts (trace too long, unsupported operation)
//! - Optimizer aborts (a guard provably always fails)
//! - Backend failures (out of code memory, invalidated tokens)
//! - Configuration errors (unknown or malformed tunables)

use thiserror::Error;

/// The unified result type used throughout the JIT.
pub type JitResult<T> = Result<T, JitError>;

/// Every error condition of the JIT runtime.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JitError {
    /// The trace would exceed `trace_limit` operations.
    #[error("trace too long: more than {limit} operations")]
    TraceTooLong {
        /// The configured limit.
        limit: usize,
    },

    /// The recorder met an operation it cannot represent.
    #[error("unsupported operation while tracing: {0}")]
    Unsupported(String),

    /// The optimizer proved that a guard always fails.
    #[error("invalid loop: {0}")]
    InvalidLoop(String),

    /// The backend ran out of code memory while compiling.
    #[error("backend out of memory")]
    OutOfMemory,

    /// Compiled code was entered after its token was invalidated.
    #[error("loop token {0} has been invalidated")]
    InvalidatedToken(u64),

    /// The token is not known to the backend (freed or never compiled).
    #[error("unknown loop token {0}")]
    UnknownToken(u64),

    /// The driver id was not handed out by this runtime.
    #[error("unknown jit driver {0}")]
    UnknownDriver(usize),

    /// A tunable with this name does not exist.
    #[error("unknown JIT parameter '{0}'")]
    UnknownParam(String),

    /// A tunable was given a value it cannot take.
    #[error("bad value '{value}' for JIT parameter '{name}'")]
    BadParamValue {
        /// Parameter name.
        name: String,
        /// Offending value.
        value: String,
    },

    /// `enable_opts` named an optimization that does not exist.
    #[error("unknown optimization '{0}'")]
    UnknownOptimization(String),

    /// The recorder was started before a fork and is no longer valid.
    #[error("trace recorder is stale")]
    StaleTrace,

    /// Internal backend failure.
    #[error("backend failure: {0}")]
    Backend(String),
}

impl JitError {
    /// Whether this abort should mark the green key `dont_trace_here`.
    #[inline]
    pub fn marks_dont_trace(&self) -> bool {
        matches!(self, JitError::Unsupported(_))
    }

    /// Whether this abort comes from the recorder's length limit.
    #[inline]
    pub fn is_trace_too_long(&self) -> bool {
        matches!(self, JitError::TraceTooLong { .. })
    }

    /// Short stable name, used as a log field.
    pub const fn kind_name(&self) -> &'static str {
        match self {
            JitError::TraceTooLong { .. } => "trace-too-long",
            JitError::Unsupported(_) => "unsupported",
            JitError::InvalidLoop(_) => "invalid-loop",
            JitError::OutOfMemory => "out-of-memory",
            JitError::InvalidatedToken(_) => "invalidated",
            JitError::UnknownToken(_) => "unknown-token",
            JitError::UnknownDriver(_) => "unknown-driver",
            JitError::UnknownParam(_) => "unknown-param",
            JitError::BadParamValue { .. } => "bad-param",
            JitError::UnknownOptimization(_) => "unknown-opt",
            JitError::StaleTrace => "stale-trace",
            JitError::Backend(_) => "backend",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            JitError::TraceTooLong { limit: 10 }.to_string(),
            "trace too long: more than 10 operations"
        );
        assert_eq!(
            JitError::UnknownOptimization("fold".into()).to_string(),
            "unknown optimization 'fold'"
        );
    }

    #[test]
    fn test_policy_helpers() {
        assert!(JitError::Unsupported("x".into()).marks_dont_trace());
        assert!(!JitError::TraceTooLong { limit: 1 }.marks_dont_trace());
        assert!(JitError::TraceTooLong { limit: 1 }.is_trace_too_long());
        assert_eq!(JitError::OutOfMemory.kind_name(), "out-of-memory");
    }
}
