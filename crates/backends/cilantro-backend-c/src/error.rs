use cilantro_core::CoreError;

/// Per-method compilation failures, split into the tiers that decide what
/// happens to the method: every tier stubs the body, but the stub raises a
/// different runtime error and diagnostics report them separately.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// The IL stream violates its own rules (bad branch target, stack
    /// shape mismatch at a join, stack underflow).
    #[error("invalid program: {0}")]
    InvalidProgram(String),

    /// Well-formed IL using a construct this backend does not lower.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A bug on our side, caught at the method boundary.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<cilbc::Error> for CompileError {
    fn from(e: cilbc::Error) -> Self {
        CompileError::InvalidProgram(e.to_string())
    }
}

impl From<CoreError> for CompileError {
    fn from(e: CoreError) -> Self {
        CompileError::InvalidProgram(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CompileError>;
