//! Code generation error types.

/// Error type for code generation operations.
///
/// Semantic problems in the source (const reassignment, malformed spread)
/// are not represented here: those accumulate as diagnostics on the context
/// while generation continues with a null placeholder. `CodeGenError` is for
/// failures of the generator itself.
#[derive(Debug)]
pub enum CodeGenError {
    /// A logical error in code generation (e.g., a module missing from
    /// the cache, or accumulated source diagnostics at the end of a run)
    Logic(String),
    /// A formatting error when writing C
    Format(std::fmt::Error),
}

impl std::fmt::Display for CodeGenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodeGenError::Logic(s) => write!(f, "{}", s),
            CodeGenError::Format(e) => write!(f, "C generation error: {}", e),
        }
    }
}

impl std::error::Error for CodeGenError {}

impl From<String> for CodeGenError {
    fn from(s: String) -> Self {
        CodeGenError::Logic(s)
    }
}

impl From<std::fmt::Error> for CodeGenError {
    fn from(e: std::fmt::Error) -> Self {
        CodeGenError::Format(e)
    }
}
