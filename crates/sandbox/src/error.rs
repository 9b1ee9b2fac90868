//! Error types for the sandbox.

/// Errors produced while mapping virtual paths.
///
/// None of the variants carry a physical path: messages end up in front of
/// users, and the sandbox layout is not theirs to see.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("path traversal rejected: {virtual_path}")]
    PathTraversal { virtual_path: String },

    #[error("invalid path: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
