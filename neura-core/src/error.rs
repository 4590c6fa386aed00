// neura-core/src/error.rs

use crate::domain::error::DomainError;
use crate::infrastructure::error::InfrastructureError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NeuraError {
    // --- DOMAIN ERRORS (contract violations, lock conflicts, cancellation) ---
    #[error(transparent)]
    Domain(#[from] DomainError),

    // --- INFRASTRUCTURE ERRORS (IO, SQL engines, HTTP, crypto) ---
    #[error(transparent)]
    Infrastructure(#[from] InfrastructureError),

    // --- GENERIC / APPLICATIVE ERRORS ---
    #[error("Internal Error: {0}")]
    InternalError(String),

    #[error("Unsafe path traversal detected: {0}")]
    UnsafePath(String),
}

impl NeuraError {
    /// Stable machine-readable code surfaced to callers alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            NeuraError::Domain(err) => err.code(),
            NeuraError::Infrastructure(_) => "infrastructure_error",
            NeuraError::InternalError(_) => "internal_error",
            NeuraError::UnsafePath(_) => "invalid_template_path",
        }
    }
}

// Manual implementation to avoid duplicate enum variant but keep ergonomics
impl From<std::io::Error> for NeuraError {
    fn from(err: std::io::Error) -> Self {
        NeuraError::Infrastructure(InfrastructureError::Io(err))
    }
}

impl From<serde_json::Error> for NeuraError {
    fn from(err: serde_json::Error) -> Self {
        NeuraError::Infrastructure(InfrastructureError::Json(err))
    }
}
