//! Shared error model for identifiers and catalogue lookups.

use thiserror::Error;

/// Result type used by the core primitives.
pub type CoreResult<T> = Result<T, CoreError>;

/// Validation-class error raised while parsing core primitives.
///
/// These are deterministic caller mistakes: they are surfaced immediately and
/// never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A view name is not part of the report catalogue.
    #[error("unknown report view: {0}")]
    UnknownView(String),

    /// A priority rank outside 0..=3.
    #[error("invalid priority: {0}")]
    InvalidPriority(String),
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn unknown_view(name: impl Into<String>) -> Self {
        Self::UnknownView(name.into())
    }

    pub fn invalid_priority(msg: impl Into<String>) -> Self {
        Self::InvalidPriority(msg.into())
    }
}
