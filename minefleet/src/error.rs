//! Crate-level error type.

use crate::device::ControlError;

/// Errors surfaced by configuration, persistence and control operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Two automated control paths would fight over the same devices.
    #[error("conflicting control intent: {0}")]
    Conflict(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("rule {rule}: {reason}")]
    InvalidRule { rule: String, reason: String },

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
