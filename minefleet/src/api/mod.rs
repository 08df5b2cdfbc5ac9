//! HTTP API for operators and the CLI.

mod server;
pub mod v0;

pub use server::{SharedState, build_router, serve};

use axum::http::StatusCode;

use crate::error::Error;

/// Status code for a crate error surfacing through a handler.
fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::Conflict(_) => StatusCode::CONFLICT,
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::Config(_) | Error::InvalidRule { .. } => StatusCode::BAD_REQUEST,
        Error::Control(_) => StatusCode::BAD_GATEWAY,
        Error::Io(_) | Error::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Handler error: a status and a plain-text explanation.
pub type ApiError = (StatusCode, String);

impl From<Error> for (StatusCode, String) {
    fn from(error: Error) -> Self {
        (status_for(&error), error.to_string())
    }
}
