//! Request extraction helpers that keep axum rejections in problem+json form.
//!
//! Handlers take `Result<Path<_>, PathRejection>` / `Result<Json<_>, JsonRejection>`
//! and unwrap them here, so a bad id or body never falls back to axum's plain-text
//! rejection.

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path,
    },
    http::StatusCode,
    Json,
};

use crate::problem::ProblemResponse;

pub fn path_id<T>(result: Result<Path<T>, PathRejection>) -> Result<T, ProblemResponse> {
    result.map(|Path(value)| value).map_err(|err| {
        ProblemResponse::new(StatusCode::BAD_REQUEST, "invalid_path", err.body_text())
    })
}

/// Keeps axum's status (400, 415 or 422) but reports it as a problem document.
pub fn json_body<T>(result: Result<Json<T>, JsonRejection>) -> Result<T, ProblemResponse> {
    result
        .map(|Json(value)| value)
        .map_err(|err| ProblemResponse::new(err.status(), "invalid_body", err.body_text()))
}
