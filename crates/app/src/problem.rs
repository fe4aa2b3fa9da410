use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use course_shop_core::validation::ValidationError;

#[derive(Debug, Serialize)]
struct ProblemDetails {
    #[serde(rename = "type")]
    problem_type: &'static str,
    title: &'static str,
    detail: String,
}

#[derive(Debug)]
pub struct ProblemResponse {
    status: StatusCode,
    body: ProblemDetails,
}

impl ProblemResponse {
    pub fn new<S: Into<String>>(status: StatusCode, problem_type: &'static str, detail: S) -> Self {
        Self {
            status,
            body: ProblemDetails {
                problem_type,
                title: status.canonical_reason().unwrap_or("error"),
                detail: detail.into(),
            },
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn problem_type(&self) -> &'static str {
        self.body.problem_type
    }
}

impl IntoResponse for ProblemResponse {
    fn into_response(self) -> Response {
        let mut response = Json(self.body).into_response();
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

impl From<ValidationError> for ProblemResponse {
    fn from(err: ValidationError) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_error", err.to_string())
    }
}

pub fn not_found(detail: impl Into<String>) -> ProblemResponse {
    ProblemResponse::new(StatusCode::NOT_FOUND, "not_found", detail)
}

pub fn unauthorized() -> ProblemResponse {
    ProblemResponse::new(
        StatusCode::UNAUTHORIZED,
        "unauthorized",
        "authentication credentials were not provided",
    )
}

pub fn forbidden() -> ProblemResponse {
    ProblemResponse::new(
        StatusCode::FORBIDDEN,
        "forbidden",
        "you do not have permission to perform this action",
    )
}

/// Logs the underlying error and hides it behind a generic 500.
pub fn internal_error(stage: &'static str, err: &dyn std::error::Error) -> ProblemResponse {
    error!(stage, error = %err, "request failed");
    ProblemResponse::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal_error",
        "internal server error",
    )
}
