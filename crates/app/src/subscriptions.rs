use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use course_shop_core::types::{CourseId, SubscriptionView, UserId};
use course_shop_storage::SubscriptionError;

use crate::auth::CurrentUser;
use crate::extract::json_body;
use crate::problem::{internal_error, not_found, ProblemResponse};
use crate::router::AppState;

#[derive(Debug, Deserialize)]
pub struct GrantRequest {
    user_id: UserId,
    course_id: CourseId,
    #[serde(default)]
    is_valid: bool,
}

/// Administrator grant: records a subscription without debiting the balance.
pub async fn grant(
    State(state): State<AppState>,
    caller: CurrentUser,
    body: Result<Json<GrantRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubscriptionView>), ProblemResponse> {
    caller.require_staff()?;
    let request = json_body(body)?;
    let student = state.storage().users().fetch(request.user_id).await?;
    let enrollment = state
        .purchases()
        .grant(request.user_id, request.course_id, request.is_valid)
        .await?;
    Ok((StatusCode::CREATED, Json(enrollment.view(&student))))
}

impl From<SubscriptionError> for ProblemResponse {
    fn from(err: SubscriptionError) -> Self {
        match err {
            SubscriptionError::Duplicate => {
                ProblemResponse::new(StatusCode::CONFLICT, "constraint_violation", err.to_string())
            }
            SubscriptionError::MissingReference => not_found(err.to_string()),
            SubscriptionError::Database(ref inner) => internal_error("http", inner),
        }
    }
}
