use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use course_shop_core::types::{Role, User};
use course_shop_core::Points;
use course_shop_storage::{BalanceError, NewUser, UserError};

use crate::auth::CurrentUser;
use crate::extract::json_body;
use crate::problem::{internal_error, not_found, ProblemResponse};
use crate::router::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    email: String,
    username: String,
    #[serde(default)]
    first_name: String,
    #[serde(default)]
    last_name: String,
    #[serde(default)]
    role: Role,
}

#[derive(Debug, Serialize)]
pub struct UserWithBalance {
    #[serde(flatten)]
    user: User,
    balance: Points,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    balance: Points,
}

/// Public registration. Administrators are provisioned out of band.
pub async fn register(
    State(state): State<AppState>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<UserWithBalance>), ProblemResponse> {
    let request = json_body(body)?;
    let registered = state
        .storage()
        .users()
        .register(&NewUser {
            email: request.email.trim(),
            username: request.username.trim(),
            first_name: request.first_name.trim(),
            last_name: request.last_name.trim(),
            role: request.role,
            is_staff: false,
            created_at: state.now(),
        })
        .await?;

    info!(
        stage = "http",
        user_id = registered.user.id,
        balance = %registered.balance.amount,
        "user registered"
    );
    Ok((
        StatusCode::CREATED,
        Json(UserWithBalance {
            user: registered.user,
            balance: registered.balance.amount,
        }),
    ))
}

pub async fn me(CurrentUser(user): CurrentUser) -> Json<User> {
    Json(user)
}

pub async fn balance(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<Json<BalanceResponse>, ProblemResponse> {
    let balance = state.storage().balances().fetch_for_user(user.id()).await?;
    Ok(Json(BalanceResponse {
        balance: balance.amount,
    }))
}

impl From<UserError> for ProblemResponse {
    fn from(err: UserError) -> Self {
        match err {
            UserError::NotFound => not_found(err.to_string()),
            UserError::DuplicateEmail => {
                ProblemResponse::new(StatusCode::CONFLICT, "constraint_violation", err.to_string())
            }
            UserError::Validation(err) => err.into(),
            UserError::Database(ref inner) => internal_error("http", inner),
        }
    }
}

impl From<BalanceError> for ProblemResponse {
    fn from(err: BalanceError) -> Self {
        match err {
            BalanceError::NotFound => not_found(err.to_string()),
            BalanceError::Validation(err) => err.into(),
            BalanceError::Database(ref inner) => internal_error("http", inner),
        }
    }
}
