use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

use course_shop_core::types::{User, UserId};
use course_shop_storage::UserError;

use crate::problem::{forbidden, internal_error, unauthorized, ProblemResponse};
use crate::router::AppState;

/// Header carrying the id of the user the upstream gateway authenticated.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Caller resolved from [`USER_ID_HEADER`].
#[derive(Debug, Clone)]
pub struct CurrentUser(pub User);

impl CurrentUser {
    pub fn id(&self) -> UserId {
        self.0.id
    }

    pub fn is_staff(&self) -> bool {
        self.0.is_staff
    }

    /// Admin-only routes call this before touching storage.
    pub fn require_staff(&self) -> Result<(), ProblemResponse> {
        if self.is_staff() {
            Ok(())
        } else {
            Err(forbidden())
        }
    }
}

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ProblemResponse;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let user_id: UserId = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|raw| raw.trim().parse().ok())
            .ok_or_else(unauthorized)?;

        match state.storage().users().fetch(user_id).await {
            Ok(user) => Ok(Self(user)),
            Err(UserError::NotFound) => Err(unauthorized()),
            Err(err) => Err(internal_error("http", &err)),
        }
    }
}
