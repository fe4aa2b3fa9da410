use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use tracing::info;

use course_shop_core::types::{CourseId, Group};
use course_shop_storage::{GroupError, NewGroup};

use crate::auth::CurrentUser;
use crate::extract::{json_body, path_id};
use crate::problem::{internal_error, not_found, ProblemResponse};
use crate::router::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    title: String,
}

/// Groups of a course, least populated first.
pub async fn list(
    State(state): State<AppState>,
    user: CurrentUser,
    course_id: Result<Path<CourseId>, PathRejection>,
) -> Result<Json<Vec<Group>>, ProblemResponse> {
    let course_id = path_id(course_id)?;
    user.require_staff()?;
    let storage = state.storage();
    storage.courses().fetch(course_id).await?;
    let groups = storage.groups().list_for_course(course_id).await?;
    Ok(Json(groups))
}

/// Opens an empty group; placement fills it before creating new ones.
pub async fn create(
    State(state): State<AppState>,
    user: CurrentUser,
    course_id: Result<Path<CourseId>, PathRejection>,
    body: Result<Json<CreateGroupRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Group>), ProblemResponse> {
    user.require_staff()?;
    let course_id = path_id(course_id)?;
    let request = json_body(body)?;
    let group = state
        .storage()
        .groups()
        .create(&NewGroup {
            course_id,
            title: request.title.trim(),
            count_students: 0,
            created_at: state.now(),
        })
        .await?;

    info!(stage = "http", course_id, group_id = group.id, "group created");
    Ok((StatusCode::CREATED, Json(group)))
}

impl From<GroupError> for ProblemResponse {
    fn from(err: GroupError) -> Self {
        match err {
            GroupError::CourseNotFound | GroupError::NotFound => not_found(err.to_string()),
            GroupError::DuplicateMember => {
                ProblemResponse::new(StatusCode::CONFLICT, "constraint_violation", err.to_string())
            }
            GroupError::Validation(err) => err.into(),
            GroupError::Database(ref inner) => internal_error("http", inner),
        }
    }
}
