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

use course_shop_core::types::{CourseId, Lesson};
use course_shop_storage::{LessonError, NewLesson};

use crate::auth::CurrentUser;
use crate::extract::{json_body, path_id};
use crate::problem::{forbidden, internal_error, not_found, ProblemResponse};
use crate::router::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateLessonRequest {
    title: String,
    link: String,
}

/// Lessons are visible to administrators and to holders of a valid subscription.
pub async fn list(
    State(state): State<AppState>,
    user: CurrentUser,
    course_id: Result<Path<CourseId>, PathRejection>,
) -> Result<Json<Vec<Lesson>>, ProblemResponse> {
    let course_id = path_id(course_id)?;
    let storage = state.storage();
    storage.courses().fetch(course_id).await?;

    if !user.is_staff() {
        let subscription = storage
            .subscriptions()
            .find(user.id(), course_id)
            .await?;
        if !subscription.is_some_and(|subscription| subscription.is_valid) {
            return Err(forbidden());
        }
    }

    let lessons = storage.lessons().list_for_course(course_id).await?;
    Ok(Json(lessons))
}

pub async fn create(
    State(state): State<AppState>,
    user: CurrentUser,
    course_id: Result<Path<CourseId>, PathRejection>,
    body: Result<Json<CreateLessonRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Lesson>), ProblemResponse> {
    user.require_staff()?;
    let course_id = path_id(course_id)?;
    let request = json_body(body)?;
    let lesson = state
        .storage()
        .lessons()
        .create(&NewLesson {
            course_id,
            title: request.title.trim(),
            link: request.link.trim(),
        })
        .await?;

    info!(stage = "http", course_id, lesson_id = lesson.id, "lesson created");
    Ok((StatusCode::CREATED, Json(lesson)))
}

impl From<LessonError> for ProblemResponse {
    fn from(err: LessonError) -> Self {
        match err {
            LessonError::CourseNotFound => not_found(err.to_string()),
            LessonError::Validation(err) => err.into(),
            LessonError::Database(ref inner) => internal_error("http", inner),
        }
    }
}
