use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use course_shop_core::types::{Course, CourseId, SubscriptionView};
use course_shop_core::Points;
use course_shop_storage::{CourseError, CourseListing, NewCourse};

use crate::auth::CurrentUser;
use crate::extract::{json_body, path_id};
use crate::problem::{internal_error, not_found, ProblemResponse};
use crate::router::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateCourseRequest {
    title: String,
    start_date: DateTime<Utc>,
    price: Points,
}

#[derive(Debug, Serialize)]
pub struct CourseSummary {
    #[serde(flatten)]
    course: Course,
    lessons_count: u32,
}

impl From<CourseListing> for CourseSummary {
    fn from(listing: CourseListing) -> Self {
        Self {
            course: listing.course,
            lessons_count: listing.lessons_count,
        }
    }
}

/// Courses the caller can still buy.
pub async fn list(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<Json<Vec<CourseSummary>>, ProblemResponse> {
    let listings = state
        .storage()
        .courses()
        .list_available_for(user.id())
        .await?;
    Ok(Json(listings.into_iter().map(CourseSummary::from).collect()))
}

pub async fn create(
    State(state): State<AppState>,
    user: CurrentUser,
    body: Result<Json<CreateCourseRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Course>), ProblemResponse> {
    user.require_staff()?;
    let request = json_body(body)?;
    let course = state
        .storage()
        .courses()
        .create(&NewCourse {
            author_id: user.id(),
            title: request.title.trim(),
            start_date: request.start_date,
            price: request.price,
            created_at: state.now(),
        })
        .await?;

    info!(
        stage = "http",
        course_id = course.id,
        author_id = course.author_id,
        price = %course.price,
        "course created"
    );
    Ok((StatusCode::CREATED, Json(course)))
}

pub async fn fetch(
    State(state): State<AppState>,
    _user: CurrentUser,
    course_id: Result<Path<CourseId>, PathRejection>,
) -> Result<Json<Course>, ProblemResponse> {
    let course_id = path_id(course_id)?;
    let course = state.storage().courses().fetch(course_id).await?;
    Ok(Json(course))
}

/// Buys the course with the caller's balance.
pub async fn pay(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    course_id: Result<Path<CourseId>, PathRejection>,
) -> Result<(StatusCode, Json<SubscriptionView>), ProblemResponse> {
    let course_id = path_id(course_id)?;
    let enrollment = state.purchases().purchase(user.id, course_id).await?;
    Ok((StatusCode::CREATED, Json(enrollment.view(&user))))
}

impl From<CourseError> for ProblemResponse {
    fn from(err: CourseError) -> Self {
        match err {
            CourseError::NotFound | CourseError::AuthorNotFound => not_found(err.to_string()),
            CourseError::Validation(err) => err.into(),
            CourseError::Database(ref inner) => internal_error("http", inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use chrono::{Duration, Utc};
    use serde_json::json;

    use crate::test_support::TestContext;

    #[tokio::test]
    async fn admin_creates_course_and_students_cannot() {
        let context = TestContext::new().await;
        let admin = context.user("admin@example.com", true).await;
        let student = context.user("student@example.com", false).await;
        let payload = json!({
            "title": "Async Rust",
            "start_date": (Utc::now() + Duration::days(7)).to_rfc3339(),
            "price": "150.00"
        });

        let (status, body) = context
            .send(
                Method::POST,
                "/api/v1/courses",
                Some(&student),
                Some(payload.clone()),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["type"], "forbidden");

        let (status, body) = context
            .send(Method::POST, "/api/v1/courses", Some(&admin), Some(payload))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["price"], "150.00");
        assert_eq!(body["author_id"], admin.id);
    }

    #[tokio::test]
    async fn negative_price_is_a_validation_error() {
        let context = TestContext::new().await;
        let admin = context.user("admin@example.com", true).await;

        let (status, body) = context
            .send(
                Method::POST,
                "/api/v1/courses",
                Some(&admin),
                Some(json!({
                    "title": "Async Rust",
                    "start_date": Utc::now().to_rfc3339(),
                    "price": "-1.00"
                })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "validation_error");
    }

    #[tokio::test]
    async fn listing_hides_courses_with_valid_subscription() {
        let context = TestContext::new().await;
        let admin = context.user("admin@example.com", true).await;
        let student = context.user("student@example.com", false).await;
        let bought = context.course(&admin, "10.00", Duration::days(7)).await;
        let other = context.course(&admin, "20.00", Duration::days(7)).await;

        let (status, _) = context
            .send(
                Method::POST,
                &format!("/api/v1/courses/{}/pay", bought.id),
                Some(&student),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = context
            .send(Method::GET, "/api/v1/courses", Some(&student), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        let listed = body.as_array().expect("array");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["id"], other.id);
        assert_eq!(listed[0]["lessons_count"], 0);
    }

    #[tokio::test]
    async fn pay_returns_subscription_view() {
        let context = TestContext::new().await;
        let admin = context.user("admin@example.com", true).await;
        let student = context.user("student@example.com", false).await;
        let course = context.course(&admin, "150.00", Duration::days(7)).await;
        let uri = format!("/api/v1/courses/{}/pay", course.id);

        let (status, body) = context
            .send(Method::POST, &uri, Some(&student), None)
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["user"], "student");
        assert_eq!(body["course"], "Course: Async Rust");
        assert_eq!(body["is_valid"], true);

        let (status, body) = context
            .send(Method::POST, &uri, Some(&student), None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "already_subscribed");
        assert_eq!(body["detail"], "already subscribed");

        let (_, body) = context
            .send(Method::GET, "/api/v1/users/me/balance", Some(&student), None)
            .await;
        assert_eq!(body["balance"], "850.00");
    }

    #[tokio::test]
    async fn pay_rejects_insufficient_funds_and_missing_course() {
        let context = TestContext::new().await;
        let admin = context.user("admin@example.com", true).await;
        let student = context.user("student@example.com", false).await;
        let course = context.course(&admin, "1000.01", Duration::days(7)).await;

        let (status, body) = context
            .send(
                Method::POST,
                &format!("/api/v1/courses/{}/pay", course.id),
                Some(&student),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "insufficient_funds");
        assert_eq!(body["detail"], "insufficient funds");

        let (status, body) = context
            .send(Method::POST, "/api/v1/courses/999/pay", Some(&student), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["type"], "not_found");
    }

    #[tokio::test]
    async fn fetch_unknown_course_is_not_found() {
        let context = TestContext::new().await;
        let student = context.user("student@example.com", false).await;
        let (status, _) = context
            .send(Method::GET, "/api/v1/courses/42", Some(&student), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
