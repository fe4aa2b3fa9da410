use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::error;

use course_shop_storage::Database;

use crate::placement::GroupAssigner;
use crate::purchase::PurchaseService;
use crate::{courses, groups, lessons, subscriptions, telemetry, users};

/// Source of "now" shared by handlers and services.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    clock: Clock,
    purchases: PurchaseService,
    assigner: GroupAssigner,
}

impl AppState {
    pub fn new(metrics: PrometheusHandle, storage: Database) -> Self {
        let clock: Clock = Arc::new(Utc::now);
        Self::build(metrics, storage, clock)
    }

    #[cfg(test)]
    pub fn with_clock(self, clock: Clock) -> Self {
        Self::build(self.metrics, self.storage, clock)
    }

    fn build(metrics: PrometheusHandle, storage: Database, clock: Clock) -> Self {
        let assigner = GroupAssigner::new(storage.clone(), clock.clone());
        let purchases = PurchaseService::new(storage.clone(), assigner.clone(), clock.clone());
        Self {
            metrics,
            storage,
            clock,
            purchases,
            assigner,
        }
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn purchases(&self) -> &PurchaseService {
        &self.purchases
    }

    pub fn assigner(&self) -> &GroupAssigner {
        &self.assigner
    }
}

pub fn app_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/users", post(users::register))
        .route("/users/me", get(users::me))
        .route("/users/me/balance", get(users::balance))
        .route("/courses", get(courses::list).post(courses::create))
        .route("/courses/:id", get(courses::fetch))
        .route("/courses/:id/pay", post(courses::pay))
        .route(
            "/courses/:id/lessons",
            get(lessons::list).post(lessons::create),
        )
        .route(
            "/courses/:id/groups",
            get(groups::list).post(groups::create),
        )
        .route("/subscriptions", post(subscriptions::grant));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .nest("/api/v1", api)
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> Response {
    let body = telemetry::render_metrics(state.metrics());
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Body::from(body))
        .unwrap_or_else(|err| {
            error!(stage = "http", error = %err, "failed to build metrics response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::test_support::TestContext;

    #[tokio::test]
    async fn healthz_returns_ok() {
        let context = TestContext::new().await;
        let app = app_router(context.state.clone());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_exports_build_info() {
        let context = TestContext::new().await;
        let app = app_router(context.state.clone());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::OK);
        let collected = response
            .into_body()
            .collect()
            .await
            .expect("body should read");
        let body = String::from_utf8(collected.to_bytes().to_vec()).expect("utf-8");
        assert!(body.contains("app_build_info"));
        assert!(body.contains("app_uptime_seconds"));
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let context = TestContext::new().await;
        let app = app_router(context.state.clone());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/nothing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
