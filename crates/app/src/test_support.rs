use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
};
use chrono::{Duration, Utc};
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use course_shop_core::types::{Course, Role, User};
use course_shop_storage::{Database, NewCourse, NewUser};

use crate::auth::USER_ID_HEADER;
use crate::router::{app_router, AppState};
use crate::telemetry;

/// Fresh on-disk database plus application state for one test.
pub struct TestContext {
    _dir: TempDir,
    pub database: Database,
    pub state: AppState,
}

impl TestContext {
    pub async fn new() -> Self {
        let metrics = telemetry::init_metrics().expect("metrics init");
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("shop.db").display()
        );
        let database = Database::connect(&url).await.expect("connect");
        database.run_migrations().await.expect("migrations");
        let state = AppState::new(metrics, database.clone());
        Self {
            _dir: dir,
            database,
            state,
        }
    }

    pub async fn user(&self, email: &str, is_staff: bool) -> User {
        let username = email.split('@').next().unwrap_or(email);
        let role = if is_staff { Role::Teacher } else { Role::Student };
        self.database
            .users()
            .register(&NewUser {
                email,
                username,
                first_name: "",
                last_name: "",
                role,
                is_staff,
                created_at: Utc::now(),
            })
            .await
            .expect("register user")
            .user
    }

    /// Creates a course authored by `author` that starts `start_in` from now.
    pub async fn course(&self, author: &User, price: &str, start_in: Duration) -> Course {
        self.database
            .courses()
            .create(&NewCourse {
                author_id: author.id,
                title: "Async Rust",
                start_date: Utc::now() + start_in,
                price: price.parse().expect("price"),
                created_at: Utc::now(),
            })
            .await
            .expect("create course")
    }

    /// Sends one request through the full router and decodes the JSON body.
    pub async fn send(
        &self,
        method: Method,
        uri: &str,
        caller: Option<&User>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(caller) = caller {
            request = request.header(USER_ID_HEADER, caller.id.to_string());
        }
        let body = match body {
            Some(json) => {
                request = request.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = app_router(self.state.clone())
            .oneshot(request.body(body).expect("request"))
            .await
            .expect("handler should respond");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body should read")
            .to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        (status, json)
    }
}
