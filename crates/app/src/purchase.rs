use std::time::Instant;

use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use thiserror::Error;
use tracing::{info, warn};

use course_shop_core::purchase::{check_purchase, PurchaseRejection};
use course_shop_core::types::{
    Course, CourseId, Subscription, SubscriptionCreated, SubscriptionView, User, UserId,
};
use course_shop_core::validation::ValidationError;
use course_shop_core::Points;
use course_shop_storage::{
    BalanceError, CourseError, Database, NewSubscription, SubscriptionError, UserError,
};

use crate::placement::{GroupAssigner, PlacementOutcome};
use crate::problem::{internal_error, not_found, ProblemResponse};
use crate::router::Clock;

/// Creates subscriptions and hands them to group placement once committed.
#[derive(Clone)]
pub struct PurchaseService {
    database: Database,
    assigner: GroupAssigner,
    clock: Clock,
}

impl PurchaseService {
    pub fn new(database: Database, assigner: GroupAssigner, clock: Clock) -> Self {
        Self {
            database,
            assigner,
            clock,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Buys a course with the user's balance.
    ///
    /// The funds check, the subscription insert and the debit commit together
    /// or not at all. Placement runs afterwards and cannot undo the purchase.
    pub async fn purchase(
        &self,
        user_id: UserId,
        course_id: CourseId,
    ) -> Result<Enrollment, PurchaseError> {
        let start = Instant::now();
        let result = self.purchase_in_transaction(user_id, course_id).await;
        histogram!("purchase_latency_seconds").record(start.elapsed().as_secs_f64());

        let (subscription, course, remaining) = match result {
            Ok(committed) => committed,
            Err(err) => {
                counter!("purchase_total", "result" => err.metric_label()).increment(1);
                warn!(
                    stage = "purchase",
                    user_id,
                    course_id,
                    error = %err,
                    "purchase rejected"
                );
                return Err(err);
            }
        };

        counter!("purchase_total", "result" => "ok").increment(1);
        info!(
            stage = "purchase",
            user_id,
            course_id,
            subscription_id = subscription.id,
            price = %course.price,
            remaining = %remaining,
            "course purchased"
        );

        let placement = self.publish(&subscription).await;
        Ok(Enrollment {
            subscription,
            course,
            balance: Some(remaining),
            placement,
        })
    }

    async fn purchase_in_transaction(
        &self,
        user_id: UserId,
        course_id: CourseId,
    ) -> Result<(Subscription, Course, Points), PurchaseError> {
        let now = self.now();
        let balances = self.database.balances();
        let subscriptions = self.database.subscriptions();
        let mut tx = self.database.begin_write().await?;

        let balance = balances.fetch_for_user_in(&mut tx, user_id).await?;
        let course = self.database.courses().fetch_in(&mut tx, course_id).await?;
        let existing = subscriptions.find_in(&mut tx, user_id, course_id).await?;

        let quote = check_purchase(balance.amount, course.price, existing.is_some())?;

        let subscription = subscriptions
            .insert(
                &mut tx,
                &NewSubscription {
                    user_id,
                    course_id,
                    is_valid: true,
                    created_at: now,
                },
            )
            .await?;
        balances
            .update_amount(&mut tx, balance.id, quote.remaining, now)
            .await?;

        tx.commit().await?;
        Ok((subscription, course, quote.remaining))
    }

    /// Records a subscription without touching the balance (administrator grant).
    ///
    /// The new row goes through the same placement path as a purchase.
    pub async fn grant(
        &self,
        user_id: UserId,
        course_id: CourseId,
        is_valid: bool,
    ) -> Result<Enrollment, PurchaseError> {
        let now = self.now();
        let subscriptions = self.database.subscriptions();
        let mut tx = self.database.begin_write().await?;

        self.database.users().fetch_in(&mut tx, user_id).await?;
        let course = self.database.courses().fetch_in(&mut tx, course_id).await?;
        if subscriptions
            .find_in(&mut tx, user_id, course_id)
            .await?
            .is_some()
        {
            return Err(PurchaseRejection::AlreadySubscribed.into());
        }

        let subscription = subscriptions
            .insert(
                &mut tx,
                &NewSubscription {
                    user_id,
                    course_id,
                    is_valid,
                    created_at: now,
                },
            )
            .await?;
        tx.commit().await?;

        let validity = if is_valid { "valid" } else { "invalid" };
        counter!("subscription_grants_total", "validity" => validity).increment(1);
        info!(
            stage = "purchase",
            user_id,
            course_id,
            subscription_id = subscription.id,
            is_valid,
            "subscription granted"
        );

        let placement = self.publish(&subscription).await;
        Ok(Enrollment {
            subscription,
            course,
            balance: None,
            placement,
        })
    }

    async fn publish(&self, subscription: &Subscription) -> Option<PlacementOutcome> {
        let event = SubscriptionCreated::new(subscription, self.now());
        self.assigner.dispatch(&event).await
    }
}

/// Committed subscription together with what happened around it.
#[derive(Debug, Clone)]
pub struct Enrollment {
    pub subscription: Subscription,
    pub course: Course,
    /// Balance left after the debit; `None` for grants.
    pub balance: Option<Points>,
    /// `None` when placement failed and was swallowed.
    pub placement: Option<PlacementOutcome>,
}

impl Enrollment {
    pub fn view(&self, user: &User) -> SubscriptionView {
        SubscriptionView::new(&self.subscription, user, &self.course)
    }
}

#[derive(Debug, Error)]
pub enum PurchaseError {
    #[error("user not found")]
    UserNotFound,
    #[error("balance not found")]
    BalanceNotFound,
    #[error("course not found")]
    CourseNotFound,
    #[error(transparent)]
    Rejected(#[from] PurchaseRejection),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("subscription already recorded for this user and course")]
    ConstraintViolation,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl PurchaseError {
    fn metric_label(&self) -> &'static str {
        match self {
            Self::UserNotFound | Self::BalanceNotFound | Self::CourseNotFound => "not_found",
            Self::Rejected(rejection) => rejection.as_str(),
            Self::Validation(_) => "validation_error",
            Self::ConstraintViolation => "constraint_violation",
            Self::Database(_) => "error",
        }
    }
}

impl From<UserError> for PurchaseError {
    fn from(err: UserError) -> Self {
        match err {
            UserError::NotFound => Self::UserNotFound,
            UserError::DuplicateEmail => Self::ConstraintViolation,
            UserError::Validation(err) => Self::Validation(err),
            UserError::Database(err) => Self::Database(err),
        }
    }
}

impl From<BalanceError> for PurchaseError {
    fn from(err: BalanceError) -> Self {
        match err {
            BalanceError::NotFound => Self::BalanceNotFound,
            BalanceError::Validation(err) => Self::Validation(err),
            BalanceError::Database(err) => Self::Database(err),
        }
    }
}

impl From<CourseError> for PurchaseError {
    fn from(err: CourseError) -> Self {
        match err {
            CourseError::NotFound | CourseError::AuthorNotFound => Self::CourseNotFound,
            CourseError::Validation(err) => Self::Validation(err),
            CourseError::Database(err) => Self::Database(err),
        }
    }
}

impl From<SubscriptionError> for PurchaseError {
    fn from(err: SubscriptionError) -> Self {
        match err {
            SubscriptionError::Duplicate => Self::ConstraintViolation,
            SubscriptionError::MissingReference => Self::CourseNotFound,
            SubscriptionError::Database(err) => Self::Database(err),
        }
    }
}

impl From<PurchaseError> for ProblemResponse {
    fn from(err: PurchaseError) -> Self {
        match err {
            PurchaseError::UserNotFound
            | PurchaseError::BalanceNotFound
            | PurchaseError::CourseNotFound => not_found(err.to_string()),
            PurchaseError::Rejected(rejection) => ProblemResponse::new(
                StatusCode::BAD_REQUEST,
                rejection.as_str(),
                rejection.to_string(),
            ),
            PurchaseError::Validation(err) => err.into(),
            PurchaseError::ConstraintViolation => ProblemResponse::new(
                StatusCode::CONFLICT,
                "constraint_violation",
                err.to_string(),
            ),
            PurchaseError::Database(ref inner) => internal_error("purchase", inner),
        }
    }
}
