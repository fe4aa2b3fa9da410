use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use chrono::{DateTime, Utc};
use metrics::counter;
use thiserror::Error;
use tracing::{info, warn};

use course_shop_core::placement::{self, PlacementAction, PlacementDecision, SkipReason};
use course_shop_core::types::{CourseId, GroupId, SubscriptionCreated};
use course_shop_storage::{CourseError, Database, GroupError, NewGroup};

use crate::router::Clock;

/// Seats newly subscribed students into course groups.
///
/// Placement for one course is serialized through a per-course async lock, and
/// the read/decide/write sequence runs in a single transaction, so two
/// concurrent subscriptions cannot both observe the same group counts.
#[derive(Clone)]
pub struct GroupAssigner {
    database: Database,
    clock: Clock,
    course_locks: Arc<Mutex<HashMap<CourseId, Arc<tokio::sync::Mutex<()>>>>>,
}

impl GroupAssigner {
    pub fn new(database: Database, clock: Clock) -> Self {
        Self {
            database,
            clock,
            course_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Handles a `SubscriptionCreated` event without ever failing the caller.
    ///
    /// Errors are logged and counted; `None` means placement failed.
    pub async fn dispatch(&self, event: &SubscriptionCreated) -> Option<PlacementOutcome> {
        match self.assign(event).await {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                counter!("placement_failures_total").increment(1);
                warn!(
                    stage = "placement",
                    subscription_id = event.subscription_id,
                    user_id = event.user_id,
                    course_id = event.course_id,
                    error = %err,
                    "group placement failed; subscription kept"
                );
                None
            }
        }
    }

    /// Evaluates and applies the placement policy for one new subscription.
    pub async fn assign(
        &self,
        event: &SubscriptionCreated,
    ) -> Result<PlacementOutcome, PlacementError> {
        let lock = self.course_lock(event.course_id);
        let _guard = lock.lock().await;

        let now = self.now();
        let groups = self.database.groups();
        let mut tx = self.database.begin_write().await?;
        let course = self
            .database
            .courses()
            .fetch_in(&mut tx, event.course_id)
            .await?;
        let loads = groups.loads_in(&mut tx, course.id).await?;

        let decision = placement::decide(event, &course, now, &loads);
        counter!("placement_total", "action" => decision.metric_kind()).increment(1);

        let action = match decision {
            PlacementDecision::Skip(reason) => {
                info!(
                    stage = "placement",
                    subscription_id = event.subscription_id,
                    course_id = course.id,
                    reason = reason.as_str(),
                    "{}",
                    reason.message()
                );
                return Ok(PlacementOutcome::Skipped(reason));
            }
            PlacementDecision::Place(action) => action,
        };

        let (group_id, created) = match &action {
            PlacementAction::CreateGroup { title } => {
                let group = groups
                    .create_in(
                        &mut tx,
                        &NewGroup {
                            course_id: course.id,
                            title,
                            count_students: 1,
                            created_at: now,
                        },
                    )
                    .await?;
                (group.id, true)
            }
            PlacementAction::JoinEmpty { group_id } | PlacementAction::Overflow { group_id } => {
                (*group_id, false)
            }
        };

        groups
            .add_member_in(&mut tx, group_id, event.user_id, now)
            .await?;

        let count_students = match &action {
            PlacementAction::CreateGroup { .. } => 1,
            PlacementAction::JoinEmpty { .. } => groups.set_count_in(&mut tx, group_id, 1).await?,
            PlacementAction::Overflow { .. } => groups.increment_in(&mut tx, group_id).await?,
        };

        tx.commit().await?;

        info!(
            stage = "placement",
            subscription_id = event.subscription_id,
            user_id = event.user_id,
            course_id = course.id,
            group_id,
            count_students,
            action = action.as_str(),
            "student placed into group"
        );

        Ok(PlacementOutcome::Placed {
            group_id,
            count_students,
            created_group: created,
        })
    }

    /// Returns the lock for `course_id`, dropping entries no placement holds.
    fn course_lock(&self, course_id: CourseId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .course_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(course_id).or_default().clone()
    }

    #[cfg(test)]
    fn tracked_courses(&self) -> Vec<CourseId> {
        let locks = self
            .course_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks.keys().copied().collect()
    }
}

/// Result of handling one `SubscriptionCreated` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementOutcome {
    Placed {
        group_id: GroupId,
        count_students: u32,
        created_group: bool,
    },
    Skipped(SkipReason),
}

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("course lookup failed: {0}")]
    Course(#[from] CourseError),
    #[error("group update failed: {0}")]
    Group(#[from] GroupError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
