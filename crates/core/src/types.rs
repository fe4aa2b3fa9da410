use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::points::Points;

pub type UserId = i64;
pub type CourseId = i64;
pub type LessonId = i64;
pub type GroupId = i64;
pub type SubscriptionId = i64;
pub type BalanceId = i64;

/// Balance granted to every newly registered user.
pub const DEFAULT_BALANCE: Points = Points::whole(1000);

/// Role a user plays on the platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Teacher,
    #[default]
    Student,
}

impl Role {
    /// Returns the canonical database representation for the role.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Teacher => "TEACHER",
            Self::Student => "STUDENT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "TEACHER" => Some(Self::Teacher),
            "STUDENT" => Some(Self::Student),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub role: Role,
    pub is_staff: bool,
}

impl User {
    /// Full name shown in serialized subscriptions, falling back to the username.
    pub fn display_name(&self) -> String {
        let full = format!("{} {}", self.first_name, self.last_name);
        let full = full.trim();
        if full.is_empty() {
            self.username.clone()
        } else {
            full.to_string()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Course {
    pub id: CourseId,
    pub author_id: UserId,
    pub title: String,
    pub start_date: DateTime<Utc>,
    pub price: Points,
}

impl Course {
    /// A course counts as started from the exact instant of `start_date`.
    pub fn has_started(&self, now: DateTime<Utc>) -> bool {
        self.start_date <= now
    }

    pub fn label(&self) -> String {
        format!("Course: {}", self.title)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lesson {
    pub id: LessonId,
    pub course_id: CourseId,
    pub title: String,
    pub link: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub user_id: UserId,
    pub course_id: CourseId,
    pub is_valid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Group {
    pub id: GroupId,
    pub course_id: CourseId,
    pub title: String,
    pub count_students: u32,
}

/// Membership of a student in a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupMembership {
    pub id: i64,
    pub group_id: GroupId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Balance {
    pub id: BalanceId,
    pub user_id: UserId,
    pub amount: Points,
}

/// Event issued once a subscription row has been committed.
///
/// Group placement consumes it; it is never issued for updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionCreated {
    pub subscription_id: SubscriptionId,
    pub user_id: UserId,
    pub course_id: CourseId,
    pub is_valid: bool,
    pub created_at: DateTime<Utc>,
}

impl SubscriptionCreated {
    pub fn new(subscription: &Subscription, created_at: DateTime<Utc>) -> Self {
        Self {
            subscription_id: subscription.id,
            user_id: subscription.user_id,
            course_id: subscription.course_id,
            is_valid: subscription.is_valid,
            created_at,
        }
    }
}

/// Public representation of a subscription: `{user, course, is_valid}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionView {
    pub user: String,
    pub course: String,
    pub is_valid: bool,
}

impl SubscriptionView {
    pub fn new(subscription: &Subscription, user: &User, course: &Course) -> Self {
        Self {
            user: user.display_name(),
            course: course.label(),
            is_valid: subscription.is_valid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn user(first: &str, last: &str) -> User {
        User {
            id: 1,
            email: "student@example.com".into(),
            username: "student".into(),
            first_name: first.into(),
            last_name: last.into(),
            role: Role::Student,
            is_staff: false,
        }
    }

    #[test]
    fn display_name_falls_back_to_username() {
        assert_eq!(user("Ada", "Lovelace").display_name(), "Ada Lovelace");
        assert_eq!(user("", "").display_name(), "student");
    }

    #[test]
    fn course_started_at_exact_start_instant() {
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        let course = Course {
            id: 1,
            author_id: 1,
            title: "Rust".into(),
            start_date: start,
            price: Points::whole(100),
        };
        assert!(!course.has_started(start - chrono::Duration::seconds(1)));
        assert!(course.has_started(start));
        assert_eq!(course.label(), "Course: Rust");
    }

    #[test]
    fn role_round_trips_through_storage_name() {
        assert_eq!(Role::parse(Role::Teacher.as_str()), Some(Role::Teacher));
        assert_eq!(Role::parse("ADMIN"), None);
        assert_eq!(Role::default(), Role::Student);
    }
}
