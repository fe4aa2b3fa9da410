use chrono::{DateTime, Utc};

use crate::types::{Course, GroupId, SubscriptionCreated};

/// Number of groups a course opens before new students overflow into existing ones.
pub const MAX_GROUPS_PER_COURSE: usize = 5;

/// Current population of one of the course's groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupLoad {
    pub group_id: GroupId,
    pub count_students: u32,
}

/// Placement evaluation result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementDecision {
    Place(PlacementAction),
    Skip(SkipReason),
}

impl PlacementDecision {
    /// Returns the metrics label associated with the decision.
    pub fn metric_kind(&self) -> &'static str {
        match self {
            Self::Place(action) => action.as_str(),
            Self::Skip(reason) => reason.as_str(),
        }
    }
}

/// What to do with the student.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementAction {
    /// Open a new group with the student as its first member.
    CreateGroup { title: String },
    /// Seat the student in a group nobody has joined yet; its count becomes 1.
    JoinEmpty { group_id: GroupId },
    /// The course already has its full set of groups; seat the student in the
    /// least populated one and bump its count.
    Overflow { group_id: GroupId },
}

impl PlacementAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateGroup { .. } => "create_group",
            Self::JoinEmpty { .. } => "join_empty",
            Self::Overflow { .. } => "overflow",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoAccess,
    CourseStarted,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoAccess => "no_access",
            Self::CourseStarted => "course_started",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::NoAccess => "no access to the course",
            Self::CourseStarted => "assignment impossible, course already started",
        }
    }
}

/// Decides where the student behind `event` should be seated.
///
/// Groups are ranked by `(count_students, group_id)` so the least populated
/// group wins and ties go to the oldest group, whatever order `groups` came in.
pub fn decide(
    event: &SubscriptionCreated,
    course: &Course,
    now: DateTime<Utc>,
    groups: &[GroupLoad],
) -> PlacementDecision {
    if !event.is_valid {
        return PlacementDecision::Skip(SkipReason::NoAccess);
    }
    if course.has_started(now) {
        return PlacementDecision::Skip(SkipReason::CourseStarted);
    }

    let Some(least) = groups
        .iter()
        .min_by_key(|group| (group.count_students, group.group_id))
    else {
        return PlacementDecision::Place(PlacementAction::CreateGroup {
            title: group_title(1),
        });
    };

    let action = if least.count_students == 0 {
        PlacementAction::JoinEmpty {
            group_id: least.group_id,
        }
    } else if groups.len() < MAX_GROUPS_PER_COURSE {
        PlacementAction::CreateGroup {
            title: group_title(groups.len() + 1),
        }
    } else {
        PlacementAction::Overflow {
            group_id: least.group_id,
        }
    };
    PlacementDecision::Place(action)
}

fn group_title(number: usize) -> String {
    format!("Group {number}")
}
