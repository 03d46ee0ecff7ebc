use serde::Serialize;

use enrollsnap_core::{CourseId, ProviderId, Snapshot, SnapshotId, UserId};

/// Rendering switches.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct DiffOptions {
    /// Omit courses in which every user compares equal.
    pub diff_only: bool,
}

impl DiffOptions {
    pub fn diff_only() -> Self {
        Self { diff_only: true }
    }
}

/// Identity of one compared snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SideSummary {
    pub id: SnapshotId,
    pub descriptor: String,
    pub is_valid: bool,
}

impl From<&Snapshot> for SideSummary {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            id: snapshot.id().clone(),
            descriptor: snapshot.descriptor(),
            is_valid: snapshot.is_valid(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderLabel {
    pub id: ProviderId,
    pub label: String,
}

/// One user's enrollment in one course, side by side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserDiff {
    pub user_id: UserId,
    pub label: String,
    pub resolved: bool,
    pub enrolled_a: bool,
    pub enrolled_b: bool,
    pub same: bool,
    pub providers_a: Vec<ProviderLabel>,
    pub providers_b: Vec<ProviderLabel>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CourseDiff {
    pub course_id: CourseId,
    pub label: String,
    /// `false` when the course no longer exists; the label is then `"Unknown {id}"`.
    pub resolved: bool,
    pub differs: bool,
    pub diff_count: usize,
    pub users: Vec<UserDiff>,
}

/// Ids referenced by either snapshot that no longer resolve.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffNotices {
    pub missing_courses: Vec<CourseId>,
    pub missing_users: Vec<UserId>,
}

impl DiffNotices {
    pub fn is_empty(&self) -> bool {
        self.missing_courses.is_empty() && self.missing_users.is_empty()
    }

    /// One warning line per non-empty list.
    pub fn messages(&self) -> Vec<String> {
        let mut messages = Vec::new();
        if !self.missing_courses.is_empty() {
            messages.push(format!(
                "The following course IDs were included in snapshots but can no longer be found: {}",
                join_ids(&self.missing_courses)
            ));
        }
        if !self.missing_users.is_empty() {
            messages.push(format!(
                "The following user IDs were included in snapshots but can no longer be found: {}",
                join_ids(&self.missing_users)
            ));
        }
        messages
    }
}

fn join_ids<T: ToString>(ids: &[T]) -> String {
    ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// Aggregate counts over every compared course, including hidden ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffTotals {
    pub courses_compared: usize,
    pub courses_differing: usize,
    pub users_differing: usize,
    pub courses_hidden: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotDiff {
    pub a: SideSummary,
    pub b: SideSummary,
    pub courses: Vec<CourseDiff>,
    pub notices: DiffNotices,
    pub totals: DiffTotals,
}

impl SnapshotDiff {
    pub fn is_identical(&self) -> bool {
        self.totals.courses_differing == 0
    }
}
