//! The snapshot job descriptor.
//!
//! A [`Snapshot`] is the complete, serializable state of one batch job:
//! stage, checkpoint cursor, counters and accumulated results. Everything the
//! scheduler needs to resume lives here, never in memory between quanta.
//!
//! ## Invariants
//!
//! - Stage only moves forward: `init -> process -> {end | error}`; terminal
//!   stages never change again.
//! - `total_units` is fixed by [`Snapshot::initialize`].
//! - `completed_units <= total_units`.
//! - `results` only grows; a course commits once.
//! - The in-flight cursor belongs to exactly one course and clears on commit.
//!
//! ## Wire format
//!
//! JSON with ascending maps, so `serialize -> deserialize -> serialize` is
//! byte-identical. Missing, unknown, `null` and wrongly-typed fields default
//! instead of failing.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use crate::catalog::CatalogEntry;
use crate::environment::EnvironmentTags;
use crate::error::{DomainError, DomainResult};
use crate::id::{CourseId, ProviderId, SnapshotId, UserId};

/// Name shown for a snapshot stored without a friendly name.
pub const FALLBACK_FRIENDLY_NAME: &str = "Snapshot";

/// Per-course provider attribution: user -> providers granting enrollment.
pub type ProviderDetails = BTreeMap<UserId, BTreeSet<ProviderId>>;

/// Stage of a snapshot job.
///
/// Stored as a plain string; anything unrecognised (including non-string
/// values) is kept as `Unknown` so a corrupt descriptor still parses and can
/// be failed explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(into = "String")]
pub enum Stage {
    Init,
    Process,
    End,
    Error,
    Unknown(String),
}

impl Stage {
    pub fn as_str(&self) -> &str {
        match self {
            Stage::Init => "init",
            Stage::Process => "process",
            Stage::End => "end",
            Stage::Error => "error",
            Stage::Unknown(raw) => raw,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::End | Stage::Error)
    }
}

impl Default for Stage {
    fn default() -> Self {
        Stage::Unknown(String::new())
    }
}

impl From<String> for Stage {
    fn from(value: String) -> Self {
        match value.as_str() {
            "init" => Stage::Init,
            "process" => Stage::Process,
            "end" => Stage::End,
            "error" => Stage::Error,
            _ => Stage::Unknown(value),
        }
    }
}

impl<'de> Deserialize<'de> for Stage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match serde_json::Value::deserialize(deserializer)? {
            serde_json::Value::String(raw) => Stage::from(raw),
            serde_json::Value::Null => Stage::default(),
            other => Stage::Unknown(other.to_string()),
        })
    }
}

impl From<Stage> for String {
    fn from(value: Stage) -> Self {
        match value {
            Stage::Unknown(raw) => raw,
            other => other.as_str().to_string(),
        }
    }
}

impl core::fmt::Display for Stage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decode a field, falling back to its default on `null` or a type mismatch.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

/// In-flight position inside one course.
///
/// Users are visited in ascending id order, so `latest_user_id` is a
/// monotonic resumption cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CourseCursor {
    #[serde(deserialize_with = "lenient")]
    pub course_id: CourseId,
    #[serde(deserialize_with = "lenient")]
    pub latest_user_id: UserId,
    #[serde(deserialize_with = "lenient")]
    pub students: BTreeSet<UserId>,
    #[serde(deserialize_with = "lenient")]
    pub details: ProviderDetails,
}

impl CourseCursor {
    /// A cursor positioned before the first user of `course_id`.
    pub fn fresh(course_id: CourseId) -> Self {
        Self {
            course_id,
            ..Self::default()
        }
    }

    /// Whether `user_id` was already resolved by this cursor.
    pub fn has_resolved(&self, user_id: UserId) -> bool {
        user_id <= self.latest_user_id
    }
}

/// Serializable state of one enrollment snapshot job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    #[serde(deserialize_with = "lenient")]
    id: SnapshotId,
    #[serde(deserialize_with = "lenient")]
    stage: Stage,
    #[serde(deserialize_with = "lenient")]
    friendly_name: Option<String>,
    #[serde(deserialize_with = "lenient")]
    start_time: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "lenient")]
    end_time: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "lenient")]
    trust_cache: bool,
    #[serde(deserialize_with = "lenient")]
    locked: bool,
    #[serde(deserialize_with = "lenient")]
    total_courses: u64,
    #[serde(deserialize_with = "lenient")]
    total_users: u64,
    #[serde(rename = "total_calculations", deserialize_with = "lenient")]
    total_units: u64,
    #[serde(rename = "done_calculations", deserialize_with = "lenient")]
    completed_units: u64,
    #[serde(deserialize_with = "lenient")]
    results: BTreeMap<CourseId, BTreeSet<UserId>>,
    #[serde(deserialize_with = "lenient")]
    providers: BTreeMap<CourseId, ProviderDetails>,
    #[serde(
        rename = "process_state",
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient"
    )]
    checkpoint: Option<CourseCursor>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    error: Option<String>,
    #[serde(deserialize_with = "lenient")]
    environment_version_tags: EnvironmentTags,
}

impl Snapshot {
    /// Create a fresh job in the `init` stage.
    pub fn start(friendly_name: Option<String>, trust_cache: bool) -> Self {
        let friendly_name = friendly_name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());

        Self {
            id: SnapshotId::new(),
            stage: Stage::Init,
            friendly_name,
            start_time: Some(Utc::now()),
            trust_cache,
            ..Self::default()
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Recover the id of a descriptor too damaged to decode.
    ///
    /// The result carries only the id and an unknown stage, so the scheduler
    /// fails it into the catalog instead of losing track of the job.
    pub fn salvage(raw: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(raw).ok()?;
        let id: SnapshotId = serde_json::from_value(value.get("id")?.clone()).ok()?;
        if id.is_blank() {
            return None;
        }
        Some(Self {
            id,
            ..Self::default()
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    // ---------------------------------------------------------------------
    // Stage machine
    // ---------------------------------------------------------------------

    /// `init -> process`: fix the totals and record the environment.
    ///
    /// Clears any stale checkpoint and partial results.
    pub fn initialize(
        &mut self,
        total_courses: u64,
        total_users: u64,
        tags: EnvironmentTags,
    ) -> DomainResult<()> {
        if self.stage != Stage::Init {
            return Err(DomainError::invariant(format!(
                "cannot initialize a snapshot in stage {}",
                self.stage
            )));
        }

        self.total_courses = total_courses;
        self.total_users = total_users;
        self.total_units = total_courses.saturating_mul(total_users);
        self.completed_units = 0;
        self.checkpoint = None;
        self.results.clear();
        self.providers.clear();
        self.environment_version_tags = tags;
        self.stage = Stage::Process;
        Ok(())
    }

    /// Record one resolved (course, user) unit and its updated cursor.
    ///
    /// Returns `false` if the unit counter was already at `total_units`
    /// (the user universe grew after init) and was not incremented.
    pub fn record_unit(&mut self, cursor: CourseCursor) -> DomainResult<bool> {
        self.require_stage(Stage::Process, "record a unit")?;
        if self.results.contains_key(&cursor.course_id) {
            return Err(DomainError::invariant(format!(
                "course {} is already committed",
                cursor.course_id
            )));
        }

        self.checkpoint = Some(cursor);
        if self.completed_units >= self.total_units {
            return Ok(false);
        }
        self.completed_units += 1;
        Ok(true)
    }

    /// Commit a fully-resolved course and clear the in-flight cursor.
    pub fn commit_course(&mut self, cursor: CourseCursor) -> DomainResult<()> {
        self.require_stage(Stage::Process, "commit a course")?;
        let CourseCursor {
            course_id,
            students,
            details,
            ..
        } = cursor;

        if self.results.contains_key(&course_id) {
            return Err(DomainError::invariant(format!(
                "course {course_id} is already committed"
            )));
        }

        self.results.insert(course_id, students);
        if !details.is_empty() {
            self.providers.insert(course_id, details);
        }
        self.checkpoint = None;
        Ok(())
    }

    /// Move to `end` (unless already failed), stamp the end time and unlock.
    pub fn finish(&mut self) {
        if !self.stage.is_terminal() {
            self.stage = Stage::End;
        }
        if self.end_time.is_none() {
            self.end_time = Some(Utc::now());
        }
        self.locked = false;
    }

    /// Move to `error` with a generic message.
    pub fn fail(&mut self, message: impl Into<String>) -> DomainResult<()> {
        if self.stage.is_terminal() {
            return Err(DomainError::invariant(format!(
                "cannot fail a snapshot in terminal stage {}",
                self.stage
            )));
        }
        self.stage = Stage::Error;
        self.error = Some(message.into());
        Ok(())
    }

    /// Mark the job as owned by a foreground driver.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn unlock(&mut self) {
        self.locked = false;
    }

    fn require_stage(&self, expected: Stage, action: &str) -> DomainResult<()> {
        if self.stage != expected {
            return Err(DomainError::invariant(format!(
                "cannot {action} in stage {} (expected {expected})",
                self.stage
            )));
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Checkpoint
    // ---------------------------------------------------------------------

    /// Number of fully-committed courses; the course resumption offset.
    pub fn course_offset(&self) -> u64 {
        self.results.len() as u64
    }

    pub fn checkpoint(&self) -> Option<&CourseCursor> {
        self.checkpoint.as_ref()
    }

    /// The in-flight cursor for `course_id`, or a fresh one.
    ///
    /// A cursor for a different course is ambiguous state and is discarded;
    /// the second tuple field reports whether that happened.
    pub fn cursor_for(&self, course_id: CourseId) -> (CourseCursor, bool) {
        match &self.checkpoint {
            Some(cursor) if cursor.course_id == course_id => (cursor.clone(), false),
            Some(_) => (CourseCursor::fresh(course_id), true),
            None => (CourseCursor::fresh(course_id), false),
        }
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    pub fn id(&self) -> &SnapshotId {
        &self.id
    }

    pub fn stage(&self) -> &Stage {
        &self.stage
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn trust_cache(&self) -> bool {
        self.trust_cache
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn total_courses(&self) -> u64 {
        self.total_courses
    }

    pub fn total_users(&self) -> u64 {
        self.total_users
    }

    pub fn total_units(&self) -> u64 {
        self.total_units
    }

    pub fn completed_units(&self) -> u64 {
        self.completed_units
    }

    pub fn results(&self) -> &BTreeMap<CourseId, BTreeSet<UserId>> {
        &self.results
    }

    pub fn providers(&self) -> &BTreeMap<CourseId, ProviderDetails> {
        &self.providers
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn environment_version_tags(&self) -> &EnvironmentTags {
        &self.environment_version_tags
    }

    /// Completed without error.
    pub fn is_valid(&self) -> bool {
        self.stage == Stage::End && self.error.is_none()
    }

    pub fn friendly_name(&self) -> &str {
        self.friendly_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(FALLBACK_FRIENDLY_NAME)
    }

    pub fn is_enrolled(&self, course_id: CourseId, user_id: UserId) -> bool {
        self.results
            .get(&course_id)
            .is_some_and(|users| users.contains(&user_id))
    }

    /// Providers recorded as granting `user_id` access to `course_id`.
    pub fn enrolling_providers(&self, course_id: CourseId, user_id: UserId) -> Option<&BTreeSet<ProviderId>> {
        self.providers.get(&course_id)?.get(&user_id)
    }

    /// Course-level progress in percent, rounded to one decimal.
    ///
    /// `None` while the totals are unknown (not yet initialized).
    pub fn percent_complete(&self) -> Option<f64> {
        if self.total_courses == 0 {
            return None;
        }
        if self.stage == Stage::End {
            return Some(100.0);
        }
        let ratio = self.course_offset() as f64 / self.total_courses as f64;
        Some((ratio * 1000.0).round() / 10.0)
    }

    /// Progress text for pollers.
    pub fn progress_label(&self) -> String {
        match self.percent_complete() {
            Some(pct) => format!("{pct:.1}%"),
            None => "Initializing...".to_string(),
        }
    }

    /// `"{name} ({start}; engine: X; addon: Y)"`
    pub fn descriptor(&self) -> String {
        let started = self
            .start_time
            .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
            .unwrap_or_else(|| "unknown date".to_string());
        let tags = &self.environment_version_tags;

        format!(
            "{} ({}; engine: {}; addon: {})",
            self.friendly_name(),
            started,
            tags.engine_version().unwrap_or("unknown"),
            tags.addon_version().unwrap_or("Absent"),
        )
    }

    pub fn catalog_entry(&self) -> CatalogEntry {
        CatalogEntry {
            id: self.id.clone(),
            descriptor: self.descriptor(),
            is_valid: self.is_valid(),
            created_at: self.start_time.unwrap_or_default(),
        }
    }
}
