//! JSON-described enrollment universe.
//!
//! Stands in for the external enrollment system in tests and when the CLI
//! runs against a recorded universe (`--universe PATH`). A single
//! [`FixtureUniverse`] acts as [`Directory`], [`EnrollmentOracle`] and
//! [`EntityResolver`].
//!
//! ```json
//! {
//!   "environment": { "engine": "3.1.0", "addon": "2.0.0" },
//!   "courses": [{ "id": 1, "title": "Intro" }, { "id": 2, "title": "Draft", "published": false }],
//!   "users": [{ "id": 7, "name": "Ada" }],
//!   "enrollments": [{ "course_id": 1, "user_id": 7, "providers": ["manual"] }],
//!   "provider_labels": { "manual": "Manual Enrollment" }
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use enrollsnap_core::{
    CheckStrategy, CourseId, Directory, EnrollmentOracle, EntityResolver, EnvironmentTags,
    OracleError, ProviderId, UserId,
};

const COURSE_KIND: &str = "course";

#[derive(Debug, thiserror::Error)]
pub enum FixtureError {
    #[error("failed to read universe {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid universe description: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureCourse {
    pub id: CourseId,
    #[serde(default)]
    pub title: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default = "default_published")]
    pub published: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureUser {
    pub id: UserId,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureEnrollment {
    pub course_id: CourseId,
    pub user_id: UserId,
    #[serde(default)]
    pub providers: BTreeSet<ProviderId>,
}

fn default_kind() -> String {
    COURSE_KIND.to_string()
}

fn default_published() -> bool {
    true
}

/// In-memory enrollment universe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixtureUniverse {
    pub environment: EnvironmentTags,
    pub courses: Vec<FixtureCourse>,
    pub users: Vec<FixtureUser>,
    pub enrollments: Vec<FixtureEnrollment>,
    pub provider_labels: BTreeMap<ProviderId, String>,
}

impl FixtureUniverse {
    pub fn new(environment: EnvironmentTags) -> Self {
        Self {
            environment,
            ..Self::default()
        }
    }

    /// Courses `1..=courses` and users `1..=users` on engine 3.0.0, nobody enrolled.
    pub fn grid(courses: u64, users: u64) -> Self {
        let mut universe = Self::new(EnvironmentTags::engine("3.0.0"));
        for id in 1..=courses {
            universe = universe.with_course(id, format!("Course {id}"));
        }
        for id in 1..=users {
            universe = universe.with_user(id, format!("User {id}"));
        }
        universe
    }

    pub fn from_json(raw: &str) -> Result<Self, FixtureError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, FixtureError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| FixtureError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn with_environment(mut self, environment: EnvironmentTags) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_course(mut self, id: u64, title: impl Into<String>) -> Self {
        self.courses.push(FixtureCourse {
            id: CourseId::new(id),
            title: title.into(),
            kind: default_kind(),
            published: true,
        });
        self
    }

    pub fn with_user(mut self, id: u64, name: impl Into<String>) -> Self {
        self.users.push(FixtureUser {
            id: UserId::new(id),
            name: name.into(),
        });
        self
    }

    /// Enroll `user` in `course` with no provider attribution.
    pub fn enroll(self, course: u64, user: u64) -> Self {
        self.enroll_via(course, user, std::iter::empty::<&str>())
    }

    pub fn enroll_via<P: Into<ProviderId>>(
        mut self,
        course: u64,
        user: u64,
        providers: impl IntoIterator<Item = P>,
    ) -> Self {
        let providers: BTreeSet<ProviderId> = providers.into_iter().map(Into::into).collect();
        let (course_id, user_id) = (CourseId::new(course), UserId::new(user));
        match self
            .enrollments
            .iter_mut()
            .find(|e| e.course_id == course_id && e.user_id == user_id)
        {
            Some(existing) => existing.providers.extend(providers),
            None => self.enrollments.push(FixtureEnrollment {
                course_id,
                user_id,
                providers,
            }),
        }
        self
    }

    /// Remove an enrollment (e.g. to simulate a change between two snapshots).
    pub fn unenroll(mut self, course: u64, user: u64) -> Self {
        let (course_id, user_id) = (CourseId::new(course), UserId::new(user));
        self.enrollments
            .retain(|e| !(e.course_id == course_id && e.user_id == user_id));
        self
    }

    /// Drop a course entirely, as if it was deleted after a snapshot was taken.
    pub fn without_course(mut self, course: u64) -> Self {
        let course_id = CourseId::new(course);
        self.courses.retain(|c| c.id != course_id);
        self.enrollments.retain(|e| e.course_id != course_id);
        self
    }

    pub fn with_provider_label(mut self, provider: impl Into<ProviderId>, label: impl Into<String>) -> Self {
        self.provider_labels.insert(provider.into(), label.into());
        self
    }

    fn published_courses(&self) -> Vec<CourseId> {
        let mut ids: Vec<CourseId> = self
            .courses
            .iter()
            .filter(|c| c.published && c.kind == COURSE_KIND)
            .map(|c| c.id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    fn enrollment(&self, course_id: CourseId, user_id: UserId) -> Option<&FixtureEnrollment> {
        self.enrollments
            .iter()
            .find(|e| e.course_id == course_id && e.user_id == user_id)
    }
}

impl Directory for FixtureUniverse {
    fn course_count(&self) -> Result<u64, OracleError> {
        Ok(self.published_courses().len() as u64)
    }

    fn courses_page(&self, offset: u64, limit: usize) -> Result<Vec<CourseId>, OracleError> {
        let offset = usize::try_from(offset)
            .map_err(|_| OracleError::Directory(format!("course offset {offset} out of range")))?;
        Ok(self
            .published_courses()
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect())
    }

    fn user_ids(&self) -> Result<Vec<UserId>, OracleError> {
        Ok(self.users.iter().map(|u| u.id).collect())
    }
}

impl EnrollmentOracle for FixtureUniverse {
    fn environment(&self) -> EnvironmentTags {
        self.environment.clone()
    }

    fn is_enrolled(
        &self,
        course_id: CourseId,
        user_id: UserId,
        _strategy: CheckStrategy,
    ) -> Result<bool, OracleError> {
        Ok(self.enrollment(course_id, user_id).is_some())
    }

    fn enrollment_providers(
        &self,
        course_id: CourseId,
        user_id: UserId,
    ) -> Result<BTreeSet<ProviderId>, OracleError> {
        Ok(self
            .enrollment(course_id, user_id)
            .map(|e| e.providers.clone())
            .unwrap_or_default())
    }
}

impl EntityResolver for FixtureUniverse {
    fn course_title(&self, course_id: CourseId) -> Option<String> {
        self.courses
            .iter()
            .find(|c| c.id == course_id && c.kind == COURSE_KIND)
            .map(|c| c.title.clone())
    }

    fn user_display_name(&self, user_id: UserId) -> Option<String> {
        self.users
            .iter()
            .find(|u| u.id == user_id)
            .map(|u| u.name.clone())
    }

    fn provider_label(&self, provider_id: &ProviderId) -> Option<String> {
        self.provider_labels.get(provider_id).cloned()
    }
}
