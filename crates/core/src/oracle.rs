use std::collections::BTreeSet;

use thiserror::Error;

use crate::environment::EnvironmentTags;
use crate::id::{CourseId, ProviderId, UserId};

/// How the oracle should answer an enrollment question.
///
/// Passed explicitly into every call so no global hook state has to be
/// toggled around a check.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CheckStrategy {
    /// Answer from the cached enrollment terms.
    TrustCache,
    /// Recalculate from the providers; negative results must not be persisted
    /// by the oracle as a side effect.
    Recalculate,
}

impl CheckStrategy {
    pub fn from_trust_cache(trust_cache: bool) -> Self {
        if trust_cache {
            Self::TrustCache
        } else {
            Self::Recalculate
        }
    }
}

/// Failure of an external collaborator call.
///
/// These are transient from the scheduler's point of view: they propagate to
/// the driver and the unit is retried on a later quantum.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OracleError {
    #[error("enrollment check failed for course {course_id}, user {user_id}: {reason}")]
    CheckFailed {
        course_id: CourseId,
        user_id: UserId,
        reason: String,
    },

    #[error("directory lookup failed: {0}")]
    Directory(String),

    #[error("enrollment system unavailable: {0}")]
    Unavailable(String),
}

/// External enrollment decision collaborator.
///
/// Called once per (course, user) pair, so implementations must tolerate
/// courses × users call volume.
pub trait EnrollmentOracle: Send + Sync {
    /// Versions of the components answering enrollment questions.
    fn environment(&self) -> EnvironmentTags;

    fn is_enrolled(
        &self,
        course_id: CourseId,
        user_id: UserId,
        strategy: CheckStrategy,
    ) -> Result<bool, OracleError>;

    /// Providers currently granting the enrollment. Empty when unsupported.
    fn enrollment_providers(
        &self,
        _course_id: CourseId,
        _user_id: UserId,
    ) -> Result<BTreeSet<ProviderId>, OracleError> {
        Ok(BTreeSet::new())
    }
}

impl<T: EnrollmentOracle + ?Sized> EnrollmentOracle for std::sync::Arc<T> {
    fn environment(&self) -> EnvironmentTags {
        (**self).environment()
    }

    fn is_enrolled(
        &self,
        course_id: CourseId,
        user_id: UserId,
        strategy: CheckStrategy,
    ) -> Result<bool, OracleError> {
        (**self).is_enrolled(course_id, user_id, strategy)
    }

    fn enrollment_providers(
        &self,
        course_id: CourseId,
        user_id: UserId,
    ) -> Result<BTreeSet<ProviderId>, OracleError> {
        (**self).enrollment_providers(course_id, user_id)
    }
}
