//! Course/user directory boundary.

use crate::id::{CourseId, ProviderId, UserId};
use crate::oracle::OracleError;

/// Enumerates the universe a snapshot is computed over.
///
/// Ordering contract:
/// - `courses_page` is offset-addressable and stable across calls; new
///   courses only ever extend the tail.
/// - `user_ids` may come back in any order; callers sort ascending.
pub trait Directory: Send + Sync {
    /// Number of published courses.
    fn course_count(&self) -> Result<u64, OracleError>;

    /// Up to `limit` published course ids starting at `offset`.
    fn courses_page(&self, offset: u64, limit: usize) -> Result<Vec<CourseId>, OracleError>;

    /// Every user id.
    fn user_ids(&self) -> Result<Vec<UserId>, OracleError>;
}

impl<T: Directory + ?Sized> Directory for std::sync::Arc<T> {
    fn course_count(&self) -> Result<u64, OracleError> {
        (**self).course_count()
    }

    fn courses_page(&self, offset: u64, limit: usize) -> Result<Vec<CourseId>, OracleError> {
        (**self).courses_page(offset, limit)
    }

    fn user_ids(&self) -> Result<Vec<UserId>, OracleError> {
        (**self).user_ids()
    }
}

/// Resolves ids referenced by stored snapshots back to live entities.
///
/// `None` means the entity no longer exists (or is no longer a course).
pub trait EntityResolver {
    fn course_title(&self, course_id: CourseId) -> Option<String>;

    fn user_display_name(&self, user_id: UserId) -> Option<String>;

    fn provider_label(&self, _provider_id: &ProviderId) -> Option<String> {
        None
    }
}
