//! `enrollsnap-core`: domain foundation for enrollment snapshots.
//!
//! This crate contains **pure domain** primitives (no storage, no scheduling):
//! - the Snapshot job descriptor and its stage machine
//! - the persisted wire format
//! - the boundary traits implemented by the external enrollment system

pub mod catalog;
pub mod directory;
pub mod environment;
pub mod error;
pub mod id;
pub mod oracle;
pub mod snapshot;

pub use catalog::CatalogEntry;
pub use directory::{Directory, EntityResolver};
pub use environment::{Capabilities, EnvironmentTags};
pub use error::{DomainError, DomainResult};
pub use id::{CourseId, ProviderId, SnapshotId, UserId};
pub use oracle::{CheckStrategy, EnrollmentOracle, OracleError};
pub use snapshot::{CourseCursor, Snapshot, Stage};
