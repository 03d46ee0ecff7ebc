//! Environment fingerprint and the capabilities derived from it.
//!
//! The external enrollment system reports its component versions as tags.
//! A snapshot records the tags once, at init, and every later quantum derives
//! its behaviour from the recorded tags, so a job keeps one behaviour for its
//! whole lifetime even if the environment is upgraded mid-run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Tag key for the enrollment engine version.
pub const ENGINE_TAG: &str = "engine";

/// Tag key for the optional paid-courses addon version.
pub const ADDON_TAG: &str = "addon";

/// Component name -> version string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentTags(BTreeMap<String, String>);

impl EnvironmentTags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tags for an engine version with no addon installed.
    pub fn engine(version: impl Into<String>) -> Self {
        Self::new().with(ENGINE_TAG, version)
    }

    pub fn with(mut self, component: impl Into<String>, version: impl Into<String>) -> Self {
        self.0.insert(component.into(), version.into());
        self
    }

    pub fn get(&self, component: &str) -> Option<&str> {
        self.0.get(component).map(String::as_str)
    }

    pub fn engine_version(&self) -> Option<&str> {
        self.get(ENGINE_TAG)
    }

    pub fn addon_version(&self) -> Option<&str> {
        self.get(ADDON_TAG)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Reject engine/addon combinations that produce unreliable enrollment answers.
    ///
    /// Engine 1.x works with any addon, 2.x needs addon 1.x (or none),
    /// 3.x needs addon 2.x (or none).
    pub fn check_compatible(&self) -> DomainResult<()> {
        let engine = self
            .engine_version()
            .ok_or_else(|| DomainError::validation("enrollment engine is not active"))?;
        let engine_major = major(engine)
            .ok_or_else(|| DomainError::validation(format!("unrecognised engine version {engine:?}")))?;

        let required_addon = match engine_major {
            1 => return Ok(()),
            2 => 1,
            3 => 2,
            other => {
                return Err(DomainError::validation(format!(
                    "unsupported engine major version {other}"
                )));
            }
        };

        match self.addon_version() {
            None => Ok(()),
            Some(addon) if major(addon) == Some(required_addon) => Ok(()),
            Some(addon) => Err(DomainError::validation(format!(
                "engine {engine} must be paired with addon {required_addon}.x (found {addon})"
            ))),
        }
    }

    /// Resolve the versioned capabilities for these tags.
    ///
    /// Only engine 3.x paired with addon 2.x (or no addon) is modern. Any other
    /// combination, including a later engine major, keeps the legacy behaviour.
    pub fn capabilities(&self) -> Capabilities {
        let engine_3 = self.engine_version().and_then(major) == Some(3);
        let addon_fits = self.addon_version().is_none_or(|addon| major(addon) == Some(2));
        let modern = engine_3 && addon_fits;

        Capabilities {
            provider_attribution: modern,
            trusted_cache: modern,
            legacy_budget: !modern,
        }
    }
}

/// Behaviour switches resolved once from [`EnvironmentTags`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Capabilities {
    /// The oracle can report which providers grant an enrollment.
    pub provider_attribution: bool,
    /// The oracle can answer from its cached enrollment terms.
    pub trusted_cache: bool,
    /// Background quanta use the legacy (larger) budget.
    pub legacy_budget: bool,
}

impl Capabilities {
    /// Friendly name used when the operator does not give one.
    pub fn default_friendly_name(&self) -> &'static str {
        if self.provider_attribution {
            "After v3.0 Migration"
        } else {
            "Before v3.0 Migration"
        }
    }
}

fn major(version: &str) -> Option<u32> {
    version.trim().split('.').next()?.parse().ok()
}
