//! Compatibility policies deciding whether a re-freeze is allowed.

use serde::{Deserialize, Serialize};

use crate::fingerprint::ApiFingerprint;

/// The project-wide rule named by the Charter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompatibilityRule {
    /// Any change to a frozen surface is drift.
    Strict,
    /// Signatures may be added; none may be removed or changed.
    AdditiveOnly,
}

impl CompatibilityRule {
    pub fn policy(&self) -> &'static dyn CompatibilityPolicy {
        match self {
            CompatibilityRule::Strict => &StrictEquality,
            CompatibilityRule::AdditiveOnly => &AdditiveOnly,
        }
    }
}

impl std::fmt::Display for CompatibilityRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompatibilityRule::Strict => write!(f, "strict"),
            CompatibilityRule::AdditiveOnly => write!(f, "additive_only"),
        }
    }
}

/// How a candidate surface relates to the frozen one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compatibility {
    Identical,
    Compatible { added: Vec<String> },
    Incompatible {
        removed: Vec<String>,
        added: Vec<String>,
    },
}

pub trait CompatibilityPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn compare(&self, frozen: &ApiFingerprint, candidate: &ApiFingerprint) -> Compatibility;
}

pub struct StrictEquality;

impl CompatibilityPolicy for StrictEquality {
    fn name(&self) -> &'static str {
        "strict"
    }

    fn compare(&self, frozen: &ApiFingerprint, candidate: &ApiFingerprint) -> Compatibility {
        if frozen.digest == candidate.digest {
            return Compatibility::Identical;
        }
        let (removed, added) = frozen.diff(candidate);
        Compatibility::Incompatible { removed, added }
    }
}

pub struct AdditiveOnly;

impl CompatibilityPolicy for AdditiveOnly {
    fn name(&self) -> &'static str {
        "additive_only"
    }

    fn compare(&self, frozen: &ApiFingerprint, candidate: &ApiFingerprint) -> Compatibility {
        if frozen.digest == candidate.digest {
            return Compatibility::Identical;
        }
        let (removed, added) = frozen.diff(candidate);
        if removed.is_empty() {
            Compatibility::Compatible { added }
        } else {
            Compatibility::Incompatible { removed, added }
        }
    }
}
