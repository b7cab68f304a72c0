//! Progressive API freeze: the registry of frozen interfaces and the
//! policies that decide whether a re-freeze is compatible.

pub mod policy;
pub mod registry;

pub use policy::{
    AdditiveOnly, Compatibility, CompatibilityPolicy, CompatibilityRule, StrictEquality,
};
pub use registry::{FreezeCommit, FreezeOutcome, FreezeRecord, FreezeRegistry};
