//! kiln: contract-first code generation.
//!
//! A Charter declares modules, their public interfaces and who uses whom.
//! The planner turns it into a DAG of implement and freeze tasks; the
//! orchestrator runs that DAG on a bounded worker pool, feeding validation
//! failures back into later attempts; interfaces are frozen progressively
//! and any incompatible change to a frozen interface blocks its consumers.

pub mod charter;
pub mod config;
pub mod core;
pub mod error;
pub mod fingerprint;
pub mod freeze;
pub mod log;
pub mod oracle;
pub mod orchestration;
pub mod report;
pub mod store;
pub mod util;
pub mod workspace;

pub use charter::{Charter, Language, ModuleSpec};
pub use error::{Error, Result};
pub use orchestration::{build_plan, Orchestrator};
pub use report::RunReport;
