//! Core domain models for kiln.
//!
//! Tasks, their attempt histories, and the execution DAG.

pub mod attempt;
pub mod dag;
pub mod task;

pub use attempt::{ArtifactRef, Attempt, FailureKind, FailureTrace, Finding, Location, Verdict};
pub use dag::{DependencyKind, TaskDAG};
pub use task::{Task, TaskId, TaskKind, TaskStatus};
