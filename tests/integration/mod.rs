//! Integration test suite for kiln.
//!
//! These tests drive the planner, orchestrator, oracle and freeze registry
//! together against a temporary project directory.
//!
//! # Test Categories
//!
//! - `end_to_end`: Charter to frozen interfaces, including drift on re-run
//! - `scheduling`: Dependency order, retry bound, blocked propagation
//! - `resume`: Continuing from persisted state
//! - `drift`: Compatibility rules across runs
//! - `freeze_registry`: Registry durability and concurrency
//!
//! # CI Compatibility
//!
//! The backend and oracle are in-process fixtures; no network calls or
//! external commands are made.

mod fixtures;

mod drift;
mod end_to_end;
mod freeze_registry;
mod resume;
mod scheduling;
