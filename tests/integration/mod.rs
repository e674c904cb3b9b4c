//! Integration test suite for hive.
//!
//! These tests drive the public API end to end: the claim protocol under
//! contention, level completion and merging, governance, and full
//! scheduler runs against in-memory and file-backed state.
//!
//! # Test Categories
//!
//! - `claim_races`: Exactly-once claiming and claim gating
//! - `level_flow`: Level completion, merge policy and ship
//! - `governance`: Heartbeats, stalls, escalations and reassignment
//! - `end_to_end`: Full runs through the scheduler
//!
//! # CI Compatibility
//!
//! Worker runtimes and merge engines are mocks; nothing spawns an agent
//! or touches git.

mod fixtures;

mod claim_races;
mod end_to_end;
mod governance;
mod level_flow;
