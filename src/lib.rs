//! Weetbix - test failure clustering and rule matching
//!
//! Groups test failures into clusters using versioned algorithms (failure
//! reason, test name and failure association rules), keeps rule-based
//! clusters up to date incrementally as rules change, and turns cluster
//! impact into bug filing and bug priority decisions.
//!
//! ## Layout
//!
//! - [`rules`]: the rule expression language, rules and the ruleset cache
//! - [`algorithms`]: the clustering algorithms and their registry
//! - [`clustering`]: failures, cluster IDs and clustering results
//! - [`analysis`]: cluster impact aggregation and thresholds
//! - [`bugs`]: bug priority policy and the bug update pass
//! - [`recluster`]: parallel batch re-clustering and shard progress
//! - [`config`]: project configuration
//! - [`store`]: in-memory rule store

#![forbid(unsafe_code)]

#[macro_use]
mod macros;

pub mod algorithms;
pub mod analysis;
pub mod bugs;
pub mod cli;
pub mod clustering;
pub mod config;
pub mod error;
pub mod recluster;
pub mod rules;
pub mod store;

pub use error::{Error, Result};
