//! Bugs and the bug tracker collaborator.

pub mod fake;
pub mod policy;
pub mod updater;

use std::fmt;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::clustering::ClusterId;
use crate::error::{Error, Result};

pub use policy::BugPolicy;
pub use updater::{BugUpdater, RunReport};

pub const MONORAIL_SYSTEM: &str = "monorail";

fn monorail_id_regex() -> &'static Regex {
    static_regex!(r"^[a-z0-9\-]+/[1-9][0-9]*$")
}

/// Identifies a bug in a bug tracking system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BugId {
    pub system: String,
    /// System specific ID; for monorail, `{project}/{number}`.
    pub id: String,
}

impl BugId {
    #[must_use]
    pub fn monorail(project: &str, number: u64) -> Self {
        Self {
            system: MONORAIL_SYSTEM.to_string(),
            id: format!("{project}/{number}"),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.system != MONORAIL_SYSTEM {
            return Err(Error::validation(format!(
                "bug tracking system not recognised: {:?}",
                self.system
            )));
        }
        if !monorail_id_regex().is_match(&self.id) {
            return Err(Error::validation(format!(
                "invalid monorail bug ID: {:?}",
                self.id
            )));
        }
        Ok(())
    }
}

impl fmt::Display for BugId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.system, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BugStatus {
    Untriaged,
    Assigned,
    Verified,
}

impl BugStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Untriaged => "Untriaged",
            Self::Assigned => "Assigned",
            Self::Verified => "Verified",
        }
    }
}

impl fmt::Display for BugStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bug as the tracker reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bug {
    pub id: BugId,
    pub title: String,
    pub description: String,
    pub priority: String,
    pub status: BugStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Set when a person chose the priority; automatic priority updates
    /// then stop.
    #[serde(default)]
    pub manual_priority: bool,
    /// Whether a person has changed the priority since it was last set
    /// automatically.
    #[serde(default)]
    pub priority_changed_manually: bool,
}

/// A request to file a new bug for a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    /// Tracker project to file in.
    pub project: String,
    /// The cluster the bug is filed for.
    pub source_cluster: ClusterId,
    /// Filing twice with the same key returns the first bug.
    pub idempotency_key: String,
    pub title: String,
    pub description: String,
    pub priority: String,
}

/// A change to an existing bug.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BugUpdate {
    pub id: BugId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<BugStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    /// Sets or clears the manual priority flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_priority: Option<bool>,
    pub comment: String,
    /// Whether subscribers should be notified.
    pub notify: bool,
}

/// Bug tracker collaborator.
#[async_trait]
pub trait BugTracker: Send + Sync {
    /// Files a bug, or returns the bug already filed with the request's
    /// idempotency key.
    async fn create(&self, request: &CreateRequest) -> Result<BugId>;

    /// Reads the given bugs. Unknown bugs are omitted.
    async fn read(&self, ids: &[BugId]) -> Result<Vec<Bug>>;

    async fn update(&self, update: &BugUpdate) -> Result<()>;
}
