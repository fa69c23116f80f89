//! Core clustering data model: failures, cluster identifiers and the
//! clustering of a chunk of failures.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::algorithms::{AlgorithmKind, AlgorithmId};
use crate::error::{Error, Result};
use crate::rules::lang::{Attributes, Field};
use crate::rules::starting_epoch;

// ============================================================================
// Failures
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReason {
    pub primary_error_message: String,
}

/// One failed test result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Failure {
    pub test_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    #[serde(default)]
    pub variant: BTreeMap<String, String>,
    pub partition_time: DateTime<Utc>,
    #[serde(default)]
    pub is_exonerated: bool,
    #[serde(default)]
    pub test_run_id: String,
    #[serde(default)]
    pub is_test_run_blocked: bool,
    #[serde(default)]
    pub ingested_invocation_id: String,
    #[serde(default)]
    pub is_ingested_invocation_blocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presubmit_run_id: Option<String>,
}

impl Failure {
    /// A failure of `test_id` with the given primary error message and no
    /// run metadata.
    #[must_use]
    pub fn new(test_id: impl Into<String>, reason: Option<&str>, partition_time: DateTime<Utc>) -> Self {
        Self {
            test_id: test_id.into(),
            reason: reason.map(|r| FailureReason {
                primary_error_message: r.to_string(),
            }),
            variant: BTreeMap::new(),
            partition_time,
            is_exonerated: false,
            test_run_id: String::new(),
            is_test_run_blocked: false,
            ingested_invocation_id: String::new(),
            is_ingested_invocation_blocked: false,
            presubmit_run_id: None,
        }
    }

    /// The primary error message, or `""` if the failure has none.
    #[must_use]
    pub fn primary_error_message(&self) -> &str {
        self.reason
            .as_ref()
            .map_or("", |r| r.primary_error_message.as_str())
    }
}

impl Attributes for Failure {
    fn attribute(&self, field: Field) -> Option<&str> {
        match field {
            Field::Test => Some(&self.test_id),
            Field::Reason => self
                .reason
                .as_ref()
                .map(|r| r.primary_error_message.as_str()),
        }
    }
}

// ============================================================================
// Cluster IDs
// ============================================================================

/// Identifies a cluster: the versioned algorithm name plus an
/// algorithm-specific hex identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterId {
    pub algorithm: String,
    pub id: String,
}

impl ClusterId {
    #[must_use]
    pub fn new(algorithm: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            id: id.into(),
        }
    }

    /// Cluster of failures matched by the given failure association rule.
    #[must_use]
    pub fn for_rule(rule_id: &str) -> Self {
        Self::new(AlgorithmId::RULES.to_string(), rule_id)
    }

    /// Checks the algorithm name and ID are well formed.
    pub fn validate(&self) -> Result<()> {
        if !static_regex!(r"^[a-z0-9\-.]{1,32}$").is_match(&self.algorithm) {
            return Err(Error::validation(format!(
                "algorithm not valid: {:?}",
                self.algorithm
            )));
        }
        if !static_regex!(r"^[0-9a-f]{1,32}$").is_match(&self.id) {
            return Err(Error::validation(format!("ID is not valid lowercase hexadecimal bytes: {:?}", self.id)));
        }
        Ok(())
    }

    /// The algorithm this ID was produced by, if it is a known one.
    #[must_use]
    pub fn algorithm_id(&self) -> Option<AlgorithmId> {
        self.algorithm.parse().ok()
    }

    fn has_kind(&self, kind: AlgorithmKind) -> bool {
        self.algorithm
            .strip_prefix(kind.prefix())
            .is_some_and(|rest| rest.starts_with("-v"))
    }

    /// Whether this is a cluster defined by a failure association rule.
    #[must_use]
    pub fn is_bug_cluster(&self) -> bool {
        self.has_kind(AlgorithmKind::Rules)
    }

    #[must_use]
    pub fn is_test_name_cluster(&self) -> bool {
        self.has_kind(AlgorithmKind::TestName)
    }

    #[must_use]
    pub fn is_failure_reason_cluster(&self) -> bool {
        self.has_kind(AlgorithmKind::FailureReason)
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.algorithm, self.id)
    }
}

// ============================================================================
// Clustering results
// ============================================================================

/// The clustering of a chunk of failures, plus the versions of algorithms,
/// config and rules it was computed with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterResults {
    pub algorithms_version: i64,
    pub config_version: DateTime<Utc>,
    pub rules_version: DateTime<Utc>,
    /// Names of the algorithms that produced `clusters`.
    pub algorithms: BTreeSet<String>,
    /// Sorted cluster IDs of each failure, in failure order.
    pub clusters: Vec<Vec<ClusterId>>,
}

impl ClusterResults {
    /// Results for `failures` failures that have never been clustered.
    #[must_use]
    pub fn empty(failures: usize) -> Self {
        Self {
            algorithms_version: 0,
            config_version: starting_epoch(),
            rules_version: starting_epoch(),
            algorithms: BTreeSet::new(),
            clusters: vec![Vec::new(); failures],
        }
    }

    /// Per-failure changes going from `self` to `newer`.
    ///
    /// Both results must describe the same failures in the same order;
    /// surplus entries in either are treated as having no clusters.
    #[must_use]
    pub fn diff(&self, newer: &Self) -> Vec<ClusterDelta> {
        let len = self.clusters.len().max(newer.clusters.len());
        (0..len)
            .map(|i| {
                let old: BTreeSet<&ClusterId> =
                    self.clusters.get(i).into_iter().flatten().collect();
                let new: BTreeSet<&ClusterId> =
                    newer.clusters.get(i).into_iter().flatten().collect();
                ClusterDelta {
                    added: new.difference(&old).map(|&c| c.clone()).collect(),
                    removed: old.difference(&new).map(|&c| c.clone()).collect(),
                }
            })
            .collect()
    }
}

/// Clusters a failure joined and left between two clusterings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterDelta {
    pub added: Vec<ClusterId>,
    pub removed: Vec<ClusterId>,
}

impl ClusterDelta {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}
