//! Clustering algorithms.
//!
//! Two suggesting algorithms (failure reason and test name) propose
//! clusters; the rules algorithm places failures in the clusters of the
//! failure association rules they match. Each algorithm's version is part
//! of its wire name, so output of an older version never collides with a
//! newer one.

pub mod failurereason;
pub mod rulesalgorithm;
pub mod testname;

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::analysis::ClusterSummary;
use crate::clustering::{ClusterId, ClusterResults, Failure};
use crate::config::CompiledConfig;
use crate::error::{Error, Result};
use crate::rules::Ruleset;

pub use failurereason::FailureReasonAlgorithm;
pub use rulesalgorithm::{MembershipSet, RulesAlgorithm};
pub use testname::TestNameAlgorithm;

/// Version of the set of clustering algorithms. Bumped whenever an
/// algorithm is added, removed or changes version.
pub const ALGORITHMS_VERSION: i64 = 3;

// ============================================================================
// Algorithm identity
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmKind {
    FailureReason,
    TestName,
    Rules,
}

impl AlgorithmKind {
    /// Name prefix used in the wire form of the algorithm name.
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::FailureReason => "reason",
            Self::TestName => "testname",
            Self::Rules => "rules",
        }
    }
}

/// A clustering algorithm and version, e.g. `reason-v3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AlgorithmId {
    pub kind: AlgorithmKind,
    pub version: u32,
}

impl AlgorithmId {
    pub const FAILURE_REASON: Self = Self {
        kind: AlgorithmKind::FailureReason,
        version: 3,
    };
    pub const TEST_NAME: Self = Self {
        kind: AlgorithmKind::TestName,
        version: 4,
    };
    pub const RULES: Self = Self {
        kind: AlgorithmKind::Rules,
        version: 2,
    };
}

impl fmt::Display for AlgorithmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-v{}", self.kind.prefix(), self.version)
    }
}

impl FromStr for AlgorithmId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::validation(format!("unknown algorithm name {s:?}"));
        let (prefix, version) = s.rsplit_once("-v").ok_or_else(invalid)?;
        let kind = [
            AlgorithmKind::FailureReason,
            AlgorithmKind::TestName,
            AlgorithmKind::Rules,
        ]
        .into_iter()
        .find(|k| k.prefix() == prefix)
        .ok_or_else(invalid)?;
        if version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let version = version.parse().map_err(|_| invalid())?;
        Ok(Self { kind, version })
    }
}

/// Hashes a normalized cluster key into a cluster ID: the first 16 bytes
/// of its SHA-256 digest, hex encoded.
#[must_use]
pub fn cluster_key_hash(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    to_hex(&digest[..16])
}

fn to_hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push(HEX[usize::from(byte >> 4)] as char);
        output.push(HEX[usize::from(byte & 0x0f)] as char);
    }
    output
}

// ============================================================================
// Suggesting algorithms
// ============================================================================

/// Title and description for a bug filed for a suggested cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterDescription {
    pub title: String,
    pub description: String,
}

/// An algorithm that proposes clusters for bugs to be filed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuggestingAlgorithm {
    FailureReason(FailureReasonAlgorithm),
    TestName(TestNameAlgorithm),
}

impl SuggestingAlgorithm {
    #[must_use]
    pub const fn id(&self) -> AlgorithmId {
        match self {
            Self::FailureReason(_) => AlgorithmId::FAILURE_REASON,
            Self::TestName(_) => AlgorithmId::TEST_NAME,
        }
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.id().to_string()
    }

    /// Whether the algorithm's output depends on the project config.
    #[must_use]
    pub const fn uses_config(&self) -> bool {
        matches!(self, Self::TestName(_))
    }

    /// The cluster the failure belongs to, if any.
    #[must_use]
    pub fn cluster(&self, config: &CompiledConfig, failure: &Failure) -> Option<ClusterId> {
        match self {
            Self::FailureReason(a) => a.cluster(failure),
            Self::TestName(a) => Some(a.cluster(config, failure)),
        }
    }

    /// A rule definition matching the failures of the failure's cluster.
    #[must_use]
    pub fn failure_association_rule(&self, config: &CompiledConfig, failure: &Failure) -> String {
        match self {
            Self::FailureReason(a) => a.failure_association_rule(failure),
            Self::TestName(a) => a.failure_association_rule(config, failure),
        }
    }

    /// Bug title and description for a cluster produced by this algorithm.
    #[must_use]
    pub fn cluster_description(&self, summary: &ClusterSummary) -> ClusterDescription {
        match self {
            Self::FailureReason(a) => a.cluster_description(summary),
            Self::TestName(a) => a.cluster_description(summary),
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// The set of clustering algorithms in use.
#[derive(Debug, Clone)]
pub struct Algorithms {
    suggesting: Vec<SuggestingAlgorithm>,
    rules: RulesAlgorithm,
}

impl Default for Algorithms {
    fn default() -> Self {
        Self::new(vec![
            SuggestingAlgorithm::FailureReason(FailureReasonAlgorithm),
            SuggestingAlgorithm::TestName(TestNameAlgorithm),
        ])
    }
}

impl Algorithms {
    #[must_use]
    pub fn new(suggesting: Vec<SuggestingAlgorithm>) -> Self {
        Self {
            suggesting,
            rules: RulesAlgorithm,
        }
    }

    #[must_use]
    pub fn suggesting(&self) -> &[SuggestingAlgorithm] {
        &self.suggesting
    }

    /// The suggesting algorithm with the given wire name.
    #[must_use]
    pub fn suggesting_by_name(&self, name: &str) -> Option<&SuggestingAlgorithm> {
        self.suggesting.iter().find(|a| a.name() == name)
    }

    /// Wire names of every algorithm in the set.
    #[must_use]
    pub fn names(&self) -> BTreeSet<String> {
        self.suggesting
            .iter()
            .map(SuggestingAlgorithm::name)
            .chain(std::iter::once(AlgorithmId::RULES.to_string()))
            .collect()
    }

    /// Clusters `failures`, reusing `existing` (their previous clustering)
    /// where it is still valid:
    /// - suggesting algorithm output is kept if the algorithm version is
    ///   unchanged and, for config dependent algorithms, so is the config;
    /// - rule matches are updated incrementally from `existing.rules_version`.
    #[must_use]
    pub fn cluster(
        &self,
        config: &CompiledConfig,
        ruleset: &Ruleset,
        existing: &ClusterResults,
        failures: &[Failure],
    ) -> ClusterResults {
        let fresh;
        let existing = if existing.clusters.len() == failures.len() {
            existing
        } else {
            tracing::warn!(
                existing = existing.clusters.len(),
                failures = failures.len(),
                "cluster.existing_length_mismatch"
            );
            fresh = ClusterResults::empty(failures.len());
            &fresh
        };

        let rules_name = AlgorithmId::RULES.to_string();
        let config_unchanged = existing.config_version == config.last_updated();
        let reusable: Vec<(String, bool)> = self
            .suggesting
            .iter()
            .map(|a| {
                let name = a.name();
                let reuse = existing.algorithms.contains(&name) && (!a.uses_config() || config_unchanged);
                (name, reuse)
            })
            .collect();
        let existing_rules_version = if existing.algorithms.contains(&rules_name) {
            existing.rules_version
        } else {
            crate::rules::starting_epoch()
        };

        let clusters = failures
            .iter()
            .zip(&existing.clusters)
            .map(|(failure, previous)| {
                let mut ids = Vec::new();
                for (alg, (name, reuse)) in self.suggesting.iter().zip(&reusable) {
                    if *reuse {
                        ids.extend(previous.iter().filter(|c| &c.algorithm == name).cloned());
                    } else if let Some(id) = alg.cluster(config, failure) {
                        ids.push(id);
                    }
                }
                let previous_rules: MembershipSet = previous
                    .iter()
                    .filter(|c| c.algorithm == rules_name)
                    .map(|c| c.id.clone())
                    .collect();
                let matched = self
                    .rules
                    .cluster(ruleset, &previous_rules, existing_rules_version, failure);
                ids.extend(matched.iter().map(ClusterId::for_rule));
                ids.sort();
                ids
            })
            .collect();

        ClusterResults {
            algorithms_version: ALGORITHMS_VERSION,
            config_version: config.last_updated(),
            rules_version: ruleset.rules_version(),
            algorithms: self.names(),
            clusters,
        }
    }
}
