//! Cluster impact analysis.
//!
//! Aggregates clustered failures into per-cluster [`ClusterSummary`] rows
//! and evaluates them against [`ImpactThreshold`]s.
//!
//! Three metrics are counted over 1, 3 and 7 day windows: failed test
//! results, distinct test runs blocked by a failure, and distinct presubmit
//! runs rejected by a failure. Each is counted three ways:
//! - `nominal`: every failure in the cluster;
//! - `residual_pre_exoneration`: for suggested clusters, excluding failures
//!   already in a bug cluster (bug clusters count everything);
//! - `residual`: as above, also excluding exonerated failures.
//!
//! Thresholds are evaluated against `residual`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::clustering::{ClusterId, Failure};
use crate::config::{ImpactThreshold, MetricThreshold};
use crate::error::{Error, Result};

/// Number of test IDs kept in [`ClusterSummary::top_test_ids`].
pub const TOP_TEST_IDS: usize = 5;

// ============================================================================
// Summary model
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Counts {
    pub nominal: i64,
    pub residual_pre_exoneration: i64,
    pub residual: i64,
}

/// Counts of one metric over the 1, 3 and 7 day windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricCounts {
    pub one_day: Counts,
    pub three_day: Counts,
    pub seven_day: Counts,
}

impl MetricCounts {
    /// Whether any window's residual count reaches its threshold.
    #[must_use]
    pub fn meets(&self, threshold: &MetricThreshold) -> bool {
        let meets = |value: i64, t: Option<i64>| t.is_some_and(|t| value >= t);
        meets(self.one_day.residual, threshold.one_day)
            || meets(self.three_day.residual, threshold.three_day)
            || meets(self.seven_day.residual, threshold.seven_day)
    }

    /// Residual counts as (7 day, 3 day, 1 day), the order clusters are
    /// ranked by.
    #[must_use]
    pub const fn residual_rank(&self) -> [i64; 3] {
        [
            self.seven_day.residual,
            self.three_day.residual,
            self.one_day.residual,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopCount {
    pub value: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSummary {
    pub cluster_id: ClusterId,
    pub failures: MetricCounts,
    pub test_runs_failed: MetricCounts,
    pub presubmit_runs_failed: MetricCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example_failure_reason: Option<String>,
    /// Most frequent test IDs in the cluster over the last 7 days.
    pub top_test_ids: Vec<TopCount>,
}

impl ClusterSummary {
    /// A summary with no failures, as for a cluster that no longer exists.
    #[must_use]
    pub fn empty(cluster_id: ClusterId) -> Self {
        Self {
            cluster_id,
            failures: MetricCounts::default(),
            test_runs_failed: MetricCounts::default(),
            presubmit_runs_failed: MetricCounts::default(),
            example_failure_reason: None,
            top_test_ids: Vec::new(),
        }
    }

    /// Whether the cluster's residual impact reaches `threshold` on any
    /// metric and window. Unset thresholds never trigger.
    #[must_use]
    pub fn meets_threshold(&self, threshold: &ImpactThreshold) -> bool {
        let meets = |counts: &MetricCounts, t: Option<&MetricThreshold>| {
            t.is_some_and(|t| counts.meets(t))
        };
        meets(&self.failures, threshold.test_results_failed.as_ref())
            || meets(&self.test_runs_failed, threshold.test_runs_failed.as_ref())
            || meets(
                &self.presubmit_runs_failed,
                threshold.presubmit_runs_failed.as_ref(),
            )
    }
}

// ============================================================================
// Aggregation
// ============================================================================

#[derive(Default)]
struct DistinctCounter {
    nominal: HashSet<String>,
    residual_pre_exoneration: HashSet<String>,
    residual: HashSet<String>,
}

impl DistinctCounter {
    fn add(&mut self, key: &str, pre_exoneration: bool, residual: bool) {
        self.nominal.insert(key.to_string());
        if pre_exoneration {
            self.residual_pre_exoneration.insert(key.to_string());
        }
        if residual {
            self.residual.insert(key.to_string());
        }
    }

    fn counts(&self) -> Counts {
        Counts {
            nominal: len_i64(self.nominal.len()),
            residual_pre_exoneration: len_i64(self.residual_pre_exoneration.len()),
            residual: len_i64(self.residual.len()),
        }
    }
}

fn len_i64(len: usize) -> i64 {
    i64::try_from(len).unwrap_or(i64::MAX)
}

#[derive(Default)]
struct ClusterAccumulator {
    // Indexed by window: 1, 3, 7 days.
    failures: [DistinctCounter; 3],
    test_runs: [DistinctCounter; 3],
    presubmit_runs: [DistinctCounter; 3],
    example_failure_reason: Option<String>,
    test_ids: BTreeMap<String, i64>,
}

fn metric_counts(counters: &[DistinctCounter; 3]) -> MetricCounts {
    MetricCounts {
        one_day: counters[0].counts(),
        three_day: counters[1].counts(),
        seven_day: counters[2].counts(),
    }
}

/// Summarizes clustered failures as of `now`.
///
/// `failures` yields each failure with all the clusters it is in. Failures
/// older than seven days (or in the future) are ignored. Summaries are
/// returned ordered by cluster ID.
pub fn summarize<'a, I>(now: DateTime<Utc>, failures: I) -> Vec<ClusterSummary>
where
    I: IntoIterator<Item = (&'a Failure, &'a [ClusterId])>,
{
    const WINDOW_DAYS: [i64; 3] = [1, 3, 7];
    let mut clusters: BTreeMap<ClusterId, ClusterAccumulator> = BTreeMap::new();
    // Each failure is counted once per cluster even if it appears in the
    // input more than once.
    let mut seen: HashSet<(usize, &ClusterId)> = HashSet::new();

    for (index, (failure, ids)) in failures.into_iter().enumerate() {
        if failure.partition_time > now {
            continue;
        }
        let age = now - failure.partition_time;
        if age >= Duration::days(7) {
            continue;
        }
        let in_bug_cluster = ids.iter().any(ClusterId::is_bug_cluster);
        let failure_key = index.to_string();

        for id in ids {
            if !seen.insert((index, id)) {
                continue;
            }
            let pre_exoneration = id.is_bug_cluster() || !in_bug_cluster;
            let residual = pre_exoneration && !failure.is_exonerated;
            let acc = clusters.entry(id.clone()).or_default();

            for (w, days) in WINDOW_DAYS.iter().enumerate() {
                if age >= Duration::days(*days) {
                    continue;
                }
                acc.failures[w].add(&failure_key, pre_exoneration, residual);
                if failure.is_test_run_blocked && !failure.test_run_id.is_empty() {
                    acc.test_runs[w].add(&failure.test_run_id, pre_exoneration, residual);
                }
                if failure.is_ingested_invocation_blocked {
                    if let Some(run) = failure.presubmit_run_id.as_deref().filter(|r| !r.is_empty()) {
                        acc.presubmit_runs[w].add(run, pre_exoneration, residual);
                    }
                }
            }
            *acc.test_ids.entry(failure.test_id.clone()).or_default() += 1;
            if acc.example_failure_reason.is_none() {
                if let Some(reason) = failure.reason.as_ref().filter(|r| !r.primary_error_message.is_empty()) {
                    acc.example_failure_reason = Some(reason.primary_error_message.clone());
                }
            }
        }
    }

    clusters
        .into_iter()
        .map(|(cluster_id, acc)| {
            let mut top: Vec<TopCount> = acc
                .test_ids
                .into_iter()
                .map(|(value, count)| TopCount { value, count })
                .collect();
            // Stable sort keeps ascending test ID order among equal counts.
            top.sort_by(|a, b| b.count.cmp(&a.count));
            top.truncate(TOP_TEST_IDS);
            ClusterSummary {
                cluster_id,
                failures: metric_counts(&acc.failures),
                test_runs_failed: metric_counts(&acc.test_runs),
                presubmit_runs_failed: metric_counts(&acc.presubmit_runs),
                example_failure_reason: acc.example_failure_reason,
                top_test_ids: top,
            }
        })
        .collect()
}

// ============================================================================
// Analysis source
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImpactfulClusterReadOptions {
    pub project: String,
    /// Clusters meeting this threshold are returned.
    pub threshold: ImpactThreshold,
    /// Also return every bug cluster, regardless of impact.
    pub always_include_bug_clusters: bool,
}

/// Source of cluster summaries for a project.
#[async_trait]
pub trait AnalysisSource: Send + Sync {
    async fn read_impactful_clusters(
        &self,
        options: &ImpactfulClusterReadOptions,
    ) -> Result<Vec<ClusterSummary>>;
}

/// An [`AnalysisSource`] over summaries held in memory.
#[derive(Default)]
pub struct InMemoryAnalysis {
    projects: Mutex<HashMap<String, Vec<ClusterSummary>>>,
}

impl InMemoryAnalysis {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the summaries of `project`.
    pub fn set_clusters(&self, project: &str, clusters: Vec<ClusterSummary>) -> Result<()> {
        self.projects
            .lock()
            .map_err(|_| Error::analysis("analysis state poisoned"))?
            .insert(project.to_string(), clusters);
        Ok(())
    }
}

#[async_trait]
impl AnalysisSource for InMemoryAnalysis {
    async fn read_impactful_clusters(
        &self,
        options: &ImpactfulClusterReadOptions,
    ) -> Result<Vec<ClusterSummary>> {
        let projects = self
            .projects
            .lock()
            .map_err(|_| Error::analysis("analysis state poisoned"))?;
        Ok(projects
            .get(&options.project)
            .into_iter()
            .flatten()
            .filter(|c| {
                c.meets_threshold(&options.threshold)
                    || (options.always_include_bug_clusters && c.cluster_id.is_bug_cluster())
            })
            .cloned()
            .collect())
    }
}
