//! Bug update orchestration.
//!
//! One [`BugUpdater::run`] pass for a project:
//! 1. bails out if bug updates are disabled or re-clustering has not caught
//!    up with the current algorithms, config and rules (impact numbers would
//!    be stale);
//! 2. adjusts the priority and status of bugs managed by active rules to
//!    the impact of their clusters; a rule whose cluster has no impact left
//!    closes its bug;
//! 3. files bugs for the most impactful suggested clusters that reach the
//!    bug filing threshold, creating a rule for each, up to
//!    `max_bugs_filed_per_run`.
//!
//! Impact is residual impact: failures already matched by a rule do not
//! count towards a suggested cluster, so a cluster filed before only comes
//! back once its rule stops covering its failures (for example after the
//! rule was narrowed).
//!
//! Filing is keyed on the suggested cluster and the rules version of the
//! pass. A pass that fails between filing the bug and creating its rule
//! leaves the rules version unchanged, so a retry gets the same bug back.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::policy::BugPolicy;
use super::{BugId, BugTracker};
use crate::algorithms::{ALGORITHMS_VERSION, Algorithms};
use crate::analysis::{AnalysisSource, ClusterSummary, ImpactfulClusterReadOptions};
use crate::clustering::{ClusterId, Failure};
use crate::config::CompiledConfig;
use crate::error::{Error, Result};
use crate::recluster::ProgressSource;
use crate::rules::{FailureAssociationRule, RuleStore, RulesCache, Ruleset, WEETBIX_SYSTEM, generate_id};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    BugUpdatesDisabled,
    /// Re-clustering has not yet incorporated the latest algorithms,
    /// config or rules.
    ReclusteringBehind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiledBug {
    pub source_cluster: ClusterId,
    pub bug_id: BugId,
    pub rule_id: String,
}

/// What a run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub skipped: Option<SkipReason>,
    pub filed: Vec<FiledBug>,
    pub updated: Vec<BugId>,
}

pub struct BugUpdater {
    algorithms: Arc<Algorithms>,
    rules_cache: Arc<RulesCache>,
    rule_store: Arc<dyn RuleStore>,
    analysis: Arc<dyn AnalysisSource>,
    progress: Arc<dyn ProgressSource>,
    tracker: Arc<dyn BugTracker>,
}

impl BugUpdater {
    #[must_use]
    pub fn new(
        algorithms: Arc<Algorithms>,
        rules_cache: Arc<RulesCache>,
        rule_store: Arc<dyn RuleStore>,
        analysis: Arc<dyn AnalysisSource>,
        progress: Arc<dyn ProgressSource>,
        tracker: Arc<dyn BugTracker>,
    ) -> Self {
        Self {
            algorithms,
            rules_cache,
            rule_store,
            analysis,
            progress,
            tracker,
        }
    }

    /// Runs one bug update pass for the project of `config`.
    pub async fn run(&self, config: &CompiledConfig) -> Result<RunReport> {
        let project = config.project();
        let mut report = RunReport::default();
        if !config.config().enable_bug_updates {
            info!(project, "bugs.run_skipped: bug updates disabled");
            report.skipped = Some(SkipReason::BugUpdatesDisabled);
            return Ok(report);
        }
        let policy = BugPolicy::new(&config.config().bug_manager)?;

        let ruleset = self.rules_cache.refresh(self.rule_store.as_ref()).await?;
        if ruleset.project() != project {
            return Err(Error::config(format!(
                "rules cache holds project {}, not {project}",
                ruleset.project()
            )));
        }
        let progress = self.progress.read_progress(project).await?;
        if !progress.incorporates(ALGORITHMS_VERSION, config.last_updated(), ruleset.rules_version()) {
            info!(
                project,
                algorithms_version = progress.algorithms_version,
                config_version = %progress.config_version,
                rules_version = %progress.rules_version,
                complete = progress.complete,
                "bugs.run_skipped: re-clustering in progress"
            );
            report.skipped = Some(SkipReason::ReclusteringBehind);
            return Ok(report);
        }

        let clusters = self
            .analysis
            .read_impactful_clusters(&ImpactfulClusterReadOptions {
                project: project.to_string(),
                threshold: config.config().bug_filing_threshold,
                always_include_bug_clusters: true,
            })
            .await?;
        let (bug_clusters, suggested): (Vec<ClusterSummary>, Vec<ClusterSummary>) = clusters
            .into_iter()
            .partition(|c| c.cluster_id.is_bug_cluster());

        report.updated = self.update_bugs(&policy, &ruleset, bug_clusters).await?;
        report.filed = self.file_bugs(config, &policy, &ruleset, suggested).await?;
        info!(
            project,
            filed = report.filed.len(),
            updated = report.updated.len(),
            "bugs.run_completed"
        );
        Ok(report)
    }

    async fn update_bugs(
        &self,
        policy: &BugPolicy<'_>,
        ruleset: &Ruleset,
        bug_clusters: Vec<ClusterSummary>,
    ) -> Result<Vec<BugId>> {
        let mut impact: HashMap<String, ClusterSummary> = bug_clusters
            .into_iter()
            .map(|c| (c.cluster_id.id.clone(), c))
            .collect();

        // A bug is driven by at most one rule; with several, the rule with
        // the smallest ID wins.
        let mut managing: Vec<&FailureAssociationRule> = ruleset
            .active_rules()
            .iter()
            .map(|r| &r.rule)
            .filter(|r| r.is_managing_bug)
            .collect();
        managing.sort_by(|a, b| a.rule_id.cmp(&b.rule_id));
        let mut seen = HashSet::new();
        managing.retain(|r| {
            let first = seen.insert(r.bug_id.clone());
            if !first {
                warn!(rule_id = %r.rule_id, bug = %r.bug_id, "bugs.duplicate_managing_rule");
            }
            first
        });
        if managing.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<BugId> = managing.iter().map(|r| r.bug_id.clone()).collect();
        let bugs: HashMap<BugId, _> = self
            .tracker
            .read(&ids)
            .await?
            .into_iter()
            .map(|b| (b.id.clone(), b))
            .collect();

        let mut updated = Vec::new();
        for rule in managing {
            let Some(bug) = bugs.get(&rule.bug_id) else {
                warn!(rule_id = %rule.rule_id, bug = %rule.bug_id, "bugs.bug_not_found");
                continue;
            };
            // A cluster absent from the analysis has no impact left.
            let summary = impact
                .remove(&rule.rule_id)
                .unwrap_or_else(|| ClusterSummary::empty(ClusterId::for_rule(&rule.rule_id)));
            let Some(update) = policy.plan_update(&summary, bug) else {
                continue;
            };
            self.tracker.update(&update).await?;
            info!(
                rule_id = %rule.rule_id,
                bug = %bug.id,
                status = ?update.status,
                priority = ?update.priority,
                manual_priority = ?update.manual_priority,
                "bugs.updated"
            );
            updated.push(bug.id.clone());
        }
        Ok(updated)
    }

    async fn file_bugs(
        &self,
        config: &CompiledConfig,
        policy: &BugPolicy<'_>,
        ruleset: &Ruleset,
        suggested: Vec<ClusterSummary>,
    ) -> Result<Vec<FiledBug>> {
        let cfg = config.config();
        let margin = cfg.test_name_impact_margin_percent;
        let test_name_threshold = cfg.bug_filing_threshold.inflate(margin);

        let mut candidates: Vec<ClusterSummary> = suggested
            .into_iter()
            .filter(|c| {
                let threshold = if c.cluster_id.is_test_name_cluster() {
                    &test_name_threshold
                } else {
                    &cfg.bug_filing_threshold
                };
                c.meets_threshold(threshold)
            })
            .collect();
        candidates.sort_by(|a, b| {
            compare_impact(b, a, margin)
                .then_with(|| a.cluster_id.is_test_name_cluster().cmp(&b.cluster_id.is_test_name_cluster()))
                .then_with(|| a.cluster_id.cmp(&b.cluster_id))
        });

        let mut filed = Vec::new();
        for summary in &candidates {
            if filed.len() >= cfg.max_bugs_filed_per_run {
                debug!(
                    project = %config.project(),
                    remaining = candidates.len() - filed.len(),
                    "bugs.filing_limit_reached"
                );
                break;
            }
            if let Some(bug) = self.file_bug(config, policy, ruleset, summary).await? {
                filed.push(bug);
            }
        }
        Ok(filed)
    }

    async fn file_bug(
        &self,
        config: &CompiledConfig,
        policy: &BugPolicy<'_>,
        ruleset: &Ruleset,
        summary: &ClusterSummary,
    ) -> Result<Option<FiledBug>> {
        let cluster_id = &summary.cluster_id;
        let Some(algorithm) = self.algorithms.suggesting_by_name(&cluster_id.algorithm) else {
            debug!(cluster = %cluster_id, "bugs.unknown_algorithm");
            return Ok(None);
        };
        let Some(example) = example_failure(summary) else {
            warn!(cluster = %cluster_id, "bugs.no_example_failure");
            return Ok(None);
        };

        let now = Utc::now();
        let mut rule = FailureAssociationRule {
            project: config.project().to_string(),
            rule_id: generate_id(),
            rule_definition: algorithm.failure_association_rule(config, &example),
            bug_id: BugId::monorail(&config.config().bug_manager.monorail_project, 1),
            is_active: true,
            is_managing_bug: true,
            source_cluster: Some(cluster_id.clone()),
            creation_time: now,
            creation_user: WEETBIX_SYSTEM.to_string(),
            last_updated: now,
            last_updated_user: WEETBIX_SYSTEM.to_string(),
            predicate_last_updated: now,
        };
        // Checked before filing so a bad rule never leaves an orphaned bug.
        rule.validate()?;

        let key = format!("{cluster_id}@{}", ruleset.rules_version().to_rfc3339());
        let request = policy.prepare_new(summary, &algorithm.cluster_description(summary), key);
        rule.bug_id = self.tracker.create(&request).await?;
        let rule = self.rule_store.create(rule).await?;
        info!(
            project = %rule.project,
            cluster = %cluster_id,
            bug = %rule.bug_id,
            rule_id = %rule.rule_id,
            priority = %request.priority,
            "bugs.filed"
        );
        Ok(Some(FiledBug {
            source_cluster: cluster_id.clone(),
            bug_id: rule.bug_id,
            rule_id: rule.rule_id,
        }))
    }
}

/// A failure standing in for the cluster when deriving its rule: the
/// example failure reason for reason clusters, the top test for test name
/// clusters.
fn example_failure(summary: &ClusterSummary) -> Option<Failure> {
    let test_id = summary.top_test_ids.first().map(|t| t.value.as_str());
    let reason = summary.example_failure_reason.as_deref();
    let usable = if summary.cluster_id.is_test_name_cluster() {
        test_id.is_some()
    } else {
        reason.is_some_and(|r| !r.is_empty())
    };
    usable.then(|| Failure::new(test_id.unwrap_or_default(), reason, Utc::now()))
}

/// Compares residual test result failures window by window (7, 3, then 1
/// day), discounting test name clusters by the impact margin.
fn compare_impact(a: &ClusterSummary, b: &ClusterSummary, margin: i64) -> Ordering {
    let weight = |c: &ClusterSummary| {
        i128::from(if c.cluster_id.is_test_name_cluster() {
            100 + margin
        } else {
            100
        })
    };
    let (wa, wb) = (weight(a), weight(b));
    a.failures
        .residual_rank()
        .iter()
        .zip(b.failures.residual_rank().iter())
        .map(|(x, y)| (i128::from(*x) * wb).cmp(&(i128::from(*y) * wa)))
        .find(|o| o.is_ne())
        .unwrap_or(Ordering::Equal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::TopCount;

    fn summary(algorithm: &str, id: &str, seven_day: i64) -> ClusterSummary {
        let mut s = ClusterSummary::empty(ClusterId::new(algorithm, id));
        s.failures.seven_day.residual = seven_day;
        s
    }

    #[test]
    fn test_name_impact_is_discounted() {
        let reason = summary("reason-v3", "aa", 100);
        let close = summary("testname-v4", "bb", 133);
        let far = summary("testname-v4", "cc", 135);
        assert_eq!(compare_impact(&close, &reason, 34), Ordering::Less);
        assert_eq!(compare_impact(&far, &reason, 34), Ordering::Greater);
        let tie = summary("testname-v4", "dd", 134);
        assert_eq!(compare_impact(&tie, &reason, 34), Ordering::Equal);
    }

    #[test]
    fn later_windows_break_ties() {
        let mut a = summary("reason-v3", "aa", 100);
        let mut b = summary("reason-v3", "bb", 100);
        a.failures.three_day.residual = 5;
        b.failures.three_day.residual = 5;
        b.failures.one_day.residual = 1;
        assert_eq!(compare_impact(&a, &b, 34), Ordering::Less);
    }

    #[test]
    fn example_failures() {
        let mut reason = summary("reason-v3", "aa", 1);
        assert!(example_failure(&reason).is_none());
        reason.example_failure_reason = Some("boom".to_string());
        assert_eq!(example_failure(&reason).unwrap().primary_error_message(), "boom");

        let mut test_name = summary("testname-v4", "bb", 1);
        assert!(example_failure(&test_name).is_none());
        test_name.top_test_ids = vec![TopCount {
            value: "ninja://t".to_string(),
            count: 1,
        }];
        assert_eq!(example_failure(&test_name).unwrap().test_id, "ninja://t");
    }
}
