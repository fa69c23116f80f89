//! Bug priority and status policy.
//!
//! A cluster's priority is found by starting from the least urgent
//! configured priority and moving up while the next more urgent priority's
//! threshold is met. The cluster is resolved once it no longer meets the
//! least urgent priority's threshold.
//!
//! Hysteresis keeps bugs from flapping: holding the current priority (or
//! staying open) only needs the threshold deflated by the hysteresis
//! percentage, while raising the priority (or re-opening) needs it inflated.


use regex::Regex;

use super::{Bug, BugStatus, BugUpdate, CreateRequest};
use crate::algorithms::ClusterDescription;
use crate::analysis::ClusterSummary;
use crate::config::{BugManagerConfig, ImpactThreshold, PriorityConfig};
use crate::error::{Error, Result};

/// Maximum length of the cluster part of a bug title, in characters.
pub const MAX_TITLE_LENGTH: usize = 150;

const TITLE_PREFIX: &str = "Tests are failing: ";

const VERIFIED_COMMENT: &str =
    "No further occurrences of the failure cluster have been identified. Weetbix is marking the issue verified.";

const REOPENED_COMMENT: &str =
    "Weetbix has identified new occurrences of the failure cluster. The bug has been re-opened.";

const MANUAL_PRIORITY_COMMENT: &str =
    "The bug priority has been manually set. To re-enable automatic priority updates by Weetbix, clear the manual priority flag.";

fn whitespace_regex() -> &'static Regex {
    static_regex!(r"[ \t\n]+")
}

/// Collapses runs of whitespace and truncates `input` to `max_length`
/// characters, marking truncation with `...`.
#[must_use]
pub fn sanitise_title(input: &str, max_length: usize) -> String {
    let collapsed = whitespace_regex().replace_all(input, " ");
    if collapsed.chars().count() <= max_length {
        return collapsed.into_owned();
    }
    let mut out: String = collapsed.chars().take(max_length.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

#[derive(Debug, Clone, Copy)]
pub struct BugPolicy<'a> {
    config: &'a BugManagerConfig,
    lowest: &'a PriorityConfig,
}

impl<'a> BugPolicy<'a> {
    pub fn new(config: &'a BugManagerConfig) -> Result<Self> {
        let lowest = config.priorities.last().ok_or_else(|| {
            Error::config(format!(
                "no priorities configured for bug tracker project {:?}",
                config.monorail_project
            ))
        })?;
        Ok(Self { config, lowest })
    }

    /// Position of `priority` in the configured list; unknown priorities
    /// rank below every configured one.
    fn index_of(&self, priority: &str) -> usize {
        self.config
            .priorities
            .iter()
            .position(|p| p.priority == priority)
            .unwrap_or(self.config.priorities.len())
    }

    /// Whether `a` is more urgent than `b`.
    #[must_use]
    pub fn is_higher_priority(&self, a: &str, b: &str) -> bool {
        self.index_of(a) < self.index_of(b)
    }

    fn keep(&self, threshold: &ImpactThreshold) -> ImpactThreshold {
        threshold.deflate(self.config.priority_hysteresis_percent)
    }

    fn raise(&self, threshold: &ImpactThreshold) -> ImpactThreshold {
        threshold.inflate(self.config.priority_hysteresis_percent)
    }

    /// The priority the cluster warrants. `current` is the bug's present
    /// priority, or `None` for a bug yet to be filed (no hysteresis).
    #[must_use]
    pub fn cluster_priority(&self, summary: &ClusterSummary, current: Option<&str>) -> &'a str {
        let current = current.map(|p| self.index_of(p));
        let priorities = &self.config.priorities;
        let mut result = self.lowest;
        for (i, p) in priorities.iter().enumerate().rev().skip(1) {
            let threshold = match current {
                None => p.threshold,
                Some(cur) if cur <= i => self.keep(&p.threshold),
                Some(_) => self.raise(&p.threshold),
            };
            if !summary.meets_threshold(&threshold) {
                break;
            }
            result = p;
        }
        &result.priority
    }

    /// Whether the cluster's bug should be closed. `verified` is whether it
    /// currently is.
    #[must_use]
    pub fn cluster_resolved(&self, summary: &ClusterSummary, verified: bool) -> bool {
        let threshold = if verified {
            self.raise(&self.lowest.threshold)
        } else {
            self.keep(&self.lowest.threshold)
        };
        !summary.meets_threshold(&threshold)
    }

    /// The request filing a new bug for the cluster.
    #[must_use]
    pub fn prepare_new(
        &self,
        summary: &ClusterSummary,
        description: &ClusterDescription,
        idempotency_key: String,
    ) -> CreateRequest {
        let mut body = description.description.clone();
        if !summary.top_test_ids.is_empty() {
            body.push_str("\n\nMost frequently failing tests:");
            for t in &summary.top_test_ids {
                body.push_str("\n- ");
                body.push_str(&t.value);
            }
        }
        CreateRequest {
            project: self.config.monorail_project.clone(),
            source_cluster: summary.cluster_id.clone(),
            idempotency_key,
            title: format!(
                "{TITLE_PREFIX}{}",
                sanitise_title(&description.title, MAX_TITLE_LENGTH)
            ),
            description: body,
            priority: self.cluster_priority(summary, None).to_string(),
        }
    }

    /// The change `bug` needs to reflect the cluster's impact, if any.
    #[must_use]
    pub fn plan_update(&self, summary: &ClusterSummary, bug: &Bug) -> Option<BugUpdate> {
        let verified = bug.status == BugStatus::Verified;
        let resolved = self.cluster_resolved(summary, verified);
        let mut update = BugUpdate {
            id: bug.id.clone(),
            status: None,
            priority: None,
            manual_priority: None,
            comment: String::new(),
            notify: false,
        };
        let mut commentary = Vec::new();

        if resolved != verified {
            let status = if resolved {
                commentary.push(VERIFIED_COMMENT.to_string());
                BugStatus::Verified
            } else {
                commentary.push(REOPENED_COMMENT.to_string());
                if bug.owner.is_some() {
                    BugStatus::Assigned
                } else {
                    BugStatus::Untriaged
                }
            };
            update.status = Some(status);
            update.notify = true;
        }

        if !resolved && !bug.manual_priority {
            let priority = self.cluster_priority(summary, Some(&bug.priority));
            if priority != bug.priority && bug.priority_changed_manually {
                // A person set the priority last.
                commentary.push(MANUAL_PRIORITY_COMMENT.to_string());
                update.manual_priority = Some(true);
            } else if priority != bug.priority {
                commentary.push(format!(
                    "The impact of this bug's test failures has changed. Weetbix has adjusted the bug priority from {} to {priority}.",
                    bug.priority
                ));
                update.notify |= self.is_higher_priority(priority, &bug.priority);
                update.priority = Some(priority.to_string());
            }
        }

        if commentary.is_empty() {
            return None;
        }
        update.comment = commentary.join("\n\n");
        Some(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::TopCount;
    use crate::bugs::BugId;
    use crate::clustering::ClusterId;
    use crate::config::tests::test_config;

    fn summary(one_day: i64) -> ClusterSummary {
        let mut s = ClusterSummary::empty(ClusterId::new("reason-v3", "ab"));
        s.failures.one_day.residual = one_day;
        s
    }

    fn bug(priority: &str, status: BugStatus) -> Bug {
        Bug {
            id: BugId::monorail("chromium", 100),
            title: "Tests are failing: boom".to_string(),
            description: String::new(),
            priority: priority.to_string(),
            status,
            owner: None,
            manual_priority: false,
            priority_changed_manually: false,
        }
    }

    #[test]
    fn sanitises_titles() {
        assert_eq!(sanitise_title("a \t\n b\n", 150), "a b ");
        let long = "x".repeat(200);
        let title = sanitise_title(&long, 150);
        assert_eq!(title.chars().count(), 150);
        assert!(title.ends_with("xx..."));
        assert_eq!(sanitise_title("ééé", 3), "ééé");
    }

    #[test]
    fn priority_without_hysteresis() {
        let cfg = test_config();
        let policy = BugPolicy::new(&cfg.bug_manager).unwrap();
        assert_eq!(policy.cluster_priority(&summary(20), None), "3");
        assert_eq!(policy.cluster_priority(&summary(100), None), "2");
        assert_eq!(policy.cluster_priority(&summary(500), None), "1");
        assert_eq!(policy.cluster_priority(&summary(1000), None), "0");
        assert!(policy.cluster_resolved(&summary(17), false));
        assert!(!policy.cluster_resolved(&summary(19), false));
    }

    #[test]
    fn hysteresis_holds_and_raises() {
        let cfg = test_config();
        let policy = BugPolicy::new(&cfg.bug_manager).unwrap();
        // Priority "2" needs 100; 10% hysteresis keeps it down to 90 and
        // raising to it needs 110.
        assert_eq!(policy.cluster_priority(&summary(91), Some("2")), "2");
        assert_eq!(policy.cluster_priority(&summary(89), Some("2")), "3");
        assert_eq!(policy.cluster_priority(&summary(105), Some("3")), "3");
        assert_eq!(policy.cluster_priority(&summary(110), Some("3")), "2");
        // Staying open needs 18, re-opening needs 22.
        assert!(!policy.cluster_resolved(&summary(18), false));
        assert!(policy.cluster_resolved(&summary(21), true));
        assert!(!policy.cluster_resolved(&summary(22), true));
    }

    #[test]
    fn plans_status_and_priority_changes() {
        let cfg = test_config();
        let policy = BugPolicy::new(&cfg.bug_manager).unwrap();

        assert_eq!(policy.plan_update(&summary(50), &bug("3", BugStatus::Untriaged)), None);

        let update = policy.plan_update(&summary(600), &bug("3", BugStatus::Untriaged)).unwrap();
        assert_eq!(update.priority.as_deref(), Some("1"));
        assert_eq!(update.status, None);
        assert!(update.notify);
        assert!(update.comment.contains("from 3 to 1"));

        let update = policy.plan_update(&summary(50), &bug("1", BugStatus::Untriaged)).unwrap();
        assert_eq!(update.priority.as_deref(), Some("3"));
        assert!(!update.notify);

        let update = policy.plan_update(&summary(0), &bug("1", BugStatus::Assigned)).unwrap();
        assert_eq!(update.status, Some(BugStatus::Verified));
        assert_eq!(update.priority, None);

        let mut owned = bug("3", BugStatus::Verified);
        owned.owner = Some("someone@example.com".to_string());
        let update = policy.plan_update(&summary(30), &owned).unwrap();
        assert_eq!(update.status, Some(BugStatus::Assigned));
        let update = policy.plan_update(&summary(30), &bug("3", BugStatus::Verified)).unwrap();
        assert_eq!(update.status, Some(BugStatus::Untriaged));
    }

    #[test]
    fn manual_priority_blocks_priority_changes() {
        let cfg = test_config();
        let policy = BugPolicy::new(&cfg.bug_manager).unwrap();
        let mut manual = bug("3", BugStatus::Untriaged);
        manual.manual_priority = true;
        assert_eq!(policy.plan_update(&summary(2000), &manual), None);
        let update = policy.plan_update(&summary(0), &manual).unwrap();
        assert_eq!(update.status, Some(BugStatus::Verified));
    }

    #[test]
    fn manual_priority_change_is_detected() {
        let cfg = test_config();
        let policy = BugPolicy::new(&cfg.bug_manager).unwrap();
        let mut changed = bug("1", BugStatus::Untriaged);
        changed.priority_changed_manually = true;

        let update = policy.plan_update(&summary(50), &changed).unwrap();
        assert_eq!(update.manual_priority, Some(true));
        assert_eq!(update.priority, None);
        assert!(!update.notify);
        assert!(update.comment.contains("manually set"));

        // Nothing to hand over while the priority is what the impact wants.
        assert_eq!(policy.plan_update(&summary(600), &changed), None);
        // A resolved cluster only changes status.
        let update = policy.plan_update(&summary(0), &changed).unwrap();
        assert_eq!(update.manual_priority, None);
        assert_eq!(update.status, Some(BugStatus::Verified));
    }

    #[test]
    fn new_bug_request() {
        let cfg = test_config();
        let policy = BugPolicy::new(&cfg.bug_manager).unwrap();
        let mut s = summary(150);
        s.top_test_ids = vec![TopCount {
            value: "network-test-1".to_string(),
            count: 10,
        }];
        let request = policy.prepare_new(
            &s,
            &ClusterDescription {
                title: "Failed to connect to\n100.1.1.105.".to_string(),
                description: "desc".to_string(),
            },
            "key".to_string(),
        );
        assert_eq!(request.title, "Tests are failing: Failed to connect to 100.1.1.105.");
        assert_eq!(request.priority, "2");
        assert_eq!(request.project, cfg.bug_manager.monorail_project);
        assert!(request.description.contains("network-test-1"));
        assert_eq!(request.source_cluster, s.cluster_id);
        assert_eq!(request.idempotency_key, "key");
    }

    #[test]
    fn no_priorities_is_an_error() {
        let mut cfg = test_config();
        cfg.bug_manager.priorities.clear();
        assert!(BugPolicy::new(&cfg.bug_manager).is_err());
    }
}
