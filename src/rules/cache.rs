//! Compiled rulesets and the per-project rules cache.
//!
//! A [`Ruleset`] is an immutable snapshot of a project's active rules with
//! their predicates compiled. New snapshots are derived from old ones by
//! applying the delta of rules changed since the old snapshot, recompiling
//! only rules whose predicate changed. [`RulesCache`] publishes snapshots
//! with an atomic pointer swap so readers never see a partial update.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};

use super::lang::Expr;
use super::{FailureAssociationRule, RuleSource, starting_epoch};
use crate::error::{Error, Result};

/// A rule together with its compiled predicate.
#[derive(Debug, Clone)]
pub struct CachedRule {
    pub rule: FailureAssociationRule,
    pub expr: Expr,
}

impl CachedRule {
    /// Compiles the rule's definition.
    pub fn new(rule: FailureAssociationRule) -> Result<Self> {
        let expr = Expr::parse(&rule.rule_definition).map_err(|err| {
            Error::validation(format!(
                "rule {} has an invalid definition: {err}",
                rule.rule_id
            ))
        })?;
        Ok(Self { rule, expr })
    }

    #[must_use]
    pub fn rule_id(&self) -> &str {
        &self.rule.rule_id
    }

    #[must_use]
    pub const fn predicate_last_updated(&self) -> DateTime<Utc> {
        self.rule.predicate_last_updated
    }
}

/// An immutable snapshot of a project's active rules.
#[derive(Debug, Clone)]
pub struct Ruleset {
    project: String,
    /// Sorted by `predicate_last_updated`, newest first.
    active_rules_sorted: Vec<Arc<CachedRule>>,
    active_rules_by_id: HashMap<String, Arc<CachedRule>>,
    /// Latest `predicate_last_updated` of any rule, active or not.
    rules_version: DateTime<Utc>,
    /// Latest `last_updated` of any rule, active or not.
    last_updated: DateTime<Utc>,
}

impl Ruleset {
    /// The ruleset of a project without rules.
    #[must_use]
    pub fn empty(project: impl Into<String>) -> Self {
        Self::new(project, Vec::new(), starting_epoch(), starting_epoch())
    }

    /// Builds a ruleset from already compiled active rules.
    #[must_use]
    pub fn new(
        project: impl Into<String>,
        mut active_rules: Vec<Arc<CachedRule>>,
        rules_version: DateTime<Utc>,
        last_updated: DateTime<Utc>,
    ) -> Self {
        active_rules.sort_by(|a, b| {
            b.predicate_last_updated()
                .cmp(&a.predicate_last_updated())
                .then_with(|| a.rule_id().cmp(b.rule_id()))
        });
        let active_rules_by_id = active_rules
            .iter()
            .map(|r| (r.rule_id().to_string(), Arc::clone(r)))
            .collect();
        Self {
            project: project.into(),
            active_rules_sorted: active_rules,
            active_rules_by_id,
            rules_version,
            last_updated,
        }
    }

    /// Compiles `rules` (the full set of a project's rules, or at least all
    /// active ones) into a ruleset.
    pub fn compile(project: impl Into<String>, rules: Vec<FailureAssociationRule>) -> Result<Self> {
        Self::empty(project).apply_delta(rules)
    }

    /// Derives the ruleset reflecting `delta`, the rules changed since this
    /// ruleset's `last_updated`. Rules whose predicate did not change keep
    /// their compiled form. Fails if any changed rule does not compile.
    pub fn apply_delta(&self, delta: Vec<FailureAssociationRule>) -> Result<Self> {
        let mut by_id: HashMap<String, Arc<CachedRule>> = self.active_rules_by_id.clone();
        let mut rules_version = self.rules_version;
        let mut last_updated = self.last_updated;
        for rule in delta {
            rules_version = rules_version.max(rule.predicate_last_updated);
            last_updated = last_updated.max(rule.last_updated);
            if !rule.is_active {
                by_id.remove(&rule.rule_id);
                continue;
            }
            let cached = match by_id.get(&rule.rule_id) {
                Some(existing)
                    if existing.predicate_last_updated() == rule.predicate_last_updated
                        && existing.rule.rule_definition == rule.rule_definition =>
                {
                    CachedRule {
                        expr: existing.expr.clone(),
                        rule,
                    }
                }
                _ => CachedRule::new(rule)?,
            };
            by_id.insert(cached.rule.rule_id.clone(), Arc::new(cached));
        }
        Ok(Self::new(
            self.project.clone(),
            by_id.into_values().collect(),
            rules_version,
            last_updated,
        ))
    }

    #[must_use]
    pub fn project(&self) -> &str {
        &self.project
    }

    /// The predicate watermark: every rule whose predicate changed at or
    /// before this time is reflected in the ruleset.
    #[must_use]
    pub const fn rules_version(&self) -> DateTime<Utc> {
        self.rules_version
    }

    #[must_use]
    pub const fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    /// Active rules, most recently changed predicate first.
    #[must_use]
    pub fn active_rules(&self) -> &[Arc<CachedRule>] {
        &self.active_rules_sorted
    }

    #[must_use]
    pub fn active_rule(&self, rule_id: &str) -> Option<&Arc<CachedRule>> {
        self.active_rules_by_id.get(rule_id)
    }

    #[must_use]
    pub fn is_rule_active(&self, rule_id: &str) -> bool {
        self.active_rules_by_id.contains_key(rule_id)
    }

    /// Active rules whose predicate changed strictly after `t`.
    #[must_use]
    pub fn active_rules_with_predicate_updated_since(&self, t: DateTime<Utc>) -> &[Arc<CachedRule>] {
        let end = self
            .active_rules_sorted
            .partition_point(|r| r.predicate_last_updated() > t);
        &self.active_rules_sorted[..end]
    }
}

/// Publishes the current ruleset of a project.
pub struct RulesCache {
    current: ArcSwap<Ruleset>,
}

impl RulesCache {
    #[must_use]
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            current: ArcSwap::from_pointee(Ruleset::empty(project)),
        }
    }

    #[must_use]
    pub fn current(&self) -> Arc<Ruleset> {
        self.current.load_full()
    }

    /// Returns a ruleset whose `rules_version` is at least
    /// `minimum_rules_version`, refreshing from `source` if the cached one
    /// is older.
    pub async fn ruleset<S: RuleSource + ?Sized>(
        &self,
        source: &S,
        minimum_rules_version: DateTime<Utc>,
    ) -> Result<Arc<Ruleset>> {
        let current = self.current();
        if current.rules_version() >= minimum_rules_version {
            return Ok(current);
        }
        let refreshed = self.refresh(source).await?;
        if refreshed.rules_version() < minimum_rules_version {
            return Err(Error::store(format!(
                "rules for project {} are at version {}, older than requested {}",
                refreshed.project(),
                refreshed.rules_version(),
                minimum_rules_version
            )));
        }
        Ok(refreshed)
    }

    /// Reads the rules changed since the cached snapshot and publishes the
    /// updated ruleset. If a changed rule fails to compile, the cached
    /// ruleset stays in place and the error is returned.
    pub async fn refresh<S: RuleSource + ?Sized>(&self, source: &S) -> Result<Arc<Ruleset>> {
        let current = self.current();
        let delta = source
            .read_delta(current.project(), current.last_updated())
            .await?;
        if delta.is_empty() {
            return Ok(current);
        }
        let changed = delta.len();
        let next = match current.apply_delta(delta) {
            Ok(next) => Arc::new(next),
            Err(err) => {
                tracing::warn!(project = %current.project(), error = %err, "rules.refresh_rejected");
                return Err(err);
            }
        };
        // Never move backwards if a concurrent refresh already published a
        // newer snapshot.
        let published = Arc::clone(&next);
        self.current.rcu(move |cur| {
            if cur.last_updated() > published.last_updated() {
                Arc::clone(cur)
            } else {
                Arc::clone(&published)
            }
        });
        tracing::debug!(
            project = %next.project(),
            changed,
            active = next.active_rules().len(),
            rules_version = %next.rules_version(),
            "rules.refreshed"
        );
        Ok(self.current())
    }
}
