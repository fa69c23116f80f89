//! Failure association rules.
//!
//! A rule associates the failures matched by its definition with a bug. Rules
//! are never deleted, only deactivated. Each rule carries two timestamps:
//! `last_updated` advances on any change, `predicate_last_updated` only when
//! the set of failures the rule matches may have changed (its definition or
//! its active flag). The latter drives incremental re-clustering.

pub mod cache;
pub mod lang;


use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bugs::BugId;
use crate::clustering::ClusterId;
use crate::error::{Error, Result};

pub use cache::{CachedRule, RulesCache, Ruleset};
pub use lang::Expr;

/// User recorded against rules created or modified by the system itself.
pub const WEETBIX_SYSTEM: &str = "weetbix";

/// The rules version of a project that has never had a rule: earlier than
/// any real rule timestamp.
#[must_use]
pub fn starting_epoch() -> DateTime<Utc> {
    // 1900-01-01T00:00:00Z
    DateTime::from_timestamp(-2_208_988_800, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Generates a new random rule ID: 32 lowercase hex characters.
#[must_use]
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureAssociationRule {
    pub project: String,
    pub rule_id: String,
    pub rule_definition: String,
    pub bug_id: BugId,
    pub is_active: bool,
    /// Whether the rule's impact drives the priority and status of its bug.
    pub is_managing_bug: bool,
    /// The suggested cluster the rule was created from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_cluster: Option<ClusterId>,
    pub creation_time: DateTime<Utc>,
    pub creation_user: String,
    pub last_updated: DateTime<Utc>,
    pub last_updated_user: String,
    pub predicate_last_updated: DateTime<Utc>,
}

impl FailureAssociationRule {
    /// Checks the rule is well formed and its definition compiles.
    pub fn validate(&self) -> Result<()> {
        if !static_regex!(r"^[a-z0-9\-]{1,40}$").is_match(&self.project) {
            return Err(Error::validation(format!(
                "project must be valid: {:?}",
                self.project
            )));
        }
        if !static_regex!(r"^[0-9a-f]{32}$").is_match(&self.rule_id) {
            return Err(Error::validation(format!(
                "rule ID must be valid: {:?}",
                self.rule_id
            )));
        }
        self.bug_id.validate()?;
        if let Some(source) = &self.source_cluster {
            source
                .validate()
                .map_err(|err| Error::validation(format!("source cluster ID is not valid: {err}")))?;
        }
        if self.creation_user.is_empty() || self.last_updated_user.is_empty() {
            return Err(Error::validation("user must be specified"));
        }
        if self.predicate_last_updated > self.last_updated {
            return Err(Error::validation(
                "predicate_last_updated must not be later than last_updated",
            ));
        }
        Expr::parse(&self.rule_definition)
            .map_err(|err| Error::validation(format!("rule definition is not valid: {err}")))?;
        Ok(())
    }
}

/// Read access to a project's rules.
#[async_trait]
pub trait RuleSource: Send + Sync {
    /// All active rules of the project.
    async fn read_active(&self, project: &str) -> Result<Vec<FailureAssociationRule>>;

    /// Every rule, active or not, with `last_updated` after `since`.
    async fn read_delta(
        &self,
        project: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<FailureAssociationRule>>;

    /// The latest `last_updated` of any rule in the project, or
    /// [`starting_epoch`] if it has none.
    async fn read_last_updated(&self, project: &str) -> Result<DateTime<Utc>>;
}

/// Read-write access to a project's rules.
///
/// The store owns rule timestamps: it stamps `creation_time`,
/// `last_updated` and (when the predicate changed) `predicate_last_updated`
/// with its own commit clock and returns the stored rule.
#[async_trait]
pub trait RuleStore: RuleSource {
    async fn create(&self, rule: FailureAssociationRule) -> Result<FailureAssociationRule>;

    /// Replaces an existing rule. `predicate_changed` must be true if the
    /// definition or the active flag changed.
    async fn update(
        &self,
        rule: FailureAssociationRule,
        predicate_changed: bool,
    ) -> Result<FailureAssociationRule>;
}
