//! In-memory rule store.
//!
//! Stands in for the persistence collaborator in tests and in the CLI. Like
//! a transactional store, it stamps every write with a commit timestamp from
//! a clock that never repeats or goes backwards, so delta reads keyed on
//! `last_updated` never miss a write.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::{Error, Result};
use crate::rules::{FailureAssociationRule, RuleSource, RuleStore, starting_epoch};

#[derive(Default)]
struct State {
    // Keyed by (project, rule ID).
    rules: BTreeMap<(String, String), FailureAssociationRule>,
    last_commit: Option<DateTime<Utc>>,
}

impl State {
    fn commit_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_commit {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_commit = Some(ts);
        ts
    }
}

#[derive(Default)]
pub struct InMemoryRuleStore {
    state: Mutex<State>,
}

impl InMemoryRuleStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::store("rule store state poisoned"))
    }

    /// Stores `rule` without validating it, stamping it as newly created.
    /// Used to load rules from files and to simulate bad data.
    pub fn insert_unchecked(&self, mut rule: FailureAssociationRule) -> Result<()> {
        let mut state = self.lock()?;
        let ts = state.commit_timestamp();
        rule.creation_time = ts;
        rule.last_updated = ts;
        rule.predicate_last_updated = ts;
        state
            .rules
            .insert((rule.project.clone(), rule.rule_id.clone()), rule);
        Ok(())
    }

    /// Every rule of `project`, active or not.
    pub fn read_all(&self, project: &str) -> Result<Vec<FailureAssociationRule>> {
        let state = self.lock()?;
        Ok(state
            .rules
            .values()
            .filter(|r| r.project == project)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RuleSource for InMemoryRuleStore {
    async fn read_active(&self, project: &str) -> Result<Vec<FailureAssociationRule>> {
        Ok(self
            .read_all(project)?
            .into_iter()
            .filter(|r| r.is_active)
            .collect())
    }

    async fn read_delta(
        &self,
        project: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<FailureAssociationRule>> {
        Ok(self
            .read_all(project)?
            .into_iter()
            .filter(|r| r.last_updated > since)
            .collect())
    }

    async fn read_last_updated(&self, project: &str) -> Result<DateTime<Utc>> {
        Ok(self
            .read_all(project)?
            .iter()
            .map(|r| r.last_updated)
            .max()
            .unwrap_or_else(starting_epoch))
    }
}

#[async_trait]
impl RuleStore for InMemoryRuleStore {
    async fn create(&self, mut rule: FailureAssociationRule) -> Result<FailureAssociationRule> {
        rule.validate()?;
        let mut state = self.lock()?;
        let key = (rule.project.clone(), rule.rule_id.clone());
        if state.rules.contains_key(&key) {
            return Err(Error::store(format!(
                "rule {} already exists in project {}",
                rule.rule_id, rule.project
            )));
        }
        let ts = state.commit_timestamp();
        rule.creation_time = ts;
        rule.last_updated = ts;
        rule.predicate_last_updated = ts;
        state.rules.insert(key, rule.clone());
        Ok(rule)
    }

    async fn update(
        &self,
        mut rule: FailureAssociationRule,
        predicate_changed: bool,
    ) -> Result<FailureAssociationRule> {
        let mut state = self.lock()?;
        let key = (rule.project.clone(), rule.rule_id.clone());
        let existing = state.rules.get(&key).ok_or_else(|| {
            Error::store(format!(
                "rule {} not found in project {}",
                rule.rule_id, rule.project
            ))
        })?;
        rule.creation_time = existing.creation_time;
        rule.predicate_last_updated = existing.predicate_last_updated;
        let ts = state.commit_timestamp();
        rule.last_updated = ts;
        if predicate_changed {
            rule.predicate_last_updated = ts;
        }
        rule.validate()?;
        state.rules.insert(key, rule.clone());
        Ok(rule)
    }
}
