//! Rule based clustering.
//!
//! A failure is in the cluster of every active rule whose predicate it
//! matches. Given the rule matches a failure had against an older ruleset,
//! only rules whose predicate changed since that ruleset's version are
//! re-evaluated; other matches carry forward.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::clustering::Failure;
use crate::rules::Ruleset;

/// The set of rule IDs a failure matches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipSet(BTreeSet<String>);

impl MembershipSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `rule_id`; returns whether it was newly added.
    pub fn insert(&mut self, rule_id: impl Into<String>) -> bool {
        self.0.insert(rule_id.into())
    }

    /// Removes `rule_id`; returns whether it was present.
    pub fn remove(&mut self, rule_id: &str) -> bool {
        self.0.remove(rule_id)
    }

    #[must_use]
    pub fn contains(&self, rule_id: &str) -> bool {
        self.0.contains(rule_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Rule IDs in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for MembershipSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RulesAlgorithm;

impl RulesAlgorithm {
    /// Computes the rules `failure` matches in `ruleset`.
    ///
    /// `existing` must be the failure's matches against a ruleset at version
    /// `existing_rules_version` from the same lineage as `ruleset` (pass an
    /// empty set and [`crate::rules::starting_epoch`] to evaluate every rule).
    #[must_use]
    pub fn cluster(
        &self,
        ruleset: &Ruleset,
        existing: &MembershipSet,
        existing_rules_version: DateTime<Utc>,
        failure: &Failure,
    ) -> MembershipSet {
        // Carry forward matches of rules that are still active. Rules that
        // were deactivated drop out; changed ones are re-evaluated below.
        let mut ids: MembershipSet = existing
            .iter()
            .filter(|id| ruleset.is_rule_active(id))
            .collect();
        for rule in ruleset.active_rules_with_predicate_updated_since(existing_rules_version) {
            if rule.expr.evaluate(failure) {
                ids.insert(rule.rule_id());
            } else {
                ids.remove(rule.rule_id());
            }
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::tests::rule;
    use crate::rules::{FailureAssociationRule, starting_epoch};
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn t(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 1, 1, 0, minute, 0).unwrap()
    }

    fn id(n: usize) -> String {
        format!("{n:032x}")
    }

    #[test]
    fn membership_set_contract() {
        let mut set = MembershipSet::new();
        assert!(set.insert("b"));
        assert!(set.insert("a"));
        assert!(!set.insert("a"));
        assert!(set.contains("a"));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(set.remove("a"));
        assert!(!set.remove("a"));
        assert_eq!(set.len(), 1);
        assert!(!set.is_empty());
    }

    #[test]
    fn incremental_update_reevaluates_only_changed_rules() {
        let old = Ruleset::compile(
            "chromium",
            vec![
                rule(&id(1), r#"test = "a""#, t(1)),
                rule(&id(2), r#"reason LIKE "%boom%""#, t(2)),
                rule(&id(3), r#"test = "zzz""#, t(2)),
            ],
        )
        .unwrap();
        let failure = Failure::new("a", Some("it went boom"), t(0));
        let alg = RulesAlgorithm;
        let full = alg.cluster(&old, &MembershipSet::new(), starting_epoch(), &failure);
        assert_eq!(full, [id(1), id(2)].into_iter().collect::<MembershipSet>());

        let mut deactivated = rule(&id(1), r#"test = "a""#, t(3));
        deactivated.is_active = false;
        let new = old
            .apply_delta(vec![
                deactivated,
                rule(&id(2), r#"reason LIKE "%bang%""#, t(3)),
                rule(&id(3), r#"test = "a""#, t(4)),
            ])
            .unwrap();
        let incremental = alg.cluster(&new, &full, old.rules_version(), &failure);
        assert_eq!(incremental, [id(3)].into_iter().collect::<MembershipSet>());

        // Matches of unchanged rules carry forward without re-evaluation.
        let other = Failure::new("b", None, t(0));
        let existing = [id(3)].into_iter().collect::<MembershipSet>();
        let carried = alg.cluster(&new, &existing, new.rules_version(), &other);
        assert!(carried.contains(&id(3)));
    }

    const DEFINITIONS: [&str; 6] = [
        r#"test = "a""#,
        r#"test LIKE "a%""#,
        r#"reason LIKE "%boom%""#,
        r#"NOT reason = "boom""#,
        r#"test IN ("b", "c") OR reason LIKE "bang%""#,
        "FALSE",
    ];

    prop_compose! {
        fn arb_rule(max_id: usize)(
            n in 0..max_id,
            def in 0..DEFINITIONS.len(),
            minute in 1u32..30,
            active in proptest::bool::weighted(0.8),
        ) -> FailureAssociationRule {
            let mut r = rule(&id(n), DEFINITIONS[def], t(minute));
            r.is_active = active;
            r
        }
    }

    prop_compose! {
        fn arb_failure()(
            test in prop_oneof![Just("a"), Just("ab"), Just("b"), Just("c")],
            reason in prop_oneof![Just(None), Just(Some("boom")), Just(Some("bang!")), Just(Some("a boom b"))],
        ) -> Failure {
            Failure::new(test, reason, t(0))
        }
    }

    proptest! {
        #[test]
        fn incremental_equals_full_recompute(
            initial in proptest::collection::vec(arb_rule(6), 0..8),
            changes in proptest::collection::vec(arb_rule(8), 0..8),
            failure in arb_failure(),
        ) {
            let old = Ruleset::compile("chromium", initial).unwrap();
            // Changes always commit after the old snapshot.
            let offset = old.rules_version().max(t(0)) - t(0) + chrono::Duration::minutes(1);
            let changes: Vec<FailureAssociationRule> = changes
                .into_iter()
                .map(|mut r| {
                    r.predicate_last_updated += offset;
                    r.last_updated += offset;
                    r
                })
                .collect();
            let new = old.apply_delta(changes).unwrap();

            let alg = RulesAlgorithm;
            let before = alg.cluster(&old, &MembershipSet::new(), starting_epoch(), &failure);
            let incremental = alg.cluster(&new, &before, old.rules_version(), &failure);
            let full = alg.cluster(&new, &MembershipSet::new(), starting_epoch(), &failure);
            prop_assert_eq!(incremental, full);
        }
    }
}
