//! Test name clustering.
//!
//! Failures are clustered by the LIKE expression the first matching test
//! name rule produces for their test ID. A test ID no rule matches clusters
//! on its own, LIKE-escaped, so it matches exactly itself.

pub mod rule;

use super::{AlgorithmId, ClusterDescription, cluster_key_hash};
use crate::analysis::ClusterSummary;
use crate::clustering::{ClusterId, Failure};
use crate::config::CompiledConfig;
use crate::rules::lang::{escape_like, quote_literal};

pub const BUG_DESCRIPTION_TEMPLATE: &str = "This bug is for all test failures with the test name: {test_id}

This bug has been automatically filed by Weetbix in response to a cluster of test failures.";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TestNameAlgorithm;

impl TestNameAlgorithm {
    /// The LIKE expression of the first matching rule, or `None` if no
    /// configured rule matches.
    fn rule_like(config: &CompiledConfig, test_id: &str) -> Option<String> {
        config
            .test_name_matchers()
            .iter()
            .find_map(|m| m.evaluate(test_id))
    }

    fn cluster_key(config: &CompiledConfig, test_id: &str) -> String {
        Self::rule_like(config, test_id).unwrap_or_else(|| escape_like(test_id))
    }

    #[must_use]
    pub fn cluster(&self, config: &CompiledConfig, failure: &Failure) -> ClusterId {
        ClusterId::new(
            AlgorithmId::TEST_NAME.to_string(),
            cluster_key_hash(&Self::cluster_key(config, &failure.test_id)),
        )
    }

    #[must_use]
    pub fn failure_association_rule(&self, config: &CompiledConfig, failure: &Failure) -> String {
        match Self::rule_like(config, &failure.test_id) {
            Some(like) => format!("test LIKE {}", quote_literal(&like)),
            None => format!("test = {}", quote_literal(&failure.test_id)),
        }
    }

    #[must_use]
    pub fn cluster_description(&self, summary: &ClusterSummary) -> ClusterDescription {
        let test_id = summary
            .top_test_ids
            .first()
            .map_or_else(|| summary.cluster_id.to_string(), |t| t.value.clone());
        ClusterDescription {
            description: BUG_DESCRIPTION_TEMPLATE.replace("{test_id}", &test_id),
            title: test_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::TopCount;
    use crate::config::tests::test_config;
    use crate::rules::lang::Expr;
    use chrono::{DateTime, Utc};

    fn failure(test_id: &str) -> Failure {
        Failure::new(test_id, Some("boom"), DateTime::<Utc>::UNIX_EPOCH)
    }

    #[test]
    fn rule_matched_tests_share_a_cluster() {
        let config = CompiledConfig::new(test_config()).unwrap();
        let alg = TestNameAlgorithm;
        let a = alg.cluster(&config, &failure("ninja://:blink_web_tests/virtual/v1/dir/a.html"));
        let b = alg.cluster(&config, &failure("ninja://:blink_web_tests/dir/a.html?x=1"));
        let c = alg.cluster(&config, &failure("ninja://:blink_web_tests/dir/b.html"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.algorithm, "testname-v4");
        assert_eq!(a.id, cluster_key_hash("ninja://:blink\\_web\\_tests/%dir/a.html%"));
    }

    #[test]
    fn unmatched_tests_cluster_on_escaped_id() {
        let config = CompiledConfig::new(test_config()).unwrap();
        let alg = TestNameAlgorithm;
        let f = failure("ninja://chrome/test:unit_tests/Suite.Case");
        assert_eq!(
            alg.cluster(&config, &f).id,
            cluster_key_hash("ninja://chrome/test:unit\\_tests/Suite.Case")
        );
        let rule = alg.failure_association_rule(&config, &f);
        assert_eq!(rule, r#"test = "ninja://chrome/test:unit_tests/Suite.Case""#);
        assert!(Expr::parse(&rule).unwrap().evaluate(&f));
    }

    #[test]
    fn association_rule_uses_like_of_matching_rule() {
        let config = CompiledConfig::new(test_config()).unwrap();
        let alg = TestNameAlgorithm;
        let f = failure("ninja://:blink_web_tests/virtual/v1/dir/a_b.html");
        let rule = alg.failure_association_rule(&config, &f);
        assert_eq!(
            rule,
            r#"test LIKE "ninja://:blink\\_web\\_tests/%dir/a\\_b.html%""#
        );
        let expr = Expr::parse(&rule).unwrap();
        assert!(expr.evaluate(&f));
        assert!(expr.evaluate(&failure("ninja://:blink_web_tests/dir/a_b.html")));
        assert!(!expr.evaluate(&failure("ninja://:blink_web_tests/dir/aXb.html")));
    }

    #[test]
    fn description_uses_top_test_id() {
        let mut summary = ClusterSummary::empty(ClusterId::new("testname-v4", "ab"));
        summary.top_test_ids = vec![TopCount {
            value: "ninja://t1".to_string(),
            count: 3,
        }];
        let d = TestNameAlgorithm.cluster_description(&summary);
        assert_eq!(d.title, "ninja://t1");
        assert!(d.description.starts_with("This bug is for all test failures with the test name: ninja://t1"));
    }
}
