//! Failure reason clustering: failures whose primary error messages are the
//! same once numbers, hex values and encoded blobs are blanked out share a
//! cluster.


use regex::Regex;

use super::{AlgorithmId, ClusterDescription, cluster_key_hash};
use crate::analysis::ClusterSummary;
use crate::clustering::{ClusterId, Failure};
use crate::rules::lang::{escape_like, quote_literal};

pub const BUG_DESCRIPTION_TEMPLATE: &str = "This bug is for all test failures where the primary error message is similar to the following (ignoring numbers and hexadecimal values):
{reason}

This bug has been automatically filed by Weetbix in response to a cluster of test failures.";

/// Matches the variable parts of an error message: base64 blobs, hex
/// dumps, hex numbers and decimal numbers.
fn normalizing_regex() -> &'static Regex {
    static_regex!(r"[/+0-9a-zA-Z]{10,}=+|[\-0-9a-fA-F \t]{16,}|[0-9a-fA-Fx]{8,}|[0-9]+")
}

/// Replaces the variable parts of `text` with `%`.
fn normalize(text: &str) -> String {
    normalizing_regex().replace_all(text, "%").into_owned()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureReasonAlgorithm;

impl FailureReasonAlgorithm {
    /// The failure's cluster, or `None` if it has no primary error message.
    #[must_use]
    pub fn cluster(&self, failure: &Failure) -> Option<ClusterId> {
        let reason = failure.primary_error_message();
        if reason.is_empty() {
            return None;
        }
        Some(ClusterId::new(
            AlgorithmId::FAILURE_REASON.to_string(),
            cluster_key_hash(&normalize(reason)),
        ))
    }

    /// A `reason LIKE` rule matching messages that normalize the same way.
    #[must_use]
    pub fn failure_association_rule(&self, failure: &Failure) -> String {
        // Escape first so that `%` and `_` in the message stay literal; the
        // normalizer never matches a backslash so escapes survive it.
        let pattern = normalize(&escape_like(failure.primary_error_message()));
        format!("reason LIKE {}", quote_literal(&pattern))
    }

    #[must_use]
    pub fn cluster_description(&self, summary: &ClusterSummary) -> ClusterDescription {
        let reason = summary
            .example_failure_reason
            .clone()
            .unwrap_or_else(|| summary.cluster_id.to_string());
        ClusterDescription {
            description: BUG_DESCRIPTION_TEMPLATE.replace("{reason}", &reason),
            title: reason,
        }
    }
}
