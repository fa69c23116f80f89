//! Shared fixtures for integration tests.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use weetbix::analysis::{ClusterSummary, TopCount};
use weetbix::clustering::ClusterId;
use weetbix::config::{
    BugManagerConfig, ImpactThreshold, MetricThreshold, PriorityConfig, ProjectConfig,
    TestNameClusteringRule,
};

pub const PROJECT: &str = "chromium";

pub fn ts(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0)
        .single()
        .expect("valid timestamp")
}

fn windows(one_day: i64, three_day: i64, seven_day: i64) -> ImpactThreshold {
    ImpactThreshold {
        test_results_failed: Some(MetricThreshold {
            one_day: Some(one_day),
            three_day: Some(three_day),
            seven_day: Some(seven_day),
        }),
        ..ImpactThreshold::default()
    }
}

/// A valid chromium config: bugs are filed at 100/300/700 failures over
/// 1/3/7 days; priorities P0 to P3 with 10% hysteresis.
pub fn project_config() -> ProjectConfig {
    ProjectConfig {
        project: PROJECT.to_string(),
        last_updated: ts(2022, 1, 1),
        bug_filing_threshold: windows(100, 300, 700),
        test_name_rules: vec![TestNameClusteringRule {
            name: "Blink Web Tests".to_string(),
            pattern: r"^ninja://:blink_web_tests/(virtual/[^/]+/)?(?P<testname>([^/]+/)+[^/]+\.[a-zA-Z]+).*$"
                .to_string(),
            like_template: r"ninja://:blink\_web\_tests/%${testname}%".to_string(),
        }],
        bug_manager: BugManagerConfig {
            monorail_project: PROJECT.to_string(),
            priorities: vec![
                PriorityConfig {
                    priority: "0".to_string(),
                    threshold: ImpactThreshold {
                        test_results_failed: Some(MetricThreshold::one_day(1000)),
                        ..ImpactThreshold::default()
                    },
                },
                PriorityConfig {
                    priority: "1".to_string(),
                    threshold: ImpactThreshold {
                        test_results_failed: Some(MetricThreshold::one_day(500)),
                        ..ImpactThreshold::default()
                    },
                },
                PriorityConfig {
                    priority: "2".to_string(),
                    threshold: windows(100, 300, 700),
                },
                PriorityConfig {
                    priority: "3".to_string(),
                    threshold: windows(20, 60, 140),
                },
            ],
            priority_hysteresis_percent: 10,
        },
        max_bugs_filed_per_run: 1,
        test_name_impact_margin_percent: 34,
        enable_bug_updates: true,
    }
}

/// A summary with the given residual test result failures.
pub fn summary(cluster_id: ClusterId, one_day: i64, three_day: i64, seven_day: i64) -> ClusterSummary {
    let mut s = ClusterSummary::empty(cluster_id);
    s.failures.one_day.residual = one_day;
    s.failures.three_day.residual = three_day;
    s.failures.seven_day.residual = seven_day;
    s
}

pub fn with_example(mut summary: ClusterSummary, reason: Option<&str>, top_test: Option<&str>) -> ClusterSummary {
    summary.example_failure_reason = reason.map(ToString::to_string);
    summary.top_test_ids = top_test
        .map(|t| {
            vec![TopCount {
                value: t.to_string(),
                count: 1,
            }]
        })
        .unwrap_or_default();
    summary
}
