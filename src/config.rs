//! Project configuration.
//!
//! A project config is loaded from JSON, validated as a whole (every finding
//! is reported, each with the path of the offending field) and then compiled
//! into a [`CompiledConfig`] holding the ready-to-run test name matchers.
//! [`ConfigCache`] publishes the compiled config to readers and refuses to
//! replace a good config with one that fails to validate.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::algorithms::testname::rule::{self, TestNameMatcher};
use crate::error::{Error, Result, ValidationIssue};
use crate::rules::starting_epoch;

/// Upper bound for `priority_hysteresis_percent`.
pub const MAX_HYSTERESIS_PERCENT: i64 = 1000;

/// Extra impact, in percent, a test name cluster needs over the bug filing
/// threshold (and over a competing failure reason cluster) to be filed.
pub const DEFAULT_TEST_NAME_IMPACT_MARGIN_PERCENT: i64 = 34;

pub const DEFAULT_MAX_BUGS_FILED_PER_RUN: usize = 1;

// ============================================================================
// Thresholds
// ============================================================================

/// Thresholds for one metric over the 1, 3 and 7 day windows.
///
/// `None` means the window never triggers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricThreshold {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_day: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub three_day: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seven_day: Option<i64>,
}

impl MetricThreshold {
    #[must_use]
    pub const fn one_day(value: i64) -> Self {
        Self {
            one_day: Some(value),
            three_day: None,
            seven_day: None,
        }
    }

    fn map(self, f: impl Fn(i64) -> i64) -> Self {
        Self {
            one_day: self.one_day.map(&f),
            three_day: self.three_day.map(&f),
            seven_day: self.seven_day.map(&f),
        }
    }
}

/// Per-metric impact thresholds. A metric without thresholds never triggers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpactThreshold {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_results_failed: Option<MetricThreshold>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_runs_failed: Option<MetricThreshold>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presubmit_runs_failed: Option<MetricThreshold>,
}

impl ImpactThreshold {
    /// Scales every threshold up by `percent`, rounding up.
    #[must_use]
    pub fn inflate(&self, percent: i64) -> Self {
        self.map(|v| inflate_value(v, percent))
    }

    /// Scales every threshold down by `percent`, rounding down.
    ///
    /// A deflated threshold is met by any value the original is met by.
    #[must_use]
    pub fn deflate(&self, percent: i64) -> Self {
        self.map(|v| deflate_value(v, percent))
    }

    fn map(&self, f: impl Fn(i64) -> i64 + Copy) -> Self {
        Self {
            test_results_failed: self.test_results_failed.map(|m| m.map(f)),
            test_runs_failed: self.test_runs_failed.map(|m| m.map(f)),
            presubmit_runs_failed: self.presubmit_runs_failed.map(|m| m.map(f)),
        }
    }
}

fn inflate_value(value: i64, percent: i64) -> i64 {
    let scaled = i128::from(value) * i128::from(100 + percent);
    let rounded = if scaled >= 0 {
        (scaled + 99) / 100
    } else {
        scaled / 100
    };
    i64::try_from(rounded).unwrap_or(i64::MAX)
}

fn deflate_value(value: i64, percent: i64) -> i64 {
    let scaled = i128::from(value) * 100 / i128::from(100 + percent);
    i64::try_from(scaled).unwrap_or(i64::MAX)
}

// ============================================================================
// Config model
// ============================================================================

/// A test name clustering rule: a regex over test names plus the LIKE
/// template used to build the cluster's association rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestNameClusteringRule {
    pub name: String,
    pub pattern: String,
    pub like_template: String,
}

/// A bug priority and the impact a cluster needs to hold it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorityConfig {
    pub priority: String,
    pub threshold: ImpactThreshold,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BugManagerConfig {
    /// Bug tracker project bugs are filed into.
    pub monorail_project: String,
    /// Priorities from most to least urgent.
    pub priorities: Vec<PriorityConfig>,
    #[serde(default)]
    pub priority_hysteresis_percent: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    pub project: String,
    #[serde(default = "starting_epoch")]
    pub last_updated: DateTime<Utc>,
    pub bug_filing_threshold: ImpactThreshold,
    #[serde(default)]
    pub test_name_rules: Vec<TestNameClusteringRule>,
    pub bug_manager: BugManagerConfig,
    #[serde(default = "default_max_bugs_filed_per_run")]
    pub max_bugs_filed_per_run: usize,
    #[serde(default = "default_test_name_impact_margin_percent")]
    pub test_name_impact_margin_percent: i64,
    #[serde(default = "default_true")]
    pub enable_bug_updates: bool,
}

const fn default_max_bugs_filed_per_run() -> usize {
    DEFAULT_MAX_BUGS_FILED_PER_RUN
}

const fn default_test_name_impact_margin_percent() -> i64 {
    DEFAULT_TEST_NAME_IMPACT_MARGIN_PERCENT
}

const fn default_true() -> bool {
    true
}

impl ProjectConfig {
    /// Reads a JSON project config from disk. The result is not validated.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|err| {
            Error::config(format!("failed to read {}: {err}", path.display()))
        })?;
        serde_json::from_str(&content)
            .map_err(|err| Error::config(format!("failed to parse {}: {err}", path.display())))
    }

    /// The least urgent priority, which bugs must meet to stay open.
    #[must_use]
    pub fn lowest_priority(&self) -> Option<&PriorityConfig> {
        self.bug_manager.priorities.last()
    }
}

// ============================================================================
// Validation
// ============================================================================

#[derive(Default)]
struct ValidationContext {
    path: Vec<String>,
    issues: Vec<ValidationIssue>,
}

impl ValidationContext {
    fn enter<T>(&mut self, name: impl Into<String>, f: impl FnOnce(&mut Self) -> T) -> T {
        self.path.push(name.into());
        let out = f(self);
        self.path.pop();
        out
    }

    fn error(&mut self, message: impl Into<String>) {
        let mut path = String::new();
        for segment in &self.path {
            if !path.is_empty() && !segment.starts_with('[') {
                path.push('.');
            }
            let _ = write!(path, "{segment}");
        }
        self.issues.push(ValidationIssue {
            path,
            message: message.into(),
        });
    }

    fn finish(self) -> Result<()> {
        if self.issues.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(self.issues))
        }
    }
}

/// Validates a project config, reporting every problem found.
pub fn validate_project_config(cfg: &ProjectConfig) -> Result<()> {
    let mut ctx = ValidationContext::default();
    ctx.enter("project", |ctx| {
        if cfg.project.is_empty() {
            ctx.error("empty value is not allowed");
        } else if !static_regex!(r"^[a-z0-9\-]{1,40}$").is_match(&cfg.project) {
            ctx.error(format!("invalid project name: {:?}", cfg.project));
        }
    });
    ctx.enter("bug_filing_threshold", |ctx| {
        validate_impact_threshold(ctx, &cfg.bug_filing_threshold);
    });
    ctx.enter("bug_manager", |ctx| {
        validate_bug_manager(ctx, &cfg.bug_manager, &cfg.bug_filing_threshold);
    });
    ctx.enter("test_name_impact_margin_percent", |ctx| {
        if cfg.test_name_impact_margin_percent < 0 {
            ctx.error("value must not be negative");
        }
    });
    ctx.enter("test_name_rules", |ctx| {
        validate_test_name_rules(ctx, &cfg.test_name_rules);
    });
    ctx.finish()
}

fn validate_bug_manager(
    ctx: &mut ValidationContext,
    cfg: &BugManagerConfig,
    bug_filing: &ImpactThreshold,
) {
    ctx.enter("monorail_project", |ctx| {
        if cfg.monorail_project.is_empty() {
            ctx.error("empty value is not allowed");
        } else if !static_regex!(r"^[a-z0-9][-a-z0-9]{0,61}[a-z0-9]$")
            .is_match(&cfg.monorail_project)
        {
            ctx.error(format!("invalid project: {:?}", cfg.monorail_project));
        }
    });
    ctx.enter("priorities", |ctx| {
        if cfg.priorities.is_empty() {
            ctx.error("at least one priority must be specified");
        }
        let last = cfg.priorities.len().saturating_sub(1);
        for (i, p) in cfg.priorities.iter().enumerate() {
            ctx.enter(format!("[{i}]"), |ctx| {
                ctx.enter("priority", |ctx| {
                    if p.priority.is_empty() {
                        ctx.error("empty value is not allowed");
                    }
                });
                ctx.enter("threshold", |ctx| {
                    validate_impact_threshold(ctx, &p.threshold);
                    if i == last {
                        validate_satisfied_by_bug_filing(ctx, &p.threshold, bug_filing);
                    }
                });
            });
        }
    });
    ctx.enter("priority_hysteresis_percent", |ctx| {
        if cfg.priority_hysteresis_percent > MAX_HYSTERESIS_PERCENT {
            ctx.error(format!(
                "value must not exceed {MAX_HYSTERESIS_PERCENT} percent"
            ));
        }
        if cfg.priority_hysteresis_percent < 0 {
            ctx.error("value must not be negative");
        }
    });
}

fn metrics(t: &ImpactThreshold) -> [(&'static str, Option<&MetricThreshold>); 3] {
    [
        ("test_results_failed", t.test_results_failed.as_ref()),
        ("test_runs_failed", t.test_runs_failed.as_ref()),
        ("presubmit_runs_failed", t.presubmit_runs_failed.as_ref()),
    ]
}

fn windows(m: &MetricThreshold) -> [(&'static str, Option<i64>); 3] {
    [
        ("one_day", m.one_day),
        ("three_day", m.three_day),
        ("seven_day", m.seven_day),
    ]
}

fn validate_impact_threshold(ctx: &mut ValidationContext, t: &ImpactThreshold) {
    for (metric, threshold) in metrics(t) {
        let Some(threshold) = threshold else { continue };
        ctx.enter(metric, |ctx| {
            for (window, value) in windows(threshold) {
                if value.is_some_and(|v| v < 0) {
                    ctx.enter(window, |ctx| ctx.error("value must be non-negative"));
                }
            }
        });
    }
}

/// Bugs that get filed must meet the criteria to stay open, so the lowest
/// priority's threshold can be no higher than the bug filing threshold.
fn validate_satisfied_by_bug_filing(
    ctx: &mut ValidationContext,
    keep_open: &ImpactThreshold,
    bug_filing: &ImpactThreshold,
) {
    for ((metric, keep), (_, filing)) in metrics(keep_open).into_iter().zip(metrics(bug_filing)) {
        let Some(filing) = filing else { continue };
        let keep = keep.copied().unwrap_or_default();
        ctx.enter(metric, |ctx| {
            for ((window, keep), (_, filing)) in windows(&keep).into_iter().zip(windows(filing)) {
                let Some(filing) = filing.filter(|v| *v >= 0) else {
                    continue;
                };
                ctx.enter(window, |ctx| match keep {
                    None => ctx.error(format!(
                        "{window} threshold must be set, with a value of at most {filing} (the configured bug-filing threshold)"
                    )),
                    Some(v) if v > filing => ctx.error(format!(
                        "value must be at most {filing} (the configured bug-filing threshold)"
                    )),
                    Some(_) => {}
                });
            }
        });
    }
}

fn validate_test_name_rules(ctx: &mut ValidationContext, rules: &[TestNameClusteringRule]) {
    let mut seen = std::collections::HashSet::new();
    for (i, r) in rules.iter().enumerate() {
        ctx.enter(format!("[{i}]"), |ctx| {
            ctx.enter("name", |ctx| {
                if r.name.is_empty() {
                    ctx.error("empty value is not allowed");
                } else if !seen.insert(r.name.as_str()) {
                    ctx.error(format!("duplicate rule name {:?}", r.name));
                }
            });
            if let Err(err) = rule::compile(r) {
                ctx.error(err.to_string());
            }
        });
    }
}

// ============================================================================
// Compiled config and cache
// ============================================================================

/// A validated project config with its test name rules compiled.
#[derive(Debug)]
pub struct CompiledConfig {
    config: ProjectConfig,
    test_name_matchers: Vec<TestNameMatcher>,
}

impl CompiledConfig {
    /// Validates and compiles `config`.
    pub fn new(config: ProjectConfig) -> Result<Self> {
        validate_project_config(&config)?;
        let test_name_matchers = config
            .test_name_rules
            .iter()
            .map(rule::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            config,
            test_name_matchers,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &ProjectConfig {
        &self.config
    }

    #[must_use]
    pub fn project(&self) -> &str {
        &self.config.project
    }

    /// Version of the config, used to decide whether config-dependent
    /// clustering output is still current.
    #[must_use]
    pub const fn last_updated(&self) -> DateTime<Utc> {
        self.config.last_updated
    }

    /// Test name matchers in priority order.
    #[must_use]
    pub fn test_name_matchers(&self) -> &[TestNameMatcher] {
        &self.test_name_matchers
    }
}

/// Holds the current compiled config for a project.
pub struct ConfigCache {
    current: ArcSwap<CompiledConfig>,
}

impl ConfigCache {
    pub fn new(config: ProjectConfig) -> Result<Self> {
        Ok(Self {
            current: ArcSwap::from_pointee(CompiledConfig::new(config)?),
        })
    }

    #[must_use]
    pub fn current(&self) -> Arc<CompiledConfig> {
        self.current.load_full()
    }

    /// Installs `config` if it validates and compiles. On failure the
    /// previous config stays in effect and the error is returned.
    pub fn update(&self, config: ProjectConfig) -> Result<Arc<CompiledConfig>> {
        let project = config.project.clone();
        match CompiledConfig::new(config) {
            Ok(compiled) => {
                let compiled = Arc::new(compiled);
                self.current.store(Arc::clone(&compiled));
                tracing::info!(
                    project = %project,
                    last_updated = %compiled.last_updated(),
                    "config.updated"
                );
                Ok(compiled)
            }
            Err(err) => {
                tracing::warn!(project = %project, error = %err, "config.rejected");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn test_config() -> ProjectConfig {
        ProjectConfig {
            project: "chromium".to_string(),
            last_updated: Utc.with_ymd_and_hms(2030, 7, 1, 0, 0, 0).unwrap(),
            bug_filing_threshold: ImpactThreshold {
                test_results_failed: Some(MetricThreshold {
                    one_day: Some(100),
                    three_day: Some(300),
                    seven_day: Some(700),
                }),
                ..ImpactThreshold::default()
            },
            test_name_rules: vec![TestNameClusteringRule {
                name: "Blink Web Tests".to_string(),
                pattern: r"^ninja://:blink_web_tests/(virtual/[^/]+/)?(?P<testname>([^/]+/)+[^/]+\.[a-zA-Z]+).*$".to_string(),
                like_template: "ninja://:blink\\_web\\_tests/%${testname}%".to_string(),
            }],
            bug_manager: BugManagerConfig {
                monorail_project: "chromium".to_string(),
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
                        threshold: ImpactThreshold {
                            test_results_failed: Some(MetricThreshold {
                                one_day: Some(100),
                                three_day: Some(300),
                                seven_day: Some(700),
                            }),
                            ..ImpactThreshold::default()
                        },
                    },
                    PriorityConfig {
                        priority: "3".to_string(),
                        threshold: ImpactThreshold {
                            test_results_failed: Some(MetricThreshold {
                                one_day: Some(20),
                                three_day: Some(60),
                                seven_day: Some(140),
                            }),
                            ..ImpactThreshold::default()
                        },
                    },
                ],
                priority_hysteresis_percent: 10,
            },
            max_bugs_filed_per_run: DEFAULT_MAX_BUGS_FILED_PER_RUN,
            test_name_impact_margin_percent: DEFAULT_TEST_NAME_IMPACT_MARGIN_PERCENT,
            enable_bug_updates: true,
        }
    }

    fn issue_paths(cfg: &ProjectConfig) -> Vec<String> {
        validate_project_config(cfg)
            .unwrap_err()
            .issues()
            .iter()
            .map(|i| i.path.clone())
            .collect()
    }

    #[test]
    fn test_config_is_valid() {
        validate_project_config(&test_config()).unwrap();
    }

    #[test]
    fn rejects_bad_project_and_negative_thresholds() {
        let mut cfg = test_config();
        cfg.project = "Not Valid".to_string();
        cfg.bug_manager.priorities[0].threshold.test_results_failed =
            Some(MetricThreshold::one_day(-1));
        assert_eq!(
            issue_paths(&cfg),
            vec![
                "project".to_string(),
                "bug_manager.priorities[0].threshold.test_results_failed.one_day".to_string(),
            ]
        );
    }

    #[test]
    fn lowest_priority_must_be_satisfied_by_bug_filing_threshold() {
        let mut cfg = test_config();
        let lowest = cfg.bug_manager.priorities.last_mut().unwrap();
        lowest.threshold.test_results_failed = Some(MetricThreshold {
            one_day: Some(101),
            three_day: None,
            seven_day: Some(700),
        });
        let err = validate_project_config(&cfg).unwrap_err();
        let messages: Vec<String> = err.issues().iter().map(ToString::to_string).collect();
        assert_eq!(messages.len(), 2, "{messages:?}");
        assert!(messages[0].starts_with(
            "(bug_manager.priorities[3].threshold.test_results_failed.one_day): value must be at most 100"
        ));
        assert!(messages[1].contains("three_day threshold must be set"));
    }

    #[test]
    fn rejects_missing_priorities_and_bad_hysteresis() {
        let mut cfg = test_config();
        cfg.bug_manager.priorities.clear();
        cfg.bug_manager.priority_hysteresis_percent = 1001;
        assert_eq!(
            issue_paths(&cfg),
            vec![
                "bug_manager.priorities".to_string(),
                "bug_manager.priority_hysteresis_percent".to_string(),
            ]
        );
    }

    #[test]
    fn rejects_bad_test_name_rules() {
        let mut cfg = test_config();
        cfg.test_name_rules.push(TestNameClusteringRule {
            name: "Blink Web Tests".to_string(),
            pattern: "^(?P<a>.*)$".to_string(),
            like_template: "${b}".to_string(),
        });
        cfg.test_name_rules.push(TestNameClusteringRule {
            name: String::new(),
            pattern: "^(?P<a>.*)$".to_string(),
            like_template: "abc\\".to_string(),
        });
        assert_eq!(
            issue_paths(&cfg),
            vec![
                "test_name_rules[1].name".to_string(),
                "test_name_rules[1]".to_string(),
                "test_name_rules[2].name".to_string(),
                "test_name_rules[2]".to_string(),
            ]
        );
    }

    #[test]
    fn inflate_and_deflate() {
        let t = ImpactThreshold {
            test_results_failed: Some(MetricThreshold {
                one_day: Some(100),
                three_day: Some(300),
                seven_day: None,
            }),
            test_runs_failed: Some(MetricThreshold::one_day(7)),
            presubmit_runs_failed: None,
        };
        let up = t.inflate(34);
        assert_eq!(
            up.test_results_failed,
            Some(MetricThreshold {
                one_day: Some(134),
                three_day: Some(402),
                seven_day: None,
            })
        );
        assert_eq!(up.test_runs_failed, Some(MetricThreshold::one_day(10)));
        let down = t.deflate(10);
        assert_eq!(down.test_results_failed.unwrap().one_day, Some(90));
        assert_eq!(down.test_runs_failed.unwrap().one_day, Some(6));
        assert_eq!(t.inflate(0), t);
    }

    #[test]
    fn config_json_round_trip_uses_defaults() {
        let json = r#"{
            "project": "chromium",
            "bugFilingThreshold": {"testResultsFailed": {"oneDay": 100}},
            "bugManager": {
                "monorailProject": "chromium",
                "priorities": [{"priority": "2", "threshold": {"testResultsFailed": {"oneDay": 50}}}]
            }
        }"#;
        let cfg: ProjectConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.last_updated, starting_epoch());
        assert_eq!(cfg.max_bugs_filed_per_run, DEFAULT_MAX_BUGS_FILED_PER_RUN);
        assert_eq!(cfg.test_name_impact_margin_percent, 34);
        assert!(cfg.enable_bug_updates);
        validate_project_config(&cfg).unwrap();
    }

    #[test]
    fn load_reads_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, serde_json::to_string_pretty(&test_config()).unwrap()).unwrap();
        assert_eq!(ProjectConfig::load(&path).unwrap(), test_config());
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(ProjectConfig::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn cache_keeps_previous_config_on_invalid_update() {
        let cache = ConfigCache::new(test_config()).unwrap();
        let before = cache.current();

        let mut bad = test_config();
        bad.test_name_rules[0].like_template = "$".to_string();
        assert!(cache.update(bad).is_err());
        assert!(Arc::ptr_eq(&before, &cache.current()));

        let mut good = test_config();
        good.last_updated = Utc.with_ymd_and_hms(2030, 8, 1, 0, 0, 0).unwrap();
        cache.update(good).unwrap();
        assert_eq!(
            cache.current().last_updated(),
            Utc.with_ymd_and_hms(2030, 8, 1, 0, 0, 0).unwrap()
        );
    }
}
