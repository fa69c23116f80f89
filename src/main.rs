//! Weetbix - test failure clustering CLI
//!
//! Offline front end to the clustering engine: validate project configs,
//! try out rule definitions and test name templates, and cluster a file of
//! failures to see the resulting impact.

#![forbid(unsafe_code)]

use std::io::{self, BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use weetbix::algorithms::Algorithms;
use weetbix::algorithms::testname::rule;
use weetbix::analysis::summarize;
use weetbix::cli::{self, Commands};
use weetbix::clustering::{ClusterResults, Failure};
use weetbix::config::{CompiledConfig, ProjectConfig, TestNameClusteringRule, validate_project_config};
use weetbix::rules::{Expr, FailureAssociationRule, RulesCache};
use weetbix::store::InMemoryRuleStore;

fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    let filter = cli
        .log_directive()
        .map_or_else(EnvFilter::from_default_env, EnvFilter::new);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    run(cli.command)
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::ValidateConfig { config } => handle_validate_config(&config),
        Commands::EvalRule { expr, test, reason } => handle_eval_rule(&expr, test, reason.as_deref()),
        Commands::Cluster {
            config,
            failures,
            rules,
            now,
        } => handle_cluster(&config, &failures, rules.as_deref(), now.as_deref()),
        Commands::Like {
            pattern,
            template,
            test_name,
        } => handle_like(pattern, template, &test_name),
    }
}

fn handle_validate_config(path: &Path) -> Result<()> {
    let config = ProjectConfig::load(path)?;
    match validate_project_config(&config) {
        Ok(()) => {
            println!("{}: ok", path.display());
            Ok(())
        }
        Err(err) => {
            for issue in err.issues() {
                println!("{issue}");
            }
            bail!("{} is not valid", path.display())
        }
    }
}

fn handle_eval_rule(expr: &str, test: String, reason: Option<&str>) -> Result<()> {
    let parsed = Expr::parse(expr)?;
    let failure = Failure::new(test, reason, Utc::now());
    println!("{parsed}");
    println!("{}", parsed.evaluate(&failure));
    Ok(())
}

fn handle_like(pattern: String, like_template: String, test_name: &str) -> Result<()> {
    let matcher = rule::compile(&TestNameClusteringRule {
        name: "cli".to_string(),
        pattern,
        like_template,
    })?;
    match matcher.evaluate(test_name) {
        Some(like) => println!("{like}"),
        None => bail!("pattern does not match {test_name:?}"),
    }
    Ok(())
}

fn handle_cluster(
    config_path: &Path,
    failures_path: &Path,
    rules_path: Option<&Path>,
    now: Option<&str>,
) -> Result<()> {
    let config = CompiledConfig::new(ProjectConfig::load(config_path)?)?;
    let now = match now {
        Some(text) => DateTime::parse_from_rfc3339(text)
            .with_context(|| format!("invalid --now {text:?}"))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };

    let store = InMemoryRuleStore::new();
    if let Some(path) = rules_path {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let rules: Vec<FailureAssociationRule> = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        for rule in rules {
            if rule.project == config.project() {
                store.insert_unchecked(rule)?;
            }
        }
    }
    let cache = RulesCache::new(config.project());
    let ruleset = futures::executor::block_on(cache.refresh(&store))?;

    let failures = read_failures(failures_path)?;
    let results = Algorithms::default().cluster(
        &config,
        &ruleset,
        &ClusterResults::empty(failures.len()),
        &failures,
    );
    let summaries = summarize(
        now,
        failures
            .iter()
            .zip(results.clusters.iter().map(Vec::as_slice)),
    );
    tracing::info!(
        project = %config.project(),
        failures = failures.len(),
        clusters = summaries.len(),
        rules = ruleset.active_rules().len(),
        "cluster.completed"
    );
    println!("{}", serde_json::to_string_pretty(&summaries)?);
    Ok(())
}

fn read_failures(path: &Path) -> Result<Vec<Failure>> {
    let file = std::fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut failures = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let failure = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid failure", path.display(), index + 1))?;
        failures.push(failure);
    }
    Ok(failures)
}
