//! Command line interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "weetbix",
    version,
    about = "Cluster test failures and evaluate failure association rules"
)]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace). Overrides RUST_LOG.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Log filter directive implied by `-v`, if any.
    #[must_use]
    pub const fn log_directive(&self) -> Option<&'static str> {
        match self.verbose {
            0 => None,
            1 => Some("debug"),
            _ => Some("trace"),
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Validate a project config and print every finding
    ValidateConfig {
        /// Path to the project config (JSON)
        config: PathBuf,
    },

    /// Parse a rule definition and evaluate it against a failure
    EvalRule {
        /// Rule definition, e.g. `test LIKE "ninja://%" AND reason = "boom"`
        expr: String,

        /// Test ID of the failure
        #[arg(long, default_value = "")]
        test: String,

        /// Primary error message of the failure
        #[arg(long)]
        reason: Option<String>,
    },

    /// Cluster failures and print per-cluster impact as JSON
    Cluster {
        /// Path to the project config (JSON)
        config: PathBuf,

        /// Failures, one JSON object per line
        failures: PathBuf,

        /// Failure association rules (JSON array)
        #[arg(long)]
        rules: Option<PathBuf>,

        /// Time to compute impact windows from (RFC 3339); defaults to now
        #[arg(long)]
        now: Option<String>,
    },

    /// Run a test name pattern and LIKE template against a test name
    Like {
        /// Regular expression with named capture groups
        pattern: String,

        /// LIKE template, e.g. `ninja://${testname}%`
        template: String,

        /// Test name to evaluate
        test_name: String,
    },
}
