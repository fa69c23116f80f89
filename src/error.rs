//! Error types for the clustering engine.
//!
//! Compile-time problems (bad rule syntax, bad LIKE templates, invalid
//! config) and collaborator failures (rule store, bug tracker) share one
//! enum so orchestration code can propagate with `?`.

use std::fmt;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// A single finding produced while validating a config or rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Dotted path of the offending field, e.g. `bug_manager.priorities[0].priority`.
    pub path: String,
    pub message: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            f.write_str(&self.message)
        } else {
            write!(f, "({}): {}", self.path, self.message)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed rule expression, LIKE pattern or LIKE template.
    #[error("syntax error{}: {message}", fmt_position(.position))]
    Syntax {
        message: String,
        position: Option<usize>,
    },

    /// One or more validation findings.
    #[error("validation failed: {}", join_issues(.0))]
    Validation(Vec<ValidationIssue>),

    #[error("config error: {0}")]
    Config(String),

    /// The rule store collaborator failed.
    #[error("rule store error: {0}")]
    Store(String),

    /// The bug tracker collaborator failed.
    #[error("bug tracker error: {0}")]
    BugTracker(String),

    /// The impact analysis collaborator failed.
    #[error("analysis error: {0}")]
    Analysis(String),

    #[error(transparent)]
    Regex(#[from] regex::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn fmt_position(position: &Option<usize>) -> String {
    position.map(|p| format!(" at position {p}")).unwrap_or_default()
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    pub fn syntax(message: impl Into<String>) -> Self {
        Self::Syntax {
            message: message.into(),
            position: None,
        }
    }

    pub fn syntax_at(message: impl Into<String>, position: usize) -> Self {
        Self::Syntax {
            message: message.into(),
            position: Some(position),
        }
    }

    /// A validation error with a single finding at the root path.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(vec![ValidationIssue {
            path: String::new(),
            message: message.into(),
        }])
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    pub fn bug_tracker(message: impl Into<String>) -> Self {
        Self::BugTracker(message.into())
    }

    pub fn analysis(message: impl Into<String>) -> Self {
        Self::Analysis(message.into())
    }

    #[must_use]
    pub const fn is_syntax(&self) -> bool {
        matches!(self, Self::Syntax { .. })
    }

    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Validation findings carried by this error, if any.
    #[must_use]
    pub fn issues(&self) -> &[ValidationIssue] {
        match self {
            Self::Validation(issues) => issues,
            _ => &[],
        }
    }
}
