//! # Error Reporting
//!
//! Structured error construction shared by every component.
//!
//! All fatal errors surfaced to the caller are a [`Diagnostic`]: the stage
//! that failed, the resource it failed on, the underlying cause, and a list
//! of human-actionable suggestions. No component raises an unstructured
//! failure past its own boundary.

use std::fmt;

/// Pipeline stage in which a failure occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Pre-flight checks before any network call or write
    Preflight,
    /// Configuration loading and validation
    Config,
    /// Secret store authentication
    Auth,
    /// Fetching secret content from the store
    Fetch,
    /// Materializing secret files on disk
    Write,
    /// Restarting/reloading dependent services
    Reconcile,
}

impl Stage {
    /// Human-readable stage name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Preflight => "pre-flight validation",
            Stage::Config => "configuration loading",
            Stage::Auth => "secret store authentication",
            Stage::Fetch => "secret fetch",
            Stage::Write => "secret materialization",
            Stage::Reconcile => "service reconciliation",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error: stage + resource + cause + actionable suggestions
///
/// Rendered as a single message followed by a suggestion list, so a failed
/// run always tells the operator what to try next.
#[derive(Debug)]
pub struct Diagnostic {
    stage: Stage,
    resource: String,
    suggestions: Vec<String>,
    source: anyhow::Error,
}

impl Diagnostic {
    /// Create a diagnostic for a failure of `stage` on `resource`
    pub fn new(
        stage: Stage,
        resource: impl Into<String>,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        Self {
            stage,
            resource: resource.into(),
            suggestions: Vec::new(),
            source: source.into(),
        }
    }

    /// Attach human-actionable suggestions
    #[must_use]
    pub fn with_suggestions<I, S>(mut self, suggestions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.suggestions
            .extend(suggestions.into_iter().map(Into::into));
        self
    }

    /// Stage in which the failure occurred
    #[must_use]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Resource the failure occurred on
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Attached suggestions
    #[must_use]
    pub fn suggestions(&self) -> &[String] {
        &self.suggestions
    }

    /// Underlying cause
    #[must_use]
    pub fn cause(&self) -> &anyhow::Error {
        &self.source
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // {:#} renders the full anyhow context chain on one line
        write!(f, "{} failed for {}: {:#}", self.stage, self.resource, self.source)?;
        if !self.suggestions.is_empty() {
            write!(f, "\nSuggestions:")?;
            for suggestion in &self.suggestions {
                write!(f, "\n  - {suggestion}")?;
            }
        }
        Ok(())
    }
}

// The cause chain is already rendered by Display; returning no source here
// keeps anyhow from printing the chain twice when main exits with an error.
impl std::error::Error for Diagnostic {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_display_includes_stage_resource_and_cause() {
        let diagnostic = Diagnostic::new(
            Stage::Fetch,
            "vault reference Infra/db/password",
            anyhow::anyhow!("connection refused"),
        );
        let rendered = diagnostic.to_string();
        assert!(rendered.contains("secret fetch failed"));
        assert!(rendered.contains("Infra/db/password"));
        assert!(rendered.contains("connection refused"));
    }

    #[test]
    fn test_diagnostic_display_lists_suggestions() {
        let diagnostic = Diagnostic::new(
            Stage::Reconcile,
            "postgres.service",
            anyhow::anyhow!("unit not found"),
        )
        .with_suggestions([
            "Check if the service exists",
            "Review systemd integration configuration",
        ]);
        let rendered = diagnostic.to_string();
        assert!(rendered.contains("Suggestions:"));
        assert!(rendered.contains("- Check if the service exists"));
        assert!(rendered.contains("- Review systemd integration configuration"));
    }

    #[test]
    fn test_diagnostic_without_suggestions_has_no_suggestion_block() {
        let diagnostic =
            Diagnostic::new(Stage::Config, "secrets.json", anyhow::anyhow!("bad json"));
        assert!(!diagnostic.to_string().contains("Suggestions:"));
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::Preflight.as_str(), "pre-flight validation");
        assert_eq!(Stage::Reconcile.as_str(), "service reconciliation");
    }
}
