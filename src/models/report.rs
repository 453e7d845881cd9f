//! Report models
//!
//! Defines spec states and the per-spec and per-suite reports handed to
//! reporters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::failer::Failure;
use crate::models::{CodeLocation, NodeRole};

/// Terminal state of a spec or suite-level node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpecState {
    Passed,
    Failed,
    Skipped,
    Pending,
    Aborted,
    Panicked,
    Interrupted,
}

impl SpecState {
    pub fn symbol(&self) -> &'static str {
        match self {
            SpecState::Passed => "•",
            SpecState::Failed => "✗",
            SpecState::Skipped => "S",
            SpecState::Pending => "P",
            SpecState::Aborted => "A",
            SpecState::Panicked => "!",
            SpecState::Interrupted => "I",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            SpecState::Failed | SpecState::Aborted | SpecState::Panicked | SpecState::Interrupted
        )
    }
}

impl fmt::Display for SpecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpecState::Passed => write!(f, "PASSED"),
            SpecState::Failed => write!(f, "FAILED"),
            SpecState::Skipped => write!(f, "SKIPPED"),
            SpecState::Pending => write!(f, "PENDING"),
            SpecState::Aborted => write!(f, "ABORTED"),
            SpecState::Panicked => write!(f, "PANICKED"),
            SpecState::Interrupted => write!(f, "INTERRUPTED"),
        }
    }
}

/// Annotation attached to a spec while it runs
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub name: String,
    pub location: CodeLocation,
    pub time: DateTime<Utc>,
    pub value: serde_json::Value,
}

/// Result of running one spec or suite-level node
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpecReport {
    pub container_texts: Vec<String>,
    pub leaf_text: String,
    pub role: NodeRole,
    pub location: CodeLocation,
    pub labels: Vec<String>,
    pub state: SpecState,
    pub start_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub failure: Option<Failure>,
    /// Skip/pending reason for specs that never ran
    pub message: Option<String>,
    pub writer_output: String,
    pub captured_output: String,
    pub entries: Vec<ReportEntry>,
    pub parallel_process: usize,
}

impl SpecReport {
    pub fn new(
        container_texts: Vec<String>,
        leaf_text: impl Into<String>,
        role: NodeRole,
        location: CodeLocation,
    ) -> Self {
        Self {
            container_texts,
            leaf_text: leaf_text.into(),
            role,
            location,
            labels: Vec::new(),
            state: SpecState::Passed,
            start_time: Utc::now(),
            duration_ms: 0,
            failure: None,
            message: None,
            writer_output: String::new(),
            captured_output: String::new(),
            entries: Vec::new(),
            parallel_process: 1,
        }
    }

    pub fn with_state(mut self, state: SpecState, message: impl Into<String>) -> Self {
        self.state = state;
        self.message = Some(message.into());
        self
    }

    /// Container texts and leaf text joined with spaces
    pub fn full_text(&self) -> String {
        let mut parts: Vec<&str> = self.container_texts.iter().map(String::as_str).collect();
        parts.push(&self.leaf_text);
        parts
            .into_iter()
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn is_suite_level(&self) -> bool {
        self.role.is_suite_level() || self.role == NodeRole::Cleanup
    }
}

impl fmt::Display for SpecReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}ms]",
            self.state.symbol(),
            self.full_text(),
            self.duration_ms
        )?;
        if let Some(failure) = &self.failure {
            write!(f, " - {}", failure.message)?;
        } else if let Some(msg) = &self.message {
            write!(f, " - {msg}")?;
        }
        Ok(())
    }
}

/// Summary of a whole suite run on one process
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SuiteReport {
    pub description: String,
    pub path: String,
    pub suite_labels: Vec<String>,
    pub random_seed: u64,
    pub parallel_process: usize,
    pub parallel_total: usize,
    pub total_specs: usize,
    pub specs_that_will_run: usize,
    pub succeeded: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub special_failure_reasons: Vec<String>,
    pub specs: Vec<SpecReport>,
}

impl SuiteReport {
    pub fn new(description: impl Into<String>, path: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            description: description.into(),
            path: path.into(),
            suite_labels: Vec::new(),
            random_seed: 0,
            parallel_process: 1,
            parallel_total: 1,
            total_specs: 0,
            specs_that_will_run: 0,
            succeeded: false,
            start_time: now,
            end_time: now,
            special_failure_reasons: Vec::new(),
            specs: Vec::new(),
        }
    }

    /// Reports of subject nodes only
    pub fn subjects(&self) -> impl Iterator<Item = &SpecReport> {
        self.specs.iter().filter(|s| s.role == NodeRole::It)
    }

    pub fn count(&self, state: SpecState) -> usize {
        self.subjects().filter(|s| s.state == state).count()
    }

    pub fn passed(&self) -> usize {
        self.count(SpecState::Passed)
    }

    pub fn failed(&self) -> usize {
        self.subjects().filter(|s| s.state.is_failure()).count()
    }

    pub fn pending(&self) -> usize {
        self.count(SpecState::Pending)
    }

    pub fn skipped(&self) -> usize {
        self.count(SpecState::Skipped)
    }

    /// Specs that actually executed their bodies
    pub fn ran(&self) -> usize {
        self.subjects()
            .filter(|s| !matches!(s.state, SpecState::Skipped | SpecState::Pending))
            .count()
    }

    pub fn run_time_ms(&self) -> u64 {
        (self.end_time - self.start_time).num_milliseconds().max(0) as u64
    }

    pub fn find(&self, leaf_text: &str) -> Option<&SpecReport> {
        self.specs.iter().find(|s| s.leaf_text == leaf_text)
    }
}

impl fmt::Display for SuiteReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Suite: {}", self.description)?;
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        for spec in &self.specs {
            writeln!(f, "  {spec}")?;
        }
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        writeln!(
            f,
            "Ran {} of {} | Passed: {} | Failed: {} | Pending: {} | Skipped: {}",
            self.ran(),
            self.total_specs,
            self.passed(),
            self.failed(),
            self.pending(),
            self.skipped()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(text: &str, state: SpecState) -> SpecReport {
        let mut report = SpecReport::new(
            vec!["Calculator".into()],
            text,
            NodeRole::It,
            CodeLocation::new("calc.rs", 1),
        );
        report.state = state;
        report
    }

    #[test]
    fn test_spec_state_failure_classes() {
        assert!(SpecState::Panicked.is_failure());
        assert!(SpecState::Aborted.is_failure());
        assert!(!SpecState::Skipped.is_failure());
        assert!(!SpecState::Pending.is_failure());
    }

    #[test]
    fn test_full_text() {
        assert_eq!(spec("adds", SpecState::Passed).full_text(), "Calculator adds");
    }

    #[test]
    fn test_suite_counts_ignore_suite_nodes() {
        let mut suite = SuiteReport::new("Calc", "/tmp");
        suite.specs = vec![
            spec("adds", SpecState::Passed),
            spec("divides", SpecState::Failed),
            spec("later", SpecState::Pending),
            spec("skipped", SpecState::Skipped),
            SpecReport::new(
                vec![],
                "",
                NodeRole::BeforeSuite,
                CodeLocation::default(),
            )
            .with_state(SpecState::Failed, "setup"),
        ];
        assert_eq!(suite.passed(), 1);
        assert_eq!(suite.failed(), 1);
        assert_eq!(suite.pending(), 1);
        assert_eq!(suite.skipped(), 1);
        assert_eq!(suite.ran(), 2);
        assert!(suite.find("divides").is_some());
    }
}
