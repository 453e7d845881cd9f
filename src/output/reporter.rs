//! Console reporting
//!
//! The executor notifies a [`Reporter`] around every node it runs. The
//! [`DefaultReporter`] renders progress and a final summary to the console;
//! parallel processes use [`NoopReporter`] since their reports are aggregated
//! elsewhere.

use crate::config::ReporterConfig;
use crate::models::{SpecReport, SpecState, SuiteReport};

use super::Console;

const RULE: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━";

const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

pub trait Reporter: Send + Sync {
    fn suite_will_begin(&self, report: &SuiteReport);
    fn will_run(&self, spec: &SpecReport);
    fn did_run(&self, spec: &SpecReport);
    fn suite_did_end(&self, report: &SuiteReport);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopReporter;

impl Reporter for NoopReporter {
    fn suite_will_begin(&self, _report: &SuiteReport) {}
    fn will_run(&self, _spec: &SpecReport) {}
    fn did_run(&self, _spec: &SpecReport) {}
    fn suite_did_end(&self, _report: &SuiteReport) {}
}

/// Reporter used when the suite runs on a single process
#[derive(Clone, Debug)]
pub struct DefaultReporter {
    console: Console,
    colorize: bool,
    verbose: bool,
    succinct: bool,
}

impl DefaultReporter {
    pub fn new(console: Console) -> Self {
        Self {
            console,
            colorize: true,
            verbose: false,
            succinct: false,
        }
    }

    pub fn from_config(console: Console, config: &ReporterConfig) -> Self {
        let mut reporter = Self::new(console);
        reporter.colorize = !config.no_color;
        reporter.verbose = config.verbose;
        reporter.succinct = config.succinct;
        reporter
    }

    pub fn no_color(mut self) -> Self {
        self.colorize = false;
        self
    }

    pub fn verbose(mut self) -> Self {
        self.verbose = true;
        self
    }

    fn paint(&self, color: &str, text: &str) -> String {
        if self.colorize {
            format!("{color}{text}{RESET}")
        } else {
            text.to_string()
        }
    }

    fn state_color(state: SpecState) -> &'static str {
        match state {
            SpecState::Passed => GREEN,
            SpecState::Skipped | SpecState::Pending => YELLOW,
            SpecState::Interrupted => CYAN,
            SpecState::Failed | SpecState::Aborted | SpecState::Panicked => RED,
        }
    }

    /// One-line rendering used in verbose mode
    pub fn format_spec(&self, spec: &SpecReport) -> String {
        let status = self.paint(
            Self::state_color(spec.state),
            &format!("{} {}", spec.state.symbol(), spec.state),
        );
        let text = if spec.is_suite_level() {
            format!("[{}]", spec.role)
        } else {
            spec.full_text()
        };
        format!("{status} {text} [{}ms]", spec.duration_ms)
    }

    /// Failure block with location, message and captured output
    pub fn format_failure(&self, spec: &SpecReport) -> String {
        let mut output = String::new();
        let title = if spec.is_suite_level() {
            format!("[{}]", spec.role)
        } else {
            spec.full_text()
        };
        output.push_str(&self.paint(RED, RULE));
        output.push('\n');
        output.push_str(&self.paint(
            Self::state_color(spec.state),
            &format!("{} [{}] {}", spec.state.symbol(), spec.state, title),
        ));
        output.push('\n');
        output.push_str(&format!("{}\n", spec.location));

        if let Some(failure) = &spec.failure {
            if let Some(role) = failure.node_role {
                output.push_str(&format!("  in [{role}]\n"));
            }
            output.push_str(&format!("  {}\n", self.paint(BOLD, &failure.message)));
            if let Some(payload) = &failure.payload {
                output.push_str(&format!("  {}\n", payload.description));
            }
            output.push_str(&format!("  {}\n", failure.location));
        }

        for (heading, captured) in [
            ("Captured writer output", &spec.writer_output),
            ("Captured stdout/stderr", &spec.captured_output),
        ] {
            if !captured.is_empty() {
                output.push_str(&format!("  {heading}:\n"));
                for line in captured.lines() {
                    output.push_str(&format!("    {line}\n"));
                }
            }
        }
        output.push_str(&self.paint(RED, RULE));
        output.push('\n');
        output
    }

    pub fn format_summary(&self, report: &SuiteReport) -> String {
        let mut output = String::new();

        let failures: Vec<&SpecReport> = report
            .specs
            .iter()
            .filter(|s| s.state.is_failure())
            .collect();
        if !failures.is_empty() {
            output.push_str(&format!(
                "\n{}\n",
                self.paint(BOLD, &format!("Summarizing {} Failures:", failures.len()))
            ));
            for spec in failures {
                let text = if spec.is_suite_level() {
                    format!("[{}]", spec.role)
                } else {
                    spec.full_text()
                };
                output.push_str(&format!(
                    "  {} {}\n  {}\n",
                    self.paint(Self::state_color(spec.state), &format!("[{}]", spec.state)),
                    text,
                    spec.location
                ));
            }
        }

        output.push_str(&format!(
            "\nRan {} of {} Specs in {:.3} seconds\n",
            report.ran(),
            report.total_specs,
            report.run_time_ms() as f64 / 1000.0
        ));

        let verdict = if report.succeeded {
            self.paint(GREEN, "SUCCESS!")
        } else {
            self.paint(RED, "FAIL!")
        };
        let failed = if self.colorize && report.failed() > 0 {
            self.paint(RED, &format!("{} Failed", report.failed()))
        } else {
            format!("{} Failed", report.failed())
        };
        output.push_str(&format!(
            "{} -- {} | {} | {} | {}\n",
            verdict,
            self.paint(GREEN, &format!("{} Passed", report.passed())),
            failed,
            self.paint(YELLOW, &format!("{} Pending", report.pending())),
            self.paint(CYAN, &format!("{} Skipped", report.skipped())),
        ));

        for reason in &report.special_failure_reasons {
            output.push_str(&format!("{}\n", self.paint(RED, reason)));
        }
        output
    }
}

impl Reporter for DefaultReporter {
    fn suite_will_begin(&self, report: &SuiteReport) {
        if self.succinct {
            self.console.println(format!(
                "[{}] {} - {}/{} specs ",
                report.random_seed, report.description, report.specs_that_will_run, report.total_specs
            ));
            return;
        }
        let mut header = String::new();
        header.push_str(&format!(
            "Running Suite: {} - {}\n",
            self.paint(BOLD, &report.description),
            report.path
        ));
        if !report.suite_labels.is_empty() {
            header.push_str(&format!("[{}]\n", report.suite_labels.join(", ")));
        }
        header.push_str(&format!("{RULE}\n"));
        header.push_str(&format!("Random Seed: {}\n\n", report.random_seed));
        header.push_str(&format!(
            "Will run {} of {} specs\n",
            report.specs_that_will_run, report.total_specs
        ));
        self.console.print(header);
    }

    fn will_run(&self, spec: &SpecReport) {
        if self.verbose && !spec.is_suite_level() {
            self.console
                .println(self.paint(BOLD, &format!("• {}", spec.full_text())));
        }
    }

    fn did_run(&self, spec: &SpecReport) {
        if spec.state.is_failure() {
            self.console.print(format!("\n{}", self.format_failure(spec)));
            return;
        }
        if spec.is_suite_level() {
            return;
        }
        if self.verbose {
            self.console.println(self.format_spec(spec));
        } else {
            self.console
                .print(self.paint(Self::state_color(spec.state), spec.state.symbol()));
        }
    }

    fn suite_did_end(&self, report: &SuiteReport) {
        self.console.print(self.format_summary(report));
    }
}
