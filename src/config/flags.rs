//! Command-line flags
//!
//! Suites usually run inside a host test harness that has its own arguments,
//! so only `--grove.`-prefixed arguments are parsed here.

use clap::Parser;
use std::path::PathBuf;

use crate::deprecation::{Deprecation, DeprecationTracker};
use crate::error::ConfigError;

use super::GroveConfig;

const FLAG_PREFIX: &str = "--grove.";

/// Flags that take no value
const SWITCHES: &[&str] = &[
    "--grove.randomize-all",
    "--grove.fail-fast",
    "--grove.fail-on-pending",
    "--grove.dry-run",
    "--grove.no-color",
    "--grove.v",
    "--grove.succinct",
];

#[derive(Parser, Debug, Default, Clone, PartialEq, Eq)]
#[command(name = "grove")]
#[command(no_binary_name = true, disable_help_flag = true, disable_version_flag = true)]
pub struct SuiteFlags {
    /// Random seed exposed to specs
    #[arg(long = "grove.seed")]
    pub seed: Option<u64>,

    /// Shuffle spec groups
    #[arg(long = "grove.randomize-all")]
    pub randomize_all: bool,

    /// Only run specs whose text contains this (repeatable)
    #[arg(long = "grove.focus")]
    pub focus: Vec<String>,

    /// Skip specs whose text contains this (repeatable)
    #[arg(long = "grove.skip")]
    pub skip: Vec<String>,

    /// Only run specs with one of these labels (comma separated)
    #[arg(long = "grove.label-filter", value_delimiter = ',')]
    pub label_filter: Vec<String>,

    #[arg(long = "grove.fail-fast")]
    pub fail_fast: bool,

    #[arg(long = "grove.fail-on-pending")]
    pub fail_on_pending: bool,

    #[arg(long = "grove.dry-run")]
    pub dry_run: bool,

    #[arg(long = "grove.parallel.process")]
    pub parallel_process: Option<usize>,

    #[arg(long = "grove.parallel.total")]
    pub parallel_total: Option<usize>,

    #[arg(long = "grove.parallel.host")]
    pub parallel_host: Option<String>,

    /// swap, none or dup
    #[arg(long = "grove.output-interceptor-mode")]
    pub output_interceptor_mode: Option<String>,

    /// Suite timeout in seconds
    #[arg(long = "grove.timeout")]
    pub timeout: Option<u64>,

    #[arg(long = "grove.no-color")]
    pub no_color: bool,

    /// Verbose reporting
    #[arg(long = "grove.v")]
    pub verbose: bool,

    #[arg(long = "grove.succinct")]
    pub succinct: bool,

    #[arg(long = "grove.json-report")]
    pub json_report: Option<PathBuf>,

    /// Deprecated, accepted and ignored
    #[arg(long = "grove.slow-spec-threshold")]
    pub slow_spec_threshold: Option<String>,
}

impl SuiteFlags {
    /// Parse the `--grove.*` arguments out of `args`, ignoring the rest
    pub fn from_args<I, S>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut kept = Vec::new();
        let mut args = args.into_iter().map(Into::into);
        while let Some(arg) = args.next() {
            if !arg.starts_with(FLAG_PREFIX) {
                continue;
            }
            let takes_value = !arg.contains('=') && !SWITCHES.contains(&arg.as_str());
            kept.push(arg);
            if takes_value {
                if let Some(value) = args.next() {
                    kept.push(value);
                }
            }
        }
        Self::try_parse_from(kept).map_err(|e| ConfigError::Flags(e.to_string().trim().to_string()))
    }

    pub fn from_process() -> Result<Self, ConfigError> {
        Self::from_args(std::env::args().skip(1))
    }

    /// Override `config` with every flag that was given
    pub fn apply(&self, config: &mut GroveConfig) {
        let suite = &mut config.suite;
        if let Some(seed) = self.seed {
            suite.random_seed = seed;
        }
        suite.randomize_all_specs |= self.randomize_all;
        suite.focus_strings.extend(self.focus.iter().cloned());
        suite.skip_strings.extend(self.skip.iter().cloned());
        suite.label_filter.extend(self.label_filter.iter().cloned());
        suite.fail_fast |= self.fail_fast;
        suite.fail_on_pending |= self.fail_on_pending;
        suite.dry_run |= self.dry_run;
        if let Some(process) = self.parallel_process {
            suite.parallel_process = process;
        }
        if let Some(total) = self.parallel_total {
            suite.parallel_total = total;
        }
        if let Some(host) = &self.parallel_host {
            suite.parallel_host = Some(host.clone());
        }
        if let Some(mode) = &self.output_interceptor_mode {
            suite.output_interceptor_mode = mode.clone();
        }
        if let Some(timeout) = self.timeout {
            suite.timeout_secs = Some(timeout);
        }

        let reporter = &mut config.reporter;
        reporter.no_color |= self.no_color;
        reporter.verbose |= self.verbose;
        reporter.succinct |= self.succinct;
        if let Some(path) = &self.json_report {
            reporter.json_report = Some(path.clone());
        }
    }

    /// Track every deprecated flag that was used
    pub fn validate_deprecations(&self, tracker: &DeprecationTracker) {
        if self.slow_spec_threshold.is_some() {
            tracker.track(Deprecation::slow_spec_threshold(), None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_foreign_arguments_are_ignored() {
        let flags = SuiteFlags::from_args([
            "--nocapture",
            "--grove.focus",
            "login",
            "--test-threads=1",
            "--grove.fail-fast",
            "--grove.label-filter=db,slow",
            "my_filter",
        ])
        .unwrap();

        assert_eq!(flags.focus, vec!["login"]);
        assert!(flags.fail_fast);
        assert_eq!(flags.label_filter, vec!["db", "slow"]);
    }

    #[test]
    fn test_apply_overrides_config() {
        let flags = SuiteFlags::from_args([
            "--grove.parallel.process=2",
            "--grove.parallel.total=3",
            "--grove.parallel.host=http://127.0.0.1:9999",
            "--grove.succinct",
        ])
        .unwrap();
        let mut config = GroveConfig::default();
        flags.apply(&mut config);

        assert_eq!(config.suite.parallel_process, 2);
        assert_eq!(config.suite.parallel_total, 3);
        assert!(config.reporter.succinct);
    }

    #[test]
    fn test_bad_flag_value() {
        let err = SuiteFlags::from_args(["--grove.seed=abc"]).unwrap_err();
        assert!(matches!(err, ConfigError::Flags(_)));
    }

    #[test]
    fn test_deprecated_flag_is_tracked() {
        let tracker = DeprecationTracker::new();
        SuiteFlags::from_args(["--grove.slow-spec-threshold=5s"])
            .unwrap()
            .validate_deprecations(&tracker);
        assert!(tracker.did_track());
    }
}
