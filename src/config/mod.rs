//! Configuration module
//!
//! Suite and reporter settings, loaded in layers: defaults, then a YAML or
//! JSON config file, then `GROVE_*` environment variables, then `--grove.*`
//! command-line flags.

mod env;
mod flags;

pub use env::{editor_integration, EnvBuilder, EnvConfig, EnvGuard};
pub use flags::SuiteFlags;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::models::validate_label;
use crate::parallel::Topology;

/// Config file locations, in order of precedence
const CONFIG_LOCATIONS: &[&str] = &["./grove.yaml", "./grove.yml", "./.grove.yaml", "./grove.json"];

/// Settings that control which specs run and how
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuiteConfig {
    /// Seed for spec randomization, exposed to specs
    pub random_seed: u64,

    /// Shuffle spec groups instead of running in declaration order
    pub randomize_all_specs: bool,

    /// Only run specs whose full text contains one of these
    pub focus_strings: Vec<String>,

    /// Skip specs whose full text contains one of these
    pub skip_strings: Vec<String>,

    /// Only run specs carrying one of these labels
    pub label_filter: Vec<String>,

    /// Stop running specs after the first failure
    pub fail_fast: bool,

    /// Treat pending specs as a suite failure
    pub fail_on_pending: bool,

    /// Walk the tree and report without running any bodies
    pub dry_run: bool,

    pub parallel_process: usize,
    pub parallel_total: usize,

    /// Address of the coordination server when running in parallel
    pub parallel_host: Option<String>,

    /// `swap`, `none`, or anything else for the redirect interceptor
    pub output_interceptor_mode: String,

    /// Interrupt the suite after this many seconds
    pub timeout_secs: Option<u64>,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            random_seed: Utc::now().timestamp().max(0) as u64,
            randomize_all_specs: false,
            focus_strings: Vec::new(),
            skip_strings: Vec::new(),
            label_filter: Vec::new(),
            fail_fast: false,
            fail_on_pending: false,
            dry_run: false,
            parallel_process: 1,
            parallel_total: 1,
            parallel_host: None,
            output_interceptor_mode: String::new(),
            timeout_secs: None,
        }
    }
}

impl SuiteConfig {
    pub fn topology(&self) -> Topology {
        Topology::new(self.parallel_process, self.parallel_total)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Settings for console and file reporting
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReporterConfig {
    pub no_color: bool,
    pub verbose: bool,
    pub succinct: bool,

    /// Write the suite report as JSON to this path
    pub json_report: Option<PathBuf>,
}

/// Both halves of the configuration, as stored in config files
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroveConfig {
    pub suite: SuiteConfig,
    pub reporter: ReporterConfig,
}

fn is_yaml(path: &Path) -> bool {
    path.extension()
        .map(|e| e == "yaml" || e == "yml")
        .unwrap_or(false)
}

impl GroveConfig {
    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = if is_yaml(path) {
            serde_yaml::from_str(&content).context("Failed to parse YAML config")?
        } else {
            serde_json::from_str(&content).context("Failed to parse JSON config")?
        };
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if is_yaml(path) {
            serde_yaml::to_string(self).context("Failed to serialize config")?
        } else {
            serde_json::to_string_pretty(self).context("Failed to serialize config")?
        };

        std::fs::write(path, content).context("Failed to write config file")?;
        Ok(())
    }

    /// First config file found in the working directory
    pub fn find() -> Option<PathBuf> {
        CONFIG_LOCATIONS
            .iter()
            .map(PathBuf::from)
            .find(|p| p.is_file())
    }

    /// Override with whatever the environment sets
    pub fn apply_env(&mut self, env: &EnvConfig) {
        if let Some(seed) = env.seed {
            self.suite.random_seed = seed;
        }
        if let Some(process) = env.parallel_process {
            self.suite.parallel_process = process;
        }
        if let Some(total) = env.parallel_total {
            self.suite.parallel_total = total;
        }
        if let Some(host) = &env.parallel_host {
            self.suite.parallel_host = Some(host.clone());
        }
    }

    /// Defaults, config file, environment and flags, in that order
    pub fn from_layers(env: &EnvConfig, flags: &SuiteFlags) -> std::result::Result<Self, ConfigError> {
        let file = env.config_file.as_ref().map(PathBuf::from).or_else(Self::find);
        let mut config = match file {
            Some(path) => Self::load(&path).map_err(|e| ConfigError::File(format!("{e:#}")))?,
            None => Self::default(),
        };
        config.apply_env(env);
        flags.apply(&mut config);
        Ok(config)
    }
}

/// Check a configuration, returning every problem found
pub fn vet_config(suite: &SuiteConfig, reporter: &ReporterConfig) -> Vec<ConfigError> {
    let mut errors = Vec::new();

    if suite.parallel_total < 1 {
        errors.push(ConfigError::InvalidParallelTotal(suite.parallel_total));
    } else if suite.parallel_process < 1 || suite.parallel_process > suite.parallel_total {
        errors.push(ConfigError::InvalidParallelProcess {
            process: suite.parallel_process,
            total: suite.parallel_total,
        });
    }

    if suite.parallel_total > 1 {
        if suite.parallel_host.as_deref().map_or(true, str::is_empty) {
            errors.push(ConfigError::MissingParallelHost);
        }
        if suite.dry_run {
            errors.push(ConfigError::DryRunInParallel);
        }
    }

    if reporter.verbose && reporter.succinct {
        errors.push(ConfigError::VerboseAndSuccinct);
    }

    for label in &suite.label_filter {
        if let Err(reason) = validate_label(label) {
            errors.push(ConfigError::InvalidLabelFilter {
                label: label.clone(),
                reason,
            });
        }
    }

    errors
}
