//! Environment variable configuration
//!
//! Provides environment variable overrides for configuration.

use std::env;

/// Environment variable prefix
const ENV_PREFIX: &str = "GROVE";

/// Environment configuration from environment variables
#[derive(Clone, Debug, Default)]
pub struct EnvConfig {
    /// Config file from GROVE_CONFIG
    pub config_file: Option<String>,
    /// Random seed from GROVE_SEED
    pub seed: Option<u64>,
    /// Process number from GROVE_PARALLEL_PROCESS
    pub parallel_process: Option<usize>,
    /// Process count from GROVE_PARALLEL_TOTAL
    pub parallel_total: Option<usize>,
    /// Coordination server from GROVE_PARALLEL_HOST
    pub parallel_host: Option<String>,
    /// Log level from GROVE_LOG
    pub log: Option<String>,
    /// GROVE_EDITOR_INTEGRATION
    pub editor_integration: bool,
}

impl EnvConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self {
            config_file: get_env("CONFIG"),
            seed: get_env_parse("SEED"),
            parallel_process: get_env_parse("PARALLEL_PROCESS"),
            parallel_total: get_env_parse("PARALLEL_TOTAL"),
            parallel_host: get_env("PARALLEL_HOST"),
            log: get_env("LOG"),
            editor_integration: get_env("EDITOR_INTEGRATION").is_some(),
        }
    }
}

/// Whether focused suites should exit 0 instead of the focus exit code
pub fn editor_integration() -> bool {
    get_env("EDITOR_INTEGRATION").is_some()
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{name}")).ok()
}

/// Get environment variable and parse to type
fn get_env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.parse().ok())
}

/// Builder for setting environment variables (useful for testing)
pub struct EnvBuilder {
    vars: Vec<(String, String)>,
}

impl EnvBuilder {
    /// Create a new environment builder
    pub fn new() -> Self {
        Self { vars: Vec::new() }
    }

    fn set(mut self, name: &str, value: impl Into<String>) -> Self {
        self.vars.push((format!("{ENV_PREFIX}_{name}"), value.into()));
        self
    }

    /// Set config file
    pub fn config_file(self, path: impl Into<String>) -> Self {
        self.set("CONFIG", path)
    }

    /// Set random seed
    pub fn seed(self, seed: u64) -> Self {
        self.set("SEED", seed.to_string())
    }

    /// Set parallel topology and coordination server
    pub fn parallel(self, process: usize, total: usize, host: impl Into<String>) -> Self {
        self.set("PARALLEL_PROCESS", process.to_string())
            .set("PARALLEL_TOTAL", total.to_string())
            .set("PARALLEL_HOST", host)
    }

    /// Set log level
    pub fn log(self, level: impl Into<String>) -> Self {
        self.set("LOG", level)
    }

    /// Apply environment variables
    pub fn apply(self) {
        for (key, value) in self.vars {
            env::set_var(key, value);
        }
    }

    /// Apply and return guard that restores on drop
    pub fn apply_scoped(self) -> EnvGuard {
        let previous: Vec<_> = self
            .vars
            .iter()
            .map(|(k, _)| (k.clone(), env::var(k).ok()))
            .collect();

        self.apply();

        EnvGuard { previous }
    }
}

impl Default for EnvBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that restores environment variables on drop
pub struct EnvGuard {
    previous: Vec<(String, Option<String>)>,
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in &self.previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_config_default() {
        let config = EnvConfig::default();
        assert!(config.seed.is_none());
        assert!(config.parallel_host.is_none());
        assert!(!config.editor_integration);
    }

    #[test]
    fn test_env_builder() {
        let _guard = EnvBuilder::new()
            .seed(1234)
            .parallel(2, 4, "http://127.0.0.1:8080")
            .log("debug")
            .apply_scoped();

        let config = EnvConfig::load();
        assert_eq!(config.seed, Some(1234));
        assert_eq!(config.parallel_process, Some(2));
        assert_eq!(config.parallel_total, Some(4));
        assert_eq!(
            config.parallel_host.as_deref(),
            Some("http://127.0.0.1:8080")
        );
        assert_eq!(config.log.as_deref(), Some("debug"));
    }

    #[test]
    fn test_guard_restores_previous_values() {
        {
            let _guard = EnvBuilder::new().config_file("suite.yaml").apply_scoped();
            assert_eq!(EnvConfig::load().config_file.as_deref(), Some("suite.yaml"));
        }
        assert!(EnvConfig::load().config_file.is_none());
    }
}
