//! Configuration for the coordination core.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default per-user context quota.
pub const MAX_CONTEXTS_PER_USER: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub default_timeout_seconds: f64,
    pub max_timeout_seconds: f64,
    pub circuit_breaker_failure_threshold: u32,
    pub circuit_breaker_recovery_timeout: f64,
    pub adaptive_timeout_enabled: bool,
    pub timeout_adjustment_factor: f64,
    pub allow_partial_results: bool,
    pub cleanup_timeout_seconds: f64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: 30.0,
            max_timeout_seconds: 300.0,
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_recovery_timeout: 60.0,
            adaptive_timeout_enabled: true,
            timeout_adjustment_factor: 1.5,
            allow_partial_results: true,
            cleanup_timeout_seconds: 5.0,
        }
    }
}

impl TimeoutConfig {
    pub fn default_timeout(&self) -> Duration {
        secs(self.default_timeout_seconds)
    }

    pub fn max_timeout(&self) -> Duration {
        secs(self.max_timeout_seconds)
    }

    pub fn recovery_timeout(&self) -> Duration {
        secs(self.circuit_breaker_recovery_timeout)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        secs(self.cleanup_timeout_seconds)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("default_timeout_seconds", self.default_timeout_seconds)?;
        positive("max_timeout_seconds", self.max_timeout_seconds)?;
        positive("cleanup_timeout_seconds", self.cleanup_timeout_seconds)?;
        if !(self.circuit_breaker_recovery_timeout.is_finite()
            && self.circuit_breaker_recovery_timeout >= 0.0)
        {
            return Err(ConfigError::Invalid(
                "circuit_breaker_recovery_timeout must be >= 0".to_string(),
            ));
        }
        if self.max_timeout_seconds < self.default_timeout_seconds {
            return Err(ConfigError::Invalid(format!(
                "max_timeout_seconds ({}) must be >= default_timeout_seconds ({})",
                self.max_timeout_seconds, self.default_timeout_seconds
            )));
        }
        if self.circuit_breaker_failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit_breaker_failure_threshold must be at least 1".to_string(),
            ));
        }
        if !(self.timeout_adjustment_factor.is_finite() && self.timeout_adjustment_factor >= 1.0) {
            return Err(ConfigError::Invalid(
                "timeout_adjustment_factor must be >= 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub max_contexts_per_user: usize,
    /// Applied when neither the caller nor the context supplies a TTL.
    pub default_ttl_seconds: Option<f64>,
    pub sweep_interval_seconds: f64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_contexts_per_user: MAX_CONTEXTS_PER_USER,
            default_ttl_seconds: None,
            sweep_interval_seconds: 30.0,
        }
    }
}

impl ContextConfig {
    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_seconds.map(secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        secs(self.sweep_interval_seconds)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_contexts_per_user == 0 {
            return Err(ConfigError::Invalid(
                "max_contexts_per_user must be at least 1".to_string(),
            ));
        }
        if let Some(ttl) = self.default_ttl_seconds {
            positive("default_ttl_seconds", ttl)?;
        }
        positive("sweep_interval_seconds", self.sweep_interval_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Capacity of each connection's outbound channel.
    pub outbound_buffer: usize,
    /// Critical events kept per run for resume replay.
    pub replay_history_limit: usize,
    /// How long a send waits on a full outbound channel before the message
    /// is buffered for later.
    pub send_timeout_seconds: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: 256,
            replay_history_limit: 64,
            send_timeout_seconds: 1.0,
        }
    }
}

impl RouterConfig {
    pub fn send_timeout(&self) -> Duration {
        secs(self.send_timeout_seconds)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.outbound_buffer == 0 {
            return Err(ConfigError::Invalid(
                "outbound_buffer must be at least 1".to_string(),
            ));
        }
        positive("send_timeout_seconds", self.send_timeout_seconds)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub timeout: TimeoutConfig,
    pub context: ContextConfig,
    pub router: RouterConfig,
}

impl CoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.timeout.validate()?;
        self.context.validate()?;
        self.router.validate()
    }

    /// Apply `STRATA_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_parse::<f64>("STRATA_DEFAULT_TIMEOUT_SECONDS")? {
            self.timeout.default_timeout_seconds = v;
        }
        if let Some(v) = env_parse::<f64>("STRATA_MAX_TIMEOUT_SECONDS")? {
            self.timeout.max_timeout_seconds = v;
        }
        if let Some(v) = env_parse::<usize>("STRATA_MAX_CONTEXTS_PER_USER")? {
            self.context.max_contexts_per_user = v;
        }
        Ok(())
    }
}

/// Load configuration from a YAML file, apply env overrides and validate.
///
/// # Errors
/// Returns error if the file is missing, is not valid YAML, or fails validation
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CoreConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;

    let mut config: CoreConfig = if content.trim().is_empty() {
        CoreConfig::default()
    } else {
        serde_yaml::from_str(&content)?
    };

    config.apply_env_overrides()?;
    config.validate()?;
    tracing::debug!("Loaded configuration from {}", path.display());
    Ok(config)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(format!("{} has an invalid value: {}", name, raw))),
        Err(_) => Ok(None),
    }
}

fn positive(name: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!("{} must be > 0 (got {})", name, value)))
    }
}

/// Seconds to `Duration`, clamping negatives and non-finite values to zero
/// and saturating values too large to represent.
pub fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = CoreConfig::default();
        config.validate().unwrap();
        assert_eq!(config.context.max_contexts_per_user, MAX_CONTEXTS_PER_USER);
        assert_eq!(config.timeout.default_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_load_partial_yaml() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("strata.yaml");
        fs::write(
            &path,
            "timeout:\n  default_timeout_seconds: 2\n  circuit_breaker_failure_threshold: 3\ncontext:\n  max_contexts_per_user: 4\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.timeout.default_timeout_seconds, 2.0);
        assert_eq!(config.timeout.circuit_breaker_failure_threshold, 3);
        assert_eq!(config.timeout.max_timeout_seconds, 300.0);
        assert_eq!(config.context.max_contexts_per_user, 4);
        assert_eq!(config.router.outbound_buffer, 256);
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("empty.yaml");
        fs::write(&path, "   \n").unwrap();
        assert_eq!(load_config(&path).unwrap(), CoreConfig::default());
    }

    #[test]
    fn test_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let result = load_config(temp_dir.path().join("missing.yaml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_invalid_yaml() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.yaml");
        fs::write(&path, "timeout: [unclosed").unwrap();
        assert!(matches!(load_config(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = TimeoutConfig {
            max_timeout_seconds: 1.0,
            default_timeout_seconds: 2.0,
            ..TimeoutConfig::default()
        };
        assert!(config.validate().is_err());

        config = TimeoutConfig {
            timeout_adjustment_factor: 0.5,
            ..TimeoutConfig::default()
        };
        assert!(config.validate().is_err());

        config = TimeoutConfig {
            circuit_breaker_failure_threshold: 0,
            ..TimeoutConfig::default()
        };
        assert!(config.validate().is_err());

        let context = ContextConfig {
            max_contexts_per_user: 0,
            ..ContextConfig::default()
        };
        assert!(context.validate().is_err());

        let router = RouterConfig {
            send_timeout_seconds: 0.0,
            ..RouterConfig::default()
        };
        assert!(router.validate().is_err());
    }

    #[test]
    fn test_secs_clamps() {
        assert_eq!(secs(-1.0), Duration::ZERO);
        assert_eq!(secs(f64::NAN), Duration::ZERO);
        assert_eq!(secs(0.1), Duration::from_millis(100));
        assert_eq!(secs(1e300), Duration::MAX);
    }
}
