//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};

/// Prefix for environment variable overrides, e.g. `TURNSTILE__LOGGING__LEVEL`.
const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for Turnstile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Background sweeper configuration
    #[serde(default)]
    pub sweeper: SweeperConfig,

    /// Limiter settings keyed by endpoint family (e.g. `login`, `otp`)
    #[serde(default = "default_limiters")]
    pub limiters: BTreeMap<String, LimiterSettings>,
}

impl Default for TurnstileConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            sweeper: SweeperConfig::default(),
            limiters: default_limiters(),
        }
    }
}

/// Parameters for a single rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Maximum admitted requests per key per window
    pub capacity: u64,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Hard cap on distinct keys tracked at once
    #[serde(default = "default_max_buckets")]
    pub max_buckets: usize,
}

impl LimiterSettings {
    /// Create settings, validating that every parameter is positive.
    pub fn new(capacity: u64, window_ms: u64, max_buckets: usize) -> Result<Self> {
        let settings = Self {
            capacity,
            window_ms,
            max_buckets,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Reject non-positive parameters.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(TurnstileError::Config("capacity must be positive".into()));
        }
        if self.window_ms == 0 {
            return Err(TurnstileError::Config("window_ms must be positive".into()));
        }
        if self.max_buckets == 0 {
            return Err(TurnstileError::Config(
                "max_buckets must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Window length as a `Duration`.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

fn default_max_buckets() -> usize {
    10_000
}

fn default_limiters() -> BTreeMap<String, LimiterSettings> {
    let mut limiters = BTreeMap::new();
    limiters.insert(
        "login".to_string(),
        LimiterSettings {
            capacity: 5,
            window_ms: 60_000,
            max_buckets: default_max_buckets(),
        },
    );
    limiters.insert(
        "otp".to_string(),
        LimiterSettings {
            capacity: 3,
            window_ms: 300_000,
            max_buckets: default_max_buckets(),
        },
    );
    limiters.insert(
        "password_reset".to_string(),
        LimiterSettings {
            capacity: 3,
            window_ms: 3_600_000,
            max_buckets: default_max_buckets(),
        },
    );
    limiters
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(TurnstileError::Config(format!(
                "unknown log format: {}",
                other
            ))),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level filter; `RUST_LOG` takes precedence when set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Background sweeper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Whether to run periodic expiry sweeps in addition to per-call cleanup
    #[serde(default)]
    pub enabled: bool,

    /// Sweep interval in milliseconds
    #[serde(default = "default_sweep_interval")]
    pub interval_ms: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: default_sweep_interval(),
        }
    }
}

impl SweeperConfig {
    /// Sweep interval as a `Duration`.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

fn default_sweep_interval() -> u64 {
    1000
}

impl TurnstileConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from an optional YAML file, then apply
    /// `TURNSTILE__*` environment variables on top.
    ///
    /// With a file, sections it omits fall back to their serde defaults,
    /// exactly as in [`TurnstileConfig::from_file`]: a `limiters` table
    /// replaces the default families rather than extending them. Without a
    /// file, environment variables override the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let builder = match path {
            Some(path) => {
                info!(path = %path.display(), "Loading configuration");
                config::Config::builder().add_source(
                    config::File::from(path)
                        .format(config::FileFormat::Yaml)
                        .required(true),
                )
            }
            None => config::Config::builder()
                .add_source(config::Config::try_from(&TurnstileConfig::default())?),
        };

        let config: TurnstileConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate every limiter entry.
    pub fn validate(&self) -> Result<()> {
        for (family, settings) in &self.limiters {
            settings.validate().map_err(|e| match e {
                TurnstileError::Config(msg) => {
                    TurnstileError::Config(format!("limiter `{}`: {}", family, msg))
                }
                other => other,
            })?;
        }
        if self.sweeper.enabled && self.sweeper.interval_ms == 0 {
            return Err(TurnstileError::Config(
                "sweeper.interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_has_sensitive_families() {
        let config = TurnstileConfig::default();

        assert_eq!(config.limiters.len(), 3);
        assert_eq!(config.limiters["login"].capacity, 5);
        assert_eq!(config.limiters["otp"].window_ms, 300_000);
        assert!(config.limiters.contains_key("password_reset"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_settings_reject_non_positive() {
        assert!(LimiterSettings::new(0, 1000, 10).is_err());
        assert!(LimiterSettings::new(1, 0, 10).is_err());
        assert!(LimiterSettings::new(1, 1000, 0).is_err());
        assert!(LimiterSettings::new(1, 1000, 10).is_ok());
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
logging:
  level: debug
  format: json
sweeper:
  enabled: true
  interval_ms: 250
limiters:
  login:
    capacity: 10
    window_ms: 30000
    max_buckets: 500
  signup:
    capacity: 2
    window_ms: 1000
"#;

        let config = TurnstileConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.sweeper.enabled);
        assert_eq!(config.sweeper.interval(), Duration::from_millis(250));
        assert_eq!(config.limiters.len(), 2);
        assert_eq!(config.limiters["login"].max_buckets, 500);
        assert_eq!(config.limiters["signup"].max_buckets, 10_000);
    }

    #[test]
    fn test_from_yaml_rejects_zero_capacity() {
        let yaml = r#"
limiters:
  login:
    capacity: 0
    window_ms: 1000
"#;

        let err = TurnstileConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("login"));
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let config = TurnstileConfig::from_yaml("logging:\n  level: warn\n").unwrap();
        assert_eq!(config.logging.level, "warn");
        assert_eq!(config.logging.format, LogFormat::Text);
        assert!(!config.sweeper.enabled);
        assert_eq!(config.limiters.len(), 3);
    }

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    /// Serializes tests that read or write `TURNSTILE__*` variables.
    static ENV_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());

    /// Sets variables for the lifetime of the guard.
    struct EnvGuard(Vec<&'static str>);

    impl EnvGuard {
        fn set(vars: &[(&'static str, &str)]) -> Self {
            for (name, value) in vars {
                std::env::set_var(name, value);
            }
            Self(vars.iter().map(|(name, _)| *name).collect())
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for name in &self.0 {
                std::env::remove_var(name);
            }
        }
    }

    fn write_config(name: &str, yaml: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "turnstile-{}-{}.yaml",
            name,
            std::process::id()
        ));
        std::fs::write(&path, yaml).unwrap();
        path
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let _lock = ENV_LOCK.lock();
        let config = TurnstileConfig::load(None).unwrap();
        assert_eq!(config.limiters["login"].capacity, 5);
        assert_eq!(config.limiters.len(), 3);
    }

    #[test]
    fn test_load_file_replaces_default_families() {
        let _lock = ENV_LOCK.lock();
        let path = write_config(
            "replace",
            "limiters:\n  signup:\n    capacity: 2\n    window_ms: 1000\n",
        );

        let loaded = TurnstileConfig::load(Some(&path)).unwrap();
        let parsed = TurnstileConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        let families: Vec<&String> = loaded.limiters.keys().collect();
        assert_eq!(families, vec!["signup"]);
        assert_eq!(loaded.limiters, parsed.limiters);
        assert_eq!(loaded.limiters["signup"].max_buckets, 10_000);
    }

    #[test]
    fn test_load_file_without_limiters_keeps_defaults() {
        let _lock = ENV_LOCK.lock();
        let path = write_config(
            "logging-only",
            "logging:\n  level: debug\n  format: json\n",
        );

        let config = TurnstileConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.limiters, default_limiters());
    }

    #[test]
    fn test_load_missing_file_fails() {
        let _lock = ENV_LOCK.lock();
        let path = std::env::temp_dir().join("turnstile-does-not-exist.yaml");
        assert!(matches!(
            TurnstileConfig::load(Some(&path)),
            Err(TurnstileError::Config(_))
        ));
    }

    #[test]
    fn test_load_env_overrides_defaults() {
        let _lock = ENV_LOCK.lock();
        let _env = EnvGuard::set(&[
            ("TURNSTILE__LOGGING__LEVEL", "trace"),
            ("TURNSTILE__SWEEPER__ENABLED", "true"),
            ("TURNSTILE__SWEEPER__INTERVAL_MS", "250"),
            ("TURNSTILE__LIMITERS__OTP__CAPACITY", "7"),
        ]);

        let config = TurnstileConfig::load(None).unwrap();

        assert_eq!(config.logging.level, "trace");
        assert!(config.sweeper.enabled);
        assert_eq!(config.sweeper.interval_ms, 250);
        assert_eq!(config.limiters["otp"].capacity, 7);
        assert_eq!(config.limiters["otp"].window_ms, 300_000);
        assert_eq!(config.limiters.len(), 3);
    }

    #[test]
    fn test_load_env_overrides_file() {
        let _lock = ENV_LOCK.lock();
        let path = write_config(
            "env-over-file",
            "limiters:\n  login:\n    capacity: 10\n    window_ms: 30000\n",
        );
        let _env = EnvGuard::set(&[("TURNSTILE__LIMITERS__LOGIN__WINDOW_MS", "5000")]);

        let config = TurnstileConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.limiters["login"].capacity, 10);
        assert_eq!(config.limiters["login"].window_ms, 5_000);
    }

    #[test]
    fn test_load_env_zero_capacity_fails_validation() {
        let _lock = ENV_LOCK.lock();
        let _env = EnvGuard::set(&[("TURNSTILE__LIMITERS__LOGIN__CAPACITY", "0")]);

        let err = TurnstileConfig::load(None).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("login"));
        assert!(message.contains("capacity must be positive"));
    }
}
