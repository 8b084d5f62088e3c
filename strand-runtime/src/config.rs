//! Runtime Configuration
//!
//! Configuration for the fiber runtime. It can be set programmatically or
//! loaded from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `STRAND_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `STRAND_NUM_WORKERS` | Number of worker threads | CPU count |
//! | `STRAND_MAX_OPS` | Instructions a fiber runs before yielding | 10000 |
//! | `STRAND_LOG` | `tracing` filter directive | info |
//! | `STRAND_REPORT_FAILURES` | Log unhandled fiber failures ("true"/"false") | true |
//! | `STRAND_GRACEFUL_SHUTDOWN_MS` | Drain time for `run_main` in milliseconds | 5000 |
//!
//! # Example
//!
//! ```rust,ignore
//! use strand_runtime::config::RuntimeConfig;
//!
//! // Load from environment with defaults
//! let config = RuntimeConfig::from_env();
//!
//! // Or use the builder pattern
//! let config = RuntimeConfig::builder()
//!     .num_workers(4)
//!     .max_ops(2048)
//!     .build()?;
//! ```

use std::env;
use std::time::Duration;

use thiserror::Error;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker threads.
    /// Default: number of available CPUs.
    pub num_workers: usize,

    /// Prefix for worker thread names; workers are named `{prefix}-{index}`.
    /// Default: "strand-worker".
    pub thread_name_prefix: String,

    /// How long an idle worker sleeps before re-checking the queues.
    /// Default: 10ms.
    pub idle_wait: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus(),
            thread_name_prefix: "strand-worker".to_string(),
            idle_wait: Duration::from_millis(10),
        }
    }
}

/// Fiber interpreter configuration.
#[derive(Debug, Clone)]
pub struct FiberConfig {
    /// Instructions a fiber executes before yielding to other fibers.
    /// Default: 10000.
    pub max_ops: usize,
}

impl Default for FiberConfig {
    fn default() -> Self {
        Self { max_ops: 10_000 }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is not set.
    /// Default: "info".
    pub filter: String,

    /// Log failures that reach the end of a fiber unhandled.
    /// Default: true.
    pub report_failures: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            report_failures: true,
        }
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// How long `run_main` waits for interrupted root fibers to finish.
    /// Default: 5 seconds.
    pub graceful_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            graceful_timeout: Duration::from_secs(5),
        }
    }
}

/// Complete runtime configuration.
///
/// Use `RuntimeConfig::default()` for sensible defaults, or
/// `RuntimeConfig::from_env()` to load from environment variables.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Scheduler configuration.
    pub scheduler: SchedulerConfig,

    /// Fiber interpreter configuration.
    pub fiber: FiberConfig,

    /// Logging configuration.
    pub log: LogConfig,

    /// Shutdown configuration.
    pub shutdown: ShutdownConfig,
}

impl RuntimeConfig {
    /// Create a new builder for RuntimeConfig.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Environment variables that are not set use default values. Invalid
    /// values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_usize("STRAND_NUM_WORKERS") {
            if val > 0 {
                config.scheduler.num_workers = val;
            }
        }

        if let Some(val) = parse_env_usize("STRAND_MAX_OPS") {
            if val > 0 {
                config.fiber.max_ops = val;
            }
        }

        if let Ok(val) = env::var("STRAND_LOG") {
            if !val.trim().is_empty() {
                config.log.filter = val;
            }
        }

        if let Some(val) = parse_env_bool("STRAND_REPORT_FAILURES") {
            config.log.report_failures = val;
        }

        if let Some(val) = parse_env_usize("STRAND_GRACEFUL_SHUTDOWN_MS") {
            config.shutdown.graceful_timeout = Duration::from_millis(val as u64);
        }

        config
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.num_workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.num_workers".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.scheduler.thread_name_prefix.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.thread_name_prefix".into(),
                message: "must not be empty".into(),
            });
        }

        if self.fiber.max_ops == 0 {
            return Err(ConfigError::InvalidValue {
                field: "fiber.max_ops".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.log.filter.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "log.filter".into(),
                message: "must not be empty".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
}

/// Builder for RuntimeConfig.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads.
    pub fn num_workers(mut self, n: usize) -> Self {
        self.config.scheduler.num_workers = n;
        self
    }

    /// Set the worker thread name prefix.
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.scheduler.thread_name_prefix = prefix.into();
        self
    }

    /// Set how long idle workers sleep between queue checks.
    pub fn idle_wait(mut self, wait: Duration) -> Self {
        self.config.scheduler.idle_wait = wait;
        self
    }

    /// Set the instruction budget per fiber slice.
    pub fn max_ops(mut self, ops: usize) -> Self {
        self.config.fiber.max_ops = ops;
        self
    }

    /// Set the default log filter directive.
    pub fn log_filter(mut self, filter: impl Into<String>) -> Self {
        self.config.log.filter = filter.into();
        self
    }

    /// Enable or disable logging of unhandled fiber failures.
    pub fn report_failures(mut self, enabled: bool) -> Self {
        self.config.log.report_failures = enabled;
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn graceful_shutdown(mut self, timeout: Duration) -> Self {
        self.config.shutdown.graceful_timeout = timeout;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    pub fn build_unchecked(self) -> RuntimeConfig {
        self.config
    }
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

/// Parse an environment variable as bool.
fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|s| parse_bool(&s))
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Get the number of available CPUs.
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert!(config.scheduler.num_workers >= 1);
        assert_eq!(config.scheduler.thread_name_prefix, "strand-worker");
        assert_eq!(config.fiber.max_ops, 10_000);
        assert_eq!(config.log.filter, "info");
        assert!(config.log.report_failures);
        assert_eq!(config.shutdown.graceful_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::builder()
            .num_workers(4)
            .max_ops(128)
            .log_filter("strand_runtime=debug")
            .report_failures(false)
            .graceful_shutdown(Duration::from_millis(250))
            .build()
            .unwrap();

        assert_eq!(config.scheduler.num_workers, 4);
        assert_eq!(config.fiber.max_ops, 128);
        assert_eq!(config.log.filter, "strand_runtime=debug");
        assert!(!config.log.report_failures);
        assert_eq!(config.shutdown.graceful_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_builder_validation() {
        assert!(RuntimeConfig::builder().num_workers(0).build().is_err());
        assert!(RuntimeConfig::builder().max_ops(0).build().is_err());
        assert!(RuntimeConfig::builder().thread_name_prefix("").build().is_err());
        assert!(RuntimeConfig::builder().log_filter("  ").build().is_err());
    }

    #[test]
    fn test_build_unchecked_skips_validation() {
        let config = RuntimeConfig::builder().max_ops(0).build_unchecked();
        assert_eq!(config.fiber.max_ops, 0);
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool(" on "), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            field: "fiber.max_ops".into(),
            message: "must be at least 1".into(),
        };
        assert!(err.to_string().contains("fiber.max_ops"));
        assert!(err.to_string().contains("must be at least 1"));
    }

    // Every environment-touching assertion lives in this one test so that
    // parallel tests never observe each other's variables.
    #[test]
    fn test_from_env() {
        env::set_var("STRAND_NUM_WORKERS", "3");
        env::set_var("STRAND_MAX_OPS", "not-a-number");
        env::set_var("STRAND_LOG", "warn");
        env::set_var("STRAND_REPORT_FAILURES", "no");
        env::set_var("STRAND_GRACEFUL_SHUTDOWN_MS", "1500");

        let config = RuntimeConfig::from_env();
        assert_eq!(config.scheduler.num_workers, 3);
        assert_eq!(config.fiber.max_ops, 10_000);
        assert_eq!(config.log.filter, "warn");
        assert!(!config.log.report_failures);
        assert_eq!(config.shutdown.graceful_timeout, Duration::from_millis(1500));

        env::set_var("STRAND_NUM_WORKERS", "0");
        assert!(RuntimeConfig::from_env().scheduler.num_workers >= 1);

        for name in [
            "STRAND_NUM_WORKERS",
            "STRAND_MAX_OPS",
            "STRAND_LOG",
            "STRAND_REPORT_FAILURES",
            "STRAND_GRACEFUL_SHUTDOWN_MS",
        ] {
            env::remove_var(name);
        }
        let config = RuntimeConfig::from_env();
        assert_eq!(config.fiber.max_ops, 10_000);
        assert!(config.log.report_failures);
    }
}
