//! Logging setup.
//!
//! The runtime logs through `tracing`. Nothing is printed until a
//! subscriber is installed; [`init`] installs a formatting subscriber that
//! honours `RUST_LOG` and falls back to the configured filter.

use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Install the global `tracing` subscriber. Returns `false` if one was
/// already installed.
pub fn init(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let config = LogConfig {
            filter: "strand_runtime=trace".to_string(),
            report_failures: true,
        };
        init(&config);
        assert!(!init(&config));
    }
}
