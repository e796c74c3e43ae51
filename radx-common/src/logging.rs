//! Process-level tracing setup for binaries and tests.
//!
//! Libraries in this workspace only emit `tracing` events; installing a
//! subscriber is left to the program that links them.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Logging options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset, e.g. "info" or "radx_client=debug".
    pub level: String,
    /// Emit ANSI colors.
    pub ansi: bool,
    /// Include the event target (module path) in each line.
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
            ansi: true,
            with_target: true,
        }
    }
}

/// Installs a global fmt subscriber.
///
/// Returns false when a global subscriber was already installed, which makes
/// repeated calls from tests harmless.
pub fn init_logging(config: &LogConfig) -> bool {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_ansi(config.ansi)
                .with_target(config.with_target),
        )
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_noop() {
        let config = LogConfig {
            ansi: false,
            ..LogConfig::default()
        };
        init_logging(&config);
        assert!(!init_logging(&config));
    }
}
