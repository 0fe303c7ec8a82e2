//! Tracing subscriber setup for the binary
//!
//! The library only emits `tracing` events; installing a subscriber is left
//! to whoever embeds it. `RUST_LOG` always wins over the configured level.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// Per-module overrides such as `("stakequiz::oracle", "trace")`
    pub module_levels: Vec<(String, String)>,
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            module_levels: Vec::new(),
            with_target: false,
        }
    }
}

impl LoggingConfig {
    pub fn verbose(verbose: bool) -> Self {
        if verbose {
            Self {
                level: "debug".to_string(),
                with_target: true,
                ..Self::default()
            }
        } else {
            Self::default()
        }
    }

    fn filter(&self) -> Result<EnvFilter> {
        let mut filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
            Ok(directives) if !directives.trim().is_empty() => EnvFilter::new(directives),
            _ => EnvFilter::new(&self.level),
        };

        for (module, level) in &self.module_levels {
            let directive = format!("{}={}", module, level)
                .parse()
                .map_err(|e| Error::Config(format!("bad log directive {}={}: {}", module, level, e)))?;
            filter = filter.add_directive(directive);
        }
        Ok(filter)
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = config.filter()?;

    Registry::default()
        .with(filter)
        .with(fmt::layer().with_target(config.with_target))
        .try_init()
        .map_err(|e| Error::Config(format!("logging already initialised: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_bumps_level() {
        assert_eq!(LoggingConfig::verbose(false).level, "info");
        assert_eq!(LoggingConfig::verbose(true).level, "debug");
    }

    #[test]
    fn test_bad_directive_is_config_error() {
        let config = LoggingConfig {
            module_levels: vec![("stakequiz".to_string(), "loudest".to_string())],
            ..LoggingConfig::default()
        };
        assert!(matches!(config.filter(), Err(Error::Config(_))));
    }
}
