//! Logging setup for instrument links.
//!
//! Everything in the crate logs through `tracing`. This module installs the global
//! subscriber from the `[application]` section of the configuration:
//!
//! - `log_level` sets the default filter (`RUST_LOG` replaces it entirely when set)
//! - `log_format` picks pretty, compact or JSON lines
//! - `trace_exchanges` controls the command/response echo on [`TRACE_TARGET`]
//!   independently of `log_level`, so a quiet `warn` setup can still show traffic
//!
//! ```no_run
//! use instrument_link::{config::LinkConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LinkConfig::load()?;
//! logging::init(&config.application)?;
//! tracing::info!("Application started");
//! # Ok(())
//! # }
//! ```

use crate::config::{ApplicationConfig, LogFormat};
use crate::error::{LinkError, LinkResult};
use std::str::FromStr;
use tracing_subscriber::{
    filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
    Registry,
};

/// Target of the command/response echo of traced exchanges.
pub const TRACE_TARGET: &str = "instrument_link::trace";

/// Parse a configured level name (case-insensitive, `off` allowed).
pub fn level_filter(level: &str) -> LinkResult<LevelFilter> {
    LevelFilter::from_str(level.trim()).map_err(|_| {
        LinkError::Configuration(format!(
            "Invalid log_level '{level}'. Must be one of: trace, debug, info, warn, error, off"
        ))
    })
}

/// Filter directives for `application`: the configured level, plus the
/// exchange echo switched on or off explicitly.
pub fn filter_directives(application: &ApplicationConfig) -> LinkResult<String> {
    let level = level_filter(&application.log_level)?;
    let echo = if application.trace_exchanges {
        LevelFilter::INFO
    } else {
        LevelFilter::OFF
    };
    Ok(format!("{level},{TRACE_TARGET}={echo}").to_lowercase())
}

fn env_filter(application: &ApplicationConfig) -> LinkResult<EnvFilter> {
    // Checked even when RUST_LOG takes over.
    let directives = filter_directives(application)?;
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&directives).map_err(|e| {
        LinkError::Configuration(format!("Invalid log filter '{directives}': {e}"))
    })
}

/// Install the global subscriber.
///
/// Returns `Ok(false)` without touching anything when a subscriber is already
/// installed (tests, or an embedding application that set up its own).
pub fn init(application: &ApplicationConfig) -> LinkResult<bool> {
    let filter = env_filter(application)?;
    if tracing::dispatcher::has_been_set() {
        return Ok(false);
    }

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match application.log_format {
        LogFormat::Pretty => fmt::layer().pretty().boxed(),
        LogFormat::Compact => fmt::layer().compact().with_ansi(false).boxed(),
        LogFormat::Json => fmt::layer().json().boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()
        .map_err(|e| LinkError::Configuration(format!("Failed to install logging: {e}")))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_names() {
        assert_eq!(level_filter("debug").unwrap(), LevelFilter::DEBUG);
        assert_eq!(level_filter("WARN").unwrap(), LevelFilter::WARN);
        assert_eq!(level_filter(" off ").unwrap(), LevelFilter::OFF);
        assert!(matches!(
            level_filter("loud"),
            Err(LinkError::Configuration(_))
        ));
    }

    #[test]
    fn test_exchange_echo_follows_config() {
        let mut application = ApplicationConfig {
            log_level: "WARN".to_string(),
            ..Default::default()
        };
        assert_eq!(
            filter_directives(&application).unwrap(),
            "warn,instrument_link::trace=info"
        );

        application.trace_exchanges = false;
        assert_eq!(
            filter_directives(&application).unwrap(),
            "warn,instrument_link::trace=off"
        );
    }

    #[test]
    fn test_directives_parse_as_env_filter() {
        let directives = filter_directives(&ApplicationConfig::default()).unwrap();
        assert!(EnvFilter::try_new(directives).is_ok());
    }
}
