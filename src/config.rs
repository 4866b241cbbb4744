//! Configuration System using Figment
//!
//! Strongly-typed configuration for instrument links. Configuration is layered from:
//! 1. Built-in defaults (115200 baud, 8 data bits, no parity, 2 stop bits, 250 ms read timeout)
//! 2. `config/instrument-link.toml` (or any file passed to [`LinkConfig::load_from`])
//! 3. Environment variables prefixed with `INSTRUMENT_LINK_`, nested keys separated by `__`
//!
//! # Example
//! ```no_run
//! use instrument_link::config::LinkConfig;
//!
//! let config = LinkConfig::load()?;
//! config.validate()?;
//! for link in config.enabled_links() {
//!     println!("{} -> {}", link.name, link.address);
//! }
//! # Ok::<(), instrument_link::error::LinkError>(())
//! ```
//!
//! A minimal file:
//!
//! ```toml
//! [application]
//! log_level = "debug"
//!
//! [serial]
//! baud_rate = 9600
//!
//! [[links]]
//! name = "itc"
//! address = "COM6"
//! ```

use crate::error::{LinkError, LinkResult};
use crate::logging;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/instrument-link.toml";

/// Prefix for environment overrides, e.g. `INSTRUMENT_LINK_SERIAL__BAUD_RATE=9600`.
pub const ENV_PREFIX: &str = "INSTRUMENT_LINK_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LinkConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Serial line settings applied to every link on open
    pub serial: SerialSettings,
    /// Exchange timing
    pub timing: TimingSettings,
    /// Line protocol conventions
    pub protocol: ProtocolSettings,
    /// Named links
    pub links: Vec<LinkDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error, off)
    pub log_level: String,
    /// Log line format
    pub log_format: LogFormat,
    /// Echo traced command/response pairs regardless of `log_level`
    pub trace_exchanges: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "instrument-link".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
            trace_exchanges: true,
        }
    }
}

/// Output format of log lines.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, human oriented
    Pretty,
    /// One line per event
    Compact,
    /// One JSON object per event
    Json,
}

/// Parity setting of a serial line.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(value: Parity) -> Self {
        match value {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}

/// Serial line settings. These are link-level constants: they are applied
/// uniformly whenever a link is opened and are never adjusted per call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SerialSettings {
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits per character (5-8)
    pub data_bits: u8,
    /// Parity
    pub parity: Parity,
    /// Stop bits (1 or 2)
    pub stop_bits: u8,
    /// Upper bound on reading one response line, in milliseconds
    pub read_timeout_ms: u64,
    /// Upper bound on writing one command, in milliseconds
    pub write_timeout_ms: u64,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 2,
            read_timeout_ms: 250,
            write_timeout_ms: 1000,
        }
    }
}

impl SerialSettings {
    /// Read timeout as a [`Duration`].
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Write timeout as a [`Duration`].
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Data bits in the form `tokio_serial` expects.
    pub fn tokio_data_bits(&self) -> LinkResult<tokio_serial::DataBits> {
        match self.data_bits {
            5 => Ok(tokio_serial::DataBits::Five),
            6 => Ok(tokio_serial::DataBits::Six),
            7 => Ok(tokio_serial::DataBits::Seven),
            8 => Ok(tokio_serial::DataBits::Eight),
            other => Err(LinkError::Configuration(format!(
                "Invalid data_bits {other}. Must be 5-8"
            ))),
        }
    }

    /// Stop bits in the form `tokio_serial` expects.
    pub fn tokio_stop_bits(&self) -> LinkResult<tokio_serial::StopBits> {
        match self.stop_bits {
            1 => Ok(tokio_serial::StopBits::One),
            2 => Ok(tokio_serial::StopBits::Two),
            other => Err(LinkError::Configuration(format!(
                "Invalid stop_bits {other}. Must be 1 or 2"
            ))),
        }
    }
}

/// Delays and timeouts around one exchange.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimingSettings {
    /// Pause before writing a command, in milliseconds
    pub pre_write_delay_ms: u64,
    /// Pause between writing a command and reading its response, in milliseconds
    pub pre_read_delay_ms: u64,
    /// How long a caller waits for a queued command's response, in milliseconds
    pub response_timeout_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            pre_write_delay_ms: 5,
            pre_read_delay_ms: 5,
            response_timeout_ms: 60_000,
        }
    }
}

impl TimingSettings {
    /// Pre-write delay as a [`Duration`].
    pub fn pre_write_delay(&self) -> Duration {
        Duration::from_millis(self.pre_write_delay_ms)
    }

    /// Pre-read delay as a [`Duration`].
    pub fn pre_read_delay(&self) -> Duration {
        Duration::from_millis(self.pre_read_delay_ms)
    }

    /// Default response await timeout as a [`Duration`].
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Conventions of the line protocol. Everything except the leading
/// error-indicator character is opaque to the link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProtocolSettings {
    /// Appended to every outbound command and stripped from every response
    pub line_terminator: String,
    /// Leading character of an instrument-side rejection; also the value
    /// `transmit` returns once every attempt has failed
    pub error_indicator: char,
    /// Response recorded on an envelope whose command could not be written
    pub write_error_sentinel: char,
    /// Attempts per `transmit` call unless the caller overrides it
    pub default_attempts: u32,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            line_terminator: "\n".to_string(),
            error_indicator: '?',
            write_error_sentinel: '~',
            default_attempts: 2,
        }
    }
}

/// A named link in configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkDefinition {
    /// Unique link name (e.g. "itc", "ips")
    pub name: String,
    /// Serial port path (e.g. "/dev/ttyUSB0", "COM6")
    pub address: String,
    /// Whether this link is opened by `LinkRegistry::open_all`
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// The part of the configuration a single link needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkSettings {
    /// Serial line settings
    pub serial: SerialSettings,
    /// Exchange timing
    pub timing: TimingSettings,
    /// Line protocol conventions
    pub protocol: ProtocolSettings,
}

impl LinkConfig {
    /// Load configuration from [`DEFAULT_CONFIG_PATH`] and environment variables.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load() -> LinkResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> LinkResult<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(LinkConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> LinkResult<()> {
        logging::level_filter(&self.application.log_level)?;

        if self.serial.baud_rate == 0 {
            return Err(LinkError::Configuration(
                "baud_rate must be greater than zero".to_string(),
            ));
        }
        if self.serial.read_timeout_ms == 0 || self.serial.write_timeout_ms == 0 {
            return Err(LinkError::Configuration(
                "read_timeout_ms and write_timeout_ms must be greater than zero".to_string(),
            ));
        }
        self.serial.tokio_data_bits()?;
        self.serial.tokio_stop_bits()?;

        if self.protocol.line_terminator.is_empty() {
            return Err(LinkError::Configuration(
                "line_terminator must not be empty".to_string(),
            ));
        }

        if self.protocol.default_attempts == 0 {
            return Err(LinkError::Configuration(
                "default_attempts must be at least 1".to_string(),
            ));
        }

        if self.protocol.error_indicator == self.protocol.write_error_sentinel {
            return Err(LinkError::Configuration(format!(
                "error_indicator and write_error_sentinel must differ (both '{}')",
                self.protocol.error_indicator
            )));
        }

        let mut names = HashSet::new();
        for link in &self.links {
            if !names.insert(link.name.as_str()) {
                return Err(LinkError::Configuration(format!(
                    "Duplicate link name: {}",
                    link.name
                )));
            }
        }

        Ok(())
    }

    /// Settings shared by every link built from this configuration.
    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            serial: self.serial.clone(),
            timing: self.timing.clone(),
            protocol: self.protocol.clone(),
        }
    }

    /// Get all enabled links
    pub fn enabled_links(&self) -> Vec<&LinkDefinition> {
        self.links.iter().filter(|link| link.enabled).collect()
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml_string(&self) -> LinkResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| LinkError::Configuration(format!("Cannot render configuration: {e}")))
    }
}
