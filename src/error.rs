//! Custom error types for instrument links.
//!
//! `LinkError` is the single error type of the crate. Using `thiserror`, it covers
//! the failure kinds a serial instrument link can run into:
//!
//! - **`AlreadyOpen`** / **`NotOpen`**: state errors from `open()`, `close()` and
//!   `set_address()`.
//! - **`Open`**: the transport could not be opened (device absent or busy). The link
//!   stays closed.
//! - A command that cannot be written is not an error: its response is the
//!   write-error sentinel (`~`), returned to the caller unchanged.
//! - **`Rejected`**: the instrument answered with the error-indicator character.
//! - **`NoResponse`**: nothing usable came back before the read or await timeout.
//! - **`Abandoned`**: the link was closed before the queued command was exchanged.
//! - **`Config`** / **`Configuration`**: loading or validating configuration failed.
//!
//! None of these are fatal to the process; the worst outcome is a closed link that
//! the caller has to reopen.

use thiserror::Error;

/// Convenience alias for results using the link error type.
pub type LinkResult<T> = std::result::Result<T, LinkError>;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Link '{address}' is already open")]
    AlreadyOpen { address: String },

    #[error("Link is not open")]
    NotOpen,

    #[error("Failed to open serial port '{address}': {source}")]
    Open {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Instrument rejected command: {0}")]
    Rejected(String),

    #[error("No response from instrument")]
    NoResponse,

    #[error("Command abandoned because the link was closed")]
    Abandoned,

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LinkError {
    /// Whether retrying the same command on the same link may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LinkError::Rejected(_) | LinkError::NoResponse
        )
    }
}
