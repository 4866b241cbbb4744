//! # Instrument Link
//!
//! Serial command links for line-oriented laboratory instruments (temperature and
//! magnet power-supply controllers and the like). Each link owns one serial port,
//! funnels commands from any number of tasks or threads through a FIFO queue, and
//! exchanges them with the instrument one at a time on a dedicated worker task.
//!
//! ## Crate Structure
//!
//! - **`envelope`**: `Envelope`, a command paired with its single-assignment response.
//! - **`queue`**: the per-link FIFO of `LinkRequest`s with exactly one consumer.
//! - **`worker`**: the task that owns the transport and performs exchanges.
//! - **`link`**: `SerialLink`, the caller-facing handle (`open`, `close`, `transmit`).
//! - **`registry`**: `LinkRegistry`, named links built from configuration.
//! - **`serial`**: transport abstractions and the `tokio-serial` connector.
//! - **`mock_serial`**: a channel-backed fake port for tests without hardware.
//! - **`config`**: layered configuration (defaults, TOML file, environment).
//! - **`logging`**: `tracing` subscriber setup.
//! - **`error`**: the `LinkError` enum.

pub mod config;
pub mod envelope;
pub mod error;
pub mod link;
pub mod logging;
pub mod mock_serial;
pub mod queue;
pub mod registry;
pub mod serial;
pub mod worker;

pub use config::{LinkConfig, LinkSettings, SerialSettings};
pub use envelope::{Awaited, Envelope};
pub use error::{LinkError, LinkResult};
pub use link::{SerialLink, TransmitOptions};
pub use registry::LinkRegistry;
pub use serial::{Connector, SerialConnector};
