//! Serial transport abstractions.
//!
//! A link never talks to `tokio_serial` directly. It asks a [`Connector`] for a
//! type-erased [`DynSerial`] when it opens and hands that stream to its worker, which
//! owns it until the link closes. Production code uses [`SerialConnector`]; tests use
//! [`crate::mock_serial::MockConnector`].
//!
//! # Types
//!
//! - [`SerialPortIO`]: trait alias combining `AsyncRead + AsyncWrite` for serial ports
//! - [`DynSerial`]: type-erased boxed serial port
//! - [`Connector`]: opens a transport for an address with fixed [`SerialSettings`]
//!
//! # Utilities
//!
//! - [`open_serial_async`]: open a serial port on a blocking thread
//! - [`available_ports`]: enumerate the serial ports of this machine

use crate::config::SerialSettings;
use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used
/// as a serial port. This includes:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::io::DuplexStream` (testing)
/// - [`crate::mock_serial::MockSerialPort`]
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Opens transports for links.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open the transport at `address` configured with `settings`.
    async fn connect(&self, address: &str, settings: &SerialSettings) -> io::Result<DynSerial>;
}

/// Connector for real serial hardware.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialConnector;

#[async_trait]
impl Connector for SerialConnector {
    async fn connect(&self, address: &str, settings: &SerialSettings) -> io::Result<DynSerial> {
        let port = open_serial_async(address, settings).await?;
        Ok(Box::new(port))
    }
}

/// Open a serial port asynchronously using `spawn_blocking`.
///
/// Opening can block on some platforms, so it runs off the async runtime. The
/// configured framing is applied with no flow control. Read timeouts are enforced by
/// the link worker around each line read rather than by the driver.
pub async fn open_serial_async(
    address: &str,
    settings: &SerialSettings,
) -> io::Result<tokio_serial::SerialStream> {
    use tokio_serial::SerialPortBuilderExt;

    let data_bits = settings
        .tokio_data_bits()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
    let stop_bits = settings
        .tokio_stop_bits()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
    let address_owned = address.to_string();
    let baud_rate = settings.baud_rate;
    let parity = settings.parity.into();
    let timeout = settings.read_timeout();

    let port = tokio::task::spawn_blocking(move || {
        tokio_serial::new(&address_owned, baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(timeout)
            .open_native_async()
    })
    .await
    .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("serial open task failed: {e}")))?
    .map_err(io::Error::from)?;

    debug!(port = address, baud_rate, "Opened serial port");
    Ok(port)
}

/// Names of the serial ports available on this machine.
pub fn available_ports() -> io::Result<Vec<String>> {
    let ports = tokio_serial::available_ports().map_err(io::Error::from)?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}
