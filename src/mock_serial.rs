//! Mock serial port for testing links without hardware.
//!
//! `MockSerialPort` implements `AsyncRead` and `AsyncWrite` and is handed to the code
//! under test; `MockDeviceHarness` stays with the test and plays the instrument.
//! [`MockConnector`] plugs mock ports into `SerialLink::open` the same way
//! [`crate::serial::SerialConnector`] plugs in real ones.
//!
//! # Architecture
//!
//! A pair of unbounded channels simulates the wire:
//! - `MockSerialPort` (given to the link): writes go to the harness, reads come from it
//! - `MockDeviceHarness` (kept in the test): asserts on writes and scripts responses
//!
//! Dropping the harness makes further writes fail with `BrokenPipe` and reads hit
//! end-of-file, which is how tests simulate a transport fault.
//!
//! # Example
//!
//! ```rust,no_run
//! use instrument_link::mock_serial;
//! use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
//!
//! # async fn demo() {
//! let (port, mut harness) = mock_serial::new();
//! let mut port = BufReader::new(port);
//!
//! let app = tokio::spawn(async move {
//!     port.write_all(b"*IDN?\n").await.unwrap();
//!     let mut response = String::new();
//!     port.read_line(&mut response).await.unwrap();
//!     response
//! });
//!
//! harness.expect_and_respond(b"*IDN?\n", b"IDN:MOCK\n").await;
//! assert_eq!(app.await.unwrap(), "IDN:MOCK\n");
//! # }
//! ```

use crate::config::SerialSettings;
use crate::serial::{Connector, DynSerial};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

/// The link-facing side of the mock serial port
#[derive(Debug)]
pub struct MockSerialPort {
    /// Channel to send written data to the harness
    writes_tx: UnboundedSender<Vec<u8>>,
    /// Channel to receive data from the harness to be read
    reads_rx: UnboundedReceiver<Vec<u8>>,
    /// Data received from the harness but not yet read by the client
    read_buffer: VecDeque<u8>,
}

/// The test-facing side for controlling the mock serial port
#[derive(Debug)]
pub struct MockDeviceHarness {
    /// Channel to receive data written by the client
    writes_rx: UnboundedReceiver<Vec<u8>>,
    /// Channel to send data to the client for it to read
    reads_tx: UnboundedSender<Vec<u8>>,
    /// Data received from the client but not yet consumed by the test
    write_buffer: Vec<u8>,
}

/// Creates a new connected pair of `MockSerialPort` and `MockDeviceHarness`
pub fn new() -> (MockSerialPort, MockDeviceHarness) {
    let (client_to_harness_tx, client_to_harness_rx) = mpsc::unbounded_channel();
    let (harness_to_client_tx, harness_to_client_rx) = mpsc::unbounded_channel();

    let port = MockSerialPort {
        writes_tx: client_to_harness_tx,
        reads_rx: harness_to_client_rx,
        read_buffer: VecDeque::new(),
    };

    let harness = MockDeviceHarness {
        writes_rx: client_to_harness_rx,
        reads_tx: harness_to_client_tx,
        write_buffer: Vec::new(),
    };

    (port, harness)
}

impl AsyncRead for MockSerialPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.read_buffer.is_empty() {
            match self.reads_rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => self.read_buffer.extend(chunk),
                // Harness dropped: end-of-file
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }

        let to_read = std::cmp::min(buf.remaining(), self.read_buffer.len());
        let chunk: Vec<u8> = self.read_buffer.drain(..to_read).collect();
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockSerialPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.writes_tx.send(buf.to_vec()) {
            Ok(_) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock device harness disconnected",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl MockDeviceHarness {
    /// Sends data to the client, as if the device had written it to the line.
    ///
    /// # Errors
    /// Returns error if the client port has been dropped
    pub fn send_response(&self, data: &[u8]) -> Result<(), &'static str> {
        self.reads_tx
            .send(data.to_vec())
            .map_err(|_| "Failed to send response: client port disconnected")
    }

    /// Waits for the client to write `expected` and asserts on it.
    ///
    /// # Panics
    /// Panics if the data does not arrive within 2 seconds or does not match.
    pub async fn expect_write(&mut self, expected: &[u8]) {
        use tokio::time::{timeout, Duration};

        let timeout_duration = Duration::from_secs(2);

        while self.write_buffer.len() < expected.len() {
            match timeout(timeout_duration, self.writes_rx.recv()).await {
                Ok(Some(chunk)) => self.write_buffer.extend_from_slice(&chunk),
                Ok(None) => panic!("Client-side port closed while expecting a write."),
                Err(_) => {
                    panic!(
                        "Timeout waiting for write. Expected `{:?}`, but only received `{:?}`.",
                        String::from_utf8_lossy(expected),
                        String::from_utf8_lossy(&self.write_buffer),
                    );
                }
            }
        }

        let actual = &self.write_buffer[..expected.len()];
        assert_eq!(
            actual,
            expected,
            "Mismatch in expected write. Expected `{:?}`, got `{:?}`.",
            String::from_utf8_lossy(expected),
            String::from_utf8_lossy(actual)
        );

        self.write_buffer.drain(..expected.len());
    }

    /// Expects a write and sends a response in one operation
    pub async fn expect_and_respond(&mut self, expected: &[u8], response: &[u8]) {
        self.expect_write(expected).await;
        if let Err(e) = self.send_response(response) {
            panic!("{e}");
        }
    }

    /// Next newline-terminated line written by the client, without the newline.
    ///
    /// Returns `None` once the client port is dropped and no full line remains.
    pub async fn next_line(&mut self) -> Option<String> {
        loop {
            if let Some(pos) = self.write_buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.write_buffer.drain(..=pos).collect();
                return Some(String::from_utf8_lossy(&line[..pos]).into_owned());
            }
            let chunk = self.writes_rx.recv().await?;
            self.write_buffer.extend_from_slice(&chunk);
        }
    }

    /// Play a scripted instrument until the client port is dropped.
    ///
    /// `respond` sees every command line in arrival order; `Some(reply)` is sent
    /// back with a trailing newline, `None` leaves the client to time out. The task
    /// resolves to every command received, in order.
    pub fn spawn_responder<F>(mut self, mut respond: F) -> JoinHandle<Vec<String>>
    where
        F: FnMut(&str) -> Option<String> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut received = Vec::new();
            while let Some(line) = self.next_line().await {
                if let Some(reply) = respond(&line) {
                    let _ = self.send_response(format!("{reply}\n").as_bytes());
                }
                received.push(line);
            }
            received
        })
    }
}

/// Hands out prepared mock ports to links, in order.
///
/// Once every prepared port has been handed out, further connects fail with
/// `NotFound`, which simulates an absent or busy device.
#[derive(Debug, Default)]
pub struct MockConnector {
    ports: Mutex<VecDeque<MockSerialPort>>,
    connects: Mutex<Vec<(String, SerialSettings)>>,
}

impl MockConnector {
    /// A connector with no ports: every connect fails.
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector with one port, plus the harness driving it.
    pub fn with_device() -> (Self, MockDeviceHarness) {
        let connector = Self::new();
        let harness = connector.add_device();
        (connector, harness)
    }

    /// Prepare another port for a future connect and return its harness.
    pub fn add_device(&self) -> MockDeviceHarness {
        let (port, harness) = new();
        self.ports.lock().push_back(port);
        harness
    }

    /// Every `(address, settings)` a link asked to connect to, in order.
    pub fn connects(&self) -> Vec<(String, SerialSettings)> {
        self.connects.lock().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, address: &str, settings: &SerialSettings) -> io::Result<DynSerial> {
        self.connects
            .lock()
            .push((address.to_string(), settings.clone()));
        match self.ports.lock().pop_front() {
            Some(port) => Ok(Box::new(port)),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no mock device at {address}"),
            )),
        }
    }
}
