//! `SerialLink`: the caller-facing handle of one instrument connection.
//!
//! A link is a value, not a global. Any number of tasks may share it behind an
//! `Arc` and call [`SerialLink::transmit`] concurrently; every call turns into an
//! [`Envelope`] on the link queue and the worker spawned by [`SerialLink::open`]
//! exchanges them one at a time, in order.
//!
//! # Example
//!
//! ```rust,no_run
//! use instrument_link::{LinkSettings, SerialConnector, SerialLink, TransmitOptions};
//! use std::sync::Arc;
//!
//! # async fn demo() -> instrument_link::LinkResult<()> {
//! let link = SerialLink::new("COM6", LinkSettings::default(), Arc::new(SerialConnector));
//! link.open(None).await?;
//!
//! let temperature = link
//!     .transmit_with("R1", &TransmitOptions::new().with_error_message("ITC read failed"))
//!     .await;
//! println!("{temperature}");
//!
//! link.close().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::LinkSettings;
use crate::envelope::{Awaited, Envelope};
use crate::error::{LinkError, LinkResult};
use crate::queue::{LinkQueue, LinkRequest};
use crate::serial::Connector;
use crate::worker::{LinkWorker, WorkerHandle};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, error, info, instrument, warn};

/// Per-call options for [`SerialLink::transmit_with`].
///
/// `None` for `attempts` or `timeout` means the link's configured default.
#[derive(Debug, Clone)]
pub struct TransmitOptions {
    /// Logged once at `error` level when every attempt has failed
    pub error_message: Option<String>,
    /// Echo each exchange to the diagnostic log
    pub trace: bool,
    /// Exchanges to try before giving up
    pub attempts: Option<u32>,
    /// How long to wait for each response
    pub timeout: Option<Duration>,
}

impl Default for TransmitOptions {
    fn default() -> Self {
        Self {
            error_message: None,
            trace: true,
            attempts: None,
            timeout: None,
        }
    }
}

impl TransmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    /// Don't echo exchanges to the diagnostic log.
    pub fn quiet(self) -> Self {
        self.with_trace(false)
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A serial connection to one instrument.
pub struct SerialLink {
    address: RwLock<String>,
    settings: LinkSettings,
    connector: Arc<dyn Connector>,
    queue: LinkQueue,
    worker: tokio::sync::Mutex<Option<WorkerHandle>>,
    open: AtomicBool,
    runtime: Mutex<Option<Handle>>,
}

impl std::fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialLink")
            .field("address", &*self.address.read())
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl SerialLink {
    /// Create a closed link. Nothing is touched until [`SerialLink::open`].
    pub fn new(
        address: impl Into<String>,
        settings: LinkSettings,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            address: RwLock::new(address.into()),
            settings,
            connector,
            queue: LinkQueue::new(),
            worker: tokio::sync::Mutex::new(None),
            open: AtomicBool::new(false),
            runtime: Mutex::new(None),
        }
    }

    /// Open the transport and start the worker.
    ///
    /// `address` replaces the stored address when given. If the transport cannot
    /// be opened the link stays closed.
    #[instrument(skip(self), err)]
    pub async fn open(&self, address: Option<&str>) -> LinkResult<()> {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return Err(LinkError::AlreadyOpen {
                address: self.address(),
            });
        }

        if let Some(address) = address {
            *self.address.write() = address.to_string();
        }
        let address = self.address();

        let transport = match self.connector.connect(&address, &self.settings.serial).await {
            Ok(transport) => transport,
            Err(source) => {
                warn!(port = %address, error = %source, "Could not open serial port");
                return Err(LinkError::Open { address, source });
            }
        };

        let mut requests = self.queue.try_consumer().ok_or_else(|| LinkError::AlreadyOpen {
            address: address.clone(),
        })?;
        // Left over from before the link was open; their callers were told so.
        let stale = requests.abandon_pending();
        if stale > 0 {
            debug!(count = stale, "Discarded requests queued while closed");
        }

        *self.runtime.lock() = Some(Handle::current());
        *worker = Some(LinkWorker::spawn(
            address.clone(),
            transport,
            self.settings.clone(),
            requests,
        ));
        self.open.store(true, Ordering::Release);

        info!(port = %address, "Link opened");
        Ok(())
    }

    /// Stop the worker and release the transport.
    ///
    /// The exchange in flight completes; queued commands are abandoned and their
    /// callers return at once.
    #[instrument(skip(self), err)]
    pub async fn close(&self) -> LinkResult<()> {
        let mut worker = self.worker.lock().await;
        let handle = worker.take().ok_or(LinkError::NotOpen)?;

        // Signal before clearing `open`: a command that still saw the link open
        // is then drained and abandoned by the worker on its way out.
        handle.signal_stop();
        self.open.store(false, Ordering::Release);
        handle.stop().await;

        // Catch anything pushed between the worker's last drain and now.
        if let Some(mut requests) = self.queue.try_consumer() {
            requests.abandon_pending();
        }

        info!(port = %self.address(), "Link closed");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn address(&self) -> String {
        self.address.read().clone()
    }

    /// Change the address used by the next `open`. Refused while the link is
    /// open or an `open`/`close` is in progress.
    pub fn set_address(&self, address: impl Into<String>) -> LinkResult<()> {
        let busy = || LinkError::AlreadyOpen {
            address: self.address(),
        };
        let worker = self.worker.try_lock().map_err(|_| busy())?;
        if worker.is_some() {
            return Err(busy());
        }
        *self.address.write() = address.into();
        Ok(())
    }

    pub fn settings(&self) -> &LinkSettings {
        &self.settings
    }

    /// Queue `command` for one exchange and return its envelope without waiting.
    pub fn submit(&self, command: impl Into<String>, trace: bool) -> LinkResult<Envelope> {
        if !self.is_open() {
            return Err(LinkError::NotOpen);
        }

        let envelope = Envelope::new(command, trace);
        self.queue.push_envelope(envelope.clone());

        // Lost a race with close(): nobody will drain this envelope.
        if !self.is_open() {
            envelope.abandon();
            return Err(LinkError::NotOpen);
        }
        Ok(envelope)
    }

    /// Send `command` with retries, reporting why it failed.
    ///
    /// A response counts as success when it is non-empty and does not start with
    /// the error indicator. After a failed attempt with attempts remaining, one
    /// stray line is read and discarded before retrying.
    pub async fn try_transmit(
        &self,
        command: &str,
        options: &TransmitOptions,
    ) -> LinkResult<String> {
        let attempts = options
            .attempts
            .unwrap_or(self.settings.protocol.default_attempts);
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.settings.timing.response_timeout());

        let mut last_error = LinkError::NoResponse;
        for attempt in 1..=attempts {
            let envelope = self.submit(command, options.trace)?;

            let outcome = match envelope.wait(timeout).await {
                Awaited::Response(response) => self.classify(response),
                Awaited::TimedOut => Err(LinkError::NoResponse),
                Awaited::Abandoned => return Err(LinkError::Abandoned),
            };

            match outcome {
                Ok(response) => return Ok(response),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    debug!(command, attempt, attempts, error = %e, "Attempt unsuccessful");
                    last_error = e;
                }
            }

            if attempt < attempts {
                self.queue.push(LinkRequest::Resync);
            }
        }

        Err(last_error)
    }

    /// Send `command` with the default options.
    pub async fn transmit(&self, command: &str) -> String {
        self.transmit_with(command, &TransmitOptions::default())
            .await
    }

    /// Send `command`, returning the response or the error indicator (`"?"` by
    /// default) once every attempt has failed.
    pub async fn transmit_with(&self, command: &str, options: &TransmitOptions) -> String {
        match self.try_transmit(command, options).await {
            Ok(response) => response,
            Err(e) => {
                debug!(command, error = %e, "Giving up on command");
                if let Some(message) = &options.error_message {
                    error!(port = %self.address(), "{}", message);
                }
                self.sentinel()
            }
        }
    }

    /// [`SerialLink::transmit_with`] for plain OS threads.
    ///
    /// Runs on the runtime that opened the link.
    ///
    /// # Panics
    ///
    /// Panics if called from within an async context.
    pub fn blocking_transmit(&self, command: &str, options: &TransmitOptions) -> String {
        let runtime = self.runtime.lock().clone();
        match runtime {
            Some(handle) => handle.block_on(self.transmit_with(command, options)),
            None => {
                if let Some(message) = &options.error_message {
                    error!(port = %self.address(), "{}", message);
                }
                self.sentinel()
            }
        }
    }

    /// Empty and indicator-prefixed responses fail; anything else, the
    /// write-error sentinel included, goes back to the caller as is.
    fn classify(&self, response: String) -> LinkResult<String> {
        match response.chars().next() {
            None => Err(LinkError::NoResponse),
            Some(c) if c == self.settings.protocol.error_indicator => {
                Err(LinkError::Rejected(response))
            }
            Some(_) => Ok(response),
        }
    }

    fn sentinel(&self) -> String {
        self.settings.protocol.error_indicator.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SerialSettings;
    use crate::mock_serial::MockConnector;
    use crate::serial::DynSerial;
    use async_trait::async_trait;
    use std::time::Instant;
    use tokio::sync::Notify;
    use tracing_test::traced_test;

    fn fast_settings() -> LinkSettings {
        let mut settings = LinkSettings::default();
        settings.serial.read_timeout_ms = 50;
        settings.timing.pre_write_delay_ms = 0;
        settings.timing.pre_read_delay_ms = 0;
        settings
    }

    fn link_with(connector: MockConnector) -> SerialLink {
        SerialLink::new("COM6", fast_settings(), Arc::new(connector))
    }

    #[tokio::test]
    async fn test_transmit_round_trip() {
        let (connector, harness) = MockConnector::with_device();
        let responder = harness.spawn_responder(|cmd| (cmd == "PING").then(|| "PONG".to_string()));
        let link = link_with(connector);

        link.open(None).await.unwrap();
        assert_eq!(link.transmit("PING").await, "PONG");
        link.close().await.unwrap();

        assert_eq!(responder.await.unwrap(), vec!["PING".to_string()]);
    }

    #[tokio::test]
    async fn test_rejected_then_ok_is_retried() {
        let (connector, harness) = MockConnector::with_device();
        let mut replies = vec!["?INVALID", "OK"].into_iter();
        let responder = harness.spawn_responder(move |_| replies.next().map(str::to_string));
        let link = link_with(connector);

        link.open(None).await.unwrap();
        assert_eq!(link.transmit("SET:1").await, "OK");
        link.close().await.unwrap();

        assert_eq!(responder.await.unwrap(), vec!["SET:1", "SET:1"]);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_exhausted_attempts_return_sentinel() {
        let (connector, harness) = MockConnector::with_device();
        let responder = harness.spawn_responder(|_| Some("?ERR".to_string()));
        let link = link_with(connector);
        link.open(None).await.unwrap();

        let options = TransmitOptions::new().with_error_message("temperature read failed");
        assert_eq!(link.transmit_with("R1", &options).await, "?");
        link.close().await.unwrap();

        // Two exchanges, never more.
        assert_eq!(responder.await.unwrap().len(), 2);
        logs_assert(|lines: &[&str]| {
            match lines
                .iter()
                .filter(|line| line.contains("temperature read failed"))
                .count()
            {
                1 => Ok(()),
                n => Err(format!("expected the error message once, saw it {n} times")),
            }
        });
    }

    #[tokio::test]
    async fn test_try_transmit_reports_rejection() {
        let (connector, harness) = MockConnector::with_device();
        let _responder = harness.spawn_responder(|_| Some("?ERR".to_string()));
        let link = link_with(connector);
        link.open(None).await.unwrap();

        let err = link
            .try_transmit("R1", &TransmitOptions::new().with_attempts(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Rejected(ref r) if r == "?ERR"));
        link.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_attempts_skip_the_exchange() {
        let (connector, harness) = MockConnector::with_device();
        let responder = harness.spawn_responder(|_| Some("OK".to_string()));
        let link = link_with(connector);
        link.open(None).await.unwrap();

        let options = TransmitOptions::new().with_attempts(0);
        assert_eq!(link.transmit_with("R1", &options).await, "?");
        link.close().await.unwrap();

        assert!(responder.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_command_right_after_open_is_exchanged() {
        let (connector, harness) = MockConnector::with_device();
        let responder = harness.spawn_responder(|_| Some("IDN:MOCK".to_string()));
        let link = link_with(connector);

        link.open(None).await.unwrap();
        let response = link
            .try_transmit("*IDN?", &TransmitOptions::new().with_attempts(1))
            .await
            .unwrap();
        assert_eq!(response, "IDN:MOCK");
        link.close().await.unwrap();

        assert_eq!(responder.await.unwrap(), vec!["*IDN?"]);
    }

    #[tokio::test]
    async fn test_silent_device_bounded_by_read_timeout() {
        let (connector, harness) = MockConnector::with_device();
        let responder = harness.spawn_responder(|_| None);
        let link = link_with(connector);
        link.open(None).await.unwrap();

        let start = Instant::now();
        assert_eq!(link.transmit("R1").await, "?");
        let elapsed = start.elapsed();
        link.close().await.unwrap();

        // Two exchanges and one resync, each ending at the 50 ms read timeout.
        assert_eq!(responder.await.unwrap(), vec!["R1", "R1"]);
        assert!(elapsed >= Duration::from_millis(150), "took {elapsed:?}");
        assert!(elapsed < Duration::from_millis(500), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn test_write_failure_returns_sentinel() {
        let (connector, harness) = MockConnector::with_device();
        drop(harness);
        let link = link_with(connector);
        link.open(None).await.unwrap();

        let options = TransmitOptions::new().with_attempts(2);
        assert_eq!(link.transmit_with("SET:X", &options).await, "~");
        link.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_only_indicator_prefix_counts_as_failure() {
        let (connector, harness) = MockConnector::with_device();
        let mut replies = vec!["~", "R+4.2?"].into_iter();
        let responder = harness.spawn_responder(move |_| replies.next().map(str::to_string));
        let link = link_with(connector);
        link.open(None).await.unwrap();

        assert_eq!(link.transmit("READ").await, "~");
        assert_eq!(link.transmit("R1").await, "R+4.2?");
        link.close().await.unwrap();

        assert_eq!(responder.await.unwrap(), vec!["READ", "R1"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_get_their_own_responses() {
        let (connector, harness) = MockConnector::with_device();
        let _responder = harness.spawn_responder(|cmd| Some(format!("ACK:{cmd}")));
        let link = Arc::new(link_with(connector));
        link.open(None).await.unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let link = link.clone();
                tokio::spawn(async move { (i, link.transmit(&format!("CMD{i}")).await) })
            })
            .collect();

        for task in tasks {
            let (i, response) = task.await.unwrap();
            assert_eq!(response, format!("ACK:CMD{i}"));
        }
        link.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_exchanges_follow_submission_order() {
        let (connector, harness) = MockConnector::with_device();
        let responder = harness.spawn_responder(|cmd| Some(cmd.to_lowercase()));
        let link = link_with(connector);
        link.open(None).await.unwrap();

        let envelopes: Vec<_> = (0..5)
            .map(|i| link.submit(format!("C{i}"), false).unwrap())
            .collect();
        for (i, envelope) in envelopes.iter().enumerate() {
            assert_eq!(
                envelope.wait(Duration::from_secs(2)).await,
                Awaited::Response(format!("c{i}"))
            );
        }
        link.close().await.unwrap();

        let expected: Vec<String> = (0..5).map(|i| format!("C{i}")).collect();
        assert_eq!(responder.await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_open_failure_leaves_link_closed() {
        let link = link_with(MockConnector::new());

        let err = link.open(None).await.unwrap_err();
        assert!(matches!(err, LinkError::Open { ref address, .. } if address == "COM6"));
        assert!(!link.is_open());
        assert_eq!(link.transmit("R1").await, "?");
    }

    #[tokio::test]
    async fn test_state_errors() {
        let (connector, _harness) = MockConnector::with_device();
        let link = link_with(connector);

        assert!(matches!(link.close().await, Err(LinkError::NotOpen)));
        assert!(matches!(link.submit("R1", false), Err(LinkError::NotOpen)));

        link.open(None).await.unwrap();
        assert!(matches!(
            link.open(None).await,
            Err(LinkError::AlreadyOpen { .. })
        ));
        assert!(matches!(
            link.set_address("COM7"),
            Err(LinkError::AlreadyOpen { .. })
        ));
        assert_eq!(link.address(), "COM6");

        link.close().await.unwrap();
        assert!(matches!(link.close().await, Err(LinkError::NotOpen)));

        link.set_address("COM7").unwrap();
        assert_eq!(link.address(), "COM7");
    }

    /// Holds `connect` until released, so a test can act mid-open.
    struct GatedConnector {
        inner: MockConnector,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Connector for GatedConnector {
        async fn connect(
            &self,
            address: &str,
            settings: &SerialSettings,
        ) -> std::io::Result<DynSerial> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.connect(address, settings).await
        }
    }

    #[tokio::test]
    async fn test_address_is_fixed_while_open_is_in_progress() {
        let connector = Arc::new(GatedConnector {
            inner: MockConnector::new(),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let _harness = connector.inner.add_device();
        let link = Arc::new(SerialLink::new("COM6", fast_settings(), connector.clone()));

        let opener = {
            let link = link.clone();
            tokio::spawn(async move { link.open(None).await })
        };
        connector.entered.notified().await;

        assert!(matches!(
            link.set_address("COM7"),
            Err(LinkError::AlreadyOpen { .. })
        ));

        connector.release.notify_one();
        opener.await.unwrap().unwrap();
        assert_eq!(link.address(), "COM6");
        assert_eq!(connector.inner.connects()[0].0, "COM6");
        link.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_with_address_and_reopen() {
        let connector = Arc::new(MockConnector::new());
        let first = connector.add_device();
        let second = connector.add_device();
        let _r1 = first.spawn_responder(|_| Some("ONE".to_string()));
        let _r2 = second.spawn_responder(|_| Some("TWO".to_string()));

        let link = SerialLink::new("COM6", fast_settings(), connector.clone());
        link.open(Some("COM9")).await.unwrap();
        assert_eq!(link.address(), "COM9");
        assert_eq!(link.transmit("X").await, "ONE");
        link.close().await.unwrap();

        link.open(None).await.unwrap();
        assert_eq!(link.transmit("X").await, "TWO");
        link.close().await.unwrap();

        let addresses: Vec<_> = connector.connects().into_iter().map(|(a, _)| a).collect();
        assert_eq!(addresses, vec!["COM9", "COM9"]);
    }

    #[tokio::test]
    async fn test_close_abandons_queued_commands() {
        let (connector, mut harness) = MockConnector::with_device();
        let mut settings = fast_settings();
        settings.serial.read_timeout_ms = 300;
        let link = SerialLink::new("COM6", settings, Arc::new(connector));
        link.open(None).await.unwrap();

        let in_flight = link.submit("SLOW", false).unwrap();
        harness.expect_write(b"SLOW\n").await;
        let queued: Vec<_> = (0..3)
            .map(|i| link.submit(format!("Q{i}"), false).unwrap())
            .collect();

        link.close().await.unwrap();

        // The exchange in flight ran to its read timeout.
        assert_eq!(in_flight.response(), Some(""));
        for envelope in &queued {
            assert_eq!(
                envelope.wait(Duration::from_millis(10)).await,
                Awaited::Abandoned
            );
        }
    }

    #[tokio::test]
    async fn test_closing_one_link_leaves_others_running() {
        let (itc_connector, itc) = MockConnector::with_device();
        let (ips_connector, ips) = MockConnector::with_device();
        let _itc = itc.spawn_responder(|_| Some("ITC".to_string()));
        let _ips = ips.spawn_responder(|_| Some("IPS".to_string()));

        let itc = link_with(itc_connector);
        let ips = SerialLink::new("COM7", fast_settings(), Arc::new(ips_connector));
        itc.open(None).await.unwrap();
        ips.open(None).await.unwrap();

        itc.close().await.unwrap();
        assert_eq!(itc.transmit("*IDN?").await, "?");
        assert_eq!(ips.transmit("*IDN?").await, "IPS");
        ips.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_transmit_from_plain_thread() {
        let (connector, harness) = MockConnector::with_device();
        let _responder = harness.spawn_responder(|_| Some("PONG".to_string()));
        let link = Arc::new(link_with(connector));
        link.open(None).await.unwrap();

        let worker_link = link.clone();
        let thread = std::thread::spawn(move || {
            worker_link.blocking_transmit("PING", &TransmitOptions::new().quiet())
        });
        let response = tokio::task::spawn_blocking(move || thread.join().unwrap())
            .await
            .unwrap();

        assert_eq!(response, "PONG");
        link.close().await.unwrap();
    }

    #[tokio::test]
    #[traced_test]
    async fn test_traced_exchange_is_logged() {
        let (connector, harness) = MockConnector::with_device();
        let _responder = harness.spawn_responder(|_| Some("IDN:MERCURY".to_string()));
        let link = link_with(connector);
        link.open(None).await.unwrap();

        link.transmit("*IDN?").await;
        link.transmit_with("R1", &TransmitOptions::new().quiet()).await;
        link.close().await.unwrap();

        assert!(logs_contain("*IDN? IDN:MERCURY"));
        assert!(!logs_contain("R1 IDN:MERCURY"));
    }
}
