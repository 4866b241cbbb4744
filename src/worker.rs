//! The link worker: the one task that talks to a link's transport.
//!
//! A worker is spawned by `SerialLink::open` and owns the transport until it exits.
//! It takes requests off the link queue strictly in order and performs one
//! write-then-read exchange at a time, so commands from concurrent callers never
//! interleave on the wire. It is the only code that fills envelope responses.
//!
//! Shutdown is observed between exchanges: an exchange already in flight runs to
//! completion, anything still queued is abandoned, and the transport is dropped
//! with the worker future on every exit path.
//!
//! Input that arrives outside an exchange (a late reply to a command whose read
//! already timed out) is discarded before the next command is written, so it can
//! never be taken for that command's response.

use crate::config::LinkSettings;
use crate::envelope::Envelope;
use crate::logging::TRACE_TARGET;
use crate::queue::{LinkRequest, QueueReceiver};
use crate::serial::DynSerial;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

/// Handle to a running worker, held by the link while it is open.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Ask the worker to stop after its current exchange, without waiting.
    pub fn signal_stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Ask the worker to stop and wait until it has released the transport.
    pub async fn stop(self) {
        self.signal_stop();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Link worker ended abnormally");
        }
    }

    /// Whether the worker task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// State owned by a running worker.
pub struct LinkWorker {
    address: String,
    transport: BufReader<DynSerial>,
    settings: LinkSettings,
    requests: QueueReceiver,
    shutdown: watch::Receiver<bool>,
}

impl LinkWorker {
    /// Spawn a worker that owns `transport` and consumes `requests`.
    pub fn spawn(
        address: impl Into<String>,
        transport: DynSerial,
        settings: LinkSettings,
        requests: QueueReceiver,
    ) -> WorkerHandle {
        let address = address.into();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let span = info_span!("link_worker", port = %address);

        let worker = LinkWorker {
            address,
            transport: BufReader::new(transport),
            settings,
            requests,
            shutdown: shutdown_rx,
        };

        WorkerHandle {
            shutdown: shutdown_tx,
            task: tokio::spawn(worker.run().instrument(span)),
        }
    }

    async fn run(mut self) {
        debug!("Link worker started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let request = tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                request = self.requests.next() => request,
            };

            match request {
                Some(LinkRequest::Exchange(envelope)) => self.exchange(&envelope).await,
                Some(LinkRequest::Resync) => self.resync().await,
                None => break,
            }
        }

        let abandoned = self.requests.abandon_pending();
        if abandoned > 0 {
            debug!(count = abandoned, "Abandoned queued requests on close");
        }
        debug!("Link worker stopped");
    }

    async fn exchange(&mut self, envelope: &Envelope) {
        // Its caller was already told the link is not open.
        if envelope.is_abandoned() {
            debug!(command = envelope.payload(), "Skipping abandoned command");
            return;
        }

        tokio::time::sleep(self.settings.timing.pre_write_delay()).await;
        self.discard_stale_input().await;

        if let Err(e) = self.write_line(envelope.payload()).await {
            warn!(command = envelope.payload(), error = %e, "Error sending command");
            envelope.fill(self.settings.protocol.write_error_sentinel.to_string());
            return;
        }

        tokio::time::sleep(self.settings.timing.pre_read_delay()).await;
        let response = self.read_line().await;

        if envelope.trace() {
            info!(
                target: TRACE_TARGET,
                port = %self.address,
                "{} {}",
                envelope.payload(),
                response
            );
        }
        envelope.fill(response);
    }

    async fn resync(&mut self) {
        let discarded = self.read_line().await;
        if !discarded.is_empty() {
            debug!(line = %discarded, "Discarded stray line");
        }
    }

    /// Drop whatever is already buffered or immediately readable.
    async fn discard_stale_input(&mut self) {
        let mut discarded = 0;
        // A zero timeout still polls the read once, so only ready data is taken.
        while let Ok(Ok(buf)) =
            tokio::time::timeout(Duration::ZERO, self.transport.fill_buf()).await
        {
            if buf.is_empty() {
                break;
            }
            let len = buf.len();
            self.transport.consume(len);
            discarded += len;
        }
        if discarded > 0 {
            debug!(bytes = discarded, "Discarded stale input");
        }
    }

    async fn write_line(&mut self, payload: &str) -> std::io::Result<()> {
        let line = format!("{}{}", payload, self.settings.protocol.line_terminator);
        let port = self.transport.get_mut();
        let write = async {
            port.write_all(line.as_bytes()).await?;
            port.flush().await
        };

        match tokio::time::timeout(self.settings.serial.write_timeout(), write).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "serial write timed out",
            )),
        }
    }

    /// Read one terminated line, bounded by the read timeout. Whatever arrived
    /// before the deadline is returned, terminator stripped; nothing yields "".
    async fn read_line(&mut self) -> String {
        let terminator = self.settings.protocol.line_terminator.as_str();
        let delimiter = terminator.as_bytes().last().copied().unwrap_or(b'\n');
        let mut buf = Vec::new();

        match tokio::time::timeout(
            self.settings.serial.read_timeout(),
            self.transport.read_until(delimiter, &mut buf),
        )
        .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "Error reading response"),
            Err(_) => debug!(partial = buf.len(), "Read timed out"),
        }

        let text = String::from_utf8_lossy(&buf);
        let line = text.strip_suffix(terminator).unwrap_or(&text);
        let line = line.strip_suffix('\r').unwrap_or(line);
        line.to_string()
    }
}
