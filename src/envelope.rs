//! Command envelopes: one outbound command paired with its eventual response.
//!
//! An [`Envelope`] is cheap to clone. The caller keeps one clone and waits on it; the
//! link worker receives the other through the queue and is the only code that fills
//! it. The response slot is single-assignment: the first [`Envelope::fill`] wins,
//! wakes every waiter, and later writes are ignored.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Notify;

/// Await timeout used when a caller passes a zero timeout.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome of waiting for an envelope's response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Awaited {
    /// The worker filled the response.
    Response(String),
    /// The deadline passed first. The worker may still fill the envelope later.
    TimedOut,
    /// The link closed before the command was exchanged.
    Abandoned,
}

#[derive(Debug)]
struct Slot {
    response: OnceLock<String>,
    abandoned: AtomicBool,
    ready: Notify,
}

/// An immutable outbound command with a single-assignment response slot.
#[derive(Debug, Clone)]
pub struct Envelope {
    payload: Arc<str>,
    trace: bool,
    slot: Arc<Slot>,
}

impl Envelope {
    /// Create an envelope for `payload` (without line terminator).
    ///
    /// When `trace` is set, the worker echoes the exchange to the diagnostic log.
    pub fn new(payload: impl Into<String>, trace: bool) -> Self {
        Self {
            payload: Arc::from(payload.into()),
            trace,
            slot: Arc::new(Slot {
                response: OnceLock::new(),
                abandoned: AtomicBool::new(false),
                ready: Notify::new(),
            }),
        }
    }

    /// The command text.
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Whether this exchange is echoed to the diagnostic log.
    pub fn trace(&self) -> bool {
        self.trace
    }

    /// The response, if the worker has filled it.
    pub fn response(&self) -> Option<&str> {
        self.slot.response.get().map(String::as_str)
    }

    /// Whether the link closed before this envelope was exchanged.
    pub fn is_abandoned(&self) -> bool {
        self.slot.abandoned.load(Ordering::Acquire) && self.slot.response.get().is_none()
    }

    /// Wait until the response is set, the envelope is abandoned, or `timeout`
    /// elapses. A zero timeout waits [`DEFAULT_RESPONSE_TIMEOUT`].
    pub async fn wait(&self, timeout: Duration) -> Awaited {
        let timeout = if timeout.is_zero() {
            DEFAULT_RESPONSE_TIMEOUT
        } else {
            timeout
        };

        let wait = async {
            loop {
                let notified = self.slot.ready.notified();
                tokio::pin!(notified);
                // Register before checking so a fill between the check and the
                // await still wakes us.
                notified.as_mut().enable();

                if let Some(response) = self.slot.response.get() {
                    return Awaited::Response(response.clone());
                }
                if self.slot.abandoned.load(Ordering::Acquire) {
                    return Awaited::Abandoned;
                }

                notified.await;
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .unwrap_or(Awaited::TimedOut)
    }

    /// Set the response. Returns `false` if it was already set or abandoned.
    pub(crate) fn fill(&self, response: String) -> bool {
        if self.slot.abandoned.load(Ordering::Acquire) {
            return false;
        }
        let filled = self.slot.response.set(response).is_ok();
        if filled {
            self.slot.ready.notify_waiters();
        }
        filled
    }

    /// Mark the envelope as never going to be exchanged. No-op once filled.
    pub(crate) fn abandon(&self) {
        if self.slot.response.get().is_some() {
            return;
        }
        self.slot.abandoned.store(true, Ordering::Release);
        self.slot.ready.notify_waiters();
    }
}
