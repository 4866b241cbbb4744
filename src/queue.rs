//! Per-link FIFO queue of outbound requests.
//!
//! Many producers (callers of `transmit`) push into one unbounded `mpsc` channel; at
//! most one consumer (the link worker) drains it. The receiver lives behind an async
//! mutex that the worker holds for its whole lifetime, so a second consumer can
//! never observe the queue while a worker is running.

use crate::envelope::Envelope;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One entry of the link queue.
#[derive(Debug)]
pub enum LinkRequest {
    /// Write the envelope's payload, read one line back, fill the envelope.
    Exchange(Envelope),
    /// Read and discard one stray line to resynchronize after a bad exchange.
    Resync,
}

/// The producer side of a link's queue. Cloning shares the same queue.
#[derive(Debug, Clone)]
pub struct LinkQueue {
    tx: UnboundedSender<LinkRequest>,
    rx: Arc<Mutex<UnboundedReceiver<LinkRequest>>>,
}

impl Default for LinkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Append a request. Requests are consumed in exactly this order.
    pub fn push(&self, request: LinkRequest) {
        // The receiver is owned by `self`, so the channel cannot be closed here.
        let _ = self.tx.send(request);
    }

    /// Append an exchange for `envelope`.
    pub fn push_envelope(&self, envelope: Envelope) {
        self.push(LinkRequest::Exchange(envelope));
    }

    /// Claim the consumer side. Returns `None` while another consumer holds it.
    pub fn try_consumer(&self) -> Option<QueueReceiver> {
        self.rx
            .clone()
            .try_lock_owned()
            .ok()
            .map(|guard| QueueReceiver { guard })
    }
}

/// Exclusive consumer side of a [`LinkQueue`]. Dropping it releases the queue.
#[derive(Debug)]
pub struct QueueReceiver {
    guard: OwnedMutexGuard<UnboundedReceiver<LinkRequest>>,
}

impl QueueReceiver {
    /// Wait for the next request.
    ///
    /// Cancel safe: if the future is dropped before completing, no request is lost.
    pub async fn next(&mut self) -> Option<LinkRequest> {
        self.guard.recv().await
    }

    /// Take the next request if one is already queued.
    pub fn try_next(&mut self) -> Option<LinkRequest> {
        self.guard.try_recv().ok()
    }

    /// Drain everything currently queued, abandoning queued envelopes so their
    /// waiters return immediately. Returns how many requests were dropped.
    pub fn abandon_pending(&mut self) -> usize {
        let mut dropped = 0;
        while let Some(request) = self.try_next() {
            if let LinkRequest::Exchange(envelope) = request {
                envelope.abandon();
            }
            dropped += 1;
        }
        dropped
    }
}
