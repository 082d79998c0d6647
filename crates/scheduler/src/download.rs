//! Async download queue
//!
//! Wraps a [`PriorityQueue`] behind one mutex and executes its activations on
//! the tokio runtime. Every transfer task ends in exactly one
//! [`PriorityQueue::finish`] call, which frees the slot and starts whatever is
//! next in batch order.

use crate::breaker::CircuitBreaker;
use crate::config::SchedulerConfig;
use crate::error::{TransferError, TransportError};
use crate::queue::{Activation, BatchToken, PriorityQueue};
use crate::request::{ProgressSink, RequestHandle, RequestId, RequestState, TransportKind};
use crate::transport::Transports;
use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, warn};

/// Snapshot of queue activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct QueueStats {
    /// Requests waiting for a slot
    pub pending: usize,
    /// Transfers in flight
    pub active: usize,
    /// Requests that delivered a payload
    pub completed: u64,
    /// Requests that failed on every permitted transport
    pub failed: u64,
    /// Active requests that were cancelled
    pub cancelled: u64,
    /// Attempts carried by the fallback transport
    pub fallback_attempts: u64,
    /// Whether the primary transport has been retired
    pub breaker_tripped: bool,
}

#[derive(Debug, Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    fallback_attempts: AtomicU64,
}

#[derive(Debug)]
struct Shared {
    queue: Mutex<PriorityQueue>,
    transports: Transports,
    breaker: Arc<CircuitBreaker>,
    timeout: Option<Duration>,
    runtime: Handle,
    counters: Counters,
}

/// Bounded-concurrency download queue
///
/// Cheap to clone; clones share one queue.
#[derive(Debug, Clone)]
pub struct DownloadQueue {
    shared: Arc<Shared>,
}

impl DownloadQueue {
    /// Create a queue with its own circuit breaker
    ///
    /// # Panics
    /// Panics when called outside a tokio runtime.
    pub fn new(config: &SchedulerConfig, transports: Transports) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(config.failure_threshold));
        Self::with_breaker(config, transports, breaker)
    }

    /// Create a queue sharing an existing circuit breaker
    ///
    /// # Panics
    /// Panics when called outside a tokio runtime.
    pub fn with_breaker(
        config: &SchedulerConfig,
        transports: Transports,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self::with_runtime(config, transports, breaker, Handle::current())
    }

    /// Create a queue that spawns its transfers on `runtime`
    pub fn with_runtime(
        config: &SchedulerConfig,
        transports: Transports,
        breaker: Arc<CircuitBreaker>,
        runtime: Handle,
    ) -> Self {
        debug!(
            concurrency = config.concurrency,
            timeout = ?config.transfer_timeout,
            ?transports,
            "creating download queue"
        );

        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(PriorityQueue::new(config.concurrency)),
                transports,
                breaker,
                timeout: config.transfer_timeout,
                runtime,
                counters: Counters::default(),
            }),
        }
    }

    /// Request `url`; a live request for the same URL is joined instead.
    pub fn enqueue(&self, url: &str) -> RequestHandle {
        let (enqueued, activations) = {
            let mut queue = self.shared.queue.lock().unwrap();
            let enqueued = queue.enqueue(url);
            (enqueued, queue.take_activations())
        };

        self.shared.spawn(activations);
        enqueued.handle
    }

    /// Move a queued request into the open batch
    pub fn promote(&self, id: RequestId) -> bool {
        self.shared.queue.lock().unwrap().promote(id)
    }

    /// Start a new batch ahead of all pending work
    pub fn open_new_batch(&self) -> BatchToken {
        self.shared.queue.lock().unwrap().open_new_batch()
    }

    /// Same as [`open_new_batch`](Self::open_new_batch)
    pub fn reset_priority(&self) {
        self.shared.queue.lock().unwrap().reset_priority();
    }

    /// Cancel a request; no-op for unknown or finished requests
    pub fn cancel(&self, id: RequestId) -> bool {
        self.shared.queue.lock().unwrap().cancel(id)
    }

    /// New observer for a live request
    pub fn handle(&self, id: RequestId) -> Option<RequestHandle> {
        self.shared.queue.lock().unwrap().handle(id)
    }

    /// State of a request still tracked by the queue
    pub fn state(&self, id: RequestId) -> Option<RequestState> {
        self.shared.queue.lock().unwrap().state(id)
    }

    /// Transport recorded for a live request
    pub fn transport(&self, id: RequestId) -> Option<TransportKind> {
        self.shared.queue.lock().unwrap().transport(id)
    }

    /// Queued requests in start order
    pub fn queued_order(&self) -> Vec<RequestId> {
        self.shared.queue.lock().unwrap().queued_order()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.queue.lock().unwrap().pending_count()
    }

    pub fn active_count(&self) -> usize {
        self.shared.queue.lock().unwrap().active_count()
    }

    /// Runtime the transfers are spawned on
    pub fn runtime(&self) -> &Handle {
        &self.shared.runtime
    }

    /// Breaker deciding between primary and fallback
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.shared.breaker
    }

    /// Activity snapshot
    pub fn stats(&self) -> QueueStats {
        let (pending, active) = {
            let queue = self.shared.queue.lock().unwrap();
            (queue.pending_count(), queue.active_count())
        };
        let counters = &self.shared.counters;

        QueueStats {
            pending,
            active,
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            cancelled: counters.cancelled.load(Ordering::Relaxed),
            fallback_attempts: counters.fallback_attempts.load(Ordering::Relaxed),
            breaker_tripped: self.shared.breaker.is_tripped(),
        }
    }
}

impl Shared {
    fn spawn(self: &Arc<Self>, activations: Vec<Activation>) {
        for activation in activations {
            let shared = Arc::clone(self);
            self.runtime.spawn(shared.run(activation));
        }
    }

    async fn run(self: Arc<Self>, activation: Activation) {
        let id = activation.id();

        let outcome = tokio::select! {
            biased;
            _ = activation.cancel_token().cancelled() => Err(TransferError::Cancelled),
            result = self.transfer(&activation) => result.map_err(TransferError::from),
        };

        let counter = match &outcome {
            Ok(_) => &self.counters.completed,
            Err(TransferError::Cancelled) => &self.counters.cancelled,
            Err(_) => &self.counters.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let next = {
            let mut queue = self.queue.lock().unwrap();
            queue.finish(id, outcome);
            queue.take_activations()
        };
        self.spawn(next);
    }

    /// Primary attempt (unless retired), then at most one fallback attempt.
    async fn transfer(&self, activation: &Activation) -> Result<Bytes, TransportError> {
        let use_primary =
            self.transports.primary.reports_progress() && !self.breaker.is_tripped();

        if use_primary {
            match self.attempt(activation, TransportKind::Primary).await {
                Ok(bytes) => return Ok(bytes),
                Err(err) => {
                    warn!(
                        request = %activation.id(),
                        url = activation.url(),
                        error = %err,
                        "primary transport failed, retrying with fallback"
                    );
                    self.breaker.record_failure();
                }
            }
        }

        self.counters.fallback_attempts.fetch_add(1, Ordering::Relaxed);
        self.attempt(activation, TransportKind::Fallback)
            .await
            .inspect_err(|err| {
                warn!(
                    request = %activation.id(),
                    url = activation.url(),
                    error = %err,
                    "fallback transport failed"
                );
            })
    }

    async fn attempt(
        &self,
        activation: &Activation,
        kind: TransportKind,
    ) -> Result<Bytes, TransportError> {
        self.queue.lock().unwrap().set_transport(activation.id(), kind);

        let transport = match kind {
            TransportKind::Primary => &self.transports.primary,
            TransportKind::Fallback => &self.transports.fallback,
        };
        debug!(request = %activation.id(), transport = transport.name(), "starting attempt");

        let sink = ProgressSink::new(activation.status().clone(), kind);
        sink.report(0, None);

        let fetch = transport.fetch(activation.url(), &sink);
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, fetch)
                .await
                .map_err(|_| TransportError::Timeout(limit))?,
            None => fetch.await,
        }
    }
}
