//! Request model shared by the queue and its observers

use crate::error::TransferError;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Stable identifier of a request in the queue arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub(crate) u64);

impl RequestId {
    /// Raw numeric id
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    /// Waiting for a concurrency slot
    Queued,
    /// Transfer in flight
    Active,
    /// Payload received
    Complete,
    /// Every permitted attempt failed
    Failed,
    /// Cancelled by a caller
    Cancelled,
}

impl RequestState {
    /// Terminal states never change again
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Complete | RequestState::Failed | RequestState::Cancelled
        )
    }
}

/// Which transport carries a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Binary fetch with progress reporting
    Primary,
    /// Passive fetch without progress
    Fallback,
}

/// Bytes received so far
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub loaded: u64,
    /// Declared size, when the server sent one
    pub total: Option<u64>,
}

impl Progress {
    /// Percent complete, estimating the size as `assumed_total` when unknown.
    pub fn percent(&self, assumed_total: u64) -> f32 {
        let total = self.total.filter(|t| *t > 0).unwrap_or(assumed_total.max(1));
        (self.loaded as f32 / total as f32 * 100.0).min(100.0)
    }
}

/// Status published to request observers
#[derive(Debug, Clone)]
pub enum RequestStatus {
    Queued,
    Active {
        transport: TransportKind,
        progress: Progress,
    },
    Complete(Bytes),
    Failed(TransferError),
    Cancelled,
}

impl RequestStatus {
    /// State this status corresponds to
    pub fn state(&self) -> RequestState {
        match self {
            RequestStatus::Queued => RequestState::Queued,
            RequestStatus::Active { .. } => RequestState::Active,
            RequestStatus::Complete(_) => RequestState::Complete,
            RequestStatus::Failed(_) => RequestState::Failed,
            RequestStatus::Cancelled => RequestState::Cancelled,
        }
    }

    /// Final outcome, if this status is terminal
    pub fn outcome(&self) -> Option<Result<Bytes, TransferError>> {
        match self {
            RequestStatus::Complete(bytes) => Some(Ok(bytes.clone())),
            RequestStatus::Failed(err) => Some(Err(err.clone())),
            RequestStatus::Cancelled => Some(Err(TransferError::Cancelled)),
            RequestStatus::Queued | RequestStatus::Active { .. } => None,
        }
    }
}

pub(crate) type StatusSender = Arc<watch::Sender<RequestStatus>>;

/// Observer handle for one request
///
/// Any number of handles can watch the same request; duplicate enqueues of a
/// URL hand out handles to the request already in flight.
#[derive(Debug, Clone)]
pub struct RequestHandle {
    id: RequestId,
    url: Arc<str>,
    rx: watch::Receiver<RequestStatus>,
    primed: bool,
}

impl RequestHandle {
    pub(crate) fn new(id: RequestId, url: Arc<str>, rx: watch::Receiver<RequestStatus>) -> Self {
        Self {
            id,
            url,
            rx,
            primed: false,
        }
    }

    /// Request id
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Requested URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Latest published status
    pub fn status(&self) -> RequestStatus {
        self.rx.borrow().clone()
    }

    /// Yields the current status first, then every later change.
    ///
    /// Intermediate progress updates may be coalesced. Returns `None` once the
    /// request is gone and its last status has been observed.
    pub async fn next_status(&mut self) -> Option<RequestStatus> {
        if !self.primed {
            self.primed = true;
            return Some(self.rx.borrow_and_update().clone());
        }

        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Waits for the terminal status.
    pub async fn finished(&mut self) -> Result<Bytes, TransferError> {
        loop {
            let status = self.rx.borrow_and_update().clone();
            if let Some(outcome) = status.outcome() {
                return outcome;
            }

            if self.rx.changed().await.is_err() {
                // Publisher gone; without a terminal status the runtime shut down.
                return self
                    .rx
                    .borrow()
                    .outcome()
                    .unwrap_or(Err(TransferError::Cancelled));
            }
        }
    }
}

/// Progress reporter handed to a transport for one attempt
#[derive(Debug, Clone)]
pub struct ProgressSink {
    status: StatusSender,
    transport: TransportKind,
}

impl ProgressSink {
    pub(crate) fn new(status: StatusSender, transport: TransportKind) -> Self {
        Self { status, transport }
    }

    /// A sink connected to nothing, for driving a transport directly.
    pub fn detached() -> Self {
        let (tx, _rx) = watch::channel(RequestStatus::Queued);
        Self::new(Arc::new(tx), TransportKind::Primary)
    }

    /// Publishes the bytes received so far
    pub fn report(&self, loaded: u64, total: Option<u64>) {
        self.status.send_replace(RequestStatus::Active {
            transport: self.transport,
            progress: Progress { loaded, total },
        });
    }
}
