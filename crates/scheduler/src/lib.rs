//! PageView Scheduler Library
//!
//! Bounded-concurrency download queue with batched priorities.
//!
//! Requests are grouped into batches. A newly opened batch is served ahead of
//! every older batch, and requests inside one batch start in arrival order, so
//! the most recent visibility change always downloads first without
//! preempting transfers already in flight.
//!
//! Transfers run on the tokio runtime through a primary streaming transport
//! with a plain fallback; a process-wide circuit breaker retires the primary
//! after repeated failures.
//!
//! # Example
//!
//! ```no_run
//! use pageview_scheduler::{DownloadQueue, SchedulerConfig, Transports};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SchedulerConfig::default();
//! let queue = DownloadQueue::new(&config, Transports::http(&config)?);
//!
//! // Background work first
//! let mut thumb = queue.enqueue("https://example.org/p1/thumb.jpg");
//!
//! // The user scrolled: this batch jumps ahead of the thumbnail
//! queue.open_new_batch();
//! let mut page = queue.enqueue("https://example.org/p7/screen.jpg");
//!
//! let bytes = page.finished().await?;
//! println!("page 7: {} bytes", bytes.len());
//!
//! // Still pending, but no longer needed
//! queue.cancel(thumb.id());
//! let _ = thumb.finished().await;
//! # Ok(())
//! # }
//! ```

mod breaker;
mod cancel;
pub mod config;
mod download;
mod error;
pub mod queue;
mod request;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
mod transport;

// Re-export public API
pub use breaker::CircuitBreaker;
pub use cancel::CancellationToken;
pub use config::SchedulerConfig;
pub use download::{DownloadQueue, QueueStats};
pub use error::{ConfigError, TransferError, TransportError};
pub use queue::{Activation, BatchToken, Disposition, Enqueued, PriorityQueue};
pub use request::{
    Progress, ProgressSink, RequestHandle, RequestId, RequestState, RequestStatus, TransportKind,
};
pub use transport::{HttpTransport, PlainTransport, Transport, Transports};
