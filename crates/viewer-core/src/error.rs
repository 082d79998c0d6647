//! Error types for page loading

use crate::tier::Tier;
use pageview_scheduler::TransferError;
use thiserror::Error;

/// Why a page image could not be provided
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PageLoadError {
    /// The transfer failed on every permitted transport, or was cancelled
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// The page has no URL for the requested tier or any tier above it
    #[error("Page {page} has no image at tier {tier} or above")]
    Resolution { page: usize, tier: Tier },

    /// Index past the end of the document
    #[error("Page {page} out of range (document has {len} pages)")]
    PageOutOfRange { page: usize, len: usize },
}

impl PageLoadError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PageLoadError::Transfer(err) if err.is_cancelled())
    }
}

/// Notification published to the view layer
#[derive(Debug, Clone, PartialEq)]
pub enum PageEvent {
    /// Bytes arrived for the page's active load
    Progress { page: usize, tier: Tier, percent: f32 },
    /// A tier was added to the page's cache
    TierReady { page: usize, tier: Tier },
    /// The page's active load failed; it is not retried automatically
    Failed {
        page: usize,
        tier: Tier,
        error: PageLoadError,
    },
}

impl PageEvent {
    pub fn page(&self) -> usize {
        match self {
            PageEvent::Progress { page, .. }
            | PageEvent::TierReady { page, .. }
            | PageEvent::Failed { page, .. } => *page,
        }
    }
}
