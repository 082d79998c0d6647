//! Progressive page loading for paginated documents.
//!
//! The view layer reports its viewport to a [`LoadCoordinator`], which works
//! out which pages are on or near screen, picks the image tier each needs and
//! schedules the downloads on a shared
//! [`DownloadQueue`](pageview_scheduler::DownloadQueue). Completed tiers are
//! cached per page and announced as [`PageEvent`]s.
//!
//! ```no_run
//! use pageview_core::{Bounds, LoadCoordinator, PageInfo, Tier, TierManifest, ViewerConfig};
//! use pageview_scheduler::{DownloadQueue, SchedulerConfig, Transports};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SchedulerConfig::default();
//! let queue = DownloadQueue::new(&config, Transports::http(&config)?);
//!
//! let pages = vec![PageInfo {
//!     width: 1000.0,
//!     height: 1400.0,
//!     urls: TierManifest::new().with(Tier::Screen, "https://example.org/p1.jpg"),
//! }];
//! let mut coordinator = LoadCoordinator::new(queue, pages, ViewerConfig::default());
//!
//! let layout = [Bounds::new(0.0, 1400.0)];
//! coordinator.report_viewport(Bounds::new(0.0, 900.0), &layout, 1.0);
//!
//! let image = coordinator.ensure_loaded(0, Tier::Screen).await?;
//! println!("{} bytes, {:?}", image.len(), image.format);
//! # Ok(())
//! # }
//! ```

pub mod config;
mod coordinator;
mod error;
mod resource;
mod tier;
mod visibility;

pub use config::ViewerConfig;
pub use coordinator::LoadCoordinator;
pub use error::{PageEvent, PageLoadError};
pub use resource::{PageInfo, PageResource, TierLoad, ASSUMED_TOTAL_BYTES};
pub use tier::{PageImage, Tier, TierManifest};
pub use visibility::{columns_for_scale, Bounds, VisibilityScanner, VisibleRange};
