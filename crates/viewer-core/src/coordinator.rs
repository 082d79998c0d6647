//! Glue between layout changes and the download queue
//!
//! Every viewport report opens one new batch and requests the target tier of
//! each page in range, in index order, so the latest view always downloads
//! first.

use crate::config::ViewerConfig;
use crate::error::{PageEvent, PageLoadError};
use crate::resource::{PageInfo, PageResource};
use crate::tier::{PageImage, Tier};
use crate::visibility::{columns_for_scale, Bounds, VisibilityScanner, VisibleRange};
use pageview_scheduler::DownloadQueue;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Drives page loading for one document
#[derive(Debug)]
pub struct LoadCoordinator {
    queue: DownloadQueue,
    scanner: VisibilityScanner,
    pages: Vec<PageResource>,
    events: broadcast::Sender<PageEvent>,
    visible: Option<VisibleRange>,
}

impl LoadCoordinator {
    pub fn new(queue: DownloadQueue, pages: Vec<PageInfo>, config: ViewerConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let scanner = VisibilityScanner::from_config(&config);
        let config = Arc::new(config);

        let pages = pages
            .into_iter()
            .enumerate()
            .map(|(index, info)| {
                PageResource::new(
                    index,
                    info,
                    queue.clone(),
                    Arc::clone(&config),
                    events.clone(),
                )
            })
            .collect();

        Self {
            queue,
            scanner,
            pages,
            events,
            visible: None,
        }
    }

    pub fn queue(&self) -> &DownloadQueue {
        &self.queue
    }

    pub fn pages(&self) -> &[PageResource] {
        &self.pages
    }

    pub fn page(&self, index: usize) -> Option<&PageResource> {
        self.pages.get(index)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Range computed by the last viewport report
    pub fn visible_range(&self) -> Option<VisibleRange> {
        self.visible
    }

    /// Page progress, tier and failure notifications
    pub fn subscribe(&self) -> broadcast::Receiver<PageEvent> {
        self.events.subscribe()
    }

    /// Recompute visibility after a layout change.
    ///
    /// `layout` holds one bounds entry per page, sorted by `top`. Opens a new
    /// batch, requests the target tier of every page in range in ascending
    /// index order and marks the rest invisible. Pages past the end of a
    /// short `layout` count as out of range.
    pub fn report_viewport(
        &mut self,
        viewport: Bounds,
        layout: &[Bounds],
        render_scale: f64,
    ) -> Option<VisibleRange> {
        let layout = &layout[..layout.len().min(self.pages.len())];
        let range = self
            .scanner
            .scan(layout, viewport, columns_for_scale(render_scale));
        debug!(?viewport, render_scale, ?range, "viewport reported");

        self.queue.open_new_batch();

        for page in &self.pages {
            if let Some(bounds) = layout.get(page.index()) {
                page.set_bounds(*bounds);
            }

            if !range.is_some_and(|range| range.contains(page.index())) {
                page.set_visible(false);
                continue;
            }

            page.set_visible(true);
            page.set_render_scale(render_scale);
            // resolution failures are published as page events
            let _ = page.ensure_tier(page.target_tier(render_scale));
        }

        self.visible = range;
        range
    }

    /// Wait for the pages of the last viewport report to load.
    ///
    /// Loads already in flight are awaited where they are in the queue; pages
    /// with nothing in flight are requested again.
    pub async fn settle_visible(&self) -> Vec<(usize, Result<PageImage, PageLoadError>)> {
        let Some(range) = self.visible else {
            return Vec::new();
        };

        let mut results = Vec::new();
        for index in range.indices() {
            let Some(page) = self.pages.get(index) else {
                break;
            };
            let tier = page.target_tier(page.render_scale());

            let result = match page.current_load(tier) {
                Some(load) => page.complete(tier, load).await,
                None => page.load(tier).await,
            };
            results.push((index, result));
        }

        results
    }

    /// Load one page ahead of everything pending, for print and export.
    ///
    /// # Errors
    /// Fails when the page does not exist, has no URL at `tier` or above, or
    /// its transfer fails.
    pub async fn ensure_loaded(&self, page: usize, tier: Tier) -> Result<PageImage, PageLoadError> {
        let resource = self.resource(page)?;

        self.queue.open_new_batch();
        resource.load(tier).await
    }

    /// Load a range of pages as one batch and report each page's result.
    pub async fn ensure_range(
        &self,
        pages: RangeInclusive<usize>,
        tier: Tier,
    ) -> Vec<(usize, Result<PageImage, PageLoadError>)> {
        self.queue.open_new_batch();

        // start everything first so the whole range shares the batch
        let started: Vec<_> = pages
            .map(|page| {
                let load = self
                    .resource(page)
                    .and_then(|resource| Ok((resource, resource.ensure_tier(tier)?)));
                (page, load)
            })
            .collect();

        let mut results = Vec::with_capacity(started.len());
        for (page, load) in started {
            let result = match load {
                Ok((resource, load)) => resource.complete(tier, load).await,
                Err(err) => Err(err),
            };
            results.push((page, result));
        }

        results
    }

    /// Queue a background thumbnail load for every page.
    ///
    /// Pages that already hold or are loading any tier are left alone, so a
    /// visible page keeps its larger load. Returns how many pages have a
    /// thumbnail (or better) cached or on its way.
    pub fn queue_thumbnails(&self) -> usize {
        self.queue.open_new_batch();

        self.pages
            .iter()
            .filter(|page| {
                page.current_load(Tier::Thumb).is_some() || page.ensure_tier(Tier::Thumb).is_ok()
            })
            .count()
    }

    fn resource(&self, page: usize) -> Result<&PageResource, PageLoadError> {
        self.pages.get(page).ok_or(PageLoadError::PageOutOfRange {
            page,
            len: self.pages.len(),
        })
    }
}
