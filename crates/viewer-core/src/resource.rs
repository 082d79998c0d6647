//! Per-page load state machine
//!
//! A [`PageResource`] picks the tier a page needs, reuses cached or in-flight
//! work where it can and otherwise schedules a transfer on the shared
//! [`DownloadQueue`]. Completed tiers are cached for the life of the resource.

use crate::config::ViewerConfig;
use crate::error::{PageEvent, PageLoadError};
use crate::tier::{PageImage, Tier, TierManifest};
use crate::visibility::Bounds;
use bytes::Bytes;
use pageview_scheduler::{
    DownloadQueue, Progress, RequestHandle, RequestId, RequestStatus, TransferError,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Size assumed for percent reporting when the server sends no length
pub const ASSUMED_TOTAL_BYTES: u64 = 150 * 1024;

// A load superseded by a tier change is re-issued at most this many times.
const MAX_LOAD_ATTEMPTS: usize = 4;

/// Static description of one page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageInfo {
    /// Native pixel width of the screen image
    pub width: f64,
    /// Native pixel height of the screen image
    pub height: f64,
    pub urls: TierManifest,
}

impl PageInfo {
    /// Width the page occupies on screen when laid out in `bounds` at `render_scale`
    ///
    /// The laid-out width follows from the bounds and the aspect ratio; before
    /// any layout the native width stands in.
    pub fn on_screen_width(&self, bounds: Bounds, render_scale: f64) -> f64 {
        let height = bounds.height();

        let layout_width = if height > 0.0 && self.height > 0.0 {
            height * self.width / self.height
        } else {
            self.width
        };
        layout_width * render_scale
    }

    /// Tier needed to draw the page laid out in `bounds` at `render_scale`
    pub fn target_tier(&self, bounds: Bounds, render_scale: f64, config: &ViewerConfig) -> Tier {
        Tier::for_display(
            self.on_screen_width(bounds, render_scale),
            self.width,
            render_scale,
            config,
        )
    }
}

/// What [`PageResource::ensure_tier`] did
#[derive(Debug, Clone)]
pub enum TierLoad {
    /// A cached tier at or above the request was adopted
    Cached(PageImage),
    /// A transfer for `tier` is queued or in flight
    Pending {
        tier: Tier,
        handle: RequestHandle,
        /// The resource's existing load was reused rather than a new one started
        reused: bool,
    },
}

#[derive(Debug)]
struct ActiveLoad {
    tier: Tier,
    handle: RequestHandle,
}

#[derive(Debug)]
struct ResourceState {
    visible: bool,
    render_scale: f64,
    bounds: Bounds,
    cache: BTreeMap<Tier, PageImage>,
    active: Option<ActiveLoad>,
    preloaded: Option<Tier>,
    percent: f32,
}

impl ResourceState {
    /// Cheapest cached image satisfying `tier`
    fn best_at_least(&self, tier: Tier) -> Option<&PageImage> {
        self.cache.range(tier..).next().map(|(_, image)| image)
    }
}

#[derive(Debug)]
struct Shared {
    index: usize,
    info: PageInfo,
    queue: DownloadQueue,
    config: Arc<ViewerConfig>,
    events: broadcast::Sender<PageEvent>,
    state: Mutex<ResourceState>,
}

/// Loader for one page's images
///
/// Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct PageResource {
    shared: Arc<Shared>,
}

impl PageResource {
    pub fn new(
        index: usize,
        info: PageInfo,
        queue: DownloadQueue,
        config: Arc<ViewerConfig>,
        events: broadcast::Sender<PageEvent>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                index,
                info,
                queue,
                config,
                events,
                state: Mutex::new(ResourceState {
                    visible: false,
                    render_scale: 1.0,
                    bounds: Bounds::default(),
                    cache: BTreeMap::new(),
                    active: None,
                    preloaded: None,
                    percent: 0.0,
                }),
            }),
        }
    }

    pub fn index(&self) -> usize {
        self.shared.index
    }

    pub fn info(&self) -> &PageInfo {
        &self.shared.info
    }

    pub fn is_visible(&self) -> bool {
        self.shared.state.lock().unwrap().visible
    }

    /// Toggle visibility. Hiding a page never cancels its in-flight load;
    /// it may scroll back in.
    pub fn set_visible(&self, visible: bool) {
        self.shared.state.lock().unwrap().visible = visible;
    }

    pub fn render_scale(&self) -> f64 {
        self.shared.state.lock().unwrap().render_scale
    }

    pub fn set_render_scale(&self, scale: f64) {
        self.shared.state.lock().unwrap().render_scale = scale;
    }

    pub fn bounds(&self) -> Bounds {
        self.shared.state.lock().unwrap().bounds
    }

    pub fn set_bounds(&self, bounds: Bounds) {
        self.shared.state.lock().unwrap().bounds = bounds;
    }

    /// Width the page occupies on screen at `render_scale`
    pub fn on_screen_width(&self, render_scale: f64) -> f64 {
        self.shared.info.on_screen_width(self.bounds(), render_scale)
    }

    /// Tier needed at `render_scale`
    pub fn target_tier(&self, render_scale: f64) -> Tier {
        self.shared
            .info
            .target_tier(self.bounds(), render_scale, &self.shared.config)
    }

    /// The cached image or in-flight load that would serve `tier`, without
    /// touching the queue
    pub fn current_load(&self, tier: Tier) -> Option<TierLoad> {
        let state = self.shared.state.lock().unwrap();

        if let Some(image) = state.best_at_least(tier) {
            return Some(TierLoad::Cached(image.clone()));
        }
        state
            .active
            .as_ref()
            .filter(|active| active.tier >= tier)
            .map(|active| TierLoad::Pending {
                tier: active.tier,
                handle: active.handle.clone(),
                reused: true,
            })
    }

    /// Make sure `tier` (or better) is cached or on its way.
    ///
    /// # Errors
    /// Returns [`PageLoadError::Resolution`] when the manifest has no URL at
    /// `tier` or above. The failure is also published as a page event.
    pub fn ensure_tier(&self, tier: Tier) -> Result<TierLoad, PageLoadError> {
        let shared = &self.shared;
        let mut state = shared.state.lock().unwrap();

        if let Some(image) = state.best_at_least(tier).cloned() {
            if let Some(active) = state.active.take() {
                debug!(page = shared.index, tier = %active.tier, "cached tier suffices, cancelling load");
                shared.queue.cancel(active.handle.id());
            }
            state.preloaded = Some(image.tier);
            return Ok(TierLoad::Cached(image));
        }

        let Some((resolved, url)) = shared.info.urls.resolve(tier) else {
            drop(state);
            let error = PageLoadError::Resolution {
                page: shared.index,
                tier,
            };
            warn!(page = shared.index, %tier, "no image URL at or above tier");
            shared.emit(PageEvent::Failed {
                page: shared.index,
                tier,
                error: error.clone(),
            });
            return Err(error);
        };

        if let Some(active) = &state.active {
            if active.tier == resolved {
                shared.queue.promote(active.handle.id());
                return Ok(TierLoad::Pending {
                    tier: resolved,
                    handle: active.handle.clone(),
                    reused: true,
                });
            }
        }

        if let Some(stale) = state.active.take() {
            debug!(page = shared.index, from = %stale.tier, to = %resolved, "tier changed, cancelling load");
            shared.queue.cancel(stale.handle.id());
        }

        let handle = shared.queue.enqueue(url);
        debug!(page = shared.index, tier = %resolved, request = %handle.id(), "loading tier");
        state.active = Some(ActiveLoad {
            tier: resolved,
            handle: handle.clone(),
        });
        state.percent = 0.0;
        drop(state);

        shared
            .queue
            .runtime()
            .spawn(Arc::clone(shared).watch(handle.clone(), resolved));

        Ok(TierLoad::Pending {
            tier: resolved,
            handle,
            reused: false,
        })
    }

    /// Resolves once `tier` (or better) is cached.
    pub async fn load(&self, tier: Tier) -> Result<PageImage, PageLoadError> {
        let load = self.ensure_tier(tier)?;
        self.complete(tier, load).await
    }

    /// Waits for a load returned by [`ensure_tier`](Self::ensure_tier).
    ///
    /// A load cancelled because another caller switched the page to a
    /// different tier is re-issued.
    pub async fn complete(&self, tier: Tier, mut load: TierLoad) -> Result<PageImage, PageLoadError> {
        for attempt in 1..=MAX_LOAD_ATTEMPTS {
            let (resolved, mut handle) = match load {
                TierLoad::Cached(image) => return Ok(image),
                TierLoad::Pending { tier, handle, .. } => (tier, handle),
            };

            let outcome = handle.finished().await;
            match self.shared.absorb(handle.id(), resolved, outcome) {
                Err(err) if err.is_cancelled() => {
                    debug!(page = self.shared.index, attempt, "load superseded");
                    load = self.ensure_tier(tier)?;
                }
                result => return result,
            }
        }

        Err(TransferError::Cancelled.into())
    }

    /// Cancel the active load, if any
    pub fn cancel(&self) -> bool {
        let active = self.shared.state.lock().unwrap().active.take();
        match active {
            Some(active) => self.shared.queue.cancel(active.handle.id()),
            None => false,
        }
    }

    /// Cheapest cached image at `tier` or above
    pub fn image(&self, tier: Tier) -> Option<PageImage> {
        self.shared
            .state
            .lock()
            .unwrap()
            .best_at_least(tier)
            .cloned()
    }

    pub fn cached_tiers(&self) -> Vec<Tier> {
        self.shared.state.lock().unwrap().cache.keys().copied().collect()
    }

    /// Tier of the image on display.
    ///
    /// A cache hit records the tier actually cached, which can be more
    /// detailed than the one requested.
    pub fn preloaded(&self) -> Option<Tier> {
        self.shared.state.lock().unwrap().preloaded
    }

    /// Tier of the load in flight
    pub fn active_tier(&self) -> Option<Tier> {
        self.shared
            .state
            .lock()
            .unwrap()
            .active
            .as_ref()
            .map(|active| active.tier)
    }

    pub fn percent_loaded(&self) -> f32 {
        self.shared.state.lock().unwrap().percent
    }
}

impl Shared {
    fn emit(&self, event: PageEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    async fn watch(self: Arc<Self>, mut handle: RequestHandle, tier: Tier) {
        while let Some(status) = handle.next_status().await {
            if let RequestStatus::Active { progress, .. } = status {
                self.progress(handle.id(), tier, progress);
            } else if let Some(outcome) = status.outcome() {
                let _ = self.absorb(handle.id(), tier, outcome);
                break;
            }
        }
    }

    fn progress(&self, id: RequestId, tier: Tier, progress: Progress) {
        let percent = {
            let mut state = self.state.lock().unwrap();
            if !state.active.as_ref().is_some_and(|a| a.handle.id() == id) {
                return;
            }
            state.percent = progress.percent(ASSUMED_TOTAL_BYTES);
            state.percent
        };

        self.emit(PageEvent::Progress {
            page: self.index,
            tier,
            percent,
        });
    }

    /// Apply a finished request. Safe to call more than once per request:
    /// the cache is insert-if-absent and events fire only on the first call.
    fn absorb(
        &self,
        id: RequestId,
        tier: Tier,
        outcome: Result<Bytes, TransferError>,
    ) -> Result<PageImage, PageLoadError> {
        let mut state = self.state.lock().unwrap();
        let was_active = state.active.as_ref().is_some_and(|a| a.handle.id() == id);
        if was_active {
            state.active = None;
        }

        match outcome {
            Ok(bytes) => {
                let mut inserted = false;
                let image = state
                    .cache
                    .entry(tier)
                    .or_insert_with(|| {
                        inserted = true;
                        PageImage::new(tier, bytes)
                    })
                    .clone();
                if was_active {
                    state.preloaded = Some(tier);
                    state.percent = 100.0;
                }
                drop(state);

                if inserted {
                    debug!(page = self.index, %tier, bytes = image.len(), "tier ready");
                    self.emit(PageEvent::TierReady {
                        page: self.index,
                        tier,
                    });
                }
                Ok(image)
            }
            Err(err) => {
                drop(state);
                let error = PageLoadError::from(err);

                if was_active && !error.is_cancelled() {
                    warn!(page = self.index, %tier, error = %error, "page load failed");
                    self.emit(PageEvent::Failed {
                        page: self.index,
                        tier,
                        error: error.clone(),
                    });
                }
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pageview_scheduler::testing::ScriptedTransport;
    use pageview_scheduler::{SchedulerConfig, TransportError, Transports};

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    struct TestEnv {
        queue: DownloadQueue,
        primary: Arc<ScriptedTransport>,
        fallback: Arc<ScriptedTransport>,
        events: broadcast::Sender<PageEvent>,
    }

    impl TestEnv {
        fn new(concurrency: usize) -> Self {
            let primary = ScriptedTransport::new("primary");
            let fallback = ScriptedTransport::passive("fallback");
            let config = SchedulerConfig::default().with_concurrency(concurrency);
            let queue =
                DownloadQueue::new(&config, Transports::new(primary.clone(), fallback.clone()));
            let (events, _) = broadcast::channel(64);

            Self {
                queue,
                primary,
                fallback,
                events,
            }
        }

        fn page(&self, urls: TierManifest) -> PageResource {
            let info = PageInfo {
                width: 1000.0,
                height: 1400.0,
                urls,
            };
            PageResource::new(
                0,
                info,
                self.queue.clone(),
                Arc::new(ViewerConfig::default()),
                self.events.clone(),
            )
        }

        fn full_page(&self) -> PageResource {
            self.page(
                TierManifest::new()
                    .with(Tier::Thumb, "p0/thumb.jpg")
                    .with(Tier::Screen, "p0/screen.jpg")
                    .with(Tier::Full, "p0/full.jpg"),
            )
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn drain(rx: &mut broadcast::Receiver<PageEvent>) -> Vec<PageEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn pending_handle(load: TierLoad) -> RequestHandle {
        match load {
            TierLoad::Pending { handle, .. } => handle,
            TierLoad::Cached(_) => panic!("expected a pending load"),
        }
    }

    #[tokio::test]
    async fn duplicate_requests_share_one_transfer() {
        let env = TestEnv::new(5);
        let page = env.full_page();

        let mut first = pending_handle(page.ensure_tier(Tier::Screen).unwrap());
        let second = page.ensure_tier(Tier::Screen).unwrap();
        assert!(matches!(second, TierLoad::Pending { reused: true, .. }));
        let mut second = pending_handle(second);

        env.primary.respond("p0/screen.jpg", PNG);
        assert_eq!(first.finished().await.unwrap(), second.finished().await.unwrap());
        assert_eq!(env.primary.call_count(), 1);
    }

    #[tokio::test]
    async fn cached_detail_satisfies_lower_tiers() {
        let env = TestEnv::new(5);
        let page = env.full_page();
        env.primary.respond("p0/full.jpg", PNG);

        let full = page.load(Tier::Full).await.unwrap();
        assert_eq!(full.tier, Tier::Full);
        assert_eq!(full.format, Some(image::ImageFormat::Png));

        match page.ensure_tier(Tier::Thumb).unwrap() {
            TierLoad::Cached(image) => assert_eq!(image.tier, Tier::Full),
            other => panic!("expected cache hit, got {other:?}"),
        }
        assert_eq!(env.primary.calls(), vec!["p0/full.jpg"]);
        assert_eq!(page.preloaded(), Some(Tier::Full));
    }

    #[tokio::test]
    async fn lower_cache_does_not_satisfy_higher_tier() {
        let env = TestEnv::new(5);
        let page = env.full_page();
        env.primary.respond_all(PNG);

        page.load(Tier::Thumb).await.unwrap();
        assert!(matches!(
            page.ensure_tier(Tier::Screen).unwrap(),
            TierLoad::Pending {
                tier: Tier::Screen,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn tier_change_cancels_previous_load() {
        let env = TestEnv::new(1);
        let page = env.full_page();

        let mut screen = pending_handle(page.ensure_tier(Tier::Screen).unwrap());
        env.primary.wait_for_calls(1).await;

        let mut full = pending_handle(page.ensure_tier(Tier::Full).unwrap());
        assert_eq!(screen.finished().await, Err(TransferError::Cancelled));
        assert_eq!(page.active_tier(), Some(Tier::Full));

        env.primary.respond("p0/full.jpg", PNG);
        full.finished().await.unwrap();
        settle().await;

        assert_eq!(page.cached_tiers(), vec![Tier::Full]);
        assert_eq!(page.image(Tier::Screen).map(|image| image.tier), Some(Tier::Full));
        assert_eq!(env.primary.calls(), vec!["p0/screen.jpg", "p0/full.jpg"]);
    }

    #[tokio::test]
    async fn switching_back_before_unwind_starts_a_fresh_load() {
        let env = TestEnv::new(5);
        let page = env.full_page();

        let mut first = pending_handle(page.ensure_tier(Tier::Screen).unwrap());
        env.primary.wait_for_calls(1).await;

        page.ensure_tier(Tier::Full).unwrap();
        let mut again = pending_handle(page.ensure_tier(Tier::Screen).unwrap());
        assert_ne!(again.id(), first.id());
        assert_eq!(page.active_tier(), Some(Tier::Screen));

        env.primary.respond("p0/screen.jpg", PNG);
        assert_eq!(first.finished().await, Err(TransferError::Cancelled));
        again.finished().await.unwrap();
        settle().await;

        assert_eq!(page.cached_tiers(), vec![Tier::Screen]);
        assert_eq!(page.active_tier(), None);
        let screen_calls = env
            .primary
            .calls()
            .iter()
            .filter(|url| url.as_str() == "p0/screen.jpg")
            .count();
        assert_eq!(screen_calls, 2);
    }

    #[tokio::test]
    async fn missing_tier_resolves_upward() {
        let env = TestEnv::new(5);
        let page = env.page(TierManifest::new().with(Tier::Full, "p0/full.jpg"));
        env.primary.respond_all(PNG);

        let image = page.load(Tier::Thumb).await.unwrap();
        assert_eq!(image.tier, Tier::Full);
    }

    #[tokio::test]
    async fn resolution_failure_is_reported() {
        let env = TestEnv::new(5);
        let page = env.page(TierManifest::new().with(Tier::Thumb, "p0/thumb.jpg"));
        let mut events = env.events.subscribe();

        let err = page.ensure_tier(Tier::Screen).unwrap_err();
        assert_eq!(
            err,
            PageLoadError::Resolution {
                page: 0,
                tier: Tier::Screen
            }
        );
        assert!(matches!(
            events.try_recv(),
            Ok(PageEvent::Failed {
                error: PageLoadError::Resolution { .. },
                ..
            })
        ));
        assert_eq!(env.primary.call_count(), 0);
    }

    #[tokio::test]
    async fn transport_failure_is_reported_once() {
        let env = TestEnv::new(5);
        let page = env.full_page();
        let mut events = env.events.subscribe();
        env.primary.fail("p0/screen.jpg", TransportError::Http { status: 500 });
        env.fallback.fail("p0/screen.jpg", TransportError::Http { status: 404 });

        let err = page.load(Tier::Screen).await.unwrap_err();
        assert_eq!(
            err,
            PageLoadError::Transfer(TransportError::Http { status: 404 }.into())
        );
        settle().await;

        let failures = drain(&mut events)
            .into_iter()
            .filter(|event| matches!(event, PageEvent::Failed { .. }))
            .count();
        assert_eq!(failures, 1);
        assert_eq!(page.active_tier(), None);
        assert_eq!(env.primary.call_count() + env.fallback.call_count(), 2);
    }

    #[tokio::test]
    async fn tier_ready_fires_once() {
        let env = TestEnv::new(5);
        let page = env.full_page();
        let mut events = env.events.subscribe();
        env.primary.respond_all(PNG);

        page.load(Tier::Screen).await.unwrap();
        page.load(Tier::Screen).await.unwrap();
        settle().await;

        let ready: Vec<_> = drain(&mut events)
            .into_iter()
            .filter(|event| matches!(event, PageEvent::TierReady { .. }))
            .collect();
        assert_eq!(
            ready,
            vec![PageEvent::TierReady {
                page: 0,
                tier: Tier::Screen
            }]
        );
        assert_eq!(page.percent_loaded(), 100.0);
    }

    #[tokio::test]
    async fn progress_estimates_unknown_length() {
        let env = TestEnv::new(5);
        let page = env.full_page();
        let mut events = env.events.subscribe();

        let handle = pending_handle(page.ensure_tier(Tier::Screen).unwrap());
        page.shared.progress(
            handle.id(),
            Tier::Screen,
            Progress {
                loaded: 75 * 1024,
                total: None,
            },
        );

        assert_eq!(page.percent_loaded(), 50.0);
        assert_eq!(
            drain(&mut events).last(),
            Some(&PageEvent::Progress {
                page: 0,
                tier: Tier::Screen,
                percent: 50.0
            })
        );
    }

    #[tokio::test]
    async fn hiding_keeps_load_in_flight() {
        let env = TestEnv::new(5);
        let page = env.full_page();

        page.set_visible(true);
        page.ensure_tier(Tier::Screen).unwrap();
        page.set_visible(false);

        assert!(!page.is_visible());
        assert_eq!(page.active_tier(), Some(Tier::Screen));
        assert_eq!(env.queue.active_count(), 1);

        assert!(page.cancel());
        assert!(!page.cancel());
    }

    #[tokio::test]
    async fn target_tier_tracks_layout_and_scale() {
        let env = TestEnv::new(5);
        let page = env.full_page();

        // laid out at native size
        page.set_bounds(Bounds::new(0.0, 1400.0));
        assert_eq!(page.target_tier(1.0), Tier::Screen);
        assert_eq!(page.target_tier(0.2), Tier::Thumb);
        assert_eq!(page.target_tier(1.5), Tier::Full);

        // laid out at half size
        page.set_bounds(Bounds::new(0.0, 700.0));
        assert_eq!(page.on_screen_width(1.0), 500.0);
        assert_eq!(page.target_tier(1.0), Tier::Screen);
        assert_eq!(page.target_tier(0.4), Tier::Thumb);
        assert_eq!(page.target_tier(2.5), Tier::Full);
    }
}
