//! Visible range computation
//!
//! Pages are laid out in rows with monotonically increasing `top`, so the
//! pages intersecting any vertical window form one contiguous index range.
//! A binary search finds one of them and a linear scan recovers the rest.

use crate::config::ViewerConfig;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

/// Vertical extent of a page or viewport in layout pixels
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Bounds {
    pub top: f64,
    pub bottom: f64,
}

impl Bounds {
    pub fn new(top: f64, bottom: f64) -> Self {
        Self { top, bottom }
    }

    pub fn height(&self) -> f64 {
        self.bottom - self.top
    }

    pub fn center(&self) -> f64 {
        (self.top + self.bottom) / 2.0
    }

    /// Grow by `margin` in both directions
    pub fn inflate(&self, margin: f64) -> Self {
        Self {
            top: self.top - margin,
            bottom: self.bottom + margin,
        }
    }

    /// Overlap test; touching edges count as intersecting.
    pub fn intersects(&self, other: &Bounds) -> bool {
        !(other.top > self.bottom || other.bottom < self.top)
    }
}

/// Contiguous range of pages inside the inflated viewport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VisibleRange {
    pub first: usize,
    pub last: usize,
    /// First page actually on screen, ignoring the preload margin
    pub first_visible: usize,
}

impl VisibleRange {
    pub fn contains(&self, page: usize) -> bool {
        (self.first..=self.last).contains(&page)
    }

    pub fn indices(&self) -> RangeInclusive<usize> {
        self.first..=self.last
    }
}

/// Page columns shown at a zoom scale: `clamp(floor(1 / scale), 1, 10)`
pub fn columns_for_scale(scale: f64) -> usize {
    if !(scale > 0.0) {
        return 1;
    }
    (1.0 / scale).floor().clamp(1.0, 10.0) as usize
}

/// Stateless visible-range scanner
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisibilityScanner {
    preload_margin: f64,
}

impl VisibilityScanner {
    pub fn new(preload_margin: f64) -> Self {
        Self {
            preload_margin: preload_margin.max(0.0),
        }
    }

    pub fn from_config(config: &ViewerConfig) -> Self {
        Self::new(config.preload_margin)
    }

    pub fn preload_margin(&self) -> f64 {
        self.preload_margin
    }

    /// Pages intersecting `viewport` grown by the preload margin.
    ///
    /// `pages` must be sorted by `top`. `columns` is the number of pages per
    /// row and only affects `first_visible`. Returns `None` when nothing
    /// intersects.
    pub fn scan(&self, pages: &[Bounds], viewport: Bounds, columns: usize) -> Option<VisibleRange> {
        let inflated = viewport.inflate(self.preload_margin);
        let hit = find_any(pages, &inflated)?;

        let mut first = hit;
        while first > 0 && inflated.intersects(&pages[first - 1]) {
            first -= 1;
        }

        let mut last = hit;
        while last + 1 < pages.len() && inflated.intersects(&pages[last + 1]) {
            last += 1;
        }

        // Tighten back to the real viewport and nudge by one row if the
        // candidate's center line falls outside it.
        let columns = columns.max(1);
        let center = pages[first].center();
        let first_visible = if center > viewport.bottom {
            first.saturating_sub(columns)
        } else if center < viewport.top {
            (first + columns).min(pages.len() - 1)
        } else {
            first
        };

        Some(VisibleRange {
            first,
            last,
            first_visible,
        })
    }
}

/// Binary search for any page intersecting `view`
fn find_any(pages: &[Bounds], view: &Bounds) -> Option<usize> {
    let (mut low, mut high) = (0, pages.len());

    while low < high {
        let mid = low + (high - low) / 2;
        let page = &pages[mid];

        if view.top > page.bottom {
            low = mid + 1;
        } else if view.bottom < page.top {
            high = mid;
        } else {
            return Some(mid);
        }
    }

    None
}
