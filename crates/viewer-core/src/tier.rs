//! Image quality tiers and per-page manifests

use crate::config::ViewerConfig;
use bytes::Bytes;
use image::ImageFormat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Quality level of a page image, ordered by byte cost
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Thumb,
    Half,
    Screen,
    Full,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Thumb, Tier::Half, Tier::Screen, Tier::Full];

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Thumb => "thumb",
            Tier::Half => "half",
            Tier::Screen => "screen",
            Tier::Full => "full",
        }
    }

    /// This tier and every more detailed one, least detailed first
    pub fn and_above(self) -> impl Iterator<Item = Tier> {
        Tier::ALL.into_iter().filter(move |tier| *tier >= self)
    }

    /// Tier needed to draw a page `on_screen_width` pixels wide at `render_scale`.
    ///
    /// Zoomed past `full_min_scale`, or wider on screen than the screen image's
    /// native width, needs the full image. Narrower than `thumb_max_width` gets
    /// by with a thumbnail, narrower than `half_max_width` with the half image.
    pub fn for_display(
        on_screen_width: f64,
        native_width: f64,
        render_scale: f64,
        config: &ViewerConfig,
    ) -> Tier {
        if render_scale > config.full_min_scale || on_screen_width > native_width {
            Tier::Full
        } else if on_screen_width < config.thumb_max_width {
            Tier::Thumb
        } else if on_screen_width < config.half_max_width {
            Tier::Half
        } else {
            Tier::Screen
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "thumb" => Ok(Tier::Thumb),
            "half" => Ok(Tier::Half),
            "screen" => Ok(Tier::Screen),
            "full" => Ok(Tier::Full),
            other => Err(format!("unknown tier '{other}' (expected thumb, half, screen or full)")),
        }
    }
}

/// URLs of one page's images; any tier may be missing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TierManifest(BTreeMap<Tier, String>);

impl TierManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, tier: Tier, url: impl Into<String>) -> Self {
        self.insert(tier, url);
        self
    }

    pub fn insert(&mut self, tier: Tier, url: impl Into<String>) {
        self.0.insert(tier, url.into());
    }

    pub fn get(&self, tier: Tier) -> Option<&str> {
        self.0.get(&tier).map(String::as_str)
    }

    /// First URL at `tier` or above, with the tier it belongs to
    pub fn resolve(&self, tier: Tier) -> Option<(Tier, &str)> {
        tier.and_above()
            .find_map(|candidate| self.get(candidate).map(|url| (candidate, url)))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn tiers(&self) -> impl Iterator<Item = Tier> + '_ {
        self.0.keys().copied()
    }
}

impl FromIterator<(Tier, String)> for TierManifest {
    fn from_iter<I: IntoIterator<Item = (Tier, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Downloaded page image
#[derive(Debug, Clone, PartialEq)]
pub struct PageImage {
    pub tier: Tier,
    pub bytes: Bytes,
    /// Sniffed from the leading bytes; `None` for unrecognized payloads
    pub format: Option<ImageFormat>,
}

impl PageImage {
    pub fn new(tier: Tier, bytes: Bytes) -> Self {
        let format = image::guess_format(&bytes).ok();
        Self {
            tier,
            bytes,
            format,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
