//! Viewer configuration.
//!
//! Geometry and tier-selection thresholds. Keys do not overlap with
//! [`SchedulerConfig`](pageview_scheduler::SchedulerConfig), so both can be
//! read from the same file.

use pageview_scheduler::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Default distance in layout pixels beyond the viewport that still counts as visible.
pub const DEFAULT_PRELOAD_MARGIN: f64 = 200.0;

/// Default on-screen width below which thumbnails are good enough.
pub const DEFAULT_THUMB_MAX_WIDTH: f64 = 250.0;

/// Default on-screen width below which the half-size image is good enough.
pub const DEFAULT_HALF_MAX_WIDTH: f64 = 500.0;

/// Default render scale above which the full tier is always requested.
pub const DEFAULT_FULL_MIN_SCALE: f64 = 2.0;

/// Default capacity of the page event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Configuration for visibility scanning and tier selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewerConfig {
    pub preload_margin: f64,
    pub thumb_max_width: f64,
    pub half_max_width: f64,
    pub full_min_scale: f64,
    /// Events buffered per subscriber before the slowest one starts lagging
    pub event_capacity: usize,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            preload_margin: DEFAULT_PRELOAD_MARGIN,
            thumb_max_width: DEFAULT_THUMB_MAX_WIDTH,
            half_max_width: DEFAULT_HALF_MAX_WIDTH,
            full_min_scale: DEFAULT_FULL_MIN_SCALE,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl ViewerConfig {
    pub fn with_preload_margin(mut self, margin: f64) -> Self {
        self.preload_margin = margin.max(0.0);
        self
    }

    pub fn with_thumb_max_width(mut self, width: f64) -> Self {
        self.thumb_max_width = width;
        self
    }

    pub fn with_half_max_width(mut self, width: f64) -> Self {
        self.half_max_width = width;
        self
    }

    pub fn with_full_min_scale(mut self, scale: f64) -> Self {
        self.full_min_scale = scale;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Loads configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PAGEVIEW_PRELOAD_MARGIN`: preload margin in layout pixels (default: 200)
    /// - `PAGEVIEW_THUMB_MAX_WIDTH`: thumbnail width threshold (default: 250)
    /// - `PAGEVIEW_HALF_MAX_WIDTH`: half-size width threshold (default: 500)
    /// - `PAGEVIEW_FULL_MIN_SCALE`: full-tier scale threshold (default: 2.0)
    /// - `PAGEVIEW_EVENT_CAPACITY`: event channel capacity (default: 256)
    ///
    /// # Errors
    /// Returns an error if any environment variable contains an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for key in [
            "preload_margin",
            "thumb_max_width",
            "half_max_width",
            "full_min_scale",
            "event_capacity",
        ] {
            let var = format!("PAGEVIEW_{}", key.to_ascii_uppercase());
            if let Ok(value) = std::env::var(&var) {
                config.set(key, &value).map_err(|_| ConfigError::InvalidValue(var))?;
            }
        }

        Ok(config)
    }

    /// Loads configuration from a TOML file.
    ///
    /// Expected file format:
    /// ```toml
    /// preload_margin = 200
    /// thumb_max_width = 250
    /// half_max_width = 500
    /// full_min_scale = 2.0
    /// event_capacity = 256
    /// ```
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for line in toml_str.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                config.set(key.trim(), value.trim().trim_matches('"'))?;
            }
        }

        Ok(config)
    }

    /// Saves configuration to a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path.as_ref(), self.to_toml())?;
        Ok(())
    }

    fn to_toml(&self) -> String {
        format!(
            "# PageView viewer configuration\n\
             preload_margin = {}\n\
             thumb_max_width = {}\n\
             half_max_width = {}\n\
             full_min_scale = {}\n\
             event_capacity = {}\n",
            self.preload_margin,
            self.thumb_max_width,
            self.half_max_width,
            self.full_min_scale,
            self.event_capacity
        )
    }

    // Unknown keys belong to other sections of a shared file and are skipped.
    fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue(key.to_string());

        match key {
            "preload_margin" => self.preload_margin = parse_non_negative(value).ok_or_else(invalid)?,
            "thumb_max_width" => {
                self.thumb_max_width = parse_non_negative(value).ok_or_else(invalid)?
            }
            "half_max_width" => {
                self.half_max_width = parse_non_negative(value).ok_or_else(invalid)?
            }
            "full_min_scale" => self.full_min_scale = parse_non_negative(value).ok_or_else(invalid)?,
            "event_capacity" => {
                self.event_capacity = value
                    .parse::<usize>()
                    .ok()
                    .filter(|capacity| *capacity > 0)
                    .ok_or_else(invalid)?
            }
            _ => {}
        }

        Ok(())
    }
}

fn parse_non_negative(value: &str) -> Option<f64> {
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
}
