//! Frame-to-frame stability detection.
//!
//! An object counts as "framed" when consecutive camera frames stop changing:
//! frames are downsampled to a small RGB grid and compared by mean absolute
//! pixel difference. Requiring N consecutive quiet readings debounces
//! single-frame noise. Both the difference threshold and the debounce count
//! are empirically tuned and therefore configurable, not contractual.

use image::imageops::{self, FilterType};
use image::RgbImage;

#[derive(Debug, Clone)]
pub struct StabilityConfig {
    /// Mean absolute per-channel difference (0..255 scale) below which two
    /// frames count as "the same scene".
    pub diff_threshold: f32,
    /// Consecutive quiet frames required before firing.
    pub required_ticks: u32,
    /// Downsample grid edge length in pixels.
    pub grid: u32,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            diff_threshold: 6.0,
            required_ticks: 3,
            grid: 32,
        }
    }
}

/// Debounced pixel-difference detector. Feed it one frame per scan tick;
/// it fires once the scene has held still for the configured streak.
pub struct StabilityDetector {
    cfg: StabilityConfig,
    prev: Option<Vec<u8>>,
    streak: u32,
}

impl StabilityDetector {
    pub fn new(cfg: StabilityConfig) -> Self {
        Self {
            cfg,
            prev: None,
            streak: 0,
        }
    }

    /// Observe the next frame. Returns `true` when the stability debounce
    /// fires, i.e. the streak reaches the configured tick count.
    pub fn observe(&mut self, frame: &RgbImage) -> bool {
        let sample = downsample(frame, self.cfg.grid);
        let fired = match &self.prev {
            Some(prev) if prev.len() == sample.len() => {
                if mean_abs_diff(prev, &sample) < self.cfg.diff_threshold {
                    self.streak += 1;
                    self.streak >= self.cfg.required_ticks
                } else {
                    self.streak = 0;
                    false
                }
            }
            // First frame (or a resolution change) gives no comparison.
            _ => {
                self.streak = 0;
                false
            }
        };
        self.prev = Some(sample);
        fired
    }

    pub fn reset(&mut self) {
        self.prev = None;
        self.streak = 0;
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }
}

fn downsample(frame: &RgbImage, grid: u32) -> Vec<u8> {
    imageops::resize(frame, grid, grid, FilterType::Triangle).into_raw()
}

fn mean_abs_diff(a: &[u8], b: &[u8]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    if a.is_empty() {
        return 0.0;
    }
    let total: u64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| u64::from(x.abs_diff(*y)))
        .sum();
    total as f32 / a.len() as f32
}
