//! Camera stand-in backed by screen capture.
//!
//! Grabs frames from the primary monitor through `xcap`. On a machine with a
//! webcam pipeline the same [`FrameSource`] seam takes a real camera instead.

use crate::controller::FrameSource;
use crate::error::{LiveError, Result};
use image::RgbImage;
use tracing::info;
use xcap::Monitor;

pub struct ScreenFrameSource {
    monitor: Option<Monitor>,
}

impl ScreenFrameSource {
    pub fn new() -> Self {
        Self { monitor: None }
    }
}

impl Default for ScreenFrameSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for ScreenFrameSource {
    fn open(&mut self) -> Result<()> {
        let monitors =
            Monitor::all().map_err(|e| LiveError::DeviceUnavailable(e.to_string()))?;
        if monitors.is_empty() {
            return Err(LiveError::DeviceUnavailable("no monitors found".to_string()));
        }
        let monitor = monitors
            .iter()
            .find(|m| m.is_primary().unwrap_or(false))
            .unwrap_or(&monitors[0])
            .clone();
        info!(
            "capturing monitor {} ({}x{})",
            monitor.name().unwrap_or_else(|_| "unknown".to_string()),
            monitor.width().unwrap_or(0),
            monitor.height().unwrap_or(0)
        );
        self.monitor = Some(monitor);
        Ok(())
    }

    fn grab(&mut self) -> Result<RgbImage> {
        let monitor = self
            .monitor
            .as_ref()
            .ok_or_else(|| LiveError::DeviceUnavailable("frame source not open".to_string()))?;
        let rgba = monitor
            .capture_image()
            .map_err(|e| LiveError::DeviceUnavailable(e.to_string()))?;
        Ok(image::DynamicImage::ImageRgba8(rgba).to_rgb8())
    }

    fn close(&mut self) {
        self.monitor = None;
    }

    fn is_open(&self) -> bool {
        self.monitor.is_some()
    }
}
