//! Capture-confirmation tone.
//!
//! The tone player owns its output device explicitly instead of going through
//! a process-wide audio handle: the sink is built lazily from a factory on
//! first use and released with `close`.

use crate::error::Result;
use crate::pcm;
use crate::playback::OutputSink;
use tracing::warn;

pub type SinkFactory = Box<dyn Fn() -> Result<Box<dyn OutputSink>> + Send>;

/// Duration of the capture tone in milliseconds.
const TONE_MS: u32 = 140;
/// Capture tone pitch.
const TONE_HZ: f32 = 880.0;

/// Lazily-constructed holder for the tone output device.
pub struct ToneChime {
    factory: SinkFactory,
    sink: Option<Box<dyn OutputSink>>,
}

impl ToneChime {
    pub fn new(factory: SinkFactory) -> Self {
        Self {
            factory,
            sink: None,
        }
    }

    /// Play the short capture-confirmation tone. Best effort: failures are
    /// logged and never interrupt the workflow.
    pub fn play_capture_tone(&mut self) {
        if self.sink.is_none() {
            match (self.factory)() {
                Ok(sink) => self.sink = Some(sink),
                Err(e) => {
                    warn!("tone output unavailable: {e}");
                    return;
                }
            }
        }
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.write(&tone_samples()) {
                warn!("failed to play capture tone: {e}");
            }
        }
    }

    /// Release the output device if it was ever constructed.
    pub fn close(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            sink.close();
        }
    }

    pub fn is_open(&self) -> bool {
        self.sink.is_some()
    }
}

impl Drop for ToneChime {
    fn drop(&mut self) {
        self.close();
    }
}

/// Sine burst with a linear attack/decay envelope so the tone starts and
/// ends without a click.
fn tone_samples() -> Vec<f32> {
    let rate = pcm::OUTPUT_SAMPLE_RATE as f32;
    let total = (rate * TONE_MS as f32 / 1000.0) as usize;
    let edge = (total / 10).max(1);
    (0..total)
        .map(|i| {
            let t = i as f32 / rate;
            let envelope = if i < edge {
                i as f32 / edge as f32
            } else if i >= total - edge {
                (total - i) as f32 / edge as f32
            } else {
                1.0
            };
            0.4 * envelope * (2.0 * std::f32::consts::PI * TONE_HZ * t).sin()
        })
        .collect()
}
