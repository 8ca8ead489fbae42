//! PulseAudio devices via the simple blocking API.
//!
//! Both directions run on the capture/playback worker threads, so blocking
//! reads and writes are exactly what is wanted here.

use crate::capture::MicSource;
use crate::error::{LiveError, Result};
use crate::pcm;
use crate::playback::OutputSink;
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use tracing::{info, warn};

fn spec(rate: u32) -> Spec {
    Spec {
        format: Format::S16le,
        channels: 1,
        rate,
    }
}

fn device_err(e: libpulse_binding::error::PAErr) -> LiveError {
    LiveError::DeviceUnavailable(e.to_string())
}

/// Default microphone as a [`MicSource`]. S16le mono at the input rate.
pub struct PulseMicSource {
    app_name: String,
    simple: Option<Simple>,
}

impl PulseMicSource {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            simple: None,
        }
    }
}

impl MicSource for PulseMicSource {
    fn open(&mut self) -> Result<()> {
        let simple = Simple::new(
            None,
            &self.app_name,
            Direction::Record,
            None,
            "capture",
            &spec(pcm::INPUT_SAMPLE_RATE),
            None,
            None,
        )
        .map_err(device_err)?;
        self.simple = Some(simple);
        info!("pulse microphone opened at {} Hz", pcm::INPUT_SAMPLE_RATE);
        Ok(())
    }

    fn read(&mut self, buf: &mut [f32]) -> Result<usize> {
        let simple = self
            .simple
            .as_ref()
            .ok_or_else(|| LiveError::DeviceUnavailable("microphone not open".to_string()))?;
        let mut bytes = vec![0u8; buf.len() * 2];
        simple.read(&mut bytes).map_err(device_err)?;
        for (i, pair) in bytes.chunks_exact(2).enumerate() {
            let sample = i16::from_le_bytes([pair[0], pair[1]]);
            buf[i] = f32::from(sample) / 32768.0;
        }
        Ok(buf.len())
    }

    fn close(&mut self) {
        self.simple = None;
    }
}

/// Default playback device as an [`OutputSink`] at the output rate.
///
/// Gain changes are smoothed across the samples of the next write so a jump
/// to zero never lands as a step in the analog output.
pub struct PulseOutput {
    simple: Simple,
    gain: f32,
    target_gain: f32,
}

/// Samples over which a gain change is spread.
const GAIN_RAMP_SAMPLES: usize = 240;

impl PulseOutput {
    pub fn new(app_name: &str) -> Result<Self> {
        let simple = Simple::new(
            None,
            app_name,
            Direction::Playback,
            None,
            "playback",
            &spec(pcm::OUTPUT_SAMPLE_RATE),
            None,
            None,
        )
        .map_err(device_err)?;
        info!("pulse output opened at {} Hz", pcm::OUTPUT_SAMPLE_RATE);
        Ok(Self {
            simple,
            gain: 1.0,
            target_gain: 1.0,
        })
    }
}

impl OutputSink for PulseOutput {
    fn write(&mut self, samples: &[f32]) -> Result<()> {
        let step = (self.target_gain - self.gain) / GAIN_RAMP_SAMPLES as f32;
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for &sample in samples {
            if (self.target_gain - self.gain).abs() > step.abs() {
                self.gain += step;
            } else {
                self.gain = self.target_gain;
            }
            let v = pcm::quantize(sample * self.gain);
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        self.simple.write(&bytes).map_err(device_err)
    }

    fn set_gain(&mut self, target: f32) {
        self.target_gain = target.clamp(0.0, 1.0);
    }

    fn close(&mut self) {
        if let Err(e) = self.simple.drain() {
            warn!("pulse drain failed: {e}");
        }
    }
}
