//! Microphone capture pipeline.
//!
//! A dedicated OS thread pulls fixed-size float buffers from a [`MicSource`],
//! computes the RMS level, quantizes to PCM16, and emits base64 chunks ready
//! for the session's outbound multiplexer. Audio runs on a real thread, not a
//! tokio task, so a slow async executor can never starve the device.

use crate::bus::{SharedEventBus, Subscription};
use crate::error::Result;
use crate::media::MediaChunk;
use crate::pcm;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Hardware seam for microphone input. Implementations deliver mono float
/// samples in [-1, 1] at [`pcm::INPUT_SAMPLE_RATE`].
pub trait MicSource: Send {
    /// Acquire the device. Fails with `PermissionDenied` or
    /// `DeviceUnavailable` when the platform refuses.
    fn open(&mut self) -> Result<()>;

    /// Fill `buf` with captured samples, blocking until a full buffer is
    /// available. Returns the number of samples written.
    fn read(&mut self, buf: &mut [f32]) -> Result<usize>;

    /// Release the device.
    fn close(&mut self);
}

/// Factory invoked on each `start()` so a capture instance can be restarted
/// across workflow runs.
pub type MicFactory = Box<dyn Fn() -> Box<dyn MicSource> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureEventKind {
    Chunk,
}

#[derive(Debug, Clone)]
pub enum CaptureEvent {
    /// One wire-ready audio chunk with its input energy level in [0, 1].
    Chunk { chunk: MediaChunk, level: f32 },
}

impl CaptureEvent {
    pub fn kind(&self) -> CaptureEventKind {
        match self {
            Self::Chunk { .. } => CaptureEventKind::Chunk,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Samples per emitted chunk. 1600 samples is 100 ms at 16 kHz, the
    /// cadence the remote endpoint is comfortable with.
    pub buffer_samples: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            buffer_samples: 1600,
        }
    }
}

/// Owns the capture thread and the liveness flag guarding chunk emission.
pub struct AudioCapture {
    cfg: CaptureConfig,
    factory: MicFactory,
    bus: SharedEventBus<CaptureEventKind, CaptureEvent>,
    live: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl AudioCapture {
    pub fn new(cfg: CaptureConfig, factory: MicFactory) -> Self {
        Self {
            cfg,
            factory,
            bus: SharedEventBus::new(),
            live: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Subscribe to emitted chunks.
    pub fn on_chunk(&self, callback: Box<dyn Fn(&CaptureEvent) + Send>) -> Subscription {
        self.bus.on(CaptureEventKind::Chunk, callback)
    }

    pub fn off(&self, sub: Subscription) {
        self.bus.off(sub);
    }

    /// True while the capture thread is producing chunks.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Acquire the microphone and begin producing chunks. Device acquisition
    /// errors surface to the caller; a second `start` while live is a no-op.
    pub fn start(&mut self) -> Result<()> {
        if self.is_live() {
            return Ok(());
        }

        let mut source = (self.factory)();
        source.open()?;

        self.live.store(true, Ordering::SeqCst);
        let live = self.live.clone();
        let bus = self.bus.clone();
        let buffer_samples = self.cfg.buffer_samples;

        let handle = std::thread::spawn(move || {
            let mut buf = vec![0.0f32; buffer_samples];
            loop {
                if !live.load(Ordering::SeqCst) {
                    break;
                }
                let n = match source.read(&mut buf) {
                    Ok(n) => n,
                    Err(e) => {
                        warn!("microphone read failed, stopping capture: {e}");
                        break;
                    }
                };
                if n == 0 {
                    continue;
                }
                // stop() may have raced with the blocking read; never emit
                // after the liveness flag drops.
                if !live.load(Ordering::SeqCst) {
                    break;
                }
                let samples = &buf[..n];
                let level = pcm::rms(samples);
                let chunk = MediaChunk::pcm_audio(pcm::encode_chunk(samples));
                bus.emit(
                    CaptureEventKind::Chunk,
                    &CaptureEvent::Chunk { chunk, level },
                );
            }
            source.close();
            live.store(false, Ordering::SeqCst);
            debug!("capture thread exited");
        });

        self.worker = Some(handle);
        info!("audio capture started ({buffer_samples} samples per chunk)");
        Ok(())
    }

    /// Release the microphone and halt chunk production. Idempotent: calling
    /// `stop` when not started is a no-op.
    pub fn stop(&mut self) {
        self.live.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("capture thread panicked during shutdown");
            }
            info!("audio capture stopped");
        }
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
