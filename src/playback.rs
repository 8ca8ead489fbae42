//! Synthesized-audio playback with gapless scheduling.
//!
//! Chunks arrive as base64 PCM16 at [`pcm::OUTPUT_SAMPLE_RATE`]. Scheduling
//! is sample-accurate rather than timer-based: each segment starts exactly
//! where the previous one ends, so consecutive chunks of a model response
//! play without gaps or overlaps. A dedicated writer thread feeds the output
//! sink; `stop` flushes the queue and ramps the gain down to avoid a click.

use crate::bus::{SharedEventBus, Subscription};
use crate::error::Result;
use crate::pcm;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Monotonic time source for the scheduler, in seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

/// Wall-clock backed [`Clock`].
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

/// Hardware seam for the audio output device. `write` blocks until the device
/// has consumed the samples, which is what paces real playback; the writer
/// thread additionally waits for each segment's scheduled start, so a sink
/// whose `write` returns early still plays gaplessly.
pub trait OutputSink: Send {
    fn write(&mut self, samples: &[f32]) -> Result<()>;

    /// Move output gain toward `target`. Implementations apply a short
    /// per-sample smoothing ramp so a jump to zero never produces an audible
    /// discontinuity.
    fn set_gain(&mut self, target: f32);

    fn close(&mut self);
}

/// Pure back-to-back segment scheduler.
///
/// Invariant: the next available start time only advances; it snaps back to
/// "now" solely through [`Scheduler::reset`] (an explicit stop/interrupt).
#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    next_start: f64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self { next_start: 0.0 }
    }

    /// Schedule a segment of `duration` seconds. Returns its start time:
    /// "now" when nothing is pending, otherwise exactly the end of the
    /// previously scheduled segment.
    pub fn schedule(&mut self, now: f64, duration: f64) -> f64 {
        let start = if self.next_start > now {
            self.next_start
        } else {
            now
        };
        self.next_start = start + duration;
        start
    }

    pub fn reset(&mut self, now: f64) {
        self.next_start = now;
    }

    pub fn next_start(&self) -> f64 {
        self.next_start
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaybackEventKind {
    Level,
    Complete,
}

#[derive(Debug, Clone)]
pub enum PlaybackEvent {
    /// Output energy level of the chunk just enqueued, in [0, 1].
    Level(f32),
    /// The queue drained and nothing further is scheduled.
    Complete,
}

#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Gain ramp interval used by `stop` to avoid an audible click.
    pub stop_ramp: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            stop_ramp: Duration::from_millis(80),
        }
    }
}

enum Cmd {
    Segment {
        samples: Vec<f32>,
        start: f64,
        epoch: u64,
    },
    Fade {
        ramp: Duration,
    },
    Close,
}

/// Decodes, schedules, and plays inbound audio chunks.
pub struct AudioPlayback {
    cfg: PlaybackConfig,
    clock: Arc<dyn Clock>,
    scheduler: Scheduler,
    bus: SharedEventBus<PlaybackEventKind, PlaybackEvent>,
    tx: Option<mpsc::Sender<Cmd>>,
    worker: Option<JoinHandle<()>>,
    /// Segments enqueued but not yet played or discarded.
    queued: Arc<AtomicUsize>,
    /// Bumped by `stop`; the writer discards segments from older epochs.
    epoch: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl AudioPlayback {
    pub fn new(cfg: PlaybackConfig, mut sink: Box<dyn OutputSink>, clock: Arc<dyn Clock>) -> Self {
        let (tx, rx) = mpsc::channel::<Cmd>();
        let bus: SharedEventBus<PlaybackEventKind, PlaybackEvent> = SharedEventBus::new();
        let queued = Arc::new(AtomicUsize::new(0));
        let epoch = Arc::new(AtomicU64::new(0));
        let closed = Arc::new(AtomicBool::new(false));

        let worker_bus = bus.clone();
        let worker_queued = queued.clone();
        let worker_epoch = epoch.clone();
        let worker_closed = closed.clone();
        let worker_clock = clock.clone();
        let worker = std::thread::spawn(move || {
            for cmd in rx.iter() {
                match cmd {
                    Cmd::Segment {
                        samples,
                        start,
                        epoch,
                    } => {
                        if epoch < worker_epoch.load(Ordering::SeqCst) {
                            // Flushed by stop(); discard without playing.
                            worker_queued.fetch_sub(1, Ordering::SeqCst);
                            continue;
                        }
                        // Hold the segment until its scheduled start. A sink
                        // that blocks for the full duration makes this a
                        // no-op; a faster one still plays back-to-back.
                        let now = worker_clock.now();
                        if start > now {
                            std::thread::sleep(Duration::from_secs_f64(start - now));
                        }
                        if let Err(e) = sink.write(&samples) {
                            warn!("output sink write failed: {e}");
                        }
                        if worker_queued.fetch_sub(1, Ordering::SeqCst) == 1 {
                            worker_bus.emit(PlaybackEventKind::Complete, &PlaybackEvent::Complete);
                        }
                    }
                    Cmd::Fade { ramp } => {
                        sink.set_gain(0.0);
                        std::thread::sleep(ramp);
                        sink.set_gain(1.0);
                    }
                    Cmd::Close => break,
                }
            }
            sink.close();
            worker_closed.store(true, Ordering::SeqCst);
            debug!("playback writer exited");
        });

        Self {
            cfg,
            clock,
            scheduler: Scheduler::new(),
            bus,
            tx: Some(tx),
            worker: Some(worker),
            queued,
            epoch,
            closed,
        }
    }

    pub fn on(
        &self,
        kind: PlaybackEventKind,
        callback: Box<dyn Fn(&PlaybackEvent) + Send>,
    ) -> Subscription {
        self.bus.on(kind, callback)
    }

    pub fn off(&self, sub: Subscription) {
        self.bus.off(sub);
    }

    /// Decode a base64 PCM16 chunk and append it to the playback queue.
    ///
    /// Malformed input never crashes the pipeline: the chunk is dropped with
    /// a warning and playback continues with the next one.
    pub fn enqueue(&mut self, data: &str) {
        let samples = match pcm::decode_chunk(data) {
            Ok(samples) => samples,
            Err(e) => {
                warn!("dropping malformed audio chunk: {e}");
                return;
            }
        };
        if samples.is_empty() {
            return;
        }

        let level = pcm::rms(&samples);
        self.bus
            .emit(PlaybackEventKind::Level, &PlaybackEvent::Level(level));

        let duration = samples.len() as f64 / f64::from(pcm::OUTPUT_SAMPLE_RATE);
        let start = self.scheduler.schedule(self.clock.now(), duration);
        debug!(
            "scheduled {} samples at t={start:.3} ({duration:.3}s)",
            samples.len()
        );

        if let Some(tx) = &self.tx {
            self.queued.fetch_add(1, Ordering::SeqCst);
            let cmd = Cmd::Segment {
                samples,
                start,
                epoch: self.epoch.load(Ordering::SeqCst),
            };
            if tx.send(cmd).is_err() {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                warn!("playback writer gone, chunk dropped");
            }
        }
    }

    /// Flush the pending queue and ramp the output to silence, then restore
    /// unity gain after the ramp. The scheduler's start time resets to "now".
    pub fn stop(&mut self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.scheduler.reset(self.clock.now());
        if let Some(tx) = &self.tx {
            let _ = tx.send(Cmd::Fade {
                ramp: self.cfg.stop_ramp,
            });
        }
        info!("playback stopped, queue flushed");
    }

    /// Stop and release the output device.
    pub fn close(&mut self) {
        if self.tx.is_none() {
            return;
        }
        self.stop();
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Cmd::Close);
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("playback writer panicked during shutdown");
            }
        }
    }

    /// True once the output device has been released.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of segments awaiting playback.
    pub fn pending(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn scheduler_is_gapless() {
        let mut s = Scheduler::new();
        let durations = [0.1, 0.25, 0.05, 0.4];

        // First segment with nothing playing starts now.
        let now = 3.0;
        let mut starts = vec![s.schedule(now, durations[0])];
        assert_eq!(starts[0], now);

        // Later segments start exactly where their predecessor ends, even
        // when enqueued while earlier audio is still playing.
        for &d in &durations[1..] {
            starts.push(s.schedule(now, d));
        }
        for k in 1..starts.len() {
            assert!(
                (starts[k] - (starts[k - 1] + durations[k - 1])).abs() < 1e-12,
                "segment {k} not gapless"
            );
        }
    }

    #[test]
    fn scheduler_snaps_forward_after_drain() {
        let mut s = Scheduler::new();
        s.schedule(1.0, 0.5); // plays 1.0..1.5
        // Queue drained long ago; the next chunk starts at the current time,
        // not at the stale end-of-queue mark.
        let start = s.schedule(10.0, 0.5);
        assert_eq!(start, 10.0);
    }

    #[test]
    fn scheduler_reset_only_on_stop() {
        let mut s = Scheduler::new();
        s.schedule(0.0, 1.0);
        assert_eq!(s.next_start(), 1.0);
        s.reset(0.25);
        assert_eq!(s.next_start(), 0.25);
    }

    struct FixedClock(f64);
    impl Clock for FixedClock {
        fn now(&self) -> f64 {
            self.0
        }
    }

    #[derive(Default)]
    struct SinkLog {
        written: Mutex<Vec<Vec<f32>>>,
        write_times: Mutex<Vec<Instant>>,
        gains: Mutex<Vec<f32>>,
        closed: AtomicBool,
        gate: Mutex<Option<mpsc::Receiver<()>>>,
    }

    struct TestSink(Arc<SinkLog>);

    impl OutputSink for TestSink {
        fn write(&mut self, samples: &[f32]) -> Result<()> {
            if let Some(gate) = self.0.gate.lock().unwrap().take() {
                let _ = gate.recv_timeout(Duration::from_secs(2));
            }
            self.0.write_times.lock().unwrap().push(Instant::now());
            self.0.written.lock().unwrap().push(samples.to_vec());
            Ok(())
        }

        fn set_gain(&mut self, target: f32) {
            self.0.gains.lock().unwrap().push(target);
        }

        fn close(&mut self) {
            self.0.closed.store(true, Ordering::SeqCst);
        }
    }

    fn playback_with_sink(ramp_ms: u64) -> (AudioPlayback, Arc<SinkLog>) {
        let log = Arc::new(SinkLog::default());
        let playback = AudioPlayback::new(
            PlaybackConfig {
                stop_ramp: Duration::from_millis(ramp_ms),
            },
            Box::new(TestSink(log.clone())),
            Arc::new(FixedClock(0.0)),
        );
        (playback, log)
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not met in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn plays_chunk_and_signals_complete() {
        let (mut playback, log) = playback_with_sink(1);
        let (ev_tx, ev_rx) = mpsc::channel();
        playback.on(
            PlaybackEventKind::Complete,
            Box::new(move |_| {
                let _ = ev_tx.send(());
            }),
        );
        let (lvl_tx, lvl_rx) = mpsc::channel();
        playback.on(
            PlaybackEventKind::Level,
            Box::new(move |ev| {
                if let PlaybackEvent::Level(l) = ev {
                    let _ = lvl_tx.send(*l);
                }
            }),
        );

        playback.enqueue(&pcm::encode_chunk(&[0.5, -0.5, 0.5, -0.5]));
        let level = lvl_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!((level - 0.5).abs() < 1e-3);
        ev_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(log.written.lock().unwrap().len(), 1);
        assert_eq!(playback.pending(), 0);
    }

    #[test]
    fn writer_honors_the_scheduled_start() {
        let (mut playback, log) = playback_with_sink(1);
        // Two 0.1 s segments against a frozen clock: the sink returns
        // instantly, so only the scheduled start can separate the writes.
        playback.enqueue(&pcm::encode_chunk(&[0.1; 2400]));
        playback.enqueue(&pcm::encode_chunk(&[0.1; 2400]));
        wait_for(|| log.written.lock().unwrap().len() == 2);
        let times = log.write_times.lock().unwrap();
        assert!(times[1] - times[0] >= Duration::from_millis(90));
    }

    #[test]
    fn malformed_chunk_is_dropped_and_playback_continues() {
        let (mut playback, log) = playback_with_sink(1);
        playback.enqueue("@@not-base64@@");
        playback.enqueue(&pcm::encode_chunk(&[0.1, 0.2]));
        wait_for(|| log.written.lock().unwrap().len() == 1);
    }

    #[test]
    fn stop_flushes_queue_and_ramps_gain() {
        let (mut playback, log) = playback_with_sink(1);
        let (gate_tx, gate_rx) = mpsc::channel();
        *log.gate.lock().unwrap() = Some(gate_rx);

        // First segment blocks in the sink; two more pile up behind it.
        playback.enqueue(&pcm::encode_chunk(&[0.1; 8]));
        playback.enqueue(&pcm::encode_chunk(&[0.2; 8]));
        playback.enqueue(&pcm::encode_chunk(&[0.3; 8]));

        // The sink holds the gate mutex while blocked on the gate; wait for
        // that so the first segment is in flight before the flush.
        wait_for(|| log.gate.try_lock().is_err());
        playback.stop();
        gate_tx.send(()).unwrap();

        wait_for(|| playback.pending() == 0);
        // Only the in-flight segment reached the device.
        assert_eq!(log.written.lock().unwrap().len(), 1);
        wait_for(|| log.gains.lock().unwrap().len() >= 2);
        let gains = log.gains.lock().unwrap().clone();
        assert_eq!(gains[0], 0.0);
        assert_eq!(*gains.last().unwrap(), 1.0);
    }

    #[test]
    fn close_releases_sink() {
        let (mut playback, log) = playback_with_sink(1);
        playback.close();
        assert!(playback.is_closed());
        assert!(log.closed.load(Ordering::SeqCst));
        // Close twice is fine.
        playback.close();
    }
}
