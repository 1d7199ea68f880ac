//! Gapless playback of PCM buffers that arrive in irregular bursts.

pub mod cpal_output;
pub mod tap;
pub mod timeline;

use crate::audio::pcm16_to_f32;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;

pub use cpal_output::CpalOutput;
pub use tap::{AudioTap, VolumeMeter};
pub use timeline::{lock_timeline, ScheduledSlot, SharedTimeline, Timeline};

#[derive(Error, Debug, Clone)]
pub enum PlaybackError {
    #[error("Output device unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Keeps an opened output device alive; dropping it releases the device.
pub type OutputGuard = Box<dyn Send>;

/// A speaker the scheduler can acquire. While the returned guard lives, the device pulls frames
/// from `timeline` at its own pace.
pub trait OutputDevice: Send + Sync {
    fn open(&self, timeline: SharedTimeline) -> Result<OutputGuard, PlaybackError>;
}

/// What the protocol client needs from the speaker side.
pub trait AudioSink: Send + Sync {
    /// Schedule raw s16le PCM for playback. Never blocks on the device.
    fn enqueue(&self, pcm: &[u8]) -> Result<ScheduledSlot, PlaybackError>;

    /// Discard everything queued but keep the device open. Used on barge-in, where the reply to
    /// the new input follows immediately.
    fn flush(&self);

    /// Discard everything queued and release the device.
    fn stop(&self);
}

#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Sample rate of the PCM the service sends; fixed for the device session
    pub sample_rate: u32,
    /// Delay added before the first buffer after the device went idle
    pub lookahead: Duration,
    /// Per-tap queue depth before buffers are dropped for that tap
    pub tap_queue: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            lookahead: Duration::from_millis(100),
            tap_queue: 32,
        }
    }
}

struct Inner {
    config: PlaybackConfig,
    device: Box<dyn OutputDevice>,
    timeline: SharedTimeline,
    output: Mutex<Option<OutputGuard>>,
}

/// Owns the speaker and the schedule. Cheap to clone; clones share the same device session.
#[derive(Clone)]
pub struct PlaybackScheduler {
    inner: Arc<Inner>,
}

impl PlaybackScheduler {
    pub fn new(config: PlaybackConfig, device: impl OutputDevice + 'static) -> Self {
        let timeline = Arc::new(Mutex::new(Timeline::new(
            config.sample_rate,
            config.lookahead,
        )));
        log::debug!(
            "Playback: scheduler created ({} Hz, look-ahead {:?})",
            config.sample_rate,
            config.lookahead
        );
        Self {
            inner: Arc::new(Inner {
                config,
                device: Box::new(device),
                timeline,
                output: Mutex::new(None),
            }),
        }
    }

    pub fn with_cpal(config: PlaybackConfig) -> Self {
        Self::new(config, CpalOutput::default())
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.inner.config
    }

    /// Attach an analysis stage that sees every buffer as it starts playing.
    pub fn register_tap(&self, tap: impl AudioTap) {
        let capacity = self.inner.config.tap_queue;
        lock_timeline(&self.inner.timeline)
            .taps_mut()
            .register(Box::new(tap), capacity);
    }

    /// Schedule already-normalized samples.
    pub fn enqueue_samples(&self, samples: Vec<f32>) -> Result<ScheduledSlot, PlaybackError> {
        self.ensure_output()?;
        let slot = lock_timeline(&self.inner.timeline).schedule(samples, Instant::now());
        Ok(slot)
    }

    /// Cancel everything queued, release the device and unset the play cursor.
    pub fn stop(&self) {
        // Release the device before touching the timeline: the render callback takes the same lock.
        let released = self.output().take();
        let had_device = released.is_some();
        drop(released);

        let dropped = lock_timeline(&self.inner.timeline).flush();
        if had_device || dropped > 0 {
            log::debug!("Playback: stopped, {} buffers discarded", dropped);
        }
    }

    /// Cancel everything queued and unset the play cursor. The device stays acquired, so the
    /// next buffer is scheduled without reopening it.
    pub fn flush(&self) {
        let dropped = lock_timeline(&self.inner.timeline).flush();
        log::debug!("Playback: flushed, {} buffers discarded", dropped);
    }

    pub fn is_active(&self) -> bool {
        self.output().is_some()
    }

    pub fn queued_buffers(&self) -> usize {
        lock_timeline(&self.inner.timeline).queued()
    }

    fn ensure_output(&self) -> Result<(), PlaybackError> {
        let mut output = self.output();
        if output.is_none() {
            let guard = self.inner.device.open(Arc::clone(&self.inner.timeline))?;
            log::info!("Playback: output device acquired");
            *output = Some(guard);
        }
        Ok(())
    }

    fn output(&self) -> MutexGuard<'_, Option<OutputGuard>> {
        match self.inner.output.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl AudioSink for PlaybackScheduler {
    fn enqueue(&self, pcm: &[u8]) -> Result<ScheduledSlot, PlaybackError> {
        self.enqueue_samples(pcm16_to_f32(pcm))
    }

    fn flush(&self) {
        PlaybackScheduler::flush(self)
    }

    fn stop(&self) {
        PlaybackScheduler::stop(self)
    }
}
