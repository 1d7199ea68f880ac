//! Microphone capture: fixed-size PCM frames plus a coarse volume signal.
//!
//! Capture runs on the device's own clock. Frames go out on a broadcast channel, so a subscriber
//! that falls behind (a slow network, say) loses frames instead of stalling the microphone.

pub mod assembler;
pub mod cpal_input;

use crate::audio::i16_to_pcm_bytes;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::{Stream, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

pub use assembler::FrameAssembler;
pub use cpal_input::CpalInput;

#[derive(Error, Debug, Clone)]
pub enum CaptureError {
    #[error("Input device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Audio capture configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    /// Samples per emitted frame
    pub frame_samples: usize,
    /// Minimum spacing between volume events
    pub volume_interval: Duration,
    /// Events buffered per subscriber before the oldest are dropped
    pub channel_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_samples: 512,
            volume_interval: Duration::from_millis(100),
            channel_capacity: 64,
        }
    }
}

impl CaptureConfig {
    /// Mime type the service expects for frames produced with this config.
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(self.frame_samples as f64 / self.sample_rate as f64)
    }
}

/// One fixed-length block of 16-bit samples.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub captured_at: Instant,
}

impl AudioFrame {
    pub fn encode(&self) -> EncodedFrame {
        EncodedFrame {
            base64: STANDARD.encode(i16_to_pcm_bytes(&self.samples)),
            samples: self.samples.len(),
            captured_at: self.captured_at,
        }
    }
}

/// A frame ready for transport: s16le bytes, base64 encoded.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub base64: String,
    pub samples: usize,
    pub captured_at: Instant,
}

#[derive(Debug, Clone)]
pub enum CaptureEvent {
    Data(EncodedFrame),
    /// RMS level in 0..=1
    Volume(f32),
}

/// Mono samples at the requested rate, delivered from the device thread.
pub type SampleCallback = Box<dyn FnMut(&[f32]) + Send>;

/// Keeps an opened input device alive; dropping it releases the device.
pub type InputGuard = Box<dyn Send>;

pub trait InputDevice: Send + Sync {
    fn open(&self, sample_rate: u32, on_samples: SampleCallback) -> Result<InputGuard, CaptureError>;
}

struct Inner {
    config: CaptureConfig,
    device: Box<dyn InputDevice>,
    tx: broadcast::Sender<CaptureEvent>,
    input: Mutex<Option<InputGuard>>,
}

/// Owns the microphone. Cheap to clone; clones share the same device and event channel.
#[derive(Clone)]
pub struct CapturePipeline {
    inner: Arc<Inner>,
}

impl CapturePipeline {
    pub fn new(config: CaptureConfig, device: impl InputDevice + 'static) -> Self {
        let (tx, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                config,
                device: Box::new(device),
                tx,
                input: Mutex::new(None),
            }),
        }
    }

    pub fn with_cpal(config: CaptureConfig) -> Self {
        Self::new(config, CpalInput::default())
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.inner.config
    }

    /// Acquire the microphone and begin emitting events. No-op while already capturing.
    pub fn start(&self) -> Result<(), CaptureError> {
        let mut input = self.input();
        if input.is_some() {
            return Ok(());
        }

        let mut assembler = FrameAssembler::new(&self.inner.config);
        let tx = self.inner.tx.clone();
        let guard = self.inner.device.open(
            self.inner.config.sample_rate,
            Box::new(move |samples: &[f32]| {
                assembler.push(samples, Instant::now(), |event| {
                    // No subscribers is not an error; frames are simply not wanted yet.
                    let _ = tx.send(event);
                });
            }),
        )?;

        log::info!(
            "AudioCapture: started ({} Hz, {} samples/frame)",
            self.inner.config.sample_rate,
            self.inner.config.frame_samples
        );
        *input = Some(guard);
        Ok(())
    }

    /// Release the microphone. Safe to call when not capturing.
    pub fn stop(&self) {
        let released = self.input().take();
        if released.is_some() {
            drop(released);
            log::info!("AudioCapture: stopped");
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.input().is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.inner.tx.subscribe()
    }

    /// Events from now on, across any number of stop/start cycles.
    pub fn events(&self) -> impl Stream<Item = CaptureEvent> + Send + 'static {
        BroadcastStream::new(self.subscribe()).filter_map(|item| async move {
            match item {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    log::warn!("AudioCapture: subscriber lagged, skipped {} events", skipped);
                    None
                }
            }
        })
    }

    fn input(&self) -> MutexGuard<'_, Option<InputGuard>> {
        match self.inner.input.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
