use super::{AudioFrame, CaptureConfig, CaptureEvent};
use crate::audio::{f32_to_i16, rms};
use std::time::{Duration, Instant};

/// Turns whatever block sizes the device delivers into fixed-size frames plus a throttled level.
pub struct FrameAssembler {
    frame_samples: usize,
    volume_interval: Duration,
    pending: Vec<i16>,
    last_volume: Option<Instant>,
}

impl FrameAssembler {
    pub fn new(config: &CaptureConfig) -> Self {
        Self {
            frame_samples: config.frame_samples.max(1),
            volume_interval: config.volume_interval,
            pending: Vec::with_capacity(config.frame_samples * 2),
            last_volume: None,
        }
    }

    /// Samples buffered towards the next frame.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Feed one device block of mono samples captured at `now`.
    pub fn push(&mut self, samples: &[f32], now: Instant, mut emit: impl FnMut(CaptureEvent)) {
        if samples.is_empty() {
            return;
        }

        let due = self
            .last_volume
            .map(|last| now.duration_since(last) >= self.volume_interval)
            .unwrap_or(true);
        if due {
            self.last_volume = Some(now);
            emit(CaptureEvent::Volume(rms(samples).min(1.0)));
        }

        self.pending
            .extend(samples.iter().map(|&sample| f32_to_i16(sample)));

        while self.pending.len() >= self.frame_samples {
            let samples: Vec<i16> = self.pending.drain(..self.frame_samples).collect();
            let frame = AudioFrame {
                samples,
                captured_at: now,
            };
            emit(CaptureEvent::Data(frame.encode()));
        }
    }
}
