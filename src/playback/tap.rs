//! Side-channel analysis of the output signal.
//!
//! Each registered tap runs on its own thread behind a bounded queue. The render path only ever
//! calls `try_send`, so a slow tap loses buffers instead of delaying playback.

use crate::audio::rms;
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;
use tokio::sync::watch;

/// Observer of every buffer at the moment it starts playing.
pub trait AudioTap: Send + 'static {
    fn process(&mut self, samples: &[f32]);
}

#[derive(Default)]
pub(crate) struct TapSet {
    senders: Vec<SyncSender<Arc<[f32]>>>,
}

impl TapSet {
    pub fn register(&mut self, mut tap: Box<dyn AudioTap>, capacity: usize) {
        let (tx, rx) = mpsc::sync_channel::<Arc<[f32]>>(capacity.max(1));
        let spawned = thread::Builder::new()
            .name("playback-tap".to_string())
            .spawn(move || {
                while let Ok(samples) = rx.recv() {
                    tap.process(&samples);
                }
            });

        match spawned {
            Ok(_) => self.senders.push(tx),
            Err(e) => log::error!("Failed to start tap thread: {}", e),
        }
    }

    /// Hand `samples` to every tap. Only the reference count changes on this path.
    pub fn publish(&mut self, samples: &Arc<[f32]>) {
        self.senders
            .retain(|tx| match tx.try_send(Arc::clone(samples)) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    log::trace!("Tap queue full, dropping buffer");
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            });
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }
}

/// Output level meter: smoothed RMS of what the speaker is playing, published on a watch
/// channel for UI metering.
pub struct VolumeMeter {
    level: f32,
    decay: f32,
    tx: watch::Sender<f32>,
}

impl VolumeMeter {
    pub fn new() -> (Self, watch::Receiver<f32>) {
        let (tx, rx) = watch::channel(0.0);
        (
            Self {
                level: 0.0,
                decay: 0.7,
                tx,
            },
            rx,
        )
    }
}

impl AudioTap for VolumeMeter {
    fn process(&mut self, samples: &[f32]) {
        self.level = rms(samples).max(self.level * self.decay).min(1.0);
        // No receivers left is fine; the meter just keeps running.
        let _ = self.tx.send(self.level);
    }
}
