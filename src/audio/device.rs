//! cpal plumbing shared by the microphone and speaker adapters.
//!
//! `cpal::Stream` is not `Send` on every platform, so each open stream lives on its own thread
//! and is dropped there when the owning handle goes away.

use cpal::traits::StreamTrait;
use cpal::{SampleFormat, SupportedStreamConfig, SupportedStreamConfigRange};
use std::sync::mpsc;
use std::thread;

pub(crate) struct StreamThread {
    stop_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl StreamThread {
    /// Builds and starts a stream on a dedicated thread. Returns once the stream is playing or
    /// failed to start.
    pub fn spawn<F>(name: &str, build: F) -> Result<Self, String>
    where
        F: FnOnce() -> Result<cpal::Stream, String> + Send + 'static,
    {
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), String>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let thread_name = name.to_string();

        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(format!("Failed to start stream: {}", e)));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                log::debug!("{}: stream running", thread_name);

                // Returns on explicit stop or when the handle is dropped.
                let _ = stop_rx.recv();
                drop(stream);
                log::debug!("{}: stream released", thread_name);
            })
            .map_err(|e| format!("Failed to spawn device thread: {}", e))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop_tx: Some(stop_tx),
                handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err("Device thread exited before the stream started".to_string())
            }
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.join() {
                log::error!("Failed to join device thread: {:?}", e);
            }
        }
    }
}

/// Pick a stream config that runs natively at `sample_rate`, preferring f32 then i16.
/// Falls back to the device default, in which case the caller resamples.
pub(crate) fn choose_config(
    ranges: impl Iterator<Item = SupportedStreamConfigRange>,
    sample_rate: u32,
    fallback: SupportedStreamConfig,
) -> SupportedStreamConfig {
    let mut best: Option<(i32, SupportedStreamConfig)> = None;

    for range in ranges {
        let min_rate = range.min_sample_rate().0;
        let max_rate = range.max_sample_rate().0;
        log::debug!(
            "Available config: {} channels, {}-{} Hz, format: {:?}",
            range.channels(),
            min_rate,
            max_rate,
            range.sample_format()
        );

        if min_rate > sample_rate || max_rate < sample_rate {
            continue;
        }

        let mut score = match range.sample_format() {
            SampleFormat::F32 => 50,
            SampleFormat::I16 => 40,
            SampleFormat::U16 => 10,
            _ => continue,
        };
        // Fewer channels means less work in the callback.
        score -= range.channels() as i32;

        if best.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
            best = Some((score, range.with_sample_rate(cpal::SampleRate(sample_rate))));
        }
    }

    match best {
        Some((_, config)) => {
            log::info!("Selected native config: {:?}", config);
            config
        }
        None => {
            log::info!(
                "No native {} Hz config, using default {:?} with resampling",
                sample_rate,
                fallback
            );
            fallback
        }
    }
}
