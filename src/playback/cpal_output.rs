use super::timeline::{lock_timeline, SharedTimeline};
use super::{OutputDevice, OutputGuard, PlaybackError};
use crate::audio::device::{choose_config, StreamThread};
use crate::audio::RateConverter;
use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, SupportedStreamConfig};
use std::collections::VecDeque;

/// Timeline frames rendered per resampler chunk when the device runs at another rate.
const RESAMPLE_CHUNK: usize = 480;

/// Speaker backed by the default cpal host.
#[derive(Debug, Clone, Default)]
pub struct CpalOutput {
    /// Optional output device name (substring match)
    pub device_name: Option<String>,
}

impl CpalOutput {
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

impl OutputDevice for CpalOutput {
    fn open(&self, timeline: SharedTimeline) -> Result<OutputGuard, PlaybackError> {
        let device_name = self.device_name.clone();
        let session_rate = lock_timeline(&timeline).sample_rate();

        let thread = StreamThread::spawn("playback-output", move || {
            let host = cpal::default_host();
            log::debug!("AudioOutput: Using audio host: {:?}", host.id());
            let device = find_output_device(&host, device_name.as_deref())?;
            log::info!("AudioOutput: Using output device: {:?}", device.name());

            let ranges = device
                .supported_output_configs()
                .map_err(|e| e.to_string())?;
            let fallback = device.default_output_config().map_err(|e| e.to_string())?;
            let config = choose_config(ranges, session_rate, fallback);

            match config.sample_format() {
                SampleFormat::F32 => build_stream::<f32>(&device, &config, session_rate, timeline),
                SampleFormat::I16 => build_stream::<i16>(&device, &config, session_rate, timeline),
                SampleFormat::U16 => build_stream::<u16>(&device, &config, session_rate, timeline),
                other => Err(format!("Unsupported output sample format: {:?}", other)),
            }
        })
        .map_err(PlaybackError::DeviceUnavailable)?;

        Ok(Box::new(thread))
    }
}

fn find_output_device(host: &cpal::Host, name: Option<&str>) -> Result<Device, String> {
    match name {
        Some(wanted) => host
            .output_devices()
            .map_err(|e| format!("Failed to enumerate output devices: {}", e))?
            .find(|d| d.name().map(|n| n.contains(wanted)).unwrap_or(false))
            .ok_or_else(|| format!("Output device '{}' not found", wanted)),
        None => host
            .default_output_device()
            .ok_or_else(|| "No output device found".to_string()),
    }
}

fn build_stream<T>(
    device: &Device,
    config: &SupportedStreamConfig,
    session_rate: u32,
    timeline: SharedTimeline,
) -> Result<cpal::Stream, String>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let stream_config = config.config();
    let channels = stream_config.channels as usize;
    let mut renderer = Renderer::new(session_rate, stream_config.sample_rate.0)?;

    device
        .build_output_stream(
            &stream_config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;
                renderer.render(&timeline, frames);
                // Mono timeline, same sample on every channel.
                for (frame, &value) in data.chunks_mut(channels).zip(renderer.out.iter()) {
                    for channel in frame.iter_mut() {
                        *channel = T::from_sample(value);
                    }
                }
            },
            |err| log::error!("AudioOutput: Stream error: {}", err),
            None,
        )
        .map_err(|e| format!("Failed to build output stream: {}", e))
}

/// Pulls mono frames from the timeline, converting to the device rate when it differs.
///
/// When resampling, the timeline is rendered a whole chunk at a time and converted samples the
/// device did not ask for yet wait in `ready`.
struct Renderer {
    resampler: Option<RateConverter>,
    scratch: Vec<f32>,
    ready: VecDeque<f32>,
    out: Vec<f32>,
}

impl Renderer {
    fn new(session_rate: u32, device_rate: u32) -> Result<Self, String> {
        let resampler = if session_rate == device_rate {
            None
        } else {
            let converter = RateConverter::new(session_rate, device_rate, RESAMPLE_CHUNK)
                .map_err(|e| format!("Failed to create resampler: {}", e))?;
            log::info!(
                "AudioOutput: converting {} Hz timeline to {} Hz device",
                session_rate,
                device_rate
            );
            Some(converter)
        };
        Ok(Self {
            resampler,
            scratch: vec![0.0; RESAMPLE_CHUNK],
            ready: VecDeque::with_capacity(RESAMPLE_CHUNK * 16),
            out: Vec::new(),
        })
    }

    fn render(&mut self, timeline: &SharedTimeline, frames: usize) {
        let Renderer {
            resampler,
            scratch,
            ready,
            out,
        } = self;
        out.clear();

        let Some(resampler) = resampler else {
            out.resize(frames, 0.0);
            lock_timeline(timeline).render(out);
            return;
        };

        while ready.len() < frames {
            scratch.resize(resampler.input_frames_next(), 0.0);
            lock_timeline(timeline).render(scratch);
            if let Err(e) = resampler.push(&scratch[..], |converted| ready.extend(converted)) {
                log::warn!("AudioOutput: resampling failed: {}", e);
                break;
            }
        }

        let available = frames.min(ready.len());
        out.extend(ready.drain(..available));
        // Only reached after a resampler failure.
        out.resize(frames, 0.0);
    }
}
