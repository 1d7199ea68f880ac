use super::{CaptureError, InputDevice, InputGuard, SampleCallback};
use crate::audio::device::{choose_config, StreamThread};
use crate::audio::{ChannelExtractor, RateConverter};
use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, SupportedStreamConfig};

/// Microphone backed by the default cpal host.
#[derive(Debug, Clone, Default)]
pub struct CpalInput {
    /// Input device to capture from (substring match, None = default device)
    pub device_name: Option<String>,
    /// Channel to capture (0-based index)
    pub channel: usize,
}

impl CpalInput {
    pub fn new(device_name: Option<String>) -> Self {
        Self {
            device_name,
            channel: 0,
        }
    }
}

impl InputDevice for CpalInput {
    fn open(&self, sample_rate: u32, on_samples: SampleCallback) -> Result<InputGuard, CaptureError> {
        let device_name = self.device_name.clone();
        let channel = self.channel;

        let thread = StreamThread::spawn("capture-input", move || {
            let host = cpal::default_host();
            let device = find_input_device(&host, device_name.as_deref())?;
            log::info!("AudioCapture: Using input device: {:?}", device.name());

            let ranges = device
                .supported_input_configs()
                .map_err(|e| e.to_string())?;
            let fallback = device.default_input_config().map_err(|e| e.to_string())?;
            let config = choose_config(ranges, sample_rate, fallback);

            let extractor = ChannelExtractor::new(channel, config.channels() as usize)
                .map_err(|e| e.to_string())?;
            let block = BlockConverter::new(extractor, config.sample_rate().0, sample_rate, on_samples)?;

            match config.sample_format() {
                SampleFormat::F32 => build_stream::<f32>(&device, &config, block),
                SampleFormat::I16 => build_stream::<i16>(&device, &config, block),
                SampleFormat::U16 => build_stream::<u16>(&device, &config, block),
                other => Err(format!("Unsupported input sample format: {:?}", other)),
            }
        })
        .map_err(CaptureError::DeviceUnavailable)?;

        Ok(Box::new(thread))
    }
}

fn find_input_device(host: &cpal::Host, name: Option<&str>) -> Result<Device, String> {
    match name {
        Some(wanted) => host
            .input_devices()
            .map_err(|e| format!("Failed to enumerate input devices: {}", e))?
            .find(|d| d.name().map(|n| n.contains(wanted)).unwrap_or(false))
            .ok_or_else(|| format!("Input device '{}' not found", wanted)),
        None => host
            .default_input_device()
            .ok_or_else(|| "No default input device available".to_string()),
    }
}

fn build_stream<T>(
    device: &Device,
    config: &SupportedStreamConfig,
    mut block: BlockConverter,
) -> Result<cpal::Stream, String>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    log::info!(
        "AudioCapture: {} channels @ {}Hz (format: {:?})",
        config.channels(),
        config.sample_rate().0,
        config.sample_format()
    );

    device
        .build_input_stream(
            &config.config(),
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                block.process(data.iter().map(|&s| f32::from_sample(s)));
            },
            |err| log::error!("AudioCapture: Stream error: {}", err),
            None,
        )
        .map_err(|e| format!("Failed to build input stream: {}", e))
}

/// Device samples arrive in blocks of whatever size the host picks; the resampler works in
/// fixed chunks of this many device frames.
const RESAMPLE_CHUNK: usize = 1024;

/// Interleaved device samples in, mono session-rate samples out.
struct BlockConverter {
    extractor: ChannelExtractor,
    resampler: Option<RateConverter>,
    interleaved: Vec<f32>,
    mono: Vec<f32>,
    on_samples: SampleCallback,
}

impl BlockConverter {
    fn new(
        extractor: ChannelExtractor,
        device_rate: u32,
        session_rate: u32,
        on_samples: SampleCallback,
    ) -> Result<Self, String> {
        let resampler = if device_rate == session_rate {
            None
        } else {
            let converter = RateConverter::new(device_rate, session_rate, RESAMPLE_CHUNK)
                .map_err(|e| format!("Failed to create resampler: {}", e))?;
            log::info!(
                "AudioCapture: resampling {} Hz device to {} Hz",
                device_rate,
                session_rate
            );
            Some(converter)
        };
        Ok(Self {
            extractor,
            resampler,
            interleaved: Vec::new(),
            mono: Vec::new(),
            on_samples,
        })
    }

    fn process(&mut self, samples: impl Iterator<Item = f32>) {
        self.interleaved.clear();
        self.interleaved.extend(samples);
        self.mono.clear();
        self.extractor.extract_into(&self.interleaved, &mut self.mono);

        let BlockConverter {
            resampler,
            mono,
            on_samples,
            ..
        } = self;
        match resampler {
            Some(resampler) => {
                if let Err(e) = resampler.push(&mono[..], |converted| on_samples(converted)) {
                    log::warn!("AudioCapture: resampling failed, block dropped: {}", e);
                }
            }
            None => on_samples(&mono[..]),
        }
    }
}
