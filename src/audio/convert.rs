//! Sample conversions shared by the capture and playback paths.

use crate::capture::CaptureError;
use rubato::{
    ResampleError, Resampler, ResamplerConstructionError, SincFixedIn, SincInterpolationParameters,
    SincInterpolationType, WindowFunction,
};

/// Interpret raw bytes as signed 16-bit little-endian samples normalized to [-1, 1].
/// A trailing odd byte is ignored.
pub fn pcm16_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect()
}

pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

pub fn i16_to_pcm_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Root mean square amplitude, 0.0 for an empty window.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Extracts a specific channel from interleaved multi-channel audio
#[derive(Clone, Debug)]
pub struct ChannelExtractor {
    target_channel: usize,
    total_channels: usize,
}

impl ChannelExtractor {
    pub fn new(target_channel: usize, total_channels: usize) -> Result<Self, CaptureError> {
        if target_channel >= total_channels {
            return Err(CaptureError::Config(format!(
                "Target channel {} is out of range for {} channels",
                target_channel, total_channels
            )));
        }

        Ok(Self {
            target_channel,
            total_channels,
        })
    }

    pub fn extract_into(&self, interleaved: &[f32], out: &mut Vec<f32>) {
        if self.total_channels == 1 {
            out.extend_from_slice(interleaved);
        } else {
            out.extend(
                interleaved
                    .chunks(self.total_channels)
                    .filter_map(|frame| frame.get(self.target_channel).copied()),
            );
        }
    }
}

/// Streaming sample-rate converter for one mono channel.
///
/// Input is collected until a full resampler chunk is available, so blocks of any size can be
/// pushed. The output buffer is allocated once up front.
pub struct RateConverter {
    resampler: SincFixedIn<f32>,
    pending: Vec<f32>,
    output: Vec<Vec<f32>>,
}

impl RateConverter {
    pub fn new(from_rate: u32, to_rate: u32, chunk_size: usize) -> Result<Self, ResamplerConstructionError> {
        let params = SincInterpolationParameters {
            sinc_len: 32,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        };
        let ratio = to_rate as f64 / from_rate as f64;
        let resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, chunk_size, 1)?;
        let output = resampler.output_buffer_allocate(true);

        Ok(Self {
            resampler,
            pending: Vec::with_capacity(chunk_size * 2),
            output,
        })
    }

    /// Source samples the next chunk consumes.
    pub fn input_frames_next(&self) -> usize {
        self.resampler.input_frames_next()
    }

    /// Feed source samples; `emit` receives the converted samples of every completed chunk.
    pub fn push(&mut self, input: &[f32], mut emit: impl FnMut(&[f32])) -> Result<(), ResampleError> {
        self.pending.extend_from_slice(input);

        loop {
            let needed = self.resampler.input_frames_next();
            if self.pending.len() < needed {
                return Ok(());
            }
            let (read, written) = self.resampler.process_into_buffer(
                &[&self.pending[..needed]],
                &mut self.output,
                None,
            )?;
            emit(&self.output[0][..written]);
            self.pending.drain(..read);
        }
    }
}

impl std::fmt::Debug for RateConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateConverter")
            .field("pending", &self.pending.len())
            .finish()
    }
}
