pub mod convert;
pub(crate) mod device;

pub use convert::{
    f32_to_i16, i16_to_pcm_bytes, pcm16_to_f32, rms, ChannelExtractor, RateConverter,
};
