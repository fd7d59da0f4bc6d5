//! Audio side of the Tandem playback backend.
//!
//! [`PlaybackBackend`] speaks the playback protocol on top of a
//! [`DecoderFactory`]. With the `symphonia-decoder` feature local files are
//! decoded by symphonia; without it only [`NullDecoderFactory`] is available.

mod backend;
mod decoder;
#[cfg(feature = "symphonia-decoder")]
mod symphonia_decoder;

pub use backend::{PlaybackBackend, PLAYBACK_BACKEND_TYPE};
pub use decoder::{
    file_path, AudioError, AudioResult, Decoder, DecoderFactory, NullDecoderFactory,
    SampleCallback, SilentDecoder,
};
#[cfg(feature = "symphonia-decoder")]
pub use symphonia_decoder::{SymphoniaDecoder, SymphoniaDecoderFactory};
