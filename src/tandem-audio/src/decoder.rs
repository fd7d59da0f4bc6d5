use std::path::PathBuf;
use std::time::Duration;
use tandem_core::Uri;
use thiserror::Error;

/// Audio decoding errors.
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("unsupported source: {0}")]
    UnsupportedSource(String),
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("io error: {0}")]
    Io(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("{0}")]
    Other(String),
}

pub type AudioResult<T> = Result<T, AudioError>;

/// Receives every block of interleaved samples pulled from a decoder.
pub type SampleCallback = std::sync::Arc<dyn Fn(&[f32]) + Send + Sync>;

/// A stream of interleaved `f32` samples.
pub trait Decoder: Send {
    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;

    /// Fill `out` with interleaved samples. Returns 0 at end of stream.
    fn read(&mut self, out: &mut [f32]) -> AudioResult<usize>;

    fn seek(&mut self, position: Duration) -> AudioResult<()>;
}

/// Opens decoders for resource identifiers.
pub trait DecoderFactory {
    fn open(&self, uri: &Uri) -> AudioResult<Box<dyn Decoder>>;
}

/// Local path of a `file://` identifier.
pub fn file_path(uri: &Uri) -> AudioResult<PathBuf> {
    if uri.kind() != "file" {
        return Err(AudioError::UnsupportedSource(uri.to_string()));
    }
    Ok(PathBuf::from(uri.path()))
}

/// Silence of a fixed length, for tests and headless setups.
#[derive(Debug, Clone)]
pub struct SilentDecoder {
    sample_rate: u32,
    channels: u16,
    total: u64,
    position: u64,
}

impl SilentDecoder {
    pub fn new(duration: Duration, sample_rate: u32, channels: u16) -> Self {
        let total = (duration.as_secs_f64() * sample_rate as f64) as u64 * channels as u64;
        Self {
            sample_rate,
            channels,
            total,
            position: 0,
        }
    }
}

impl Decoder for SilentDecoder {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn read(&mut self, out: &mut [f32]) -> AudioResult<usize> {
        let remaining = self.total.saturating_sub(self.position);
        let count = remaining.min(out.len() as u64) as usize;
        out[..count].fill(0.0);
        self.position += count as u64;
        Ok(count)
    }

    fn seek(&mut self, position: Duration) -> AudioResult<()> {
        let target = (position.as_secs_f64() * self.sample_rate as f64) as u64 * self.channels as u64;
        self.position = target.min(self.total);
        Ok(())
    }
}

/// Factory producing [`SilentDecoder`]s of one length for any URI.
#[derive(Debug, Clone)]
pub struct NullDecoderFactory {
    pub duration: Duration,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for NullDecoderFactory {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(1),
            sample_rate: 44_100,
            channels: 2,
        }
    }
}

impl DecoderFactory for NullDecoderFactory {
    fn open(&self, _uri: &Uri) -> AudioResult<Box<dyn Decoder>> {
        Ok(Box::new(SilentDecoder::new(
            self.duration,
            self.sample_rate,
            self.channels,
        )))
    }
}
