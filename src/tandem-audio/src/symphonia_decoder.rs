use std::fs::File;
use std::io::ErrorKind;
use std::time::Duration;

use symphonia::core::{
    audio::SampleBuffer,
    codecs::{Decoder as CodecDecoder, DecoderOptions},
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader, SeekMode, SeekTo},
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
    units::Time,
};
use symphonia::default;
use tandem_core::Uri;

use crate::decoder::{file_path, AudioError, AudioResult, Decoder, DecoderFactory};

/// Opens local files with symphonia.
#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaDecoderFactory;

impl DecoderFactory for SymphoniaDecoderFactory {
    fn open(&self, uri: &Uri) -> AudioResult<Box<dyn Decoder>> {
        Ok(Box::new(SymphoniaDecoder::open(uri)?))
    }
}

/// Streaming decoder for one track of a local file.
pub struct SymphoniaDecoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn CodecDecoder>,
    track_id: u32,
    sample_rate: u32,
    channels: u16,
    pending: Vec<f32>,
    offset: usize,
    finished: bool,
}

impl std::fmt::Debug for SymphoniaDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymphoniaDecoder")
            .field("track_id", &self.track_id)
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .finish_non_exhaustive()
    }
}

impl SymphoniaDecoder {
    /// Open `uri`. A `sub_resource_index` option selects the track.
    pub fn open(uri: &Uri) -> AudioResult<Self> {
        let path = file_path(uri)?;
        let file = File::open(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => AudioError::NotFound(path.clone()),
            _ => AudioError::Io(e.to_string()),
        })?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| AudioError::UnsupportedSource(format!("{}: {e}", path.display())))?;
        let format = probed.format;

        let track = match uri.sub_resource_index() {
            Some(index) => format.tracks().get(index as usize),
            None => format.default_track(),
        }
        .ok_or_else(|| AudioError::Decode(format!("{uri}: no such track")))?;
        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        let sample_rate = codec_params
            .sample_rate
            .ok_or_else(|| AudioError::Decode(format!("{uri}: unknown sample rate")))?;
        let channels = codec_params
            .channels
            .map(|channels| channels.count() as u16)
            .unwrap_or(2);
        let decoder = default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| AudioError::Decode(e.to_string()))?;

        Ok(Self {
            format,
            decoder,
            track_id,
            sample_rate,
            channels,
            pending: Vec::new(),
            offset: 0,
            finished: false,
        })
    }

    /// Decode the next packet of our track into `pending`.
    fn refill(&mut self) -> AudioResult<()> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                    self.finished = true;
                    return Ok(());
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.finished = true;
                    return Ok(());
                }
                Err(err) => return Err(AudioError::Decode(err.to_string())),
            };
            if packet.track_id() != self.track_id {
                continue;
            }
            let audio_buf = match self.decoder.decode(&packet) {
                Ok(buf) => buf,
                Err(SymphoniaError::DecodeError(e)) => {
                    tracing::debug!(error = e, "skipping undecodable packet");
                    continue;
                }
                Err(err) => return Err(AudioError::Decode(err.to_string())),
            };
            let spec = *audio_buf.spec();
            let mut sample_buf = SampleBuffer::<f32>::new(audio_buf.capacity() as u64, spec);
            sample_buf.copy_interleaved_ref(audio_buf);
            self.pending.clear();
            self.pending.extend_from_slice(sample_buf.samples());
            self.offset = 0;
            return Ok(());
        }
    }
}

impl Decoder for SymphoniaDecoder {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn read(&mut self, out: &mut [f32]) -> AudioResult<usize> {
        let mut written = 0;
        while written < out.len() {
            if self.offset >= self.pending.len() {
                if self.finished {
                    break;
                }
                self.refill()?;
                continue;
            }
            let count = (self.pending.len() - self.offset).min(out.len() - written);
            out[written..written + count]
                .copy_from_slice(&self.pending[self.offset..self.offset + count]);
            self.offset += count;
            written += count;
        }
        Ok(written)
    }

    fn seek(&mut self, position: Duration) -> AudioResult<()> {
        let time = Time::new(position.as_secs(), position.subsec_nanos() as f64 / 1e9);
        self.format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time,
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| AudioError::Decode(e.to_string()))?;
        self.decoder.reset();
        self.pending.clear();
        self.offset = 0;
        self.finished = false;
        Ok(())
    }
}
