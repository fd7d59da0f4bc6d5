//! The playback backend process: decodes the current resource in real time
//! and hands over to the queued next one without a gap.

use crate::decoder::{AudioError, Decoder, DecoderFactory, SampleCallback};
use serde_json::json;
use std::fmt;
use std::time::Duration;
use tandem_core::{Metadata, Uri};
use tandem_protocol::{commands, Backend, Message, PlaybackCommand, PlaybackEvent};

pub const PLAYBACK_BACKEND_TYPE: &str = "tandem-playback";

/// Samples pulled from a decoder per read call.
const READ_CHUNK: usize = 4096;

struct Track {
    uri: Uri,
    decoder: Box<dyn Decoder>,
}

pub struct PlaybackBackend<F> {
    factory: F,
    backend_type: String,
    current: Option<Track>,
    next: Option<Uri>,
    sample_callback: Option<SampleCallback>,
    buffer: Vec<f32>,
    /// Fractional samples owed from previous polls.
    carry: f64,
}

impl<F> fmt::Debug for PlaybackBackend<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackBackend")
            .field("backend_type", &self.backend_type)
            .field("current", &self.current.as_ref().map(|track| &track.uri))
            .field("next", &self.next)
            .finish_non_exhaustive()
    }
}

impl<F: DecoderFactory> PlaybackBackend<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            backend_type: PLAYBACK_BACKEND_TYPE.to_string(),
            current: None,
            next: None,
            sample_callback: None,
            buffer: vec![0.0; READ_CHUNK],
            carry: 0.0,
        }
    }

    pub fn with_backend_type(mut self, backend_type: impl Into<String>) -> Self {
        self.backend_type = backend_type.into();
        self
    }

    pub fn set_sample_callback(&mut self, callback: SampleCallback) {
        self.sample_callback = Some(callback);
    }

    pub fn current_uri(&self) -> Option<&Uri> {
        self.current.as_ref().map(|track| &track.uri)
    }

    pub fn next_uri(&self) -> Option<&Uri> {
        self.next.as_ref()
    }

    fn open(&self, uri: &Uri) -> Result<Track, AudioError> {
        let decoder = self.factory.open(uri)?;
        tracing::debug!(
            %uri,
            sample_rate = decoder.sample_rate(),
            channels = decoder.channels(),
            "opened decoder"
        );
        Ok(Track {
            uri: uri.clone(),
            decoder,
        })
    }

    fn stream_info(track: &Track) -> Message {
        let metadata = Metadata::from(json!({
            "sample_rate": track.decoder.sample_rate(),
            "channels": track.decoder.channels(),
        }));
        PlaybackEvent::Metadata {
            uri: track.uri.clone(),
            metadata,
        }
        .to_message()
    }

    fn play(&mut self, uri: Uri, next: Option<Uri>) -> Vec<Message> {
        self.carry = 0.0;
        match self.open(&uri) {
            Ok(track) => {
                let info = Self::stream_info(&track);
                self.current = Some(track);
                self.next = next.clone();
                vec![
                    PlaybackEvent::Started { current: uri, next }.to_message(),
                    info,
                ]
            }
            Err(err) => {
                tracing::warn!(%uri, error = %err, "cannot play resource");
                let mut replies = vec![PlaybackEvent::Error(format!("{uri}: {err}")).to_message()];
                if let Some(previous) = self.current.take() {
                    replies.push(PlaybackEvent::Stopped(previous.uri).to_message());
                }
                replies.push(PlaybackEvent::Stopped(uri).to_message());
                replies
            }
        }
    }

    fn stop(&mut self) -> Vec<Message> {
        self.next = None;
        match self.current.take() {
            Some(track) => vec![PlaybackEvent::Stopped(track.uri).to_message()],
            None => Vec::new(),
        }
    }

    /// Move on to the queued next resource, or finish.
    fn advance(&mut self) -> Vec<Message> {
        let Some(old) = self.current.take() else {
            return Vec::new();
        };
        let Some(next) = self.next.take() else {
            return vec![PlaybackEvent::ResourceFinished(old.uri).to_message()];
        };
        match self.open(&next) {
            Ok(track) => {
                let info = Self::stream_info(&track);
                self.current = Some(track);
                vec![
                    PlaybackEvent::Transition {
                        old: Some(old.uri),
                        new: next,
                    }
                    .to_message(),
                    info,
                ]
            }
            Err(err) => {
                tracing::warn!(uri = %next, error = %err, "cannot open next resource");
                vec![
                    PlaybackEvent::Error(format!("{next}: {err}")).to_message(),
                    PlaybackEvent::ResourceFinished(old.uri).to_message(),
                ]
            }
        }
    }

    /// Pull `samples` samples from the current decoder, crossing into the
    /// next resource when the current one ends.
    fn pull(&mut self, mut samples: usize) -> Vec<Message> {
        let mut replies = Vec::new();
        while samples > 0 {
            let Some(track) = self.current.as_mut() else {
                break;
            };
            let want = samples.min(self.buffer.len());
            match track.decoder.read(&mut self.buffer[..want]) {
                Ok(0) => {
                    tracing::debug!(uri = %track.uri, "end of stream");
                    replies.extend(self.advance());
                }
                Ok(read) => {
                    if let Some(callback) = &self.sample_callback {
                        callback(&self.buffer[..read]);
                    }
                    samples -= read.min(samples);
                }
                Err(err) => {
                    tracing::warn!(uri = %track.uri, error = %err, "decode failed");
                    replies.push(PlaybackEvent::Error(format!("{}: {err}", track.uri)).to_message());
                    replies.extend(self.advance());
                }
            }
        }
        replies
    }

    fn exec_command(&mut self, command: PlaybackCommand) -> Vec<Message> {
        match command {
            PlaybackCommand::Play { uri, next, .. } => self.play(uri, next.map(|(uri, _)| uri)),
            PlaybackCommand::Stop => self.stop(),
            PlaybackCommand::SetNextResource(uri) => {
                self.next = Some(uri);
                Vec::new()
            }
            PlaybackCommand::ClearNextResource => {
                self.next = None;
                Vec::new()
            }
            PlaybackCommand::TriggerTransition => self.advance(),
        }
    }
}

impl<F: DecoderFactory> Backend for PlaybackBackend<F> {
    fn backend_type(&self) -> &str {
        &self.backend_type
    }

    fn exec(&mut self, command: &str, params: &[String]) -> Vec<Message> {
        let message = Message {
            command: command.to_string(),
            params: params.to_vec(),
        };
        match PlaybackCommand::parse(&message) {
            Ok(command) => self.exec_command(command),
            Err(err) => {
                tracing::warn!(error = %err, line = %message, "rejected command");
                vec![Message::new(commands::ERROR).with_param(err.to_string())]
            }
        }
    }

    fn poll(&mut self, elapsed: Duration) -> Vec<Message> {
        let Some(track) = &self.current else {
            return Vec::new();
        };
        let rate = track.decoder.sample_rate() as f64 * track.decoder.channels() as f64;
        let owed = elapsed.as_secs_f64() * rate + self.carry;
        let samples = owed.floor();
        self.carry = owed - samples;
        self.pull(samples as usize)
    }
}
