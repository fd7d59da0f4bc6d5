//! Typed views of the commands and events exchanged with backends.

use crate::protocol::{commands, Message};
use tandem_core::{Metadata, Uri, UriError};
use thiserror::Error;

/// A protocol line that could not be turned into a typed message.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("unexpected command {0:?}")]
    UnknownCommand(String),
    #[error("{command} is missing parameter {index}")]
    MissingParameter { command: String, index: usize },
    #[error("{command} carries an invalid resource identifier: {source}")]
    InvalidUri { command: String, source: UriError },
    #[error("{command} carries invalid metadata: {source}")]
    InvalidMetadata {
        command: String,
        source: serde_json::Error,
    },
}

fn required<'a>(message: &'a Message, index: usize) -> Result<&'a str, EventError> {
    message
        .param(index)
        .ok_or_else(|| EventError::MissingParameter {
            command: message.command.clone(),
            index,
        })
}

fn uri_param(message: &Message, index: usize) -> Result<Uri, EventError> {
    required(message, index)?
        .parse()
        .map_err(|source| EventError::InvalidUri {
            command: message.command.clone(),
            source,
        })
}

/// Absent and empty parameters both mean "no resource".
fn optional_uri_param(message: &Message, index: usize) -> Result<Option<Uri>, EventError> {
    match message.param(index) {
        None | Some("") => Ok(None),
        Some(_) => uri_param(message, index).map(Some),
    }
}

fn metadata_param(message: &Message, index: usize) -> Result<Metadata, EventError> {
    match message.param(index) {
        None | Some("") => Ok(Metadata::empty()),
        Some(text) => Metadata::parse_json(text).map_err(|source| EventError::InvalidMetadata {
            command: message.command.clone(),
            source,
        }),
    }
}

/// Frontend to playback backend.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackCommand {
    Play {
        uri: Uri,
        metadata: Metadata,
        next: Option<(Uri, Metadata)>,
    },
    Stop,
    SetNextResource(Uri),
    ClearNextResource,
    TriggerTransition,
}

impl PlaybackCommand {
    pub fn to_message(&self) -> Message {
        match self {
            PlaybackCommand::Play {
                uri,
                metadata,
                next,
            } => {
                let mut message = Message::new(commands::PLAY)
                    .with_param(uri.to_string())
                    .with_param(metadata.to_json_string());
                if let Some((next_uri, next_metadata)) = next {
                    message = message
                        .with_param(next_uri.to_string())
                        .with_param(next_metadata.to_json_string());
                }
                message
            }
            PlaybackCommand::Stop => Message::new(commands::STOP),
            PlaybackCommand::SetNextResource(uri) => {
                Message::new(commands::SET_NEXT_RESOURCE).with_param(uri.to_string())
            }
            PlaybackCommand::ClearNextResource => Message::new(commands::CLEAR_NEXT_RESOURCE),
            PlaybackCommand::TriggerTransition => Message::new(commands::TRIGGER_TRANSITION),
        }
    }

    pub fn parse(message: &Message) -> Result<Self, EventError> {
        match message.command.as_str() {
            commands::PLAY => {
                let uri = uri_param(message, 0)?;
                let metadata = metadata_param(message, 1)?;
                let next = match optional_uri_param(message, 2)? {
                    Some(next_uri) => Some((next_uri, metadata_param(message, 3)?)),
                    None => None,
                };
                Ok(PlaybackCommand::Play {
                    uri,
                    metadata,
                    next,
                })
            }
            commands::STOP => Ok(PlaybackCommand::Stop),
            commands::SET_NEXT_RESOURCE => Ok(PlaybackCommand::SetNextResource(uri_param(message, 0)?)),
            commands::CLEAR_NEXT_RESOURCE => Ok(PlaybackCommand::ClearNextResource),
            commands::TRIGGER_TRANSITION => Ok(PlaybackCommand::TriggerTransition),
            other => Err(EventError::UnknownCommand(other.to_string())),
        }
    }
}

impl TryFrom<&Message> for PlaybackCommand {
    type Error = EventError;

    fn try_from(message: &Message) -> Result<Self, Self::Error> {
        Self::parse(message)
    }
}

/// Playback backend to frontend.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    Transition { old: Option<Uri>, new: Uri },
    Started { current: Uri, next: Option<Uri> },
    Stopped(Uri),
    ResourceFinished(Uri),
    Metadata { uri: Uri, metadata: Metadata },
    BackendType(String),
    Pong(Option<String>),
    Error(String),
}

impl PlaybackEvent {
    pub fn to_message(&self) -> Message {
        match self {
            PlaybackEvent::Transition { old, new } => Message::new(commands::TRANSITION)
                .with_param(old.as_ref().map(Uri::to_string).unwrap_or_default())
                .with_param(new.to_string()),
            PlaybackEvent::Started { current, next } => {
                let message = Message::new(commands::STARTED).with_param(current.to_string());
                match next {
                    Some(next) => message.with_param(next.to_string()),
                    None => message,
                }
            }
            PlaybackEvent::Stopped(uri) => Message::new(commands::STOPPED).with_param(uri.to_string()),
            PlaybackEvent::ResourceFinished(uri) => {
                Message::new(commands::RESOURCE_FINISHED).with_param(uri.to_string())
            }
            PlaybackEvent::Metadata { uri, metadata } => Message::new(commands::METADATA)
                .with_param(uri.to_string())
                .with_param(metadata.to_json_string()),
            PlaybackEvent::BackendType(kind) => {
                Message::new(commands::BACKEND_TYPE).with_param(kind.clone())
            }
            PlaybackEvent::Pong(echo) => {
                let message = Message::new(commands::PONG);
                match echo {
                    Some(echo) => message.with_param(echo.clone()),
                    None => message,
                }
            }
            PlaybackEvent::Error(text) => Message::new(commands::ERROR).with_param(text.clone()),
        }
    }

    pub fn parse(message: &Message) -> Result<Self, EventError> {
        match message.command.as_str() {
            commands::TRANSITION => Ok(PlaybackEvent::Transition {
                old: optional_uri_param(message, 0)?,
                new: uri_param(message, 1)?,
            }),
            commands::STARTED => Ok(PlaybackEvent::Started {
                current: uri_param(message, 0)?,
                next: optional_uri_param(message, 1)?,
            }),
            commands::STOPPED => Ok(PlaybackEvent::Stopped(uri_param(message, 0)?)),
            commands::RESOURCE_FINISHED => {
                Ok(PlaybackEvent::ResourceFinished(uri_param(message, 0)?))
            }
            commands::METADATA => Ok(PlaybackEvent::Metadata {
                uri: uri_param(message, 0)?,
                metadata: metadata_param(message, 1)?,
            }),
            commands::BACKEND_TYPE => Ok(PlaybackEvent::BackendType(
                required(message, 0)?.to_string(),
            )),
            commands::PONG => Ok(PlaybackEvent::Pong(message.param(0).map(str::to_string))),
            commands::ERROR => Ok(PlaybackEvent::Error(
                message.param(0).unwrap_or_default().to_string(),
            )),
            other => Err(EventError::UnknownCommand(other.to_string())),
        }
    }
}

/// Per-resource failure reported by a scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceErrorKind {
    Unrecognized,
    NotFound,
    Corrupted,
}

impl ResourceErrorKind {
    pub fn command(self) -> &'static str {
        match self {
            ResourceErrorKind::Unrecognized => commands::UNRECOGNIZED_RESOURCE,
            ResourceErrorKind::NotFound => commands::RESOURCE_NOT_FOUND,
            ResourceErrorKind::Corrupted => commands::RESOURCE_CORRUPTED,
        }
    }
}

/// Scanner backend to frontend.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    Metadata { uri: Uri, metadata: Metadata },
    ResourceError { uri: Uri, kind: ResourceErrorKind },
    Error(String),
}

impl ScanEvent {
    pub fn to_message(&self) -> Message {
        match self {
            ScanEvent::Metadata { uri, metadata } => Message::new(commands::METADATA)
                .with_param(uri.to_string())
                .with_param(metadata.to_json_string()),
            ScanEvent::ResourceError { uri, kind } => {
                Message::new(kind.command()).with_param(uri.to_string())
            }
            ScanEvent::Error(text) => Message::new(commands::ERROR).with_param(text.clone()),
        }
    }

    pub fn parse(message: &Message) -> Result<Self, EventError> {
        let resource_error = |kind| -> Result<Self, EventError> {
            Ok(ScanEvent::ResourceError {
                uri: uri_param(message, 0)?,
                kind,
            })
        };
        match message.command.as_str() {
            commands::METADATA => Ok(ScanEvent::Metadata {
                uri: uri_param(message, 0)?,
                metadata: metadata_param(message, 1)?,
            }),
            commands::UNRECOGNIZED_RESOURCE => resource_error(ResourceErrorKind::Unrecognized),
            commands::RESOURCE_NOT_FOUND => resource_error(ResourceErrorKind::NotFound),
            commands::RESOURCE_CORRUPTED => resource_error(ResourceErrorKind::Corrupted),
            commands::ERROR => Ok(ScanEvent::Error(
                message.param(0).unwrap_or_default().to_string(),
            )),
            other => Err(EventError::UnknownCommand(other.to_string())),
        }
    }
}
