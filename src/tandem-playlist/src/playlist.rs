//! The playlist capability shared by flat playlists and derived views.

use crate::entry::{PlaylistEntry, UriSet};
use std::fmt;
use std::sync::mpsc;
use tandem_core::{Metadata, Uri, UniqueIdError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlaylistError {
    #[error("{0} is already in the playlist")]
    DuplicateUri(Uri),
    #[error("unique id of {uri} is already in use: {source}")]
    DuplicateId { uri: Uri, source: UniqueIdError },
    #[error("{0} carries an id option that is not a unique id")]
    InvalidId(Uri),
    #[error("playlist {0:?} is read-only")]
    ReadOnly(String),
    #[error("invalid playlist document: {0}")]
    InvalidDocument(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistKind {
    Flat,
    Filtered,
}

/// Change notifications emitted by a playlist.
///
/// Add, remove and full-replace changes come in pairs: once with
/// `before = true` right before the mutation and once with `before = false`
/// right after it.
pub trait PlaylistObserver {
    fn resources_added(&mut self, _uris: &UriSet, _before: bool) {}
    fn resources_removed(&mut self, _uris: &UriSet, _before: bool) {}
    fn all_resources_changed(&mut self, _before: bool) {}
    fn resource_metadata_changed(&mut self, _uri: &Uri) {}
    fn resource_incompatible(&mut self, _uri: &Uri, _backend_type: &str) {}
}

/// Owned form of one observer callback.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaylistEvent {
    ResourcesAdded { uris: UriSet, before: bool },
    ResourcesRemoved { uris: UriSet, before: bool },
    AllResourcesChanged { before: bool },
    MetadataChanged { uri: Uri },
    ResourceIncompatible { uri: Uri, backend_type: String },
}

impl PlaylistEvent {
    pub fn is_before(&self) -> bool {
        matches!(
            self,
            PlaylistEvent::ResourcesAdded { before: true, .. }
                | PlaylistEvent::ResourcesRemoved { before: true, .. }
                | PlaylistEvent::AllResourcesChanged { before: true }
        )
    }

    pub fn dispatch(&self, observer: &mut dyn PlaylistObserver) {
        match self {
            PlaylistEvent::ResourcesAdded { uris, before } => observer.resources_added(uris, *before),
            PlaylistEvent::ResourcesRemoved { uris, before } => {
                observer.resources_removed(uris, *before)
            }
            PlaylistEvent::AllResourcesChanged { before } => observer.all_resources_changed(*before),
            PlaylistEvent::MetadataChanged { uri } => observer.resource_metadata_changed(uri),
            PlaylistEvent::ResourceIncompatible { uri, backend_type } => {
                observer.resource_incompatible(uri, backend_type)
            }
        }
    }
}

/// Observer that hands every callback to a closure as a [`PlaylistEvent`].
pub struct EventForwarder<F>(pub F);

impl<F: FnMut(PlaylistEvent)> PlaylistObserver for EventForwarder<F> {
    fn resources_added(&mut self, uris: &UriSet, before: bool) {
        (self.0)(PlaylistEvent::ResourcesAdded {
            uris: uris.clone(),
            before,
        })
    }

    fn resources_removed(&mut self, uris: &UriSet, before: bool) {
        (self.0)(PlaylistEvent::ResourcesRemoved {
            uris: uris.clone(),
            before,
        })
    }

    fn all_resources_changed(&mut self, before: bool) {
        (self.0)(PlaylistEvent::AllResourcesChanged { before })
    }

    fn resource_metadata_changed(&mut self, uri: &Uri) {
        (self.0)(PlaylistEvent::MetadataChanged { uri: uri.clone() })
    }

    fn resource_incompatible(&mut self, uri: &Uri, backend_type: &str) {
        (self.0)(PlaylistEvent::ResourceIncompatible {
            uri: uri.clone(),
            backend_type: backend_type.to_string(),
        })
    }
}

/// Observer that queues events on a channel.
pub fn channel_observer(tx: mpsc::Sender<PlaylistEvent>) -> Box<dyn PlaylistObserver> {
    Box::new(EventForwarder(move |event: PlaylistEvent| {
        let _ = tx.send(event);
    }))
}

#[derive(Default)]
pub(crate) struct Observers(Vec<Box<dyn PlaylistObserver>>);

impl Observers {
    pub(crate) fn subscribe(&mut self, observer: Box<dyn PlaylistObserver>) {
        self.0.push(observer);
    }

    pub(crate) fn emit(&mut self, event: &PlaylistEvent) {
        for observer in &mut self.0 {
            event.dispatch(observer.as_mut());
        }
    }

    pub(crate) fn added(&mut self, uris: &UriSet, before: bool) {
        self.emit(&PlaylistEvent::ResourcesAdded {
            uris: uris.clone(),
            before,
        });
    }

    pub(crate) fn removed(&mut self, uris: &UriSet, before: bool) {
        self.emit(&PlaylistEvent::ResourcesRemoved {
            uris: uris.clone(),
            before,
        });
    }
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Observers({})", self.0.len())
    }
}

/// Ordered, URI-indexed collection of resources.
pub trait Playlist {
    fn name(&self) -> &str;

    fn kind(&self) -> PlaylistKind;

    fn is_repeating(&self) -> bool;

    fn entries(&self) -> &[PlaylistEntry];

    fn position(&self, uri: &Uri) -> Option<usize>;

    fn len(&self) -> usize {
        self.entries().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, uri: &Uri) -> Option<&PlaylistEntry> {
        self.position(uri).and_then(|index| self.entry_at(index))
    }

    fn entry_at(&self, index: usize) -> Option<&PlaylistEntry> {
        self.entries().get(index)
    }

    /// Entry after `uri`, wrapping to the first when repeating.
    fn succeeding_uri(&self, uri: &Uri) -> Option<Uri> {
        let index = self.position(uri)?;
        let next = if index + 1 < self.len() {
            index + 1
        } else if self.is_repeating() {
            0
        } else {
            return None;
        };
        self.entry_at(next).map(|entry| entry.uri.clone())
    }

    /// Entry before `uri`, wrapping to the last when repeating.
    fn preceding_uri(&self, uri: &Uri) -> Option<Uri> {
        let index = self.position(uri)?;
        let previous = if index > 0 {
            index - 1
        } else if self.is_repeating() {
            self.len().checked_sub(1)?
        } else {
            return None;
        };
        self.entry_at(previous).map(|entry| entry.uri.clone())
    }

    /// Stored metadata, or the empty object for unknown resources.
    fn metadata_for(&self, uri: &Uri) -> Metadata {
        self.entry(uri)
            .map(|entry| entry.metadata.clone())
            .unwrap_or_default()
    }

    /// Flag `uri` as unplayable by `backend_type`. Returns false if unknown.
    fn mark_backend_resource_incompatibility(&mut self, uri: &Uri, backend_type: &str) -> bool;

    /// Append an entry, returning its URI with the unique id applied.
    fn add_entry(&mut self, entry: PlaylistEntry, emit: bool) -> Result<Uri, PlaylistError>;

    /// Remove the listed entries. Returns how many were present.
    fn remove_entries(&mut self, uris: &UriSet, emit: bool) -> Result<usize, PlaylistError>;

    fn set_resource_metadata(&mut self, uri: &Uri, metadata: Metadata) -> Result<bool, PlaylistError>;

    fn subscribe(&mut self, observer: Box<dyn PlaylistObserver>);
}
