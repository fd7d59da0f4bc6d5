//! Ordered collection of playlists with one active member.

use crate::entry::PlaylistEntry;
use crate::filtered::FilteredPlaylist;
use crate::flat::{FlatPlaylist, LoadIssue, LoadReport, FLAT_TYPE};
use crate::playlist::{EventForwarder, Playlist, PlaylistError, PlaylistEvent};
use serde_json::Value;
use std::fmt;
use std::sync::mpsc;
use tandem_core::{SharedIdAllocator, UniqueIdAllocator, Uri};

/// Stable handle to a playlist inside a [`PlaylistSet`]. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PlaylistKey(u64);

impl PlaylistKey {
    pub fn from_raw(raw: u64) -> Self {
        PlaylistKey(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PlaylistKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SetEvent {
    PlaylistAdded(PlaylistKey),
    PlaylistRemoved(PlaylistKey),
    ActiveChanged {
        previous: Option<PlaylistKey>,
        current: Option<PlaylistKey>,
    },
    Playlist {
        key: PlaylistKey,
        event: PlaylistEvent,
    },
}

#[derive(Debug)]
enum StoredPlaylist {
    Flat(FlatPlaylist),
    Filtered(FilteredPlaylist),
}

impl StoredPlaylist {
    fn as_dyn(&self) -> &dyn Playlist {
        match self {
            StoredPlaylist::Flat(playlist) => playlist,
            StoredPlaylist::Filtered(playlist) => playlist,
        }
    }

    fn as_dyn_mut(&mut self) -> &mut dyn Playlist {
        match self {
            StoredPlaylist::Flat(playlist) => playlist,
            StoredPlaylist::Filtered(playlist) => playlist,
        }
    }
}

/// Owns playlists in insertion order and tracks the active one.
///
/// Member playlists report their changes on the set's event queue, tagged
/// with their key. The queue is drained with [`PlaylistSet::drain_events`].
pub struct PlaylistSet {
    ids: SharedIdAllocator,
    playlists: Vec<(PlaylistKey, StoredPlaylist)>,
    active: Option<PlaylistKey>,
    next_key: u64,
    events_tx: mpsc::Sender<SetEvent>,
    events_rx: mpsc::Receiver<SetEvent>,
}

impl fmt::Debug for PlaylistSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaylistSet")
            .field("playlists", &self.playlists)
            .field("active", &self.active)
            .finish()
    }
}

impl Default for PlaylistSet {
    fn default() -> Self {
        Self::new(UniqueIdAllocator::new().shared())
    }
}

impl PlaylistSet {
    pub fn new(ids: SharedIdAllocator) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            ids,
            playlists: Vec::new(),
            active: None,
            next_key: 1,
            events_tx,
            events_rx,
        }
    }

    /// The allocator every flat playlist of this set must share.
    pub fn ids(&self) -> SharedIdAllocator {
        self.ids.clone()
    }

    pub fn len(&self) -> usize {
        self.playlists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.playlists.is_empty()
    }

    pub fn keys(&self) -> Vec<PlaylistKey> {
        self.playlists.iter().map(|(key, _)| *key).collect()
    }

    pub fn contains(&self, key: PlaylistKey) -> bool {
        self.stored(key).is_some()
    }

    pub fn create_playlist(&mut self, name: impl Into<String>) -> PlaylistKey {
        let playlist = FlatPlaylist::new(name, self.ids.clone());
        self.add_playlist(playlist)
    }

    pub fn add_playlist(&mut self, playlist: FlatPlaylist) -> PlaylistKey {
        self.insert(StoredPlaylist::Flat(playlist))
    }

    /// Add a view and populate it from the current flat playlists.
    pub fn add_filtered(&mut self, mut view: FilteredPlaylist) -> PlaylistKey {
        let snapshot = self.snapshot();
        view.rebuild(snapshot.iter().map(|(key, entries)| (*key, entries.as_slice())));
        self.insert(StoredPlaylist::Filtered(view))
    }

    fn insert(&mut self, mut stored: StoredPlaylist) -> PlaylistKey {
        let key = PlaylistKey(self.next_key);
        self.next_key += 1;

        let tx = self.events_tx.clone();
        stored
            .as_dyn_mut()
            .subscribe(Box::new(EventForwarder(move |event: PlaylistEvent| {
                let _ = tx.send(SetEvent::Playlist { key, event });
            })));
        tracing::debug!(%key, name = stored.as_dyn().name(), "playlist added");
        self.playlists.push((key, stored));
        self.send(SetEvent::PlaylistAdded(key));
        key
    }

    /// Drop a playlist, releasing its unique ids. Views are refreshed.
    pub fn remove_playlist(&mut self, key: PlaylistKey) -> bool {
        let Some(index) = self.playlists.iter().position(|(k, _)| *k == key) else {
            return false;
        };
        if self.active == Some(key) {
            self.set_active(None);
        }
        let (_, removed) = self.playlists.remove(index);
        let was_flat = matches!(removed, StoredPlaylist::Flat(_));
        drop(removed);
        tracing::debug!(%key, "playlist removed");
        self.send(SetEvent::PlaylistRemoved(key));
        if was_flat {
            self.refresh_views();
        }
        true
    }

    fn stored(&self, key: PlaylistKey) -> Option<&StoredPlaylist> {
        self.playlists
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, stored)| stored)
    }

    fn stored_mut(&mut self, key: PlaylistKey) -> Option<&mut StoredPlaylist> {
        self.playlists
            .iter_mut()
            .find(|(k, _)| *k == key)
            .map(|(_, stored)| stored)
    }

    pub fn playlist(&self, key: PlaylistKey) -> Option<&dyn Playlist> {
        self.stored(key).map(StoredPlaylist::as_dyn)
    }

    pub fn playlist_mut(&mut self, key: PlaylistKey) -> Option<&mut dyn Playlist> {
        self.stored_mut(key).map(StoredPlaylist::as_dyn_mut)
    }

    pub fn flat(&self, key: PlaylistKey) -> Option<&FlatPlaylist> {
        match self.stored(key)? {
            StoredPlaylist::Flat(playlist) => Some(playlist),
            StoredPlaylist::Filtered(_) => None,
        }
    }

    pub fn flat_mut(&mut self, key: PlaylistKey) -> Option<&mut FlatPlaylist> {
        match self.stored_mut(key)? {
            StoredPlaylist::Flat(playlist) => Some(playlist),
            StoredPlaylist::Filtered(_) => None,
        }
    }

    pub fn filtered(&self, key: PlaylistKey) -> Option<&FilteredPlaylist> {
        match self.stored(key)? {
            StoredPlaylist::Filtered(view) => Some(view),
            StoredPlaylist::Flat(_) => None,
        }
    }

    pub fn filtered_mut(&mut self, key: PlaylistKey) -> Option<&mut FilteredPlaylist> {
        match self.stored_mut(key)? {
            StoredPlaylist::Filtered(view) => Some(view),
            StoredPlaylist::Flat(_) => None,
        }
    }

    pub fn find_by_name(&self, name: &str) -> Option<PlaylistKey> {
        self.playlists
            .iter()
            .find(|(_, stored)| stored.as_dyn().name() == name)
            .map(|(key, _)| *key)
    }

    /// Returns false if `key` is not a member.
    pub fn set_active(&mut self, key: Option<PlaylistKey>) -> bool {
        if let Some(key) = key {
            if !self.contains(key) {
                return false;
            }
        }
        if self.active != key {
            let previous = std::mem::replace(&mut self.active, key);
            self.send(SetEvent::ActiveChanged {
                previous,
                current: key,
            });
        }
        true
    }

    pub fn active(&self) -> Option<PlaylistKey> {
        self.active
    }

    pub fn active_playlist(&self) -> Option<&dyn Playlist> {
        self.active.and_then(|key| self.playlist(key))
    }

    /// Flag `uri` in `key`. Marks on a view are forwarded to the owning playlist.
    pub fn mark_incompatible(&mut self, key: PlaylistKey, uri: &Uri, backend_type: &str) -> bool {
        let origin = self.filtered(key).and_then(|view| view.origin(uri));
        let Some(playlist) = self.playlist_mut(key) else {
            return false;
        };
        let marked = playlist.mark_backend_resource_incompatibility(uri, backend_type);
        if let Some(origin) = origin {
            if let Some(owner) = self.flat_mut(origin) {
                owner.mark_backend_resource_incompatibility(uri, backend_type);
            }
        }
        marked
    }

    fn snapshot(&self) -> Vec<(PlaylistKey, Vec<PlaylistEntry>)> {
        self.playlists
            .iter()
            .filter_map(|(key, stored)| match stored {
                StoredPlaylist::Flat(playlist) => Some((*key, playlist.entries().to_vec())),
                StoredPlaylist::Filtered(_) => None,
            })
            .collect()
    }

    /// Rebuild every view from the current flat playlists.
    pub fn refresh_views(&mut self) {
        if !self
            .playlists
            .iter()
            .any(|(_, stored)| matches!(stored, StoredPlaylist::Filtered(_)))
        {
            return;
        }
        let snapshot = self.snapshot();
        for (_, stored) in &mut self.playlists {
            if let StoredPlaylist::Filtered(view) = stored {
                view.rebuild(snapshot.iter().map(|(key, entries)| (*key, entries.as_slice())));
            }
        }
    }

    /// Events queued since the previous call, oldest first.
    pub fn drain_events(&self) -> Vec<SetEvent> {
        self.events_rx.try_iter().collect()
    }

    fn send(&self, event: SetEvent) {
        // The receiver lives as long as the set.
        let _ = self.events_tx.send(event);
    }

    /// Replace all flat playlists with the documents of a JSON array.
    pub fn load_from(&mut self, doc: &Value) -> Result<LoadReport, PlaylistError> {
        let documents = doc.as_array().ok_or_else(|| {
            PlaylistError::InvalidDocument("playlist set is not an array".into())
        })?;

        let flats: Vec<PlaylistKey> = self
            .playlists
            .iter()
            .filter(|(_, stored)| matches!(stored, StoredPlaylist::Flat(_)))
            .map(|(key, _)| *key)
            .collect();
        for key in flats {
            self.remove_playlist(key);
        }

        let mut report = LoadReport::default();
        for (index, document) in documents.iter().enumerate() {
            let name = document
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let kind = document
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or(FLAT_TYPE);
            if kind != FLAT_TYPE {
                tracing::warn!(index, kind, "skipping playlist of unknown type");
                report.issues.push(LoadIssue {
                    playlist: name,
                    index: None,
                    reason: format!("unknown playlist type {kind:?}"),
                });
                continue;
            }

            let mut playlist = FlatPlaylist::new(name.clone(), self.ids.clone());
            match playlist.load_from(document) {
                Ok(loaded) => {
                    report.merge(loaded);
                    self.add_playlist(playlist);
                }
                Err(err) => {
                    tracing::warn!(index, error = %err, "skipping playlist");
                    report.issues.push(LoadIssue {
                        playlist: name,
                        index: None,
                        reason: err.to_string(),
                    });
                }
            }
        }
        self.refresh_views();
        Ok(report)
    }

    /// Flat playlists as a JSON array. Views are derived and not saved.
    pub fn save_to(&self) -> Value {
        Value::Array(
            self.playlists
                .iter()
                .filter_map(|(_, stored)| match stored {
                    StoredPlaylist::Flat(playlist) => Some(playlist.save_to()),
                    StoredPlaylist::Filtered(_) => None,
                })
                .collect(),
        )
    }
}
