use crate::entry::{EntryContainer, PlaylistEntry, UriSet};
use crate::playlist::{Observers, Playlist, PlaylistError, PlaylistEvent, PlaylistKind, PlaylistObserver};
use serde_json::{json, Value};
use std::fmt;
use tandem_core::{Metadata, SharedIdAllocator, Uri, ID_OPTION};

/// Document `type` of a flat playlist.
pub const FLAT_TYPE: &str = "flat";

/// One entry of a document that could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadIssue {
    pub playlist: String,
    /// Position in the document's `entries`, if the issue concerns one entry.
    pub index: Option<usize>,
    pub reason: String,
}

impl fmt::Display for LoadIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "{} entry {}: {}", self.playlist, index, self.reason),
            None => write!(f, "{}: {}", self.playlist, self.reason),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    pub issues: Vec<LoadIssue>,
}

impl LoadReport {
    pub fn merge(&mut self, other: LoadReport) {
        self.loaded += other.loaded;
        self.issues.extend(other.issues);
    }

    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// A playlist that owns its entries.
///
/// Every entry's URI carries a unique id registered with the shared
/// allocator. Ids are released when entries are removed and when the
/// playlist is dropped.
#[derive(Debug)]
pub struct FlatPlaylist {
    name: String,
    repeating: bool,
    entries: EntryContainer,
    ids: SharedIdAllocator,
    observers: Observers,
}

impl FlatPlaylist {
    pub fn new(name: impl Into<String>, ids: SharedIdAllocator) -> Self {
        Self {
            name: name.into(),
            repeating: false,
            entries: EntryContainer::new(),
            ids,
            observers: Observers::default(),
        }
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn set_repeating(&mut self, repeating: bool) {
        self.repeating = repeating;
    }

    /// Give `entry` its unique id, registering a pre-assigned one.
    fn claim_id(&self, entry: PlaylistEntry) -> Result<PlaylistEntry, PlaylistError> {
        if self.entries.contains(&entry.uri) {
            return Err(PlaylistError::DuplicateUri(entry.uri));
        }
        let mut ids = self.ids.borrow_mut();
        match entry.uri.option(ID_OPTION) {
            None => {
                let id = ids.create_new();
                Ok(PlaylistEntry {
                    uri: entry.uri.with_unique_id(id),
                    ..entry
                })
            }
            Some(_) => {
                let Some(id) = entry.uri.unique_id() else {
                    return Err(PlaylistError::InvalidId(entry.uri));
                };
                match ids.insert(id) {
                    Ok(()) => Ok(entry),
                    Err(source) => Err(PlaylistError::DuplicateId {
                        uri: entry.uri,
                        source,
                    }),
                }
            }
        }
    }

    fn release_ids<'a>(&self, entries: impl IntoIterator<Item = &'a PlaylistEntry>) {
        let mut ids = self.ids.borrow_mut();
        for entry in entries {
            if let Some(id) = entry.uri.unique_id() {
                ids.erase(id);
            }
        }
    }

    /// Append several entries with one notification pair.
    ///
    /// Nothing is added if any entry is rejected.
    pub fn add_entries(
        &mut self,
        entries: impl IntoIterator<Item = PlaylistEntry>,
        emit: bool,
    ) -> Result<Vec<Uri>, PlaylistError> {
        let mut claimed: Vec<PlaylistEntry> = Vec::new();
        let mut batch = UriSet::new();
        for entry in entries {
            let result = if batch.contains(&entry.uri) {
                Err(PlaylistError::DuplicateUri(entry.uri))
            } else {
                self.claim_id(entry)
            };
            match result {
                Ok(entry) => {
                    batch.insert(entry.uri.clone());
                    claimed.push(entry);
                }
                Err(err) => {
                    self.release_ids(&claimed);
                    return Err(err);
                }
            }
        }
        if claimed.is_empty() {
            return Ok(Vec::new());
        }

        if emit {
            self.observers.added(&batch, true);
        }
        let uris: Vec<Uri> = claimed.iter().map(|entry| entry.uri.clone()).collect();
        for entry in claimed {
            // Uniqueness was checked while claiming.
            let _ = self.entries.push(entry);
        }
        if emit {
            self.observers.added(&batch, false);
        }
        Ok(uris)
    }

    /// Remove everything, releasing all ids.
    pub fn clear(&mut self, emit: bool) {
        if self.entries.is_empty() {
            return;
        }
        let uris: UriSet = self.entries.iter().map(|entry| entry.uri.clone()).collect();
        if emit {
            self.observers.removed(&uris, true);
        }
        let removed = self.entries.clear();
        self.release_ids(&removed);
        if emit {
            self.observers.removed(&uris, false);
        }
    }

    /// Replace the whole playlist with a persisted document.
    ///
    /// Entries that cannot be loaded are skipped and listed in the report.
    pub fn load_from(&mut self, doc: &Value) -> Result<LoadReport, PlaylistError> {
        let object = doc
            .as_object()
            .ok_or_else(|| PlaylistError::InvalidDocument("playlist is not an object".into()))?;
        match object.get("type").and_then(Value::as_str) {
            None | Some(FLAT_TYPE) => {}
            Some(other) => {
                return Err(PlaylistError::InvalidDocument(format!(
                    "expected a {FLAT_TYPE} playlist, found {other:?}"
                )))
            }
        }
        let entries = match object.get("entries") {
            None | Some(Value::Null) => &[][..],
            Some(Value::Array(entries)) => entries.as_slice(),
            Some(_) => {
                return Err(PlaylistError::InvalidDocument(
                    "entries is not an array".into(),
                ))
            }
        };

        self.observers
            .emit(&PlaylistEvent::AllResourcesChanged { before: true });
        self.clear(false);
        if let Some(name) = object.get("name").and_then(Value::as_str) {
            self.name = name.to_string();
        }
        self.repeating = object
            .get("repeating")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut report = LoadReport::default();
        for (index, raw) in entries.iter().enumerate() {
            let result = parse_entry(raw).and_then(|entry| {
                let entry = self.claim_id(entry).map_err(|err| err.to_string())?;
                let _ = self.entries.push(entry);
                Ok(())
            });
            match result {
                Ok(()) => report.loaded += 1,
                Err(reason) => {
                    tracing::warn!(playlist = %self.name, index, %reason, "skipping playlist entry");
                    report.issues.push(LoadIssue {
                        playlist: self.name.clone(),
                        index: Some(index),
                        reason,
                    });
                }
            }
        }

        self.observers
            .emit(&PlaylistEvent::AllResourcesChanged { before: false });
        tracing::debug!(
            playlist = %self.name,
            loaded = report.loaded,
            skipped = report.issues.len(),
            "loaded playlist"
        );
        Ok(report)
    }

    pub fn save_to(&self) -> Value {
        let entries: Vec<Value> = self
            .entries
            .iter()
            .map(|entry| {
                json!({
                    "uri": entry.uri.to_string(),
                    "metadata": entry.metadata.as_value(),
                    "incompatible": entry.incompatible,
                })
            })
            .collect();
        json!({
            "name": self.name,
            "type": FLAT_TYPE,
            "repeating": self.repeating,
            "entries": entries,
        })
    }
}

fn parse_entry(raw: &Value) -> Result<PlaylistEntry, String> {
    let uri = raw
        .get("uri")
        .and_then(Value::as_str)
        .ok_or_else(|| "entry has no uri".to_string())?;
    let uri: Uri = uri.parse().map_err(|err| format!("invalid uri {uri:?}: {err}"))?;
    let metadata = Metadata::from(raw.get("metadata").cloned().unwrap_or(Value::Null));
    if !metadata.is_valid() {
        return Err(format!("metadata of {uri} is not an object"));
    }
    Ok(PlaylistEntry {
        uri,
        metadata,
        incompatible: raw
            .get("incompatible")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

impl Playlist for FlatPlaylist {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PlaylistKind {
        PlaylistKind::Flat
    }

    fn is_repeating(&self) -> bool {
        self.repeating
    }

    fn entries(&self) -> &[PlaylistEntry] {
        self.entries.as_slice()
    }

    fn position(&self, uri: &Uri) -> Option<usize> {
        self.entries.position(uri)
    }

    fn mark_backend_resource_incompatibility(&mut self, uri: &Uri, backend_type: &str) -> bool {
        let Some(entry) = self.entries.get_mut(uri) else {
            return false;
        };
        entry.incompatible = true;
        tracing::info!(%uri, backend_type, "resource marked incompatible");
        self.observers.emit(&PlaylistEvent::ResourceIncompatible {
            uri: uri.clone(),
            backend_type: backend_type.to_string(),
        });
        true
    }

    fn add_entry(&mut self, entry: PlaylistEntry, emit: bool) -> Result<Uri, PlaylistError> {
        let entry = self.claim_id(entry)?;
        let uri = entry.uri.clone();
        let uris = UriSet::from([uri.clone()]);
        if emit {
            self.observers.added(&uris, true);
        }
        let _ = self.entries.push(entry);
        if emit {
            self.observers.added(&uris, false);
        }
        Ok(uri)
    }

    fn remove_entries(&mut self, uris: &UriSet, emit: bool) -> Result<usize, PlaylistError> {
        let present: UriSet = uris
            .iter()
            .filter(|uri| self.entries.contains(uri))
            .cloned()
            .collect();
        if present.is_empty() {
            return Ok(0);
        }
        if emit {
            self.observers.removed(&present, true);
        }
        let removed = self.entries.remove_all(&present);
        self.release_ids(&removed);
        if emit {
            self.observers.removed(&present, false);
        }
        Ok(removed.len())
    }

    fn set_resource_metadata(&mut self, uri: &Uri, metadata: Metadata) -> Result<bool, PlaylistError> {
        let Some(entry) = self.entries.get_mut(uri) else {
            return Ok(false);
        };
        entry.metadata = metadata;
        self.observers
            .emit(&PlaylistEvent::MetadataChanged { uri: uri.clone() });
        Ok(true)
    }

    fn subscribe(&mut self, observer: Box<dyn PlaylistObserver>) {
        self.observers.subscribe(observer);
    }
}

impl Drop for FlatPlaylist {
    fn drop(&mut self) {
        if let Ok(mut ids) = self.ids.try_borrow_mut() {
            for entry in self.entries.iter() {
                if let Some(id) = entry.uri.unique_id() {
                    ids.erase(id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playlist::channel_observer;
    use std::sync::mpsc;
    use tandem_core::{UniqueId, UniqueIdAllocator};

    fn playlist(paths: &[&str]) -> (FlatPlaylist, SharedIdAllocator, Vec<Uri>) {
        let ids = UniqueIdAllocator::seeded(7).shared();
        let mut playlist = FlatPlaylist::new("test", ids.clone());
        let uris = paths
            .iter()
            .map(|path| {
                playlist
                    .add_entry(PlaylistEntry::new(Uri::file(path)), false)
                    .unwrap()
            })
            .collect();
        (playlist, ids, uris)
    }

    #[test]
    fn added_entries_are_found_by_uri_and_index() {
        let (playlist, ids, uris) = playlist(&["/a", "/b", "/c"]);
        assert_eq!(ids.borrow().len(), 3);
        for (index, uri) in uris.iter().enumerate() {
            assert!(uri.unique_id().is_some());
            assert_eq!(playlist.entry(uri).map(|e| &e.uri), Some(uri));
            assert_eq!(playlist.entry_at(index).map(|e| &e.uri), Some(uri));
        }
    }

    #[test]
    fn traversal_stops_at_boundaries() {
        let (playlist, _ids, uris) = playlist(&["/a", "/b", "/c"]);
        assert_eq!(playlist.succeeding_uri(&uris[0]), Some(uris[1].clone()));
        assert_eq!(playlist.preceding_uri(&uris[1]), Some(uris[0].clone()));
        assert_eq!(playlist.succeeding_uri(&uris[2]), None);
        assert_eq!(playlist.preceding_uri(&uris[0]), None);
        assert_eq!(playlist.succeeding_uri(&Uri::file("/zzz")), None);
    }

    #[test]
    fn repeating_traversal_wraps() {
        let (mut playlist, _ids, uris) = playlist(&["/a", "/b", "/c"]);
        playlist.set_repeating(true);
        assert_eq!(playlist.succeeding_uri(&uris[2]), Some(uris[0].clone()));
        assert_eq!(playlist.preceding_uri(&uris[0]), Some(uris[2].clone()));
    }

    #[test]
    fn unknown_resource_has_empty_metadata() {
        let (playlist, _ids, _) = playlist(&["/a"]);
        let metadata = playlist.metadata_for(&Uri::file("/nope"));
        assert!(metadata.is_valid());
        assert!(metadata.is_empty());
    }

    #[test]
    fn add_and_remove_emit_before_after_pairs() {
        let (mut playlist, ids, _) = playlist(&[]);
        let (tx, rx) = mpsc::channel();
        playlist.subscribe(channel_observer(tx));

        let uri = playlist
            .add_entry(PlaylistEntry::new(Uri::file("/a")), true)
            .unwrap();
        let set = UriSet::from([uri.clone()]);
        assert_eq!(playlist.remove_entries(&set, true).unwrap(), 1);

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                PlaylistEvent::ResourcesAdded { uris: set.clone(), before: true },
                PlaylistEvent::ResourcesAdded { uris: set.clone(), before: false },
                PlaylistEvent::ResourcesRemoved { uris: set.clone(), before: true },
                PlaylistEvent::ResourcesRemoved { uris: set, before: false },
            ]
        );
        assert!(ids.borrow().is_empty());
    }

    #[test]
    fn preassigned_id_is_reused() {
        let (mut playlist, ids, _) = playlist(&[]);
        let uri = Uri::file("/a").with_unique_id(UniqueId(42));
        let added = playlist.add_entry(PlaylistEntry::new(uri.clone()), false).unwrap();
        assert_eq!(added, uri);
        assert!(ids.borrow().contains(UniqueId(42)));

        let mut other = FlatPlaylist::new("other", ids.clone());
        let err = other
            .add_entry(PlaylistEntry::new(Uri::file("/b").with_unique_id(UniqueId(42))), false)
            .unwrap_err();
        assert!(matches!(err, PlaylistError::DuplicateId { .. }));
    }

    #[test]
    fn malformed_id_option_is_rejected() {
        let (mut playlist, _ids, _) = playlist(&[]);
        let uri = Uri::file("/a").with_option("id", "abc");
        assert!(matches!(
            playlist.add_entry(PlaylistEntry::new(uri), false),
            Err(PlaylistError::InvalidId(_))
        ));
    }

    #[test]
    fn failed_batch_releases_claimed_ids() {
        let (mut playlist, ids, uris) = playlist(&["/a"]);
        let batch = vec![
            PlaylistEntry::new(Uri::file("/b")),
            PlaylistEntry::new(uris[0].clone()),
        ];
        assert!(playlist.add_entries(batch, true).is_err());
        assert_eq!(ids.borrow().len(), 1);
        assert_eq!(playlist.len(), 1);
    }

    #[test]
    fn dropping_the_playlist_releases_ids() {
        let (playlist, ids, _) = playlist(&["/a", "/b"]);
        drop(playlist);
        assert!(ids.borrow().is_empty());
    }

    #[test]
    fn mark_incompatible_keeps_the_entry() {
        let (mut playlist, _ids, uris) = playlist(&["/a"]);
        let (tx, rx) = mpsc::channel();
        playlist.subscribe(channel_observer(tx));
        assert!(playlist.mark_backend_resource_incompatibility(&uris[0], "tandem-playback"));
        assert!(playlist.entry(&uris[0]).unwrap().incompatible);
        assert_eq!(playlist.len(), 1);
        assert_eq!(
            rx.try_recv().unwrap(),
            PlaylistEvent::ResourceIncompatible {
                uri: uris[0].clone(),
                backend_type: "tandem-playback".into()
            }
        );
    }

    #[test]
    fn save_then_load_keeps_ids() {
        let (mut playlist, ids, uris) = playlist(&["/a", "/b"]);
        playlist.set_repeating(true);
        playlist
            .set_resource_metadata(&uris[1], Metadata::from(json!({"title": "B"})))
            .unwrap();
        let doc = playlist.save_to();
        drop(playlist);

        let mut restored = FlatPlaylist::new("", ids.clone());
        let report = restored.load_from(&doc).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.loaded, 2);
        assert_eq!(restored.name(), "test");
        assert!(restored.is_repeating());
        assert_eq!(restored.entries()[0].uri, uris[0]);
        assert_eq!(restored.metadata_for(&uris[1]).title(), Some("B"));
        assert_eq!(ids.borrow().len(), 2);
    }

    #[test]
    fn load_skips_bad_entries_and_signals_once() {
        let ids = UniqueIdAllocator::seeded(1).shared();
        let mut playlist = FlatPlaylist::new("x", ids);
        let (tx, rx) = mpsc::channel();
        playlist.subscribe(channel_observer(tx));

        let doc = json!({
            "name": "mixed",
            "type": "flat",
            "repeating": false,
            "entries": [
                {"uri": "file:///ok?id=5", "metadata": {"title": "ok"}},
                {"uri": "no-separator"},
                {"metadata": {}},
                {"uri": "file:///dup?id=5"},
                {"uri": "file:///fresh", "incompatible": true}
            ]
        });
        let report = playlist.load_from(&doc).unwrap();
        assert_eq!(report.loaded, 2);
        let skipped: Vec<_> = report.issues.iter().filter_map(|i| i.index).collect();
        assert_eq!(skipped, vec![1, 2, 3]);
        assert!(playlist.entries()[1].incompatible);
        assert!(playlist.entries()[1].uri.unique_id().is_some());

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                PlaylistEvent::AllResourcesChanged { before: true },
                PlaylistEvent::AllResourcesChanged { before: false },
            ]
        );
    }

    #[test]
    fn load_rejects_foreign_documents() {
        let (mut playlist, _ids, _) = playlist(&["/a"]);
        assert!(matches!(
            playlist.load_from(&json!([])),
            Err(PlaylistError::InvalidDocument(_))
        ));
        assert!(matches!(
            playlist.load_from(&json!({"type": "smart"})),
            Err(PlaylistError::InvalidDocument(_))
        ));
        assert_eq!(playlist.len(), 1);
    }
}
