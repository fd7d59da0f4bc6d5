use crate::entry::{EntryContainer, PlaylistEntry, UriSet};
use crate::playlist::{Observers, Playlist, PlaylistError, PlaylistEvent, PlaylistKind, PlaylistObserver};
use crate::set::PlaylistKey;
use std::collections::BTreeMap;
use tandem_core::{Metadata, Uri};

const TEXT_FIELDS: [&str; 3] = ["title", "artist", "album"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceFilter {
    All,
    /// Case-insensitive match on title, artist, album or path.
    Text(String),
    /// Entries not flagged incompatible.
    CompatibleOnly,
}

impl ResourceFilter {
    pub fn text(needle: impl AsRef<str>) -> Self {
        ResourceFilter::Text(needle.as_ref().to_lowercase())
    }

    pub fn matches(&self, entry: &PlaylistEntry) -> bool {
        match self {
            ResourceFilter::All => true,
            ResourceFilter::CompatibleOnly => !entry.incompatible,
            ResourceFilter::Text(needle) => {
                let needle = needle.to_lowercase();
                TEXT_FIELDS
                    .iter()
                    .filter_map(|field| entry.metadata.str_field(field))
                    .chain(std::iter::once(entry.uri.path()))
                    .any(|haystack| haystack.to_lowercase().contains(&needle))
            }
        }
    }
}

/// Read-only view over the flat playlists of a set.
///
/// Holds copies of the matching entries keyed by URI together with the
/// playlist each came from. [`FilteredPlaylist::rebuild`] recomputes the view
/// and reports the difference as ordinary add/remove notifications.
#[derive(Debug)]
pub struct FilteredPlaylist {
    name: String,
    filter: ResourceFilter,
    sources: Option<Vec<PlaylistKey>>,
    repeating: bool,
    entries: EntryContainer,
    origins: BTreeMap<Uri, PlaylistKey>,
    observers: Observers,
}

impl FilteredPlaylist {
    /// A view over every flat playlist of the set.
    pub fn new(name: impl Into<String>, filter: ResourceFilter) -> Self {
        Self {
            name: name.into(),
            filter,
            sources: None,
            repeating: false,
            entries: EntryContainer::new(),
            origins: BTreeMap::new(),
            observers: Observers::default(),
        }
    }

    /// Restrict the view to the listed playlists.
    pub fn with_sources(mut self, sources: Vec<PlaylistKey>) -> Self {
        self.sources = Some(sources);
        self
    }

    pub fn filter(&self) -> &ResourceFilter {
        &self.filter
    }

    /// Takes effect at the next rebuild.
    pub fn set_filter(&mut self, filter: ResourceFilter) {
        self.filter = filter;
    }

    pub fn set_repeating(&mut self, repeating: bool) {
        self.repeating = repeating;
    }

    pub fn includes(&self, key: PlaylistKey) -> bool {
        self.sources
            .as_ref()
            .map_or(true, |sources| sources.contains(&key))
    }

    /// Playlist that owns the original of `uri`.
    pub fn origin(&self, uri: &Uri) -> Option<PlaylistKey> {
        self.origins.get(uri).copied()
    }

    /// Recompute the view from `(playlist, entries)` pairs in set order.
    pub fn rebuild<'a, I>(&mut self, snapshot: I)
    where
        I: IntoIterator<Item = (PlaylistKey, &'a [PlaylistEntry])>,
    {
        let mut fresh = EntryContainer::new();
        let mut origins = BTreeMap::new();
        for (key, entries) in snapshot {
            if !self.includes(key) {
                continue;
            }
            for entry in entries.iter().filter(|entry| self.filter.matches(entry)) {
                if fresh.push(entry.clone()).is_ok() {
                    origins.insert(entry.uri.clone(), key);
                }
            }
        }

        let removed: UriSet = self
            .entries
            .iter()
            .filter(|entry| !fresh.contains(&entry.uri))
            .map(|entry| entry.uri.clone())
            .collect();
        let added: UriSet = fresh
            .iter()
            .filter(|entry| !self.entries.contains(&entry.uri))
            .map(|entry| entry.uri.clone())
            .collect();
        let changed: Vec<Uri> = fresh
            .iter()
            .filter(|entry| {
                self.entries
                    .get(&entry.uri)
                    .is_some_and(|previous| previous != *entry)
            })
            .map(|entry| entry.uri.clone())
            .collect();

        if !removed.is_empty() {
            self.observers.removed(&removed, true);
            self.entries.remove_all(&removed);
            self.observers.removed(&removed, false);
        }
        if added.is_empty() {
            self.entries = fresh;
        } else {
            self.observers.added(&added, true);
            self.entries = fresh;
            self.observers.added(&added, false);
        }
        self.origins = origins;
        for uri in changed {
            self.observers.emit(&PlaylistEvent::MetadataChanged { uri });
        }

        tracing::trace!(
            view = %self.name,
            entries = self.entries.len(),
            added = added.len(),
            removed = removed.len(),
            "rebuilt filtered playlist"
        );
    }

    fn read_only(&self) -> PlaylistError {
        PlaylistError::ReadOnly(self.name.clone())
    }
}

impl Playlist for FilteredPlaylist {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PlaylistKind {
        PlaylistKind::Filtered
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
        self.observers.emit(&PlaylistEvent::ResourceIncompatible {
            uri: uri.clone(),
            backend_type: backend_type.to_string(),
        });
        true
    }

    fn add_entry(&mut self, _entry: PlaylistEntry, _emit: bool) -> Result<Uri, PlaylistError> {
        Err(self.read_only())
    }

    fn remove_entries(&mut self, _uris: &UriSet, _emit: bool) -> Result<usize, PlaylistError> {
        Err(self.read_only())
    }

    fn set_resource_metadata(&mut self, _uri: &Uri, _metadata: Metadata) -> Result<bool, PlaylistError> {
        Err(self.read_only())
    }

    fn subscribe(&mut self, observer: Box<dyn PlaylistObserver>) {
        self.observers.subscribe(observer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playlist::channel_observer;
    use serde_json::json;
    use std::sync::mpsc;

    fn entry(path: &str, title: &str) -> PlaylistEntry {
        PlaylistEntry::new(Uri::file(path)).with_metadata(Metadata::from(json!({ "title": title })))
    }

    #[test]
    fn text_filter_is_case_insensitive() {
        let filter = ResourceFilter::text("BLUE");
        assert!(filter.matches(&entry("/a.flac", "Kind of Blue")));
        assert!(filter.matches(&entry("/music/blue/b.flac", "Other")));
        assert!(!filter.matches(&entry("/c.flac", "Red")));
    }

    #[test]
    fn rebuild_reports_differences() {
        let first = PlaylistKey::from_raw(1);
        let second = PlaylistKey::from_raw(2);
        let a = entry("/a", "blue a");
        let b = entry("/b", "red b");
        let c = entry("/c", "blue c");

        let mut view = FilteredPlaylist::new("blue", ResourceFilter::text("blue"));
        let initial = vec![a.clone(), b.clone()];
        view.rebuild([(first, initial.as_slice())]);
        assert_eq!(view.len(), 1);
        assert_eq!(view.origin(&a.uri), Some(first));

        let (tx, rx) = mpsc::channel();
        view.subscribe(channel_observer(tx));
        let left = vec![b.clone()];
        let right = vec![c.clone()];
        view.rebuild([(first, left.as_slice()), (second, right.as_slice())]);

        let removed = UriSet::from([a.uri.clone()]);
        let added = UriSet::from([c.uri.clone()]);
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                PlaylistEvent::ResourcesRemoved { uris: removed.clone(), before: true },
                PlaylistEvent::ResourcesRemoved { uris: removed, before: false },
                PlaylistEvent::ResourcesAdded { uris: added.clone(), before: true },
                PlaylistEvent::ResourcesAdded { uris: added, before: false },
            ]
        );
        assert_eq!(view.entries()[0].uri, c.uri);
        assert_eq!(view.origin(&c.uri), Some(second));
    }

    #[test]
    fn sources_restrict_the_view() {
        let first = PlaylistKey::from_raw(1);
        let second = PlaylistKey::from_raw(2);
        let left = vec![entry("/a", "a")];
        let right = vec![entry("/b", "b")];
        let mut view = FilteredPlaylist::new("only second", ResourceFilter::All).with_sources(vec![second]);
        view.rebuild([(first, left.as_slice()), (second, right.as_slice())]);
        assert_eq!(view.len(), 1);
        assert_eq!(view.entries()[0].uri, Uri::file("/b"));
    }

    #[test]
    fn compatible_only_drops_flagged_entries() {
        let key = PlaylistKey::from_raw(1);
        let mut flagged = entry("/a", "a");
        flagged.incompatible = true;
        let entries = vec![flagged, entry("/b", "b")];
        let mut view = FilteredPlaylist::new("playable", ResourceFilter::CompatibleOnly);
        view.rebuild([(key, entries.as_slice())]);
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn view_is_read_only() {
        let mut view = FilteredPlaylist::new("v", ResourceFilter::All);
        assert!(matches!(
            view.add_entry(entry("/a", "a"), true),
            Err(PlaylistError::ReadOnly(_))
        ));
        assert!(matches!(
            view.remove_entries(&UriSet::new(), true),
            Err(PlaylistError::ReadOnly(_))
        ));
    }
}
