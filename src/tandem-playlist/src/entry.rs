use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tandem_core::{Metadata, Uri};

/// Set of resource identifiers carried by change notifications.
pub type UriSet = BTreeSet<Uri>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistEntry {
    pub uri: Uri,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub incompatible: bool,
}

impl PlaylistEntry {
    pub fn new(uri: Uri) -> Self {
        Self {
            uri,
            metadata: Metadata::empty(),
            incompatible: false,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Entries in playback order, indexed by URI.
///
/// The sequence is authoritative for traversal. The index maps each URI to
/// its position and holds exactly one entry per URI.
#[derive(Debug, Clone, Default)]
pub struct EntryContainer {
    sequence: Vec<PlaylistEntry>,
    by_uri: BTreeMap<Uri, usize>,
}

impl EntryContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }

    pub fn contains(&self, uri: &Uri) -> bool {
        self.by_uri.contains_key(uri)
    }

    pub fn position(&self, uri: &Uri) -> Option<usize> {
        self.by_uri.get(uri).copied()
    }

    pub fn get(&self, uri: &Uri) -> Option<&PlaylistEntry> {
        self.position(uri).and_then(|index| self.sequence.get(index))
    }

    pub fn get_mut(&mut self, uri: &Uri) -> Option<&mut PlaylistEntry> {
        let index = self.position(uri)?;
        self.sequence.get_mut(index)
    }

    pub fn at(&self, index: usize) -> Option<&PlaylistEntry> {
        self.sequence.get(index)
    }

    pub fn as_slice(&self) -> &[PlaylistEntry] {
        &self.sequence
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlaylistEntry> {
        self.sequence.iter()
    }

    /// Append at the tail. Returns the entry back if its URI is already present.
    pub fn push(&mut self, entry: PlaylistEntry) -> Result<(), PlaylistEntry> {
        if self.by_uri.contains_key(&entry.uri) {
            return Err(entry);
        }
        self.by_uri.insert(entry.uri.clone(), self.sequence.len());
        self.sequence.push(entry);
        Ok(())
    }

    /// Remove every entry whose URI is in `uris`, keeping the order of the rest.
    pub fn remove_all(&mut self, uris: &UriSet) -> Vec<PlaylistEntry> {
        if !uris.iter().any(|uri| self.by_uri.contains_key(uri)) {
            return Vec::new();
        }
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.sequence)
            .into_iter()
            .partition(|entry| uris.contains(&entry.uri));
        self.sequence = kept;
        self.reindex();
        removed
    }

    pub fn clear(&mut self) -> Vec<PlaylistEntry> {
        self.by_uri.clear();
        std::mem::take(&mut self.sequence)
    }

    fn reindex(&mut self) {
        self.by_uri = self
            .sequence
            .iter()
            .enumerate()
            .map(|(index, entry)| (entry.uri.clone(), index))
            .collect();
    }
}

impl FromIterator<PlaylistEntry> for EntryContainer {
    /// Later duplicates of a URI are dropped.
    fn from_iter<I: IntoIterator<Item = PlaylistEntry>>(iter: I) -> Self {
        let mut container = EntryContainer::new();
        for entry in iter {
            let _ = container.push(entry);
        }
        container
    }
}
