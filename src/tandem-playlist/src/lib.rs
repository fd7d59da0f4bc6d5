//! Playlist data model: URI-indexed entries, change notifications, derived
//! views and the set that owns them.

mod entry;
mod filtered;
mod flat;
mod playlist;
mod set;
mod store;

pub use entry::{EntryContainer, PlaylistEntry, UriSet};
pub use filtered::{FilteredPlaylist, ResourceFilter};
pub use flat::{FlatPlaylist, LoadIssue, LoadReport, FLAT_TYPE};
pub use playlist::{
    channel_observer, EventForwarder, Playlist, PlaylistError, PlaylistEvent, PlaylistKind,
    PlaylistObserver,
};
pub use set::{PlaylistKey, PlaylistSet, SetEvent};
pub use store::{PlaylistStore, StoreError, StoreResult};
