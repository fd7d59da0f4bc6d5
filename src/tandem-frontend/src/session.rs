use crate::playback::{CrashPolicy, PlaybackFrontend};
use crate::scan::ScanSupervisor;
use std::time::Instant;
use tandem_core::{Config, SharedIdAllocator};
use tandem_playlist::{LoadReport, PlaylistSet, PlaylistStore, SetEvent, StoreResult};
use tandem_protocol::Message;

/// Playlists plus the two orchestrators that react to their changes.
#[derive(Debug)]
pub struct Session {
    pub playlists: PlaylistSet,
    pub playback: PlaybackFrontend,
    pub scanner: ScanSupervisor,
}

impl Default for Session {
    fn default() -> Self {
        Self::new(PlaylistSet::default(), CrashPolicy::default(), ScanSupervisor::default())
    }
}

impl Session {
    pub fn new(playlists: PlaylistSet, policy: CrashPolicy, scanner: ScanSupervisor) -> Self {
        Self {
            playlists,
            playback: PlaybackFrontend::new(policy),
            scanner,
        }
    }

    pub fn from_config(config: &Config, ids: SharedIdAllocator) -> Self {
        Self::new(
            PlaylistSet::new(ids),
            CrashPolicy::from(&config.playback),
            ScanSupervisor::from(&config.scan),
        )
    }

    /// Route queued playlist changes until the set is quiet.
    ///
    /// Changes to flat playlists refresh the filtered views, whose own
    /// notifications are routed on the next pass.
    pub fn dispatch_events(&mut self) {
        loop {
            let events = self.playlists.drain_events();
            if events.is_empty() {
                return;
            }
            let mut refresh = false;
            for event in events {
                match event {
                    SetEvent::Playlist { key, event } => {
                        if self.playlists.flat(key).is_some() && !event.is_before() {
                            refresh = true;
                        }
                        self.playback.on_playlist_event(&self.playlists, key, &event);
                    }
                    SetEvent::PlaylistRemoved(key) => {
                        self.playback.on_playlist_removed(key);
                        self.scanner.playlist_removed(key);
                        refresh = true;
                    }
                    SetEvent::PlaylistAdded(key) => {
                        tracing::trace!(playlist = %key, "playlist added");
                    }
                    SetEvent::ActiveChanged { previous, current } => {
                        tracing::debug!(?previous, ?current, "active playlist changed");
                    }
                }
            }
            if refresh {
                self.playlists.refresh_views();
            }
        }
    }

    pub fn handle_playback_line(&mut self, line: &str) {
        let message = Message::decode(line);
        self.playback.handle_message(&mut self.playlists, &message);
        self.dispatch_events();
    }

    pub fn handle_scan_line(&mut self, line: &str, now: Instant) {
        self.scanner.handle_line(&mut self.playlists, line, now);
        self.dispatch_events();
    }

    /// Report a playback backend restart with its type.
    pub fn playback_backend_started(&mut self, backend_type: &str) {
        self.playback.backend_started(&mut self.playlists, backend_type);
        self.dispatch_events();
    }

    pub fn persist(&self, store: &PlaylistStore) -> StoreResult<()> {
        store.save(&self.playlists)
    }

    pub fn restore(&mut self, store: &PlaylistStore) -> StoreResult<LoadReport> {
        let report = store.load(&mut self.playlists)?;
        for issue in &report.issues {
            tracing::warn!(%issue, "skipped playlist entry");
        }
        self.dispatch_events();
        Ok(report)
    }
}
