//! Playback orchestration: the frontend half of the playback protocol.
//!
//! [`PlaybackFrontend`] holds no I/O. Commands for the backend are queued and
//! collected with [`PlaybackFrontend::take_commands`]; user-facing changes are
//! collected with [`PlaybackFrontend::take_notifications`].

use tandem_core::{Metadata, PlaybackConfig, Uri};
use tandem_playlist::{Playlist, PlaylistEvent, PlaylistKey, PlaylistSet, UriSet};
use tandem_protocol::{Message, PlaybackCommand, PlaybackEvent};

/// When to give up on a resource or on the backend itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrashPolicy {
    /// Restarts that resume the current resource before it is marked incompatible.
    pub allowed_crashes: u32,
    /// Crashes without a current resource after which the backend counts as
    /// broken. `None` always restarts.
    pub idle_crash_limit: Option<u32>,
}

impl Default for CrashPolicy {
    fn default() -> Self {
        Self {
            allowed_crashes: 3,
            idle_crash_limit: None,
        }
    }
}

impl From<&PlaybackConfig> for CrashPolicy {
    fn from(config: &PlaybackConfig) -> Self {
        Self {
            allowed_crashes: config.allowed_crashes,
            idle_crash_limit: config.idle_crash_limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrontendNotification {
    CurrentUriChanged(Option<Uri>),
    CurrentMetadataChanged(Option<Metadata>),
    NewMetadata { uri: Uri, metadata: Metadata },
    ResourceIncompatible { uri: Uri, backend_type: String },
    BackendBroken { crashes: u32 },
    BackendError(String),
    ProtocolError { line: String, error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

#[derive(Debug, Default)]
pub struct PlaybackFrontend {
    current_uri: Option<Uri>,
    next_uri: Option<Uri>,
    current_metadata: Option<Metadata>,
    current_playlist: Option<PlaylistKey>,
    backend_type: String,
    crash_count: u32,
    backend_broken: bool,
    policy: CrashPolicy,
    outbox: Vec<PlaybackCommand>,
    notifications: Vec<FrontendNotification>,
}

impl PlaybackFrontend {
    pub fn new(policy: CrashPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn current_uri(&self) -> Option<&Uri> {
        self.current_uri.as_ref()
    }

    pub fn next_uri(&self) -> Option<&Uri> {
        self.next_uri.as_ref()
    }

    pub fn current_metadata(&self) -> Option<&Metadata> {
        self.current_metadata.as_ref()
    }

    pub fn current_playlist(&self) -> Option<PlaylistKey> {
        self.current_playlist
    }

    pub fn backend_type(&self) -> &str {
        &self.backend_type
    }

    pub fn crash_count(&self) -> u32 {
        self.crash_count
    }

    pub fn is_backend_broken(&self) -> bool {
        self.backend_broken
    }

    pub fn policy(&self) -> CrashPolicy {
        self.policy
    }

    /// Commands queued for the playback backend, oldest first.
    pub fn take_commands(&mut self) -> Vec<PlaybackCommand> {
        std::mem::take(&mut self.outbox)
    }

    pub fn take_notifications(&mut self) -> Vec<FrontendNotification> {
        std::mem::take(&mut self.notifications)
    }

    /// Playlist that playback follows: the one last played from, else the active one.
    fn playlist_key(&self, set: &PlaylistSet) -> Option<PlaylistKey> {
        self.current_playlist
            .filter(|key| set.contains(*key))
            .or_else(|| set.active())
    }

    fn playlist<'a>(&self, set: &'a PlaylistSet) -> Option<&'a dyn Playlist> {
        self.playlist_key(set).and_then(|key| set.playlist(key))
    }

    /// Nearest neighbour that is not flagged incompatible.
    fn playable_neighbor(playlist: &dyn Playlist, from: &Uri, direction: Direction) -> Option<Uri> {
        let mut cursor = from.clone();
        for _ in 0..playlist.len() {
            let candidate = match direction {
                Direction::Forward => playlist.succeeding_uri(&cursor)?,
                Direction::Backward => playlist.preceding_uri(&cursor)?,
            };
            if &candidate == from {
                return None;
            }
            if playlist.entry(&candidate).is_some_and(|entry| !entry.incompatible) {
                return Some(candidate);
            }
            cursor = candidate;
        }
        None
    }

    fn successor(&self, set: &PlaylistSet, uri: &Uri) -> Option<Uri> {
        self.playlist(set)
            .and_then(|playlist| Self::playable_neighbor(playlist, uri, Direction::Forward))
    }

    fn metadata_for(&self, set: &PlaylistSet, uri: &Uri) -> Metadata {
        self.playlist(set)
            .map(|playlist| playlist.metadata_for(uri))
            .unwrap_or_default()
    }

    fn send(&mut self, command: PlaybackCommand) {
        tracing::debug!(command = %command.to_message(), "queueing playback command");
        self.outbox.push(command);
    }

    fn notify(&mut self, notification: FrontendNotification) {
        self.notifications.push(notification);
    }

    fn notify_current_changed(&mut self) {
        self.notify(FrontendNotification::CurrentUriChanged(self.current_uri.clone()));
        self.notify(FrontendNotification::CurrentMetadataChanged(
            self.current_metadata.clone(),
        ));
    }

    /// Play `uri` from the playlist playback follows.
    pub fn play(&mut self, set: &PlaylistSet, uri: &Uri) {
        if self.backend_broken {
            tracing::debug!(%uri, "backend is broken; ignoring play");
            return;
        }
        self.current_playlist = self.playlist_key(set);
        let metadata = self.metadata_for(set, uri);
        let next = self
            .successor(set, uri)
            .map(|next| {
                let next_metadata = self.metadata_for(set, &next);
                (next, next_metadata)
            });
        self.send(PlaybackCommand::Play {
            uri: uri.clone(),
            metadata,
            next,
        });
    }

    /// Play `uri` from a specific playlist.
    pub fn play_in(&mut self, set: &PlaylistSet, key: PlaylistKey, uri: &Uri) {
        if set.contains(key) {
            self.current_playlist = Some(key);
        }
        self.play(set, uri);
    }

    pub fn stop(&mut self) {
        if self.backend_broken {
            tracing::debug!("backend is broken; ignoring stop");
            return;
        }
        self.send(PlaybackCommand::Stop);
    }

    pub fn move_to_next(&mut self, set: &PlaylistSet) {
        self.move_by(set, Direction::Forward);
    }

    pub fn move_to_previous(&mut self, set: &PlaylistSet) {
        self.move_by(set, Direction::Backward);
    }

    fn move_by(&mut self, set: &PlaylistSet, direction: Direction) {
        let Some(current) = self.current_uri.clone() else {
            return;
        };
        let target = self
            .playlist(set)
            .and_then(|playlist| Self::playable_neighbor(playlist, &current, direction));
        if let Some(target) = target {
            self.play(set, &target);
        }
    }

    /// Recompute the successor and tell the backend only if it changed.
    pub fn reacquire_next_resource(&mut self, set: &PlaylistSet) {
        let Some(current) = self.current_uri.clone() else {
            return;
        };
        let next = self.successor(set, &current);
        if next == self.next_uri {
            return;
        }
        match &next {
            Some(next) => self.send(PlaybackCommand::SetNextResource(next.clone())),
            None => self.send(PlaybackCommand::ClearNextResource),
        }
        self.next_uri = next;
    }

    /// Decode and apply one line from the playback backend.
    pub fn handle_message(&mut self, set: &mut PlaylistSet, message: &Message) {
        match PlaybackEvent::parse(message) {
            Ok(event) => self.handle_event(set, event),
            Err(err) => {
                tracing::warn!(error = %err, line = %message, "malformed playback event");
                self.notify(FrontendNotification::ProtocolError {
                    line: message.encode(),
                    error: err.to_string(),
                });
            }
        }
    }

    pub fn handle_event(&mut self, set: &mut PlaylistSet, event: PlaybackEvent) {
        match event {
            PlaybackEvent::Transition { old, new } => {
                tracing::debug!(?old, %new, "transition");
                self.current_metadata = Some(self.metadata_for(set, &new));
                let next = self.successor(set, &new);
                if let Some(next) = &next {
                    self.send(PlaybackCommand::SetNextResource(next.clone()));
                }
                self.current_uri = Some(new);
                self.next_uri = next;
                self.notify_current_changed();
            }
            PlaybackEvent::Started { current, next } => {
                if self.current_uri.as_ref() != Some(&current) {
                    self.crash_count = 0;
                }
                self.current_metadata = Some(self.metadata_for(set, &current));
                self.next_uri = match next {
                    Some(next) => Some(next),
                    None => {
                        let next = self.successor(set, &current);
                        if let Some(next) = &next {
                            self.send(PlaybackCommand::SetNextResource(next.clone()));
                        }
                        next
                    }
                };
                self.current_uri = Some(current);
                self.notify_current_changed();
            }
            PlaybackEvent::Stopped(uri) | PlaybackEvent::ResourceFinished(uri) => {
                tracing::debug!(%uri, "playback ended");
                self.current_uri = None;
                self.next_uri = None;
                self.current_metadata = None;
                self.notify_current_changed();
            }
            PlaybackEvent::Metadata { uri, metadata } => {
                self.notify(FrontendNotification::NewMetadata { uri, metadata });
            }
            PlaybackEvent::BackendType(backend_type) => self.backend_started(set, &backend_type),
            PlaybackEvent::Pong(echo) => tracing::trace!(?echo, "pong"),
            PlaybackEvent::Error(text) => {
                tracing::warn!(error = %text, "playback backend reported an error");
                self.notify(FrontendNotification::BackendError(text));
            }
        }
    }

    /// A (re)started backend identified itself.
    pub fn backend_started(&mut self, set: &mut PlaylistSet, backend_type: &str) {
        if backend_type != self.backend_type {
            tracing::info!(backend_type, "playback backend type changed");
            self.backend_type = backend_type.to_string();
            self.crash_count = 0;
            self.backend_broken = false;
        }
        let Some(current) = self.current_uri.clone() else {
            return;
        };

        if self.crash_count < self.policy.allowed_crashes {
            tracing::info!(uri = %current, crashes = self.crash_count, "resuming after backend restart");
            self.play(set, &current);
            return;
        }

        tracing::warn!(uri = %current, backend_type, "giving up on resource after repeated crashes");
        self.crash_count = 0;
        if let Some(key) = self.playlist_key(set) {
            set.mark_incompatible(key, &current, backend_type);
        }
        self.notify(FrontendNotification::ResourceIncompatible {
            uri: current,
            backend_type: backend_type.to_string(),
        });
        self.move_to_next(set);
    }

    /// The backend process died. Returns whether it should be restarted.
    pub fn backend_terminated(&mut self) -> bool {
        self.crash_count += 1;
        tracing::warn!(crashes = self.crash_count, "playback backend terminated");
        if self.current_uri.is_none() {
            if let Some(limit) = self.policy.idle_crash_limit {
                if self.crash_count >= limit {
                    self.backend_broken = true;
                    self.notify(FrontendNotification::BackendBroken {
                        crashes: self.crash_count,
                    });
                    return false;
                }
            }
        }
        true
    }

    /// Keep in-flight playback consistent with a mutated playlist.
    pub fn on_playlist_event(&mut self, set: &PlaylistSet, key: PlaylistKey, event: &PlaylistEvent) {
        if self.playlist_key(set) != Some(key) || event.is_before() {
            return;
        }
        match event {
            PlaylistEvent::ResourcesAdded { uris, .. } => self.resources_added(set, uris),
            PlaylistEvent::ResourcesRemoved { uris, .. } => self.resources_removed(set, uris),
            PlaylistEvent::AllResourcesChanged { .. } => self.reacquire_next_resource(set),
            PlaylistEvent::MetadataChanged { uri } => {
                if self.current_uri.as_ref() == Some(uri) {
                    self.current_metadata = Some(self.metadata_for(set, uri));
                    self.notify(FrontendNotification::CurrentMetadataChanged(
                        self.current_metadata.clone(),
                    ));
                }
            }
            PlaylistEvent::ResourceIncompatible { uri, backend_type } => {
                self.notify(FrontendNotification::ResourceIncompatible {
                    uri: uri.clone(),
                    backend_type: backend_type.clone(),
                });
            }
        }
    }

    fn resources_added(&mut self, set: &PlaylistSet, added: &UriSet) {
        let Some(current) = self.current_uri.clone() else {
            return;
        };
        let Some(successor) = self.successor(set, &current) else {
            return;
        };
        if added.contains(&successor) && self.next_uri.as_ref() != Some(&successor) {
            self.send(PlaybackCommand::SetNextResource(successor.clone()));
            self.next_uri = Some(successor);
        }
    }

    fn resources_removed(&mut self, set: &PlaylistSet, removed: &UriSet) {
        let Some(current) = self.current_uri.clone() else {
            return;
        };
        let current_removed = removed.contains(&current);
        let next_removed = self
            .next_uri
            .as_ref()
            .is_some_and(|next| removed.contains(next));

        match (current_removed, next_removed) {
            (true, true) => self.stop(),
            (true, false) => match self.next_uri.clone() {
                Some(next) => self.play(set, &next),
                None => self.stop(),
            },
            (false, true) => self.reacquire_next_resource(set),
            (false, false) => {}
        }
    }

    /// A playlist left the set; stop if playback was following it.
    pub fn on_playlist_removed(&mut self, key: PlaylistKey) {
        if self.current_playlist != Some(key) {
            return;
        }
        self.current_playlist = None;
        if self.current_uri.is_some() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tandem_core::UniqueIdAllocator;
    use tandem_playlist::PlaylistEntry;

    fn setup(paths: &[&str]) -> (PlaylistSet, PlaylistKey, Vec<Uri>) {
        let mut set = PlaylistSet::new(UniqueIdAllocator::seeded(5).shared());
        let key = set.create_playlist("main");
        let uris = set
            .flat_mut(key)
            .unwrap()
            .add_entries(
                paths.iter().map(|path| {
                    PlaylistEntry::new(Uri::file(path))
                        .with_metadata(Metadata::from(json!({ "title": path })))
                }),
                false,
            )
            .unwrap();
        set.set_active(Some(key));
        set.drain_events();
        (set, key, uris)
    }

    fn started(frontend: &mut PlaybackFrontend, set: &mut PlaylistSet, current: &Uri, next: Option<&Uri>) {
        frontend.handle_event(
            set,
            PlaybackEvent::Started {
                current: current.clone(),
                next: next.cloned(),
            },
        );
        frontend.take_commands();
        frontend.take_notifications();
    }

    #[test]
    fn play_sends_next_resource_with_metadata() {
        let (set, _, uris) = setup(&["/a", "/b"]);
        let mut frontend = PlaybackFrontend::default();
        frontend.play(&set, &uris[0]);
        assert_eq!(
            frontend.take_commands(),
            vec![PlaybackCommand::Play {
                uri: uris[0].clone(),
                metadata: Metadata::from(json!({"title": "/a"})),
                next: Some((uris[1].clone(), Metadata::from(json!({"title": "/b"})))),
            }]
        );
    }

    #[test]
    fn play_of_unknown_resource_uses_empty_metadata() {
        let (set, _, _) = setup(&["/a"]);
        let mut frontend = PlaybackFrontend::default();
        let stray = Uri::file("/elsewhere");
        frontend.play(&set, &stray);
        assert_eq!(
            frontend.take_commands(),
            vec![PlaybackCommand::Play {
                uri: stray,
                metadata: Metadata::empty(),
                next: None,
            }]
        );
    }

    #[test]
    fn started_without_next_rederives_successor() {
        let (mut set, _, uris) = setup(&["/a", "/b"]);
        let mut frontend = PlaybackFrontend::default();
        frontend.handle_event(
            &mut set,
            PlaybackEvent::Started {
                current: uris[0].clone(),
                next: None,
            },
        );
        assert_eq!(
            frontend.take_commands(),
            vec![PlaybackCommand::SetNextResource(uris[1].clone())]
        );
        assert_eq!(frontend.next_uri(), Some(&uris[1]));
        assert_eq!(
            frontend.current_metadata().and_then(Metadata::title),
            Some("/a")
        );
    }

    #[test]
    fn started_with_next_trusts_backend() {
        let (mut set, _, uris) = setup(&["/a", "/b", "/c"]);
        let mut frontend = PlaybackFrontend::default();
        frontend.handle_event(
            &mut set,
            PlaybackEvent::Started {
                current: uris[0].clone(),
                next: Some(uris[2].clone()),
            },
        );
        assert!(frontend.take_commands().is_empty());
        assert_eq!(frontend.next_uri(), Some(&uris[2]));
    }

    #[test]
    fn stopped_clears_state() {
        let (mut set, _, uris) = setup(&["/a", "/b"]);
        let mut frontend = PlaybackFrontend::default();
        started(&mut frontend, &mut set, &uris[0], Some(&uris[1]));
        frontend.handle_event(&mut set, PlaybackEvent::Stopped(uris[0].clone()));
        assert_eq!(frontend.current_uri(), None);
        assert_eq!(frontend.next_uri(), None);
        assert_eq!(frontend.current_metadata(), None);
        assert_eq!(
            frontend.take_notifications(),
            vec![
                FrontendNotification::CurrentUriChanged(None),
                FrontendNotification::CurrentMetadataChanged(None),
            ]
        );
    }

    #[test]
    fn metadata_is_forwarded_without_state_change() {
        let (mut set, _, uris) = setup(&["/a"]);
        let mut frontend = PlaybackFrontend::default();
        let metadata = Metadata::from(json!({"bitrate": 320}));
        frontend.handle_event(
            &mut set,
            PlaybackEvent::Metadata {
                uri: uris[0].clone(),
                metadata: metadata.clone(),
            },
        );
        assert_eq!(frontend.current_uri(), None);
        assert_eq!(
            frontend.take_notifications(),
            vec![FrontendNotification::NewMetadata {
                uri: uris[0].clone(),
                metadata
            }]
        );
    }

    #[test]
    fn malformed_line_is_reported_not_fatal() {
        let (mut set, _, _) = setup(&["/a"]);
        let mut frontend = PlaybackFrontend::default();
        frontend.handle_message(&mut set, &Message::decode(r#"transition "x""#));
        frontend.handle_message(&mut set, &Message::decode("bogus"));
        let notifications = frontend.take_notifications();
        assert_eq!(notifications.len(), 2);
        assert!(notifications
            .iter()
            .all(|n| matches!(n, FrontendNotification::ProtocolError { .. })));
    }

    #[test]
    fn incompatible_entries_are_skipped() {
        let (mut set, key, uris) = setup(&["/a", "/b", "/c"]);
        set.mark_incompatible(key, &uris[1], "tandem-playback");
        let mut frontend = PlaybackFrontend::default();
        started(&mut frontend, &mut set, &uris[0], None);
        assert_eq!(frontend.next_uri(), Some(&uris[2]));
    }

    #[test]
    fn fully_incompatible_repeating_playlist_has_no_successor() {
        let (mut set, key, uris) = setup(&["/a", "/b"]);
        set.flat_mut(key).unwrap().set_repeating(true);
        set.mark_incompatible(key, &uris[0], "x");
        set.mark_incompatible(key, &uris[1], "x");
        let mut frontend = PlaybackFrontend::default();
        started(&mut frontend, &mut set, &uris[0], None);
        assert_eq!(frontend.next_uri(), None);
    }

    #[test]
    fn reacquire_only_sends_on_change() {
        let (mut set, _, uris) = setup(&["/a", "/b"]);
        let mut frontend = PlaybackFrontend::default();
        started(&mut frontend, &mut set, &uris[0], Some(&uris[1]));
        frontend.reacquire_next_resource(&set);
        assert!(frontend.take_commands().is_empty());
    }

    #[test]
    fn removing_current_and_next_stops() {
        let (mut set, key, uris) = setup(&["/a", "/b", "/c"]);
        let mut frontend = PlaybackFrontend::default();
        frontend.play(&set, &uris[0]);
        started(&mut frontend, &mut set, &uris[0], Some(&uris[1]));

        let removed = UriSet::from([uris[0].clone(), uris[1].clone()]);
        set.flat_mut(key).unwrap().remove_entries(&removed, false).unwrap();
        frontend.on_playlist_event(
            &set,
            key,
            &PlaylistEvent::ResourcesRemoved { uris: removed, before: false },
        );
        assert_eq!(frontend.take_commands(), vec![PlaybackCommand::Stop]);
    }

    #[test]
    fn before_phase_is_ignored() {
        let (mut set, key, uris) = setup(&["/a", "/b"]);
        let mut frontend = PlaybackFrontend::default();
        started(&mut frontend, &mut set, &uris[0], Some(&uris[1]));
        frontend.on_playlist_event(
            &set,
            key,
            &PlaylistEvent::ResourcesRemoved {
                uris: UriSet::from([uris[0].clone()]),
                before: true,
            },
        );
        assert!(frontend.take_commands().is_empty());
    }

    #[test]
    fn restart_resumes_current_resource() {
        let (mut set, _, uris) = setup(&["/a", "/b"]);
        let mut frontend = PlaybackFrontend::default();
        frontend.play(&set, &uris[0]);
        frontend.backend_started(&mut set, "tandem-playback");
        started(&mut frontend, &mut set, &uris[0], Some(&uris[1]));

        assert!(frontend.backend_terminated());
        frontend.backend_started(&mut set, "tandem-playback");
        assert_eq!(frontend.crash_count(), 1);
        assert!(matches!(
            frontend.take_commands().as_slice(),
            [PlaybackCommand::Play { uri, .. }] if uri == &uris[0]
        ));
    }

    #[test]
    fn idle_crash_limit_marks_backend_broken() {
        let (set, _, uris) = setup(&["/a"]);
        let mut frontend = PlaybackFrontend::new(CrashPolicy {
            allowed_crashes: 3,
            idle_crash_limit: Some(2),
        });
        assert!(frontend.backend_terminated());
        assert!(!frontend.backend_terminated());
        assert!(frontend.is_backend_broken());
        assert!(frontend
            .take_notifications()
            .contains(&FrontendNotification::BackendBroken { crashes: 2 }));

        frontend.play(&set, &uris[0]);
        frontend.stop();
        assert!(frontend.take_commands().is_empty());
    }

    #[test]
    fn idle_crashes_restart_by_default() {
        let mut frontend = PlaybackFrontend::default();
        for _ in 0..10 {
            assert!(frontend.backend_terminated());
        }
        assert!(!frontend.is_backend_broken());
    }

    #[test]
    fn new_backend_type_clears_broken_state() {
        let (mut set, _, _) = setup(&["/a"]);
        let mut frontend = PlaybackFrontend::new(CrashPolicy {
            allowed_crashes: 1,
            idle_crash_limit: Some(1),
        });
        frontend.backend_started(&mut set, "first");
        assert!(!frontend.backend_terminated());
        frontend.backend_started(&mut set, "second");
        assert!(!frontend.is_backend_broken());
        assert_eq!(frontend.crash_count(), 0);
        assert_eq!(frontend.backend_type(), "second");
    }

    #[test]
    fn removed_playlist_stops_playback() {
        let (mut set, key, uris) = setup(&["/a", "/b"]);
        let mut frontend = PlaybackFrontend::default();
        frontend.play(&set, &uris[0]);
        started(&mut frontend, &mut set, &uris[0], Some(&uris[1]));
        frontend.on_playlist_removed(key);
        assert_eq!(frontend.take_commands(), vec![PlaybackCommand::Stop]);
        assert_eq!(frontend.current_playlist(), None);
    }
}
