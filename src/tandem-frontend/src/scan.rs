//! Serialized metadata scanning through one scanner process at a time.
//!
//! [`ScanSupervisor`] owns the request queue and the watchdog. It never
//! touches a process itself: the runtime carries out the [`ScanAction`]s it
//! asks for and feeds back process lines, exits and timer ticks.

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tandem_core::metadata::TITLE_KEY;
use tandem_core::{Metadata, ScanConfig, Uri, SUB_RESOURCE_INDEX_OPTION};
use tandem_playlist::{Playlist, PlaylistEntry, PlaylistKey, PlaylistSet};
use tandem_protocol::{Message, ProcessExit, ResourceErrorKind, ScanEvent};

pub const DEFAULT_WATCHDOG: Duration = Duration::from_secs(2);
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(30);
/// Largest track count a multi-track container may announce.
pub const MAX_SUB_RESOURCES: u64 = 4096;

/// What the runtime should do with the scanner process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanAction {
    /// Start a scanner for this resource.
    Spawn(Uri),
    /// Ask the running scanner to quit.
    Terminate,
    /// Force the running scanner down.
    Kill,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanReport {
    Added { playlist: PlaylistKey, uri: Uri },
    ResourceError { uri: Uri, kind: ResourceErrorKind },
    /// Result for a playlist that no longer exists.
    Dropped { uri: Uri },
    GeneralError { message: String },
    Crashed { uri: Uri, exit: ProcessExit },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ScanRequest {
    playlist: PlaylistKey,
    uri: Uri,
}

#[derive(Debug)]
struct InFlight {
    request: ScanRequest,
    watchdog: Option<Instant>,
    kill_at: Option<Instant>,
    target_removed: bool,
}

#[derive(Debug)]
pub struct ScanSupervisor {
    queue: VecDeque<ScanRequest>,
    running: Option<InFlight>,
    watchdog_timeout: Duration,
    kill_timeout: Duration,
    actions: Vec<ScanAction>,
    reports: Vec<ScanReport>,
}

impl Default for ScanSupervisor {
    fn default() -> Self {
        Self::new(DEFAULT_WATCHDOG, DEFAULT_KILL_TIMEOUT)
    }
}

impl From<&ScanConfig> for ScanSupervisor {
    fn from(config: &ScanConfig) -> Self {
        Self::new(config.watchdog(), config.kill_timeout())
    }
}

impl ScanSupervisor {
    pub fn new(watchdog_timeout: Duration, kill_timeout: Duration) -> Self {
        Self {
            queue: VecDeque::new(),
            running: None,
            watchdog_timeout,
            kill_timeout,
            actions: Vec::new(),
            reports: Vec::new(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.running.is_none()
    }

    /// Idle with nothing left to scan.
    pub fn is_finished(&self) -> bool {
        self.running.is_none() && self.queue.is_empty()
    }

    /// Resource being scanned right now.
    pub fn current(&self) -> Option<&Uri> {
        self.running.as_ref().map(|flight| &flight.request.uri)
    }

    /// Queued resources, in scan order.
    pub fn queued(&self) -> impl Iterator<Item = &Uri> {
        self.queue.iter().map(|request| &request.uri)
    }

    pub fn take_actions(&mut self) -> Vec<ScanAction> {
        std::mem::take(&mut self.actions)
    }

    pub fn take_reports(&mut self) -> Vec<ScanReport> {
        std::mem::take(&mut self.reports)
    }

    pub fn enqueue(&mut self, playlist: PlaylistKey, uri: Uri) {
        self.queue.push_back(ScanRequest { playlist, uri });
        if self.running.is_none() {
            self.start_next();
        }
    }

    /// Drop everything queued. A scan in flight runs to completion.
    pub fn cancel_scan(&mut self) {
        let dropped = self.queue.len();
        self.queue.clear();
        tracing::debug!(dropped, "scan queue cancelled");
    }

    pub fn playlist_removed(&mut self, key: PlaylistKey) {
        self.queue.retain(|request| request.playlist != key);
        if let Some(flight) = &mut self.running {
            if flight.request.playlist == key {
                flight.target_removed = true;
            }
        }
    }

    fn start_next(&mut self) {
        let Some(request) = self.queue.pop_front() else {
            tracing::debug!("scan queue drained");
            return;
        };
        tracing::debug!(uri = %request.uri, playlist = %request.playlist, "starting scan");
        self.actions.push(ScanAction::Spawn(request.uri.clone()));
        self.running = Some(InFlight {
            request,
            watchdog: None,
            kill_at: None,
            target_removed: false,
        });
    }

    /// The scanner for the current request is up.
    pub fn process_started(&mut self, now: Instant) {
        let timeout = self.watchdog_timeout;
        if let Some(flight) = &mut self.running {
            flight.watchdog = Some(now + timeout);
        }
    }

    pub fn spawn_failed(&mut self, error: impl Into<String>) {
        let Some(flight) = self.running.take() else {
            return;
        };
        let message = format!("failed to start scanner for {}: {}", flight.request.uri, error.into());
        tracing::warn!(%message);
        self.reports.push(ScanReport::GeneralError { message });
        self.start_next();
    }

    /// One line of scanner output.
    pub fn handle_line(&mut self, set: &mut PlaylistSet, line: &str, now: Instant) {
        let timeout = self.watchdog_timeout;
        let Some(flight) = &mut self.running else {
            tracing::warn!(line, "scanner output with no scan in flight");
            return;
        };
        if flight.kill_at.is_none() {
            flight.watchdog = Some(now + timeout);
        }
        let playlist = flight.request.playlist;
        let target_removed = flight.target_removed;

        let message = Message::decode(line);
        match ScanEvent::parse(&message) {
            Ok(ScanEvent::Metadata { uri, metadata }) => {
                self.metadata_scanned(set, playlist, target_removed, uri, metadata);
                self.result_received(now);
            }
            Ok(ScanEvent::ResourceError { uri, kind }) => {
                tracing::info!(%uri, ?kind, "scanner rejected resource");
                self.reports.push(ScanReport::ResourceError { uri, kind });
                self.result_received(now);
            }
            Ok(ScanEvent::Error(message)) => {
                tracing::warn!(error = %message, "scanner reported an error");
                self.reports.push(ScanReport::GeneralError { message });
            }
            Err(err) => {
                tracing::warn!(error = %err, line, "malformed scanner line");
                self.reports.push(ScanReport::GeneralError {
                    message: format!("{err}: {line}"),
                });
            }
        }
    }

    fn metadata_scanned(
        &mut self,
        set: &mut PlaylistSet,
        playlist: PlaylistKey,
        target_removed: bool,
        uri: Uri,
        mut metadata: Metadata,
    ) {
        if !metadata.is_valid() {
            self.reject(uri, "metadata is not a JSON object".to_string());
            return;
        }
        let total = metadata.num_sub_resources();
        let min = metadata.min_sub_resource_index();

        match (uri.sub_resource_index(), total) {
            (None, Some(total)) if total > 1 => {
                if total > MAX_SUB_RESOURCES {
                    self.reject(
                        uri,
                        format!("{total} sub-resources exceed the limit of {MAX_SUB_RESOURCES}"),
                    );
                    return;
                }
                if min.checked_add(total - 1).is_none() {
                    self.reject(uri, format!("sub-resource indices starting at {min} overflow"));
                    return;
                }
                tracing::debug!(%uri, total, "expanding sub-resources");
                for index in min..=min + (total - 1) {
                    let sub = uri
                        .clone()
                        .with_option(SUB_RESOURCE_INDEX_OPTION, index.to_string());
                    self.queue.push_back(ScanRequest { playlist, uri: sub });
                }
                return;
            }
            (Some(index), Some(total)) => {
                if let Some(title) = metadata.title() {
                    let track = index.saturating_sub(min).saturating_add(1);
                    let title = format!("{title} ({track}/{total})");
                    metadata.set(TITLE_KEY, title);
                }
            }
            _ => {}
        }

        if target_removed || !set.contains(playlist) {
            tracing::debug!(%uri, "scan target playlist is gone; dropping result");
            self.reports.push(ScanReport::Dropped { uri });
            return;
        }

        let added = match set.flat_mut(playlist) {
            Some(flat) => flat
                .add_entry(PlaylistEntry::new(uri.clone()).with_metadata(metadata), true)
                .map_err(|err| err.to_string()),
            None => Err(format!("playlist {playlist} does not accept entries")),
        };
        match added {
            Ok(uri) => self.reports.push(ScanReport::Added { playlist, uri }),
            Err(message) => {
                tracing::warn!(%uri, error = %message, "could not add scanned resource");
                self.reports.push(ScanReport::GeneralError { message });
            }
        }
    }

    /// The scanner answered for its resource; ask it to exit.
    fn result_received(&mut self, now: Instant) {
        let kill_timeout = self.kill_timeout;
        let Some(flight) = &mut self.running else {
            return;
        };
        if flight.kill_at.is_none() {
            flight.watchdog = None;
            flight.kill_at = Some(now + kill_timeout);
            self.actions.push(ScanAction::Terminate);
        }
    }

    fn reject(&mut self, uri: Uri, reason: String) {
        tracing::warn!(%uri, %reason, "rejected scanner metadata");
        self.reports.push(ScanReport::GeneralError {
            message: format!("{uri}: {reason}"),
        });
    }

    /// The scanner exited. Continues with the next request either way.
    pub fn process_exited(&mut self, exit: ProcessExit) {
        let Some(flight) = self.running.take() else {
            return;
        };
        if exit.is_crash() {
            tracing::warn!(uri = %flight.request.uri, ?exit, "scanner crashed");
            self.reports.push(ScanReport::Crashed {
                uri: flight.request.uri,
                exit,
            });
        }
        self.start_next();
    }

    /// Earliest instant at which [`ScanSupervisor::on_timer`] has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let flight = self.running.as_ref()?;
        match (flight.watchdog, flight.kill_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn on_timer(&mut self, now: Instant) {
        let kill_timeout = self.kill_timeout;
        let Some(flight) = &mut self.running else {
            return;
        };
        if flight.kill_at.is_some_and(|at| now >= at) {
            tracing::warn!(uri = %flight.request.uri, "scanner ignored terminate; killing");
            flight.kill_at = None;
            self.actions.push(ScanAction::Kill);
        } else if flight.watchdog.is_some_and(|at| now >= at) {
            tracing::warn!(uri = %flight.request.uri, "scanner watchdog expired; terminating");
            flight.watchdog = None;
            flight.kill_at = Some(now + kill_timeout);
            self.actions.push(ScanAction::Terminate);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::UniqueIdAllocator;

    fn setup() -> (PlaylistSet, PlaylistKey, ScanSupervisor) {
        let mut set = PlaylistSet::new(UniqueIdAllocator::seeded(3).shared());
        let key = set.create_playlist("scanned");
        (set, key, ScanSupervisor::default())
    }

    fn metadata_line(uri: &Uri, json: &str) -> String {
        Message::new("metadata")
            .with_param(uri.to_string())
            .with_param(json)
            .encode()
    }

    #[test]
    fn enqueue_spawns_only_when_idle() {
        let (_, key, mut scan) = setup();
        scan.enqueue(key, Uri::file("/a"));
        scan.enqueue(key, Uri::file("/b"));
        assert_eq!(scan.take_actions(), vec![ScanAction::Spawn(Uri::file("/a"))]);
        assert_eq!(scan.queued().count(), 1);

        scan.process_exited(ProcessExit::Normal);
        assert_eq!(scan.take_actions(), vec![ScanAction::Spawn(Uri::file("/b"))]);
        scan.process_exited(ProcessExit::Normal);
        assert!(scan.is_finished());
        assert!(scan.take_actions().is_empty());
    }

    #[test]
    fn metadata_adds_entry() {
        let (mut set, key, mut scan) = setup();
        let uri = Uri::file("/song.flac");
        scan.enqueue(key, uri.clone());
        let now = Instant::now();
        scan.process_started(now);
        scan.handle_line(&mut set, &metadata_line(&uri, r#"{"title":"Song"}"#), now);

        let reports = scan.take_reports();
        let [ScanReport::Added { playlist, uri: added }] = reports.as_slice() else {
            panic!("unexpected reports: {reports:?}");
        };
        assert_eq!(*playlist, key);
        assert_eq!(added.path(), "/song.flac");
        assert!(added.unique_id().is_some());
        assert_eq!(set.playlist(key).unwrap().len(), 1);
    }

    #[test]
    fn sub_resource_title_is_numbered() {
        let (mut set, key, mut scan) = setup();
        let uri = Uri::file("/disc.cue").with_option(SUB_RESOURCE_INDEX_OPTION, "2");
        scan.enqueue(key, uri.clone());
        scan.handle_line(
            &mut set,
            &metadata_line(
                &uri,
                r#"{"title":"Track","num_sub_resources":3,"min_sub_resource_index":1}"#,
            ),
            Instant::now(),
        );
        let entry = &set.playlist(key).unwrap().entries()[0];
        assert_eq!(entry.metadata.title(), Some("Track (2/3)"));
    }

    #[test]
    fn resource_errors_do_not_stop_the_scan() {
        let (mut set, key, mut scan) = setup();
        let uri = Uri::file("/missing");
        scan.enqueue(key, uri.clone());
        scan.handle_line(&mut set, r#"resource_not_found "file:///missing""#, Instant::now());
        scan.handle_line(&mut set, "garbage", Instant::now());
        let reports = scan.take_reports();
        assert_eq!(
            reports[0],
            ScanReport::ResourceError {
                uri,
                kind: ResourceErrorKind::NotFound
            }
        );
        assert!(matches!(reports[1], ScanReport::GeneralError { .. }));
        assert!(!scan.is_idle());
    }

    fn scan_one(json: &str) -> (PlaylistSet, PlaylistKey, ScanSupervisor) {
        let (mut set, key, mut scan) = setup();
        let uri = Uri::file("/album.cue");
        scan.enqueue(key, uri.clone());
        scan.take_actions();
        scan.handle_line(&mut set, &metadata_line(&uri, json), Instant::now());
        (set, key, scan)
    }

    #[test]
    fn overflowing_sub_resource_indices_are_rejected() {
        let (set, key, mut scan) = scan_one(
            r#"{"num_sub_resources":2,"min_sub_resource_index":18446744073709551615}"#,
        );
        assert!(matches!(
            scan.take_reports().as_slice(),
            [ScanReport::GeneralError { message }] if message.contains("overflow")
        ));
        assert_eq!(scan.queued().count(), 0);
        assert!(set.playlist(key).unwrap().is_empty());
        assert!(!scan.is_idle());
    }

    #[test]
    fn oversized_sub_resource_count_is_rejected() {
        let (_, _, mut scan) = scan_one(r#"{"num_sub_resources":1000000000000}"#);
        assert!(matches!(
            scan.take_reports().as_slice(),
            [ScanReport::GeneralError { message }] if message.contains("limit")
        ));
        assert_eq!(scan.queued().count(), 0);
    }

    #[test]
    fn sub_resource_count_at_limit_expands() {
        let json = format!(r#"{{"num_sub_resources":{MAX_SUB_RESOURCES},"min_sub_resource_index":5}}"#);
        let (_, _, mut scan) = scan_one(&json);
        assert!(scan.take_reports().is_empty());
        let queued: Vec<_> = scan.queued().collect();
        assert_eq!(queued.len() as u64, MAX_SUB_RESOURCES);
        assert_eq!(queued[0].sub_resource_index(), Some(5));
        assert_eq!(
            queued.last().unwrap().sub_resource_index(),
            Some(5 + MAX_SUB_RESOURCES - 1)
        );
    }

    #[test]
    fn non_numeric_sub_resource_count_is_a_single_resource() {
        let (set, key, mut scan) =
            scan_one(r#"{"title":"Album","num_sub_resources":"three","min_sub_resource_index":-1}"#);
        assert!(matches!(
            scan.take_reports().as_slice(),
            [ScanReport::Added { .. }]
        ));
        assert_eq!(scan.queued().count(), 0);
        assert_eq!(set.playlist(key).unwrap().len(), 1);
    }

    #[test]
    fn non_object_metadata_is_rejected() {
        let (set, key, mut scan) = scan_one("[1,2,3]");
        assert!(matches!(
            scan.take_reports().as_slice(),
            [ScanReport::GeneralError { .. }]
        ));
        assert!(set.playlist(key).unwrap().is_empty());
    }

    #[test]
    fn huge_sub_resource_index_keeps_title_numbering_in_range() {
        let (mut set, key, mut scan) = setup();
        let uri = Uri::file("/disc.cue").with_option(SUB_RESOURCE_INDEX_OPTION, u64::MAX.to_string());
        scan.enqueue(key, uri.clone());
        scan.handle_line(
            &mut set,
            &metadata_line(&uri, r#"{"title":"T","num_sub_resources":3}"#),
            Instant::now(),
        );
        let entry = &set.playlist(key).unwrap().entries()[0];
        assert_eq!(
            entry.metadata.title(),
            Some(format!("T ({}/3)", u64::MAX).as_str())
        );
    }

    #[test]
    fn result_asks_scanner_to_quit() {
        let (mut set, key, mut scan) = setup();
        let uri = Uri::file("/a.flac");
        scan.enqueue(key, uri.clone());
        scan.enqueue(key, Uri::file("/b.flac"));
        assert_eq!(scan.take_actions(), vec![ScanAction::Spawn(uri.clone())]);
        let now = Instant::now();
        scan.process_started(now);

        scan.handle_line(&mut set, &metadata_line(&uri, "{}"), now);
        assert_eq!(scan.take_actions(), vec![ScanAction::Terminate]);
        assert_eq!(scan.next_deadline(), Some(now + DEFAULT_KILL_TIMEOUT));

        scan.handle_line(&mut set, r#"error "late""#, now);
        assert!(scan.take_actions().is_empty());

        scan.process_exited(ProcessExit::Normal);
        assert_eq!(
            scan.take_actions(),
            vec![ScanAction::Spawn(Uri::file("/b.flac"))]
        );
    }

    #[test]
    fn watchdog_terminates_then_kills() {
        let (mut set, key, mut scan) = setup();
        scan.enqueue(key, Uri::file("/slow"));
        scan.take_actions();
        let start = Instant::now();
        scan.process_started(start);
        assert_eq!(scan.next_deadline(), Some(start + DEFAULT_WATCHDOG));

        let later = start + Duration::from_secs(1);
        scan.handle_line(&mut set, r#"error "still working""#, later);
        assert_eq!(scan.next_deadline(), Some(later + DEFAULT_WATCHDOG));

        scan.on_timer(later + Duration::from_millis(500));
        assert!(scan.take_actions().is_empty());

        let expired = later + DEFAULT_WATCHDOG;
        scan.on_timer(expired);
        assert_eq!(scan.take_actions(), vec![ScanAction::Terminate]);
        assert_eq!(scan.next_deadline(), Some(expired + DEFAULT_KILL_TIMEOUT));

        scan.on_timer(expired + DEFAULT_KILL_TIMEOUT);
        assert_eq!(scan.take_actions(), vec![ScanAction::Kill]);
        assert_eq!(scan.next_deadline(), None);
    }

    #[test]
    fn crash_is_reported_and_queue_continues() {
        let (_, key, mut scan) = setup();
        scan.enqueue(key, Uri::file("/a"));
        scan.enqueue(key, Uri::file("/b"));
        scan.take_actions();
        scan.process_exited(ProcessExit::Crashed { code: Some(101) });
        assert_eq!(
            scan.take_reports(),
            vec![ScanReport::Crashed {
                uri: Uri::file("/a"),
                exit: ProcessExit::Crashed { code: Some(101) }
            }]
        );
        assert_eq!(scan.take_actions(), vec![ScanAction::Spawn(Uri::file("/b"))]);
    }

    #[test]
    fn spawn_failure_moves_on() {
        let (_, key, mut scan) = setup();
        scan.enqueue(key, Uri::file("/a"));
        scan.enqueue(key, Uri::file("/b"));
        scan.take_actions();
        scan.spawn_failed("no such file");
        assert!(matches!(
            scan.take_reports().as_slice(),
            [ScanReport::GeneralError { .. }]
        ));
        assert_eq!(scan.current(), Some(&Uri::file("/b")));
    }

    #[test]
    fn removed_playlist_purges_queue_and_drops_results() {
        let (mut set, key, mut scan) = setup();
        let other = set.create_playlist("other");
        scan.enqueue(key, Uri::file("/a"));
        scan.enqueue(key, Uri::file("/b"));
        scan.enqueue(other, Uri::file("/c"));

        set.remove_playlist(key);
        scan.playlist_removed(key);
        assert_eq!(scan.queued().collect::<Vec<_>>(), vec![&Uri::file("/c")]);

        scan.handle_line(&mut set, &metadata_line(&Uri::file("/a"), "{}"), Instant::now());
        assert_eq!(
            scan.take_reports(),
            vec![ScanReport::Dropped { uri: Uri::file("/a") }]
        );
    }

    #[test]
    fn cancel_keeps_scan_in_flight() {
        let (_, key, mut scan) = setup();
        scan.enqueue(key, Uri::file("/a"));
        scan.enqueue(key, Uri::file("/b"));
        scan.cancel_scan();
        assert_eq!(scan.current(), Some(&Uri::file("/a")));
        assert_eq!(scan.queued().count(), 0);
    }
}
