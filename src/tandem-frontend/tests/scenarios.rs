use std::time::Instant;
use tandem_core::{Metadata, UniqueIdAllocator, Uri, SUB_RESOURCE_INDEX_OPTION};
use tandem_frontend::{CrashPolicy, ScanAction, ScanReport, ScanSupervisor, Session};
use tandem_playlist::{Playlist, PlaylistEntry, PlaylistKey, PlaylistSet, UriSet};
use tandem_protocol::{Message, PlaybackCommand, PlaybackEvent, ProcessExit, ScanEvent};

fn session_with(paths: &[&str]) -> (Session, PlaylistKey, Vec<Uri>) {
    let mut session = Session::new(
        PlaylistSet::new(UniqueIdAllocator::seeded(42).shared()),
        CrashPolicy::default(),
        ScanSupervisor::default(),
    );
    let key = session.playlists.create_playlist("main");
    let uris = session
        .playlists
        .flat_mut(key)
        .unwrap()
        .add_entries(paths.iter().map(|path| PlaylistEntry::new(Uri::file(path))), true)
        .unwrap();
    session.playlists.set_active(Some(key));
    session.dispatch_events();
    (session, key, uris)
}

fn backend_says(session: &mut Session, event: PlaybackEvent) {
    session.handle_playback_line(&event.to_message().encode());
}

fn start_playing(session: &mut Session, current: &Uri, next: Option<&Uri>) {
    session.playback.play(&session.playlists, current);
    backend_says(
        session,
        PlaybackEvent::Started {
            current: current.clone(),
            next: next.cloned(),
        },
    );
    session.playback.take_commands();
}

fn remove(session: &mut Session, key: PlaylistKey, uris: &[&Uri]) {
    let uris: UriSet = uris.iter().map(|uri| (*uri).clone()).collect();
    session
        .playlists
        .flat_mut(key)
        .unwrap()
        .remove_entries(&uris, true)
        .unwrap();
    session.dispatch_events();
}

#[test]
fn transition_advances_next_resource() {
    let (mut session, _, uris) = session_with(&["/a", "/b", "/c"]);
    let (a, b, c) = (&uris[0], &uris[1], &uris[2]);

    session.playback.play(&session.playlists, a);
    assert!(matches!(
        session.playback.take_commands().as_slice(),
        [PlaybackCommand::Play { uri, next: Some((next, _)), .. }] if uri == a && next == b
    ));

    backend_says(
        &mut session,
        PlaybackEvent::Transition {
            old: Some(a.clone()),
            new: b.clone(),
        },
    );
    assert_eq!(session.playback.current_uri(), Some(b));
    assert_eq!(session.playback.next_uri(), Some(c));
    assert_eq!(
        session.playback.take_commands(),
        vec![PlaybackCommand::SetNextResource(c.clone())]
    );
}

#[test]
fn removing_next_clears_it() {
    let (mut session, key, uris) = session_with(&["/a", "/b"]);
    start_playing(&mut session, &uris[0], Some(&uris[1]));

    remove(&mut session, key, &[&uris[1]]);
    assert_eq!(
        session.playback.take_commands(),
        vec![PlaybackCommand::ClearNextResource]
    );
    assert_eq!(session.playback.next_uri(), None);
    assert_eq!(session.playback.current_uri(), Some(&uris[0]));
}

#[test]
fn removing_current_plays_next() {
    let (mut session, key, uris) = session_with(&["/a", "/b"]);
    start_playing(&mut session, &uris[0], Some(&uris[1]));

    remove(&mut session, key, &[&uris[0]]);
    assert!(matches!(
        session.playback.take_commands().as_slice(),
        [PlaybackCommand::Play { uri, .. }] if uri == &uris[1]
    ));
}

#[test]
fn removing_current_and_next_stops() {
    let (mut session, key, uris) = session_with(&["/a", "/b", "/c"]);
    start_playing(&mut session, &uris[0], Some(&uris[1]));

    remove(&mut session, key, &[&uris[0], &uris[1]]);
    assert_eq!(session.playback.take_commands(), vec![PlaybackCommand::Stop]);
}

#[test]
fn unrelated_removal_sends_nothing() {
    let (mut session, key, uris) = session_with(&["/a", "/b", "/c"]);
    start_playing(&mut session, &uris[0], Some(&uris[1]));

    remove(&mut session, key, &[&uris[2]]);
    assert!(session.playback.take_commands().is_empty());
}

#[test]
fn appending_after_last_resource_sets_next() {
    let (mut session, key, uris) = session_with(&["/a"]);
    start_playing(&mut session, &uris[0], None);
    assert_eq!(session.playback.next_uri(), None);

    let added = session
        .playlists
        .flat_mut(key)
        .unwrap()
        .add_entry(PlaylistEntry::new(Uri::file("/b")), true)
        .unwrap();
    session.dispatch_events();
    assert_eq!(
        session.playback.take_commands(),
        vec![PlaybackCommand::SetNextResource(added.clone())]
    );
    assert_eq!(session.playback.next_uri(), Some(&added));
}

#[test]
fn multi_track_resource_expands_into_sub_resources() {
    let (mut session, key, _) = session_with(&[]);
    let original = Uri::file("/album.cue");
    session.scanner.enqueue(key, original.clone());
    assert_eq!(
        session.scanner.take_actions(),
        vec![ScanAction::Spawn(original.clone())]
    );
    let now = Instant::now();
    session.scanner.process_started(now);

    let line = ScanEvent::Metadata {
        uri: original.clone(),
        metadata: Metadata::parse_json(
            r#"{"title":"Album","num_sub_resources":3,"min_sub_resource_index":0}"#,
        )
        .unwrap(),
    }
    .to_message()
    .encode();
    session.handle_scan_line(&line, now);

    let queued: Vec<&Uri> = session.scanner.queued().collect();
    assert_eq!(queued.len(), 3);
    for (n, uri) in queued.iter().enumerate() {
        assert_eq!(uri.path(), "/album.cue");
        assert_eq!(
            uri.option(SUB_RESOURCE_INDEX_OPTION),
            Some(n.to_string().as_str())
        );
    }
    assert!(session.playlists.playlist(key).unwrap().is_empty());
    assert!(session.scanner.take_reports().is_empty());
}

#[test]
fn malformed_scanner_metadata_is_reported_and_scan_continues() {
    let (mut session, key, _) = session_with(&[]);
    let broken = [
        r#"{"num_sub_resources":2,"min_sub_resource_index":18446744073709551615}"#,
        r#"{"num_sub_resources":1000000000000}"#,
        r#""just a string""#,
    ];
    let uris: Vec<Uri> = (0..broken.len())
        .map(|n| Uri::file(format!("/broken{n}.cue")))
        .collect();
    for uri in &uris {
        session.scanner.enqueue(key, uri.clone());
    }

    let now = Instant::now();
    for (uri, json) in uris.iter().zip(broken) {
        assert_eq!(
            session.scanner.take_actions(),
            vec![ScanAction::Spawn(uri.clone())]
        );
        session.scanner.process_started(now);
        let line = Message::new("metadata")
            .with_param(uri.to_string())
            .with_param(json)
            .encode();
        session.handle_scan_line(&line, now);

        assert!(matches!(
            session.scanner.take_reports().as_slice(),
            [ScanReport::GeneralError { .. }]
        ));
        assert_eq!(session.scanner.take_actions(), vec![ScanAction::Terminate]);
        session.scanner.process_exited(ProcessExit::Normal);
    }

    assert!(session.scanner.is_finished());
    assert!(session.playlists.playlist(key).unwrap().is_empty());
}

#[test]
fn repeated_crashes_mark_resource_incompatible() {
    let (mut session, key, uris) = session_with(&["/a", "/b"]);
    session.playback_backend_started("x");
    start_playing(&mut session, &uris[0], Some(&uris[1]));

    let allowed = session.playback.policy().allowed_crashes;
    for _ in 0..allowed - 1 {
        assert!(session.playback.backend_terminated());
        session.playback_backend_started("x");
        session.playback.take_commands();
    }
    assert!(session.playback.backend_terminated());
    assert_eq!(session.playback.crash_count(), allowed);

    session.playback_backend_started("x");
    let entry = session.playlists.playlist(key).unwrap().entry(&uris[0]).unwrap();
    assert!(entry.incompatible);
    assert!(matches!(
        session.playback.take_commands().as_slice(),
        [PlaybackCommand::Play { uri, .. }] if uri == &uris[1]
    ));
}

#[test]
fn backend_type_reply_reports_start() {
    let (mut session, _, _) = session_with(&["/a"]);
    session.handle_playback_line(
        &Message::new("backend_type").with_param("tandem-playback").encode(),
    );
    assert_eq!(session.playback.backend_type(), "tandem-playback");
}
