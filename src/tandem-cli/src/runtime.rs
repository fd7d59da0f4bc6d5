//! The event loop of the frontend process.
//!
//! One task owns the [`Session`] and reacts to backend output, scanner
//! deadlines and terminal input one event at a time.

use anyhow::{Context, Result};
use std::time::Instant;
use tandem_core::{BackendCommand, Uri};
use tandem_frontend::{FrontendNotification, ScanAction, ScanReport, Session};
use tandem_playlist::{Playlist, PlaylistKey, PlaylistStore};
use tandem_protocol::{commands, BackendProcess, BackendSpec, Message, ProcessEvent, ProcessExit};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Playback,
    Scanner,
}

/// Identifies one spawned process; restarts get a new generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    role: Role,
    generation: u64,
}

/// Launch description for a configured backend.
pub fn backend_spec(command: &BackendCommand) -> Result<BackendSpec> {
    let executable = match &command.executable {
        Some(path) => path.clone(),
        None => std::env::current_exe().context("cannot locate the tandem executable")?,
    };
    let mut spec = BackendSpec::new(executable);
    spec.args = command.args.clone();
    spec.env = command.env.clone();
    Ok(spec)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanSummary {
    pub added: usize,
    pub failed: usize,
    pub dropped: usize,
}

enum Wake {
    Process(Option<ProcessEvent<Tag>>),
    Timer,
    Input(Option<String>),
    Interrupt,
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

pub struct Runtime {
    session: Session,
    store: PlaylistStore,
    playback_spec: BackendSpec,
    scanner_spec: BackendSpec,
    events_tx: mpsc::UnboundedSender<ProcessEvent<Tag>>,
    events_rx: mpsc::UnboundedReceiver<ProcessEvent<Tag>>,
    playback: Option<BackendProcess<Tag>>,
    scanner: Option<BackendProcess<Tag>>,
    generation: u64,
}

impl Runtime {
    pub fn new(
        session: Session,
        store: PlaylistStore,
        playback_spec: BackendSpec,
        scanner_spec: BackendSpec,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            session,
            store,
            playback_spec,
            scanner_spec,
            events_tx,
            events_rx,
            playback: None,
            scanner: None,
            generation: 0,
        }
    }

    fn next_tag(&mut self, role: Role) -> Tag {
        self.generation += 1;
        Tag {
            role,
            generation: self.generation,
        }
    }

    fn is_live(&self, tag: Tag) -> bool {
        let process = match tag.role {
            Role::Playback => &self.playback,
            Role::Scanner => &self.scanner,
        };
        process.as_ref().is_some_and(|process| *process.tag() == tag)
    }

    /// Scan `uris` into `key`, then save the playlists.
    pub async fn scan(&mut self, key: PlaylistKey, uris: Vec<Uri>) -> Result<ScanSummary> {
        let mut summary = ScanSummary::default();
        for uri in uris {
            self.session.scanner.enqueue(key, uri);
        }
        self.apply_scan_actions().await;

        while !self.session.scanner.is_finished() || self.scanner.is_some() {
            let deadline = self.session.scanner.next_deadline();
            let wake = tokio::select! {
                event = self.events_rx.recv() => Wake::Process(event),
                _ = sleep_until(deadline) => Wake::Timer,
                _ = tokio::signal::ctrl_c() => Wake::Interrupt,
            };
            match wake {
                Wake::Process(Some(event)) => self.on_process_event(event).await?,
                Wake::Process(None) => break,
                Wake::Timer => self.session.scanner.on_timer(Instant::now()),
                Wake::Interrupt => {
                    eprintln!("interrupted; finishing the current file");
                    self.session.scanner.cancel_scan();
                }
                Wake::Input(_) => {}
            }
            self.apply_scan_actions().await;
            self.report_scan(&mut summary);
        }

        self.session.persist(&self.store)?;
        Ok(summary)
    }

    async fn apply_scan_actions(&mut self) {
        loop {
            let actions = self.session.scanner.take_actions();
            if actions.is_empty() {
                return;
            }
            for action in actions {
                match action {
                    ScanAction::Spawn(uri) => {
                        let tag = self.next_tag(Role::Scanner);
                        match BackendProcess::spawn(
                            &self.scanner_spec,
                            &[uri.to_string()],
                            tag,
                            self.events_tx.clone(),
                        ) {
                            Ok(process) => {
                                self.scanner = Some(process);
                                self.session.scanner.process_started(Instant::now());
                            }
                            Err(err) => self.session.scanner.spawn_failed(err.to_string()),
                        }
                    }
                    ScanAction::Terminate => {
                        if let Some(process) = self.scanner.as_mut() {
                            process.terminate().await;
                        }
                    }
                    ScanAction::Kill => {
                        if let Some(process) = self.scanner.as_mut() {
                            process.kill();
                        }
                    }
                }
            }
        }
    }

    fn report_scan(&mut self, summary: &mut ScanSummary) {
        for report in self.session.scanner.take_reports() {
            match report {
                ScanReport::Added { uri, .. } => {
                    summary.added += 1;
                    println!("added    {}", uri.path());
                }
                ScanReport::ResourceError { uri, kind } => {
                    summary.failed += 1;
                    println!("skipped  {} ({})", uri.path(), kind.command());
                }
                ScanReport::Dropped { .. } => summary.dropped += 1,
                ScanReport::GeneralError { message } => eprintln!("scan error: {message}"),
                ScanReport::Crashed { uri, exit } => {
                    summary.failed += 1;
                    eprintln!("scanner crashed on {} ({exit:?})", uri.path());
                }
            }
        }
    }

    /// Play entry `index` of `key` until playback ends or the user quits.
    pub async fn play(&mut self, key: PlaylistKey, index: usize) -> Result<()> {
        let uri = self
            .session
            .playlists
            .playlist(key)
            .and_then(|playlist| playlist.entry_at(index))
            .map(|entry| entry.uri.clone())
            .with_context(|| format!("playlist has no entry at index {index}"))?;
        self.session.playlists.set_active(Some(key));
        self.session.dispatch_events();

        self.start_playback_backend().await?;
        self.session.playback.play_in(&self.session.playlists, key, &uri);
        self.flush_playback().await;
        println!("commands: next, prev, stop, quit");

        let mut input = BufReader::new(tokio::io::stdin()).lines();
        let mut input_open = true;
        loop {
            let wake = tokio::select! {
                event = self.events_rx.recv() => Wake::Process(event),
                line = input.next_line(), if input_open => Wake::Input(line.ok().flatten()),
                _ = tokio::signal::ctrl_c() => Wake::Interrupt,
            };
            match wake {
                Wake::Process(Some(event)) => self.on_process_event(event).await?,
                Wake::Process(None) | Wake::Interrupt => break,
                Wake::Input(None) => input_open = false,
                Wake::Input(Some(line)) => match line.trim() {
                    "n" | "next" => self.session.playback.move_to_next(&self.session.playlists),
                    "p" | "prev" => self
                        .session
                        .playback
                        .move_to_previous(&self.session.playlists),
                    "s" | "stop" => self.session.playback.stop(),
                    "q" | "quit" => break,
                    "" => {}
                    other => eprintln!("unknown command {other:?}"),
                },
                Wake::Timer => {}
            }
            self.flush_playback().await;
            if self.report_playback() || self.session.playback.is_backend_broken() {
                break;
            }
        }

        if let Some(process) = self.playback.as_mut() {
            process.terminate().await;
        }
        self.session.persist(&self.store)?;
        Ok(())
    }

    async fn start_playback_backend(&mut self) -> Result<()> {
        let tag = self.next_tag(Role::Playback);
        let mut process = BackendProcess::spawn(&self.playback_spec, &[], tag, self.events_tx.clone())
            .context("failed to start the playback backend")?;
        process
            .send(&Message::new(commands::GET_BACKEND_TYPE))
            .await
            .context("failed to query the playback backend")?;
        self.playback = Some(process);
        Ok(())
    }

    async fn flush_playback(&mut self) {
        let queued = self.session.playback.take_commands();
        let Some(process) = self.playback.as_mut() else {
            if !queued.is_empty() {
                tracing::debug!(dropped = queued.len(), "no playback backend; dropping commands");
            }
            return;
        };
        for command in queued {
            if let Err(err) = process.send(&command.to_message()).await {
                tracing::warn!(error = %err, "failed to send playback command");
                break;
            }
        }
    }

    /// Print what changed. Returns true once nothing is playing any more.
    fn report_playback(&mut self) -> bool {
        let mut finished = false;
        for notification in self.session.playback.take_notifications() {
            match notification {
                FrontendNotification::CurrentUriChanged(uri) => finished = uri.is_none(),
                FrontendNotification::CurrentMetadataChanged(Some(metadata)) => {
                    if let Some(uri) = self.session.playback.current_uri() {
                        println!("playing  {}", metadata.title().unwrap_or(uri.path()));
                    }
                }
                FrontendNotification::CurrentMetadataChanged(None) => {}
                FrontendNotification::NewMetadata { uri, metadata } => {
                    tracing::debug!(%uri, ?metadata, "stream metadata");
                }
                FrontendNotification::ResourceIncompatible { uri, backend_type } => {
                    eprintln!("{} cannot be played by {backend_type}; skipping", uri.path());
                }
                FrontendNotification::BackendBroken { crashes } => {
                    eprintln!("playback backend crashed {crashes} times; giving up");
                }
                FrontendNotification::BackendError(message) => {
                    eprintln!("playback error: {message}");
                }
                FrontendNotification::ProtocolError { line, error } => {
                    tracing::warn!(%line, %error, "ignored playback backend line");
                }
            }
        }
        finished
    }

    async fn on_process_event(&mut self, event: ProcessEvent<Tag>) -> Result<()> {
        match event {
            ProcessEvent::Line { tag, line } => {
                if !self.is_live(tag) {
                    tracing::trace!(?tag, "output from a retired process");
                    return Ok(());
                }
                match tag.role {
                    Role::Playback => self.session.handle_playback_line(&line),
                    Role::Scanner => self.session.handle_scan_line(&line, Instant::now()),
                }
            }
            ProcessEvent::Exited { tag, exit } => {
                if !self.is_live(tag) {
                    return Ok(());
                }
                match tag.role {
                    Role::Scanner => {
                        self.scanner = None;
                        self.session.scanner.process_exited(exit);
                    }
                    Role::Playback => {
                        self.playback = None;
                        self.playback_exited(exit).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn playback_exited(&mut self, exit: ProcessExit) -> Result<()> {
        tracing::warn!(?exit, "playback backend exited");
        if !self.session.playback.backend_terminated() {
            return Ok(());
        }
        self.start_playback_backend().await
    }
}
