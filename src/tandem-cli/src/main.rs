mod runtime;
mod scanner;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use runtime::{backend_spec, Runtime};
use std::path::PathBuf;
use std::time::Duration;
use tandem_core::{init_logging, AppDirs, Config, ProcessRole, UniqueIdAllocator, Uri};
use tandem_frontend::Session;
use tandem_playlist::{Playlist, PlaylistKind, PlaylistStore};
use tandem_protocol::serve;
use tokio::io::AsyncWriteExt;

/// How often the playback backend advances its decoder.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Parser)]
#[command(name = "tandem", version, about = "Audio player with crash-isolated backends")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Manage stored playlists
    #[command(subcommand)]
    Playlists(PlaylistsCommand),
    /// Scan files or directories into a playlist
    Scan(ScanCommand),
    /// Play a playlist, reading next/prev/stop/quit from stdin
    Play(PlayCommand),
    /// Run a backend process (spawned by the frontend)
    #[command(subcommand)]
    Backend(BackendCommand),
}

#[derive(Debug, Subcommand)]
enum PlaylistsCommand {
    /// List playlists
    List,
    /// Create an empty playlist
    Create { name: String },
    /// Show the entries of a playlist
    Show { name: String },
    /// Remove a playlist
    Remove { name: String },
}

#[derive(Debug, Parser)]
struct ScanCommand {
    /// Target playlist, created when missing
    #[arg(long)]
    playlist: String,
    /// Files or directories to scan
    #[arg(required = true)]
    paths: Vec<PathBuf>,
}

#[derive(Debug, Parser)]
struct PlayCommand {
    #[arg(long)]
    playlist: String,
    /// Entry to start from
    #[arg(long, default_value_t = 0)]
    index: usize,
}

#[derive(Debug, Subcommand)]
enum BackendCommand {
    /// Decode audio, speaking the line protocol on stdin/stdout
    Playback,
    /// Print the metadata of one resource, then answer protocol commands until quit
    Scan { uri: String },
}

impl Command {
    fn role(&self) -> ProcessRole {
        match self {
            Command::Backend(BackendCommand::Playback) => ProcessRole::PlaybackBackend,
            Command::Backend(BackendCommand::Scan { .. }) => ProcessRole::ScannerBackend,
            _ => ProcessRole::Frontend,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let dirs = AppDirs::discover()?;
    let config = Config::load_or_default(&dirs)?;
    let _logging = init_logging(&config.logging, &dirs, cli.command.role())?;

    match cli.command {
        Command::Backend(BackendCommand::Playback) => run_playback_backend(),
        Command::Backend(BackendCommand::Scan { uri }) => run_scanner_backend(&uri),
        Command::Playlists(command) => run_playlists(command, &config, &dirs),
        Command::Scan(command) => run_scan(command, &config, &dirs),
        Command::Play(command) => run_play(command, &config, &dirs),
    }
}

fn tokio_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")
}

fn run_playback_backend() -> Result<()> {
    let mut backend = tandem_audio::PlaybackBackend::new(decoder_factory());
    tokio_runtime()?.block_on(serve(
        &mut backend,
        tokio::io::stdin(),
        tokio::io::stdout(),
        Some(POLL_INTERVAL),
    ))?;
    Ok(())
}

fn run_scanner_backend(uri: &str) -> Result<()> {
    let mut result = scanner::scan_line(uri);
    result.push('\n');
    tokio_runtime()?.block_on(async {
        let mut stdout = tokio::io::stdout();
        stdout.write_all(result.as_bytes()).await?;
        stdout.flush().await?;
        serve(&mut scanner::ScannerBackend, tokio::io::stdin(), stdout, None).await?;
        Ok::<_, anyhow::Error>(())
    })
}

#[cfg(feature = "symphonia-decoder")]
fn decoder_factory() -> tandem_audio::SymphoniaDecoderFactory {
    tandem_audio::SymphoniaDecoderFactory
}

#[cfg(not(feature = "symphonia-decoder"))]
fn decoder_factory() -> tandem_audio::NullDecoderFactory {
    tandem_audio::NullDecoderFactory::default()
}

fn load_session(config: &Config, dirs: &AppDirs) -> Result<(Session, PlaylistStore)> {
    let store = PlaylistStore::at(config.playlists_path(dirs));
    let mut session = Session::from_config(config, UniqueIdAllocator::new().shared());
    let report = session
        .restore(&store)
        .with_context(|| format!("failed to load {}", store.path().display()))?;
    for issue in &report.issues {
        tracing::warn!(%issue, "skipped while loading playlists");
    }
    Ok((session, store))
}

fn runtime_for(session: Session, store: PlaylistStore, config: &Config) -> Result<Runtime> {
    Ok(Runtime::new(
        session,
        store,
        backend_spec(&config.backends.playback)?,
        backend_spec(&config.backends.scanner)?,
    ))
}

fn run_playlists(command: PlaylistsCommand, config: &Config, dirs: &AppDirs) -> Result<()> {
    let (mut session, store) = load_session(config, dirs)?;
    let playlists = &mut session.playlists;

    match command {
        PlaylistsCommand::List => {
            if playlists.is_empty() {
                println!("No playlists. Create one with `tandem playlists create <name>`.");
            }
            let active = playlists.active();
            for key in playlists.keys() {
                let Some(playlist) = playlists.playlist(key) else {
                    continue;
                };
                let kind = match playlist.kind() {
                    PlaylistKind::Flat => "",
                    PlaylistKind::Filtered => " (filtered)",
                };
                let marker = if active == Some(key) { "*" } else { " " };
                println!("{marker} {}{kind}: {} entries", playlist.name(), playlist.len());
            }
            return Ok(());
        }
        PlaylistsCommand::Create { name } => {
            if playlists.find_by_name(&name).is_some() {
                bail!("playlist '{name}' already exists");
            }
            playlists.create_playlist(name.clone());
            println!("Created playlist '{name}'.");
        }
        PlaylistsCommand::Show { name } => {
            let playlist = playlists
                .find_by_name(&name)
                .and_then(|key| playlists.playlist(key))
                .with_context(|| format!("no playlist named '{name}'"))?;
            for (index, entry) in playlist.entries().iter().enumerate() {
                let title = entry.metadata.title().unwrap_or(entry.uri.path());
                let marker = if entry.incompatible { " [incompatible]" } else { "" };
                println!("{index:>4}  {title}{marker}");
            }
            return Ok(());
        }
        PlaylistsCommand::Remove { name } => {
            let key = playlists
                .find_by_name(&name)
                .with_context(|| format!("no playlist named '{name}'"))?;
            playlists.remove_playlist(key);
            session.dispatch_events();
            println!("Removed playlist '{name}'.");
        }
    }

    session.persist(&store)?;
    Ok(())
}

fn run_scan(command: ScanCommand, config: &Config, dirs: &AppDirs) -> Result<()> {
    let (mut session, store) = load_session(config, dirs)?;
    let key = match session.playlists.find_by_name(&command.playlist) {
        Some(key) => key,
        None => session.playlists.create_playlist(command.playlist.clone()),
    };
    if session.playlists.flat(key).is_none() {
        bail!("playlist '{}' is a filtered view", command.playlist);
    }
    session.dispatch_events();

    let uris: Vec<Uri> = scanner::collect_audio_files(&command.paths)
        .iter()
        .map(Uri::file)
        .collect();
    if uris.is_empty() {
        println!("No audio files found.");
        return Ok(());
    }
    tracing::info!(count = uris.len(), playlist = %command.playlist, "scanning");

    let mut runtime = runtime_for(session, store, config)?;
    let summary = tokio_runtime()?.block_on(runtime.scan(key, uris))?;
    println!(
        "Scan finished: {} added, {} failed, {} dropped.",
        summary.added, summary.failed, summary.dropped
    );
    Ok(())
}

fn run_play(command: PlayCommand, config: &Config, dirs: &AppDirs) -> Result<()> {
    let (session, store) = load_session(config, dirs)?;
    let key = session
        .playlists
        .find_by_name(&command.playlist)
        .with_context(|| format!("no playlist named '{}'", command.playlist))?;

    let mut runtime = runtime_for(session, store, config)?;
    tokio_runtime()?.block_on(runtime.play(key, command.index))
}
