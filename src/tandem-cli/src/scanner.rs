//! The scanner backend and the file discovery used by `tandem scan`.
//!
//! A scanner process handles one resource: it prints the result line, then
//! answers the reserved protocol commands until `quit` or end of input.

use lofty::{Accessor, AudioFile, ItemKey, Probe, TaggedFileExt};
use path_clean::PathClean;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tandem_core::{Metadata, Uri};
use tandem_protocol::{Backend, Message, ResourceErrorKind, ScanEvent};
use walkdir::WalkDir;

pub fn is_supported_extension(ext: &str) -> bool {
    matches!(
        ext.to_ascii_lowercase().as_str(),
        "mp3" | "m4a" | "flac" | "wav" | "ogg" | "opus"
    )
}

fn has_supported_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(is_supported_extension)
}

/// Audio files under `roots`, in walk order. Plain files are taken as given.
pub fn collect_audio_files(roots: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for root in roots {
        let root = match root.canonicalize() {
            Ok(path) => path.clean(),
            Err(err) => {
                tracing::warn!(path = %root.display(), error = %err, "skipping unreadable path");
                continue;
            }
        };
        if root.is_file() {
            files.push(root);
            continue;
        }
        for entry in WalkDir::new(&root).follow_links(false).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(error = %err, "skipping directory entry");
                    continue;
                }
            };
            if entry.file_type().is_file() && has_supported_extension(entry.path()) {
                files.push(entry.path().to_path_buf());
            }
        }
    }
    files
}

/// Read the tags of one resource and describe it as a scanner event.
pub fn scan_resource(uri: &Uri) -> ScanEvent {
    if uri.kind() != "file" {
        return resource_error(uri, ResourceErrorKind::Unrecognized);
    }
    let path = Path::new(uri.path());
    if !path.exists() {
        return resource_error(uri, ResourceErrorKind::NotFound);
    }
    if !has_supported_extension(path) {
        return resource_error(uri, ResourceErrorKind::Unrecognized);
    }

    let tagged = match Probe::open(path).and_then(|probe| probe.read()) {
        Ok(tagged) => tagged,
        Err(err) => {
            tracing::info!(%uri, error = %err, "unreadable audio file");
            return resource_error(uri, ResourceErrorKind::Corrupted);
        }
    };

    let tag = tagged.primary_tag().or_else(|| tagged.first_tag());
    let properties = tagged.properties();

    let mut fields = Map::new();
    let title = tag
        .and_then(|t| t.get_string(&ItemKey::TrackTitle).map(str::to_string))
        .or_else(|| path.file_stem().map(|stem| stem.to_string_lossy().into_owned()));
    if let Some(title) = title {
        fields.insert("title".into(), Value::from(title));
    }
    if let Some(artist) = tag.and_then(|t| t.artist()) {
        fields.insert("artist".into(), Value::from(artist.to_string()));
    }
    if let Some(album) = tag.and_then(|t| t.album()) {
        fields.insert("album".into(), Value::from(album.to_string()));
    }
    if let Some(track) = tag.and_then(|t| t.track()) {
        fields.insert("track_number".into(), Value::from(track));
    }
    fields.insert(
        "duration_seconds".into(),
        Value::from(properties.duration().as_secs()),
    );
    if let Some(sample_rate) = properties.sample_rate() {
        fields.insert("sample_rate".into(), Value::from(sample_rate));
    }

    ScanEvent::Metadata {
        uri: uri.clone(),
        metadata: Metadata::from(Value::Object(fields)),
    }
}

fn resource_error(uri: &Uri, kind: ResourceErrorKind) -> ScanEvent {
    ScanEvent::ResourceError {
        uri: uri.clone(),
        kind,
    }
}

pub const SCANNER_BACKEND_TYPE: &str = "tandem-scanner";

/// Protocol side of a scanner process once its result is out.
#[derive(Debug, Default)]
pub struct ScannerBackend;

impl Backend for ScannerBackend {
    fn backend_type(&self) -> &str {
        SCANNER_BACKEND_TYPE
    }

    fn exec(&mut self, command: &str, _params: &[String]) -> Vec<Message> {
        vec![ScanEvent::Error(format!("unknown command {command:?}")).to_message()]
    }
}

/// Result line printed by `tandem backend scan <uri>`.
pub fn scan_line(raw_uri: &str) -> String {
    let event = match raw_uri.parse::<Uri>() {
        Ok(uri) => scan_resource(&uri),
        Err(err) => ScanEvent::Error(format!("invalid resource identifier {raw_uri:?}: {err}")),
    };
    event.to_message().encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tandem_protocol::{handle_line, LoopControl};
    use tempfile::tempdir;

    #[test]
    fn missing_file_is_not_found() {
        let uri = Uri::file("/nonexistent/tandem/song.flac");
        assert_eq!(
            scan_resource(&uri),
            ScanEvent::ResourceError {
                uri,
                kind: ResourceErrorKind::NotFound
            }
        );
    }

    #[test]
    fn unknown_extension_is_unrecognized() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        fs::write(&path, "hello").unwrap();
        let uri = Uri::file(&path);
        assert_eq!(
            scan_resource(&uri),
            ScanEvent::ResourceError {
                uri,
                kind: ResourceErrorKind::Unrecognized
            }
        );
    }

    #[test]
    fn garbage_audio_is_corrupted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.flac");
        fs::write(&path, b"this is not a flac stream").unwrap();
        let uri = Uri::file(&path);
        assert!(matches!(
            scan_resource(&uri),
            ScanEvent::ResourceError {
                kind: ResourceErrorKind::Corrupted,
                ..
            }
        ));
    }

    #[test]
    fn non_file_uri_is_unrecognized() {
        let uri = Uri::new("http", "example.com/a.mp3").unwrap();
        assert!(matches!(
            scan_resource(&uri),
            ScanEvent::ResourceError {
                kind: ResourceErrorKind::Unrecognized,
                ..
            }
        ));
    }

    #[test]
    fn scan_line_reports_bad_identifier() {
        let line = scan_line("no separator");
        assert_eq!(Message::decode(&line).command, "error");
    }

    #[test]
    fn scanner_answers_reserved_commands() {
        let mut backend = ScannerBackend;
        let (replies, _) = handle_line(&mut backend, "get_backend_type");
        assert_eq!(
            replies,
            vec![Message::new("backend_type").with_param(SCANNER_BACKEND_TYPE)]
        );

        let (replies, _) = handle_line(&mut backend, r#"ping "x""#);
        assert_eq!(replies, vec![Message::new("pong").with_param("x")]);

        let (replies, control) = handle_line(&mut backend, "scan_again");
        assert_eq!(replies[0].command, "error");
        assert_eq!(control, LoopControl::Continue);

        let (_, control) = handle_line(&mut backend, "quit");
        assert_eq!(control, LoopControl::Stop);
    }

    #[test]
    fn collects_supported_files_recursively() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("artist/album")).unwrap();
        fs::write(dir.path().join("artist/album/b.flac"), b"").unwrap();
        fs::write(dir.path().join("artist/album/a.MP3"), b"").unwrap();
        fs::write(dir.path().join("artist/cover.jpg"), b"").unwrap();

        let files = collect_audio_files(&[dir.path().to_path_buf()]);
        let names: Vec<_> = files
            .iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.MP3", "b.flac"]);
    }
}
