//! Wire protocol between the Tandem frontend and its backend processes.
//!
//! Backends are separate executables driven over stdin/stdout, one message
//! per line:
//!
//! ```text
//! frontend -> play "file:///music/a.flac" "{}" "file:///music/b.flac" "{}"
//! backend  <- started "file:///music/a.flac" "file:///music/b.flac"
//! backend  <- transition "file:///music/a.flac" "file:///music/b.flac"
//! frontend -> quit
//! ```
//!
//! [`protocol`] is the codec, [`events`] gives the lines types, [`backend`]
//! is the loop a backend process runs and [`host`] is the frontend side that
//! spawns and supervises backend processes.

pub mod backend;
pub mod events;
pub mod host;
pub mod protocol;

pub use backend::{handle_line, read_line, serve, Backend, LoopControl, ServeError};
pub use events::{EventError, PlaybackCommand, PlaybackEvent, ResourceErrorKind, ScanEvent};
pub use host::{BackendProcess, BackendSpec, HostError, ProcessEvent, ProcessExit};
pub use protocol::{commands, decode, encode, Message};
