//! Line codec shared by the frontend and its backend processes.
//!
//! One line is one message: `command "param1" "param2" ...`. Every parameter is
//! quoted, even when empty, and `\`, newline, carriage return and `"` inside a
//! parameter are backslash-escaped. Decoding is best effort and never fails:
//! the pipe is trusted, so noise is dropped rather than reported.

use std::fmt;

/// Command and event names used on the wire.
pub mod commands {
    // Reserved, answered by every backend.
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const GET_BACKEND_TYPE: &str = "get_backend_type";
    pub const BACKEND_TYPE: &str = "backend_type";
    pub const QUIT: &str = "quit";

    // Frontend to playback backend.
    pub const PLAY: &str = "play";
    pub const STOP: &str = "stop";
    pub const SET_NEXT_RESOURCE: &str = "set_next_resource";
    pub const CLEAR_NEXT_RESOURCE: &str = "clear_next_resource";
    pub const TRIGGER_TRANSITION: &str = "trigger_transition";

    // Playback backend to frontend.
    pub const TRANSITION: &str = "transition";
    pub const STARTED: &str = "started";
    pub const STOPPED: &str = "stopped";
    pub const RESOURCE_FINISHED: &str = "resource_finished";
    pub const METADATA: &str = "metadata";

    // Scanner backend to frontend.
    pub const UNRECOGNIZED_RESOURCE: &str = "unrecognized_resource";
    pub const RESOURCE_NOT_FOUND: &str = "resource_not_found";
    pub const RESOURCE_CORRUPTED: &str = "resource_corrupted";
    pub const ERROR: &str = "error";
}

/// A decoded protocol line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub command: String,
    pub params: Vec<String>,
}

impl Message {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            params: Vec::new(),
        }
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.params.push(param.into());
        self
    }

    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }

    pub fn is(&self, command: &str) -> bool {
        self.command == command
    }

    /// Encoded line, without the trailing newline.
    pub fn encode(&self) -> String {
        encode(&self.command, &self.params)
    }

    pub fn decode(line: &str) -> Self {
        let (command, params) = decode(line);
        Self { command, params }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Build one protocol line (without the trailing newline).
pub fn encode<S: AsRef<str>>(command: &str, params: &[S]) -> String {
    let capacity = command.len()
        + params
            .iter()
            .map(|param| param.as_ref().len() + 3)
            .sum::<usize>();
    let mut line = String::with_capacity(capacity);
    line.push_str(command);
    for param in params {
        line.push_str(" \"");
        for c in param.as_ref().chars() {
            match c {
                '\\' => line.push_str("\\\\"),
                '\n' => line.push_str("\\n"),
                '\r' => line.push_str("\\r"),
                '"' => line.push_str("\\\""),
                other => line.push(other),
            }
        }
        line.push('"');
    }
    line
}

/// Split one protocol line into its command and unescaped parameters.
///
/// A line without a space is a bare command. Text between parameters is
/// skipped and an unterminated parameter is dropped.
pub fn decode(line: &str) -> (String, Vec<String>) {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let line = line.strip_suffix('\r').unwrap_or(line);

    let Some((command, rest)) = line.split_once(' ') else {
        return (line.to_string(), Vec::new());
    };

    let mut params = Vec::new();
    let mut chars = rest.chars();
    'params: loop {
        loop {
            match chars.next() {
                Some('"') => break,
                Some(_) => continue,
                None => break 'params,
            }
        }

        let mut param = String::new();
        loop {
            match chars.next() {
                Some('"') => {
                    params.push(param);
                    break;
                }
                Some('\\') => match chars.next() {
                    Some('n') => param.push('\n'),
                    Some('r') => param.push('\r'),
                    Some(other) => param.push(other),
                    None => break 'params,
                },
                Some(c) => param.push(c),
                None => break 'params,
            }
        }
    }

    (command.to_string(), params)
}
