//! Generic request loop shared by every backend process.

use crate::protocol::{commands, Message};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::{Instant, MissedTickBehavior};

/// A backend answers protocol commands and may produce events on its own.
pub trait Backend {
    /// Value reported for `get_backend_type`.
    fn backend_type(&self) -> &str;

    /// Handle one non-reserved command. Replies are written in order.
    fn exec(&mut self, command: &str, params: &[String]) -> Vec<Message>;

    /// Advance time-driven work (decoding, end of stream detection).
    fn poll(&mut self, _elapsed: Duration) -> Vec<Message> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Stop,
}

/// Dispatch one input line, answering the reserved commands generically.
pub fn handle_line<B: Backend + ?Sized>(backend: &mut B, line: &str) -> (Vec<Message>, LoopControl) {
    let message = Message::decode(line);
    match message.command.as_str() {
        "" => (Vec::new(), LoopControl::Continue),
        commands::QUIT => (Vec::new(), LoopControl::Stop),
        commands::PING => {
            let mut pong = Message::new(commands::PONG);
            pong.params = message.params;
            (vec![pong], LoopControl::Continue)
        }
        commands::GET_BACKEND_TYPE => (
            vec![Message::new(commands::BACKEND_TYPE).with_param(backend.backend_type())],
            LoopControl::Continue,
        ),
        command => (backend.exec(command, &message.params), LoopControl::Continue),
    }
}

/// Read one line, replacing invalid UTF-8 instead of failing.
///
/// Keep `buf` between calls: a read cancelled inside `select!` leaves its
/// partial bytes there and the next call continues the same line. Returns
/// `None` at end of input.
pub async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let read = reader.read_until(b'\n', buf).await?;
    if read == 0 && buf.is_empty() {
        return Ok(None);
    }
    let mut bytes = std::mem::take(buf);
    if bytes.last() == Some(&b'\n') {
        bytes.pop();
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
    }
    let line = match String::from_utf8(bytes) {
        Ok(line) => line,
        Err(err) => {
            tracing::warn!(error = %err.utf8_error(), "replacing invalid UTF-8 in protocol line");
            String::from_utf8_lossy(err.as_bytes()).into_owned()
        }
    };
    Ok(Some(line))
}

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to read command: {0}")]
    Read(std::io::Error),
    #[error("failed to write reply: {0}")]
    Write(std::io::Error),
}

/// Serve `backend` until `quit` or end of input.
///
/// With a `tick`, `poll` is called periodically with the time elapsed since
/// the previous call.
pub async fn serve<B, R, W>(
    backend: &mut B,
    input: R,
    mut output: W,
    tick: Option<Duration>,
) -> Result<(), ServeError>
where
    B: Backend + ?Sized,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut input = BufReader::new(input);
    let mut buf = Vec::new();
    let mut interval = tokio::time::interval(tick.unwrap_or(Duration::from_secs(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_poll = Instant::now();

    tracing::debug!(backend_type = backend.backend_type(), "serving backend");
    loop {
        tokio::select! {
            line = read_line(&mut input, &mut buf) => {
                let Some(line) = line.map_err(ServeError::Read)? else {
                    tracing::debug!("input closed");
                    break;
                };
                let (replies, control) = handle_line(backend, &line);
                write_messages(&mut output, &replies).await?;
                if control == LoopControl::Stop {
                    tracing::debug!("quit received");
                    break;
                }
            }
            _ = interval.tick(), if tick.is_some() => {
                let now = Instant::now();
                let events = backend.poll(now - last_poll);
                last_poll = now;
                write_messages(&mut output, &events).await?;
            }
        }
    }

    output.flush().await.map_err(ServeError::Write)
}

async fn write_messages<W: AsyncWrite + Unpin>(
    output: &mut W,
    messages: &[Message],
) -> Result<(), ServeError> {
    if messages.is_empty() {
        return Ok(());
    }
    for message in messages {
        let mut line = message.encode();
        line.push('\n');
        output
            .write_all(line.as_bytes())
            .await
            .map_err(ServeError::Write)?;
    }
    output.flush().await.map_err(ServeError::Write)
}
