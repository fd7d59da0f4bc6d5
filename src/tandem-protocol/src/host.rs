//! Spawns backend processes and turns their stdout into an ordered event stream.

use crate::backend::read_line;
use crate::protocol::{commands, Message};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to spawn {executable}: {source}")]
    Spawn {
        executable: PathBuf,
        source: std::io::Error,
    },
    #[error("backend process has no stdin")]
    NoStdin,
    #[error("backend process has no stdout")]
    NoStdout,
    #[error("failed to write to backend: {0}")]
    Write(std::io::Error),
    #[error("backend input is already closed")]
    InputClosed,
}

/// How to launch a backend.
#[derive(Debug, Clone)]
pub struct BackendSpec {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl BackendSpec {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    Normal,
    /// Non-zero status, or killed by a signal (`code` is `None`).
    Crashed { code: Option<i32> },
}

impl ProcessExit {
    fn from_status(status: std::io::Result<ExitStatus>) -> Self {
        match status {
            Ok(status) if status.success() => ProcessExit::Normal,
            Ok(status) => ProcessExit::Crashed {
                code: status.code(),
            },
            Err(err) => {
                tracing::warn!(error = %err, "failed to wait for backend process");
                ProcessExit::Crashed { code: None }
            }
        }
    }

    pub fn is_crash(self) -> bool {
        matches!(self, ProcessExit::Crashed { .. })
    }
}

/// Output of a backend process, tagged with the owner's identifier.
///
/// For one process, every `Line` is delivered before its single `Exited`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent<T> {
    Line { tag: T, line: String },
    Exited { tag: T, exit: ProcessExit },
}

/// Handle to a running backend. Dropping it kills the process.
pub struct BackendProcess<T> {
    tag: T,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl<T> BackendProcess<T>
where
    T: Clone + Send + 'static,
{
    /// Spawn the backend and start forwarding its output to `events`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        spec: &BackendSpec,
        extra_args: &[String],
        tag: T,
        events: mpsc::UnboundedSender<ProcessEvent<T>>,
    ) -> Result<Self, HostError> {
        let mut command = Command::new(&spec.executable);
        command
            .args(&spec.args)
            .args(extra_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|source| HostError::Spawn {
            executable: spec.executable.clone(),
            source,
        })?;
        let stdin = child.stdin.take().ok_or(HostError::NoStdin)?;
        let stdout = child.stdout.take().ok_or(HostError::NoStdout)?;
        let pid = child.id();
        tracing::debug!(executable = %spec.executable.display(), ?pid, "backend spawned");

        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(supervise(child, stdout, tag.clone(), events, kill_rx));

        Ok(Self {
            tag,
            pid,
            stdin: Some(stdin),
            kill_tx: Some(kill_tx),
        })
    }
}

impl<T> BackendProcess<T> {
    pub fn tag(&self) -> &T {
        &self.tag
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Write one message line and flush.
    pub async fn send(&mut self, message: &Message) -> Result<(), HostError> {
        let stdin = self.stdin.as_mut().ok_or(HostError::InputClosed)?;
        let mut line = message.encode();
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(HostError::Write)?;
        stdin.flush().await.map_err(HostError::Write)
    }

    /// Ask the backend to quit and close its input.
    pub async fn terminate(&mut self) {
        if self.stdin.is_none() {
            return;
        }
        if let Err(err) = self.send(&Message::new(commands::QUIT)).await {
            tracing::debug!(error = %err, "backend did not accept quit");
        }
        self.stdin = None;
    }

    /// Force the process down. Its `Exited` event still follows.
    pub fn kill(&mut self) {
        self.stdin = None;
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
    }
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    KillRequested,
}

async fn supervise<T: Clone>(
    mut child: Child,
    stdout: ChildStdout,
    tag: T,
    events: mpsc::UnboundedSender<ProcessEvent<T>>,
    mut kill_rx: oneshot::Receiver<()>,
) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    let mut kill_requested = false;

    loop {
        tokio::select! {
            line = read_line(&mut reader, &mut buf) => match line {
                Ok(Some(line)) => {
                    let event = ProcessEvent::Line { tag: tag.clone(), line };
                    if events.send(event).is_err() && !kill_requested {
                        kill_requested = true;
                        let _ = child.start_kill();
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to read backend output");
                    break;
                }
            },
            _ = &mut kill_rx, if !kill_requested => {
                kill_requested = true;
                let _ = child.start_kill();
            }
        }
    }

    let outcome = if kill_requested {
        Outcome::Exited(child.wait().await)
    } else {
        tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = &mut kill_rx => Outcome::KillRequested,
        }
    };
    let status = match outcome {
        Outcome::Exited(status) => status,
        Outcome::KillRequested => {
            let _ = child.start_kill();
            child.wait().await
        }
    };

    let exit = ProcessExit::from_status(status);
    tracing::debug!(?exit, "backend exited");
    let _ = events.send(ProcessEvent::Exited { tag, exit });
}
