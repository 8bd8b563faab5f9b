//! Subprocess spawning.
//!
//! The supervisor never touches `tokio::process` directly; it goes through the
//! [`ProcessSpawner`] trait so tests can substitute scripted processes.

use std::process::Stdio;

use async_trait::async_trait;
use process_utils::{GracefulStop, OutputRecordReader, spawn_exit_waiter};
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::{Error, Result};

/// Capacity of the per-process diagnostics channel.
const DIAGNOSTICS_CHANNEL_CAPACITY: usize = 256;

/// A fully built command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

/// Parameters that vary between launches of the same process.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LaunchContext {
    /// Offset in seconds into the source to resume from.
    pub resume_from: Option<f64>,
}

impl LaunchContext {
    pub fn resume_from(position: f64) -> Self {
        Self {
            resume_from: Some(position),
        }
    }
}

/// Builds the command for each launch.
///
/// The capture command depends on cache state (start number) and the resume
/// offset, so it is rebuilt every time rather than fixed at construction.
pub trait CommandFactory: Send + Sync {
    fn build(&self, ctx: &LaunchContext) -> CommandSpec;
}

impl CommandFactory for CommandSpec {
    fn build(&self, _ctx: &LaunchContext) -> CommandSpec {
        self.clone()
    }
}

/// A running child process as seen by the supervisor.
pub struct SpawnedProcess {
    pub pid: Option<u32>,
    /// Diagnostic records (stderr and stdout), each terminated by `\n`.
    /// Closed once the child's output streams end.
    pub diagnostics: mpsc::Receiver<String>,
    /// Resolves with the exit code (`None` when killed by a signal).
    pub exit: oneshot::Receiver<Option<i32>>,
    /// Cancel to ask the child to stop gracefully, then kill it.
    pub terminate: CancellationToken,
}

#[async_trait]
pub trait ProcessSpawner: Send + Sync + 'static {
    async fn spawn(&self, command: &CommandSpec) -> Result<SpawnedProcess>;
}

/// Spawns real processes with `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct TokioSpawner {
    stop: GracefulStop,
}

impl TokioSpawner {
    pub fn new(stop: GracefulStop) -> Self {
        Self { stop }
    }
}

#[async_trait]
impl ProcessSpawner for TokioSpawner {
    async fn spawn(&self, command: &CommandSpec) -> Result<SpawnedProcess> {
        let mut child = process_utils::tokio_command(&command.program)
            .args(&command.args)
            .env("LC_ALL", "C") // Force consistent output
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::spawn(&command.program, e))?;

        let pid = child.id();
        let (tx, rx) = mpsc::channel(DIAGNOSTICS_CHANNEL_CAPACITY);

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Other(format!("Failed to capture {} stderr", command.program)))?;
        forward_records(stderr, tx.clone(), pid);

        if let Some(stdout) = child.stdout.take() {
            forward_records(stdout, tx, pid);
        }

        let terminate = CancellationToken::new();
        let exit = spawn_exit_waiter(child, terminate.clone(), self.stop);

        Ok(SpawnedProcess {
            pid,
            diagnostics: rx,
            exit,
            terminate,
        })
    }
}

fn forward_records<R>(stream: R, tx: mpsc::Sender<String>, pid: Option<u32>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = OutputRecordReader::new(stream);
        loop {
            match reader.next_record().await {
                Ok(Some(mut record)) => {
                    record.push('\n');
                    if tx.send(record).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!(?pid, "Process output closed");
                    break;
                }
                Err(e) => {
                    error!(?pid, "Error reading process output: {}", e);
                    break;
                }
            }
        }
    });
}
