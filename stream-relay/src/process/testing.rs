//! Scripted processes for unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::spawner::{CommandSpec, ProcessSpawner, SpawnedProcess};
use crate::{Error, Result};

pub const PROGRESS_LINE: &str = "frame=    1 fps=0.0 q=0.0 size=0kB time=00:00:00.04 bitrate=N/A\r";

#[derive(Debug, Clone)]
pub enum Script {
    /// Print `lines`, then exit with `code` after `after`.
    Exit {
        lines: Vec<String>,
        code: Option<i32>,
        after: Duration,
    },
    /// Print `lines`, then run until asked to stop.
    Run { lines: Vec<String> },
    /// Fail to launch.
    SpawnError,
}

impl Script {
    pub fn exit(code: i32) -> Self {
        Self::Exit {
            lines: vec![],
            code: Some(code),
            after: Duration::ZERO,
        }
    }

    pub fn connected() -> Self {
        Self::Run {
            lines: vec![PROGRESS_LINE.to_string()],
        }
    }
}

pub struct FakeSpawner {
    scripts: Mutex<VecDeque<Script>>,
    fallback: Script,
    spawned: AtomicUsize,
    commands: Mutex<Vec<CommandSpec>>,
}

impl FakeSpawner {
    pub fn new(scripts: impl IntoIterator<Item = Script>) -> Arc<Self> {
        Self::with_fallback(scripts, Script::Run { lines: vec![] })
    }

    /// Scripts run in order; `fallback` is used once they run out.
    pub fn with_fallback(scripts: impl IntoIterator<Item = Script>, fallback: Script) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            fallback,
            spawned: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
        })
    }

    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<CommandSpec> {
        self.commands.lock().clone()
    }
}

#[async_trait]
impl ProcessSpawner for FakeSpawner {
    async fn spawn(&self, command: &CommandSpec) -> Result<SpawnedProcess> {
        let script = self
            .scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        if let Script::SpawnError = script {
            return Err(Error::spawn(
                &command.program,
                std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
            ));
        }

        self.commands.lock().push(command.clone());
        let n = self.spawned.fetch_add(1, Ordering::SeqCst);
        let (diag_tx, diag_rx) = mpsc::channel(64);
        let (exit_tx, exit_rx) = oneshot::channel();
        let terminate = CancellationToken::new();
        let token = terminate.clone();

        tokio::spawn(async move {
            let (lines, exit_after) = match script {
                Script::Exit { lines, code, after } => (lines, Some((code, after))),
                Script::Run { lines } => (lines, None),
                Script::SpawnError => return,
            };
            for line in lines {
                let _ = diag_tx.send(line).await;
            }

            let code = match exit_after {
                Some((code, after)) => tokio::select! {
                    _ = tokio::time::sleep(after) => code,
                    _ = token.cancelled() => Some(255),
                },
                None => {
                    token.cancelled().await;
                    Some(255)
                }
            };
            drop(diag_tx);
            let _ = exit_tx.send(code);
        });

        Ok(SpawnedProcess {
            pid: Some(1000 + n as u32),
            diagnostics: diag_rx,
            exit: exit_rx,
            terminate,
        })
    }
}
