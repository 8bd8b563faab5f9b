//! Exit waiting with graceful cancellation.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// How a child is asked to stop before it is killed.
#[derive(Debug, Clone, Copy)]
pub struct GracefulStop {
    /// Bytes written to the child's stdin to request a clean exit (ffmpeg quits on `q`).
    pub quit_command: &'static [u8],
    /// How long to wait for the clean exit before killing the child.
    pub grace: Duration,
}

impl Default for GracefulStop {
    fn default() -> Self {
        Self {
            quit_command: b"q",
            grace: Duration::from_secs(5),
        }
    }
}

/// Spawn a task that waits for `child` to exit and reports its exit code.
///
/// When `cancellation_token` fires, the child is first asked to quit through its
/// stdin (if it was piped), given `stop.grace` to exit, and killed afterwards.
///
/// The receiver yields:
/// * `Some(code)` when the process exited with a code
/// * `None` when it was terminated by a signal (including our own kill)
pub fn spawn_exit_waiter(
    mut child: Child,
    cancellation_token: CancellationToken,
    stop: GracefulStop,
) -> oneshot::Receiver<Option<i32>> {
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let exit_code = tokio::select! {
            status = child.wait() => exit_code(status),
            _ = cancellation_token.cancelled() => {
                if let Some(mut stdin) = child.stdin.take() {
                    if let Err(e) = stdin.write_all(stop.quit_command).await {
                        debug!("Failed to send quit command to child: {}", e);
                    }
                    let _ = stdin.flush().await;
                }

                match tokio::time::timeout(stop.grace, child.wait()).await {
                    Ok(status) => exit_code(status),
                    Err(_) => {
                        warn!("Child did not exit within {:?}; killing it", stop.grace);
                        if let Err(e) = child.kill().await {
                            error!("Failed to kill child process: {}", e);
                        }
                        None
                    }
                }
            }
        };
        let _ = tx.send(exit_code);
    });

    rx
}

fn exit_code(status: std::io::Result<std::process::ExitStatus>) -> Option<i32> {
    match status {
        Ok(exit_status) => exit_status.code(),
        Err(e) => {
            error!("Error waiting for process: {}", e);
            Some(-1)
        }
    }
}
