//! Small process-related helpers shared across the workspace.
//!
//! - [`tokio_command`]: commands that never pop a console window on Windows.
//! - [`OutputRecordReader`]: reads child diagnostics split on `\n` or `\r`.
//! - [`spawn_exit_waiter`]: waits for a child and stops it gracefully on cancellation.

#[cfg(feature = "tokio")]
mod record_reader;
#[cfg(feature = "tokio")]
mod waiter;

#[cfg(feature = "tokio")]
pub use record_reader::OutputRecordReader;
#[cfg(feature = "tokio")]
pub use waiter::{GracefulStop, spawn_exit_waiter};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
///
/// The child is also marked `kill_on_drop` so a dropped handle never leaves a
/// transcoder running.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<std::ffi::OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        cmd.as_std_mut().creation_flags(CREATE_NO_WINDOW);
    }
    cmd.kill_on_drop(true);
    cmd
}
