//! stream-relay library crate.
//!
//! Relays a remote media file to RTMP endpoints through supervised ffmpeg
//! processes, with a checkpointed segment cache, position continuity across
//! restarts, primary/backup publishing and periodic health checks.

pub mod cache;
pub mod config;
pub mod continuity;
pub mod error;
pub mod health;
pub mod logging;
pub mod process;
pub mod publisher;
pub mod relay;
pub mod utils;

pub use config::RelayConfig;
pub use error::{Error, Result};
pub use process::{ProcessSpawner, TokioSpawner};
pub use relay::{Relay, RelayHealth};
