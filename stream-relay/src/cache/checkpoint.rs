//! Durable cache snapshot.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::utils::fs::write_atomic;
use crate::{Error, Result};

/// File name of the checkpoint inside the cache directory.
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub created_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub ready: bool,
}

/// Snapshot of the cache written every Nth segment and on shutdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub current_segment_id: Option<u64>,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub segments: BTreeMap<u64, CheckpointEntry>,
}

impl Checkpoint {
    /// Load a checkpoint. Missing or unreadable files yield `None`, never an error.
    pub async fn load(path: &Path) -> Option<Self> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No checkpoint found, starting fresh");
                return None;
            }
            Err(e) => {
                warn!(path = %path.display(), "Failed to read checkpoint, starting fresh: {}", e);
                return None;
            }
        };

        match serde_json::from_str(&content) {
            Ok(checkpoint) => Some(checkpoint),
            Err(e) => {
                warn!(path = %path.display(), "Corrupt checkpoint, starting fresh: {}", e);
                None
            }
        }
    }

    /// Persist atomically.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(Error::from)?;
        write_atomic(path, json).await
    }
}
