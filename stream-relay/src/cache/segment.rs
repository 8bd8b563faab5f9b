use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One time-sliced media file produced by the capture process.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    pub id: u64,
    pub file_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub duration_secs: f64,
    /// Fully written and present on disk.
    pub ready: bool,
    pub size_bytes: Option<u64>,
}

impl Segment {
    pub(crate) fn opened(id: u64, dir: &Path, duration_secs: f64) -> Self {
        Self {
            id,
            file_path: dir.join(segment_file_name(id)),
            created_at: Utc::now(),
            duration_secs,
            ready: false,
            size_bytes: None,
        }
    }

    pub fn file_name(&self) -> String {
        segment_file_name(self.id)
    }
}

/// `segment_<id>.ts`, the name the capture muxer is told to use.
pub fn segment_file_name(id: u64) -> String {
    format!("segment_{id}.ts")
}

/// The muxer filename pattern matching [`segment_file_name`].
pub const SEGMENT_FILE_PATTERN: &str = "segment_%d.ts";
