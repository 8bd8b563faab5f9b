//! Rolling segment cache.
//!
//! The capture process writes `segment_<id>.ts` files through ffmpeg's HLS
//! muxer, which deletes files falling out of its window. The cache tracks
//! metadata for the same window: a segment is registered (not ready) when the
//! muxer opens it and becomes ready once the next one is opened and its file
//! is still on disk.

mod checkpoint;
mod segment;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use checkpoint::{CHECKPOINT_FILE, Checkpoint, CheckpointEntry};
pub use segment::{SEGMENT_FILE_PATTERN, Segment, segment_file_name};

use crate::utils::fs::{ensure_dir_all_with_op, file_size};
use crate::{Error, Result};

/// Segment cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Target duration of each segment in seconds.
    #[serde(default = "default_segment_duration")]
    pub segment_duration_secs: f64,
    /// Seconds of media kept in the rolling window.
    #[serde(default = "default_max_cache_secs")]
    pub max_cache_secs: f64,
    /// Persist a checkpoint every this many registered segments.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u32,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./cache")
}

fn default_segment_duration() -> f64 {
    4.0
}

fn default_max_cache_secs() -> f64 {
    300.0
}

fn default_checkpoint_interval() -> u32 {
    100
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            segment_duration_secs: default_segment_duration(),
            max_cache_secs: default_max_cache_secs(),
            checkpoint_interval: default_checkpoint_interval(),
        }
    }
}

impl CacheConfig {
    /// Number of segments in the rolling window.
    pub fn window_capacity(&self) -> usize {
        if self.segment_duration_secs <= 0.0 {
            return 1;
        }
        ((self.max_cache_secs / self.segment_duration_secs).ceil() as usize).max(1)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.cache_dir.join(CHECKPOINT_FILE)
    }
}

/// Cache statistics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub current_segment_id: Option<u64>,
    pub total_tracked: usize,
    pub ready_segments: usize,
    pub capacity: usize,
    /// Seconds of ready media across the whole window.
    pub ready_secs: f64,
}

#[derive(Debug, Default)]
struct CacheState {
    segments: BTreeMap<u64, Segment>,
    current_segment_id: Option<u64>,
    /// Capture progress at the moment each unfinished segment was opened.
    open_progress: BTreeMap<u64, f64>,
    last_progress: f64,
    since_checkpoint: u32,
}

impl CacheState {
    /// Work out durations for every unfinished segment with an id below `before`.
    fn take_pending(&mut self, before: Option<u64>, fallback: f64) -> Vec<(u64, PathBuf, f64)> {
        let ids: Vec<u64> = self
            .open_progress
            .keys()
            .copied()
            .filter(|id| before.is_none_or(|b| *id < b))
            .collect();

        let mut out = Vec::with_capacity(ids.len());
        for (i, id) in ids.iter().enumerate() {
            let start = self.open_progress[id];
            let end = ids
                .get(i + 1)
                .map(|next| self.open_progress[next])
                .unwrap_or(self.last_progress);
            let measured = end - start;
            let duration = if measured > 0.05 { measured } else { fallback };

            if let Some(segment) = self.segments.get(id) {
                out.push((*id, segment.file_path.clone(), duration));
            }
        }

        for id in &ids {
            self.open_progress.remove(id);
        }
        out
    }

    fn evict(&mut self, capacity: usize) {
        while self.segments.len() > capacity {
            if let Some((id, _)) = self.segments.pop_first() {
                self.open_progress.remove(&id);
                debug!(segment_id = id, "Evicted segment from cache window");
            }
        }
    }

    fn to_checkpoint(&self) -> Checkpoint {
        Checkpoint {
            current_segment_id: self.current_segment_id,
            saved_at: Utc::now(),
            segments: self
                .segments
                .values()
                .map(|s| {
                    (
                        s.id,
                        CheckpointEntry {
                            created_at: s.created_at,
                            duration_secs: s.duration_secs,
                            ready: s.ready,
                        },
                    )
                })
                .collect(),
        }
    }
}

/// Owner of segment metadata for the rolling window.
#[derive(Debug)]
pub struct SegmentCache {
    config: CacheConfig,
    state: Mutex<CacheState>,
}

impl SegmentCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn dir(&self) -> &Path {
        &self.config.cache_dir
    }

    pub fn capacity(&self) -> usize {
        self.config.window_capacity()
    }

    /// Create the cache directory and restore the checkpoint, if any.
    ///
    /// Only a failure to create the directory is an error; a missing or
    /// corrupt checkpoint starts a fresh cache.
    pub async fn initialize(&self) -> Result<()> {
        let dir = &self.config.cache_dir;
        ensure_dir_all_with_op("creating cache directory", dir)
            .await
            .map_err(|e| match e {
                Error::IoPath { path, source, .. } => Error::CacheInit { path, source },
                other => other,
            })?;

        let Some(checkpoint) = Checkpoint::load(&self.config.checkpoint_path()).await else {
            info!(dir = %dir.display(), "Segment cache initialized (fresh)");
            return Ok(());
        };

        let mut restored = BTreeMap::new();
        let mut discarded = 0usize;
        for (id, entry) in checkpoint.segments {
            let path = dir.join(segment_file_name(id));
            match file_size(&path).await {
                Some(size) => {
                    restored.insert(
                        id,
                        Segment {
                            id,
                            file_path: path,
                            created_at: entry.created_at,
                            duration_secs: entry.duration_secs,
                            ready: entry.ready,
                            size_bytes: Some(size),
                        },
                    );
                }
                None => discarded += 1,
            }
        }

        let mut state = self.state.lock();
        state.segments = restored;
        state.current_segment_id = checkpoint
            .current_segment_id
            .max(state.segments.keys().next_back().copied());
        state.evict(self.capacity());

        info!(
            dir = %dir.display(),
            restored = state.segments.len(),
            discarded,
            current_segment_id = ?state.current_segment_id,
            "Segment cache restored from checkpoint"
        );
        Ok(())
    }

    /// Track a segment the capture process just opened.
    ///
    /// Earlier unfinished segments are finalized. Returns `false` for ids that
    /// were already seen.
    pub async fn register_segment(&self, id: u64) -> bool {
        let fallback = self.config.segment_duration_secs;
        let pending = {
            let mut state = self.state.lock();
            if state.current_segment_id.is_some_and(|current| id <= current) {
                debug!(segment_id = id, "Ignoring already registered segment");
                return false;
            }

            let pending = state.take_pending(Some(id), fallback);
            let progress = state.last_progress;
            state
                .segments
                .insert(id, Segment::opened(id, &self.config.cache_dir, fallback));
            state.open_progress.insert(id, progress);
            state.current_segment_id = Some(id);
            pending
        };

        self.apply_finalized(pending).await;

        let checkpoint_due = {
            let mut state = self.state.lock();
            state.evict(self.capacity());
            state.since_checkpoint += 1;
            if state.since_checkpoint >= self.config.checkpoint_interval.max(1) {
                state.since_checkpoint = 0;
                true
            } else {
                false
            }
        };

        if checkpoint_due && let Err(e) = self.save_checkpoint().await {
            warn!("Failed to save cache checkpoint: {}", e);
        }
        true
    }

    /// Record capture progress (seconds since the capture process started).
    pub fn observe_progress(&self, position: f64) {
        let mut state = self.state.lock();
        if position >= 0.0 {
            state.last_progress = position;
        }
    }

    /// Forget the progress baseline. Called when a new capture process starts.
    pub fn reset_progress(&self) {
        self.state.lock().last_progress = 0.0;
    }

    /// Finalize every unfinished segment. Called when the capture process exits.
    pub async fn finalize_pending(&self) {
        let pending = self
            .state
            .lock()
            .take_pending(None, self.config.segment_duration_secs);
        self.apply_finalized(pending).await;
    }

    async fn apply_finalized(&self, pending: Vec<(u64, PathBuf, f64)>) {
        if pending.is_empty() {
            return;
        }

        let mut results = Vec::with_capacity(pending.len());
        for (id, path, duration) in pending {
            results.push((id, file_size(&path).await, duration));
        }

        let mut state = self.state.lock();
        for (id, size, duration) in results {
            let Some(segment) = state.segments.get_mut(&id) else {
                continue;
            };
            segment.duration_secs = duration;
            segment.size_bytes = size;
            segment.ready = size.is_some();
            if segment.ready {
                debug!(segment_id = id, duration, "Segment ready");
            } else {
                warn!(segment_id = id, path = %segment.file_path.display(), "Segment file missing, not ready");
            }
        }
    }

    /// Look up a segment, re-checking its file. A failed stat reports (and records) it as not ready.
    pub async fn get_segment(&self, id: u64) -> Option<Segment> {
        let segment = self.state.lock().segments.get(&id).cloned()?;
        if !segment.ready {
            return Some(segment);
        }

        match file_size(&segment.file_path).await {
            Some(size) => Some(Segment {
                size_bytes: Some(size),
                ..segment
            }),
            None => {
                self.mark_missing(&[id]);
                Some(Segment {
                    ready: false,
                    ..segment
                })
            }
        }
    }

    /// Ids of ready segments in ascending order.
    pub async fn available_segments(&self) -> Vec<u64> {
        self.ready_segments(0).await.into_iter().map(|s| s.id).collect()
    }

    /// Ready segments with `id >= from_id` in ascending order, files re-checked.
    pub async fn ready_segments(&self, from_id: u64) -> Vec<Segment> {
        let candidates: Vec<Segment> = self
            .state
            .lock()
            .segments
            .range(from_id..)
            .map(|(_, s)| s)
            .filter(|s| s.ready)
            .cloned()
            .collect();

        let mut ready = Vec::with_capacity(candidates.len());
        let mut missing = Vec::new();
        for segment in candidates {
            if file_size(&segment.file_path).await.is_some() {
                ready.push(segment);
            } else {
                missing.push(segment.id);
            }
        }

        if !missing.is_empty() {
            self.mark_missing(&missing);
        }
        ready
    }

    fn mark_missing(&self, ids: &[u64]) {
        let mut state = self.state.lock();
        for id in ids {
            if let Some(segment) = state.segments.get_mut(id) {
                warn!(segment_id = id, "Segment file disappeared, marking not ready");
                segment.ready = false;
                segment.size_bytes = None;
            }
        }
    }

    /// Seconds of ready media at or after `from_id`.
    pub fn lookahead_secs(&self, from_id: u64) -> f64 {
        self.state
            .lock()
            .segments
            .range(from_id..)
            .map(|(_, s)| s)
            .filter(|s| s.ready)
            .map(|s| s.duration_secs)
            .sum()
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let ready: Vec<&Segment> = state.segments.values().filter(|s| s.ready).collect();
        CacheStats {
            current_segment_id: state.current_segment_id,
            total_tracked: state.segments.len(),
            ready_segments: ready.len(),
            capacity: self.capacity(),
            ready_secs: ready.iter().map(|s| s.duration_secs).sum(),
        }
    }

    /// The id the next capture process should start numbering from.
    pub fn next_segment_id(&self) -> u64 {
        self.state
            .lock()
            .current_segment_id
            .map_or(0, |id| id + 1)
    }

    /// Oldest tracked id.
    pub fn floor_segment_id(&self) -> Option<u64> {
        self.state.lock().segments.keys().next().copied()
    }

    pub async fn save_checkpoint(&self) -> Result<()> {
        let checkpoint = self.state.lock().to_checkpoint();
        checkpoint.save(&self.config.checkpoint_path()).await?;
        debug!(
            current_segment_id = ?checkpoint.current_segment_id,
            segments = checkpoint.segments.len(),
            "Saved cache checkpoint"
        );
        Ok(())
    }

    /// Finalize unfinished segments and write a last checkpoint.
    pub async fn shutdown(&self) -> Result<()> {
        self.finalize_pending().await;
        self.save_checkpoint().await
    }
}
