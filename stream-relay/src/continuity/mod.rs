//! Position tracking across capture restarts and the served manifest.
//!
//! Positions are cumulative output seconds since the first start. Each capture
//! process reports progress relative to its own start, so
//! `confirmed = session_start + progress`. When the source loops, the position
//! at which the new pass began is remembered as `loop_origin`; the offset into
//! the source for a resume is `last_stable - loop_origin`.
//!
//! The session base is set from the offset a capture instance was actually
//! launched at ([`ContinuityController::begin_session`]). Between a failure
//! and the next launch, progress is ignored so late output from the old
//! process is never measured against the new base.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use m3u8_rs::{MediaPlaylist, MediaSegment};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{Segment, SegmentCache};
use crate::process::ResumeSource;
use crate::utils::fs::write_atomic;
use crate::{Error, Result};

/// File name of the manifest served to publishers.
pub const PLAYLIST_FILE: &str = "live.m3u8";

/// File name of the persisted continuity state.
pub const STATE_FILE: &str = "continuity.json";

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuityConfig {
    /// Resume failed captures from the last stable position.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Confirmed progress needed before the stable position moves.
    #[serde(default = "default_stable_step_secs")]
    pub stable_step_secs: f64,
    /// Ready segments required before publishing starts.
    #[serde(default = "default_min_segments")]
    pub min_segments: usize,
    /// How long to wait for `min_segments`.
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_stable_step_secs() -> f64 {
    3.0
}

fn default_min_segments() -> usize {
    3
}

fn default_wait_timeout_secs() -> u64 {
    60
}

impl Default for ContinuityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stable_step_secs: default_stable_step_secs(),
            min_segments: default_min_segments(),
            wait_timeout_secs: default_wait_timeout_secs(),
        }
    }
}

impl ContinuityConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }
}

/// Cross-restart position tracking.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContinuityState {
    /// Never decreases.
    pub last_stable_position: f64,
    /// Position at which the current capture process began.
    pub session_start_position: f64,
    pub total_restart_count: u64,
    /// Latest confirmed position, not yet promoted to stable.
    #[serde(default)]
    pub confirmed_position: f64,
    /// Position at which the current pass over the source began.
    #[serde(default)]
    pub loop_origin: f64,
    /// First segment the manifest serves.
    #[serde(default)]
    pub serving_segment_id: Option<u64>,
}

impl ContinuityState {
    /// Offset into the source matching the stable position.
    pub fn resume_offset(&self) -> f64 {
        (self.last_stable_position - self.loop_origin).max(0.0)
    }
}

pub struct ContinuityController {
    config: ContinuityConfig,
    cache: Arc<SegmentCache>,
    state: Mutex<ContinuityState>,
    /// Set by a failure, cleared when the next capture instance is launched.
    between_sessions: AtomicBool,
    playlist_path: PathBuf,
    state_path: PathBuf,
}

impl ContinuityController {
    pub fn new(config: ContinuityConfig, cache: Arc<SegmentCache>) -> Self {
        let dir = cache.dir().to_path_buf();
        Self {
            config,
            cache,
            state: Mutex::new(ContinuityState::default()),
            between_sessions: AtomicBool::new(false),
            playlist_path: dir.join(PLAYLIST_FILE),
            state_path: dir.join(STATE_FILE),
        }
    }

    pub fn config(&self) -> &ContinuityConfig {
        &self.config
    }

    pub fn playlist_path(&self) -> &PathBuf {
        &self.playlist_path
    }

    pub fn snapshot(&self) -> ContinuityState {
        self.state.lock().clone()
    }

    /// Load persisted state so a relaunched service resumes where it stopped.
    pub async fn restore(&self) {
        let content = match tokio::fs::read_to_string(&self.state_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!("Failed to read continuity state: {}", e);
                return;
            }
        };

        match serde_json::from_str::<ContinuityState>(&content) {
            Ok(mut restored) => {
                restored.session_start_position = restored.last_stable_position;
                restored.confirmed_position = restored.last_stable_position;
                info!(
                    position = restored.last_stable_position,
                    restarts = restored.total_restart_count,
                    "Restored continuity state"
                );
                *self.state.lock() = restored;
            }
            Err(e) => warn!("Corrupt continuity state, starting fresh: {}", e),
        }
    }

    /// Record capture progress (seconds since the capture process started).
    ///
    /// Returns `true` when the stable position advanced.
    pub async fn on_progress(&self, progress: f64) -> bool {
        if self.between_sessions.load(Ordering::Acquire) {
            debug!(progress, "Ignoring progress from a replaced capture");
            return false;
        }

        let advanced = {
            let mut state = self.state.lock();
            let confirmed = state.session_start_position + progress.max(0.0);
            state.confirmed_position = state.confirmed_position.max(confirmed);

            if confirmed - state.last_stable_position >= self.config.stable_step_secs {
                state.last_stable_position = confirmed;
                Some(state.clone())
            } else {
                None
            }
        };

        match advanced {
            Some(state) => {
                debug!(position = state.last_stable_position, "Stable position advanced");
                self.persist(&state).await;
                true
            }
            None => false,
        }
    }

    /// A publisher opened segment `id`; serving moves forward only.
    pub fn on_segment_consumed(&self, id: u64) {
        let mut state = self.state.lock();
        if state.serving_segment_id.is_none_or(|current| id > current) {
            state.serving_segment_id = Some(id);
        }
    }

    /// The capture pipeline is being resumed after a failure.
    ///
    /// Returns the offset into the source the new capture starts from.
    pub async fn handle_stream_failure(&self) -> f64 {
        self.between_sessions.store(true, Ordering::Release);
        let state = {
            let mut state = self.state.lock();
            state.session_start_position = state.last_stable_position;
            state.confirmed_position = state.last_stable_position;
            state.total_restart_count += 1;
            state.clone()
        };
        info!(
            position = state.last_stable_position,
            offset = state.resume_offset(),
            restarts = state.total_restart_count,
            "Resuming capture from last stable position"
        );
        self.persist(&state).await;
        state.resume_offset()
    }

    /// A capture instance was launched at `resume_from` seconds into the source.
    ///
    /// Its progress is measured from `loop_origin + resume_from`.
    pub fn begin_session(&self, resume_from: Option<f64>) {
        let start = {
            let mut state = self.state.lock();
            let start = state.loop_origin + resume_from.unwrap_or(0.0).max(0.0);
            state.session_start_position = start;
            state.confirmed_position = start;
            start
        };
        self.between_sessions.store(false, Ordering::Release);
        debug!(session_start = start, "Capture session started");
    }

    /// The source ran out and capture starts a new pass from the beginning.
    pub async fn on_loop_restart(&self) {
        let state = {
            let mut state = self.state.lock();
            let end = state.confirmed_position.max(state.last_stable_position);
            state.last_stable_position = end;
            state.session_start_position = end;
            state.confirmed_position = end;
            state.loop_origin = end;
            state.total_restart_count += 1;
            state.clone()
        };
        info!(position = state.loop_origin, "Source looped");
        self.persist(&state).await;
    }

    /// Offset into the source a failed capture should resume from.
    pub fn resume_offset(&self) -> Option<f64> {
        if !self.config.enabled {
            return None;
        }
        let offset = self.state.lock().resume_offset();
        (offset > 0.0).then_some(offset)
    }

    fn serving_from(&self) -> u64 {
        self.state.lock().serving_segment_id.unwrap_or(0)
    }

    /// Wait until `min_count` contiguous ready segments exist from the serving position.
    ///
    /// Always returns by `timeout`.
    pub async fn wait_for_segments(&self, min_count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let segments = self.cache.ready_segments(self.serving_from()).await;
            let contiguous = contiguous_prefix(&segments);
            if contiguous >= min_count {
                debug!(contiguous, min_count, "Enough segments cached");
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(contiguous, min_count, "Timed out waiting for segments");
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Write the manifest for ready segments from the serving position.
    ///
    /// Returns `None` when there is nothing to serve or the write failed.
    pub async fn generate_playlist(&self) -> Option<PathBuf> {
        let segments = self.cache.ready_segments(self.serving_from()).await;
        if segments.is_empty() {
            debug!("No ready segments, manifest not written");
            return None;
        }

        match self.write_playlist(&segments).await {
            Ok(()) => Some(self.playlist_path.clone()),
            Err(e) => {
                warn!("Failed to write manifest: {}", e);
                None
            }
        }
    }

    /// Refresh the manifest after the cache changed.
    pub async fn update_playlist(&self) -> Option<PathBuf> {
        self.generate_playlist().await
    }

    /// Move the serving position to `segment_id`. Fails unless that segment is ready.
    pub async fn seek_to(&self, segment_id: u64) -> bool {
        let ready = self
            .cache
            .get_segment(segment_id)
            .await
            .is_some_and(|s| s.ready);
        if !ready {
            warn!(segment_id, "Seek rejected, segment not ready");
            return false;
        }

        self.state.lock().serving_segment_id = Some(segment_id);
        info!(segment_id, "Serving position moved");
        self.generate_playlist().await;
        true
    }

    async fn write_playlist(&self, segments: &[Segment]) -> Result<()> {
        let target = segments
            .iter()
            .map(|s| s.duration_secs)
            .fold(0.0_f64, f64::max)
            .ceil()
            .max(1.0);

        let mut previous: Option<u64> = None;
        let media_segments = segments
            .iter()
            .map(|s| {
                let discontinuity = previous.is_some_and(|p| s.id != p + 1);
                previous = Some(s.id);
                MediaSegment {
                    uri: s.file_name(),
                    duration: s.duration_secs as f32,
                    discontinuity,
                    ..Default::default()
                }
            })
            .collect();

        let playlist = MediaPlaylist {
            version: Some(3),
            target_duration: target as _,
            media_sequence: segments[0].id,
            segments: media_segments,
            end_list: false,
            ..Default::default()
        };

        let mut out = Vec::new();
        playlist
            .write_to(&mut out)
            .map_err(|e| Error::io_path("rendering", &self.playlist_path, e))?;
        write_atomic(&self.playlist_path, out).await
    }

    async fn persist(&self, state: &ContinuityState) {
        let result = match serde_json::to_vec_pretty(state) {
            Ok(json) => write_atomic(&self.state_path, json).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!("Failed to persist continuity state: {}", e);
        }
    }
}

impl ResumeSource for ContinuityController {
    fn resume_position(&self) -> Option<f64> {
        self.resume_offset()
    }
}

/// Length of the run of consecutive ids at the start of `segments`.
fn contiguous_prefix(segments: &[Segment]) -> usize {
    match segments.first() {
        None => 0,
        Some(first) => segments
            .iter()
            .enumerate()
            .take_while(|(i, s)| s.id == first.id + *i as u64)
            .count(),
    }
}
