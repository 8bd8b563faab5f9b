//! The relay: capture, cache, continuity, publishers and health checks wired
//! together behind the operations a control surface needs.
//!
//! All supervisor events flow through one router task, which is the only
//! writer of segment registrations and capture progress.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheStats, SEGMENT_FILE_PATTERN, SegmentCache};
use crate::config::RelayConfig;
use crate::continuity::{ContinuityController, ContinuityState};
use crate::health::{
    ComponentHealth, HealthMonitor, HealthSample, HealthStatus, HealthTarget, overall_status,
};
use crate::process::{
    CommandFactory, CommandSpec, DiagnosticEvent, ExitClass, LaunchContext, ProcessRole,
    ProcessSpawner, ProcessState, ProcessStats, ProcessSupervisor, RestartAction, RestartPolicy, ResumeSource,
    SupervisorEvent, SupervisorParts,
};
use crate::publisher::{EndpointStats, PoolParts, PublisherPool};
use crate::utils::redact::Redactor;
use crate::Result;

/// Playlist the capture process maintains for its own rolling window.
pub const CAPTURE_PLAYLIST_FILE: &str = "capture.m3u8";

/// Builds the capture command: source → HLS segments in the cache directory.
///
/// Numbering always continues from the cache's next id so ids are never reused.
pub struct CaptureCommand {
    ffmpeg_path: String,
    source_url: String,
    cache: Arc<SegmentCache>,
}

impl CaptureCommand {
    pub fn new(ffmpeg_path: impl Into<String>, source_url: impl Into<String>, cache: Arc<SegmentCache>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            source_url: source_url.into(),
            cache,
        }
    }
}

impl CommandFactory for CaptureCommand {
    fn build(&self, ctx: &LaunchContext) -> CommandSpec {
        let dir = self.cache.dir();
        let config = self.cache.config();

        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "info", "-re"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if let Some(offset) = ctx.resume_from.filter(|offset| *offset > 0.0) {
            args.push("-ss".to_string());
            args.push(format!("{offset:.3}"));
        }
        args.extend([
            "-i".to_string(),
            self.source_url.clone(),
            "-c".to_string(),
            "copy".to_string(),
            "-f".to_string(),
            "hls".to_string(),
            "-hls_time".to_string(),
            config.segment_duration_secs.to_string(),
            "-hls_list_size".to_string(),
            self.cache.capacity().to_string(),
            "-hls_flags".to_string(),
            "delete_segments".to_string(),
            "-start_number".to_string(),
            self.cache.next_segment_id().to_string(),
            "-hls_segment_filename".to_string(),
            dir.join(SEGMENT_FILE_PATTERN).to_string_lossy().into_owned(),
            dir.join(CAPTURE_PLAYLIST_FILE).to_string_lossy().into_owned(),
        ]);

        CommandSpec::new(&self.ffmpeg_path, args)
    }
}

/// Status snapshot for the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct RelayHealth {
    pub status: HealthStatus,
    pub running: bool,
    pub uptime_secs: Option<u64>,
    /// Seconds of ready media from the serving position on.
    pub lookahead_secs: f64,
    /// Latest redacted error from the capture or any publisher.
    pub last_error: Option<String>,
    pub capture: ProcessStats,
    pub endpoints: Vec<EndpointStats>,
    pub continuity: ContinuityState,
    pub cache: CacheStats,
    pub components: Vec<ComponentHealth>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct Lifecycle {
    initialized: bool,
    started_at: Option<DateTime<Utc>>,
    /// Cancels the health monitor of the current run.
    run_token: Option<CancellationToken>,
    publish_task: Option<JoinHandle<()>>,
}

pub struct Relay {
    config: RelayConfig,
    cache: Arc<SegmentCache>,
    continuity: Arc<ContinuityController>,
    capture: ProcessSupervisor,
    pool: Arc<PublisherPool>,
    monitor: Arc<HealthMonitor>,
    lifecycle: Mutex<Lifecycle>,
    running: AtomicBool,
    /// Publishers were launched for the current run.
    publishing: Arc<AtomicBool>,
    shutdown: CancellationToken,
    router: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Relay {
    /// Validate `config` and wire every component. Must run inside a tokio runtime.
    pub fn build(config: RelayConfig, spawner: Arc<dyn ProcessSpawner>) -> Result<Arc<Self>> {
        config.validate()?;

        let redactor = Redactor::from_urls(config.publisher.endpoints.iter().map(|e| e.url.as_str()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let cache = Arc::new(SegmentCache::new(config.cache.clone()));
        let continuity = Arc::new(ContinuityController::new(
            config.continuity.clone(),
            cache.clone(),
        ));

        let capture = ProcessSupervisor::spawn(
            ProcessRole::Capture,
            SupervisorParts {
                factory: Arc::new(CaptureCommand::new(
                    &config.ffmpeg_path,
                    &config.source_url,
                    cache.clone(),
                )),
                spawner: spawner.clone(),
                policy: RestartPolicy::new(config.restart.clone())
                    .looping(config.loop_source)
                    .resuming(config.continuity.enabled),
                resume: Some(continuity.clone() as Arc<dyn ResumeSource>),
                redactor: redactor.clone(),
                events: events_tx.clone(),
                stop_timeout: config.stop_timeout(),
            },
        );

        let pool = Arc::new(PublisherPool::new(
            config.publisher.clone(),
            PoolParts {
                ffmpeg_path: config.ffmpeg_path.clone(),
                spawner,
                policy: config.restart.clone(),
                redactor,
                events: events_tx,
                stop_timeout: config.stop_timeout(),
            },
        )?);

        let shutdown = CancellationToken::new();
        let router = EventRouter {
            cache: cache.clone(),
            continuity: continuity.clone(),
            pool: pool.clone(),
            continuity_enabled: config.continuity.enabled,
        };
        let router = tokio::spawn(router.run(events_rx, shutdown.clone()));

        Ok(Arc::new(Self {
            monitor: Arc::new(HealthMonitor::new(config.health.clone())),
            config,
            cache,
            continuity,
            capture,
            pool,
            lifecycle: Mutex::new(Lifecycle::default()),
            running: AtomicBool::new(false),
            publishing: Arc::new(AtomicBool::new(false)),
            shutdown,
            router: parking_lot::Mutex::new(Some(router)),
        }))
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<SegmentCache> {
        &self.cache
    }

    pub fn continuity(&self) -> &Arc<ContinuityController> {
        &self.continuity
    }

    pub fn pool(&self) -> &Arc<PublisherPool> {
        &self.pool
    }

    pub fn capture(&self) -> &ProcessSupervisor {
        &self.capture
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start capturing; publishers follow once enough segments are cached.
    ///
    /// Returns `false` if the relay is already running.
    pub async fn start(self: &Arc<Self>) -> Result<bool> {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.is_running() {
            warn!("Start requested but relay is already running");
            return Ok(false);
        }

        if !lifecycle.initialized {
            self.cache.initialize().await?;
            self.continuity.restore().await;
            lifecycle.initialized = true;
        }

        let ctx = LaunchContext {
            resume_from: self.continuity.resume_offset(),
        };
        self.capture.start_with(ctx).await?;
        self.running.store(true, Ordering::Release);
        lifecycle.started_at = Some(Utc::now());

        let run_token = self.shutdown.child_token();
        let target: Arc<dyn HealthTarget> = self.clone();
        self.monitor.clone().spawn(target, run_token.clone());
        lifecycle.run_token = Some(run_token);
        lifecycle.publish_task = Some(self.spawn_publishing(false));

        info!(
            source = %self.config.source_url,
            resume_from = ?ctx.resume_from,
            "Relay started"
        );
        Ok(true)
    }

    /// Stop publishers and capture and write a final checkpoint. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if !self.running.swap(false, Ordering::AcqRel) {
            debug!("Stop requested but relay is not running");
            return Ok(());
        }

        if let Some(token) = lifecycle.run_token.take() {
            token.cancel();
        }
        if let Some(task) = lifecycle.publish_task.take() {
            task.abort();
        }
        self.publishing.store(false, Ordering::Release);
        lifecycle.started_at = None;

        self.pool.stop().await?;
        self.capture.stop().await?;
        self.cache.shutdown().await?;
        info!("Relay stopped");
        Ok(())
    }

    /// Full stop and start with fresh attempt budgets.
    pub async fn restart(self: &Arc<Self>) -> Result<()> {
        info!("Relay restart requested");
        self.stop().await?;
        self.start().await?;
        Ok(())
    }

    /// Stop the relay and the event router. The relay cannot be started again.
    pub async fn shutdown(&self) -> Result<()> {
        let result = self.stop().await;
        self.shutdown.cancel();
        let router = self.router.lock().take();
        if let Some(router) = router
            && let Err(e) = router.await
        {
            warn!("Event router ended abnormally: {}", e);
        }
        result
    }

    /// Restart the capture from the last stable position and relaunch publishers.
    pub async fn continuity_restart(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if !self.is_running() {
            return Ok(());
        }

        let offset = if self.config.continuity.enabled {
            self.continuity.handle_stream_failure().await
        } else {
            0.0
        };
        let ctx = LaunchContext {
            resume_from: (offset > 0.0).then_some(offset),
        };
        self.capture.restart(ctx).await?;

        if let Some(task) = lifecycle.publish_task.take() {
            task.abort();
        }
        lifecycle.publish_task = Some(self.spawn_publishing(true));
        Ok(())
    }

    /// Serve from `segment_id` on. Publishers are restarted to pick up the new manifest.
    pub async fn seek_to(&self, segment_id: u64) -> Result<bool> {
        if !self.continuity.seek_to(segment_id).await {
            return Ok(false);
        }
        if self.publishing.load(Ordering::Acquire) {
            self.pool.restart_all().await?;
        }
        Ok(true)
    }

    pub async fn fallback_quality(&self) -> Result<bool> {
        self.pool.fallback_quality().await
    }

    pub async fn restore_quality(&self) -> Result<()> {
        self.pool.restore_quality().await
    }

    pub async fn sample(&self) -> HealthSample {
        let serving = self.continuity.snapshot().serving_segment_id.unwrap_or(0);
        let capture = self.capture.stats();
        // A non-looping source that reached its end is finished, not dead.
        let capture_finished = capture.state == ProcessState::Stopped
            && capture.last_exit_class == Some(ExitClass::EndOfInput);
        HealthSample {
            relay_running: self.is_running() && self.publishing.load(Ordering::Acquire),
            capture_running: capture.state.is_running() || capture_finished,
            lookahead_secs: self.cache.lookahead_secs(serving),
            active_connections: self.pool.active_connections().await,
            active_reconnect_attempts: self.pool.active_reconnect_attempts().await,
            fallback_engaged: self.pool.fallback_engaged().await,
        }
    }

    pub async fn health(&self) -> RelayHealth {
        let running = self.is_running();
        let started_at = self.lifecycle.lock().await.started_at;
        let sample = self.sample().await;
        let capture = self.capture.stats();
        let endpoints = self.pool.stats().await;

        let components = if running {
            sample.components(self.monitor.config())
        } else {
            Vec::new()
        };
        let last_error = capture.last_error.clone().or_else(|| {
            endpoints
                .iter()
                .find_map(|e| e.process.as_ref().and_then(|p| p.last_error.clone()))
        });

        RelayHealth {
            status: overall_status(&components),
            running,
            uptime_secs: started_at.map(|t| (Utc::now() - t).num_seconds().max(0) as u64),
            lookahead_secs: sample.lookahead_secs,
            last_error,
            capture,
            endpoints,
            continuity: self.continuity.snapshot(),
            cache: self.cache.stats(),
            components,
            timestamp: Utc::now(),
        }
    }

    /// Wait for segments, write the manifest and (re)start publishers.
    fn spawn_publishing(&self, restart: bool) -> JoinHandle<()> {
        let continuity = self.continuity.clone();
        let pool = self.pool.clone();
        let publishing = self.publishing.clone();
        let min_segments = self.config.continuity.min_segments;
        let timeout = self.config.continuity.wait_timeout();
        publishing.store(false, Ordering::Release);

        tokio::spawn(async move {
            if !continuity.wait_for_segments(min_segments, timeout).await {
                warn!(min_segments, "Starting publishers with fewer segments than required");
            }

            match continuity.generate_playlist().await {
                Some(manifest) => {
                    if restart && let Err(e) = pool.stop().await {
                        warn!("Failed to stop publishers: {}", e);
                    }
                    match pool.start(&manifest).await {
                        Ok(started) => info!(started, "Publishing started"),
                        Err(e) => error!("Failed to start publishers: {}", e),
                    }
                }
                None => error!("No segments available, publishers not started"),
            }
            publishing.store(true, Ordering::Release);
        })
    }

    /// Path of the manifest publishers read.
    pub fn manifest_path(&self) -> PathBuf {
        self.continuity.playlist_path().clone()
    }
}

#[async_trait]
impl HealthTarget for Relay {
    async fn sample(&self) -> HealthSample {
        Relay::sample(self).await
    }

    async fn continuity_restart(&self) -> Result<()> {
        Relay::continuity_restart(self).await
    }

    async fn fallback_quality(&self) -> Result<bool> {
        Relay::fallback_quality(self).await
    }

    async fn restore_quality(&self) -> Result<()> {
        Relay::restore_quality(self).await
    }
}

/// Routes supervisor events to the cache, continuity controller and pool.
struct EventRouter {
    cache: Arc<SegmentCache>,
    continuity: Arc<ContinuityController>,
    pool: Arc<PublisherPool>,
    continuity_enabled: bool,
}

impl EventRouter {
    async fn run(self, mut events: mpsc::UnboundedReceiver<SupervisorEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
            }
        }
        debug!("Event router stopped");
    }

    async fn handle(&self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Spawned {
                role: ProcessRole::Capture,
                resume_from,
                ..
            } => {
                self.cache.reset_progress();
                self.continuity.begin_session(resume_from);
            }

            SupervisorEvent::Diagnostic {
                role: ProcessRole::Capture,
                event,
            } => match event {
                DiagnosticEvent::SegmentReady(id) => {
                    if self.cache.register_segment(id).await {
                        self.continuity.update_playlist().await;
                    }
                }
                DiagnosticEvent::Progress(position) => {
                    self.cache.observe_progress(position);
                    self.continuity.on_progress(position).await;
                }
                _ => {}
            },

            SupervisorEvent::Diagnostic {
                role: ProcessRole::Publisher(_),
                event: DiagnosticEvent::SegmentConsumed(id),
            } => self.continuity.on_segment_consumed(id),

            SupervisorEvent::Exited {
                role: ProcessRole::Capture,
                class,
                action,
                ..
            } => {
                self.cache.finalize_pending().await;
                self.continuity.update_playlist().await;
                match (class, action) {
                    (ExitClass::EndOfInput, RestartAction::ImmediateRestart { .. }) => {
                        self.continuity.on_loop_restart().await;
                    }
                    (
                        ExitClass::Failure,
                        RestartAction::BackoffRestart { .. } | RestartAction::ResumeRestart { .. },
                    ) if self.continuity_enabled => {
                        self.continuity.handle_stream_failure().await;
                    }
                    _ => {}
                }
            }

            SupervisorEvent::GaveUp {
                role: ProcessRole::Publisher(name),
                ..
            } => match self.pool.on_gave_up(&name).await {
                Ok(true) => {}
                Ok(false) => debug!(endpoint = %name, "Ignoring give-up from a replaced publisher"),
                Err(e) => warn!(endpoint = %name, "Failed to disable endpoint: {}", e),
            },

            SupervisorEvent::GaveUp {
                role: ProcessRole::Capture,
                attempts,
            } => {
                error!(attempts, "Capture gave up; an explicit restart is required");
            }

            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;

    #[tokio::test]
    async fn test_capture_command() {
        let temp = tempfile::TempDir::new().unwrap();
        let cache = Arc::new(SegmentCache::new(CacheConfig {
            cache_dir: temp.path().to_path_buf(),
            segment_duration_secs: 4.0,
            max_cache_secs: 40.0,
            checkpoint_interval: 100,
        }));
        cache.initialize().await.unwrap();
        cache.register_segment(6).await;

        let command = CaptureCommand::new("ffmpeg", "https://example.com/video.mp4", cache);

        let fresh = command.build(&LaunchContext::default()).args.join(" ");
        assert!(!fresh.contains("-ss"));
        assert!(fresh.contains("-i https://example.com/video.mp4"));
        assert!(fresh.contains("-hls_list_size 10"));
        assert!(fresh.contains("-start_number 7"));
        assert!(fresh.contains("segment_%d.ts"));

        let resumed = command.build(&LaunchContext::resume_from(12.5)).args.join(" ");
        assert!(resumed.contains("-ss 12.500 -i"));
    }
}
