//! Multi-endpoint publishing.
//!
//! One supervised ffmpeg per active endpoint reads the served manifest and
//! pushes it to RTMP. Endpoints with priority 1 are primaries; anything higher
//! is a backup, activated by [`PublisherPool::fallback_quality`] and retired
//! again by [`PublisherPool::restore_quality`] once the primary is back.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::process::{
    CommandFactory, CommandSpec, LaunchContext, ProcessRole, ProcessSpawner, ProcessState,
    ProcessStats, ProcessSupervisor, RestartPolicy, RestartPolicyConfig, SupervisorEvent,
    SupervisorParts,
};
use crate::utils::redact::Redactor;
use crate::{Error, Result};

/// Priority of primary endpoints.
pub const PRIMARY_PRIORITY: u32 = 1;

/// Encoding parameters for one quality tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodingProfile {
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
    pub max_height: u32,
    pub frame_rate: u32,
    #[serde(default = "default_preset")]
    pub preset: String,
}

fn default_preset() -> String {
    "veryfast".to_string()
}

impl EncodingProfile {
    pub fn primary() -> Self {
        Self {
            video_bitrate_kbps: 4500,
            audio_bitrate_kbps: 160,
            max_height: 1080,
            frame_rate: 30,
            preset: default_preset(),
        }
    }

    pub fn backup() -> Self {
        Self {
            video_bitrate_kbps: 2500,
            audio_bitrate_kbps: 128,
            max_height: 720,
            frame_rate: 30,
            preset: default_preset(),
        }
    }

    /// Whether any dimension of `self` exceeds `other`.
    pub fn exceeds(&self, other: &Self) -> bool {
        self.video_bitrate_kbps > other.video_bitrate_kbps
            || self.audio_bitrate_kbps > other.audio_bitrate_kbps
            || self.max_height > other.max_height
            || self.frame_rate > other.frame_rate
    }

    /// Bring every dimension down to at most `limit`'s.
    pub fn clamped_to(&self, limit: &Self) -> Self {
        Self {
            video_bitrate_kbps: self.video_bitrate_kbps.min(limit.video_bitrate_kbps),
            audio_bitrate_kbps: self.audio_bitrate_kbps.min(limit.audio_bitrate_kbps),
            max_height: self.max_height.min(limit.max_height),
            frame_rate: self.frame_rate.min(limit.frame_rate),
            preset: self.preset.clone(),
        }
    }
}

/// A configured publishing destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    /// Full RTMP URL including the stream key. Never logged verbatim.
    pub url: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Overrides the tier profile.
    #[serde(default)]
    pub profile: Option<EncodingProfile>,
}

fn default_priority() -> u32 {
    PRIMARY_PRIORITY
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublisherConfig {
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    /// Reconnect ceiling per endpoint before it is disabled.
    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: u32,
    /// Delay between reactivating the primary and retiring backups.
    #[serde(default = "default_settle_secs")]
    pub restore_settle_secs: u64,
    #[serde(default = "EncodingProfile::primary")]
    pub primary_profile: EncodingProfile,
    #[serde(default = "EncodingProfile::backup")]
    pub backup_profile: EncodingProfile,
}

fn default_max_reconnects() -> u32 {
    10
}

fn default_settle_secs() -> u64 {
    10
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            max_reconnects: default_max_reconnects(),
            restore_settle_secs: default_settle_secs(),
            primary_profile: EncodingProfile::primary(),
            backup_profile: EncodingProfile::backup(),
        }
    }
}

/// Runtime state of an endpoint.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub name: String,
    pub url: String,
    pub priority: u32,
    pub active: bool,
    /// Exhausted its reconnect budget; stays inactive until reactivated.
    pub disabled: bool,
    pub failed_connections: u32,
    pub profile: EncodingProfile,
}

impl Endpoint {
    pub fn is_primary(&self) -> bool {
        self.priority <= PRIMARY_PRIORITY
    }
}

/// Public view of an endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStats {
    pub name: String,
    /// Redacted.
    pub url: String,
    pub priority: u32,
    pub active: bool,
    pub disabled: bool,
    pub failed_connections: u32,
    pub process: Option<ProcessStats>,
}

/// Builds the publish command for one endpoint.
#[derive(Debug, Clone)]
pub struct PublishCommand {
    pub ffmpeg_path: String,
    pub manifest: PathBuf,
    pub url: String,
    pub profile: EncodingProfile,
}

impl CommandFactory for PublishCommand {
    fn build(&self, _ctx: &LaunchContext) -> CommandSpec {
        let p = &self.profile;
        let manifest = self.manifest.to_string_lossy();
        let video_bitrate = format!("{}k", p.video_bitrate_kbps);
        let buffer_size = format!("{}k", p.video_bitrate_kbps * 2);
        let scale = format!("scale=-2:'min({},ih)'", p.max_height);
        let frame_rate = p.frame_rate.to_string();
        let gop = (p.frame_rate * 2).to_string();
        let audio_bitrate = format!("{}k", p.audio_bitrate_kbps);

        let args = [
            "-hide_banner",
            "-loglevel",
            "info",
            "-re",
            "-live_start_index",
            "0",
            "-i",
            &*manifest,
            "-c:v",
            "libx264",
            "-preset",
            p.preset.as_str(),
            "-b:v",
            video_bitrate.as_str(),
            "-maxrate",
            video_bitrate.as_str(),
            "-bufsize",
            buffer_size.as_str(),
            "-vf",
            scale.as_str(),
            "-r",
            frame_rate.as_str(),
            "-g",
            gop.as_str(),
            "-pix_fmt",
            "yuv420p",
            "-c:a",
            "aac",
            "-b:a",
            audio_bitrate.as_str(),
            "-ar",
            "44100",
            "-f",
            "flv",
            self.url.as_str(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        CommandSpec::new(&self.ffmpeg_path, args)
    }
}

/// Shared dependencies for publisher supervisors.
pub struct PoolParts {
    pub ffmpeg_path: String,
    pub spawner: Arc<dyn ProcessSpawner>,
    pub policy: RestartPolicyConfig,
    pub redactor: Redactor,
    pub events: mpsc::UnboundedSender<SupervisorEvent>,
    pub stop_timeout: Duration,
}

struct Slot {
    endpoint: Endpoint,
    supervisor: Option<ProcessSupervisor>,
}

struct PoolState {
    slots: Vec<Slot>,
    manifest: Option<PathBuf>,
}

impl PoolState {
    fn slot_mut(&mut self, name: &str) -> Result<&mut Slot> {
        self.slots
            .iter_mut()
            .find(|s| s.endpoint.name == name)
            .ok_or_else(|| Error::not_found("endpoint", name))
    }
}

pub struct PublisherPool {
    config: PublisherConfig,
    parts: PoolParts,
    state: Mutex<PoolState>,
    settle_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl PublisherPool {
    /// Build the pool. Primaries start active, backups inactive.
    pub fn new(config: PublisherConfig, parts: PoolParts) -> Result<Self> {
        if config.endpoints.is_empty() {
            return Err(Error::config("At least one publishing endpoint is required"));
        }

        let primary_profile = config.primary_profile.clone();
        let lowest = config
            .endpoints
            .iter()
            .map(|e| e.priority)
            .min()
            .unwrap_or(PRIMARY_PRIORITY);

        let mut slots = Vec::with_capacity(config.endpoints.len());
        for ep in &config.endpoints {
            if ep.name.is_empty() || ep.url.is_empty() {
                return Err(Error::config("Endpoint name and url must not be empty"));
            }
            if slots.iter().any(|s: &Slot| s.endpoint.name == ep.name) {
                return Err(Error::config(format!("Duplicate endpoint name: {}", ep.name)));
            }

            let is_primary = ep.priority <= PRIMARY_PRIORITY;
            let mut profile = ep.profile.clone().unwrap_or_else(|| {
                if is_primary {
                    primary_profile.clone()
                } else {
                    config.backup_profile.clone()
                }
            });
            if !is_primary && profile.exceeds(&primary_profile) {
                warn!(
                    endpoint = %ep.name,
                    "Backup profile exceeds the primary's footprint, clamping"
                );
                profile = profile.clamped_to(&primary_profile);
            }

            slots.push(Slot {
                endpoint: Endpoint {
                    name: ep.name.clone(),
                    url: ep.url.clone(),
                    priority: ep.priority,
                    active: ep.priority == lowest,
                    disabled: false,
                    failed_connections: 0,
                    profile,
                },
                supervisor: None,
            });
        }

        Ok(Self {
            config,
            parts,
            state: Mutex::new(PoolState {
                slots,
                manifest: None,
            }),
            settle_task: parking_lot::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Start a publisher for every active endpoint. Returns how many were started.
    pub async fn start(&self, manifest: &Path) -> Result<usize> {
        let mut state = self.state.lock().await;
        state.manifest = Some(manifest.to_path_buf());

        let mut started = 0;
        for slot in state.slots.iter_mut() {
            if slot.endpoint.active
                && !slot.endpoint.disabled
                && self.ensure_running(slot, manifest).await?
            {
                started += 1;
            }
        }
        info!(started, manifest = %manifest.display(), "Publishers started");
        Ok(started)
    }

    /// Stop every publisher. Endpoint activation is kept for the next start.
    pub async fn stop(&self) -> Result<()> {
        self.cancel_settle();
        let mut state = self.state.lock().await;
        for slot in state.slots.iter_mut() {
            if let Some(supervisor) = slot.supervisor.take() {
                supervisor.stop().await?;
            }
        }
        info!("Publishers stopped");
        Ok(())
    }

    /// Stop and start every active publisher against the current manifest.
    pub async fn restart_all(&self) -> Result<usize> {
        let manifest = self.state.lock().await.manifest.clone();
        self.stop().await?;
        match manifest {
            Some(manifest) => self.start(&manifest).await,
            None => Ok(0),
        }
    }

    /// Activate or deactivate an endpoint, starting or stopping its publisher.
    ///
    /// Activating also clears a `disabled` mark.
    pub async fn set_endpoint_active(&self, name: &str, active: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        let manifest = state.manifest.clone();
        let slot = state.slot_mut(name)?;
        self.apply_active(slot, active, manifest.as_deref()).await
    }

    /// Switch to the backup tier: activate the first inactive backup, then
    /// deactivate the active primaries.
    ///
    /// Returns `false` when there is no backup to fall back to.
    pub async fn fallback_quality(&self) -> Result<bool> {
        self.cancel_settle();
        let mut state = self.state.lock().await;
        let manifest = state.manifest.clone();

        let backup = state
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.endpoint.is_primary() && !s.endpoint.disabled)
            .min_by_key(|(_, s)| s.endpoint.priority)
            .map(|(i, _)| i);
        let Some(backup) = backup else {
            warn!("Quality fallback requested but no usable backup endpoint exists");
            return Ok(false);
        };

        let backup_was_active = state.slots[backup].endpoint.active;
        if !backup_was_active {
            let slot = &mut state.slots[backup];
            info!(endpoint = %slot.endpoint.name, "Activating backup endpoint");
            self.apply_active(slot, true, manifest.as_deref()).await?;
        }

        let mut changed = !backup_was_active;
        for slot in state.slots.iter_mut() {
            if slot.endpoint.is_primary() && slot.endpoint.active {
                info!(endpoint = %slot.endpoint.name, "Pausing primary endpoint");
                self.apply_active(slot, false, manifest.as_deref()).await?;
                changed = true;
            }
        }
        Ok(changed)
    }

    /// Reactivate the primaries; after the settle delay, retire active backups
    /// if a primary is connected.
    pub async fn restore_quality(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            let manifest = state.manifest.clone();
            for slot in state.slots.iter_mut() {
                if slot.endpoint.is_primary() && !slot.endpoint.active {
                    info!(endpoint = %slot.endpoint.name, "Reactivating primary endpoint");
                    self.apply_active(slot, true, manifest.as_deref()).await?;
                }
            }
        }

        let settle = Duration::from_secs(self.config.restore_settle_secs);
        let pool = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(settle).await;
            if let Err(e) = pool.retire_backups().await {
                warn!("Failed to retire backup endpoints: {}", e);
            }
        });

        if let Some(previous) = self.settle_task.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn retire_backups(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let primary_connected = state.slots.iter().any(|s| {
            s.endpoint.is_primary()
                && s.endpoint.active
                && s.supervisor
                    .as_ref()
                    .is_some_and(|sup| sup.state() == ProcessState::Connected)
        });
        if !primary_connected {
            warn!("Primary not connected after settle delay, keeping backup active");
            return Ok(());
        }

        for slot in state.slots.iter_mut() {
            if !slot.endpoint.is_primary() && slot.endpoint.active {
                info!(endpoint = %slot.endpoint.name, "Retiring backup endpoint");
                self.apply_active(slot, false, None).await?;
            }
        }
        Ok(())
    }

    /// An endpoint's publisher exhausted its reconnect budget.
    ///
    /// Returns `false` when the slot's current publisher is not the one that
    /// gave up (it was stopped or replaced since), leaving the endpoint as is.
    pub async fn on_gave_up(&self, name: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let slot = state.slot_mut(name)?;
        let current_failed = slot
            .supervisor
            .as_ref()
            .is_some_and(|sup| sup.state() == ProcessState::Failed);
        if !current_failed {
            return Ok(false);
        }

        slot.endpoint.active = false;
        slot.endpoint.disabled = true;
        slot.endpoint.failed_connections += 1;
        warn!(
            endpoint = %name,
            failed_connections = slot.endpoint.failed_connections,
            "Endpoint disabled after exhausting reconnects"
        );
        if let Some(supervisor) = slot.supervisor.take() {
            supervisor.stop().await?;
        }
        Ok(true)
    }

    pub async fn endpoints(&self) -> Vec<Endpoint> {
        self.state
            .lock()
            .await
            .slots
            .iter()
            .map(|s| s.endpoint.clone())
            .collect()
    }

    pub async fn stats(&self) -> Vec<EndpointStats> {
        self.state
            .lock()
            .await
            .slots
            .iter()
            .map(|s| EndpointStats {
                name: s.endpoint.name.clone(),
                url: self.parts.redactor.redact(&s.endpoint.url).into_owned(),
                priority: s.endpoint.priority,
                active: s.endpoint.active,
                disabled: s.endpoint.disabled,
                failed_connections: s.endpoint.failed_connections,
                process: s.supervisor.as_ref().map(ProcessSupervisor::stats),
            })
            .collect()
    }

    /// Active endpoints whose publisher is connected.
    pub async fn active_connections(&self) -> usize {
        self.state
            .lock()
            .await
            .slots
            .iter()
            .filter(|s| s.endpoint.active)
            .filter_map(|s| s.supervisor.as_ref())
            .filter(|sup| sup.state() == ProcessState::Connected)
            .count()
    }

    /// Reconnect attempts summed over active endpoints.
    pub async fn active_reconnect_attempts(&self) -> u32 {
        self.state
            .lock()
            .await
            .slots
            .iter()
            .filter(|s| s.endpoint.active)
            .filter_map(|s| s.supervisor.as_ref())
            .map(|sup| sup.stats().reconnect_attempts)
            .sum()
    }

    /// A backup is active while no primary is.
    pub async fn fallback_engaged(&self) -> bool {
        let state = self.state.lock().await;
        let backup_active = state
            .slots
            .iter()
            .any(|s| !s.endpoint.is_primary() && s.endpoint.active);
        let primary_active = state
            .slots
            .iter()
            .any(|s| s.endpoint.is_primary() && s.endpoint.active);
        backup_active && !primary_active
    }

    async fn apply_active(&self, slot: &mut Slot, active: bool, manifest: Option<&Path>) -> Result<()> {
        slot.endpoint.active = active;
        if active {
            slot.endpoint.disabled = false;
            if let Some(manifest) = manifest {
                self.ensure_running(slot, manifest).await?;
            }
        } else if let Some(supervisor) = slot.supervisor.take() {
            supervisor.stop().await?;
        }
        debug!(endpoint = %slot.endpoint.name, active, "Endpoint activation changed");
        Ok(())
    }

    /// Start the slot's publisher unless one is already running.
    async fn ensure_running(&self, slot: &mut Slot, manifest: &Path) -> Result<bool> {
        if let Some(supervisor) = &slot.supervisor {
            if supervisor.is_running() {
                return Ok(false);
            }
            // Stopped or failed: replace it so the new manifest is picked up.
            supervisor.stop().await?;
        }

        let supervisor = ProcessSupervisor::spawn(
            ProcessRole::Publisher(slot.endpoint.name.clone()),
            SupervisorParts {
                factory: Arc::new(PublishCommand {
                    ffmpeg_path: self.parts.ffmpeg_path.clone(),
                    manifest: manifest.to_path_buf(),
                    url: slot.endpoint.url.clone(),
                    profile: slot.endpoint.profile.clone(),
                }),
                spawner: self.parts.spawner.clone(),
                policy: RestartPolicy::new(
                    self.parts.policy.with_max_attempts(self.config.max_reconnects),
                )
                .looping(true),
                resume: None,
                redactor: self.parts.redactor.clone(),
                events: self.parts.events.clone(),
                stop_timeout: self.parts.stop_timeout,
            },
        );
        let started = supervisor.start().await?;
        slot.supervisor = Some(supervisor);
        Ok(started)
    }

    fn cancel_settle(&self) {
        if let Some(task) = self.settle_task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::{FakeSpawner, Script};

    const PRIMARY_URL: &str = "rtmp://a.rtmp.youtube.com/live2/primary-key";
    const BACKUP_URL: &str = "rtmp://b.rtmp.youtube.com/live2?backup=1/backup-key";

    fn endpoints() -> Vec<EndpointConfig> {
        vec![
            EndpointConfig {
                name: "primary".to_string(),
                url: PRIMARY_URL.to_string(),
                priority: 1,
                profile: None,
            },
            EndpointConfig {
                name: "backup".to_string(),
                url: BACKUP_URL.to_string(),
                priority: 2,
                profile: None,
            },
        ]
    }

    fn pool_with(
        config: PublisherConfig,
        spawner: Arc<FakeSpawner>,
    ) -> (Arc<PublisherPool>, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = PublisherPool::new(
            config,
            PoolParts {
                ffmpeg_path: "ffmpeg".to_string(),
                spawner,
                policy: RestartPolicyConfig::default(),
                redactor: Redactor::from_urls([PRIMARY_URL, BACKUP_URL]),
                events: tx,
                stop_timeout: Duration::from_secs(5),
            },
        )
        .unwrap();
        (Arc::new(pool), rx)
    }

    fn pool(spawner: Arc<FakeSpawner>) -> (Arc<PublisherPool>, mpsc::UnboundedReceiver<SupervisorEvent>) {
        pool_with(
            PublisherConfig {
                endpoints: endpoints(),
                ..Default::default()
            },
            spawner,
        )
    }

    async fn active_names(pool: &PublisherPool) -> Vec<String> {
        pool.endpoints()
            .await
            .into_iter()
            .filter(|e| e.active)
            .map(|e| e.name)
            .collect()
    }

    #[test]
    fn test_requires_endpoints() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = PublisherPool::new(
            PublisherConfig::default(),
            PoolParts {
                ffmpeg_path: "ffmpeg".to_string(),
                spawner: FakeSpawner::new(vec![]),
                policy: RestartPolicyConfig::default(),
                redactor: Redactor::default(),
                events: tx,
                stop_timeout: Duration::from_secs(5),
            },
        );
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_publish_command() {
        let command = PublishCommand {
            ffmpeg_path: "/usr/bin/ffmpeg".to_string(),
            manifest: PathBuf::from("/cache/live.m3u8"),
            url: PRIMARY_URL.to_string(),
            profile: EncodingProfile::primary(),
        }
        .build(&LaunchContext::default());

        assert_eq!(command.program, "/usr/bin/ffmpeg");
        let joined = command.args.join(" ");
        assert!(joined.contains("-live_start_index 0 -i /cache/live.m3u8"));
        assert!(joined.contains("-b:v 4500k"));
        assert!(joined.ends_with(&format!("-f flv {PRIMARY_URL}")));
    }

    #[test]
    fn test_profile_clamp() {
        let big = EncodingProfile {
            video_bitrate_kbps: 8000,
            max_height: 720,
            ..EncodingProfile::primary()
        };
        assert!(big.exceeds(&EncodingProfile::primary()));
        let clamped = big.clamped_to(&EncodingProfile::primary());
        assert_eq!(clamped.video_bitrate_kbps, 4500);
        assert_eq!(clamped.max_height, 720);
        assert!(!EncodingProfile::backup().exceeds(&EncodingProfile::primary()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_backup_profile_is_clamped() {
        let mut eps = endpoints();
        eps[1].profile = Some(EncodingProfile {
            video_bitrate_kbps: 9000,
            ..EncodingProfile::backup()
        });
        let (pool, _rx) = pool_with(
            PublisherConfig {
                endpoints: eps,
                ..Default::default()
            },
            FakeSpawner::new(vec![]),
        );
        let backup = pool
            .endpoints()
            .await
            .into_iter()
            .find(|e| e.name == "backup")
            .unwrap();
        assert_eq!(backup.profile.video_bitrate_kbps, 4500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_only_primary() {
        let spawner = FakeSpawner::with_fallback([], Script::connected());
        let (pool, _rx) = pool(spawner.clone());

        let started = pool.start(Path::new("/cache/live.m3u8")).await.unwrap();
        assert_eq!(started, 1);
        assert_eq!(spawner.spawned(), 1);
        assert!(spawner.commands()[0].args.last().unwrap().ends_with("primary-key"));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.active_connections().await, 1);
        assert_eq!(active_names(&pool).await, vec!["primary"]);
        assert!(!pool.fallback_engaged().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_then_restore_leaves_only_primary() {
        let spawner = FakeSpawner::with_fallback([], Script::connected());
        let (pool, _rx) = pool(spawner.clone());
        pool.start(Path::new("/cache/live.m3u8")).await.unwrap();

        assert!(pool.fallback_quality().await.unwrap());
        assert_eq!(active_names(&pool).await, vec!["backup"]);
        assert!(pool.fallback_engaged().await);

        // A second fallback changes nothing.
        assert!(!pool.fallback_quality().await.unwrap());

        pool.restore_quality().await.unwrap();
        assert_eq!(active_names(&pool).await, vec!["primary", "backup"]);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(active_names(&pool).await, vec!["primary"]);
        assert_eq!(pool.active_connections().await, 1);
        assert!(!pool.fallback_engaged().await);
        assert_eq!(spawner.spawned(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_keeps_backup_when_primary_not_connected() {
        // The primary never reports progress after it is reactivated.
        let spawner = FakeSpawner::with_fallback(
            [Script::connected(), Script::connected()],
            Script::Run { lines: vec![] },
        );
        let (pool, _rx) = pool(spawner);
        pool.start(Path::new("/cache/live.m3u8")).await.unwrap();
        pool.fallback_quality().await.unwrap();

        pool.restore_quality().await.unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(active_names(&pool).await, vec!["primary", "backup"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_cancels_pending_restore() {
        let spawner = FakeSpawner::with_fallback([], Script::connected());
        let (pool, _rx) = pool(spawner);
        pool.start(Path::new("/cache/live.m3u8")).await.unwrap();

        pool.fallback_quality().await.unwrap();
        pool.restore_quality().await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        pool.fallback_quality().await.unwrap();

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(active_names(&pool).await, vec!["backup"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_endpoint_active() {
        let spawner = FakeSpawner::with_fallback([], Script::connected());
        let (pool, _rx) = pool(spawner.clone());

        let err = pool.set_endpoint_active("missing", true).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));

        // Before a manifest exists activation is recorded but nothing spawns.
        pool.set_endpoint_active("backup", true).await.unwrap();
        assert_eq!(spawner.spawned(), 0);

        pool.start(Path::new("/cache/live.m3u8")).await.unwrap();
        assert_eq!(spawner.spawned(), 2);

        pool.set_endpoint_active("backup", false).await.unwrap();
        assert_eq!(active_names(&pool).await, vec!["primary"]);
    }

    async fn wait_gave_up(rx: &mut mpsc::UnboundedReceiver<SupervisorEvent>) -> ProcessRole {
        while let Some(event) = rx.recv().await {
            if let SupervisorEvent::GaveUp { role, .. } = event {
                return role;
            }
        }
        panic!("event channel closed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_gave_up_disables_endpoint() {
        let spawner = FakeSpawner::with_fallback([Script::exit(1)], Script::connected());
        let (pool, mut rx) = pool_with(
            PublisherConfig {
                endpoints: endpoints(),
                max_reconnects: 1,
                ..Default::default()
            },
            spawner,
        );
        pool.start(Path::new("/cache/live.m3u8")).await.unwrap();

        let role = wait_gave_up(&mut rx).await;
        assert_eq!(role, ProcessRole::Publisher("primary".to_string()));

        assert!(pool.on_gave_up("primary").await.unwrap());
        let primary = pool
            .endpoints()
            .await
            .into_iter()
            .find(|e| e.name == "primary")
            .unwrap();
        assert!(!primary.active);
        assert!(primary.disabled);
        assert_eq!(primary.failed_connections, 1);

        // Administrative reactivation clears the mark.
        pool.set_endpoint_active("primary", true).await.unwrap();
        let primary = pool.endpoints().await.into_iter().next().unwrap();
        assert!(primary.active && !primary.disabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_give_up_from_replaced_publisher_is_ignored() {
        let spawner = FakeSpawner::with_fallback([Script::exit(1)], Script::connected());
        let (pool, mut rx) = pool_with(
            PublisherConfig {
                endpoints: endpoints(),
                max_reconnects: 1,
                ..Default::default()
            },
            spawner.clone(),
        );
        pool.start(Path::new("/cache/live.m3u8")).await.unwrap();
        wait_gave_up(&mut rx).await;

        // Replaced before the give-up is handled.
        pool.restart_all().await.unwrap();
        assert_eq!(spawner.spawned(), 2);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(!pool.on_gave_up("primary").await.unwrap());
        let primary = pool.endpoints().await.into_iter().next().unwrap();
        assert!(primary.active);
        assert!(!primary.disabled);
        assert_eq!(primary.failed_connections, 0);
        assert_eq!(pool.active_connections().await, 1);

        // Unknown endpoints are still reported.
        assert!(matches!(
            pool.on_gave_up("missing").await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_redact_urls() {
        let spawner = FakeSpawner::with_fallback([], Script::connected());
        let (pool, _rx) = pool(spawner);
        pool.start(Path::new("/cache/live.m3u8")).await.unwrap();

        let stats = pool.stats().await;
        assert_eq!(stats.len(), 2);
        assert!(stats.iter().all(|s| !s.url.contains("key")));
        assert!(stats[0].process.is_some());
        assert!(stats[1].process.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_attempts_count_active_only() {
        let spawner = FakeSpawner::with_fallback(
            [Script::exit(1), Script::exit(1)],
            Script::connected(),
        );
        let (pool, _rx) = pool(spawner);
        pool.start(Path::new("/cache/live.m3u8")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.active_reconnect_attempts().await, 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(pool.active_reconnect_attempts().await, 2);
    }
}
