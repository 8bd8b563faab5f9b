//! Periodic health checks and corrective actions.
//!
//! The monitor samples the relay on a fixed interval and applies the first
//! matching rule: restart a dead capture, restart when no publisher is
//! connected, fall back to the backup tier when publishers keep reconnecting,
//! or restore the primary tier once things calm down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;

/// Health status of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    #[default]
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Health information for a single component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
    /// Last check time (RFC 3339).
    pub last_check: Option<String>,
}

impl ComponentHealth {
    pub fn healthy(name: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Healthy, None)
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Unhealthy, Some(message.into()))
    }

    fn with_status(name: impl Into<String>, status: HealthStatus, message: Option<String>) -> Self {
        Self {
            name: name.into(),
            status,
            message,
            last_check: Some(chrono::Utc::now().to_rfc3339()),
        }
    }
}

/// Worst status among `components`; `Unknown` when there are none.
pub fn overall_status(components: &[ComponentHealth]) -> HealthStatus {
    components
        .iter()
        .map(|c| c.status)
        .filter(|s| *s != HealthStatus::Unknown)
        .max()
        .unwrap_or(HealthStatus::Unknown)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Below this much buffered media a warning is logged.
    #[serde(default = "default_min_lookahead_secs")]
    pub min_lookahead_secs: f64,
    /// Reconnect attempts across active publishers that trigger fallback.
    #[serde(default = "default_reconnect_threshold")]
    pub reconnect_threshold: u32,
    /// Minimum time between two restore attempts.
    #[serde(default = "default_restore_cooldown_secs")]
    pub restore_cooldown_secs: u64,
}

fn default_interval_secs() -> u64 {
    15
}

fn default_min_lookahead_secs() -> f64 {
    12.0
}

fn default_reconnect_threshold() -> u32 {
    5
}

fn default_restore_cooldown_secs() -> u64 {
    60
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            min_lookahead_secs: default_min_lookahead_secs(),
            reconnect_threshold: default_reconnect_threshold(),
            restore_cooldown_secs: default_restore_cooldown_secs(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn restore_cooldown(&self) -> Duration {
        Duration::from_secs(self.restore_cooldown_secs)
    }
}

/// One observation of the relay.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthSample {
    /// The relay has been started and not stopped.
    pub relay_running: bool,
    pub capture_running: bool,
    pub lookahead_secs: f64,
    pub active_connections: usize,
    pub active_reconnect_attempts: u32,
    /// A backup endpoint is active and no primary is.
    pub fallback_engaged: bool,
}

impl HealthSample {
    /// Per-component view of this sample.
    pub fn components(&self, config: &HealthConfig) -> Vec<ComponentHealth> {
        let capture = if self.capture_running {
            ComponentHealth::healthy("capture")
        } else {
            ComponentHealth::unhealthy("capture", "Capture process is not running")
        };

        let cache = if self.lookahead_secs < config.min_lookahead_secs {
            ComponentHealth::degraded(
                "cache",
                format!("Lookahead {:.1}s is below {:.1}s", self.lookahead_secs, config.min_lookahead_secs),
            )
        } else {
            ComponentHealth::healthy("cache")
        };

        let publishers = if self.active_connections == 0 {
            ComponentHealth::unhealthy("publishers", "No active publisher connections")
        } else if self.active_reconnect_attempts > config.reconnect_threshold {
            ComponentHealth::degraded(
                "publishers",
                format!("{} reconnect attempts", self.active_reconnect_attempts),
            )
        } else if self.fallback_engaged {
            ComponentHealth::degraded("publishers", "Publishing on backup endpoint")
        } else {
            ComponentHealth::healthy("publishers")
        };

        vec![capture, cache, publishers]
    }
}

/// What a health check decided to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthDecision {
    /// Nothing to do.
    Healthy,
    /// Relay not running; nothing was evaluated.
    Idle,
    ContinuityRestart { reason: &'static str },
    FallbackQuality,
    RestoreQuality,
}

/// The system the monitor watches and acts upon.
#[async_trait]
pub trait HealthTarget: Send + Sync + 'static {
    async fn sample(&self) -> HealthSample;

    /// Restart the capture from the last stable position.
    async fn continuity_restart(&self) -> Result<()>;

    async fn fallback_quality(&self) -> Result<bool>;

    async fn restore_quality(&self) -> Result<()>;
}

#[derive(Debug, Default)]
struct MonitorState {
    /// Fallback already triggered for the current reconnect burst.
    fallback_latched: bool,
    last_restore: Option<Instant>,
}

pub struct HealthMonitor {
    config: HealthConfig,
    state: parking_lot::Mutex<MonitorState>,
    in_flight: AtomicBool,
}

/// Clears the in-flight flag when a check ends, including by cancellation.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            state: parking_lot::Mutex::new(MonitorState::default()),
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Apply the rules to `sample`.
    pub fn evaluate(&self, sample: &HealthSample) -> HealthDecision {
        self.evaluate_at(Instant::now(), sample)
    }

    fn evaluate_at(&self, now: Instant, sample: &HealthSample) -> HealthDecision {
        if !sample.relay_running {
            return HealthDecision::Idle;
        }

        if !sample.capture_running {
            return HealthDecision::ContinuityRestart {
                reason: "capture not running",
            };
        }

        if sample.lookahead_secs < self.config.min_lookahead_secs {
            info!(
                lookahead_secs = sample.lookahead_secs,
                min_lookahead_secs = self.config.min_lookahead_secs,
                "Segment lookahead is low"
            );
        }

        if sample.active_connections == 0 {
            return HealthDecision::ContinuityRestart {
                reason: "no active publisher connections",
            };
        }

        let mut state = self.state.lock();
        if sample.active_reconnect_attempts > self.config.reconnect_threshold {
            if state.fallback_latched {
                return HealthDecision::Healthy;
            }
            state.fallback_latched = true;
            return HealthDecision::FallbackQuality;
        }
        state.fallback_latched = false;

        if sample.fallback_engaged {
            let cooled_down = state
                .last_restore
                .is_none_or(|last| now.duration_since(last) >= self.config.restore_cooldown());
            if cooled_down {
                state.last_restore = Some(now);
                return HealthDecision::RestoreQuality;
            }
        }

        HealthDecision::Healthy
    }

    /// Run one check. Returns `None` when a previous check is still running.
    pub async fn tick(&self, target: &dyn HealthTarget) -> Option<HealthDecision> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            debug!("Health check already in flight, skipping");
            return None;
        }
        let _guard = InFlight(&self.in_flight);

        let sample = target.sample().await;
        let decision = self.evaluate(&sample);

        let outcome = match decision {
            HealthDecision::Healthy | HealthDecision::Idle => Ok(()),
            HealthDecision::ContinuityRestart { reason } => {
                warn!(reason, "Health check triggering continuity restart");
                target.continuity_restart().await
            }
            HealthDecision::FallbackQuality => {
                warn!(
                    reconnects = sample.active_reconnect_attempts,
                    threshold = self.config.reconnect_threshold,
                    "Publishers unstable, falling back to backup quality"
                );
                target.fallback_quality().await.map(|_| ())
            }
            HealthDecision::RestoreQuality => {
                info!("Publishers stable, attempting to restore primary quality");
                target.restore_quality().await
            }
        };
        if let Err(e) = outcome {
            error!(?decision, "Health action failed: {}", e);
        }

        Some(decision)
    }

    /// Run checks every interval until `cancel` fires. The first check happens
    /// one interval after spawning.
    pub fn spawn(self: Arc<Self>, target: Arc<dyn HealthTarget>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.config.interval();
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_secs = period.as_secs(), "Health monitor started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        self.tick(target.as_ref()).await;
                    }
                }
            }
            debug!("Health monitor stopped");
        })
    }
}
