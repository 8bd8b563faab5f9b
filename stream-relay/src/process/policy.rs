//! Restart policy for supervised processes.
//!
//! Given how a process exited, decides whether it is restarted immediately,
//! after an exponential backoff, from a resume position, or not at all.
//!
//! # Rules (in order)
//!
//! 1. Intentional stop: no restart.
//! 2. Attempt budget exhausted: give up.
//! 3. End-of-input (exit code 0 or an end-of-stream marker in the diagnostics
//!    tail): restart looping inputs after 1s, or 3s when the previous
//!    end-of-input restart was less than 10s ago. Non-looping inputs are done.
//! 4. Anything else: `min(initial * multiplier^(attempt - 1), max)`, as a
//!    resume restart when a stable position is known and resuming is enabled.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::diagnostics::is_end_of_input;

/// Restart policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartPolicyConfig {
    /// Failures tolerated before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First backoff delay in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Backoff ceiling in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth factor between consecutive backoff delays.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Add up to 25% jitter to backoff delays (never above the ceiling).
    #[serde(default)]
    pub use_jitter: bool,
    /// Delay before restarting after end-of-input.
    #[serde(default = "default_eof_delay_ms")]
    pub eof_delay_ms: u64,
    /// Delay used instead when end-of-input restarts come in quick succession.
    #[serde(default = "default_eof_frequent_delay_ms")]
    pub eof_frequent_delay_ms: u64,
    /// Two end-of-input restarts closer than this are "frequent".
    #[serde(default = "default_eof_window_ms")]
    pub eof_window_ms: u64,
    /// How long a process must stay connected before its attempts reset.
    #[serde(default = "default_stable_window_secs")]
    pub stable_window_secs: u64,
}

fn default_max_attempts() -> u32 {
    15
}

fn default_initial_delay_ms() -> u64 {
    5_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    1.5
}

fn default_eof_delay_ms() -> u64 {
    1_000
}

fn default_eof_frequent_delay_ms() -> u64 {
    3_000
}

fn default_eof_window_ms() -> u64 {
    10_000
}

fn default_stable_window_secs() -> u64 {
    30
}

impl Default for RestartPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            use_jitter: false,
            eof_delay_ms: default_eof_delay_ms(),
            eof_frequent_delay_ms: default_eof_frequent_delay_ms(),
            eof_window_ms: default_eof_window_ms(),
            stable_window_secs: default_stable_window_secs(),
        }
    }
}

impl RestartPolicyConfig {
    /// Same timings with a different attempt ceiling.
    pub fn with_max_attempts(&self, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..self.clone()
        }
    }

    pub fn stable_window(&self) -> Duration {
        Duration::from_secs(self.stable_window_secs)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// How a process exit is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitClass {
    /// We asked it to stop.
    Intentional,
    /// It ran out of input.
    EndOfInput,
    /// Anything else, including spawn failures and signals.
    Failure,
}

/// What to do after a process exit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RestartAction {
    /// Leave the process stopped.
    None,
    /// Restart after a short fixed delay (end-of-input).
    ImmediateRestart { delay: Duration },
    /// Restart after an exponential backoff delay.
    BackoffRestart { delay: Duration },
    /// Restart from `position` seconds after `delay`.
    ResumeRestart { position: f64, delay: Duration },
    /// Attempt budget exhausted.
    GiveUp,
}

impl RestartAction {
    /// Delay before the restart, if this action restarts at all.
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Self::ImmediateRestart { delay }
            | Self::BackoffRestart { delay }
            | Self::ResumeRestart { delay, .. } => Some(*delay),
            Self::None | Self::GiveUp => None,
        }
    }
}

/// Restart decision engine for one supervised process.
///
/// The only state kept is the time of the previous end-of-input restart, used
/// for rate limiting. Attempt counting belongs to the caller.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    config: RestartPolicyConfig,
    loop_input: bool,
    resume_enabled: bool,
    last_eof_restart: Option<Instant>,
}

impl RestartPolicy {
    pub fn new(config: RestartPolicyConfig) -> Self {
        Self {
            config,
            loop_input: false,
            resume_enabled: false,
            last_eof_restart: None,
        }
    }

    /// Restart the process when its input ends.
    pub fn looping(mut self, loop_input: bool) -> Self {
        self.loop_input = loop_input;
        self
    }

    /// Prefer resume restarts when a stable position is known.
    pub fn resuming(mut self, resume_enabled: bool) -> Self {
        self.resume_enabled = resume_enabled;
        self
    }

    pub fn config(&self) -> &RestartPolicyConfig {
        &self.config
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Classify an exit from its code and the recent diagnostics.
    pub fn classify(
        &self,
        exit_code: Option<i32>,
        diagnostics_tail: &[String],
        was_intentional: bool,
    ) -> ExitClass {
        if was_intentional {
            ExitClass::Intentional
        } else if exit_code == Some(0) || diagnostics_tail.iter().any(|l| is_end_of_input(l)) {
            ExitClass::EndOfInput
        } else {
            ExitClass::Failure
        }
    }

    /// Decide what to do after an exit.
    ///
    /// `attempt_count` is the number of failed attempts so far, including the
    /// exit being decided on when it is a failure.
    pub fn decide(
        &mut self,
        exit_code: Option<i32>,
        diagnostics_tail: &[String],
        attempt_count: u32,
        was_intentional: bool,
        stable_position: Option<f64>,
    ) -> RestartAction {
        self.decide_at(
            Instant::now(),
            exit_code,
            diagnostics_tail,
            attempt_count,
            was_intentional,
            stable_position,
        )
    }

    pub(crate) fn decide_at(
        &mut self,
        now: Instant,
        exit_code: Option<i32>,
        diagnostics_tail: &[String],
        attempt_count: u32,
        was_intentional: bool,
        stable_position: Option<f64>,
    ) -> RestartAction {
        let class = self.classify(exit_code, diagnostics_tail, was_intentional);
        if class == ExitClass::Intentional {
            return RestartAction::None;
        }

        if attempt_count >= self.config.max_attempts {
            return RestartAction::GiveUp;
        }

        if class == ExitClass::EndOfInput {
            if !self.loop_input {
                return RestartAction::None;
            }
            let delay = self.eof_delay(now);
            self.last_eof_restart = Some(now);
            return RestartAction::ImmediateRestart { delay };
        }

        let delay = self.backoff_delay(attempt_count);
        match stable_position {
            Some(position) if self.resume_enabled && position > 0.0 => {
                RestartAction::ResumeRestart { position, delay }
            }
            _ => RestartAction::BackoffRestart { delay },
        }
    }

    /// Backoff delay for the given (1-based) attempt.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let max_secs = self.config.max_delay_ms as f64 / 1000.0;
        let base_secs = self.config.initial_delay_ms as f64 / 1000.0
            * self
                .config
                .backoff_multiplier
                .powi(attempt.saturating_sub(1).min(64) as i32);
        let mut secs = base_secs.min(max_secs);

        if self.config.use_jitter {
            // Add up to 25% jitter
            secs = (secs + secs * 0.25 * rand::random::<f64>()).min(max_secs);
        }

        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Forget the end-of-input history. Called once a process is stable again.
    pub fn reset(&mut self) {
        self.last_eof_restart = None;
    }

    fn eof_delay(&self, now: Instant) -> Duration {
        let window = Duration::from_millis(self.config.eof_window_ms);
        let frequent = self
            .last_eof_restart
            .is_some_and(|last| now.saturating_duration_since(last) < window);

        if frequent {
            Duration::from_millis(self.config.eof_frequent_delay_ms)
        } else {
            Duration::from_millis(self.config.eof_delay_ms)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RestartPolicy {
        RestartPolicy::new(RestartPolicyConfig::default()).looping(true)
    }

    fn secs(d: Duration) -> f64 {
        d.as_secs_f64()
    }

    #[test]
    fn test_intentional_never_restarts() {
        let mut p = policy();
        for code in [None, Some(0), Some(1), Some(255), Some(-1)] {
            for attempts in [0, 3, 15, 100] {
                assert_eq!(
                    p.decide(code, &[], attempts, true, Some(10.0)),
                    RestartAction::None
                );
            }
        }
    }

    #[test]
    fn test_gives_up_at_max_attempts() {
        let mut p = policy();
        for code in [None, Some(0), Some(1), Some(137)] {
            for attempts in [15, 16, 1000] {
                assert_eq!(
                    p.decide(code, &[], attempts, false, None),
                    RestartAction::GiveUp
                );
            }
        }
        assert_ne!(p.decide(Some(1), &[], 14, false, None), RestartAction::GiveUp);
    }

    #[test]
    fn test_eof_restart_is_rate_limited() {
        let mut p = policy();
        let t0 = Instant::now();

        assert_eq!(
            p.decide_at(t0, Some(0), &[], 0, false, None),
            RestartAction::ImmediateRestart {
                delay: Duration::from_secs(1)
            }
        );

        let t1 = t0 + Duration::from_secs(4);
        assert_eq!(
            p.decide_at(t1, Some(0), &[], 0, false, None),
            RestartAction::ImmediateRestart {
                delay: Duration::from_secs(3)
            }
        );

        let t2 = t1 + Duration::from_secs(11);
        assert_eq!(
            p.decide_at(t2, Some(0), &[], 0, false, None),
            RestartAction::ImmediateRestart {
                delay: Duration::from_secs(1)
            }
        );
    }

    #[test]
    fn test_frequent_eof_delay_is_never_the_normal_one() {
        let mut p = policy();
        let t0 = Instant::now();
        p.decide_at(t0, Some(0), &[], 0, false, None);

        for ms in [0u64, 1, 500, 5_000, 9_999] {
            let action = p.decide_at(t0 + Duration::from_millis(ms), Some(0), &[], 0, false, None);
            assert!(action.delay().unwrap() >= Duration::from_secs(3), "{ms}: {action:?}");
        }
    }

    #[test]
    fn test_eof_marker_in_tail() {
        let mut p = policy();
        let tail = vec![
            "Press [q] to stop".to_string(),
            "[in#0 @ 0x1] Error during demuxing: End of file".to_string(),
        ];
        assert_eq!(p.classify(Some(1), &tail, false), ExitClass::EndOfInput);
        assert!(matches!(
            p.decide(Some(1), &tail, 0, false, None),
            RestartAction::ImmediateRestart { .. }
        ));

        let tail = vec!["Exiting normally, received signal 2. Immediate exit requested".to_string()];
        assert_eq!(p.classify(Some(255), &tail, false), ExitClass::EndOfInput);

        let tail = vec!["HTTP error 416 Requested Range Not Satisfiable".to_string()];
        assert_eq!(p.classify(Some(8), &tail, false), ExitClass::EndOfInput);
    }

    #[test]
    fn test_eof_without_looping_stops() {
        let mut p = RestartPolicy::new(RestartPolicyConfig::default());
        assert_eq!(p.decide(Some(0), &[], 0, false, None), RestartAction::None);
    }

    #[test]
    fn test_backoff_sequence() {
        let p = policy();
        let expected = [5.0, 7.5, 11.25, 16.875, 25.3125, 37.96875];
        for (i, want) in expected.iter().enumerate() {
            let got = secs(p.backoff_delay(i as u32 + 1));
            assert!((got - want).abs() < 1e-6, "attempt {}: {got} != {want}", i + 1);
        }
    }

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let p = policy();
        let max = p.config().max_delay();
        let mut previous = Duration::ZERO;
        for attempt in 1..=40 {
            let delay = p.backoff_delay(attempt);
            assert!(delay >= previous);
            assert!(delay <= max);
            previous = delay;
        }
        assert_eq!(previous, max);
    }

    #[test]
    fn test_jitter_never_exceeds_cap() {
        let config = RestartPolicyConfig {
            use_jitter: true,
            ..Default::default()
        };
        let p = RestartPolicy::new(config);
        for attempt in 1..=20 {
            let delay = p.backoff_delay(attempt);
            assert!(delay <= p.config().max_delay());
            assert!(delay >= RestartPolicy::new(RestartPolicyConfig::default()).backoff_delay(attempt));
        }
    }

    #[test]
    fn test_failure_prefers_resume_when_enabled() {
        let mut p = policy().resuming(true);
        assert_eq!(
            p.decide(Some(1), &[], 2, false, Some(42.0)),
            RestartAction::ResumeRestart {
                position: 42.0,
                delay: Duration::from_secs_f64(7.5)
            }
        );
        assert_eq!(
            p.decide(Some(1), &[], 1, false, None),
            RestartAction::BackoffRestart {
                delay: Duration::from_secs(5)
            }
        );

        let mut p = policy();
        assert_eq!(
            p.decide(None, &[], 1, false, Some(42.0)),
            RestartAction::BackoffRestart {
                delay: Duration::from_secs(5)
            }
        );
    }

    #[test]
    fn test_reset_forgets_eof_history() {
        let mut p = policy();
        let t0 = Instant::now();
        p.decide_at(t0, Some(0), &[], 0, false, None);
        p.reset();
        assert_eq!(
            p.decide_at(t0 + Duration::from_secs(1), Some(0), &[], 0, false, None),
            RestartAction::ImmediateRestart {
                delay: Duration::from_secs(1)
            }
        );
    }
}
