//! Supervised subprocess actor.
//!
//! Each supervised process (the capture and one per publishing endpoint) is
//! owned by a [`SupervisorActor`] task. The actor spawns the child, parses its
//! diagnostics, and on exit asks the [`RestartPolicy`] what to do. Restarts
//! are scheduled as timers inside the actor's `select!` loop, so an explicit
//! stop simply clears the pending timer.
//!
//! [`ProcessSupervisor`] is the cloneable handle used by everything else.
//!
//! # State machine
//!
//! ```text
//! Idle -> Starting -> Connected -> Stopping -> Stopped
//!            ^            |
//!            +-- restart -+--> Failed (attempt budget exhausted)
//! ```

use std::fmt;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::diagnostics::{DiagnosticEvent, DiagnosticsParser};
use super::policy::{ExitClass, RestartAction, RestartPolicy};
use super::spawner::{CommandFactory, LaunchContext, ProcessSpawner};
use crate::utils::redact::Redactor;
use crate::{Error, Result};

/// Upper bound for reading leftover diagnostics after an exit.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Extra wait past the stop timeout for the forced kill to be reaped.
const KILL_MARGIN: Duration = Duration::from_secs(2);

/// Which process a supervisor owns.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProcessRole {
    Capture,
    Publisher(String),
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Capture => f.write_str("capture"),
            Self::Publisher(name) => write!(f, "publisher:{name}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Idle,
    Starting,
    Connected,
    Stopping,
    Stopped,
    Failed,
}

impl ProcessState {
    /// A process exists or is about to be (re)spawned.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Starting | Self::Connected)
    }
}

/// Public snapshot of a supervised process.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessStats {
    pub name: String,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_secs: Option<f64>,
    pub last_exit_code: Option<i32>,
    pub last_exit_class: Option<ExitClass>,
    pub reconnect_attempts: u32,
    pub max_attempts: u32,
    pub total_restarts: u64,
    pub last_diagnostic: Option<String>,
    pub last_error: Option<String>,
}

impl ProcessStats {
    fn new(role: &ProcessRole, max_attempts: u32) -> Self {
        Self {
            name: role.to_string(),
            state: ProcessState::Idle,
            pid: None,
            started_at: None,
            uptime_secs: None,
            last_exit_code: None,
            last_exit_class: None,
            reconnect_attempts: 0,
            max_attempts,
            total_restarts: 0,
            last_diagnostic: None,
            last_error: None,
        }
    }
}

/// Provides the offset a failed process should resume from.
pub trait ResumeSource: Send + Sync {
    /// Offset in seconds into the source, or `None` when nothing stable is known.
    fn resume_position(&self) -> Option<f64>;
}

/// Notifications emitted by supervisors.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// A new process instance; `resume_from` is the offset it was launched at.
    Spawned {
        role: ProcessRole,
        pid: Option<u32>,
        resume_from: Option<f64>,
    },
    Diagnostic {
        role: ProcessRole,
        event: DiagnosticEvent,
    },
    Exited {
        role: ProcessRole,
        exit_code: Option<i32>,
        class: ExitClass,
        action: RestartAction,
    },
    /// Connected for a full stable window; attempts were reset.
    Stabilized { role: ProcessRole },
    GaveUp { role: ProcessRole, attempts: u32 },
}

impl SupervisorEvent {
    pub fn role(&self) -> &ProcessRole {
        match self {
            Self::Spawned { role, .. }
            | Self::Diagnostic { role, .. }
            | Self::Exited { role, .. }
            | Self::Stabilized { role }
            | Self::GaveUp { role, .. } => role,
        }
    }
}

/// Everything a supervisor needs besides its role.
pub struct SupervisorParts {
    pub factory: Arc<dyn CommandFactory>,
    pub spawner: Arc<dyn ProcessSpawner>,
    pub policy: RestartPolicy,
    pub resume: Option<Arc<dyn ResumeSource>>,
    pub redactor: Redactor,
    pub events: mpsc::UnboundedSender<SupervisorEvent>,
    /// Bounded wait for an exit after asking the process to stop.
    pub stop_timeout: Duration,
}

enum Command {
    Start {
        ctx: LaunchContext,
        reply: oneshot::Sender<bool>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Restart {
        ctx: LaunchContext,
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a supervisor actor.
#[derive(Clone)]
pub struct ProcessSupervisor {
    role: ProcessRole,
    mailbox: mpsc::Sender<Command>,
    stats: Arc<RwLock<ProcessStats>>,
}

impl fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}

impl ProcessSupervisor {
    /// Spawn the actor task and return its handle.
    ///
    /// The actor stops its process and exits once every handle is dropped.
    pub fn spawn(role: ProcessRole, parts: SupervisorParts) -> Self {
        let (tx, rx) = mpsc::channel(16);
        let stats = Arc::new(RwLock::new(ProcessStats::new(
            &role,
            parts.policy.max_attempts(),
        )));

        let actor = SupervisorActor::new(role.clone(), parts, rx, stats.clone());
        tokio::spawn(actor.run());

        Self {
            role,
            mailbox: tx,
            stats,
        }
    }

    pub fn role(&self) -> &ProcessRole {
        &self.role
    }

    /// Start the process. Returns `false` (and logs a warning) if it is already running.
    pub async fn start(&self) -> Result<bool> {
        self.start_with(LaunchContext::default()).await
    }

    pub async fn start_with(&self, ctx: LaunchContext) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Start { ctx, reply }).await?;
        rx.await.map_err(|_| self.gone())
    }

    /// Stop the process and cancel any pending restart. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stop { reply }).await?;
        rx.await.map_err(|_| self.gone())
    }

    /// Stop, then start again with a fresh attempt budget.
    pub async fn restart(&self, ctx: LaunchContext) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Restart { ctx, reply }).await?;
        rx.await.map_err(|_| self.gone())
    }

    pub fn stats(&self) -> ProcessStats {
        let mut stats = self.stats.read().clone();
        stats.uptime_secs = match (stats.state.is_running(), stats.started_at) {
            (true, Some(started)) => {
                Some((Utc::now() - started).num_milliseconds().max(0) as f64 / 1000.0)
            }
            _ => None,
        };
        stats
    }

    pub fn state(&self) -> ProcessState {
        self.stats.read().state
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.mailbox.send(cmd).await.map_err(|_| self.gone())
    }

    fn gone(&self) -> Error {
        Error::Other(format!("Supervisor for {} is no longer running", self.role))
    }
}

/// The child currently owned by the actor.
struct Running {
    pid: Option<u32>,
    terminate: CancellationToken,
}

struct SupervisorActor {
    role: ProcessRole,
    factory: Arc<dyn CommandFactory>,
    spawner: Arc<dyn ProcessSpawner>,
    policy: RestartPolicy,
    resume: Option<Arc<dyn ResumeSource>>,
    redactor: Redactor,
    parser: DiagnosticsParser,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    stop_timeout: Duration,
    mailbox: mpsc::Receiver<Command>,
    stats: Arc<RwLock<ProcessStats>>,

    running: Option<Running>,
    diagnostics: Option<mpsc::Receiver<String>>,
    exit: Option<oneshot::Receiver<Option<i32>>>,
    pending_restart: Option<(Instant, LaunchContext)>,
    stable_deadline: Option<Instant>,
    attempts: u32,
    intentional: bool,
}

impl SupervisorActor {
    fn new(
        role: ProcessRole,
        parts: SupervisorParts,
        mailbox: mpsc::Receiver<Command>,
        stats: Arc<RwLock<ProcessStats>>,
    ) -> Self {
        Self {
            role,
            factory: parts.factory,
            spawner: parts.spawner,
            policy: parts.policy,
            resume: parts.resume,
            parser: DiagnosticsParser::new(parts.redactor.clone()),
            redactor: parts.redactor,
            events: parts.events,
            stop_timeout: parts.stop_timeout,
            mailbox,
            stats,
            running: None,
            diagnostics: None,
            exit: None,
            pending_restart: None,
            stable_deadline: None,
            attempts: 0,
            intentional: false,
        }
    }

    async fn run(mut self) {
        debug!(role = %self.role, "Supervisor started");

        loop {
            let restart_at = self.pending_restart.as_ref().map(|(at, _)| *at);
            let stable_at = self.stable_deadline;

            tokio::select! {
                biased;

                cmd = self.mailbox.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },

                record = Self::recv_diagnostic(&mut self.diagnostics) => match record {
                    Some(record) => self.handle_record(&record),
                    None => self.diagnostics = None,
                },

                code = Self::wait_exit(&mut self.exit) => {
                    self.exit = None;
                    self.on_exit(code, None).await;
                }

                _ = Self::sleep_until_opt(restart_at) => self.fire_restart().await,

                _ = Self::sleep_until_opt(stable_at) => self.mark_stable(),
            }
        }

        self.stop_process().await;
        debug!(role = %self.role, "Supervisor exited");
    }

    /// Receive from an optional diagnostics channel; pending forever when there is none.
    async fn recv_diagnostic(rx: &mut Option<mpsc::Receiver<String>>) -> Option<String> {
        match rx {
            Some(rx) => rx.recv().await,
            None => pending().await,
        }
    }

    async fn wait_exit(rx: &mut Option<oneshot::Receiver<Option<i32>>>) -> Option<i32> {
        match rx {
            // A dropped sender means the waiter task died with the child.
            Some(rx) => rx.await.unwrap_or(None),
            None => pending().await,
        }
    }

    async fn sleep_until_opt(deadline: Option<Instant>) {
        match deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => pending().await,
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start { ctx, reply } => {
                if self.running.is_some() || self.pending_restart.is_some() {
                    warn!(role = %self.role, "Start requested but process is already running");
                    let _ = reply.send(false);
                    return;
                }
                self.reset_budget();
                self.spawn_process(ctx).await;
                let _ = reply.send(true);
            }
            Command::Stop { reply } => {
                self.stop_process().await;
                let _ = reply.send(());
            }
            Command::Restart { ctx, reply } => {
                info!(role = %self.role, "Restart requested");
                self.stop_process().await;
                self.reset_budget();
                self.spawn_process(ctx).await;
                let _ = reply.send(());
            }
        }
    }

    fn reset_budget(&mut self) {
        self.attempts = 0;
        self.policy.reset();
        self.update(|s| {
            s.reconnect_attempts = 0;
            s.last_error = None;
        });
    }

    async fn spawn_process(&mut self, ctx: LaunchContext) {
        let command = self.factory.build(&ctx);
        info!(
            role = %self.role,
            resume_from = ?ctx.resume_from,
            "Spawning: {}",
            self.redactor.redact_command(&command.program, &command.args)
        );

        self.parser.reset();
        self.intentional = false;
        self.stable_deadline = None;
        self.update(|s| {
            s.state = ProcessState::Starting;
            s.pid = None;
            s.last_diagnostic = None;
        });

        match self.spawner.spawn(&command).await {
            Ok(process) => {
                debug!(role = %self.role, pid = ?process.pid, "Process spawned");
                self.update(|s| {
                    s.pid = process.pid;
                    s.started_at = Some(Utc::now());
                });
                self.running = Some(Running {
                    pid: process.pid,
                    terminate: process.terminate,
                });
                self.diagnostics = Some(process.diagnostics);
                self.exit = Some(process.exit);
                self.emit(SupervisorEvent::Spawned {
                    role: self.role.clone(),
                    pid: process.pid,
                    resume_from: ctx.resume_from,
                });
            }
            Err(e) => {
                let message = self.redactor.redact(&e.to_string()).into_owned();
                error!(role = %self.role, "Failed to spawn process: {}", message);
                self.on_exit(None, Some(message)).await;
            }
        }
    }

    async fn fire_restart(&mut self) {
        let Some((_, ctx)) = self.pending_restart.take() else {
            return;
        };
        self.update(|s| s.total_restarts += 1);
        self.spawn_process(ctx).await;
    }

    fn handle_record(&mut self, record: &str) {
        for event in self.parser.feed(record) {
            self.handle_event(event);
        }
        let last = self.parser.last_line().map(str::to_string);
        self.update(|s| s.last_diagnostic = last);
    }

    fn handle_event(&mut self, event: DiagnosticEvent) {
        match &event {
            DiagnosticEvent::Connected => {
                info!(role = %self.role, "Process connected");
                self.stable_deadline = Some(Instant::now() + self.policy.config().stable_window());
                self.update(|s| s.state = ProcessState::Connected);
            }
            DiagnosticEvent::ErrorDetected { category, message } => {
                warn!(role = %self.role, %category, "{}", message);
                let message = message.clone();
                self.update(|s| s.last_error = Some(message));
            }
            DiagnosticEvent::Unclassified(line) => {
                trace!(role = %self.role, "{}", line);
                return;
            }
            _ => {}
        }

        self.emit(SupervisorEvent::Diagnostic {
            role: self.role.clone(),
            event,
        });
    }

    /// Handle an exit (or a spawn failure, with `spawn_error` set).
    async fn on_exit(&mut self, exit_code: Option<i32>, spawn_error: Option<String>) {
        self.drain_diagnostics().await;
        for event in self.parser.finish() {
            self.handle_event(event);
        }

        self.running = None;
        self.stable_deadline = None;

        let mut tail = self.parser.tail();
        tail.extend(spawn_error);

        let class = self.policy.classify(exit_code, &tail, self.intentional);
        if class == ExitClass::Failure {
            self.attempts += 1;
        }
        let stable_position = match class {
            ExitClass::Failure => self.resume.as_ref().and_then(|r| r.resume_position()),
            _ => None,
        };
        let action = self.policy.decide(
            exit_code,
            &tail,
            self.attempts,
            self.intentional,
            stable_position,
        );

        match class {
            ExitClass::Intentional => info!(role = %self.role, ?exit_code, "Process stopped"),
            ExitClass::EndOfInput => info!(role = %self.role, ?exit_code, "Process reached end of input"),
            ExitClass::Failure => warn!(
                role = %self.role,
                ?exit_code,
                attempts = self.attempts,
                max_attempts = self.policy.max_attempts(),
                "Process failed"
            ),
        }

        let attempts = self.attempts;
        let last_line = tail.last().cloned();
        self.update(|s| {
            s.pid = None;
            s.last_exit_code = exit_code;
            s.last_exit_class = Some(class);
            s.reconnect_attempts = attempts;
            if class == ExitClass::Failure && s.last_error.is_none() {
                s.last_error = last_line;
            }
        });

        match action {
            RestartAction::None => {
                self.update(|s| s.state = ProcessState::Stopped);
            }
            RestartAction::GiveUp => {
                let err = Error::MaxAttemptsExceeded {
                    name: self.role.to_string(),
                    attempts,
                };
                error!(role = %self.role, "{}", err);
                self.update(|s| {
                    s.state = ProcessState::Failed;
                    s.last_error = Some(err.to_string());
                });
                self.emit(SupervisorEvent::GaveUp {
                    role: self.role.clone(),
                    attempts,
                });
            }
            RestartAction::ImmediateRestart { delay } | RestartAction::BackoffRestart { delay } => {
                info!(role = %self.role, "Restarting in {:.2?}", delay);
                self.schedule_restart(delay, LaunchContext::default());
            }
            RestartAction::ResumeRestart { position, delay } => {
                info!(role = %self.role, position, "Resuming in {:.2?}", delay);
                self.schedule_restart(delay, LaunchContext::resume_from(position));
            }
        }

        self.emit(SupervisorEvent::Exited {
            role: self.role.clone(),
            exit_code,
            class,
            action,
        });
    }

    fn schedule_restart(&mut self, delay: Duration, ctx: LaunchContext) {
        self.pending_restart = Some((Instant::now() + delay, ctx));
        self.update(|s| s.state = ProcessState::Starting);
    }

    async fn drain_diagnostics(&mut self) {
        let Some(mut rx) = self.diagnostics.take() else {
            return;
        };
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while let Some(record) = rx.recv().await {
                self.handle_record(&record);
            }
        })
        .await;
        if drained.is_err() {
            debug!(role = %self.role, "Diagnostics still open after exit");
        }
    }

    /// Cancel any pending restart and stop the running process, if any.
    async fn stop_process(&mut self) {
        if self.pending_restart.take().is_some() {
            info!(role = %self.role, "Cancelled pending restart");
        }
        self.stable_deadline = None;

        let Some(running) = self.running.as_ref() else {
            if self.stats.read().state != ProcessState::Idle {
                self.update(|s| s.state = ProcessState::Stopped);
            }
            return;
        };

        info!(role = %self.role, pid = ?running.pid, "Stopping process");
        self.intentional = true;
        running.terminate.cancel();
        self.update(|s| s.state = ProcessState::Stopping);

        let code = match self.exit.take() {
            Some(rx) => match tokio::time::timeout(self.stop_timeout + KILL_MARGIN, rx).await {
                Ok(code) => code.unwrap_or(None),
                Err(_) => {
                    warn!(role = %self.role, "Process did not exit within {:?}", self.stop_timeout);
                    None
                }
            },
            None => None,
        };
        self.on_exit(code, None).await;
    }

    fn mark_stable(&mut self) {
        self.stable_deadline = None;
        if self.stats.read().state != ProcessState::Connected {
            return;
        }

        if self.attempts > 0 {
            info!(role = %self.role, attempts = self.attempts, "Connection stable, resetting attempts");
        }
        self.attempts = 0;
        self.policy.reset();
        self.update(|s| s.reconnect_attempts = 0);
        self.emit(SupervisorEvent::Stabilized {
            role: self.role.clone(),
        });
    }

    fn update(&self, f: impl FnOnce(&mut ProcessStats)) {
        f(&mut self.stats.write());
    }

    fn emit(&self, event: SupervisorEvent) {
        let _ = self.events.send(event);
    }
}
