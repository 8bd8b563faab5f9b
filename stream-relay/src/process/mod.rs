//! External process supervision.
//!
//! - [`spawner`]: launching processes behind a trait seam
//! - [`diagnostics`]: turning ffmpeg's stderr into typed events
//! - [`policy`]: deciding what happens after an exit
//! - [`supervisor`]: the per-process actor tying the three together

pub mod diagnostics;
pub mod policy;
pub mod spawner;
pub mod supervisor;

pub use diagnostics::{DiagnosticEvent, DiagnosticsParser, ErrorCategory};
pub use policy::{ExitClass, RestartAction, RestartPolicy, RestartPolicyConfig};
pub use spawner::{
    CommandFactory, CommandSpec, LaunchContext, ProcessSpawner, SpawnedProcess, TokioSpawner,
};
pub use supervisor::{
    ProcessRole, ProcessState, ProcessStats, ProcessSupervisor, ResumeSource, SupervisorEvent,
    SupervisorParts,
};

#[cfg(test)]
pub(crate) mod testing;
