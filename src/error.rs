//! Typed failure taxonomy for startup sequencing and monitoring.
//!
//! Stage-level failures are fatal to the whole startup sequence and carry
//! the name of the stage that failed, so the user sees "backend failed
//! readiness probe after 30s" rather than a bare stack trace.

use thiserror::Error;

/// Why a startup stage failed.
#[derive(Debug, Error)]
pub enum StageErrorKind {
    /// The process failed to start, or exited immediately after launch.
    #[error("process failed to launch: {0}")]
    LaunchFailure(String),

    /// The process is alive but never passed its readiness probe within
    /// the stage deadline.
    #[error("failed readiness probe after {timeout_secs}s: {reason}")]
    ReadinessTimeout { timeout_secs: u64, reason: String },

    /// The target port is already bound by another process and dynamic
    /// port reassignment is disabled.
    #[error("port {port} already in use{owner}")]
    PortConflict { port: u16, owner: String },

    /// A record this stage needs from an earlier stage is missing.
    #[error("dependency '{0}' did not reach ready")]
    DependencyNotSatisfied(String),
}

/// A failure tagged with the startup stage it belongs to.
#[derive(Debug, Error)]
#[error("{stage}: {kind}")]
pub struct StageError {
    pub stage: String,
    pub kind: StageErrorKind,
}

impl StageError {
    pub fn new(stage: impl Into<String>, kind: StageErrorKind) -> Self {
        Self {
            stage: stage.into(),
            kind,
        }
    }
}

/// Errors from the health monitor's registration surface.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MonitorError {
    /// Re-registration must go through `unregister_service` first.
    #[error("service '{0}' is already registered; unregister it first")]
    AlreadyRegistered(String),

    #[error("unknown service '{0}'")]
    UnknownService(String),
}

/// Any failure the startup sequencer can surface.
#[derive(Debug, Error)]
pub enum SequencerError {
    #[error(transparent)]
    Stage(#[from] StageError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),
}

impl SequencerError {
    /// The stage name this failure is tagged with, if any.
    pub fn stage(&self) -> Option<&str> {
        match self {
            SequencerError::Stage(e) => Some(&e.stage),
            SequencerError::Monitor(_) => None,
        }
    }
}
