//! Per-service readiness gating.
//!
//! A `ReadinessGate` holds pure state: no I/O, no threads. It answers one
//! question for the monitor: is this service eligible for health checks
//! yet? Eligibility requires both that the grace period has elapsed and
//! that the sequencer explicitly confirmed readiness. Absence of readiness
//! confirmation is a hard gate, never inferred from elapsed time.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Grace period for backend-class services.
pub const BACKEND_GRACE_PERIOD: Duration = Duration::from_secs(30);
/// Grace period for frontend-class services, which routinely spend over a
/// minute compiling before they can answer anything.
pub const FRONTEND_GRACE_PERIOD: Duration = Duration::from_secs(90);
/// Grace period for any service class without a more specific default.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Pick a default grace period from the service name.
///
/// Case-insensitive: any name containing "frontend" gets the frontend
/// default, "backend" the backend default, everything else 30s.
pub fn default_grace_period(name: &str) -> Duration {
    let lower = name.to_lowercase();
    if lower.contains("frontend") {
        FRONTEND_GRACE_PERIOD
    } else if lower.contains("backend") {
        BACKEND_GRACE_PERIOD
    } else {
        DEFAULT_GRACE_PERIOD
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Starting,
    GracePeriod,
    Ready,
    Monitoring,
    Failed,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Starting => write!(f, "starting"),
            ServiceState::GracePeriod => write!(f, "grace_period"),
            ServiceState::Ready => write!(f, "ready"),
            ServiceState::Monitoring => write!(f, "monitoring"),
            ServiceState::Failed => write!(f, "failed"),
        }
    }
}

impl ServiceState {
    /// Check if transitioning from the current state to the new state is
    /// valid. Transitions are monotonic forward; the only late transition
    /// is `Monitoring -> Failed` on sustained health-check failure, and
    /// nothing ever returns to `Starting`.
    pub fn can_transition_to(&self, new_state: &ServiceState) -> bool {
        if self == new_state {
            return true;
        }
        match self {
            ServiceState::Starting => matches!(
                new_state,
                ServiceState::GracePeriod | ServiceState::Ready | ServiceState::Failed
            ),
            ServiceState::GracePeriod => {
                matches!(new_state, ServiceState::Ready | ServiceState::Failed)
            }
            ServiceState::Ready => {
                matches!(new_state, ServiceState::Monitoring | ServiceState::Failed)
            }
            ServiceState::Monitoring => matches!(new_state, ServiceState::Failed),
            ServiceState::Failed => false,
        }
    }

    /// Attempt to transition, returning an error if invalid.
    pub fn try_transition(&self, new_state: ServiceState) -> Result<ServiceState> {
        if self.can_transition_to(&new_state) {
            Ok(new_state)
        } else {
            bail!("invalid service state transition: {self} -> {new_state}")
        }
    }

    /// A failed service requires an external restart; there is no way out.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceState::Failed)
    }

    /// States in which startup noise must not be reported as failure.
    pub fn is_startup(&self) -> bool {
        matches!(self, ServiceState::Starting | ServiceState::GracePeriod)
    }
}

/// Per-service readiness state.
#[derive(Debug)]
pub struct ReadinessGate {
    name: String,
    state: ServiceState,
    startup_time: Instant,
    /// Wall-clock registration time, informational only.
    started_at: DateTime<Utc>,
    grace_period: Duration,
    grace_period_end: Instant,
    ready_confirmed: bool,
    consecutive_failures: u32,
    last_check: Option<Instant>,
    ports_verified: HashSet<u16>,
    process_verified: bool,
    verified_pid: Option<u32>,
}

impl ReadinessGate {
    pub fn new(name: impl Into<String>, grace_period: Duration) -> Self {
        let startup_time = Instant::now();
        Self {
            name: name.into(),
            state: ServiceState::Starting,
            startup_time,
            started_at: Utc::now(),
            grace_period,
            // Computed once; immutable for the gate's lifetime.
            grace_period_end: startup_time + grace_period,
            ready_confirmed: false,
            consecutive_failures: 0,
            last_check: None,
            ports_verified: HashSet::new(),
            process_verified: false,
            verified_pid: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn ready_confirmed(&self) -> bool {
        self.ready_confirmed
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn verified_pid(&self) -> Option<u32> {
        self.verified_pid
    }

    pub fn ports_verified(&self) -> &HashSet<u16> {
        &self.ports_verified
    }

    pub fn process_verified(&self) -> bool {
        self.process_verified
    }

    pub fn last_check(&self) -> Option<Instant> {
        self.last_check
    }

    /// Time since the gate was registered.
    pub fn uptime(&self) -> Duration {
        self.startup_time.elapsed()
    }

    pub fn time_remaining_in_grace(&self) -> Duration {
        self.grace_period_end
            .saturating_duration_since(Instant::now())
    }

    pub fn is_grace_period_over(&self) -> bool {
        Instant::now() >= self.grace_period_end
    }

    /// Advance `Starting -> GracePeriod` once the scheduler first observes
    /// the gate. Purely for observability; eligibility never depends on it.
    pub fn begin_grace_period(&mut self) {
        if self.state == ServiceState::Starting {
            self.state = ServiceState::GracePeriod;
        }
    }

    /// Record the sequencer's explicit readiness confirmation.
    ///
    /// Idempotent: calling twice is a no-op beyond refreshing the
    /// verification metadata.
    pub fn mark_ready(&mut self, pid: Option<u32>, ports: &[u16]) {
        self.ready_confirmed = true;
        if self.state.can_transition_to(&ServiceState::Ready)
            && !matches!(self.state, ServiceState::Monitoring)
        {
            self.state = ServiceState::Ready;
        }
        self.verified_pid = pid;
        self.process_verified = pid.is_some();
        self.ports_verified = ports.iter().copied().collect();
    }

    /// Whether the monitor should run health checks for this service.
    ///
    /// Pure function of the invariant: readiness confirmed AND grace
    /// period elapsed AND state is Ready or Monitoring. A gate that was
    /// never marked ready is never health-checked, no matter how much
    /// time has passed.
    pub fn should_monitor(&self) -> bool {
        self.ready_confirmed
            && self.is_grace_period_over()
            && matches!(self.state, ServiceState::Ready | ServiceState::Monitoring)
    }

    /// Record one health-check outcome.
    ///
    /// Success resets the failure counter and promotes `Ready ->
    /// Monitoring`. Failure increments the counter. Either way the check
    /// timestamp is updated.
    ///
    /// # Returns
    /// The consecutive-failure count after recording.
    pub fn record_check_result(&mut self, healthy: bool) -> u32 {
        self.last_check = Some(Instant::now());
        if healthy {
            self.consecutive_failures = 0;
            if self.state == ServiceState::Ready {
                self.state = ServiceState::Monitoring;
            }
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }
        self.consecutive_failures
    }

    /// Reset the failure counter. Called exactly once when recovery fires,
    /// so the recovery action is not immediately re-triggered.
    pub fn reset_failures(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Sustained failure with no recovery path; the service is out of the
    /// monitoring rotation until externally restarted.
    pub fn mark_failed(&mut self) {
        self.state = ServiceState::Failed;
    }
}
