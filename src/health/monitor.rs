//! Periodic health monitoring for supervised services.
//!
//! A single scheduler thread drives all checks. Each tick iterates the
//! registered services in name order and, for each service whose gate is
//! open (`should_monitor()`), invokes the injected health-check function.
//! Checks run sequentially within the tick so ordering is deterministic
//! and failure counters need no extra locking. Every probe call is
//! bounded by a per-call timeout so one stuck probe cannot stall the tick
//! forever.
//!
//! "Monitoring enabled" is a global switch, separate from the per-gate
//! eligibility. The sequencer registers all services up front, before any
//! process exists, and no health-check traffic happens until the entire
//! startup dance completes. The scheduler still advances gates from
//! `Starting` to `GracePeriod` before the switch flips, for observability.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::MonitorError;
use crate::health::gate::{default_grace_period, ReadinessGate, ServiceState};

/// Default scheduler tick interval.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);
/// Consecutive failures before the recovery action fires.
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 5;
/// Bound on a single health-check invocation.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Sleep step between shutdown-flag checks while idling between ticks.
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// A health probe: returns true when the service answers its check.
/// Expected failure modes (connection refused, timeouts) must return
/// false rather than panic; panics are caught and treated as unhealthy.
pub type HealthCheck = Arc<dyn Fn() -> bool + Send + Sync + 'static>;

/// Caller-supplied action invoked when a service crosses its
/// consecutive-failure threshold.
pub type RecoveryAction = Arc<dyn Fn() + Send + Sync + 'static>;

struct Registration {
    gate: ReadinessGate,
    health_check: HealthCheck,
    recovery_action: Option<RecoveryAction>,
    max_consecutive_failures: u32,
    last_result: Option<bool>,
}

type ServiceMap = BTreeMap<String, Registration>;

fn lock(m: &Mutex<ServiceMap>) -> MutexGuard<'_, ServiceMap> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owns the readiness gates and the background scheduler.
pub struct HealthMonitor {
    services: Arc<Mutex<ServiceMap>>,
    monitoring_enabled: Arc<AtomicBool>,
    ever_unhealthy: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    check_interval: Duration,
    probe_timeout: Duration,
    scheduler: Option<thread::JoinHandle<()>>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::with_intervals(DEFAULT_CHECK_INTERVAL, PROBE_TIMEOUT)
    }

    /// Construct with custom tick interval and per-probe timeout.
    pub fn with_intervals(check_interval: Duration, probe_timeout: Duration) -> Self {
        Self {
            services: Arc::new(Mutex::new(BTreeMap::new())),
            monitoring_enabled: Arc::new(AtomicBool::new(false)),
            ever_unhealthy: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
            check_interval,
            probe_timeout,
            scheduler: None,
        }
    }

    /// Register a service for monitoring.
    ///
    /// The grace period defaults by service-name heuristic (frontend 90s,
    /// backend 30s, otherwise 30s) when not supplied. Registering a name
    /// twice is an error; re-registration must go through
    /// `unregister_service` first.
    pub fn register_service(
        &self,
        name: &str,
        health_check: HealthCheck,
        recovery_action: Option<RecoveryAction>,
        max_consecutive_failures: Option<u32>,
        grace_period: Option<Duration>,
    ) -> Result<(), MonitorError> {
        let mut services = lock(&self.services);
        if services.contains_key(name) {
            return Err(MonitorError::AlreadyRegistered(name.to_string()));
        }
        let grace = grace_period.unwrap_or_else(|| default_grace_period(name));
        services.insert(
            name.to_string(),
            Registration {
                gate: ReadinessGate::new(name, grace),
                health_check,
                recovery_action,
                max_consecutive_failures: max_consecutive_failures
                    .unwrap_or(DEFAULT_MAX_CONSECUTIVE_FAILURES),
                last_result: None,
            },
        );
        tracing::debug!(service = name, grace_secs = grace.as_secs(), "service registered");
        Ok(())
    }

    /// Remove a service from monitoring.
    ///
    /// # Returns
    /// `true` if the name was registered.
    pub fn unregister_service(&self, name: &str) -> bool {
        lock(&self.services).remove(name).is_some()
    }

    /// Forward the sequencer's readiness confirmation to the named gate.
    ///
    /// # Returns
    /// `false` if the name is unknown.
    pub fn mark_service_ready(&self, name: &str, pid: Option<u32>, ports: &[u16]) -> bool {
        let mut services = lock(&self.services);
        match services.get_mut(name) {
            Some(reg) => {
                reg.gate.mark_ready(pid, ports);
                tracing::info!(service = name, ?pid, "readiness confirmed");
                true
            }
            None => false,
        }
    }

    /// Flip the global monitoring switch. Until this is called the
    /// scheduler performs no health checks at all.
    pub fn enable_monitoring(&self) {
        self.monitoring_enabled.store(true, Ordering::SeqCst);
        tracing::info!("health monitoring enabled");
    }

    pub fn monitoring_enabled(&self) -> bool {
        self.monitoring_enabled.load(Ordering::SeqCst)
    }

    /// Health view of one service.
    ///
    /// Startup states report healthy: a service still compiling or warming
    /// up must not be surfaced as a failure. Once monitoring, this
    /// reflects the latest check result.
    pub fn is_healthy(&self, name: &str) -> bool {
        let services = lock(&self.services);
        let Some(reg) = services.get(name) else {
            return false;
        };
        match reg.gate.state() {
            ServiceState::Starting | ServiceState::GracePeriod | ServiceState::Ready => true,
            ServiceState::Monitoring => reg.last_result.unwrap_or(true),
            ServiceState::Failed => false,
        }
    }

    /// AND over every registered service's health view.
    pub fn all_healthy(&self) -> bool {
        let services = lock(&self.services);
        services.values().all(|reg| match reg.gate.state() {
            ServiceState::Starting | ServiceState::GracePeriod | ServiceState::Ready => true,
            ServiceState::Monitoring => reg.last_result.unwrap_or(true),
            ServiceState::Failed => false,
        })
    }

    /// Whether any service ever reported an unhealthy check result.
    /// Drives the launcher's exit code.
    pub fn was_ever_unhealthy(&self) -> bool {
        self.ever_unhealthy.load(Ordering::SeqCst)
    }

    pub fn service_state(&self, name: &str) -> Option<ServiceState> {
        lock(&self.services).get(name).map(|reg| reg.gate.state())
    }

    /// Snapshot of all service states, in name order.
    pub fn service_states(&self) -> Vec<(String, ServiceState)> {
        lock(&self.services)
            .iter()
            .map(|(name, reg)| (name.clone(), reg.gate.state()))
            .collect()
    }

    /// Start the background scheduler thread. No-op if already running.
    pub fn start(&mut self) {
        if self.scheduler.is_some() {
            return;
        }
        self.shutdown.store(false, Ordering::SeqCst);

        let services = Arc::clone(&self.services);
        let enabled = Arc::clone(&self.monitoring_enabled);
        let ever_unhealthy = Arc::clone(&self.ever_unhealthy);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.check_interval;
        let probe_timeout = self.probe_timeout;

        self.scheduler = Some(thread::spawn(move || {
            while !shutdown.load(Ordering::SeqCst) {
                tick(&services, &enabled, &ever_unhealthy, &shutdown, probe_timeout);

                // Sleep in small steps so stop() is prompt.
                let tick_end = Instant::now() + interval;
                while Instant::now() < tick_end && !shutdown.load(Ordering::SeqCst) {
                    thread::sleep(SHUTDOWN_POLL);
                }
            }
        }));
    }

    /// Stop the scheduler and join it.
    ///
    /// After this returns, no new health check will be started. A check
    /// in flight at call time is allowed to finish (bounded by its own
    /// per-call timeout); the join waits for it.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.scheduler.take() {
            let _ = handle.join();
        }
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One scheduler pass over all registered services.
fn tick(
    services: &Mutex<ServiceMap>,
    enabled: &AtomicBool,
    ever_unhealthy: &AtomicBool,
    shutdown: &AtomicBool,
    probe_timeout: Duration,
) {
    // Collect due checks under the lock, then probe without holding it so
    // registration and mark_ready never block behind a slow probe.
    let due: Vec<(String, HealthCheck)> = {
        let mut map = lock(services);
        let monitoring = enabled.load(Ordering::SeqCst);
        let mut due = Vec::new();
        for (name, reg) in map.iter_mut() {
            reg.gate.begin_grace_period();
            if monitoring && reg.gate.should_monitor() {
                due.push((name.clone(), Arc::clone(&reg.health_check)));
            }
        }
        due
    };

    for (name, check) in due {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let healthy = run_probe(&check, probe_timeout);
        let recovery = record_result(services, &name, healthy, ever_unhealthy);

        if let Some((action, failures)) = recovery {
            tracing::warn!(
                service = %name,
                failures,
                "failure threshold reached, invoking recovery action"
            );
            // A panicking recovery action must not take down the loop.
            if catch_unwind(AssertUnwindSafe(|| action())).is_err() {
                tracing::error!(service = %name, "recovery action panicked");
            }
        }
    }
}

/// Record a check outcome and decide whether recovery should fire.
///
/// Returns the recovery action and the failure count that triggered it,
/// if the threshold was crossed. The counter is reset before returning so
/// recovery fires exactly once per run of failures.
fn record_result(
    services: &Mutex<ServiceMap>,
    name: &str,
    healthy: bool,
    ever_unhealthy: &AtomicBool,
) -> Option<(RecoveryAction, u32)> {
    let mut map = lock(services);
    // The service may have been unregistered while its probe ran.
    let reg = map.get_mut(name)?;

    if healthy {
        let was_failing = reg.gate.consecutive_failures() > 0;
        reg.gate.record_check_result(true);
        reg.last_result = Some(true);
        if was_failing {
            tracing::info!(service = name, "service recovered");
        }
        return None;
    }

    ever_unhealthy.store(true, Ordering::SeqCst);
    let failures = reg.gate.record_check_result(false);
    reg.last_result = Some(false);
    tracing::warn!(service = name, failures, "health check failed");

    if failures < reg.max_consecutive_failures {
        return None;
    }

    reg.gate.reset_failures();
    match reg.recovery_action.as_ref() {
        Some(action) => Some((Arc::clone(action), failures)),
        None => {
            // No recovery path: the service leaves the rotation and
            // requires an external restart.
            reg.gate.mark_failed();
            tracing::error!(
                service = name,
                failures,
                "sustained failure with no recovery action; manual restart required"
            );
            None
        }
    }
}

/// Invoke a probe with a bounded timeout.
///
/// The probe runs on a helper thread; if it neither returns nor panics
/// within the timeout it is counted as unhealthy and the helper thread is
/// left to finish on its own.
fn run_probe(check: &HealthCheck, timeout: Duration) -> bool {
    let (tx, rx) = mpsc::channel();
    let probe = Arc::clone(check);
    thread::spawn(move || {
        let result = catch_unwind(AssertUnwindSafe(|| probe())).unwrap_or(false);
        let _ = tx.send(result);
    });
    rx.recv_timeout(timeout).unwrap_or(false)
}
