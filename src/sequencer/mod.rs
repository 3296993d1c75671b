//! Ordered startup sequencing.
//!
//! The sequencer runs on the caller's control flow and is deliberately
//! sequential: auth, then backend, then frontend. A later stage is never
//! started unless every earlier stage reached ready within its deadline.
//! On any stage failure the already-started stages are torn down in
//! reverse order, so no half-running system is left behind. Only after
//! all three stages are ready does the sequencer flip the monitor's
//! global switch, as its single final step.

pub mod stage;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::substitute_port;
use crate::discovery::{DiscoveryStore, ServiceRecord};
use crate::error::{SequencerError, StageError, StageErrorKind};
use crate::health::monitor::{HealthCheck, HealthMonitor};
use crate::ports;
use crate::probes;
use crate::process::ProcessRegistry;

pub use stage::{DiscoveryField, EnvFromDiscovery, ReadinessProbe, StageSpec};

/// Settle time after spawn before checking for an immediate crash.
const LAUNCH_SETTLE: Duration = Duration::from_millis(250);
/// Sleep between readiness probe attempts.
const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Deadline for a secondary probe once the primary has passed.
const SECONDARY_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Where the sequencer is in the startup dance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerPhase {
    Init,
    AuthStarting,
    AuthReady,
    BackendStarting,
    BackendReady,
    FrontendStarting,
    FrontendReady,
    MonitoringEnabled,
}

impl std::fmt::Display for SequencerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match self {
            SequencerPhase::Init => "init",
            SequencerPhase::AuthStarting => "auth starting",
            SequencerPhase::AuthReady => "auth ready",
            SequencerPhase::BackendStarting => "backend starting",
            SequencerPhase::BackendReady => "backend ready",
            SequencerPhase::FrontendStarting => "frontend starting",
            SequencerPhase::FrontendReady => "frontend ready",
            SequencerPhase::MonitoringEnabled => "monitoring enabled",
        };
        write!(f, "{phase}")
    }
}

/// Orchestrates ordered startup of the three supervised services.
pub struct StartupSequencer<'a> {
    registry: Arc<ProcessRegistry>,
    monitor: &'a HealthMonitor,
    discovery: DiscoveryStore,
    dynamic_ports: bool,
    phase: SequencerPhase,
    /// Successfully started stages, in start order.
    started: Vec<String>,
    /// Stages torn down during the last rollback, in teardown order.
    torn_down: Vec<String>,
}

impl<'a> StartupSequencer<'a> {
    pub fn new(
        registry: Arc<ProcessRegistry>,
        monitor: &'a HealthMonitor,
        discovery: DiscoveryStore,
        dynamic_ports: bool,
    ) -> Self {
        Self {
            registry,
            monitor,
            discovery,
            dynamic_ports,
            phase: SequencerPhase::Init,
            started: Vec::new(),
            torn_down: Vec::new(),
        }
    }

    pub fn phase(&self) -> SequencerPhase {
        self.phase
    }

    /// Teardown order of the last rollback, for post-mortems.
    pub fn torn_down(&self) -> &[String] {
        &self.torn_down
    }

    /// Run the full startup sequence.
    ///
    /// All three services are registered with the monitor before any
    /// process exists; no health-check traffic is possible until the
    /// final `enable_monitoring()` call, which happens exactly once and
    /// only after every stage reached ready.
    pub fn run(
        &mut self,
        auth: StageSpec,
        backend: StageSpec,
        frontend: StageSpec,
    ) -> Result<(), SequencerError> {
        for spec in [&auth, &backend, &frontend] {
            self.monitor.register_service(
                &spec.name,
                self.monitor_probe(spec),
                spec.recovery.clone(),
                Some(spec.max_consecutive_failures),
                Some(spec.grace_period),
            )?;
        }

        let stages = [
            (SequencerPhase::AuthStarting, SequencerPhase::AuthReady, auth),
            (
                SequencerPhase::BackendStarting,
                SequencerPhase::BackendReady,
                backend,
            ),
            (
                SequencerPhase::FrontendStarting,
                SequencerPhase::FrontendReady,
                frontend,
            ),
        ];

        for (starting, ready, spec) in stages {
            self.phase = starting;
            tracing::info!(stage = %spec.name, "starting stage");
            match self.run_stage(&spec) {
                Ok(port) => {
                    self.phase = ready;
                    tracing::info!(stage = %spec.name, port, "stage ready");
                }
                Err(e) => {
                    tracing::error!(stage = %spec.name, error = %e, "stage failed, rolling back");
                    self.rollback();
                    return Err(e.into());
                }
            }
        }

        self.monitor.enable_monitoring();
        self.phase = SequencerPhase::MonitoringEnabled;
        Ok(())
    }

    /// Launch one stage and wait for its readiness probe.
    ///
    /// # Returns
    /// The port the service actually bound (may differ from the
    /// configured one in dynamic-port mode).
    fn run_stage(&mut self, spec: &StageSpec) -> Result<u16, StageError> {
        let stage_err = |kind| StageError::new(&spec.name, kind);

        let port = self.resolve_port(spec)?;
        let env = self.build_env(spec, port)?;
        let command: Vec<String> = spec
            .command
            .iter()
            .map(|arg| substitute_port(arg, port))
            .collect();

        let pid = self
            .registry
            .launch(&spec.name, &command, &env, &spec.cwd, &[port])
            .map_err(|e| stage_err(StageErrorKind::LaunchFailure(format!("{e:#}"))))?;

        // The stage is now the rollback path's responsibility, whatever
        // happens below.
        self.started.push(spec.name.clone());

        thread::sleep(LAUNCH_SETTLE);
        if let Some(status) = self.registry.check_exit(&spec.name) {
            return Err(stage_err(StageErrorKind::LaunchFailure(format!(
                "process exited immediately ({status})"
            ))));
        }

        self.await_readiness(spec, port)?;

        let record = ServiceRecord {
            port,
            url: spec.url_for(port),
            api_url: spec.api_url.as_deref().map(|u| substitute_port(u, port)),
            pid: Some(pid),
            timestamp: chrono::Utc::now(),
        };
        self.discovery
            .write(&spec.name, &record)
            .map_err(|e| stage_err(StageErrorKind::LaunchFailure(format!("{e:#}"))))?;

        self.monitor.mark_service_ready(&spec.name, Some(pid), &[port]);
        Ok(port)
    }

    /// Verify the configured port is free, reassigning in dynamic mode.
    fn resolve_port(&self, spec: &StageSpec) -> Result<u16, StageError> {
        if ports::is_available(spec.port) {
            return Ok(spec.port);
        }
        if !self.dynamic_ports {
            let owner = ports::find_owner(spec.port)
                .map(|d| format!(" (owned by {d})"))
                .unwrap_or_default();
            return Err(StageError::new(
                &spec.name,
                StageErrorKind::PortConflict {
                    port: spec.port,
                    owner,
                },
            ));
        }
        let port = ports::find_free_port().ok_or_else(|| {
            StageError::new(
                &spec.name,
                StageErrorKind::LaunchFailure("no free port available".to_string()),
            )
        })?;
        tracing::info!(
            stage = %spec.name,
            configured = spec.port,
            reassigned = port,
            "port conflict, reassigned"
        );
        Ok(port)
    }

    /// Assemble the child environment: static vars, the chosen port, and
    /// values resolved from earlier stages' discovery records.
    fn build_env(&self, spec: &StageSpec, port: u16) -> Result<Vec<(String, String)>, StageError> {
        let mut env: Vec<(String, String)> = spec
            .env
            .iter()
            .map(|(k, v)| (k.clone(), substitute_port(v, port)))
            .collect();
        env.push(("PORT".to_string(), port.to_string()));

        for item in &spec.env_from_discovery {
            let record = self
                .discovery
                .read(&item.service)
                .ok()
                .flatten()
                .ok_or_else(|| {
                    StageError::new(
                        &spec.name,
                        StageErrorKind::DependencyNotSatisfied(item.service.clone()),
                    )
                })?;
            let value = match item.field {
                DiscoveryField::Port => record.port.to_string(),
                DiscoveryField::Url => record.url.clone(),
                DiscoveryField::ApiUrl => record.api_url.unwrap_or(record.url),
            };
            env.push((item.var.clone(), value));
        }
        Ok(env)
    }

    /// Bounded poll loop for a stage's readiness probe. Also watches for
    /// the process dying mid-startup, which is a launch failure rather
    /// than a timeout.
    fn await_readiness(&self, spec: &StageSpec, port: u16) -> Result<(), StageError> {
        let (primary, secondary): (Box<dyn Fn() -> bool>, Option<Box<dyn Fn() -> bool>>) =
            match &spec.readiness {
                ReadinessProbe::Http { url, secondary_url } => {
                    let primary_url = substitute_port(url, port);
                    let primary: Box<dyn Fn() -> bool> =
                        Box::new(move || probes::http_check(&primary_url));
                    let secondary = secondary_url.as_ref().map(|u| {
                        let url = substitute_port(u, port);
                        Box::new(move || probes::http_check(&url)) as Box<dyn Fn() -> bool>
                    });
                    (primary, secondary)
                }
                ReadinessProbe::ProcessAlive => {
                    let registry = Arc::clone(&self.registry);
                    let name = spec.name.clone();
                    (Box::new(move || registry.is_alive(&name)), None)
                }
                ReadinessProbe::Custom(probe) => {
                    let probe = Arc::clone(probe);
                    (Box::new(move || probe()), None)
                }
            };

        let deadline = Instant::now() + spec.readiness_timeout;
        self.poll_probe(spec, &primary, deadline, "readiness probe")?;

        if let Some(secondary) = secondary {
            let deadline = Instant::now() + SECONDARY_PROBE_TIMEOUT;
            self.poll_probe(spec, &secondary, deadline, "secondary config probe")?;
        }
        Ok(())
    }

    fn poll_probe(
        &self,
        spec: &StageSpec,
        probe: &dyn Fn() -> bool,
        deadline: Instant,
        what: &str,
    ) -> Result<(), StageError> {
        loop {
            if let Some(status) = self.registry.check_exit(&spec.name) {
                return Err(StageError::new(
                    &spec.name,
                    StageErrorKind::LaunchFailure(format!(
                        "process exited during startup ({status})"
                    )),
                ));
            }
            if probe() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(StageError::new(
                    &spec.name,
                    StageErrorKind::ReadinessTimeout {
                        timeout_secs: spec.readiness_timeout.as_secs(),
                        reason: format!("{what} never succeeded"),
                    },
                ));
            }
            thread::sleep(READINESS_POLL_INTERVAL);
        }
    }

    /// Tear down every started stage in reverse start order. Failures are
    /// logged and never stop the remaining teardowns.
    fn rollback(&mut self) {
        self.torn_down.clear();
        while let Some(name) = self.started.pop() {
            tracing::info!(stage = %name, "tearing down");
            if let Err(e) = self.registry.terminate(&name) {
                tracing::warn!(stage = %name, error = %e, "teardown error");
            }
            if let Err(e) = self.discovery.remove(&name) {
                tracing::warn!(stage = %name, error = %e, "discovery cleanup error");
            }
            self.torn_down.push(name);
        }
    }

    /// Build the steady-state health check the monitor will use for a
    /// stage. HTTP probes re-resolve the port from the discovery record
    /// at call time so dynamic reassignment carries through.
    fn monitor_probe(&self, spec: &StageSpec) -> HealthCheck {
        match &spec.readiness {
            ReadinessProbe::Http { url, .. } => {
                let template = url.clone();
                let store = self.discovery.clone();
                let name = spec.name.clone();
                let fallback = spec.port;
                Arc::new(move || {
                    let port = store
                        .read(&name)
                        .ok()
                        .flatten()
                        .map(|r| r.port)
                        .unwrap_or(fallback);
                    probes::http_check(&substitute_port(&template, port))
                })
            }
            ReadinessProbe::ProcessAlive => {
                let registry = Arc::clone(&self.registry);
                let name = spec.name.clone();
                Arc::new(move || registry.is_alive(&name))
            }
            ReadinessProbe::Custom(probe) => Arc::clone(probe),
        }
    }
}
