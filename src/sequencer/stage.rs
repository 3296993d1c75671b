//! Stage descriptions consumed by the startup sequencer.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::substitute_port;
use crate::health::gate::default_grace_period;
use crate::health::monitor::{RecoveryAction, DEFAULT_MAX_CONSECUTIVE_FAILURES};

/// Readiness deadline for the auth stage (plus its secondary probe).
pub const AUTH_READINESS_TIMEOUT: Duration = Duration::from_secs(10);
/// Readiness deadline for the backend stage.
pub const BACKEND_READINESS_TIMEOUT: Duration = Duration::from_secs(30);
/// Readiness deadline for the frontend stage, which may be compiling.
pub const FRONTEND_READINESS_TIMEOUT: Duration = Duration::from_secs(90);

/// Pick a stage readiness deadline from the service name, mirroring the
/// grace-period heuristic.
pub fn default_readiness_timeout(name: &str) -> Duration {
    let lower = name.to_lowercase();
    if lower.contains("frontend") {
        FRONTEND_READINESS_TIMEOUT
    } else if lower.contains("backend") {
        BACKEND_READINESS_TIMEOUT
    } else {
        AUTH_READINESS_TIMEOUT
    }
}

/// How a stage proves readiness during startup.
pub enum ReadinessProbe {
    /// Poll an HTTP endpoint for a 2xx. The optional secondary URL is
    /// probed after the primary passes (the auth service's config check).
    /// URLs may contain a `{port}` placeholder.
    Http {
        url: String,
        secondary_url: Option<String>,
    },
    /// The process merely has to stay alive (frontend dev servers with no
    /// health endpoint).
    ProcessAlive,
    /// Caller-supplied probe.
    Custom(Arc<dyn Fn() -> bool + Send + Sync + 'static>),
}

impl fmt::Debug for ReadinessProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadinessProbe::Http { url, secondary_url } => f
                .debug_struct("Http")
                .field("url", url)
                .field("secondary_url", secondary_url)
                .finish(),
            ReadinessProbe::ProcessAlive => write!(f, "ProcessAlive"),
            ReadinessProbe::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// A discovery field another stage's record provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryField {
    Port,
    Url,
    ApiUrl,
}

/// Environment variable sourced from an earlier stage's discovery record.
#[derive(Debug, Clone)]
pub struct EnvFromDiscovery {
    pub var: String,
    pub service: String,
    pub field: DiscoveryField,
}

/// Everything the sequencer needs to run one startup stage.
pub struct StageSpec {
    pub name: String,
    /// Program and arguments. `{port}` placeholders are substituted with
    /// the chosen port, which matters in dynamic-port mode.
    pub command: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub env_from_discovery: Vec<EnvFromDiscovery>,
    pub port: u16,
    /// Advertised URL template; defaults to `http://127.0.0.1:{port}`.
    pub url: Option<String>,
    pub api_url: Option<String>,
    pub readiness: ReadinessProbe,
    pub readiness_timeout: Duration,
    pub grace_period: Duration,
    pub max_consecutive_failures: u32,
    pub recovery: Option<RecoveryAction>,
}

impl fmt::Debug for StageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageSpec")
            .field("name", &self.name)
            .field("command", &self.command)
            .field("port", &self.port)
            .field("readiness", &self.readiness)
            .field("readiness_timeout", &self.readiness_timeout)
            .field("grace_period", &self.grace_period)
            .field("recovery", &self.recovery.as_ref().map(|_| ".."))
            .finish_non_exhaustive()
    }
}

impl StageSpec {
    pub fn new(name: impl Into<String>, command: Vec<String>, port: u16) -> Self {
        let name = name.into();
        let grace_period = default_grace_period(&name);
        let readiness_timeout = default_readiness_timeout(&name);
        Self {
            name,
            command,
            cwd: PathBuf::from("."),
            env: Vec::new(),
            env_from_discovery: Vec::new(),
            port,
            url: None,
            api_url: None,
            readiness: ReadinessProbe::ProcessAlive,
            readiness_timeout,
            grace_period,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            recovery: None,
        }
    }

    /// The advertised URL with `{port}` resolved against the chosen port.
    pub fn url_for(&self, port: u16) -> String {
        match &self.url {
            Some(url) => substitute_port(url, port),
            None => format!("http://127.0.0.1:{port}"),
        }
    }
}
