//! Launcher configuration: `cascade.toml` parsing and env-file loading.
//!
//! URLs in the config may contain a `{port}` placeholder so that dynamic
//! port reassignment carries through to health probes and discovery
//! records.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Top-level `cascade.toml` structure.
#[derive(Debug, Clone, Deserialize)]
pub struct LauncherConfig {
    #[serde(default)]
    pub launcher: LauncherSection,
    pub services: Services,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LauncherSection {
    /// Reassign ports automatically when a configured port is taken.
    pub dynamic_ports: bool,
    /// KEY=VALUE file loaded into every child environment.
    pub env_file: Option<PathBuf>,
    /// Root for launcher state (discovery records).
    pub state_dir: PathBuf,
}

impl Default for LauncherSection {
    fn default() -> Self {
        Self {
            dynamic_ports: false,
            env_file: None,
            state_dir: PathBuf::from(".cascade"),
        }
    }
}

/// The three supervised services, in startup order.
#[derive(Debug, Clone, Deserialize)]
pub struct Services {
    pub auth: ServiceConfig,
    pub backend: ServiceConfig,
    pub frontend: ServiceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Program and arguments.
    pub command: Vec<String>,
    pub port: u16,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Advertised base URL; defaults to `http://127.0.0.1:{port}`.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_url: Option<String>,
    /// HTTP readiness/health endpoint. Required for auth and backend.
    #[serde(default)]
    pub health_url: Option<String>,
    /// Secondary probe endpoint (the auth service's config check).
    #[serde(default)]
    pub config_url: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub grace_period_secs: Option<u64>,
    #[serde(default)]
    pub readiness_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_consecutive_failures: Option<u32>,
}

impl ServiceConfig {
    /// The advertised URL with `{port}` resolved.
    pub fn url_for(&self, port: u16) -> String {
        match &self.url {
            Some(url) => substitute_port(url, port),
            None => format!("http://127.0.0.1:{port}"),
        }
    }
}

/// Load and parse a `cascade.toml`.
pub fn load(path: &Path) -> Result<LauncherConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: LauncherConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse config {}", path.display()))?;

    for (name, service) in [
        ("auth", &config.services.auth),
        ("backend", &config.services.backend),
        ("frontend", &config.services.frontend),
    ] {
        if service.command.is_empty() {
            bail!("service '{name}' has an empty command");
        }
    }
    Ok(config)
}

/// Replace the `{port}` placeholder in a URL template.
pub fn substitute_port(url: &str, port: u16) -> String {
    url.replace("{port}", &port.to_string())
}

/// Parse a KEY=VALUE env file (the secrets file).
///
/// Blank lines and `#` comments are skipped; surrounding single or double
/// quotes on values are stripped.
pub fn load_env_file(path: &Path) -> Result<Vec<(String, String)>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read env file {}", path.display()))?;

    let mut vars = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            bail!(
                "malformed line {} in env file {}: expected KEY=VALUE",
                lineno + 1,
                path.display()
            );
        };
        let key = key.trim();
        let mut value = value.trim();
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            value = &value[1..value.len() - 1];
        }
        vars.push((key.to_string(), value.to_string()));
    }
    Ok(vars)
}
