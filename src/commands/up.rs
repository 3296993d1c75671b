//! `cascade up`: start all services in dependency order, then monitor
//! until interrupted.
//!
//! Exit code contract: 0 on clean shutdown with every service healthy the
//! whole run, 1 if startup failed or any service was ever unhealthy.

use anyhow::{Context, Result};
use colored::Colorize;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::{self, LauncherConfig, ServiceConfig};
use crate::discovery::DiscoveryStore;
use crate::health::monitor::RecoveryAction;
use crate::health::HealthMonitor;
use crate::process::ProcessRegistry;
use crate::sequencer::{
    DiscoveryField, EnvFromDiscovery, ReadinessProbe, StageSpec, StartupSequencer,
};

/// Execute the up command.
///
/// # Arguments
/// * `config_path` - Path to cascade.toml
/// * `dynamic_ports` - Reassign taken ports instead of failing
/// * `no_secrets` - Skip loading the env file
/// * `non_interactive` - Never prompt; assume safe defaults
///
/// # Returns
/// The process exit code.
pub fn execute(
    config_path: &Path,
    dynamic_ports: bool,
    no_secrets: bool,
    non_interactive: bool,
) -> Result<i32> {
    let cfg = config::load(config_path)?;
    let dynamic_ports = dynamic_ports || cfg.launcher.dynamic_ports;

    let secrets = if no_secrets {
        Vec::new()
    } else {
        load_secrets(&cfg, non_interactive)?
    };

    print_header();

    let registry = Arc::new(ProcessRegistry::new());
    let discovery = DiscoveryStore::new(cfg.launcher.state_dir.join("discovery"))?;
    // Stale records from a previous run must not leak into child envs.
    discovery.clear()?;

    let mut monitor = HealthMonitor::new();
    monitor.start();

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst))
            .context("failed to install Ctrl-C handler")?;
    }

    let (auth, backend, frontend) = build_stages(&cfg, &secrets);
    let mut sequencer =
        StartupSequencer::new(Arc::clone(&registry), &monitor, discovery.clone(), dynamic_ports);

    if let Err(e) = sequencer.run(auth, backend, frontend) {
        eprintln!("{} {e}", "✗".red().bold());
        monitor.stop();
        return Ok(1);
    }

    println!(
        "{} all services ready; monitoring enabled",
        "✓".green().bold()
    );
    for (name, record) in discovery.all()? {
        println!(
            "  {} {} {}",
            name.bold(),
            record.url.cyan(),
            format!("(pid {})", record.pid.unwrap_or(0)).dimmed()
        );
    }
    println!("\nPress Ctrl-C to stop.");

    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
    }

    println!("\n{}", "Shutting down...".bold());
    monitor.stop();
    for name in registry.terminate_all() {
        println!("  {} {name} stopped", "✓".green());
    }
    discovery.clear()?;

    if monitor.was_ever_unhealthy() {
        println!("{} some services were unhealthy during this run", "!".yellow().bold());
        Ok(1)
    } else {
        Ok(0)
    }
}

/// Load the secrets env file named in the config, if any.
///
/// A missing file is fatal in interactive mode unless the user opts to
/// continue; non-interactive mode continues with a warning.
fn load_secrets(cfg: &LauncherConfig, non_interactive: bool) -> Result<Vec<(String, String)>> {
    let Some(env_file) = &cfg.launcher.env_file else {
        return Ok(Vec::new());
    };
    if env_file.exists() {
        return config::load_env_file(env_file);
    }

    eprintln!(
        "{} env file {} not found",
        "!".yellow().bold(),
        env_file.display()
    );
    if non_interactive || confirm("Continue without secrets?")? {
        Ok(Vec::new())
    } else {
        anyhow::bail!("aborted: env file {} not found", env_file.display())
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} [y/N] ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}

fn print_header() {
    println!();
    println!("{}", "╭──────────────────────────────────────╮".cyan());
    println!(
        "{}",
        "│         Starting cascade...          │".cyan().bold()
    );
    println!("{}", "╰──────────────────────────────────────╯".cyan());
}

/// Translate the config into the three ordered stage specs.
fn build_stages(
    cfg: &LauncherConfig,
    secrets: &[(String, String)],
) -> (StageSpec, StageSpec, StageSpec) {
    let mut auth = base_stage("auth", &cfg.services.auth, secrets);
    auth.readiness = ReadinessProbe::Http {
        url: cfg
            .services
            .auth
            .health_url
            .clone()
            .unwrap_or_else(|| "http://127.0.0.1:{port}/health".to_string()),
        secondary_url: cfg.services.auth.config_url.clone(),
    };

    let mut backend = base_stage("backend", &cfg.services.backend, secrets);
    backend.readiness = ReadinessProbe::Http {
        url: cfg
            .services
            .backend
            .health_url
            .clone()
            .unwrap_or_else(|| "http://127.0.0.1:{port}/health".to_string()),
        secondary_url: None,
    };
    backend.env_from_discovery.push(EnvFromDiscovery {
        var: "AUTH_SERVICE_URL".to_string(),
        service: "auth".to_string(),
        field: DiscoveryField::Url,
    });

    // Frontend dev servers expose no health endpoint; staying alive is
    // the readiness signal.
    let mut frontend = base_stage("frontend", &cfg.services.frontend, secrets);
    frontend.readiness = ReadinessProbe::ProcessAlive;
    frontend.env_from_discovery.push(EnvFromDiscovery {
        var: "BACKEND_URL".to_string(),
        service: "backend".to_string(),
        field: DiscoveryField::ApiUrl,
    });
    frontend.env_from_discovery.push(EnvFromDiscovery {
        var: "BACKEND_PORT".to_string(),
        service: "backend".to_string(),
        field: DiscoveryField::Port,
    });

    (auth, backend, frontend)
}

fn base_stage(name: &str, service: &ServiceConfig, secrets: &[(String, String)]) -> StageSpec {
    let mut spec = StageSpec::new(name, service.command.clone(), service.port);
    if let Some(cwd) = &service.cwd {
        spec.cwd = cwd.clone();
    }
    spec.url = service.url.clone();
    spec.api_url = service.api_url.clone();

    spec.env = secrets.to_vec();
    spec.env
        .extend(service.env.iter().map(|(k, v)| (k.clone(), v.clone())));

    if let Some(secs) = service.grace_period_secs {
        spec.grace_period = Duration::from_secs(secs);
    }
    if let Some(secs) = service.readiness_timeout_secs {
        spec.readiness_timeout = Duration::from_secs(secs);
    }
    if let Some(max) = service.max_consecutive_failures {
        spec.max_consecutive_failures = max;
    }

    let service_name = name.to_string();
    let recovery: RecoveryAction = Arc::new(move || {
        eprintln!(
            "{} {} is unhealthy; manual restart required",
            "!".yellow().bold(),
            service_name.bold()
        );
    });
    spec.recovery = Some(recovery);
    spec
}
