//! `cascade status`: show discovered services and their liveness.

use anyhow::Result;
use chrono::Utc;
use colored::Colorize;
use std::path::Path;

use crate::config;
use crate::discovery::DiscoveryStore;
use crate::process;

pub fn execute(config_path: &Path) -> Result<i32> {
    let cfg = config::load(config_path)?;
    let discovery = DiscoveryStore::new(cfg.launcher.state_dir.join("discovery"))?;

    let records = discovery.all()?;
    if records.is_empty() {
        println!("No services running.");
        return Ok(0);
    }

    println!("{}", "Services".bold());
    println!("{}", "─".repeat(60).dimmed());
    for (name, record) in records {
        let alive = record.pid.map(process::is_process_alive).unwrap_or(false);
        let marker = if alive {
            "●".green().to_string()
        } else {
            "●".red().to_string()
        };
        let age = Utc::now().signed_duration_since(record.timestamp);
        println!(
            "{marker} {:<12} {:<28} port {:<6} up {}m",
            name.bold(),
            record.url,
            record.port,
            age.num_minutes()
        );
    }
    Ok(0)
}
