//! `cascade down`: stop services recorded in the discovery store.
//!
//! Useful when a previous `up` was killed without a clean shutdown and
//! its children are still holding ports. Teardown runs in reverse start
//! order (most recently started first).

use anyhow::Result;
use colored::Colorize;
use std::path::Path;

use crate::config;
use crate::discovery::DiscoveryStore;
use crate::process;

pub fn execute(config_path: &Path) -> Result<i32> {
    let cfg = config::load(config_path)?;
    let discovery = DiscoveryStore::new(cfg.launcher.state_dir.join("discovery"))?;

    let mut records = discovery.all()?;
    if records.is_empty() {
        println!("No services recorded; nothing to stop.");
        return Ok(0);
    }

    // Most recently started first, mirroring the sequencer's rollback.
    records.sort_by(|a, b| b.1.timestamp.cmp(&a.1.timestamp));

    for (name, record) in records {
        match record.pid {
            Some(pid) if process::is_process_alive(pid) => {
                let clean = process::terminate_detached(pid, &[record.port]);
                if clean {
                    println!("  {} {name} stopped (pid {pid})", "✓".green());
                } else {
                    println!(
                        "  {} {name} stopped, but port {} is still held",
                        "!".yellow(),
                        record.port
                    );
                }
            }
            _ => {
                println!("  {} {name} already gone", "·".dimmed());
            }
        }
        discovery.remove(&name)?;
    }

    Ok(0)
}
