//! File-backed service discovery.
//!
//! The sequencer writes one JSON record per service after its stage
//! succeeds; later stages read those records to construct their own
//! environment (the frontend needs the backend's chosen port, which may
//! have been dynamically reassigned).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Discovery record for one service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceRecord {
    pub port: u16,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

impl ServiceRecord {
    pub fn new(port: u16, url: impl Into<String>) -> Self {
        Self {
            port,
            url: url.into(),
            api_url: None,
            pid: None,
            timestamp: Utc::now(),
        }
    }
}

/// Key -> record store backed by one JSON file per service name.
#[derive(Debug, Clone)]
pub struct DiscoveryStore {
    dir: PathBuf,
}

impl DiscoveryStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create discovery directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    pub fn write(&self, name: &str, record: &ServiceRecord) -> Result<PathBuf> {
        let path = self.record_path(name);
        let json = serde_json::to_string_pretty(record)
            .with_context(|| format!("failed to serialize discovery record for '{name}'"))?;
        fs::write(&path, json)
            .with_context(|| format!("failed to write discovery record {}", path.display()))?;
        Ok(path)
    }

    pub fn read(&self, name: &str) -> Result<Option<ServiceRecord>> {
        let path = self.record_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read discovery record {}", path.display()))?;
        let record = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse discovery record {}", path.display()))?;
        Ok(Some(record))
    }

    /// All records, sorted by service name.
    pub fn all(&self) -> Result<Vec<(String, ServiceRecord)>> {
        let mut records = Vec::new();
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read discovery directory {}", self.dir.display()))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some(record) = self.read(name)? {
                records.push((name.to_string(), record));
            }
        }
        records.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(records)
    }

    pub fn remove(&self, name: &str) -> Result<bool> {
        let path = self.record_path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => {
                Err(e).with_context(|| format!("failed to remove record {}", path.display()))
            }
        }
    }

    /// Remove every record. Stale records from a previous run would
    /// otherwise leak into the next launch's environment.
    pub fn clear(&self) -> Result<()> {
        for (name, _) in self.all()? {
            self.remove(&name)?;
        }
        Ok(())
    }
}
