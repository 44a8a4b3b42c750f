//! Usage accounting
//!
//! Counts proxied calls per server, keyed by the working directory the
//! router was launched from, and persists the counters as usage.json in
//! the state directory. The report answers "which servers does this
//! project actually use", which feeds pruning decisions.

use crate::error::SwitchboardResult;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct UsageFile {
    // project path -> server name -> call count
    #[serde(default)]
    projects: BTreeMap<String, BTreeMap<String, u64>>,
}

pub struct UsageLog {
    path: PathBuf,
    project: String,
    counts: Mutex<UsageFile>,
}

impl UsageLog {
    /// Load counters from `dir/usage.json`; missing or corrupt files start
    /// the log empty rather than failing.
    pub fn load(dir: &Path, project: impl Into<String>) -> Self {
        let path = dir.join("usage.json");
        let counts = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self {
            path,
            project: project.into(),
            counts: Mutex::new(counts),
        }
    }

    /// Count one proxied call and persist the updated counters
    pub fn record(&self, server: &str) {
        {
            let mut counts = self.counts.lock();
            *counts
                .projects
                .entry(self.project.clone())
                .or_default()
                .entry(server.to_string())
                .or_insert(0) += 1;
        }
        if let Err(e) = self.flush() {
            warn!("usage log write failed: {}", e);
        }
    }

    fn flush(&self) -> SwitchboardResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(&*self.counts.lock())?;
        std::fs::write(&self.path, contents)?;
        Ok(())
    }

    /// Counters for the current project, highest first
    pub fn report(&self) -> Vec<(String, u64)> {
        let counts = self.counts.lock();
        let mut entries: Vec<(String, u64)> = counts
            .projects
            .get(&self.project)
            .map(|servers| servers.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        entries
    }

    /// Counters across every project, highest first
    pub fn report_all(&self) -> Vec<(String, String, u64)> {
        let counts = self.counts.lock();
        let mut entries: Vec<(String, String, u64)> = counts
            .projects
            .iter()
            .flat_map(|(project, servers)| {
                servers
                    .iter()
                    .map(move |(server, count)| (project.clone(), server.clone(), *count))
            })
            .collect();
        entries.sort_by(|a, b| b.2.cmp(&a.2).then(a.1.cmp(&b.1)));
        entries
    }
}
