//! Tool index and cache
//!
//! The in-memory index maps tool names to their owning server so calls can
//! be routed without a server prefix. The on-disk cache persists the last
//! known tool lists under the state directory so `list-tools` and `search`
//! can answer for servers that are not currently running.

use crate::error::{SwitchboardError, SwitchboardResult};
use crate::protocol::ToolDefinition;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A tool together with the server that owns it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub server: String,
}

#[derive(Default)]
struct IndexInner {
    // tool name -> owning server; collisions resolve to the most recent
    by_tool: HashMap<String, String>,
    by_server: HashMap<String, Vec<ToolDescriptor>>,
}

/// Live tool-to-server routing table
#[derive(Default)]
pub struct ToolIndex {
    inner: RwLock<IndexInner>,
}

impl ToolIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a server's tool set
    pub fn set_tools(&self, server: &str, tools: &[ToolDefinition]) {
        let descriptors: Vec<ToolDescriptor> = tools
            .iter()
            .map(|t| ToolDescriptor {
                name: t.name.clone(),
                description: t.description.clone(),
                server: server.to_string(),
            })
            .collect();

        let mut inner = self.inner.write();
        if let Some(old) = inner.by_server.remove(server) {
            for descriptor in &old {
                if inner.by_tool.get(&descriptor.name).map(String::as_str) == Some(server) {
                    inner.by_tool.remove(&descriptor.name);
                }
            }
        }
        for descriptor in &descriptors {
            if let Some(previous) = inner
                .by_tool
                .insert(descriptor.name.clone(), server.to_string())
            {
                if previous != server {
                    debug!(
                        tool = %descriptor.name,
                        old = %previous,
                        new = %server,
                        "tool name collision, newest owner wins"
                    );
                }
            }
        }
        inner.by_server.insert(server.to_string(), descriptors);
    }

    /// Drop a server's tools from the routing table
    pub fn purge_server(&self, server: &str) {
        let mut inner = self.inner.write();
        if let Some(old) = inner.by_server.remove(server) {
            for descriptor in &old {
                if inner.by_tool.get(&descriptor.name).map(String::as_str) == Some(server) {
                    inner.by_tool.remove(&descriptor.name);
                }
            }
        }
    }

    /// Which running server owns this tool, if any
    pub fn owner_of(&self, tool: &str) -> Option<String> {
        self.inner.read().by_tool.get(tool).cloned()
    }

    pub fn tools_for(&self, server: &str) -> Vec<ToolDescriptor> {
        self.inner
            .read()
            .by_server
            .get(server)
            .cloned()
            .unwrap_or_default()
    }

    pub fn all(&self) -> Vec<ToolDescriptor> {
        let inner = self.inner.read();
        let mut tools: Vec<ToolDescriptor> =
            inner.by_server.values().flatten().cloned().collect();
        tools.sort_by(|a, b| a.server.cmp(&b.server).then(a.name.cmp(&b.name)));
        tools
    }

    pub fn tool_count(&self) -> usize {
        self.inner.read().by_tool.len()
    }
}

/// Cached metadata for one server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerCacheEntry {
    #[serde(default)]
    pub description: Option<String>,
    pub enabled: bool,
    pub running: bool,
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
    pub updated_at: DateTime<Utc>,
}

/// Snapshot of every known server, written as tools-cache.json
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheSnapshot {
    #[serde(default)]
    pub servers: HashMap<String, ServerCacheEntry>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// On-disk cache rooted at the state directory
#[derive(Clone)]
pub struct ToolCache {
    dir: PathBuf,
}

impl ToolCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join("tools-cache.json")
    }

    fn server_path(&self, server: &str) -> PathBuf {
        self.dir.join("servers").join(format!("{}.json", server))
    }

    /// Load the snapshot; a missing or unreadable file is an empty cache
    pub fn load_snapshot(&self) -> CacheSnapshot {
        let path = self.snapshot_path();
        match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(path = %path.display(), "discarding corrupt cache: {}", e);
                    CacheSnapshot::default()
                }
            },
            Err(_) => CacheSnapshot::default(),
        }
    }

    pub fn write_snapshot(&self, snapshot: &CacheSnapshot) -> SwitchboardResult<()> {
        std::fs::create_dir_all(&self.dir)?;
        let contents = serde_json::to_string_pretty(snapshot)?;
        std::fs::write(self.snapshot_path(), contents)?;
        Ok(())
    }

    /// Persist one server's entry and fold it into the snapshot
    pub fn write_server(&self, server: &str, entry: &ServerCacheEntry) -> SwitchboardResult<()> {
        let path = self.server_path(server);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(entry)?)?;

        let mut snapshot = self.load_snapshot();
        snapshot.servers.insert(server.to_string(), entry.clone());
        snapshot.updated_at = Some(Utc::now());
        self.write_snapshot(&snapshot)
    }

    pub fn read_server(&self, server: &str) -> Option<ServerCacheEntry> {
        let contents = std::fs::read_to_string(self.server_path(server)).ok()?;
        serde_json::from_str(&contents).ok()
    }

    pub fn remove_server(&self, server: &str) -> SwitchboardResult<()> {
        let path = self.server_path(server);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let mut snapshot = self.load_snapshot();
        if snapshot.servers.remove(server).is_some() {
            snapshot.updated_at = Some(Utc::now());
            self.write_snapshot(&snapshot)?;
        }
        Ok(())
    }

    /// Directory for intercepted binary payloads
    pub fn payload_dir(&self) -> SwitchboardResult<PathBuf> {
        let dir = self.dir.join("payloads");
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

/// Resolve the state directory, honoring an explicit override
pub fn state_dir(override_path: Option<&Path>) -> SwitchboardResult<PathBuf> {
    if let Some(path) = override_path {
        return Ok(path.to_path_buf());
    }
    let home = dirs::home_dir()
        .ok_or_else(|| SwitchboardError::config("cannot determine home directory"))?;
    Ok(home.join(".switchboard"))
}
