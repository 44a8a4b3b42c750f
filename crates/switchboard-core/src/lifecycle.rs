//! Server lifecycle
//!
//! Owns the table of running servers and the only paths in or out of it.
//! Starting a server means connect, handshake, list tools, index; stopping
//! means purge the index, close the transport, update the cache. At most
//! one live connection exists per server name, enforced with a starting
//! guard so concurrent starts cannot race past each other.

use crate::client::ServerConnection;
use crate::config::{ServerRegistry, TransportKind};
use crate::error::{SwitchboardError, SwitchboardResult};
use crate::index::{ServerCacheEntry, ToolCache, ToolIndex};
use crate::transport::{Diagnostics, TransportFactory};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// One live server: its connection plus the bookkeeping the reaper
/// and status operations need.
#[derive(Debug)]
pub struct RunningServer {
    pub connection: Arc<ServerConnection>,
    pub started_at: DateTime<Utc>,
    pub tool_count: usize,
    pub diagnostics: Diagnostics,
    last_activity: Mutex<Instant>,
}

impl RunningServer {
    /// Record activity so the idle reaper leaves this server alone
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }
}

/// Manages starts, stops, and the running-server table
pub struct Lifecycle {
    registry: Arc<RwLock<ServerRegistry>>,
    running: RwLock<HashMap<String, Arc<RunningServer>>>,
    starting: tokio::sync::Mutex<HashSet<String>>,
    start_notify: tokio::sync::Notify,
    index: Arc<ToolIndex>,
    factory: Arc<dyn TransportFactory>,
    cache: ToolCache,
}

impl Lifecycle {
    pub fn new(
        registry: Arc<RwLock<ServerRegistry>>,
        index: Arc<ToolIndex>,
        factory: Arc<dyn TransportFactory>,
        cache: ToolCache,
    ) -> Self {
        Self {
            registry,
            running: RwLock::new(HashMap::new()),
            starting: tokio::sync::Mutex::new(HashSet::new()),
            start_notify: tokio::sync::Notify::new(),
            index,
            factory,
            cache,
        }
    }

    pub fn registry(&self) -> &Arc<RwLock<ServerRegistry>> {
        &self.registry
    }

    pub fn index(&self) -> &Arc<ToolIndex> {
        &self.index
    }

    pub fn cache(&self) -> &ToolCache {
        &self.cache
    }

    pub async fn is_running(&self, name: &str) -> bool {
        self.running.read().await.contains_key(name)
    }

    pub async fn get_running(&self, name: &str) -> Option<Arc<RunningServer>> {
        self.running.read().await.get(name).cloned()
    }

    pub async fn running_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.running.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Start a server. Fails when the server is unknown, disabled, or
    /// already running.
    pub async fn start(&self, name: &str) -> SwitchboardResult<Arc<RunningServer>> {
        if self.is_running(name).await {
            debug!(server = %name, "start rejected, already running");
            return Err(SwitchboardError::already_running(name));
        }

        if !self.begin_start(name).await {
            return Err(SwitchboardError::startup(name, "start already in progress"));
        }
        self.start_guarded(name).await
    }

    /// Return the running server, starting it on demand. A start already
    /// in flight is awaited instead of failed, so concurrent callers share
    /// one connection.
    pub async fn ensure_running(&self, name: &str) -> SwitchboardResult<Arc<RunningServer>> {
        loop {
            // Register for the wakeup before re-checking state, so a start
            // finishing in between is not missed.
            let notified = self.start_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(existing) = self.get_running(name).await {
                return Ok(existing);
            }
            if self.begin_start(name).await {
                return self.start_guarded(name).await;
            }
            notified.await;
        }
    }

    async fn begin_start(&self, name: &str) -> bool {
        self.starting.lock().await.insert(name.to_string())
    }

    /// Runs with the starting guard held for `name`; releases it and wakes
    /// waiters on every exit path.
    async fn start_guarded(&self, name: &str) -> SwitchboardResult<Arc<RunningServer>> {
        let result = self.start_checked(name).await;
        self.starting.lock().await.remove(name);
        self.start_notify.notify_waiters();

        match result {
            Ok(running) => {
                self.refresh_server_cache(name).await;
                info!(
                    server = %name,
                    tools = running.tool_count,
                    ports = ?running.diagnostics.ports(),
                    "server started"
                );
                Ok(running)
            }
            Err(e) => {
                // No residue: a failed start leaves nothing in the table
                // and nothing in the index.
                self.index.purge_server(name);
                Err(e)
            }
        }
    }

    async fn start_checked(&self, name: &str) -> SwitchboardResult<Arc<RunningServer>> {
        let (config, timeout, grace) = {
            let registry = self.registry.read().await;
            let config = registry
                .get(name)
                .cloned()
                .ok_or_else(|| SwitchboardError::not_found(format!("unknown server '{}'", name)))?;
            (config, registry.timeout(name), registry.startup_grace(name))
        };

        if !config.enabled {
            return Err(SwitchboardError::disabled(name));
        }

        let running = Arc::new(self.start_inner(name, &config, timeout, grace).await?);
        self.running
            .write()
            .await
            .insert(name.to_string(), Arc::clone(&running));
        Ok(running)
    }

    async fn start_inner(
        &self,
        name: &str,
        config: &crate::config::ServerConfig,
        timeout: Duration,
        grace: Duration,
    ) -> SwitchboardResult<RunningServer> {
        let diagnostics = Diagnostics::new();
        let transport = self
            .factory
            .connect(name, config, diagnostics.clone())
            .await?;

        // Give a freshly spawned process a moment to come up before the
        // first request hits it.
        if config.transport == TransportKind::Stdio && !grace.is_zero() {
            tokio::time::sleep(grace).await;
        }

        let connection = match ServerConnection::handshake(name, transport, timeout).await {
            Ok(connection) => connection,
            Err(e) => {
                error!(server = %name, "handshake failed: {}", e);
                return Err(e);
            }
        };

        let tools = match connection.list_tools(timeout).await {
            Ok(tools) => tools,
            Err(e) => {
                connection.close().await;
                return Err(SwitchboardError::startup(
                    name,
                    format!("tools/list failed: {}", e),
                ));
            }
        };

        self.index.set_tools(name, &tools);

        Ok(RunningServer {
            connection: Arc::new(connection),
            started_at: Utc::now(),
            tool_count: tools.len(),
            diagnostics,
            last_activity: Mutex::new(Instant::now()),
        })
    }

    /// Stop a running server, purging its tools before the connection goes
    /// away so no call can route to a half-dead server.
    pub async fn stop(&self, name: &str) -> SwitchboardResult<()> {
        self.index.purge_server(name);

        let removed = self.running.write().await.remove(name);
        match removed {
            Some(running) => {
                running.connection.close().await;
                self.refresh_server_cache(name).await;
                info!(server = %name, "server stopped");
                Ok(())
            }
            None => Err(SwitchboardError::not_found(format!(
                "server '{}' is not running",
                name
            ))),
        }
    }

    pub async fn restart(&self, name: &str) -> SwitchboardResult<Arc<RunningServer>> {
        match self.stop(name).await {
            Ok(()) => {}
            Err(SwitchboardError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.start(name).await
    }

    pub async fn stop_all(&self) {
        let names = self.running_names().await;
        let results = futures::future::join_all(names.iter().map(|name| self.stop(name))).await;
        for (name, result) in names.iter().zip(results) {
            if let Err(e) = result {
                warn!(server = %name, "stop failed during shutdown: {}", e);
            }
        }
    }

    /// Start every enabled auto-start server, sequentially. One failure
    /// never blocks the rest.
    pub async fn autostart_at_boot(&self) {
        let names: Vec<String> = {
            let registry = self.registry.read().await;
            registry
                .iter()
                .filter(|(_, config)| config.enabled && config.auto_start)
                .map(|(name, _)| name.clone())
                .collect()
        };

        for name in &names {
            if let Err(e) = self.start(name).await {
                warn!(server = %name, "auto-start failed: {}", e);
            }
        }

        if let Err(e) = self.refresh_cache().await {
            warn!("cache refresh after boot failed: {}", e);
        }
    }

    /// Mark activity on a server so the reaper skips it this cycle
    pub async fn touch(&self, name: &str) {
        if let Some(running) = self.get_running(name).await {
            running.touch();
        }
    }

    /// One reaper pass. Stops servers idle past their deadline plus any
    /// whose transport has died underneath them. Returns the stopped names.
    pub async fn reap_idle(&self) -> Vec<String> {
        let candidates: Vec<(String, Arc<RunningServer>)> = {
            let running = self.running.read().await;
            running
                .iter()
                .map(|(name, server)| (name.clone(), Arc::clone(server)))
                .collect()
        };

        let mut stopped = Vec::new();
        for (name, server) in candidates {
            let dead = !server.connection.is_alive();
            let (idle_timeout, exempt) = {
                let registry = self.registry.read().await;
                (registry.idle_timeout(&name), registry.is_idle_exempt(&name))
            };

            if dead {
                info!(server = %name, "transport died, cleaning up");
            } else if exempt || server.idle_for() < idle_timeout {
                continue;
            } else {
                info!(
                    server = %name,
                    idle_secs = server.idle_for().as_secs(),
                    "idle past deadline, stopping"
                );
            }

            if let Err(e) = self.stop(&name).await {
                warn!(server = %name, "reap stop failed: {}", e);
            } else {
                stopped.push(name);
            }
        }
        stopped
    }

    /// Rewrite one server's cache entry from live state
    pub async fn refresh_server_cache(&self, name: &str) {
        let registry = self.registry.read().await;
        let Some(config) = registry.get(name) else {
            return;
        };
        let running = self.running.read().await.contains_key(name);
        let tools = if running {
            self.index.tools_for(name)
        } else {
            // Keep the last known tool list so list-tools can answer for
            // stopped servers.
            self.cache
                .read_server(name)
                .map(|entry| entry.tools)
                .unwrap_or_default()
        };

        let entry = ServerCacheEntry {
            description: if config.description.is_empty() {
                None
            } else {
                Some(config.description.clone())
            },
            enabled: config.enabled,
            running,
            tools,
            updated_at: Utc::now(),
        };
        if let Err(e) = self.cache.write_server(name, &entry) {
            warn!(server = %name, "cache write failed: {}", e);
        }
    }

    /// Rewrite the whole cache snapshot from registry plus live state
    pub async fn refresh_cache(&self) -> SwitchboardResult<()> {
        let names: Vec<String> = {
            let registry = self.registry.read().await;
            registry.names().cloned().collect()
        };
        for name in &names {
            self.refresh_server_cache(name).await;
        }

        // Drop cache entries for servers no longer in the registry.
        let snapshot = self.cache.load_snapshot();
        for stale in snapshot.servers.keys() {
            if !names.contains(stale) {
                self.cache.remove_server(stale)?;
            }
        }
        Ok(())
    }
}
