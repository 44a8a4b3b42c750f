//! Idle reaper
//!
//! Periodically sweeps the running-server table and stops servers that
//! have been idle past their deadline. The sweep itself lives on
//! `Lifecycle::reap_idle`; this is just the clock around it.

use crate::lifecycle::Lifecycle;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Default sweep interval
pub const DEFAULT_TICK: Duration = Duration::from_secs(60);

pub struct IdleReaper {
    lifecycle: Arc<Lifecycle>,
    tick: Duration,
}

impl IdleReaper {
    pub fn new(lifecycle: Arc<Lifecycle>) -> Self {
        Self {
            lifecycle,
            tick: DEFAULT_TICK,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Run the sweep loop until the task is aborted
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.tick);
            // The first tick fires immediately; skip it so a fresh boot
            // does not sweep before anything has had a chance to idle.
            interval.tick().await;
            loop {
                interval.tick().await;
                let stopped = self.lifecycle.reap_idle().await;
                if !stopped.is_empty() {
                    debug!(?stopped, "reaper pass complete");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerConfig, ServerRegistry};
    use crate::index::{ToolCache, ToolIndex};
    use crate::protocol::methods;
    use crate::transport::testing::{ScriptedFactory, ScriptedTransport};
    use serde_json::json;
    use tokio::sync::RwLock;

    #[tokio::test(start_paused = true)]
    async fn test_reaper_loop_stops_idle_server() {
        let dir = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new()
            .respond(
                methods::INITIALIZE,
                json!({"capabilities": {}, "serverInfo": {"name": "s", "version": "0"}}),
            )
            .respond(methods::TOOLS_LIST, json!({"tools": []}));

        let mut registry = ServerRegistry::load(dir.path().join("servers.yaml")).unwrap();
        let mut config = ServerConfig::stdio("srv", vec![]);
        config.startup_grace_ms = Some(0);
        config.idle_timeout_secs = Some(5);
        registry.insert("sleepy", config).unwrap();

        let lifecycle = Arc::new(Lifecycle::new(
            Arc::new(RwLock::new(registry)),
            Arc::new(ToolIndex::new()),
            Arc::new(ScriptedFactory::new().with("sleepy", transport)),
            ToolCache::new(dir.path().join("state")),
        ));

        lifecycle.start("sleepy").await.unwrap();

        let handle = IdleReaper::new(Arc::clone(&lifecycle))
            .with_tick(Duration::from_secs(10))
            .spawn();

        // Past the idle deadline and past one reaper tick.
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(!lifecycle.is_running("sleepy").await);

        handle.abort();
    }
}
