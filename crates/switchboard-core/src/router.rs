//! Operation router
//!
//! The single entry point for everything the outside world can ask of the
//! router: a closed set of operations, each answered with plain text.
//! Every internal error is converted to readable text at this boundary;
//! callers never see a panic or a raw error type.

use crate::config::{HooksConfig, ServerConfig, ServerRegistry};
use crate::discover;
use crate::error::SwitchboardResult;
use crate::hooks::HookEngine;
use crate::lifecycle::Lifecycle;
use crate::proxy::CallProxy;
use crate::usage::UsageLog;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{info, warn};

/// Everything the router can be asked to do
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Operation {
    ListServers,
    Search {
        query: String,
        #[serde(default)]
        auto_start: bool,
    },
    Describe {
        server: String,
    },
    ListTools {
        #[serde(default)]
        server: Option<String>,
    },
    Status,
    Help,
    Call {
        #[serde(default)]
        server: Option<String>,
        tool: String,
        #[serde(default)]
        arguments: Value,
    },
    Start {
        server: String,
    },
    Stop {
        server: String,
    },
    Restart {
        server: String,
    },
    Enable {
        server: String,
    },
    Disable {
        server: String,
    },
    Register {
        server: String,
        config: ServerConfig,
    },
    Unregister {
        server: String,
    },
    Reload,
    Discover {
        path: PathBuf,
    },
    Usage,
    Memory,
}

/// Text answer to one operation
#[derive(Debug, Clone)]
pub struct OperationOutcome {
    pub text: String,
}

impl OperationOutcome {
    fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

pub struct Router {
    lifecycle: Arc<Lifecycle>,
    proxy: Arc<CallProxy>,
    hooks: Arc<HookEngine>,
    usage: Arc<UsageLog>,
    hooks_path: PathBuf,
}

impl Router {
    pub fn new(
        lifecycle: Arc<Lifecycle>,
        proxy: Arc<CallProxy>,
        hooks: Arc<HookEngine>,
        usage: Arc<UsageLog>,
        hooks_path: PathBuf,
    ) -> Self {
        Self {
            lifecycle,
            proxy,
            hooks,
            usage,
            hooks_path,
        }
    }

    /// Parse and dispatch a raw operation envelope. Unknown or malformed
    /// operations come back as text, never as an error.
    pub async fn dispatch_value(&self, value: Value) -> OperationOutcome {
        match serde_json::from_value::<Operation>(value) {
            Ok(op) => self.dispatch(op).await,
            Err(e) => OperationOutcome::new(format!(
                "unknown operation: {}. Use {{\"op\": \"help\"}} for the operation list.",
                e
            )),
        }
    }

    pub async fn dispatch(&self, op: Operation) -> OperationOutcome {
        let result = match op {
            Operation::ListServers => self.list_servers().await,
            Operation::Search { query, auto_start } => self.search(&query, auto_start).await,
            Operation::Describe { server } => self.describe(&server).await,
            Operation::ListTools { server } => self.list_tools(server.as_deref()).await,
            Operation::Status => self.status().await,
            Operation::Help => Ok(help_text()),
            Operation::Call {
                server,
                tool,
                arguments,
            } => self.proxy.call(server.as_deref(), &tool, arguments).await,
            Operation::Start { server } => self.start(&server).await,
            Operation::Stop { server } => self
                .lifecycle
                .stop(&server)
                .await
                .map(|()| format!("server '{}' stopped", server)),
            Operation::Restart { server } => self
                .lifecycle
                .restart(&server)
                .await
                .map(|running| format!("server '{}' restarted ({} tools)", server, running.tool_count)),
            Operation::Enable { server } => self.set_enabled(&server, true).await,
            Operation::Disable { server } => self.set_enabled(&server, false).await,
            Operation::Register { server, config } => self.register(&server, config).await,
            Operation::Unregister { server } => self.unregister(&server).await,
            Operation::Reload => self.reload().await,
            Operation::Discover { path } => self.discover(&path),
            Operation::Usage => Ok(self.usage_report()),
            Operation::Memory => self.memory().await,
        };

        match result {
            Ok(text) => OperationOutcome::new(text),
            Err(e) => OperationOutcome::new(format!("error: {}", e)),
        }
    }

    async fn list_servers(&self) -> SwitchboardResult<String> {
        let registry = self.lifecycle.registry().read().await;
        if registry.is_empty() {
            return Ok("no servers registered".to_string());
        }

        let mut lines = Vec::new();
        for (name, config) in registry.iter() {
            let state = if self.lifecycle.is_running(name).await {
                "running"
            } else if !config.enabled {
                "disabled"
            } else {
                "stopped"
            };
            let tools = self.known_tools(name).await.len();
            let mut line = format!("{:<20} {:<9} {} tools", name, state, tools);
            if !config.description.is_empty() {
                line.push_str(&format!("  {}", config.description));
            }
            lines.push(line);
        }
        Ok(lines.join("\n"))
    }

    /// Substring search over names, descriptions, and tool names
    async fn search(&self, query: &str, auto_start: bool) -> SwitchboardResult<String> {
        let needle = query.to_lowercase();
        let entries: Vec<(String, ServerConfig)> = {
            let registry = self.lifecycle.registry().read().await;
            registry
                .iter()
                .map(|(name, config)| (name.clone(), config.clone()))
                .collect()
        };

        let mut lines = Vec::new();
        let mut matched = Vec::new();
        for (name, config) in entries {
            let tools = self.known_tools(&name).await;
            let tool_hits: Vec<&str> = tools
                .iter()
                .filter(|t| {
                    t.name.to_lowercase().contains(&needle)
                        || t.description
                            .as_deref()
                            .is_some_and(|d| d.to_lowercase().contains(&needle))
                })
                .map(|t| t.name.as_str())
                .collect();

            let server_hit = name.to_lowercase().contains(&needle)
                || config.description.to_lowercase().contains(&needle);
            if !server_hit && tool_hits.is_empty() {
                continue;
            }

            let mut line = format!("{}: {}", name, config.description);
            if !tool_hits.is_empty() {
                line.push_str(&format!(" [tools: {}]", tool_hits.join(", ")));
            }
            lines.push(line);
            if config.enabled {
                matched.push(name);
            }
        }

        if lines.is_empty() {
            return Ok(format!("no matches for '{}'", query));
        }

        if auto_start {
            for name in matched {
                if self.lifecycle.is_running(&name).await {
                    lines.push(format!("'{}' already running", name));
                    continue;
                }
                match self.lifecycle.start(&name).await {
                    Ok(_) => lines.push(format!("started '{}'", name)),
                    Err(e) => lines.push(format!("could not start '{}': {}", name, e)),
                }
            }
        }
        Ok(lines.join("\n"))
    }

    async fn describe(&self, server: &str) -> SwitchboardResult<String> {
        let config = {
            let registry = self.lifecycle.registry().read().await;
            registry.get(server).cloned().ok_or_else(|| {
                crate::error::SwitchboardError::not_found(format!("unknown server '{}'", server))
            })?
        };

        let mut lines = vec![format!("server: {}", server)];
        if !config.description.is_empty() {
            lines.push(format!("description: {}", config.description));
        }
        lines.push(format!("transport: {:?}", config.transport).to_lowercase());
        if let Some(command) = &config.command {
            lines.push(format!("command: {} {}", command, config.args.join(" ")));
        }
        if let Some(url) = &config.url {
            lines.push(format!("url: {}", url));
        }
        lines.push(format!("enabled: {}", config.enabled));
        lines.push(format!("auto_start: {}", config.auto_start));
        if !config.tags.is_empty() {
            lines.push(format!("tags: {}", config.tags.join(", ")));
        }

        match self.lifecycle.get_running(server).await {
            Some(running) => {
                lines.push("state: running".to_string());
                let uptime = Utc::now().signed_duration_since(running.started_at);
                lines.push(format!("uptime: {}s", uptime.num_seconds().max(0)));
                lines.push(format!("idle: {}s", running.idle_for().as_secs()));
                if let Some(pid) = running.connection.pid() {
                    lines.push(format!("pid: {}", pid));
                }
                let ports = running.diagnostics.ports();
                if !ports.is_empty() {
                    lines.push(format!(
                        "ports: {}",
                        ports.iter().map(u16::to_string).collect::<Vec<_>>().join(", ")
                    ));
                }
            }
            None => lines.push("state: stopped".to_string()),
        }

        let tools = self.known_tools(server).await;
        if tools.is_empty() {
            lines.push("tools: none known".to_string());
        } else {
            lines.push(format!("tools ({}):", tools.len()));
            for tool in tools {
                match tool.description {
                    Some(description) if !description.is_empty() => {
                        lines.push(format!("  {} - {}", tool.name, description))
                    }
                    _ => lines.push(format!("  {}", tool.name)),
                }
            }
        }
        Ok(lines.join("\n"))
    }

    async fn list_tools(&self, server: Option<&str>) -> SwitchboardResult<String> {
        let names: Vec<String> = match server {
            Some(name) => {
                let registry = self.lifecycle.registry().read().await;
                if !registry.contains(name) {
                    return Err(crate::error::SwitchboardError::not_found(format!(
                        "unknown server '{}'",
                        name
                    )));
                }
                vec![name.to_string()]
            }
            None => {
                let registry = self.lifecycle.registry().read().await;
                registry.names().cloned().collect()
            }
        };

        let mut lines = Vec::new();
        for name in names {
            for tool in self.known_tools(&name).await {
                match tool.description {
                    Some(description) if !description.is_empty() => {
                        lines.push(format!("{}:{} - {}", name, tool.name, description))
                    }
                    _ => lines.push(format!("{}:{}", name, tool.name)),
                }
            }
        }
        if lines.is_empty() {
            return Ok("no tools known; start a server or run reload".to_string());
        }
        Ok(lines.join("\n"))
    }

    async fn status(&self) -> SwitchboardResult<String> {
        let running = self.lifecycle.running_names().await;
        let total = self.lifecycle.registry().read().await.len();

        let mut lines = vec![format!(
            "{} of {} servers running, {} tools indexed",
            running.len(),
            total,
            self.lifecycle.index().tool_count()
        )];
        for name in running {
            if let Some(server) = self.lifecycle.get_running(&name).await {
                let uptime = Utc::now().signed_duration_since(server.started_at);
                lines.push(format!(
                    "  {} up {}s, idle {}s, {} tools",
                    name,
                    uptime.num_seconds().max(0),
                    server.idle_for().as_secs(),
                    server.tool_count
                ));
            }
        }
        Ok(lines.join("\n"))
    }

    async fn start(&self, server: &str) -> SwitchboardResult<String> {
        if self.lifecycle.is_running(server).await {
            return Ok(format!("server '{}' is already running", server));
        }
        let running = self.lifecycle.start(server).await?;
        Ok(format!(
            "server '{}' started ({} tools)",
            server, running.tool_count
        ))
    }

    async fn set_enabled(&self, server: &str, enabled: bool) -> SwitchboardResult<String> {
        let message = {
            let mut registry = self.lifecycle.registry().write().await;
            let message = registry.set_enabled(server, enabled)?;
            registry.save()?;
            message
        };
        self.lifecycle.refresh_server_cache(server).await;
        Ok(message)
    }

    async fn register(&self, server: &str, config: ServerConfig) -> SwitchboardResult<String> {
        {
            let mut registry = self.lifecycle.registry().write().await;
            registry.insert(server, config)?;
            registry.save()?;
        }
        self.lifecycle.refresh_server_cache(server).await;
        info!(server = %server, "server registered");
        Ok(format!("server '{}' registered", server))
    }

    async fn unregister(&self, server: &str) -> SwitchboardResult<String> {
        if self.lifecycle.is_running(server).await {
            self.lifecycle.stop(server).await?;
        }

        let removed = {
            let mut registry = self.lifecycle.registry().write().await;
            let removed = registry.remove(server);
            if removed.is_some() {
                registry.save()?;
            }
            removed
        };

        match removed {
            Some(_) => {
                self.lifecycle.cache().remove_server(server)?;
                info!(server = %server, "server unregistered");
                Ok(format!("server '{}' unregistered", server))
            }
            None => Err(crate::error::SwitchboardError::not_found(format!(
                "unknown server '{}'",
                server
            ))),
        }
    }

    /// Re-read configuration from disk. Running servers are left alone
    /// even when their registry entry changed or disappeared.
    async fn reload(&self) -> SwitchboardResult<String> {
        let path = {
            let registry = self.lifecycle.registry().read().await;
            registry.path().to_path_buf()
        };
        let fresh = ServerRegistry::load(&path)?;
        let count = fresh.len();
        *self.lifecycle.registry().write().await = fresh;

        let hooks = HooksConfig::load(&self.hooks_path)?;
        let hook_count = hooks.hooks.len();
        self.hooks.reload(hooks);
        self.proxy.reload_scope();

        if let Err(e) = self.lifecycle.refresh_cache().await {
            warn!("cache refresh after reload failed: {}", e);
        }
        Ok(format!(
            "reloaded: {} servers, {} hook rules",
            count, hook_count
        ))
    }

    fn discover(&self, path: &std::path::Path) -> SwitchboardResult<String> {
        let candidates = discover::scan(path)?;
        if candidates.is_empty() {
            return Ok(format!("no server candidates under {}", path.display()));
        }
        let lines: Vec<String> = candidates
            .iter()
            .map(|c| format!("{} ({}, {})", c.name, c.path.display(), c.manifest))
            .collect();
        Ok(lines.join("\n"))
    }

    fn usage_report(&self) -> String {
        let mut lines = Vec::new();
        let current = self.usage.report();
        if current.is_empty() {
            lines.push("no calls recorded for this project".to_string());
        } else {
            for (server, count) in current {
                lines.push(format!("{:<20} {} calls", server, count));
            }
        }

        let all = self.usage.report_all();
        if !all.is_empty() {
            lines.push("all projects:".to_string());
            for (project, server, count) in all {
                lines.push(format!("  {:<20} {} calls ({})", server, count, project));
            }
        }
        lines.join("\n")
    }

    async fn memory(&self) -> SwitchboardResult<String> {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);

        let mut lines = Vec::new();
        let own = std::process::id();
        if let Some(process) = system.process(Pid::from_u32(own)) {
            lines.push(format!(
                "router: {:.1} MiB",
                process.memory() as f64 / (1024.0 * 1024.0)
            ));
        }

        for name in self.lifecycle.running_names().await {
            let Some(server) = self.lifecycle.get_running(&name).await else {
                continue;
            };
            match server.connection.pid() {
                Some(pid) => match system.process(Pid::from_u32(pid)) {
                    Some(process) => lines.push(format!(
                        "{}: {:.1} MiB (pid {})",
                        name,
                        process.memory() as f64 / (1024.0 * 1024.0),
                        pid
                    )),
                    None => lines.push(format!("{}: pid {} not found", name, pid)),
                },
                None => lines.push(format!("{}: remote, no local process", name)),
            }
        }
        Ok(lines.join("\n"))
    }

    /// Tools for a server: live index when running, cache otherwise
    async fn known_tools(&self, server: &str) -> Vec<crate::index::ToolDescriptor> {
        if self.lifecycle.is_running(server).await {
            self.lifecycle.index().tools_for(server)
        } else {
            self.lifecycle
                .cache()
                .read_server(server)
                .map(|entry| entry.tools)
                .unwrap_or_default()
        }
    }
}

fn help_text() -> String {
    [
        "operations:",
        "  list-servers                      registered servers and their state",
        "  search {query, auto_start?}       match names, descriptions, tools",
        "  describe {server}                 full detail on one server",
        "  list-tools {server?}              known tools, live or cached",
        "  status                            running servers and totals",
        "  call {server?, tool, arguments}   proxy one tool call",
        "  start|stop|restart {server}       lifecycle control",
        "  enable|disable {server}           toggle availability",
        "  register {server, config}         add a server to the registry",
        "  unregister {server}               stop and remove a server",
        "  reload                            re-read servers.yaml and hooks.yaml",
        "  discover {path}                   scan a directory for candidates",
        "  usage                             call counters, this project and all",
        "  memory                            process memory per server",
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{ToolCache, ToolIndex};
    use crate::protocol::methods;
    use crate::transport::testing::{ScriptedFactory, ScriptedTransport};
    use serde_json::json;
    use tokio::sync::RwLock;

    fn handshaken(tools: &[&str]) -> ScriptedTransport {
        let list: Vec<_> = tools
            .iter()
            .map(|name| json!({"name": name, "description": format!("{} things", name), "inputSchema": {}}))
            .collect();
        ScriptedTransport::new()
            .respond(
                methods::INITIALIZE,
                json!({"capabilities": {}, "serverInfo": {"name": "s", "version": "0"}}),
            )
            .respond(methods::TOOLS_LIST, json!({"tools": list}))
    }

    fn fast_stdio() -> ServerConfig {
        let mut config = ServerConfig::stdio("srv", vec![]);
        config.startup_grace_ms = Some(0);
        config
    }

    fn router_at(dir: &std::path::Path, factory: ScriptedFactory) -> Router {
        let registry = ServerRegistry::load(dir.join("servers.yaml")).unwrap();
        let lifecycle = Arc::new(Lifecycle::new(
            Arc::new(RwLock::new(registry)),
            Arc::new(ToolIndex::new()),
            Arc::new(factory),
            ToolCache::new(dir.join("state")),
        ));
        let hooks = Arc::new(HookEngine::new(
            HooksConfig::default(),
            Arc::clone(&lifecycle),
        ));
        let usage = Arc::new(UsageLog::load(&dir.join("state"), "/test/project"));
        let proxy = Arc::new(CallProxy::new(
            Arc::clone(&lifecycle),
            Arc::clone(&hooks),
            Arc::clone(&usage),
        ));
        Router::new(lifecycle, proxy, hooks, usage, dir.join("hooks.yaml"))
    }

    async fn register(router: &Router, name: &str, config: ServerConfig) {
        let mut registry = router.lifecycle.registry().write().await;
        registry.insert(name, config).unwrap();
        registry.save().unwrap();
    }

    #[tokio::test]
    async fn test_unknown_operation_is_text() {
        let dir = tempfile::tempdir().unwrap();
        let router = router_at(dir.path(), ScriptedFactory::new());

        let outcome = router.dispatch_value(json!({"op": "frobnicate"})).await;
        assert!(outcome.text.contains("unknown operation"));
    }

    #[tokio::test]
    async fn test_list_and_describe() {
        let dir = tempfile::tempdir().unwrap();
        let router = router_at(
            dir.path(),
            ScriptedFactory::new().with("files", handshaken(&["read", "write"])),
        );
        register(
            &router,
            "files",
            fast_stdio().with_description("file operations"),
        )
        .await;

        let outcome = router.dispatch(Operation::Start { server: "files".into() }).await;
        assert!(outcome.text.contains("2 tools"));

        let outcome = router.dispatch(Operation::ListServers).await;
        assert!(outcome.text.contains("files"));
        assert!(outcome.text.contains("running"));

        let outcome = router
            .dispatch(Operation::Describe { server: "files".into() })
            .await;
        assert!(outcome.text.contains("state: running"));
        assert!(outcome.text.contains("read - read things"));
    }

    #[tokio::test]
    async fn test_start_already_running_is_informative() {
        let dir = tempfile::tempdir().unwrap();
        let router = router_at(
            dir.path(),
            ScriptedFactory::new().with("s", handshaken(&["t"])),
        );
        register(&router, "s", fast_stdio()).await;

        router.dispatch(Operation::Start { server: "s".into() }).await;
        let outcome = router.dispatch(Operation::Start { server: "s".into() }).await;
        assert!(outcome.text.contains("already running"));
    }

    #[tokio::test]
    async fn test_errors_become_text() {
        let dir = tempfile::tempdir().unwrap();
        let router = router_at(dir.path(), ScriptedFactory::new());

        let outcome = router
            .dispatch(Operation::Stop { server: "ghost".into() })
            .await;
        assert!(outcome.text.starts_with("error:"));
        assert!(outcome.text.contains("ghost"));
    }

    #[tokio::test]
    async fn test_search_matches_tools_and_descriptions() {
        let dir = tempfile::tempdir().unwrap();
        let router = router_at(
            dir.path(),
            ScriptedFactory::new().with("files", handshaken(&["read_file"])),
        );
        register(
            &router,
            "files",
            fast_stdio().with_description("filesystem access"),
        )
        .await;
        router.dispatch(Operation::Start { server: "files".into() }).await;

        let outcome = router
            .dispatch(Operation::Search {
                query: "read".into(),
                auto_start: false,
            })
            .await;
        assert!(outcome.text.contains("read_file"));

        let outcome = router
            .dispatch(Operation::Search {
                query: "nomatch".into(),
                auto_start: false,
            })
            .await;
        assert!(outcome.text.contains("no matches"));
    }

    #[tokio::test]
    async fn test_search_auto_start_reports_running_servers_as_such() {
        let dir = tempfile::tempdir().unwrap();
        let router = router_at(
            dir.path(),
            ScriptedFactory::new().with("files", handshaken(&["read_file"])),
        );
        register(&router, "files", fast_stdio()).await;
        router.dispatch(Operation::Start { server: "files".into() }).await;

        let outcome = router
            .dispatch(Operation::Search {
                query: "files".into(),
                auto_start: true,
            })
            .await;
        assert!(outcome.text.contains("'files' already running"));
        assert!(!outcome.text.contains("started 'files'"));
    }

    #[tokio::test]
    async fn test_register_unregister_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let router = router_at(dir.path(), ScriptedFactory::new());

        let outcome = router
            .dispatch(Operation::Register {
                server: "new".into(),
                config: fast_stdio(),
            })
            .await;
        assert!(outcome.text.contains("registered"));
        assert!(router.lifecycle.registry().read().await.contains("new"));

        let outcome = router
            .dispatch(Operation::Unregister { server: "new".into() })
            .await;
        assert!(outcome.text.contains("unregistered"));
        assert!(!router.lifecycle.registry().read().await.contains("new"));
    }

    #[tokio::test]
    async fn test_reload_keeps_running_servers() {
        let dir = tempfile::tempdir().unwrap();
        let router = router_at(
            dir.path(),
            ScriptedFactory::new().with("keep", handshaken(&["t"])),
        );
        register(&router, "keep", fast_stdio()).await;
        router.dispatch(Operation::Start { server: "keep".into() }).await;

        // Rewrite the registry behind the router's back: 'keep' is now
        // disabled and 'other' appears.
        {
            let mut registry = router.lifecycle.registry().write().await;
            registry.set_enabled("keep", false).unwrap();
            registry.insert("other", fast_stdio()).unwrap();
            registry.save().unwrap();
            // Undo in memory so reload is what picks the changes up.
            registry.set_enabled("keep", true).unwrap();
            let _ = registry.remove("other");
        }

        let outcome = router.dispatch(Operation::Reload).await;
        assert!(outcome.text.contains("2 servers"));
        assert!(router.lifecycle.is_running("keep").await);
        assert!(!router
            .lifecycle
            .registry()
            .read()
            .await
            .get("keep")
            .unwrap()
            .enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_call_then_idle_out() {
        let dir = tempfile::tempdir().unwrap();
        let transport = handshaken(&["echo"]).respond(
            methods::TOOLS_CALL,
            json!({"content": [{"type": "text", "text": "hi"}], "isError": false}),
        );
        let router = router_at(dir.path(), ScriptedFactory::new().with("echo", transport));
        let mut config = fast_stdio();
        config.idle_timeout_secs = Some(1);
        register(&router, "echo", config).await;

        // Not running yet; the call starts it implicitly.
        let outcome = router
            .dispatch(Operation::Call {
                server: Some("echo".into()),
                tool: "echo".into(),
                arguments: json!({}),
            })
            .await;
        assert_eq!(outcome.text, "hi");
        assert!(router.lifecycle.is_running("echo").await);

        // Wait past the idle deadline and sweep.
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        router.lifecycle.reap_idle().await;
        assert!(!router.lifecycle.is_running("echo").await);
    }

    #[tokio::test]
    async fn test_usage_and_help() {
        let dir = tempfile::tempdir().unwrap();
        let router = router_at(dir.path(), ScriptedFactory::new());

        let outcome = router.dispatch(Operation::Usage).await;
        assert!(outcome.text.contains("no calls recorded"));

        let outcome = router.dispatch(Operation::Help).await;
        assert!(outcome.text.contains("list-servers"));
        assert!(outcome.text.contains("reload"));
    }

    #[tokio::test]
    async fn test_usage_includes_other_projects() {
        let dir = tempfile::tempdir().unwrap();
        // Counters written under a different project directory.
        {
            let other = UsageLog::load(&dir.path().join("state"), "/other/project");
            other.record("files");
        }
        let router = router_at(dir.path(), ScriptedFactory::new());

        let outcome = router.dispatch(Operation::Usage).await;
        assert!(outcome.text.contains("no calls recorded for this project"));
        assert!(outcome.text.contains("all projects:"));
        assert!(outcome.text.contains("/other/project"));
        assert!(outcome.text.contains("files"));
    }
}
