//! Call proxy
//!
//! The single path every proxied tool call takes: resolve the owning
//! server, enforce the permission scope, start the server on demand,
//! invoke the tool, then post-process the result. Post-processing
//! intercepts oversized and binary payloads to disk, applies the
//! per-server bounded retry, records usage, and hands the finished call
//! to the hook engine.

use crate::error::{SwitchboardError, SwitchboardResult};
use crate::hooks::{HookEngine, HookInvocation};
use crate::lifecycle::{Lifecycle, RunningServer};
use crate::protocol::{ToolCallResult, ToolContent};
use crate::usage::UsageLog;
use base64::Engine as _;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Environment variable carrying the comma-separated server allow-list
pub const SCOPE_ENV: &str = "SWITCHBOARD_SCOPE";

/// Text payloads above this many bytes are written to disk instead of
/// being returned inline.
pub const INTERCEPT_THRESHOLD: usize = 64 * 1024;

const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Upper bound on retained payload files; older ones are deleted as new
/// payloads arrive.
const PAYLOAD_KEEP: usize = 200;

pub struct CallProxy {
    lifecycle: Arc<Lifecycle>,
    hooks: Arc<HookEngine>,
    usage: Arc<UsageLog>,
    scope: RwLock<Option<HashSet<String>>>,
}

impl CallProxy {
    pub fn new(lifecycle: Arc<Lifecycle>, hooks: Arc<HookEngine>, usage: Arc<UsageLog>) -> Self {
        Self {
            lifecycle,
            hooks,
            usage,
            scope: RwLock::new(scope_from_env()),
        }
    }

    #[cfg(test)]
    fn with_scope(self, servers: &[&str]) -> Self {
        *self.scope.write() = Some(servers.iter().map(|s| s.to_string()).collect());
        self
    }

    /// Re-read the scope allow-list from the environment
    pub fn reload_scope(&self) {
        let fresh = scope_from_env();
        let mut current = self.scope.write();
        if *current != fresh {
            info!(scope = ?fresh, "permission scope changed");
            *current = fresh;
        }
    }

    /// Proxy one tool call. `server` may be omitted when the tool name is
    /// unambiguous; resolution checks running servers first, then the
    /// cache of stopped ones.
    pub async fn call(
        &self,
        server: Option<&str>,
        tool: &str,
        arguments: Value,
    ) -> SwitchboardResult<String> {
        let server = match server {
            Some(name) => name.to_string(),
            None => self.resolve_owner(tool).await?,
        };

        if let Some(scope) = self.scope.read().as_ref() {
            if !scope.contains(&server) {
                return Err(SwitchboardError::permission(format!(
                    "server '{}' is outside the current scope",
                    server
                )));
            }
        }

        let (timeout, retry) = {
            let registry = self.lifecycle.registry().read().await;
            let config = registry.get(&server).ok_or_else(|| {
                SwitchboardError::not_found(format!("unknown server '{}'", server))
            })?;
            if !config.enabled {
                // Disabled servers are never auto-started, even when the
                // cache still advertises their tools.
                return Err(SwitchboardError::disabled(server.clone()));
            }
            (registry.timeout(&server), config.retry.clone())
        };

        let running = self.lifecycle.ensure_running(&server).await?;

        running.touch();
        let mut result = running.connection.call_tool(tool, arguments.clone(), timeout).await;

        // At most one retry, and only for the declared failure signature.
        if let Err(e) = &result {
            if should_retry(retry.as_ref(), tool, e) {
                warn!(server = %server, tool = %tool, "retrying after: {}", e);
                tokio::time::sleep(RETRY_BACKOFF).await;
                let running = self.revive(&server, &running).await?;
                running.touch();
                result = running.connection.call_tool(tool, arguments.clone(), timeout).await;
            }
        }

        let result = result?;
        let text = self.flatten(&server, tool, result)?;

        self.usage.record(&server);
        let engine = Arc::clone(&self.hooks);
        let invocation = HookInvocation {
            server: server.clone(),
            tool: tool.to_string(),
            arguments,
            result_text: text.clone(),
        };
        tokio::spawn(engine.dispatch(invocation));

        Ok(text)
    }

    /// Find which server publishes this tool: live index first, then the
    /// cache so a stopped server can be started on demand.
    async fn resolve_owner(&self, tool: &str) -> SwitchboardResult<String> {
        if let Some(owner) = self.lifecycle.index().owner_of(tool) {
            return Ok(owner);
        }

        let snapshot = self.lifecycle.cache().load_snapshot();
        let mut owners: Vec<&String> = snapshot
            .servers
            .iter()
            .filter(|(_, entry)| entry.tools.iter().any(|t| t.name == tool))
            .map(|(name, _)| name)
            .collect();
        owners.sort();

        match owners.as_slice() {
            [] => Err(SwitchboardError::not_found(format!(
                "no server provides tool '{}'",
                tool
            ))),
            [owner] => Ok((*owner).clone()),
            many => Err(SwitchboardError::not_found(format!(
                "tool '{}' is ambiguous across: {}",
                tool,
                many.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
            ))),
        }
    }

    /// Hand back a live connection for the retry, restarting the server
    /// if the first attempt killed it.
    async fn revive(
        &self,
        server: &str,
        current: &Arc<RunningServer>,
    ) -> SwitchboardResult<Arc<RunningServer>> {
        if current.connection.is_alive() {
            return Ok(Arc::clone(current));
        }
        self.lifecycle.restart(server).await
    }

    /// Collapse result content into the text returned to the caller,
    /// writing oversized and binary items to the payload directory.
    fn flatten(
        &self,
        server: &str,
        tool: &str,
        result: ToolCallResult,
    ) -> SwitchboardResult<String> {
        let mut parts = Vec::new();
        for content in result.content {
            match content {
                ToolContent::Text { text } => {
                    if text.len() > INTERCEPT_THRESHOLD {
                        let path = self.write_payload(server, tool, text.as_bytes(), "txt")?;
                        parts.push(format!(
                            "[large text payload saved to {} (~{} KiB)]",
                            path.display(),
                            text.len() / 1024
                        ));
                    } else {
                        parts.push(text);
                    }
                }
                ToolContent::Image { data, mime_type } => {
                    let decoded = base64::engine::general_purpose::STANDARD
                        .decode(data.as_bytes())
                        .unwrap_or_else(|_| data.into_bytes());
                    let ext = mime_type.rsplit('/').next().unwrap_or("bin");
                    let path = self.write_payload(server, tool, &decoded, ext)?;
                    parts.push(format!(
                        "[binary payload saved to {} ({}, ~{} KiB)]",
                        path.display(),
                        mime_type,
                        decoded.len() / 1024
                    ));
                }
                ToolContent::Resource { resource } => {
                    parts.push(serde_json::to_string(&resource)?);
                }
            }
        }
        let text = parts.join("\n");

        if result.is_error {
            return Err(SwitchboardError::transport(if text.is_empty() {
                format!("tool '{}' reported an error", tool)
            } else {
                text
            }));
        }
        Ok(text)
    }

    fn write_payload(
        &self,
        server: &str,
        tool: &str,
        bytes: &[u8],
        ext: &str,
    ) -> SwitchboardResult<std::path::PathBuf> {
        let dir = self.lifecycle.cache().payload_dir()?;
        let path = dir.join(format!("{}-{}-{}.{}", server, tool, uuid::Uuid::new_v4(), ext));
        std::fs::write(&path, bytes)?;
        debug!(path = %path.display(), bytes = bytes.len(), "payload intercepted");
        if let Err(e) = prune_payloads(&dir, PAYLOAD_KEEP) {
            warn!("payload prune failed: {}", e);
        }
        Ok(path)
    }
}

/// Keep the `keep` newest files in the payload directory, deleting the rest
fn prune_payloads(dir: &std::path::Path, keep: usize) -> std::io::Result<()> {
    let mut files: Vec<(std::time::SystemTime, std::path::PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_file() {
            files.push((meta.modified()?, entry.path()));
        }
    }
    if files.len() <= keep {
        return Ok(());
    }

    files.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, path) in files.drain(keep..) {
        if let Err(e) = std::fs::remove_file(&path) {
            debug!(path = %path.display(), "payload delete failed: {}", e);
        }
    }
    Ok(())
}

fn scope_from_env() -> Option<HashSet<String>> {
    let raw = std::env::var(SCOPE_ENV).ok()?;
    let set: HashSet<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    // An empty variable means no restriction, not deny-everything.
    if set.is_empty() {
        None
    } else {
        Some(set)
    }
}

fn should_retry(rule: Option<&crate::config::RetryRule>, tool: &str, error: &SwitchboardError) -> bool {
    match rule {
        Some(rule) => {
            rule.tool == tool
                && error.is_transport()
                && error.to_string().contains(&rule.message_contains)
        }
        None => false,
    }
}
