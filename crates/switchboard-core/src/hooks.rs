//! Hook engine
//!
//! Fires declarative post-call side effects. After a successful proxied
//! call, each matching rule extracts fields from the finished call and
//! issues one secondary tool call against its target server. Hooks are
//! observers: they never block, fail, or alter the original call's result,
//! and they never start servers. A rule whose target is not running is
//! skipped with a log line.

use crate::config::{FieldSpec, HookDefaults, HookRule, HooksConfig};
use crate::lifecycle::Lifecycle;
use parking_lot::RwLock;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Owned snapshot of a finished call, handed to the engine after the
/// result has already been returned to the caller.
#[derive(Debug, Clone)]
pub struct HookInvocation {
    pub server: String,
    pub tool: String,
    pub arguments: Value,
    pub result_text: String,
}

pub struct HookEngine {
    config: RwLock<HooksConfig>,
    lifecycle: Arc<Lifecycle>,
}

impl HookEngine {
    pub fn new(config: HooksConfig, lifecycle: Arc<Lifecycle>) -> Self {
        Self {
            config: RwLock::new(config),
            lifecycle,
        }
    }

    /// Swap in a freshly loaded hooks file
    pub fn reload(&self, config: HooksConfig) {
        let count = config.hooks.len();
        *self.config.write() = config;
        debug!(rules = count, "hook rules reloaded");
    }

    pub fn rule_count(&self) -> usize {
        self.config.read().hooks.len()
    }

    /// Run every matching rule for one finished call. Errors are logged
    /// and swallowed; the caller has already received its result.
    pub async fn dispatch(self: Arc<Self>, invocation: HookInvocation) {
        let (defaults, rules): (HookDefaults, Vec<(String, HookRule)>) = {
            let config = self.config.read();
            let rules = config
                .matching_rules(&invocation.tool)
                .into_iter()
                .map(|(pattern, rule)| (pattern.clone(), rule.clone()))
                .collect();
            (config.defaults.clone(), rules)
        };

        if rules.is_empty() {
            return;
        }

        let timeout = Duration::from_secs(defaults.timeout_secs);
        if defaults.async_mode {
            let mut handles = Vec::new();
            for (pattern, rule) in rules {
                let engine = Arc::clone(&self);
                let invocation = invocation.clone();
                handles.push(tokio::spawn(async move {
                    engine.fire(&pattern, &rule, &invocation, timeout).await;
                }));
            }
            for handle in handles {
                let _ = handle.await;
            }
        } else {
            for (pattern, rule) in rules {
                self.fire(&pattern, &rule, &invocation, timeout).await;
            }
        }
    }

    async fn fire(
        &self,
        pattern: &str,
        rule: &HookRule,
        invocation: &HookInvocation,
        timeout: Duration,
    ) {
        if let Some(needle) = &rule.result_contains {
            if !invocation.result_text.contains(needle.as_str()) {
                debug!(%pattern, "gate result_contains not met, skipping");
                return;
            }
        }
        if let Some(needle) = &rule.result_not_contains {
            if invocation.result_text.contains(needle.as_str()) {
                debug!(%pattern, "gate result_not_contains not met, skipping");
                return;
            }
        }

        let fields = extract_fields(&rule.fields, invocation);
        if fields.is_empty() {
            debug!(%pattern, "no fields extracted, skipping");
            return;
        }

        // Observers only: a stopped target means the hook is skipped,
        // never that the target gets started.
        let Some(target) = self.lifecycle.get_running(&rule.server).await else {
            debug!(%pattern, target = %rule.server, "target not running, skipping");
            return;
        };

        match target
            .connection
            .call_tool(&rule.tool, Value::Object(fields), timeout)
            .await
        {
            Ok(result) if result.is_error => {
                warn!(%pattern, target = %rule.server, tool = %rule.tool, "hook call reported an error");
            }
            Ok(_) => {
                debug!(%pattern, target = %rule.server, tool = %rule.tool, "hook fired");
            }
            Err(e) => {
                warn!(%pattern, target = %rule.server, tool = %rule.tool, "hook call failed: {}", e);
            }
        }
    }
}

/// Build the secondary call's arguments from the rule's field specs.
/// Specs that fail to extract (no regex match, missing argument) are
/// dropped without failing the rest.
fn extract_fields(
    specs: &std::collections::BTreeMap<String, FieldSpec>,
    invocation: &HookInvocation,
) -> Map<String, Value> {
    let mut fields = Map::new();
    for (name, spec) in specs {
        let value = match spec {
            FieldSpec::Literal { template } => Some(Value::String(
                template
                    .replace("{server}", &invocation.server)
                    .replace("{tool}", &invocation.tool),
            )),
            FieldSpec::Regex { pattern, group } => match Regex::new(pattern) {
                Ok(regex) => regex
                    .captures(&invocation.result_text)
                    .and_then(|caps| caps.get(*group))
                    .map(|m| Value::String(m.as_str().to_string())),
                Err(e) => {
                    warn!(field = %name, "bad field regex: {}", e);
                    None
                }
            },
            FieldSpec::Result => Some(Value::String(invocation.result_text.clone())),
            FieldSpec::Summary { max_chars } => {
                Some(Value::String(summarize(&invocation.result_text, *max_chars)))
            }
            FieldSpec::Argument { name: arg } => invocation.arguments.get(arg).cloned(),
        };

        match value {
            Some(value) => {
                fields.insert(name.clone(), value);
            }
            None => debug!(field = %name, "field extraction yielded nothing"),
        }
    }
    fields
}

fn summarize(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{}...", truncated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerConfig, ServerRegistry};
    use crate::index::{ToolCache, ToolIndex};
    use crate::protocol::methods;
    use crate::transport::testing::{ScriptedFactory, ScriptedTransport};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn handshaken() -> ScriptedTransport {
        ScriptedTransport::new()
            .respond(
                methods::INITIALIZE,
                json!({"capabilities": {}, "serverInfo": {"name": "s", "version": "0"}}),
            )
            .respond(methods::TOOLS_LIST, json!({"tools": []}))
            .respond(
                methods::TOOLS_CALL,
                json!({"content": [{"type": "text", "text": "logged"}], "isError": false}),
            )
    }

    fn fast_stdio() -> ServerConfig {
        let mut config = ServerConfig::stdio("srv", vec![]);
        config.startup_grace_ms = Some(0);
        config
    }

    async fn engine_with_audit(
        dir: &std::path::Path,
        hooks: HooksConfig,
    ) -> (Arc<HookEngine>, ScriptedTransport, Arc<Lifecycle>) {
        let audit = handshaken();
        let handle = audit.clone();

        let mut registry = ServerRegistry::load(dir.join("servers.yaml")).unwrap();
        registry.insert("audit", fast_stdio()).unwrap();

        let lifecycle = Arc::new(Lifecycle::new(
            Arc::new(tokio::sync::RwLock::new(registry)),
            Arc::new(ToolIndex::new()),
            Arc::new(ScriptedFactory::new().with("audit", audit)),
            ToolCache::new(dir.join("state")),
        ));
        lifecycle.start("audit").await.unwrap();

        let engine = Arc::new(HookEngine::new(hooks, Arc::clone(&lifecycle)));
        (engine, handle, lifecycle)
    }

    fn rule(fields: BTreeMap<String, FieldSpec>) -> HookRule {
        HookRule {
            server: "audit".to_string(),
            tool: "log".to_string(),
            fields,
            result_contains: None,
            result_not_contains: None,
            enabled: true,
        }
    }

    fn config_with(pattern: &str, rule: HookRule) -> HooksConfig {
        let mut config = HooksConfig::default();
        config.defaults.async_mode = false;
        config.hooks.insert(pattern.to_string(), rule);
        config
    }

    fn invocation(tool: &str, result: &str) -> HookInvocation {
        HookInvocation {
            server: "web".to_string(),
            tool: tool.to_string(),
            arguments: json!({"url": "https://example.org"}),
            result_text: result.to_string(),
        }
    }

    #[tokio::test]
    async fn test_hook_fires_with_extracted_fields() {
        let dir = tempfile::tempdir().unwrap();
        let mut fields = BTreeMap::new();
        fields.insert(
            "origin".to_string(),
            FieldSpec::Literal {
                template: "{server}:{tool}".to_string(),
            },
        );
        fields.insert(
            "url".to_string(),
            FieldSpec::Argument {
                name: "url".to_string(),
            },
        );
        let (engine, handle, _lifecycle) =
            engine_with_audit(dir.path(), config_with("fetch", rule(fields))).await;

        engine.dispatch(invocation("fetch", "200 OK")).await;

        let calls = handle.requests();
        let call = calls
            .iter()
            .find(|(method, _)| method == methods::TOOLS_CALL)
            .expect("hook call issued");
        let params = call.1.as_ref().unwrap();
        assert_eq!(params["name"], "log");
        assert_eq!(params["arguments"]["origin"], "web:fetch");
        assert_eq!(params["arguments"]["url"], "https://example.org");
    }

    #[tokio::test]
    async fn test_result_contains_gates_firing() {
        let dir = tempfile::tempdir().unwrap();
        let mut fields = BTreeMap::new();
        fields.insert("body".to_string(), FieldSpec::Result);
        let mut r = rule(fields);
        r.result_contains = Some("error".to_string());
        let (engine, handle, _lifecycle) =
            engine_with_audit(dir.path(), config_with("fetch", r)).await;

        engine.clone().dispatch(invocation("fetch", "200 OK")).await;
        assert!(!handle
            .requests()
            .iter()
            .any(|(method, _)| method == methods::TOOLS_CALL));

        engine.dispatch(invocation("fetch", "error: refused")).await;
        assert!(handle
            .requests()
            .iter()
            .any(|(method, _)| method == methods::TOOLS_CALL));
    }

    #[tokio::test]
    async fn test_target_not_running_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut fields = BTreeMap::new();
        fields.insert("body".to_string(), FieldSpec::Result);
        let (engine, handle, lifecycle) =
            engine_with_audit(dir.path(), config_with("fetch", rule(fields))).await;

        lifecycle.stop("audit").await.unwrap();
        engine.dispatch(invocation("fetch", "done")).await;

        // The target stays stopped; hooks never start servers.
        assert!(!lifecycle.is_running("audit").await);
        assert!(!handle
            .requests()
            .iter()
            .any(|(method, _)| method == methods::TOOLS_CALL));
    }

    #[tokio::test]
    async fn test_empty_fields_skip_call() {
        let dir = tempfile::tempdir().unwrap();
        let mut fields = BTreeMap::new();
        fields.insert(
            "code".to_string(),
            FieldSpec::Regex {
                pattern: r"status=(\d+)".to_string(),
                group: 1,
            },
        );
        let (engine, handle, _lifecycle) =
            engine_with_audit(dir.path(), config_with("fetch", rule(fields))).await;

        // No regex match, no fields, no call.
        engine.dispatch(invocation("fetch", "nothing here")).await;
        assert!(!handle
            .requests()
            .iter()
            .any(|(method, _)| method == methods::TOOLS_CALL));
    }

    #[test]
    fn test_summarize_truncates_on_char_boundary() {
        assert_eq!(summarize("short", 10), "short");
        assert_eq!(summarize("abcdefgh", 5), "abcde...");
        assert_eq!(summarize("héllo wörld", 4), "héll...");
    }

    #[test]
    fn test_extract_regex_group() {
        let mut specs = BTreeMap::new();
        specs.insert(
            "code".to_string(),
            FieldSpec::Regex {
                pattern: r"status=(\d+)".to_string(),
                group: 1,
            },
        );
        let fields = extract_fields(&specs, &invocation("fetch", "done status=204 ok"));
        assert_eq!(fields["code"], "204");
    }
}
