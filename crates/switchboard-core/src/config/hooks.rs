//! Hook declarations file
//!
//! `hooks.yaml` carries a `defaults` block plus a pattern-keyed map of
//! rules. A pattern is an exact tool name or a trailing-`*` prefix
//! wildcard; rules are declared once at load time and are stateless
//! thereafter.

use crate::error::{SwitchboardError, SwitchboardResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

fn default_true() -> bool {
    true
}

fn default_hook_timeout_secs() -> u64 {
    30
}

fn default_regex_group() -> usize {
    1
}

fn default_summary_chars() -> usize {
    400
}

/// Global hook execution defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookDefaults {
    /// Master switch for the engine
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Execute matched rules concurrently (true) or serialized (false)
    #[serde(default = "default_true", rename = "async")]
    pub async_mode: bool,
    /// Timeout for secondary calls, in seconds
    #[serde(default = "default_hook_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HookDefaults {
    fn default() -> Self {
        Self {
            enabled: true,
            async_mode: true,
            timeout_secs: default_hook_timeout_secs(),
        }
    }
}

/// How one output field is produced from a finished call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum FieldSpec {
    /// Literal template; `{server}` and `{tool}` are substituted
    Literal { template: String },
    /// Regex capture group over the result text
    Regex {
        pattern: String,
        #[serde(default = "default_regex_group")]
        group: usize,
    },
    /// The verbatim result text
    Result,
    /// Truncated result summary
    Summary {
        #[serde(default = "default_summary_chars")]
        max_chars: usize,
    },
    /// A named field from the original call's arguments
    Argument { name: String },
}

/// One declarative post-call side effect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookRule {
    /// Target server to fire on match
    pub server: String,
    /// Target tool on that server
    pub tool: String,
    /// Output-field name -> extraction spec
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
    /// Fire only if the result text contains this substring
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_contains: Option<String>,
    /// Fire only if the result text does not contain this substring
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_not_contains: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Parsed hooks.yaml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HooksConfig {
    #[serde(default)]
    pub defaults: HookDefaults,
    /// Pattern -> rule
    #[serde(default)]
    pub hooks: BTreeMap<String, HookRule>,
}

impl HooksConfig {
    /// Load hook declarations; a missing file means no hooks
    pub fn load(path: impl AsRef<Path>) -> SwitchboardResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("hooks file {} not found, no hooks declared", path.display());
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)
            .map_err(|e| SwitchboardError::config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: HooksConfig = serde_yaml::from_str(&raw)
            .map_err(|e| SwitchboardError::config(format!("malformed {}: {}", path.display(), e)))?;

        debug!("loaded {} hook rules from {}", config.hooks.len(), path.display());
        Ok(config)
    }

    /// Whether `pattern` matches an invoked tool name
    ///
    /// Exact match, or prefix match for trailing-`*` wildcard patterns.
    pub fn pattern_matches(pattern: &str, tool: &str) -> bool {
        match pattern.strip_suffix('*') {
            Some(prefix) => tool.starts_with(prefix),
            None => pattern == tool,
        }
    }

    /// All enabled rules whose pattern matches the invoked tool
    pub fn matching_rules(&self, tool: &str) -> Vec<(&String, &HookRule)> {
        if !self.defaults.enabled {
            return Vec::new();
        }
        self.hooks
            .iter()
            .filter(|(pattern, rule)| rule.enabled && Self::pattern_matches(pattern, tool))
            .collect()
    }
}
