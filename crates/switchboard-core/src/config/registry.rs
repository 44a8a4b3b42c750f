//! Server registry configuration
//!
//! Loads and saves `servers.yaml`: a `defaults` block plus a map of server
//! entries keyed by name. Environment placeholders of the form `${VAR}` are
//! resolved against the process environment at load time.

use crate::error::{SwitchboardError, SwitchboardResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, warn};

fn default_timeout_secs() -> u64 {
    300
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_startup_grace_ms() -> u64 {
    400
}

fn default_true() -> bool {
    true
}

/// Defaults applied to every server unless overridden per entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryDefaults {
    /// Per-call timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Idle-eviction timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Grace period between spawn and handshake, in milliseconds
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
    /// Servers carrying any of these tags are never idle-evicted
    #[serde(default)]
    pub idle_exempt_tags: Vec<String>,
}

impl Default for RegistryDefaults {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            startup_grace_ms: default_startup_grace_ms(),
            idle_exempt_tags: Vec::new(),
        }
    }
}

/// Transport kind for a server entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Http,
}

impl Default for TransportKind {
    fn default() -> Self {
        Self::Stdio
    }
}

/// Per-server retry policy metadata
///
/// Exactly one bounded retry is permitted when a call to `tool` fails with
/// an error message containing `message_contains`. Everything else is
/// returned, not retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryRule {
    pub tool: String,
    pub message_contains: String,
}

/// Declarative configuration for a single server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub transport: TransportKind,

    // stdio transport
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_grace_ms: Option<u64>,

    // http transport
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    // common
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryRule>,
}

impl ServerConfig {
    /// Create a stdio server entry
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            transport: TransportKind::Stdio,
            command: Some(command.into()),
            args,
            env: BTreeMap::new(),
            cwd: None,
            startup_grace_ms: None,
            url: None,
            headers: BTreeMap::new(),
            enabled: true,
            auto_start: false,
            timeout_secs: None,
            idle_timeout_secs: None,
            tags: Vec::new(),
            description: String::new(),
            retry: None,
        }
    }

    /// Create an HTTP server entry
    pub fn http(url: impl Into<String>) -> Self {
        Self {
            transport: TransportKind::Http,
            command: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            startup_grace_ms: None,
            url: Some(url.into()),
            headers: BTreeMap::new(),
            enabled: true,
            auto_start: false,
            timeout_secs: None,
            idle_timeout_secs: None,
            tags: Vec::new(),
            description: String::new(),
            retry: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Exactly one of {command, url} must be populated, matching the
    /// declared transport kind.
    fn validate(&self, name: &str) -> SwitchboardResult<()> {
        match (self.transport, &self.command, &self.url) {
            (TransportKind::Stdio, Some(_), None) => Ok(()),
            (TransportKind::Http, None, Some(_)) => Ok(()),
            (_, Some(_), Some(_)) => Err(SwitchboardError::config(format!(
                "server '{}' declares both command and url",
                name
            ))),
            (TransportKind::Stdio, None, _) => Err(SwitchboardError::config(format!(
                "stdio server '{}' has no command",
                name
            ))),
            (TransportKind::Http, _, None) => Err(SwitchboardError::config(format!(
                "http server '{}' has no url",
                name
            ))),
        }
    }
}

/// On-disk shape of servers.yaml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    defaults: RegistryDefaults,
    #[serde(default)]
    servers: BTreeMap<String, ServerConfig>,
}

/// Loaded, normalized server registry
#[derive(Debug, Clone)]
pub struct ServerRegistry {
    path: PathBuf,
    pub defaults: RegistryDefaults,
    servers: BTreeMap<String, ServerConfig>,
}

impl ServerRegistry {
    /// Load the registry from a YAML file
    ///
    /// A missing file yields an empty registry; a malformed file is a
    /// `ConfigError`.
    pub fn load(path: impl AsRef<Path>) -> SwitchboardResult<Self> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            debug!("registry file {} not found, starting empty", path.display());
            return Ok(Self {
                path,
                defaults: RegistryDefaults::default(),
                servers: BTreeMap::new(),
            });
        }

        let raw = std::fs::read_to_string(&path)
            .map_err(|e| SwitchboardError::config(format!("cannot read {}: {}", path.display(), e)))?;

        let mut file: RegistryFile = serde_yaml::from_str(&raw)
            .map_err(|e| SwitchboardError::config(format!("malformed {}: {}", path.display(), e)))?;

        for (name, server) in &mut file.servers {
            expand_server_placeholders(server);
            server.validate(name)?;
        }

        debug!(
            "loaded {} server entries from {}",
            file.servers.len(),
            path.display()
        );

        Ok(Self {
            path,
            defaults: file.defaults,
            servers: file.servers,
        })
    }

    /// Rewrite the registry file from the in-memory map
    ///
    /// Derived values (effective timeouts) live on the defaults block and
    /// are not duplicated into entries.
    pub fn save(&self) -> SwitchboardResult<()> {
        let file = RegistryFile {
            defaults: self.defaults.clone(),
            servers: self.servers.clone(),
        };
        let yaml = serde_yaml::to_string(&file)
            .map_err(|e| SwitchboardError::config(format!("cannot serialize registry: {}", e)))?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SwitchboardError::config(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        std::fs::write(&self.path, yaml).map_err(|e| {
            SwitchboardError::config(format!("cannot write {}: {}", self.path.display(), e))
        })?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.servers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.servers.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ServerConfig)> {
        self.servers.iter()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Insert a new entry; rejects duplicates
    pub fn insert(&mut self, name: impl Into<String>, config: ServerConfig) -> SwitchboardResult<()> {
        let name = name.into();
        if self.servers.contains_key(&name) {
            return Err(SwitchboardError::config(format!(
                "server '{}' already exists",
                name
            )));
        }
        config.validate(&name)?;
        self.servers.insert(name, config);
        Ok(())
    }

    /// Remove an entry, returning it if present
    pub fn remove(&mut self, name: &str) -> Option<ServerConfig> {
        self.servers.remove(name)
    }

    /// Flip the enabled flag; Ok(message) either way the flag already was
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> SwitchboardResult<String> {
        let server = self
            .servers
            .get_mut(name)
            .ok_or_else(|| SwitchboardError::not_found(format!("server '{}'", name)))?;
        if server.enabled == enabled {
            return Ok(format!(
                "server '{}' already {}",
                name,
                if enabled { "enabled" } else { "disabled" }
            ));
        }
        server.enabled = enabled;
        Ok(format!(
            "server '{}' {}",
            name,
            if enabled { "enabled" } else { "disabled" }
        ))
    }

    /// Effective per-call timeout for a server
    pub fn timeout(&self, name: &str) -> std::time::Duration {
        let secs = self
            .servers
            .get(name)
            .and_then(|s| s.timeout_secs)
            .unwrap_or(self.defaults.timeout_secs);
        std::time::Duration::from_secs(secs)
    }

    /// Effective idle-eviction timeout for a server
    pub fn idle_timeout(&self, name: &str) -> std::time::Duration {
        let secs = self
            .servers
            .get(name)
            .and_then(|s| s.idle_timeout_secs)
            .unwrap_or(self.defaults.idle_timeout_secs);
        std::time::Duration::from_secs(secs)
    }

    /// Effective startup grace period for a server
    pub fn startup_grace(&self, name: &str) -> std::time::Duration {
        let ms = self
            .servers
            .get(name)
            .and_then(|s| s.startup_grace_ms)
            .unwrap_or(self.defaults.startup_grace_ms);
        std::time::Duration::from_millis(ms)
    }

    /// Whether a server is exempt from idle eviction
    pub fn is_idle_exempt(&self, name: &str) -> bool {
        let Some(server) = self.servers.get(name) else {
            return false;
        };
        server
            .tags
            .iter()
            .any(|t| self.defaults.idle_exempt_tags.contains(t))
    }
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"))
}

/// Replace `${VAR}` with the process environment value; unknown variables
/// are left verbatim so the failure is visible downstream.
pub fn expand_placeholders(value: &str) -> String {
    placeholder_regex()
        .replace_all(value, |caps: &regex::Captures<'_>| {
            let var = &caps[1];
            match std::env::var(var) {
                Ok(v) => v,
                Err(_) => {
                    warn!("environment variable {} not set, leaving placeholder", var);
                    caps[0].to_string()
                }
            }
        })
        .into_owned()
}

fn expand_server_placeholders(server: &mut ServerConfig) {
    if let Some(command) = &server.command {
        server.command = Some(expand_placeholders(command));
    }
    for arg in &mut server.args {
        *arg = expand_placeholders(arg);
    }
    for value in server.env.values_mut() {
        *value = expand_placeholders(value);
    }
    if let Some(url) = &server.url {
        server.url = Some(expand_placeholders(url));
    }
    for value in server.headers.values_mut() {
        *value = expand_placeholders(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_registry(dir: &tempfile::TempDir, yaml: &str) -> PathBuf {
        let path = dir.path().join("servers.yaml");
        std::fs::write(&path, yaml).unwrap();
        path
    }

    #[test]
    fn test_missing_file_is_empty() {
        let registry = ServerRegistry::load("/nonexistent/servers.yaml").unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_registry(&dir, "servers: [not, a, map]");

        let err = ServerRegistry::load(path).unwrap_err();
        assert!(matches!(err, SwitchboardError::Config(_)));
    }

    #[test]
    fn test_load_and_defaults_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_registry(
            &dir,
            r#"
defaults:
  timeout_secs: 120
  idle_timeout_secs: 60
servers:
  echo:
    command: "mcp-echo"
    enabled: true
  slow:
    command: "mcp-slow"
    timeout_secs: 900
"#,
        );

        let registry = ServerRegistry::load(path).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.timeout("echo").as_secs(), 120);
        assert_eq!(registry.timeout("slow").as_secs(), 900);
        assert_eq!(registry.idle_timeout("slow").as_secs(), 60);
    }

    #[test]
    fn test_env_placeholder_expansion() {
        std::env::set_var("SWITCHBOARD_TEST_TOKEN", "s3cret");
        let dir = tempfile::tempdir().unwrap();
        let path = write_registry(
            &dir,
            r#"
servers:
  api:
    transport: http
    url: "http://localhost:9000"
    headers:
      Authorization: "Bearer ${SWITCHBOARD_TEST_TOKEN}"
  plain:
    command: "mcp-plain"
    env:
      LITERAL: "no placeholders here"
"#,
        );

        let registry = ServerRegistry::load(path).unwrap();
        assert_eq!(
            registry.get("api").unwrap().headers.get("Authorization").unwrap(),
            "Bearer s3cret"
        );
        assert_eq!(
            registry.get("plain").unwrap().env.get("LITERAL").unwrap(),
            "no placeholders here"
        );
    }

    #[test]
    fn test_unset_placeholder_left_verbatim() {
        assert_eq!(
            expand_placeholders("${SWITCHBOARD_DEFINITELY_UNSET_VAR}"),
            "${SWITCHBOARD_DEFINITELY_UNSET_VAR}"
        );
    }

    #[test]
    fn test_one_of_command_url_invariant() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_registry(
            &dir,
            r#"
servers:
  broken:
    command: "mcp-x"
    url: "http://localhost:1234"
"#,
        );

        let err = ServerRegistry::load(path).unwrap_err();
        assert!(err.to_string().contains("both command and url"));
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.yaml");

        let mut registry = ServerRegistry::load(&path).unwrap();
        registry
            .insert(
                "echo",
                ServerConfig::stdio("mcp-echo", vec![]).with_description("echo server"),
            )
            .unwrap();
        registry.save().unwrap();

        let reloaded = ServerRegistry::load(&path).unwrap();
        assert_eq!(reloaded.get("echo").unwrap().description, "echo server");
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let mut registry = ServerRegistry::load("/nonexistent/servers.yaml").unwrap();
        registry.insert("echo", ServerConfig::stdio("a", vec![])).unwrap();
        assert!(registry.insert("echo", ServerConfig::stdio("b", vec![])).is_err());
    }

    #[test]
    fn test_idle_exempt_tags() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_registry(
            &dir,
            r#"
defaults:
  idle_exempt_tags: ["pinned"]
servers:
  keeper:
    command: "mcp-keeper"
    tags: ["pinned", "db"]
  normal:
    command: "mcp-normal"
"#,
        );

        let registry = ServerRegistry::load(path).unwrap();
        assert!(registry.is_idle_exempt("keeper"));
        assert!(!registry.is_idle_exempt("normal"));
    }

    #[test]
    fn test_set_enabled_idempotent() {
        let mut registry = ServerRegistry::load("/nonexistent/servers.yaml").unwrap();
        registry.insert("echo", ServerConfig::stdio("a", vec![])).unwrap();

        let msg = registry.set_enabled("echo", false).unwrap();
        assert!(msg.contains("disabled"));
        let msg = registry.set_enabled("echo", false).unwrap();
        assert!(msg.contains("already"));
        assert!(registry.set_enabled("ghost", true).is_err());
    }
}
