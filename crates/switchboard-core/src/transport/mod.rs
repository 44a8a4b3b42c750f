//! Transport layer
//!
//! Two interchangeable implementations of "send one request, correlate one
//! response": newline-delimited JSON over a child process's standard
//! streams, and HTTP with optional event-stream responses. Both enforce
//! timeouts by cancellation rather than trusting the server.

pub mod http;
pub mod stdio;

pub use http::HttpTransport;
pub use stdio::StdioTransport;

use crate::config::{ServerConfig, TransportKind};
use crate::error::{SwitchboardError, SwitchboardResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

/// One request/response exchange with a server
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for its correlated result
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> SwitchboardResult<Value>;

    /// Send a notification; no response is expected
    async fn notify(&self, method: &str, params: Option<Value>) -> SwitchboardResult<()>;

    /// Tear down the transport and release its resources
    async fn close(&self);

    /// Whether the underlying channel is still usable
    fn is_alive(&self) -> bool;

    /// OS process id, for stdio transports
    fn pid(&self) -> Option<u32> {
        None
    }
}

/// Side-channel for non-protocol output from a server
///
/// Protocol framing and log scraping are kept on separate paths: the
/// transports hand every non-envelope line here, and this sink scans for
/// known informational patterns (currently: a reported listening port).
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    inner: Arc<Mutex<DiagnosticsInner>>,
}

#[derive(Debug, Default)]
struct DiagnosticsInner {
    ports: Vec<u16>,
    lines: u64,
}

fn port_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)port[\s:=]+(\d{2,5})\b|listening on\s+(?:\S*?:)?(\d{2,5})\b")
            .expect("valid regex")
    })
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one diagnostic line, scraping informational patterns
    pub fn observe_line(&self, line: &str) {
        let mut inner = self.inner.lock();
        inner.lines += 1;
        if let Some(caps) = port_regex().captures(line) {
            let matched = caps.get(1).or_else(|| caps.get(2));
            if let Some(port) = matched.and_then(|m| m.as_str().parse::<u16>().ok()) {
                if !inner.ports.contains(&port) {
                    inner.ports.push(port);
                }
            }
        }
    }

    /// Ports the server reported on its diagnostic stream
    pub fn ports(&self) -> Vec<u16> {
        self.inner.lock().ports.clone()
    }

    /// Total diagnostic lines observed
    pub fn line_count(&self) -> u64 {
        self.inner.lock().lines
    }
}

/// Builds a transport for a server entry
///
/// The production factory spawns processes and opens HTTP sessions; tests
/// substitute scripted transports.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(
        &self,
        name: &str,
        config: &ServerConfig,
        diagnostics: Diagnostics,
    ) -> SwitchboardResult<Box<dyn Transport>>;
}

/// Default factory backed by the stdio and HTTP transports
pub struct DefaultTransportFactory;

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn connect(
        &self,
        name: &str,
        config: &ServerConfig,
        diagnostics: Diagnostics,
    ) -> SwitchboardResult<Box<dyn Transport>> {
        match config.transport {
            TransportKind::Stdio => {
                let command = config.command.as_deref().ok_or_else(|| {
                    SwitchboardError::config(format!("stdio server '{}' has no command", name))
                })?;
                let transport = StdioTransport::spawn(
                    name,
                    command,
                    &config.args,
                    &config.env,
                    config.cwd.as_deref(),
                    diagnostics,
                )
                .await?;
                Ok(Box::new(transport))
            }
            TransportKind::Http => {
                let url = config.url.as_deref().ok_or_else(|| {
                    SwitchboardError::config(format!("http server '{}' has no url", name))
                })?;
                let transport = HttpTransport::new(url, &config.headers)?;
                Ok(Box::new(transport))
            }
        }
    }
}

/// Scripted transport for tests. Responses are queued per method and
/// handed out in order; an empty queue yields a transport error.
#[cfg(test)]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Script {
        responses: HashMap<String, VecDeque<Result<Value, String>>>,
        requests: Vec<(String, Option<Value>)>,
        notifications: Vec<String>,
    }

    #[derive(Clone, Default)]
    pub struct ScriptedTransport {
        script: Arc<Mutex<Script>>,
        alive: Arc<AtomicBool>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self {
                script: Arc::new(Mutex::new(Script::default())),
                alive: Arc::new(AtomicBool::new(true)),
            }
        }

        pub fn respond(self, method: &str, value: Value) -> Self {
            self.script
                .lock()
                .responses
                .entry(method.to_string())
                .or_default()
                .push_back(Ok(value));
            self
        }

        pub fn fail(self, method: &str, message: &str) -> Self {
            self.script
                .lock()
                .responses
                .entry(method.to_string())
                .or_default()
                .push_back(Err(message.to_string()));
            self
        }

        pub fn requests(&self) -> Vec<(String, Option<Value>)> {
            self.script.lock().requests.clone()
        }

        pub fn notifications(&self) -> Vec<String> {
            self.script.lock().notifications.clone()
        }

        pub fn kill(&self) {
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn request(
            &self,
            method: &str,
            params: Option<Value>,
            _timeout: Duration,
        ) -> SwitchboardResult<Value> {
            if !self.is_alive() {
                return Err(SwitchboardError::transport("transport closed"));
            }
            let mut script = self.script.lock();
            script.requests.push((method.to_string(), params));
            match script.responses.get_mut(method).and_then(|q| q.pop_front()) {
                Some(Ok(value)) => Ok(value),
                Some(Err(message)) => Err(SwitchboardError::transport(message)),
                None => Err(SwitchboardError::transport(format!(
                    "no scripted response for {}",
                    method
                ))),
            }
        }

        async fn notify(&self, method: &str, _params: Option<Value>) -> SwitchboardResult<()> {
            self.script.lock().notifications.push(method.to_string());
            Ok(())
        }

        async fn close(&self) {
            self.alive.store(false, Ordering::SeqCst);
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
    }

    /// Factory handing out pre-queued scripted transports per server name
    #[derive(Default)]
    pub struct ScriptedFactory {
        scripts: Mutex<HashMap<String, VecDeque<ScriptedTransport>>>,
        connects: std::sync::atomic::AtomicUsize,
    }

    impl ScriptedFactory {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with(self, name: &str, transport: ScriptedTransport) -> Self {
            self.scripts
                .lock()
                .entry(name.to_string())
                .or_default()
                .push_back(transport);
            self
        }

        pub fn connect_count(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TransportFactory for ScriptedFactory {
        async fn connect(
            &self,
            name: &str,
            _config: &ServerConfig,
            _diagnostics: Diagnostics,
        ) -> SwitchboardResult<Box<dyn Transport>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.scripts
                .lock()
                .get_mut(name)
                .and_then(|q| q.pop_front())
                .map(|t| Box::new(t) as Box<dyn Transport>)
                .ok_or_else(|| SwitchboardError::startup(name, "no transport scripted"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostics_port_scrape() {
        let diagnostics = Diagnostics::new();
        diagnostics.observe_line("INFO server listening on 127.0.0.1:8231");
        diagnostics.observe_line("debug: cache warmed");
        diagnostics.observe_line("bound port: 8231");

        assert_eq!(diagnostics.ports(), vec![8231]);
        assert_eq!(diagnostics.line_count(), 3);
    }

    #[test]
    fn test_diagnostics_ignores_noise() {
        let diagnostics = Diagnostics::new();
        diagnostics.observe_line("loaded 12000 records");
        assert!(diagnostics.ports().is_empty());
    }
}
