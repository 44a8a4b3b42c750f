//! HTTP transport
//!
//! Speaks streamable HTTP: every request is a POST of a JSON-RPC envelope,
//! and the server answers either with a plain JSON body or with an SSE
//! stream whose final data event carries the response. A session id handed
//! back by the server is replayed on every subsequent request.

use super::Transport;
use crate::error::{SwitchboardError, SwitchboardResult};
use crate::protocol::{RpcNotification, RpcRequest, RpcResponse};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Remote-endpoint transport
pub struct HttpTransport {
    url: String,
    client: reqwest::Client,
    session: Mutex<Option<String>>,
    next_id: AtomicU64,
    alive: AtomicBool,
}

impl HttpTransport {
    pub fn new(url: &str, headers: &BTreeMap<String, String>) -> SwitchboardResult<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        default_headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/event-stream"),
        );
        for (key, value) in headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| SwitchboardError::config(format!("bad header name '{}': {}", key, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| SwitchboardError::config(format!("bad header value for '{}': {}", key, e)))?;
            default_headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .build()
            .map_err(|e| SwitchboardError::transport(format!("http client: {}", e)))?;

        Ok(Self {
            url: url.to_string(),
            client,
            session: Mutex::new(None),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
        })
    }

    async fn post(
        &self,
        body: &impl serde::Serialize,
        timeout: Duration,
    ) -> SwitchboardResult<reqwest::Response> {
        let mut request = self.client.post(&self.url).json(body).timeout(timeout);
        if let Some(session) = self.session.lock().clone() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SwitchboardError::timeout(timeout.as_secs_f64())
            } else {
                SwitchboardError::transport(format!("POST {}: {}", self.url, e))
            }
        })?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut guard = self.session.lock();
            if guard.as_deref() != Some(session) {
                debug!(url = %self.url, "captured session id");
                *guard = Some(session.to_string());
            }
        }

        Ok(response)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> SwitchboardResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let envelope = RpcRequest::new(id as i64, method);
        let envelope = match params {
            Some(p) => envelope.with_params(p),
            None => envelope,
        };

        trace!(url = %self.url, %method, id, "sending request");
        let response = self.post(&envelope, timeout).await?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response
            .text()
            .await
            .map_err(|e| SwitchboardError::transport(format!("reading body: {}", e)))?;

        if !status.is_success() {
            return Err(SwitchboardError::transport(format!(
                "{} returned {}: {}",
                self.url,
                status,
                truncate(&body, 200)
            )));
        }

        let rpc: RpcResponse = if content_type.starts_with("text/event-stream") {
            parse_sse_response(&body)?
        } else {
            serde_json::from_str(&body).map_err(|e| {
                SwitchboardError::transport(format!("malformed response body: {}", e))
            })?
        };

        rpc.into_result()
            .map_err(|e| SwitchboardError::transport(e.to_string()))
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> SwitchboardResult<()> {
        let envelope = RpcNotification::new(method);
        let envelope = match params {
            Some(p) => envelope.with_params(p),
            None => envelope,
        };

        let response = self.post(&envelope, Duration::from_secs(10)).await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(SwitchboardError::transport(format!(
                "notification {} rejected with {}",
                method, status
            )))
        }
    }

    async fn close(&self) {
        // No remote teardown in the protocol; just stop accepting calls.
        self.alive.store(false, Ordering::SeqCst);
        self.session.lock().take();
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// Pull the response envelope out of an SSE body. Servers may emit progress
/// events before the result, so the last data event wins.
fn parse_sse_response(body: &str) -> SwitchboardResult<RpcResponse> {
    let mut last_data: Option<String> = None;
    for block in body.split("\n\n") {
        let mut data_lines: Vec<&str> = Vec::new();
        for line in block.lines() {
            if let Some(rest) = line.strip_prefix("data:") {
                data_lines.push(rest.trim_start());
            }
        }
        if !data_lines.is_empty() {
            last_data = Some(data_lines.join("\n"));
        }
    }

    let data = last_data
        .ok_or_else(|| SwitchboardError::transport("event stream carried no data events"))?;
    serde_json::from_str(&data)
        .map_err(|e| SwitchboardError::transport(format!("malformed event payload: {}", e)))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
