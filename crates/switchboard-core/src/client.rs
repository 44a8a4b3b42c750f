//! Server connection
//!
//! Wraps a transport with the MCP handshake and the typed tool operations
//! the router uses. Everything above this layer deals in `ToolDefinition`
//! and `ToolCallResult`, never raw envelopes.

use crate::error::{SwitchboardError, SwitchboardResult};
use crate::protocol::{
    methods, InitializeParams, InitializeResult, ServerInfo, ToolCallResult, ToolDefinition,
};
use crate::transport::Transport;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

/// A handshaken connection to one running server
pub struct ServerConnection {
    name: String,
    transport: Box<dyn Transport>,
    server_info: ServerInfo,
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("name", &self.name)
            .field("server_info", &self.server_info)
            .finish_non_exhaustive()
    }
}

impl ServerConnection {
    /// Perform the initialize exchange and return a usable connection
    pub async fn handshake(
        name: &str,
        transport: Box<dyn Transport>,
        timeout: Duration,
    ) -> SwitchboardResult<Self> {
        let init = InitializeParams::default();
        let result = transport
            .request(
                methods::INITIALIZE,
                Some(serde_json::to_value(&init)?),
                timeout,
            )
            .await
            .map_err(|e| SwitchboardError::startup(name, format!("initialize failed: {}", e)))?;

        let init_result: InitializeResult = serde_json::from_value(result)
            .map_err(|e| SwitchboardError::startup(name, format!("bad initialize result: {}", e)))?;

        transport.notify(methods::INITIALIZED, None).await?;

        debug!(
            server = %name,
            remote = %init_result.server_info.name,
            version = %init_result.server_info.version,
            "handshake complete"
        );

        Ok(Self {
            name: name.to_string(),
            transport,
            server_info: init_result.server_info,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    pub fn pid(&self) -> Option<u32> {
        self.transport.pid()
    }

    /// Fetch the server's advertised tools
    pub async fn list_tools(&self, timeout: Duration) -> SwitchboardResult<Vec<ToolDefinition>> {
        let result = self
            .transport
            .request(methods::TOOLS_LIST, None, timeout)
            .await?;

        let tools = result
            .get("tools")
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));
        serde_json::from_value(tools)
            .map_err(|e| SwitchboardError::transport(format!("bad tools/list result: {}", e)))
    }

    /// Invoke one tool with the given arguments
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        timeout: Duration,
    ) -> SwitchboardResult<ToolCallResult> {
        let params = json!({
            "name": tool,
            "arguments": arguments,
        });

        let result = self
            .transport
            .request(methods::TOOLS_CALL, Some(params), timeout)
            .await?;

        serde_json::from_value(result)
            .map_err(|e| SwitchboardError::transport(format!("bad tools/call result: {}", e)))
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }
}
