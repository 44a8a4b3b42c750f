//! Stdio transport
//!
//! Spawns the server as a child process and speaks newline-delimited
//! JSON-RPC over its standard streams. A background reader task correlates
//! responses with pending requests by id, so concurrent calls to the same
//! server resolve independently. Lines that are not protocol envelopes are
//! routed to the diagnostics side-channel, never treated as errors.

use super::{Diagnostics, Transport};
use crate::error::{SwitchboardError, SwitchboardResult};
use crate::protocol::{RpcMessage, RpcNotification, RpcRequest};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<crate::protocol::RpcResponse>>>>;

/// Child-process transport
pub struct StdioTransport {
    server: String,
    child: Mutex<Option<Child>>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    pending: PendingMap,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    pid: Option<u32>,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
    stderr_reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StdioTransport {
    /// Spawn the server process and wire up its streams
    pub async fn spawn(
        server: &str,
        command: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        cwd: Option<&Path>,
        diagnostics: Diagnostics,
    ) -> SwitchboardResult<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in env {
            cmd.env(key, value);
        }
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            SwitchboardError::startup(server, format!("cannot spawn '{}': {}", command, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SwitchboardError::startup(server, "no stdin handle"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SwitchboardError::startup(server, "no stdout handle"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SwitchboardError::startup(server, "no stderr handle"))?;

        let pid = child.id();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let reader = tokio::spawn(read_stdout(
            server.to_string(),
            BufReader::new(stdout),
            Arc::clone(&pending),
            Arc::clone(&alive),
            diagnostics.clone(),
        ));
        let stderr_reader = tokio::spawn(read_stderr(
            server.to_string(),
            BufReader::new(stderr),
            diagnostics,
        ));

        Ok(Self {
            server: server.to_string(),
            child: Mutex::new(Some(child)),
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            pending,
            next_id: AtomicU64::new(1),
            alive,
            pid,
            reader: Mutex::new(Some(reader)),
            stderr_reader: Mutex::new(Some(stderr_reader)),
        })
    }

    async fn write_line(&self, payload: String) -> SwitchboardResult<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| SwitchboardError::transport("stdin already closed"))?;
        stdin.write_all(payload.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> SwitchboardResult<Value> {
        if !self.is_alive() {
            return Err(SwitchboardError::transport(format!(
                "server '{}' process has exited",
                self.server
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = RpcRequest::new(id as i64, method);
        let request = match params {
            Some(p) => request.with_params(p),
            None => request,
        };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let payload = serde_json::to_string(&request)?;
        trace!(server = %self.server, %method, id, "sending request");
        if let Err(e) = self.write_line(payload).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response
                .into_result()
                .map_err(|e| SwitchboardError::transport(e.to_string())),
            Ok(Err(_)) => {
                // Reader task dropped the sender: process exited mid-call.
                Err(SwitchboardError::transport(format!(
                    "server '{}' closed the connection before responding",
                    self.server
                )))
            }
            Err(_) => {
                // Release the pending slot; the remote work may continue but
                // nothing is waiting for it anymore.
                self.pending.lock().remove(&id);
                Err(SwitchboardError::timeout(timeout.as_secs_f64()))
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> SwitchboardResult<()> {
        let notification = RpcNotification::new(method);
        let notification = match params {
            Some(p) => notification.with_params(p),
            None => notification,
        };
        self.write_line(serde_json::to_string(&notification)?).await
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);

        // Closing stdin signals EOF to well-behaved servers.
        self.stdin.lock().await.take();

        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.stderr_reader.lock().take() {
            handle.abort();
        }

        let child = self.child.lock().take();
        if let Some(mut child) = child {
            tokio::select! {
                _ = child.wait() => {}
                _ = tokio::time::sleep(Duration::from_secs(5)) => {
                    child.kill().await.ok();
                }
            }
        }

        self.pending.lock().clear();
        debug!(server = %self.server, "stdio transport closed");
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.stderr_reader.lock().take() {
            handle.abort();
        }
        if let Some(mut child) = self.child.lock().take() {
            let _ = child.start_kill();
        }
    }
}

/// Pump stdout: envelopes go to their pending waiter, everything else to
/// the diagnostics sink.
async fn read_stdout<R>(
    server: String,
    reader: BufReader<R>,
    pending: PendingMap,
    alive: Arc<AtomicBool>,
    diagnostics: Diagnostics,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if !trimmed.starts_with('{') {
                    diagnostics.observe_line(trimmed);
                    continue;
                }
                match serde_json::from_str::<RpcMessage>(trimmed) {
                    Ok(RpcMessage::Response(response)) => {
                        let id = match &response.id {
                            crate::protocol::RequestId::Number(n) => Some(*n as u64),
                            crate::protocol::RequestId::String(s) => s.parse::<u64>().ok(),
                        };
                        let waiter = id.and_then(|id| pending.lock().remove(&id));
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(response);
                            }
                            None => {
                                // Mismatched or late id: skip it and keep
                                // reading until the right one arrives.
                                trace!(server = %server, id = %response.id, "dropping unmatched response");
                            }
                        }
                    }
                    Ok(RpcMessage::Notification(notification)) => {
                        trace!(server = %server, method = %notification.method, "server notification");
                    }
                    Ok(RpcMessage::Request(_)) => {
                        trace!(server = %server, "ignoring server-initiated request");
                    }
                    Err(_) => {
                        // JSON-looking but not an envelope: still log output.
                        diagnostics.observe_line(trimmed);
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(server = %server, "stdout read error: {}", e);
                break;
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
    // Dropping the senders wakes every in-flight call with a closed-channel
    // error instead of leaving it to hit its timeout.
    pending.lock().clear();
    debug!(server = %server, "stdout stream ended");
}

/// Pump stderr into the diagnostics sink
async fn read_stderr<R>(server: String, reader: BufReader<R>, diagnostics: Diagnostics)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = reader.lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            trace!(server = %server, "stderr: {}", line);
            diagnostics.observe_line(line.trim());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RpcResponse, JSONRPC_VERSION};

    fn response(id: u64, result: Value) -> String {
        serde_json::to_string(&RpcResponse {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: crate::protocol::RequestId::Number(id as i64),
            result: Some(result),
            error: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_reader_correlates_by_id() {
        let (mut tx, rx) = tokio::io::duplex(4096);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        pending.lock().insert(1, tx1);
        pending.lock().insert(2, tx2);

        let task = tokio::spawn(read_stdout(
            "test".to_string(),
            BufReader::new(rx),
            Arc::clone(&pending),
            alive,
            Diagnostics::new(),
        ));

        // Out-of-order responses; each lands at its own waiter.
        let payload = format!(
            "{}\n{}\n",
            response(2, serde_json::json!("second")),
            response(1, serde_json::json!("first"))
        );
        tx.write_all(payload.as_bytes()).await.unwrap();
        drop(tx);

        assert_eq!(rx1.await.unwrap().into_result().unwrap(), "first");
        assert_eq!(rx2.await.unwrap().into_result().unwrap(), "second");
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_non_envelope_lines_are_diagnostics() {
        let (mut tx, rx) = tokio::io::duplex(4096);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let diagnostics = Diagnostics::new();

        let task = tokio::spawn(read_stdout(
            "test".to_string(),
            BufReader::new(rx),
            Arc::clone(&pending),
            Arc::clone(&alive),
            diagnostics.clone(),
        ));

        tx.write_all(b"proxy listening on 127.0.0.1:9321\nnot json at all\n")
            .await
            .unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(diagnostics.ports(), vec![9321]);
        assert_eq!(diagnostics.line_count(), 2);
        assert!(!alive.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_eof_drops_pending_waiters() {
        let (tx, rx) = tokio::io::duplex(64);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let (tx1, rx1) = oneshot::channel();
        pending.lock().insert(7, tx1);

        let task = tokio::spawn(read_stdout(
            "test".to_string(),
            BufReader::new(rx),
            Arc::clone(&pending),
            alive,
            Diagnostics::new(),
        ));
        drop(tx);
        task.await.unwrap();

        // The waiter sees a closed channel, not a hang.
        assert!(rx1.await.is_err());
        assert!(pending.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unmatched_response_is_skipped() {
        let (mut tx, rx) = tokio::io::duplex(4096);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let (tx5, rx5) = oneshot::channel();
        pending.lock().insert(5, tx5);

        let task = tokio::spawn(read_stdout(
            "test".to_string(),
            BufReader::new(rx),
            Arc::clone(&pending),
            alive,
            Diagnostics::new(),
        ));

        let payload = format!(
            "{}\n{}\n",
            response(99, serde_json::json!("stale")),
            response(5, serde_json::json!("mine"))
        );
        tx.write_all(payload.as_bytes()).await.unwrap();
        drop(tx);

        assert_eq!(rx5.await.unwrap().into_result().unwrap(), "mine");
        task.await.unwrap();
    }
}
