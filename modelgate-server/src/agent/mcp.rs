//! MCP sessions: connections to tool-serving processes.
//!
//! Two transports: remote HTTP endpoints (JSON-RPC over POST, optional
//! bearer token) and stdio subprocesses (JSON-RPC over line-delimited
//! pipes). Sessions are memoized per model name in a process-wide pool so
//! repeated jobs against the same model reuse connections.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::model_config::{McpRemoteServer, McpStdioServer};

/// One tool advertised by a session.
#[derive(Debug, Clone)]
pub struct McpTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

pub enum McpSession {
    Remote(RemoteSession),
    Stdio(StdioSession),
}

impl McpSession {
    pub fn name(&self) -> &str {
        match self {
            McpSession::Remote(s) => &s.name,
            McpSession::Stdio(s) => &s.name,
        }
    }

    pub async fn list_tools(&self) -> Result<Vec<McpTool>> {
        let result = self.call_rpc("tools/list", json!({})).await?;
        let tools = result
            .get("tools")
            .and_then(|t| t.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(tools
            .into_iter()
            .filter_map(|t| {
                Some(McpTool {
                    name: t.get("name")?.as_str()?.to_string(),
                    description: t
                        .get("description")
                        .and_then(|d| d.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    input_schema: t
                        .get("inputSchema")
                        .cloned()
                        .unwrap_or_else(|| json!({"type": "object"})),
                })
            })
            .collect())
    }

    /// Invoke a tool and flatten its content blocks to text.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<String> {
        let result = self
            .call_rpc("tools/call", json!({"name": name, "arguments": arguments}))
            .await?;

        if result
            .get("isError")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            return Err(Error::Communication(format!(
                "tool {} reported an error",
                name
            )));
        }

        let text = result
            .get("content")
            .and_then(|c| c.as_array())
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();
        Ok(text)
    }

    async fn call_rpc(&self, method: &str, params: Value) -> Result<Value> {
        match self {
            McpSession::Remote(s) => s.call_rpc(method, params).await,
            McpSession::Stdio(s) => s.call_rpc(method, params).await,
        }
    }
}

pub struct RemoteSession {
    pub name: String,
    url: String,
    token: String,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl RemoteSession {
    pub fn new(name: &str, server: &McpRemoteServer) -> Self {
        Self {
            name: name.to_string(),
            url: server.url.clone(),
            token: server.token.clone(),
            http: reqwest::Client::new(),
            next_id: AtomicU64::new(1),
        }
    }

    async fn call_rpc(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut request = self.http.post(&self.url).json(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        }));
        if !self.token.is_empty() {
            request = request.bearer_auth(&self.token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::Communication(format!(
                "MCP server {} returned {}",
                self.name,
                response.status()
            )));
        }
        let body: Value = response.json().await?;
        rpc_result(&self.name, body)
    }
}

pub struct StdioSession {
    pub name: String,
    _child: Child,
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<BufReader<ChildStdout>>,
    next_id: AtomicU64,
}

impl StdioSession {
    /// Launch the configured command and run the initialize handshake.
    pub async fn start(name: &str, server: &McpStdioServer) -> Result<Self> {
        let mut child = Command::new(&server.command)
            .args(&server.args)
            .envs(&server.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Communication(format!(
                    "failed to start MCP server {}: {}",
                    server.command, e
                ))
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            Error::Internal("MCP child has no stdin".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            Error::Internal("MCP child has no stdout".to_string())
        })?;

        let session = Self {
            name: name.to_string(),
            _child: child,
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout)),
            next_id: AtomicU64::new(1),
        };

        session
            .call_rpc(
                "initialize",
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "clientInfo": {"name": "modelgate", "version": env!("CARGO_PKG_VERSION")},
                }),
            )
            .await?;
        session.notify("notifications/initialized").await?;
        Ok(session)
    }

    async fn call_rpc(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        {
            let mut stdin = self.stdin.lock().await;
            let mut line = serde_json::to_string(&request)?;
            line.push('\n');
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await?;
        }

        let mut stdout = self.stdout.lock().await;
        let mut line = String::new();
        loop {
            line.clear();
            let read = stdout.read_line(&mut line).await?;
            if read == 0 {
                return Err(Error::Communication(format!(
                    "MCP server {} closed its pipe",
                    self.name
                )));
            }
            let body: Value = match serde_json::from_str(line.trim()) {
                Ok(v) => v,
                // Ignore log noise on stdout.
                Err(_) => continue,
            };
            // Skip server-initiated notifications while waiting.
            if body.get("id").and_then(|v| v.as_u64()) != Some(id) {
                continue;
            }
            return rpc_result(&self.name, body);
        }
    }

    async fn notify(&self, method: &str) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        let mut line = serde_json::to_string(&json!({
            "jsonrpc": "2.0",
            "method": method,
        }))?;
        line.push('\n');
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }
}

fn rpc_result(session: &str, body: Value) -> Result<Value> {
    if let Some(error) = body.get("error") {
        return Err(Error::Communication(format!(
            "MCP server {} error: {}",
            session, error
        )));
    }
    Ok(body.get("result").cloned().unwrap_or(Value::Null))
}

/// Process-wide session cache keyed by model name.
#[derive(Default)]
pub struct McpSessionPool {
    sessions: Mutex<HashMap<String, Arc<Vec<Arc<McpSession>>>>>,
}

impl McpSessionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve (and cache) the sessions for a model. Servers that fail to
    /// come up are logged and skipped; an empty result is the caller's
    /// error to surface.
    pub async fn sessions_for_model(
        &self,
        model: &str,
        remote: &HashMap<String, McpRemoteServer>,
        stdio: &HashMap<String, McpStdioServer>,
    ) -> Result<Arc<Vec<Arc<McpSession>>>> {
        {
            let sessions = self.sessions.lock().await;
            if let Some(cached) = sessions.get(model) {
                return Ok(cached.clone());
            }
        }

        let mut resolved: Vec<Arc<McpSession>> = Vec::new();
        for (name, server) in remote {
            resolved.push(Arc::new(McpSession::Remote(RemoteSession::new(
                name, server,
            ))));
        }
        for (name, server) in stdio {
            match StdioSession::start(name, server).await {
                Ok(session) => resolved.push(Arc::new(McpSession::Stdio(session))),
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "MCP stdio server failed to start");
                }
            }
        }

        let resolved = Arc::new(resolved);
        self.sessions
            .lock()
            .await
            .insert(model.to_string(), resolved.clone());
        Ok(resolved)
    }

    /// Drop cached sessions for a model (stdio children die with their
    /// handles).
    pub async fn invalidate(&self, model: &str) {
        self.sessions.lock().await.remove(model);
    }
}
