//! Embedded LLM client and the tool-calling loop.
//!
//! Agent jobs talk to the gateway's own OpenAI-compatible surface over
//! loopback, so the whole model lifecycle (loading, eviction, templating)
//! applies to agent traffic the same way it does to external traffic.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use super::mcp::{McpSession, McpTool};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(content.to_string()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: &str, content: &str) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.to_string()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub call_type: String,
    pub function: ToolFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolFunction {
    pub name: String,
    /// JSON-encoded arguments, as the chat API ships them.
    pub arguments: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [Value]>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

/// Chat client against an OpenAI-compatible endpoint.
pub struct LlmClient {
    base_url: String,
    api_key: String,
    model: String,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(address: &str, api_key: &str, model: &str) -> Self {
        Self {
            base_url: format!("http://{}", address),
            api_key: api_key.to_string(),
            model: model.to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[Value]>,
    ) -> Result<ChatMessage> {
        let mut request = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&ChatRequest {
                model: &self.model,
                messages,
                tools,
            });
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Communication(format!(
                "chat completion failed: {}: {}",
                status, body
            )));
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| Error::Communication("chat response has no choices".to_string()))
    }
}

/// Observation hooks for the tool loop; every callback feeds the job log.
pub struct ToolLoopCallbacks<'a> {
    pub on_status: Box<dyn FnMut(&str) + Send + 'a>,
    pub on_reasoning: Box<dyn FnMut(&str) + Send + 'a>,
    pub on_tool_call: Box<dyn FnMut(&str, &Value) + Send + 'a>,
    pub on_tool_result: Box<dyn FnMut(&str, &str) + Send + 'a>,
}

/// Loop tuning, resolved from the model's agent settings.
#[derive(Debug, Clone, Copy)]
pub struct ToolLoopSettings {
    pub max_iterations: u32,
    pub max_attempts: u32,
    pub enable_reasoning: bool,
    pub enable_re_evaluation: bool,
}

impl Default for ToolLoopSettings {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            max_attempts: 3,
            enable_reasoning: false,
            enable_re_evaluation: false,
        }
    }
}

struct NamedTool {
    session: Arc<McpSession>,
    tool: McpTool,
}

/// Run the tool loop: present every session tool to the model, execute the
/// calls it makes, feed results back, and finish with a plain ask for the
/// final reply.
pub async fn run_tool_loop(
    llm: &LlmClient,
    sessions: &[Arc<McpSession>],
    prompt: &str,
    settings: ToolLoopSettings,
    callbacks: &mut ToolLoopCallbacks<'_>,
) -> Result<String> {
    let mut catalog: Vec<NamedTool> = Vec::new();
    for session in sessions {
        match session.list_tools().await {
            Ok(tools) => {
                for tool in tools {
                    catalog.push(NamedTool {
                        session: session.clone(),
                        tool,
                    });
                }
            }
            Err(e) => {
                tracing::warn!(session = %session.name(), error = %e, "could not list tools");
            }
        }
    }
    if catalog.is_empty() {
        return Err(Error::Communication(
            "no working MCP servers found".to_string(),
        ));
    }

    let tool_specs: Vec<Value> = catalog
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.tool.name,
                    "description": t.tool.description,
                    "parameters": t.tool.input_schema,
                }
            })
        })
        .collect();

    let mut messages = vec![ChatMessage::user(prompt)];

    for iteration in 0..settings.max_iterations.max(1) {
        (callbacks.on_status)(&format!("iteration {}", iteration + 1));

        let reply = llm.chat(&messages, Some(&tool_specs)).await?;

        let tool_calls = reply.tool_calls.clone().unwrap_or_default();
        if tool_calls.is_empty() {
            // The model is done selecting tools.
            if settings.enable_re_evaluation && iteration == 0 {
                // One more round with the tools on the table before
                // accepting a tool-free answer.
                messages.push(reply);
                continue;
            }
            break;
        }

        if settings.enable_reasoning {
            if let Some(content) = reply.content.as_deref() {
                if !content.is_empty() {
                    (callbacks.on_reasoning)(content);
                }
            }
        }

        messages.push(reply.clone());
        for call in tool_calls {
            let arguments: Value =
                serde_json::from_str(&call.function.arguments).unwrap_or(json!({}));
            (callbacks.on_tool_call)(&call.function.name, &arguments);

            let result =
                execute_tool(&catalog, &call.function.name, &arguments, settings.max_attempts)
                    .await;
            let text = match result {
                Ok(text) => text,
                Err(e) => format!("tool error: {}", e),
            };
            (callbacks.on_tool_result)(&call.function.name, &text);

            let id = if call.id.is_empty() {
                call.function.name.clone()
            } else {
                call.id.clone()
            };
            messages.push(ChatMessage::tool_result(&id, &text));
        }
    }

    // Final ask without tools to obtain the assistant reply.
    (callbacks.on_status)("composing final answer");
    let final_reply = llm.chat(&messages, None).await?;
    Ok(final_reply.content.unwrap_or_default())
}

async fn execute_tool(
    catalog: &[NamedTool],
    name: &str,
    arguments: &Value,
    max_attempts: u32,
) -> Result<String> {
    let entry = catalog
        .iter()
        .find(|t| t.tool.name == name)
        .ok_or_else(|| Error::NotFound(format!("no tool named {}", name)))?;

    let mut last_error = None;
    for _ in 0..max_attempts.max(1) {
        match entry.session.call_tool(name, arguments.clone()).await {
            Ok(text) => return Ok(text),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| Error::Internal("tool call failed".to_string())))
}
