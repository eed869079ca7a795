//! Chat-completion provider used by RAG and agent modes.
//!
//! [`ChatModel`] is the seam; [`OpenAiCompatibleChat`] speaks the
//! `POST {base_url}/chat/completions` wire format with function tools, which
//! both OpenAI and Ollama (`/v1`) serve.
//!
//! | provider   | default base URL             | auth             |
//! |------------|------------------------------|------------------|
//! | `openai`   | `https://api.openai.com/v1`  | `OPENAI_API_KEY` |
//! | `ollama`   | `http://localhost:11434/v1`  | none             |
//! | `disabled` | –                            | –                |

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ReasoningConfig;
use crate::error::{ArielError, Result};

const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A function call requested by the model. `arguments` is the raw JSON
/// text the model produced; it is validated before any tool runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(Role::Assistant, content)
    }

    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: None,
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    /// Non-blank text content.
    pub fn text_content(&self) -> Option<&str> {
        self.content.as_deref().filter(|c| !c.trim().is_empty())
    }
}

/// A function the model may call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model_id(&self) -> &str;

    /// One completion turn. Returns the assistant message (text and/or tool
    /// calls).
    async fn chat(&self, messages: &[ChatMessage], tools: &[ToolSpec]) -> Result<ChatMessage>;
}

pub struct OpenAiCompatibleChat {
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    client: reqwest::Client,
    retry_base_delay: Duration,
}

impl OpenAiCompatibleChat {
    pub fn new(config: &ReasoningConfig) -> Result<Self> {
        let model = config.model_id.clone().ok_or_else(|| {
            ArielError::Configuration("reasoning.model_id must be specified".to_string())
        })?;

        let (default_url, api_key) = match config.provider.as_str() {
            "openai" => {
                let key = std::env::var("OPENAI_API_KEY").map_err(|_| {
                    ArielError::Configuration(
                        "OPENAI_API_KEY environment variable not set".to_string(),
                    )
                })?;
                ("https://api.openai.com/v1", Some(key))
            }
            "ollama" => ("http://localhost:11434/v1", None),
            other => {
                return Err(ArielError::Configuration(format!(
                    "Unknown reasoning provider: {}",
                    other
                )))
            }
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            base_url: config
                .base_url
                .as_deref()
                .unwrap_or(default_url)
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model,
            temperature: config.temperature,
            client,
            retry_base_delay: Duration::from_secs(1),
        })
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    fn request_body(&self, messages: &[ChatMessage], tools: &[ToolSpec]) -> Value {
        let messages: Vec<Value> = messages.iter().map(message_to_wire).collect();
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
        });
        if !tools.is_empty() {
            body["tools"] = tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
        }
        body
    }
}

fn message_to_wire(message: &ChatMessage) -> Value {
    let mut wire = json!({
        "role": message.role,
        "content": message.content,
    });
    if !message.tool_calls.is_empty() {
        wire["tool_calls"] = message
            .tool_calls
            .iter()
            .map(|c| {
                json!({
                    "id": c.id,
                    "type": "function",
                    "function": { "name": c.name, "arguments": c.arguments },
                })
            })
            .collect();
    }
    if let Some(id) = &message.tool_call_id {
        wire["tool_call_id"] = json!(id);
    }
    wire
}

fn parse_chat_response(json: &Value) -> Result<ChatMessage> {
    let message = json
        .pointer("/choices/0/message")
        .ok_or_else(|| ArielError::Reasoning("Invalid chat response: missing choices[0].message".to_string()))?;

    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .map(str::to_string);

    let mut tool_calls = Vec::new();
    if let Some(calls) = message.get("tool_calls").and_then(|c| c.as_array()) {
        for (i, call) in calls.iter().enumerate() {
            let function = call.get("function").ok_or_else(|| {
                ArielError::Reasoning("Invalid chat response: tool call without function".to_string())
            })?;
            let name = function
                .get("name")
                .and_then(|n| n.as_str())
                .ok_or_else(|| ArielError::Reasoning("Invalid chat response: tool call without name".to_string()))?;
            // Some servers return arguments as an object rather than a string.
            let arguments = match function.get("arguments") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => "{}".to_string(),
            };
            let id = call
                .get("id")
                .and_then(|i| i.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("call_{}", i));
            tool_calls.push(ToolCall {
                id,
                name: name.to_string(),
                arguments,
            });
        }
    }

    Ok(ChatMessage {
        role: Role::Assistant,
        content,
        tool_calls,
        tool_call_id: None,
    })
}

#[async_trait]
impl ChatModel for OpenAiCompatibleChat {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn chat(&self, messages: &[ChatMessage], tools: &[ToolSpec]) -> Result<ChatMessage> {
        let body = self.request_body(messages, tools);
        let url = format!("{}/chat/completions", self.base_url);
        let mut last_err = None;

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(self.retry_base_delay * (1u32 << (attempt - 1))).await;
            }

            let mut request = self.client.post(&url).json(&body);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: Value = response.json().await?;
                        return parse_chat_response(&json);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let err = ArielError::Reasoning(format!(
                        "chat API error {}: {}",
                        status, body_text
                    ));
                    if status.as_u16() == 429 || status.is_server_error() {
                        tracing::warn!(attempt, %status, "chat request failed, retrying");
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "chat connection error");
                    last_err = Some(ArielError::Reasoning(format!(
                        "connection error (is the reasoning server running at {}?): {}",
                        self.base_url, e
                    )));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| ArielError::Reasoning("chat failed after retries".to_string())))
    }
}

/// The configured chat model, or `None` when `reasoning.provider = "disabled"`.
pub fn create_chat_model(config: &ReasoningConfig) -> Result<Option<Arc<dyn ChatModel>>> {
    if !config.is_enabled() {
        return Ok(None);
    }
    Ok(Some(Arc::new(OpenAiCompatibleChat::new(config)?)))
}
