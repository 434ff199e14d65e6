// LLM provider abstraction
//
// A provider turns a chat history plus a tool catalog into the next action.
// Implementations handle provider-specific APIs, timeouts, and retry; the
// kernel only sees LlmReply. Providers must honor the cancellation token
// promptly so a kill can interrupt an in-flight call.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{KernelError, Result};

/// Message role in a chat history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One turn of chat history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: content.into(),
        }
    }

    /// Rough token estimate used by the compaction budget
    pub fn estimated_tokens(&self) -> usize {
        self.content.len() / 4
    }
}

/// Tool advertised to the provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// A request to the provider
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: Vec::new(),
            temperature: None,
            max_tokens: None,
        }
    }

    /// Total estimated tokens across the history
    pub fn estimated_tokens(&self) -> usize {
        self.messages.iter().map(ChatMessage::estimated_tokens).sum()
    }
}

/// What the provider decided to do next
#[derive(Debug, Clone, PartialEq)]
pub enum LlmReply {
    /// A structured tool call
    ToolCall {
        name: String,
        arguments: Value,
        reasoning: Option<String>,
    },
    /// Free text, to be parsed or wrapped into a `think`
    Text(String),
}

/// Trait for LLM providers
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name for logging and routing
    fn name(&self) -> &str;

    /// Produce the next reply for the given history.
    ///
    /// Implementations retry transient failures internally and return an
    /// error only once the retry budget is exhausted or the token fires.
    async fn chat(&self, request: ChatRequest, cancel: &CancellationToken) -> Result<LlmReply>;
}

/// Attempt to interpret a free-text reply as a JSON tool call.
///
/// Providers without native tool calling answer with text; when that text is
/// (or contains) a `{"tool": ..., "args": ..., "reasoning": ...}` object it
/// is promoted to a structured call. Anything else stays text and the loop
/// synthesizes a `think`.
pub fn parse_text_reply(text: &str) -> LlmReply {
    let candidate = text.trim();
    let parsed: Option<Value> = serde_json::from_str(candidate).ok().or_else(|| {
        // Tolerate prose around a single JSON object
        let start = candidate.find('{')?;
        let end = candidate.rfind('}')?;
        serde_json::from_str(&candidate[start..=end]).ok()
    });

    if let Some(Value::Object(map)) = parsed {
        if let Some(tool) = map.get("tool").and_then(Value::as_str) {
            let arguments = map.get("args").cloned().unwrap_or_else(|| Value::Object(Default::default()));
            let reasoning = map
                .get("reasoning")
                .and_then(Value::as_str)
                .map(str::to_string);
            return LlmReply::ToolCall {
                name: tool.to_string(),
                arguments,
                reasoning,
            };
        }
    }
    LlmReply::Text(text.to_string())
}

/// Wrapper that pins every request to one model.
///
/// Used to derive the cheap summarization provider from the primary HTTP
/// provider without a second client.
pub struct FixedModel {
    inner: Arc<dyn LlmProvider>,
    model: String,
}

impl FixedModel {
    pub fn new(inner: Arc<dyn LlmProvider>, model: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            model: model.into(),
        })
    }
}

#[async_trait]
impl LlmProvider for FixedModel {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn chat(&self, mut request: ChatRequest, cancel: &CancellationToken) -> Result<LlmReply> {
        request.model = self.model.clone();
        self.inner.chat(request, cancel).await
    }
}

/// Scripted provider for tests and the `sim` provider mode.
///
/// Returns queued replies in order; once the queue is empty it falls back to
/// a `complete` call so loops always terminate.
#[derive(Default)]
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<LlmReply>>,
    calls: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a reply
    pub async fn push(&self, reply: LlmReply) {
        self.replies.lock().await.push_back(reply);
    }

    /// Queue a tool call reply
    pub async fn push_tool(&self, name: &str, arguments: Value) {
        self.push(LlmReply::ToolCall {
            name: name.to_string(),
            arguments,
            reasoning: Some(format!("calling {name}")),
        })
        .await;
    }

    /// Histories this provider was called with
    pub async fn calls(&self) -> Vec<ChatRequest> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, request: ChatRequest, cancel: &CancellationToken) -> Result<LlmReply> {
        if cancel.is_cancelled() {
            return Err(KernelError::Cancelled);
        }
        self.calls.lock().await.push(request);
        Ok(self.replies.lock().await.pop_front().unwrap_or_else(|| {
            LlmReply::ToolCall {
                name: "complete".to_string(),
                arguments: serde_json::json!({"summary": "scripted run finished"}),
                reasoning: None,
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_bare_json_tool_call() {
        let reply = parse_text_reply(r#"{"tool": "think", "args": {"thought": "hm"}, "reasoning": "r"}"#);
        match reply {
            LlmReply::ToolCall {
                name,
                arguments,
                reasoning,
            } => {
                assert_eq!(name, "think");
                assert_eq!(arguments, json!({"thought": "hm"}));
                assert_eq!(reasoning.as_deref(), Some("r"));
            }
            LlmReply::Text(_) => panic!("expected tool call"),
        }
    }

    #[test]
    fn parses_json_embedded_in_prose() {
        let reply = parse_text_reply("Sure, I will do:\n{\"tool\": \"list_files\", \"args\": {\"path\": \".\"}}\nthanks");
        assert!(matches!(reply, LlmReply::ToolCall { ref name, .. } if name == "list_files"));
    }

    #[test]
    fn plain_text_stays_text() {
        let reply = parse_text_reply("I am not sure what to do next.");
        assert!(matches!(reply, LlmReply::Text(_)));
        // JSON without a "tool" key is also plain text
        let reply = parse_text_reply(r#"{"answer": 42}"#);
        assert!(matches!(reply, LlmReply::Text(_)));
    }

    #[tokio::test]
    async fn scripted_provider_falls_back_to_complete() {
        let provider = ScriptedProvider::new();
        provider.push_tool("think", json!({"thought": "x"})).await;

        let cancel = CancellationToken::new();
        let request = ChatRequest::new("sim", vec![ChatMessage::user("go")]);

        let first = provider.chat(request.clone(), &cancel).await.unwrap();
        assert!(matches!(first, LlmReply::ToolCall { ref name, .. } if name == "think"));

        let second = provider.chat(request, &cancel).await.unwrap();
        assert!(matches!(second, LlmReply::ToolCall { ref name, .. } if name == "complete"));
        assert_eq!(provider.calls().await.len(), 2);
    }
}
