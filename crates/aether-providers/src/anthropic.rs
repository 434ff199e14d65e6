// Anthropic messages provider

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use aether_core::{
    ChatMessage, ChatRequest, ChatRole, KernelError, LlmProvider, LlmReply, Result, ToolSpec,
};

use crate::{send_with_retries, REQUEST_TIMEOUT};

const DEFAULT_API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Provider for the Anthropic messages API
#[derive(Clone)]
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    api_url: String,
}

impl AnthropicProvider {
    /// Create a provider with the given API key
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        Self::with_base_url(api_key, DEFAULT_API_URL)
    }

    /// Create a provider against a custom endpoint (proxies, test servers)
    pub fn with_base_url(api_key: impl Into<String>, api_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| KernelError::llm(e.to_string()))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            api_url: api_url.into(),
        })
    }

    /// Split the history into the system prompt and alternating turns.
    /// Anthropic keeps the system prompt out of the messages array and has
    /// no tool role; observation turns travel as user content.
    fn convert_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<WireMessage>) {
        let mut system = None;
        let mut turns = Vec::new();
        for msg in messages {
            match msg.role {
                ChatRole::System => system = Some(msg.content.clone()),
                ChatRole::Assistant => turns.push(WireMessage {
                    role: "assistant".to_string(),
                    content: msg.content.clone(),
                }),
                ChatRole::User | ChatRole::Tool => turns.push(WireMessage {
                    role: "user".to_string(),
                    content: msg.content.clone(),
                }),
            }
        }
        (system, turns)
    }

    fn convert_tools(tools: &[ToolSpec]) -> Vec<WireTool> {
        tools
            .iter()
            .map(|tool| WireTool {
                name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema: tool.parameters.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn chat(&self, request: ChatRequest, cancel: &CancellationToken) -> Result<LlmReply> {
        let (system, messages) = Self::convert_messages(&request.messages);
        let body = WireRequest {
            model: request.model.clone(),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system,
            messages,
            temperature: request.temperature,
            tools: if request.tools.is_empty() {
                None
            } else {
                Some(Self::convert_tools(&request.tools))
            },
        };

        let response = send_with_retries(
            || {
                self.client
                    .post(&self.api_url)
                    .header("x-api-key", &self.api_key)
                    .header("anthropic-version", API_VERSION)
                    .json(&body)
            },
            cancel,
        )
        .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(KernelError::llm(format!("anthropic {status}: {detail}")));
        }

        let parsed: WireResponse = response
            .json()
            .await
            .map_err(|e| KernelError::llm(format!("anthropic response decode: {e}")))?;
        Ok(reply_from_response(parsed))
    }
}

fn reply_from_response(response: WireResponse) -> LlmReply {
    let mut text = String::new();
    for block in response.content {
        match block {
            WireBlock::Text { text: t } => text.push_str(&t),
            WireBlock::ToolUse { name, input } => {
                return LlmReply::ToolCall {
                    name,
                    arguments: input,
                    reasoning: if text.is_empty() { None } else { Some(text) },
                };
            }
        }
    }
    LlmReply::Text(text)
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    content: Vec<WireBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text { text: String },
    ToolUse { name: String, input: Value },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_use_block_becomes_tool_call() {
        let raw = json!({
            "content": [
                {"type": "text", "text": "Let me check the files."},
                {"type": "tool_use", "id": "tu_1", "name": "list_files", "input": {"path": "."}}
            ]
        });
        let response: WireResponse = serde_json::from_value(raw).unwrap();
        match reply_from_response(response) {
            LlmReply::ToolCall {
                name,
                arguments,
                reasoning,
            } => {
                assert_eq!(name, "list_files");
                assert_eq!(arguments, json!({"path": "."}));
                assert_eq!(reasoning.as_deref(), Some("Let me check the files."));
            }
            LlmReply::Text(_) => panic!("expected tool call"),
        }
    }

    #[test]
    fn text_only_blocks_concatenate() {
        let raw = json!({
            "content": [
                {"type": "text", "text": "part one "},
                {"type": "text", "text": "part two"}
            ]
        });
        let response: WireResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(
            reply_from_response(response),
            LlmReply::Text("part one part two".to_string())
        );
    }

    #[test]
    fn system_prompt_is_lifted_out_of_the_turns() {
        let messages = vec![
            ChatMessage::system("be helpful"),
            ChatMessage::user("hello"),
            ChatMessage::tool("[Observation] ok"),
        ];
        let (system, turns) = AnthropicProvider::convert_messages(&messages);
        assert_eq!(system.as_deref(), Some("be helpful"));
        assert_eq!(turns.len(), 2);
        assert!(turns.iter().all(|t| t.role == "user"));
    }
}
