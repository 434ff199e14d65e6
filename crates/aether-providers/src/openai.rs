// OpenAI-compatible chat completions provider

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use aether_core::{
    ChatMessage, ChatRequest, ChatRole, KernelError, LlmProvider, LlmReply, Result, ToolSpec,
};

use crate::{send_with_retries, REQUEST_TIMEOUT};

const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Provider for OpenAI and OpenAI-compatible chat APIs
#[derive(Clone)]
pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    api_url: String,
}

impl OpenAiProvider {
    /// Create a provider with the given API key
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        Self::with_base_url(api_key, DEFAULT_API_URL)
    }

    /// Create a provider against a custom OpenAI-compatible endpoint
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

    fn convert_role(role: ChatRole) -> &'static str {
        match role {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            // Tool turns carry plain observation text, not tool_call_id
            // bookkeeping, so they travel as user turns.
            ChatRole::Tool => "user",
        }
    }

    fn convert_messages(messages: &[ChatMessage]) -> Vec<WireMessage> {
        messages
            .iter()
            .map(|msg| WireMessage {
                role: Self::convert_role(msg.role).to_string(),
                content: msg.content.clone(),
            })
            .collect()
    }

    fn convert_tools(tools: &[ToolSpec]) -> Vec<WireTool> {
        tools
            .iter()
            .map(|tool| WireTool {
                r#type: "function".to_string(),
                function: WireFunction {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.parameters.clone(),
                },
            })
            .collect()
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn chat(&self, request: ChatRequest, cancel: &CancellationToken) -> Result<LlmReply> {
        let body = WireRequest {
            model: request.model.clone(),
            messages: Self::convert_messages(&request.messages),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
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
                    .bearer_auth(&self.api_key)
                    .json(&body)
            },
            cancel,
        )
        .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(KernelError::llm(format!("openai {status}: {detail}")));
        }

        let parsed: WireResponse = response
            .json()
            .await
            .map_err(|e| KernelError::llm(format!("openai response decode: {e}")))?;
        reply_from_response(parsed)
    }
}

fn reply_from_response(response: WireResponse) -> Result<LlmReply> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| KernelError::llm("openai returned no choices"))?;
    let message = choice.message;

    if let Some(call) = message.tool_calls.and_then(|calls| calls.into_iter().next()) {
        let arguments: Value = serde_json::from_str(&call.function.arguments)
            .unwrap_or(Value::Object(Default::default()));
        return Ok(LlmReply::ToolCall {
            name: call.function.name,
            arguments,
            reasoning: message.content.filter(|c| !c.is_empty()),
        });
    }
    Ok(LlmReply::Text(message.content.unwrap_or_default()))
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
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
    r#type: String,
    function: WireFunction,
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    function: WireFunctionCall,
}

#[derive(Debug, Deserialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_call_response_is_decoded() {
        let raw = json!({
            "choices": [{
                "message": {
                    "content": "I will list the files",
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {
                            "name": "list_files",
                            "arguments": "{\"path\": \".\"}"
                        }
                    }]
                }
            }]
        });
        let response: WireResponse = serde_json::from_value(raw).unwrap();
        match reply_from_response(response).unwrap() {
            LlmReply::ToolCall {
                name,
                arguments,
                reasoning,
            } => {
                assert_eq!(name, "list_files");
                assert_eq!(arguments, json!({"path": "."}));
                assert_eq!(reasoning.as_deref(), Some("I will list the files"));
            }
            LlmReply::Text(_) => panic!("expected tool call"),
        }
    }

    #[test]
    fn text_response_is_decoded() {
        let raw = json!({
            "choices": [{"message": {"content": "plain answer"}}]
        });
        let response: WireResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(
            reply_from_response(response).unwrap(),
            LlmReply::Text("plain answer".to_string())
        );
    }

    #[test]
    fn malformed_tool_arguments_degrade_to_empty_object() {
        let raw = json!({
            "choices": [{
                "message": {
                    "tool_calls": [{
                        "function": {"name": "think", "arguments": "not json"}
                    }]
                }
            }]
        });
        let response: WireResponse = serde_json::from_value(raw).unwrap();
        match reply_from_response(response).unwrap() {
            LlmReply::ToolCall { arguments, .. } => assert_eq!(arguments, json!({})),
            LlmReply::Text(_) => panic!("expected tool call"),
        }
    }

    #[test]
    fn empty_choices_is_an_error() {
        let response: WireResponse = serde_json::from_value(json!({"choices": []})).unwrap();
        assert!(reply_from_response(response).is_err());
    }
}
