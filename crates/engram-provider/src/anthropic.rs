use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use engram_core::types::ProviderKind;

use crate::provider::{LlmProvider, ProviderError};
use crate::types::{ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, Role};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-6";
const API_VERSION: &str = "2023-06-01";
/// Anthropic requires max_tokens; applied when the caller leaves it unset.
const FALLBACK_MAX_TOKENS: u32 = 1024;

/// Anthropic-native transport. System messages are lifted into the top-level
/// `system` field; `function` messages downgrade to `assistant`.
pub struct AnthropicTransport {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl AnthropicTransport {
    pub fn new(
        api_key: String,
        base_url: Option<String>,
        model: Option<String>,
        timeout: std::time::Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicTransport {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = build_request_body(req);
        let url = format!("{}/messages", self.base_url);

        debug!(model = %req.model, "sending request to Anthropic");

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;

        let status = resp.status().as_u16();
        if status == 429 {
            let retry = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|s| s * 1000)
                .unwrap_or(5000);
            return Err(ProviderError::RateLimited {
                retry_after_ms: retry,
            });
        }

        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "Anthropic API error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        Ok(parse_response(api_resp))
    }

    async fn embed(&self, _req: &EmbeddingRequest) -> Result<EmbeddingResponse, ProviderError> {
        Err(ProviderError::Unsupported(
            "Anthropic does not expose an embeddings endpoint".to_string(),
        ))
    }

    async fn probe(&self) -> bool {
        // No unauthenticated health endpoint; reachability is the signal.
        let url = format!("{}/models", self.base_url);
        self.client
            .get(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .send()
            .await
            .is_ok()
    }
}

/// Split the message list into the top-level `system` text and the remaining
/// turn messages with Anthropic-legal roles.
fn build_request_body(req: &ChatRequest) -> serde_json::Value {
    let mut system_parts: Vec<&str> = Vec::new();
    let mut messages: Vec<serde_json::Value> = Vec::new();

    for m in &req.messages {
        match m.role {
            Role::System => system_parts.push(&m.content),
            Role::User => messages.push(serde_json::json!({
                "role": "user",
                "content": m.content,
            })),
            // Anthropic only knows user/assistant turns.
            Role::Assistant | Role::Function => messages.push(serde_json::json!({
                "role": "assistant",
                "content": m.content,
            })),
        }
    }

    let mut body = serde_json::json!({
        "model": req.model,
        "max_tokens": req.max_tokens.unwrap_or(FALLBACK_MAX_TOKENS),
        "messages": messages,
        "stream": false,
    });

    if !system_parts.is_empty() {
        body["system"] = serde_json::json!(system_parts.join("\n\n"));
    }
    if let Some(t) = req.temperature {
        body["temperature"] = serde_json::json!(t);
    }
    if let Some(p) = req.top_p {
        body["top_p"] = serde_json::json!(p);
    }

    body
}

fn parse_response(resp: ApiResponse) -> ChatResponse {
    let mut text_parts: Vec<String> = Vec::new();
    for block in resp.content {
        if let ContentBlock::Text { text } = block {
            text_parts.push(text);
        }
    }

    ChatResponse {
        content: text_parts.join(""),
        model: resp.model,
        tokens_in: resp.usage.input_tokens,
        tokens_out: resp.usage.output_tokens,
        stop_reason: map_stop_reason(resp.stop_reason.as_deref()),
    }
}

/// Normalise Anthropic stop reasons to the shared vocabulary.
fn map_stop_reason(reason: Option<&str>) -> Option<String> {
    match reason {
        Some("end_turn") | Some("stop_sequence") => Some("stop".to_string()),
        Some("max_tokens") => Some("length".to_string()),
        Some("tool_use") => Some("tool_calls".to_string()),
        _ => None,
    }
}

// Anthropic API response types (private — deserialization only)

#[derive(Deserialize)]
struct ApiResponse {
    model: String,
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Usage,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    #[test]
    fn system_messages_are_lifted_to_top_level() {
        let req = ChatRequest::new(
            "claude-sonnet-4-6",
            vec![
                Message::system("you are terse"),
                Message::user("hi"),
                Message {
                    role: Role::Function,
                    content: "result: 42".into(),
                },
            ],
        );
        let body = build_request_body(&req);
        assert_eq!(body["system"], serde_json::json!("you are terse"));
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        // function downgrades to assistant
        assert_eq!(messages[1]["role"], serde_json::json!("assistant"));
    }

    #[test]
    fn multiple_system_messages_concatenate() {
        let req = ChatRequest::new(
            "m",
            vec![
                Message::system("a"),
                Message::system("b"),
                Message::user("q"),
            ],
        );
        let body = build_request_body(&req);
        assert_eq!(body["system"], serde_json::json!("a\n\nb"));
    }

    #[test]
    fn stop_reason_mapping_table() {
        assert_eq!(map_stop_reason(Some("end_turn")).as_deref(), Some("stop"));
        assert_eq!(
            map_stop_reason(Some("stop_sequence")).as_deref(),
            Some("stop")
        );
        assert_eq!(map_stop_reason(Some("max_tokens")).as_deref(), Some("length"));
        assert_eq!(
            map_stop_reason(Some("tool_use")).as_deref(),
            Some("tool_calls")
        );
        assert_eq!(map_stop_reason(Some("pause_turn")), None);
        assert_eq!(map_stop_reason(None), None);
    }

    #[test]
    fn text_blocks_concatenate_and_unknown_blocks_drop() {
        let raw = serde_json::json!({
            "model": "claude-sonnet-4-6",
            "content": [
                {"type": "text", "text": "Hello, "},
                {"type": "thinking", "thinking": "hmm"},
                {"type": "text", "text": "world"}
            ],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 10, "output_tokens": 4}
        });
        let parsed: ApiResponse = serde_json::from_value(raw).unwrap();
        let resp = parse_response(parsed);
        assert_eq!(resp.content, "Hello, world");
        assert_eq!(resp.stop_reason.as_deref(), Some("stop"));
        assert_eq!(resp.tokens_in, 10);
    }
}
