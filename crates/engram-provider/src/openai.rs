use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use engram_core::types::ProviderKind;

use crate::provider::{LlmProvider, ProviderError};
use crate::types::{ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// OpenAI-compatible transport. Also covers every endpoint that mirrors the
/// chat-completions wire format (local gateways, hosted clones) via
/// `base_url` override.
pub struct OpenAiTransport {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiTransport {
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
impl LlmProvider for OpenAiTransport {
    fn name(&self) -> &str {
        "openai"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = build_chat_body(req);
        let url = format!("{}/chat/completions", self.base_url);

        debug!(model = %req.model, "sending request to OpenAI");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
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
            warn!(status, body = %text, "OpenAI API error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        let api_resp: ChatApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        parse_chat_response(api_resp)
    }

    async fn embed(&self, req: &EmbeddingRequest) -> Result<EmbeddingResponse, ProviderError> {
        let mut body = serde_json::json!({
            "model": req.model,
            "input": req.input,
        });
        if let Some(ref fmt) = req.encoding_format {
            body["encoding_format"] = serde_json::json!(fmt);
        }
        if let Some(dims) = req.dimensions {
            body["dimensions"] = serde_json::json!(dims);
        }

        let url = format!("{}/embeddings", self.base_url);
        debug!(model = %req.model, inputs = req.input.len(), "sending embedding request to OpenAI");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "OpenAI embeddings API error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        let api_resp: EmbeddingApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        let mut data = api_resp.data;
        // The API may return out of order; index is authoritative.
        data.sort_by_key(|d| d.index);

        Ok(EmbeddingResponse {
            model: api_resp.model,
            embeddings: data.into_iter().map(|d| d.embedding).collect(),
            tokens_in: api_resp.usage.map(|u| u.prompt_tokens).unwrap_or(0),
        })
    }

    async fn probe(&self) -> bool {
        // Any HTTP answer counts as alive; only network failure is "down".
        let url = format!("{}/models", self.base_url);
        self.client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .is_ok()
    }
}

fn build_chat_body(req: &ChatRequest) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = req
        .messages
        .iter()
        .map(|m| {
            serde_json::json!({
                "role": m.role.as_str(),
                "content": m.content,
            })
        })
        .collect();

    let mut body = serde_json::json!({
        "model": req.model,
        "messages": messages,
        "stream": false,
    });
    if let Some(t) = req.temperature {
        body["temperature"] = serde_json::json!(t);
    }
    if let Some(m) = req.max_tokens {
        body["max_tokens"] = serde_json::json!(m);
    }
    if let Some(p) = req.top_p {
        body["top_p"] = serde_json::json!(p);
    }
    body
}

fn parse_chat_response(resp: ChatApiResponse) -> Result<ChatResponse, ProviderError> {
    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Parse("response contained no choices".to_string()))?;

    Ok(ChatResponse {
        content: choice.message.content.unwrap_or_default(),
        model: resp.model,
        tokens_in: resp.usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0),
        tokens_out: resp
            .usage
            .as_ref()
            .and_then(|u| u.completion_tokens)
            .unwrap_or(0),
        stop_reason: choice.finish_reason,
    })
}

// OpenAI API response types (private — deserialization only)

#[derive(Deserialize)]
struct ChatApiResponse {
    model: String,
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct EmbeddingApiResponse {
    model: String,
    data: Vec<EmbeddingDatum>,
    usage: Option<EmbeddingUsage>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct EmbeddingUsage {
    prompt_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    #[test]
    fn chat_body_includes_only_set_sampling_fields() {
        let mut req = ChatRequest::new("gpt-4o-mini", vec![Message::user("hi")]);
        req.temperature = Some(0.1);
        let body = build_chat_body(&req);
        assert_eq!(body["temperature"], serde_json::json!(0.1));
        assert!(body.get("top_p").is_none());
        assert_eq!(body["stream"], serde_json::json!(false));
    }

    #[test]
    fn chat_response_parses_usage_and_finish_reason() {
        let raw = serde_json::json!({
            "model": "gpt-4o-mini",
            "choices": [{
                "message": {"role": "assistant", "content": "hello"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3}
        });
        let parsed: ChatApiResponse = serde_json::from_value(raw).unwrap();
        let resp = parse_chat_response(parsed).unwrap();
        assert_eq!(resp.content, "hello");
        assert_eq!(resp.tokens_in, 12);
        assert_eq!(resp.tokens_out, 3);
        assert_eq!(resp.stop_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn empty_choices_is_a_parse_error() {
        let parsed: ChatApiResponse = serde_json::from_value(serde_json::json!({
            "model": "m", "choices": [], "usage": null
        }))
        .unwrap();
        assert!(matches!(
            parse_chat_response(parsed),
            Err(ProviderError::Parse(_))
        ));
    }
}
