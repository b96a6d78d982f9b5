use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use engram_core::types::ProviderKind;

use crate::provider::{LlmProvider, ProviderError};
use crate::types::{ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, Role};

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "llama3.2";

/// Local-model transport speaking the Ollama native API. No credentials.
pub struct OllamaTransport {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaTransport {
    pub fn new(
        base_url: Option<String>,
        model: Option<String>,
        timeout: std::time::Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        }
    }
}

#[async_trait]
impl LlmProvider for OllamaTransport {
    fn name(&self) -> &str {
        "ollama"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = build_request_body(req);
        let url = format!("{}/api/chat", self.base_url);

        debug!(model = %req.model, "sending request to Ollama");

        let resp = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "Ollama API error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        let api_resp: ChatApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        Ok(parse_response(api_resp))
    }

    async fn embed(&self, req: &EmbeddingRequest) -> Result<EmbeddingResponse, ProviderError> {
        let body = serde_json::json!({
            "model": req.model,
            "input": req.input,
        });
        let url = format!("{}/api/embed", self.base_url);

        debug!(model = %req.model, inputs = req.input.len(), "sending embedding request to Ollama");

        let resp = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "Ollama embeddings API error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        let api_resp: EmbedApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        Ok(EmbeddingResponse {
            model: api_resp.model,
            embeddings: api_resp.embeddings,
            tokens_in: api_resp.prompt_eval_count.unwrap_or(0),
        })
    }

    /// Health = `GET /api/tags`, falling back to `/api/version` for older
    /// servers that predate the tags endpoint.
    async fn probe(&self) -> bool {
        let tags = format!("{}/api/tags", self.base_url);
        if let Ok(resp) = self.client.get(&tags).send().await {
            if resp.status().is_success() {
                return true;
            }
        }
        let version = format!("{}/api/version", self.base_url);
        self.client
            .get(&version)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

fn build_request_body(req: &ChatRequest) -> serde_json::Value {
    // Ollama accepts system messages inline; function downgrades to assistant.
    let messages: Vec<serde_json::Value> = req
        .messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant | Role::Function => "assistant",
            };
            serde_json::json!({
                "role": role,
                "content": m.content,
            })
        })
        .collect();

    let mut options = serde_json::Map::new();
    if let Some(m) = req.max_tokens {
        options.insert("num_predict".to_string(), serde_json::json!(m));
    }
    if let Some(t) = req.temperature {
        options.insert("temperature".to_string(), serde_json::json!(t));
    }
    if let Some(p) = req.top_p {
        options.insert("top_p".to_string(), serde_json::json!(p));
    }

    serde_json::json!({
        "model": req.model,
        "messages": messages,
        "stream": false,
        "options": options,
    })
}

fn parse_response(resp: ChatApiResponse) -> ChatResponse {
    let stop_reason = if resp.done {
        Some(
            resp.done_reason
                .filter(|r| r == "length")
                .unwrap_or_else(|| "stop".to_string()),
        )
    } else {
        None
    };

    ChatResponse {
        content: resp.message.content,
        model: resp.model,
        tokens_in: resp.prompt_eval_count.unwrap_or(0),
        tokens_out: resp.eval_count.unwrap_or(0),
        stop_reason,
    }
}

// Ollama API response types (private — deserialization only)

#[derive(Deserialize)]
struct ChatApiResponse {
    model: String,
    message: OllamaMessage,
    done: bool,
    done_reason: Option<String>,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
}

#[derive(Deserialize)]
struct OllamaMessage {
    content: String,
}

#[derive(Deserialize)]
struct EmbedApiResponse {
    model: String,
    embeddings: Vec<Vec<f32>>,
    prompt_eval_count: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    #[test]
    fn request_body_keeps_system_inline() {
        let req = ChatRequest::new(
            "llama3.2",
            vec![Message::system("be brief"), Message::user("hi")],
        );
        let body = build_request_body(&req);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], serde_json::json!("system"));
        assert_eq!(body["stream"], serde_json::json!(false));
    }

    #[test]
    fn sampling_options_map_into_options_block() {
        let mut req = ChatRequest::new("llama3.2", vec![Message::user("hi")]);
        req.max_tokens = Some(64);
        req.temperature = Some(0.2);
        let body = build_request_body(&req);
        assert_eq!(body["options"]["num_predict"], serde_json::json!(64));
        assert_eq!(body["options"]["temperature"], serde_json::json!(0.2));
    }

    #[test]
    fn done_response_maps_to_stop() {
        let parsed: ChatApiResponse = serde_json::from_value(serde_json::json!({
            "model": "llama3.2",
            "message": {"role": "assistant", "content": "hey"},
            "done": true,
            "prompt_eval_count": 5,
            "eval_count": 2
        }))
        .unwrap();
        let resp = parse_response(parsed);
        assert_eq!(resp.stop_reason.as_deref(), Some("stop"));
        assert_eq!(resp.tokens_in, 5);
    }
}
