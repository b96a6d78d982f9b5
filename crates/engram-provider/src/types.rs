use serde::{Deserialize, Serialize};

/// A single message in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Function,
}

impl Role {
    /// Wire spelling for OpenAI-style backends (all four roles pass through).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Function => "function",
        }
    }

    /// Unknown role strings default to `user`.
    pub fn parse_lenient(s: &str) -> Self {
        match s {
            "system" => Self::System,
            "assistant" => Self::Assistant,
            "function" => Self::Function,
            _ => Self::User,
        }
    }
}

/// Non-streaming chat request. The cache canonicalisation covers exactly
/// `messages` (role + content), `model`, `temperature`, `max_tokens`, `top_p`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
            top_p: None,
        }
    }

    /// Content of the last user-role message, if any. This is what the memory
    /// hook pairs with the reply.
    pub fn last_user_content(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}

/// Response from a chat completion (always fully materialised — streams are
/// out of scope).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    /// Normalised stop reason: "stop", "length", "tool_calls", or none when
    /// the backend reported something unmapped.
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    pub model: String,
    pub input: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub model: String,
    pub embeddings: Vec<Vec<f32>>,
    pub tokens_in: u32,
}

/// Who is issuing a call through the envelope.
///
/// `Internal` marks calls made by the memory-processing path itself (the
/// extractor). They bypass the request cache and never fire the memory hook —
/// the hard guard against recursive self-recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallScope {
    User,
    Internal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lenient_role_parsing_defaults_to_user() {
        assert_eq!(Role::parse_lenient("assistant"), Role::Assistant);
        assert_eq!(Role::parse_lenient("function"), Role::Function);
        assert_eq!(Role::parse_lenient("tool"), Role::User);
        assert_eq!(Role::parse_lenient(""), Role::User);
    }

    #[test]
    fn last_user_content_skips_trailing_assistant() {
        let req = ChatRequest::new(
            "m",
            vec![
                Message::user("first"),
                Message::assistant("reply"),
                Message::user("second"),
                Message::assistant("another"),
            ],
        );
        assert_eq!(req.last_user_content(), Some("second"));
    }
}
