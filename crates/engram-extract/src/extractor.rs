use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use engram_core::types::{Classification, Importance, MemoryRecord};
use engram_provider::{CallScope, ChatRequest, Message, ProviderEnvelope, ProviderError};

use crate::prompt;

/// Sampling settings for the extraction call.
const EXTRACTION_TEMPERATURE: f64 = 0.1;
const EXTRACTION_MAX_TOKENS: u32 = 1000;
/// Summary hard cap; anything longer fails schema validation.
const MAX_SUMMARY_CHARS: usize = 200;
/// Fallback summaries take this many characters of the user input.
const FALLBACK_SUMMARY_CHARS: usize = 100;

/// Optional context the caller can supply to sharpen extraction.
#[derive(Debug, Clone, Default)]
pub struct ConversationContext {
    pub user_preferences: Vec<String>,
    pub current_projects: Vec<String>,
    pub relevant_skills: Vec<String>,
}

/// One conversation exchange to distil.
#[derive(Debug, Clone)]
pub struct ConversationInput {
    pub chat_id: String,
    pub namespace: String,
    pub user_input: String,
    pub ai_output: String,
    pub context: ConversationContext,
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("malformed extraction payload: {0}")]
    Parse(String),

    #[error("schema violation: {0}")]
    Schema(String),
}

/// Distils conversation exchanges into memory records with a secondary LLM
/// call. Never fails: any error on the happy path degrades to the fallback
/// record so recording is never fatal to the conversation itself.
pub struct MemoryExtractor {
    envelope: Arc<ProviderEnvelope>,
    model: String,
}

impl MemoryExtractor {
    pub fn new(envelope: Arc<ProviderEnvelope>) -> Self {
        let model = envelope.model();
        Self { envelope, model }
    }

    /// Project a conversation into a validated memory record, or the fallback
    /// shape when the model misbehaves.
    pub async fn process_conversation(&self, input: &ConversationInput) -> MemoryRecord {
        match self.try_extract(input).await {
            Ok(record) => record,
            Err(e) => {
                warn!(chat_id = %input.chat_id, error = %e, "extraction failed, using fallback record");
                fallback_record(input)
            }
        }
    }

    async fn try_extract(&self, input: &ConversationInput) -> Result<MemoryRecord, ExtractError> {
        let mut req = ChatRequest::new(
            self.model.clone(),
            vec![
                Message::system(prompt::SYSTEM_PREAMBLE),
                Message::user(prompt::user_turn(input)),
            ],
        );
        req.temperature = Some(EXTRACTION_TEMPERATURE);
        req.max_tokens = Some(EXTRACTION_MAX_TOKENS);

        // Internal scope: bypasses the cache and can never re-trigger
        // recording of its own exchange.
        let resp = self.envelope.chat(&req, CallScope::Internal).await?;
        debug!(chat_id = %input.chat_id, tokens_out = resp.tokens_out, "extraction response received");
        parse_extraction(&resp.content, input)
    }
}

/// Parse and validate the model's JSON payload into a memory record.
pub fn parse_extraction(
    raw: &str,
    input: &ConversationInput,
) -> Result<MemoryRecord, ExtractError> {
    let body = strip_fences(raw);
    let payload: ExtractionPayload =
        serde_json::from_str(body).map_err(|e| ExtractError::Parse(e.to_string()))?;

    let classification: Classification = payload
        .classification
        .to_lowercase()
        .parse()
        .map_err(ExtractError::Schema)?;
    let importance: Importance = payload
        .importance
        .to_lowercase()
        .parse()
        .map_err(ExtractError::Schema)?;

    if !(0.0..=1.0).contains(&payload.confidence_score) {
        return Err(ExtractError::Schema(format!(
            "confidenceScore out of range: {}",
            payload.confidence_score
        )));
    }
    if payload.summary.chars().count() > MAX_SUMMARY_CHARS {
        return Err(ExtractError::Schema(format!(
            "summary exceeds {MAX_SUMMARY_CHARS} characters"
        )));
    }

    Ok(MemoryRecord {
        id: Uuid::new_v4().to_string(),
        conversation_id: input.chat_id.clone(),
        namespace: input.namespace.clone(),
        content: payload.content,
        summary: payload.summary,
        classification,
        importance,
        importance_score: importance.score(),
        topic: payload.topic.filter(|t| !t.is_empty()),
        entities: payload.entities,
        keywords: payload.keywords,
        confidence_score: payload.confidence_score,
        classification_reason: payload.classification_reason,
        promotion_eligible: payload.promotion_eligible,
        extraction_timestamp: Utc::now(),
        conscious_processed: false,
        consolidated_into: None,
    })
}

/// The exact degraded shape used whenever extraction cannot produce a valid
/// record. Conversational/medium, confidence 0.5, no entities or keywords.
pub fn fallback_record(input: &ConversationInput) -> MemoryRecord {
    let summary: String = input
        .user_input
        .chars()
        .take(FALLBACK_SUMMARY_CHARS)
        .chain("...".chars())
        .collect();

    MemoryRecord {
        id: Uuid::new_v4().to_string(),
        conversation_id: input.chat_id.clone(),
        namespace: input.namespace.clone(),
        content: format!("{} {}", input.user_input, input.ai_output),
        summary,
        classification: Classification::Conversational,
        importance: Importance::Medium,
        importance_score: Importance::Medium.score(),
        topic: None,
        entities: Vec::new(),
        keywords: Vec::new(),
        confidence_score: 0.5,
        classification_reason: "Fallback processing due to error".to_string(),
        promotion_eligible: false,
        extraction_timestamp: Utc::now(),
        conscious_processed: false,
        consolidated_into: None,
    }
}

/// Strip surrounding ```json / ``` fences when the model ignores the
/// no-markdown instruction.
fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}

/// Raw payload as the model emits it. Missing arrays fill to empty.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtractionPayload {
    content: String,
    summary: String,
    classification: String,
    importance: String,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    entities: Vec<String>,
    #[serde(default)]
    keywords: Vec<String>,
    confidence_score: f64,
    #[serde(default)]
    classification_reason: String,
    #[serde(default)]
    promotion_eligible: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> ConversationInput {
        ConversationInput {
            chat_id: "chat-1".into(),
            namespace: "ns".into(),
            user_input: "My favorite color is blue.".into(),
            ai_output: "Noted, blue it is.".into(),
            context: ConversationContext::default(),
        }
    }

    fn valid_payload() -> String {
        serde_json::json!({
            "content": "The user's favorite color is blue.",
            "summary": "User prefers the color blue.",
            "classification": "Personal",
            "importance": "Medium",
            "topic": "preferences",
            "entities": ["blue"],
            "keywords": ["color", "favorite"],
            "confidenceScore": 0.92,
            "classificationReason": "A stated personal preference.",
            "promotionEligible": false
        })
        .to_string()
    }

    #[test]
    fn parses_valid_payload_and_injects_conversation_id() {
        let record = parse_extraction(&valid_payload(), &input()).unwrap();
        assert_eq!(record.conversation_id, "chat-1");
        assert_eq!(record.namespace, "ns");
        // mixed-case enum values are lower-cased before parsing
        assert_eq!(record.classification, Classification::Personal);
        assert_eq!(record.importance, Importance::Medium);
        assert_eq!(record.importance_score, 0.5);
        assert_eq!(record.entities, vec!["blue".to_string()]);
        assert!(!record.conscious_processed);
    }

    #[test]
    fn strips_json_fences() {
        let fenced = format!("```json\n{}\n```", valid_payload());
        assert!(parse_extraction(&fenced, &input()).is_ok());

        let bare_fence = format!("```\n{}\n```", valid_payload());
        assert!(parse_extraction(&bare_fence, &input()).is_ok());
    }

    #[test]
    fn missing_arrays_default_to_empty() {
        let payload = serde_json::json!({
            "content": "c",
            "summary": "s",
            "classification": "conversational",
            "importance": "low",
            "confidenceScore": 0.5
        })
        .to_string();
        let record = parse_extraction(&payload, &input()).unwrap();
        assert!(record.entities.is_empty());
        assert!(record.keywords.is_empty());
    }

    #[test]
    fn rejects_unknown_classification() {
        let payload = serde_json::json!({
            "content": "c",
            "summary": "s",
            "classification": "mystery",
            "importance": "low",
            "confidenceScore": 0.5
        })
        .to_string();
        assert!(matches!(
            parse_extraction(&payload, &input()),
            Err(ExtractError::Schema(_))
        ));
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        let payload = serde_json::json!({
            "content": "c",
            "summary": "s",
            "classification": "conversational",
            "importance": "low",
            "confidenceScore": 1.5
        })
        .to_string();
        assert!(matches!(
            parse_extraction(&payload, &input()),
            Err(ExtractError::Schema(_))
        ));
    }

    #[test]
    fn rejects_oversized_summary() {
        let payload = serde_json::json!({
            "content": "c",
            "summary": "s".repeat(201),
            "classification": "conversational",
            "importance": "low",
            "confidenceScore": 0.5
        })
        .to_string();
        assert!(matches!(
            parse_extraction(&payload, &input()),
            Err(ExtractError::Schema(_))
        ));
    }

    #[test]
    fn non_json_is_a_parse_error() {
        assert!(matches!(
            parse_extraction("not json at all", &input()),
            Err(ExtractError::Parse(_))
        ));
    }

    #[test]
    fn fallback_record_shape_is_exact() {
        let record = fallback_record(&input());
        assert_eq!(record.content, "My favorite color is blue. Noted, blue it is.");
        assert_eq!(record.summary, "My favorite color is blue....");
        assert_eq!(record.classification, Classification::Conversational);
        assert_eq!(record.importance, Importance::Medium);
        assert_eq!(record.importance_score, 0.5);
        assert_eq!(record.confidence_score, 0.5);
        assert_eq!(record.classification_reason, "Fallback processing due to error");
        assert!(!record.promotion_eligible);
        assert!(record.entities.is_empty());
        assert!(record.keywords.is_empty());
    }

    #[test]
    fn fallback_summary_truncates_long_input() {
        let mut long = input();
        long.user_input = "x".repeat(250);
        let record = fallback_record(&long);
        assert_eq!(record.summary.chars().count(), 103); // 100 chars + "..."
        assert!(record.summary.ends_with("..."));
    }
}
