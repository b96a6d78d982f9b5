use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a memory record is classified. Drives retrieval filtering and
/// eligibility for conscious promotion (`ConsciousInfo` only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Essential,
    Contextual,
    Conversational,
    Reference,
    Personal,
    #[serde(rename = "conscious-info")]
    ConsciousInfo,
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Essential => write!(f, "essential"),
            Self::Contextual => write!(f, "contextual"),
            Self::Conversational => write!(f, "conversational"),
            Self::Reference => write!(f, "reference"),
            Self::Personal => write!(f, "personal"),
            Self::ConsciousInfo => write!(f, "conscious-info"),
        }
    }
}

impl std::str::FromStr for Classification {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "essential" => Ok(Self::Essential),
            "contextual" => Ok(Self::Contextual),
            "conversational" => Ok(Self::Conversational),
            "reference" => Ok(Self::Reference),
            "personal" => Ok(Self::Personal),
            "conscious-info" | "conscious_info" => Ok(Self::ConsciousInfo),
            other => Err(format!("unknown classification: {other}")),
        }
    }
}

/// Importance tier of a memory record. The numeric score is fixed per tier —
/// search boosting and the short-term copies both rely on the exact ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    Low,
    Medium,
    High,
    Critical,
}

impl Importance {
    /// Fixed score ladder: low 0.3, medium 0.5, high 0.7, critical 0.9.
    pub fn score(&self) -> f64 {
        match self {
            Self::Low => 0.3,
            Self::Medium => 0.5,
            Self::High => 0.7,
            Self::Critical => 0.9,
        }
    }
}

impl std::fmt::Display for Importance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Importance {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown importance: {other}")),
        }
    }
}

/// Raw conversation unit — one (user input, AI output) pair persisted
/// verbatim. Immutable after insert; writes are idempotent on `chat_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub chat_id: String,
    pub session_id: String,
    pub namespace: String,
    pub user_input: String,
    pub ai_output: String,
    pub model_used: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Structured projection of a chat turn (or synthetic event) suitable for
/// retrieval. Serialises camelCase so the stored `processed_data` blob matches
/// the extraction payload shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRecord {
    pub id: String,
    /// FK to the originating chat turn.
    pub conversation_id: String,
    pub namespace: String,
    pub content: String,
    /// At most 200 characters — enforced at extraction and at store time.
    pub summary: String,
    pub classification: Classification,
    pub importance: Importance,
    /// Always `importance.score()`; persisted for direct SQL filtering.
    pub importance_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub confidence_score: f64,
    pub classification_reason: String,
    pub promotion_eligible: bool,
    pub extraction_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub conscious_processed: bool,
    /// Set on duplicates after consolidation — points at the surviving primary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consolidated_into: Option<String>,
}

impl MemoryRecord {
    /// Text body used for lexical search indexing.
    pub fn searchable_content(&self) -> String {
        let mut out = self.content.clone();
        if !self.summary.is_empty() {
            out.push(' ');
            out.push_str(&self.summary);
        }
        for kw in &self.keywords {
            out.push(' ');
            out.push_str(kw);
        }
        out
    }
}

/// Working-set copy of a memory record. Conscious copies carry
/// `is_permanent_context = true` and are never age-evicted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShortTermRecord {
    /// For conscious copies this aliases the source `MemoryRecord.id`.
    pub chat_id: String,
    pub processed_data: serde_json::Value,
    pub importance_score: f64,
    pub category_primary: String,
    pub retention_type: String,
    pub namespace: String,
    pub searchable_content: String,
    pub summary: String,
    pub is_permanent_context: bool,
    pub created_at: DateTime<Utc>,
}

/// Directed relationship between two memory records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationshipKind {
    Reference,
    Continuation,
    Contradiction,
    Elaboration,
    Supersedes,
}

impl std::fmt::Display for RelationshipKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reference => write!(f, "reference"),
            Self::Continuation => write!(f, "continuation"),
            Self::Contradiction => write!(f, "contradiction"),
            Self::Elaboration => write!(f, "elaboration"),
            Self::Supersedes => write!(f, "supersedes"),
        }
    }
}

impl std::str::FromStr for RelationshipKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reference" => Ok(Self::Reference),
            "continuation" => Ok(Self::Continuation),
            "contradiction" => Ok(Self::Contradiction),
            "elaboration" => Ok(Self::Elaboration),
            "supersedes" => Ok(Self::Supersedes),
            other => Err(format!("unknown relationship kind: {other}")),
        }
    }
}

/// Directed edge from a source memory record to a target.
/// Invariants: `source_id != target_id`; no `supersedes` cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRelationship {
    pub source_id: String,
    pub target_id: String,
    pub kind: RelationshipKind,
    /// 0.0–1.0 confidence in the relationship itself.
    pub confidence: f64,
    /// 0.0–1.0 strength of the association.
    pub strength: f64,
    pub reason: String,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub context: String,
}

/// Which discipline processes recorded conversations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestMode {
    /// Every turn is extracted synchronously with the write (detached task).
    Automatic,
    /// Turns are stored; the background loop extracts and promotes later.
    Conscious,
    /// Turns are stored only when the caller records them explicitly.
    Manual,
}

impl std::fmt::Display for IngestMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Automatic => write!(f, "automatic"),
            Self::Conscious => write!(f, "conscious"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

impl std::str::FromStr for IngestMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" | "automatic" => Ok(Self::Automatic),
            "conscious" => Ok(Self::Conscious),
            "manual" | "none" => Ok(Self::Manual),
            other => Err(format!("unknown ingest mode: {other}")),
        }
    }
}

/// Which wire format a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Ollama,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenAi => write!(f, "openai"),
            Self::Anthropic => write!(f, "anthropic"),
            Self::Ollama => write!(f, "ollama"),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "ollama" => Ok(Self::Ollama),
            other => Err(format!("unknown provider kind: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn importance_score_ladder() {
        assert_eq!(Importance::Low.score(), 0.3);
        assert_eq!(Importance::Medium.score(), 0.5);
        assert_eq!(Importance::High.score(), 0.7);
        assert_eq!(Importance::Critical.score(), 0.9);
    }

    #[test]
    fn classification_round_trips_hyphenated_variant() {
        let c = Classification::from_str("conscious-info").unwrap();
        assert_eq!(c, Classification::ConsciousInfo);
        assert_eq!(c.to_string(), "conscious-info");
        // serde uses the same spelling as Display
        assert_eq!(
            serde_json::to_string(&c).unwrap(),
            "\"conscious-info\""
        );
    }

    #[test]
    fn ingest_mode_accepts_spec_aliases() {
        assert_eq!(IngestMode::from_str("auto").unwrap(), IngestMode::Automatic);
        assert_eq!(IngestMode::from_str("none").unwrap(), IngestMode::Manual);
        assert!(IngestMode::from_str("hybrid").is_err());
    }

    #[test]
    fn memory_record_blob_is_camel_case() {
        let record = MemoryRecord {
            id: "m1".into(),
            conversation_id: "c1".into(),
            namespace: "ns".into(),
            content: "text".into(),
            summary: "text".into(),
            classification: Classification::Personal,
            importance: Importance::High,
            importance_score: 0.7,
            topic: None,
            entities: vec![],
            keywords: vec![],
            confidence_score: 0.9,
            classification_reason: "r".into(),
            promotion_eligible: true,
            extraction_timestamp: Utc::now(),
            conscious_processed: false,
            consolidated_into: None,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("conversationId").is_some());
        assert!(json.get("confidenceScore").is_some());
        // absent optionals stay out of the blob
        assert!(json.get("consolidatedInto").is_none());
    }
}
