// Storage engine behaviour that crosses module boundaries: idempotent writes,
// state seeding, ranked search, duplicate discovery, relationship invariants,
// and consolidation effects.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::Connection;

use engram_core::types::{
    ChatTurn, Classification, Importance, MemoryRecord, MemoryRelationship, RelationshipKind,
};
use engram_state::{MemoryState, StateManager};
use engram_storage::{SearchOptions, StorageEngine};

fn engine() -> StorageEngine {
    let state = Arc::new(StateManager::new(Connection::open_in_memory().unwrap()).unwrap());
    StorageEngine::open_in_memory(state).unwrap()
}

fn turn(chat_id: &str, ns: &str, user: &str, ai: &str) -> ChatTurn {
    ChatTurn {
        chat_id: chat_id.into(),
        session_id: "session-1".into(),
        namespace: ns.into(),
        user_input: user.into(),
        ai_output: ai.into(),
        model_used: "stub-model".into(),
        timestamp: Utc::now(),
        metadata: None,
    }
}

fn record(
    id: &str,
    ns: &str,
    content: &str,
    classification: Classification,
    importance: Importance,
) -> MemoryRecord {
    MemoryRecord {
        id: id.into(),
        conversation_id: format!("conv-{id}"),
        namespace: ns.into(),
        content: content.into(),
        summary: content.chars().take(180).collect(),
        classification,
        importance,
        importance_score: importance.score(),
        topic: None,
        entities: vec![],
        keywords: vec![],
        confidence_score: 0.9,
        classification_reason: "test".into(),
        promotion_eligible: false,
        extraction_timestamp: Utc::now(),
        conscious_processed: false,
        consolidated_into: None,
    }
}

#[test]
fn chat_turn_storage_is_idempotent() {
    let engine = engine();
    let first = engine.store_chat_turn(&turn("c1", "ns", "hello", "hi")).unwrap();
    let second = engine
        .store_chat_turn(&turn("c1", "ns", "different text", "ignored"))
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(engine.chat_turn_count("ns").unwrap(), 1);

    // the original row survived the replay
    let stored = engine.get_chat_turn("c1").unwrap().unwrap();
    assert_eq!(stored.user_input, "hello");
}

#[test]
fn storing_a_memory_seeds_processed_state() {
    let engine = engine();
    let state = engine.state_manager();
    engine
        .store_long_term_memory(&record("m1", "ns", "some fact", Classification::Contextual, Importance::Medium))
        .unwrap();
    assert_eq!(state.current_state("m1").unwrap(), Some(MemoryState::Processed));
}

#[test]
fn staged_pending_state_is_left_for_the_caller() {
    let engine = engine();
    let state = engine.state_manager();
    state
        .initialize_existing("m1", "ns", MemoryState::Pending)
        .unwrap();
    engine
        .store_long_term_memory(&record("m1", "ns", "some fact", Classification::Contextual, Importance::Medium))
        .unwrap();
    assert_eq!(state.current_state("m1").unwrap(), Some(MemoryState::Pending));
}

#[test]
fn search_ranks_matches_and_respects_limit() {
    let engine = engine();
    engine
        .store_long_term_memory(&record(
            "m1",
            "ns",
            "The user's favorite color is blue",
            Classification::Personal,
            Importance::Medium,
        ))
        .unwrap();
    engine
        .store_long_term_memory(&record(
            "m2",
            "ns",
            "The user works on a compiler project",
            Classification::Contextual,
            Importance::High,
        ))
        .unwrap();
    engine
        .store_long_term_memory(&record(
            "m3",
            "ns",
            "Favorite color blue, confirmed again",
            Classification::Personal,
            Importance::Low,
        ))
        .unwrap();

    let hits = engine
        .search_memories("color", &SearchOptions::for_namespace("ns"))
        .unwrap();
    assert_eq!(hits.len(), 2);
    for hit in &hits {
        assert!(hit.record.content.to_lowercase().contains("color"));
    }

    let limited = engine
        .search_memories(
            "color",
            &SearchOptions {
                limit: 1,
                ..SearchOptions::for_namespace("ns")
            },
        )
        .unwrap();
    assert_eq!(limited.len(), 1);
}

#[test]
fn search_filters_by_min_importance_and_category() {
    let engine = engine();
    engine
        .store_long_term_memory(&record("m1", "ns", "deploy checklist item", Classification::Reference, Importance::Low))
        .unwrap();
    engine
        .store_long_term_memory(&record("m2", "ns", "deploy window friday", Classification::Contextual, Importance::High))
        .unwrap();

    let hits = engine
        .search_memories(
            "deploy",
            &SearchOptions {
                min_importance: Some(Importance::Medium),
                ..SearchOptions::for_namespace("ns")
            },
        )
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].record.id, "m2");

    let by_category = engine
        .search_memories(
            "deploy",
            &SearchOptions {
                categories: vec![Classification::Reference],
                ..SearchOptions::for_namespace("ns")
            },
        )
        .unwrap();
    assert_eq!(by_category.len(), 1);
    assert_eq!(by_category[0].record.id, "m1");
}

#[test]
fn search_is_namespace_scoped() {
    let engine = engine();
    engine
        .store_long_term_memory(&record("m1", "ns-a", "blue color preference", Classification::Personal, Importance::Medium))
        .unwrap();
    let hits = engine
        .search_memories("blue", &SearchOptions::for_namespace("ns-b"))
        .unwrap();
    assert!(hits.is_empty());
}

#[test]
fn duplicate_discovery_uses_jaccard_threshold() {
    let engine = engine();
    engine
        .store_long_term_memory(&record("m1", "ns", "User prefers dark mode", Classification::ConsciousInfo, Importance::High))
        .unwrap();
    engine
        .store_long_term_memory(&record("m2", "ns", "User likes dark mode", Classification::ConsciousInfo, Importance::High))
        .unwrap();
    engine
        .store_long_term_memory(&record("m3", "ns", "Completely unrelated note about compilers", Classification::ConsciousInfo, Importance::High))
        .unwrap();

    // m1 vs m2: {user, dark, mode} / {user, prefers, likes, dark, mode} = 0.6
    let dups = engine
        .find_potential_duplicates("User prefers dark mode", "ns", 0.5)
        .unwrap();
    let ids: Vec<&str> = dups.iter().map(|(r, _)| r.id.as_str()).collect();
    assert!(ids.contains(&"m1")); // the record itself matches at 1.0
    assert!(ids.contains(&"m2"));
    assert!(!ids.contains(&"m3"));

    let (_, top_score) = &dups[0];
    assert!((top_score - 1.0).abs() < 1e-9);
}

#[test]
fn relationship_invariants_are_enforced() {
    let engine = engine();
    engine
        .store_long_term_memory(&record("a", "ns", "alpha", Classification::Contextual, Importance::Medium))
        .unwrap();
    engine
        .store_long_term_memory(&record("b", "ns", "beta", Classification::Contextual, Importance::Medium))
        .unwrap();

    let rel = |source: &str, target: &str, kind: RelationshipKind| MemoryRelationship {
        source_id: source.into(),
        target_id: target.into(),
        kind,
        confidence: 0.8,
        strength: 0.7,
        reason: "test".into(),
        entities: vec![],
        context: String::new(),
    };

    // self-edge and unknown target skipped, valid edge stored
    let outcome = engine
        .store_relationships(
            "a",
            &[
                rel("a", "a", RelationshipKind::Reference),
                rel("a", "ghost", RelationshipKind::Reference),
                rel("a", "b", RelationshipKind::Supersedes),
            ],
            "ns",
        )
        .unwrap();
    assert_eq!(outcome.stored, 1);
    assert_eq!(outcome.errors.len(), 2);

    // b -> a supersedes would close a cycle
    let cycle = engine
        .store_relationships("b", &[rel("b", "a", RelationshipKind::Supersedes)], "ns")
        .unwrap();
    assert_eq!(cycle.stored, 0);
    assert!(cycle.errors[0].contains("cycle"));

    // non-supersedes edges between the same pair are fine
    let ok = engine
        .store_relationships("b", &[rel("b", "a", RelationshipKind::Elaboration)], "ns")
        .unwrap();
    assert_eq!(ok.stored, 1);
}

#[test]
fn consolidation_merges_rewrites_and_marks_duplicates() {
    let engine = engine();
    let state = engine.state_manager();

    let mut primary = record("p", "ns", "User prefers dark mode", Classification::ConsciousInfo, Importance::High);
    primary.entities = vec!["dark mode".into()];
    primary.keywords = vec!["ui".into()];
    engine.store_long_term_memory(&primary).unwrap();

    let mut dup = record("d1", "ns", "User likes dark mode", Classification::ConsciousInfo, Importance::High);
    dup.entities = vec!["dark mode".into(), "preferences".into()];
    dup.keywords = vec!["theme".into()];
    engine.store_long_term_memory(&dup).unwrap();

    engine
        .store_long_term_memory(&record("other", "ns", "unrelated", Classification::Contextual, Importance::Low))
        .unwrap();
    // an edge pointing at the duplicate, to be rewritten
    engine
        .store_relationships(
            "other",
            &[MemoryRelationship {
                source_id: "other".into(),
                target_id: "d1".into(),
                kind: RelationshipKind::Reference,
                confidence: 0.9,
                strength: 0.5,
                reason: "points at dup".into(),
                entities: vec![],
                context: String::new(),
            }],
            "ns",
        )
        .unwrap();

    let outcome = engine
        .consolidate_duplicate_memories("p", &["d1".to_string()], "ns")
        .unwrap();
    assert_eq!(outcome.consolidated, 1);
    assert!(outcome.errors.is_empty());

    // entities/keywords merged into the primary
    let merged = engine.get_memory("p").unwrap().unwrap();
    assert!(merged.entities.contains(&"preferences".to_string()));
    assert!(merged.keywords.contains(&"theme".to_string()));

    // duplicate carries the back-reference and reached consolidated
    let folded = engine.get_memory("d1").unwrap().unwrap();
    assert_eq!(folded.consolidated_into.as_deref(), Some("p"));
    assert_eq!(state.current_state("d1").unwrap(), Some(MemoryState::Consolidated));

    // the incoming relationship now points at the primary
    let rels = engine.relationships_for("p", "ns").unwrap();
    assert!(rels.iter().any(|r| r.source_id == "other" && r.target_id == "p"));
    assert!(engine.relationships_for("d1", "ns").unwrap().is_empty());
}

#[test]
fn consolidation_safety_checks() {
    let engine = engine();
    engine
        .store_long_term_memory(&record("p", "ns", "primary", Classification::ConsciousInfo, Importance::High))
        .unwrap();
    engine
        .store_long_term_memory(&record("d", "ns", "dup", Classification::ConsciousInfo, Importance::High))
        .unwrap();

    // self-consolidation
    let errors = engine
        .validate_consolidation("p", &["p".to_string()], "ns")
        .unwrap();
    assert!(errors.iter().any(|e| e.contains("self-consolidation")));

    // unknown duplicate
    let errors = engine
        .validate_consolidation("p", &["ghost".to_string()], "ns")
        .unwrap();
    assert!(errors.iter().any(|e| e.contains("not found")));

    // repeat consolidation is caught as a cycle
    engine
        .consolidate_duplicate_memories("p", &["d".to_string()], "ns")
        .unwrap();
    let errors = engine
        .validate_consolidation("p", &["d".to_string()], "ns")
        .unwrap();
    assert!(errors.iter().any(|e| e.contains("cycle")));
}

#[test]
fn short_term_eviction_spares_permanent_context() {
    let engine = engine();
    let conscious = record("m1", "ns", "identity fact", Classification::ConsciousInfo, Importance::Critical);
    engine.store_long_term_memory(&conscious).unwrap();
    engine.store_conscious_short_term(&conscious).unwrap();

    // a zero-age cutoff would evict anything non-permanent
    let removed = engine
        .evict_short_term_older_than("ns", chrono::Duration::seconds(-1))
        .unwrap();
    assert_eq!(removed, 0);

    let kept = engine.short_term_by_chat_id("m1", "ns").unwrap().unwrap();
    assert!(kept.is_permanent_context);
    assert_eq!(kept.importance_score, 0.9);
}

#[test]
fn cleanup_removes_the_record_and_its_satellites() {
    let engine = engine();
    let state = engine.state_manager();

    let conscious = record("m1", "ns", "identity fact", Classification::ConsciousInfo, Importance::High);
    engine.store_long_term_memory(&conscious).unwrap();
    engine
        .store_long_term_memory(&record("m2", "ns", "related note", Classification::Contextual, Importance::Low))
        .unwrap();
    engine.store_conscious_short_term(&conscious).unwrap();
    engine
        .store_relationships(
            "m2",
            &[MemoryRelationship {
                source_id: "m2".into(),
                target_id: "m1".into(),
                kind: RelationshipKind::Reference,
                confidence: 0.9,
                strength: 0.5,
                reason: "test".into(),
                entities: vec![],
                context: String::new(),
            }],
            "ns",
        )
        .unwrap();

    // cleanup is refused until the record is staged
    assert!(!engine.cleanup_memory("m1", "ns").unwrap());

    // processed -> conscious flow -> cleanup_pending
    let opts = engram_state::TransitionOptions::new("test", "test");
    state.transition("m1", MemoryState::ConsciousProcessing, &opts).unwrap();
    state.transition("m1", MemoryState::ConsciousProcessed, &opts).unwrap();
    state.transition("m1", MemoryState::CleanupPending, &opts).unwrap();

    assert!(engine.cleanup_memory("m1", "ns").unwrap());
    assert_eq!(state.current_state("m1").unwrap(), Some(MemoryState::Cleaned));
    assert!(engine.get_memory("m1").unwrap().is_none());
    assert!(engine.short_term_by_chat_id("m1", "ns").unwrap().is_none());
    assert!(engine.relationships_for("m1", "ns").unwrap().is_empty());
    // the transition history survives the record
    assert!(!state.history("m1").unwrap().is_empty());
}

#[tokio::test]
async fn database_stats_counts_by_namespace() {
    let engine = engine();
    engine.store_chat_turn(&turn("c1", "ns", "hi", "hello")).unwrap();
    engine.store_chat_turn(&turn("c2", "ns", "more", "text")).unwrap();
    engine
        .store_long_term_memory(&record("m1", "ns", "a fact", Classification::Contextual, Importance::Medium))
        .unwrap();
    let conscious = record("m2", "ns", "identity", Classification::ConsciousInfo, Importance::High);
    engine.store_long_term_memory(&conscious).unwrap();
    engine.store_conscious_short_term(&conscious).unwrap();

    let stats = engine.database_stats("ns").await.unwrap();
    assert_eq!(stats.conversation_count, 2);
    assert_eq!(stats.long_term_count, 2);
    assert_eq!(stats.conscious_count, 1);
    assert_eq!(stats.short_term_count, 1);
    assert!(stats.last_activity.is_some());

    let empty = engine.database_stats("other").await.unwrap();
    assert_eq!(empty.conversation_count, 0);
    assert!(empty.last_activity.is_none());
}
