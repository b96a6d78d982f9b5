// Conscious agent behaviour: promotion into the short-term working set,
// importance gating, and duplicate consolidation (dry and real runs).

use std::sync::Arc;

use chrono::Utc;
use rusqlite::Connection;

use engram_conscious::{ConsciousAgent, ConsolidateOptions};
use engram_core::config::ConsciousConfig;
use engram_core::types::{Classification, Importance, MemoryRecord};
use engram_state::{MemoryState, StateManager};
use engram_storage::StorageEngine;

fn storage() -> Arc<StorageEngine> {
    let state = Arc::new(StateManager::new(Connection::open_in_memory().unwrap()).unwrap());
    Arc::new(StorageEngine::open_in_memory(state).unwrap())
}

fn agent(storage: &Arc<StorageEngine>, min_importance: Option<Importance>) -> ConsciousAgent {
    ConsciousAgent::new(
        storage.clone(),
        None,
        "ns",
        min_importance,
        ConsciousConfig::default(),
    )
}

fn conscious_record(id: &str, content: &str, importance: Importance) -> MemoryRecord {
    MemoryRecord {
        id: id.into(),
        conversation_id: format!("conv-{id}"),
        namespace: "ns".into(),
        content: content.into(),
        summary: content.into(),
        classification: Classification::ConsciousInfo,
        importance,
        importance_score: importance.score(),
        topic: None,
        entities: vec![],
        keywords: vec![],
        confidence_score: 0.9,
        classification_reason: "test".into(),
        promotion_eligible: true,
        extraction_timestamp: Utc::now(),
        conscious_processed: false,
        consolidated_into: None,
    }
}

#[tokio::test]
async fn promotion_copies_into_short_term_with_permanent_context() {
    let storage = storage();
    let state = storage.state_manager();
    storage
        .store_long_term_memory(&conscious_record("m1", "identity fact", Importance::High))
        .unwrap();

    let mut agent = agent(&storage, None);
    let report = agent.run_ingest_pass().await.unwrap();
    assert_eq!(report.promoted, 1);
    assert_eq!(report.failed, 0);

    assert_eq!(
        state.current_state("m1").unwrap(),
        Some(MemoryState::ConsciousProcessed)
    );

    let copy = storage.short_term_by_chat_id("m1", "ns").unwrap().unwrap();
    assert!(copy.is_permanent_context);
    assert_eq!(copy.importance_score, 0.7);
    assert_eq!(copy.retention_type, "short_term");

    // the source record is flagged so the next pass skips it
    let source = storage.get_memory("m1").unwrap().unwrap();
    assert!(source.conscious_processed);
}

#[tokio::test]
async fn second_pass_is_a_noop() {
    let storage = storage();
    storage
        .store_long_term_memory(&conscious_record("m1", "identity fact", Importance::High))
        .unwrap();

    let mut agent = agent(&storage, None);
    agent.run_ingest_pass().await.unwrap();
    let second = agent.run_ingest_pass().await.unwrap();
    assert_eq!(second.promoted, 0);
    assert_eq!(second.failed, 0);
}

#[tokio::test]
async fn promotion_respects_min_importance() {
    let storage = storage();
    storage
        .store_long_term_memory(&conscious_record("lo", "minor detail", Importance::Low))
        .unwrap();
    storage
        .store_long_term_memory(&conscious_record("hi", "core identity", Importance::Critical))
        .unwrap();

    let mut agent = agent(&storage, Some(Importance::High));
    let report = agent.run_ingest_pass().await.unwrap();
    assert_eq!(report.promoted, 1);

    assert!(storage.short_term_by_chat_id("hi", "ns").unwrap().is_some());
    assert!(storage.short_term_by_chat_id("lo", "ns").unwrap().is_none());
}

#[tokio::test]
async fn non_conscious_classifications_are_ignored() {
    let storage = storage();
    let mut record = conscious_record("m1", "just a chat", Importance::High);
    record.classification = Classification::Conversational;
    storage.store_long_term_memory(&record).unwrap();

    let mut agent = agent(&storage, None);
    let report = agent.run_ingest_pass().await.unwrap();
    assert_eq!(report.promoted, 0);
}

/// The dark-mode trio: two duplicates of one primary at threshold 0.5.
async fn seed_dark_mode_trio(storage: &Arc<StorageEngine>) -> ConsciousAgent {
    storage
        .store_long_term_memory(&conscious_record("m1", "User prefers dark mode", Importance::High))
        .unwrap();
    storage
        .store_long_term_memory(&conscious_record("m2", "User likes dark mode", Importance::High))
        .unwrap();
    storage
        .store_long_term_memory(&conscious_record(
            "m3",
            "User set UI to dark mode",
            Importance::High,
        ))
        .unwrap();

    let mut agent = agent(storage, None);
    // promote everything first, as the background loop would have
    let report = agent.run_ingest_pass().await.unwrap();
    assert_eq!(report.promoted, 3);
    agent
}

#[tokio::test]
async fn dry_run_reports_the_plan_and_changes_nothing() {
    let storage = storage();
    let state = storage.state_manager();
    let agent = seed_dark_mode_trio(&storage).await;

    let report = agent
        .consolidate_duplicates(&ConsolidateOptions {
            similarity_threshold: 0.5,
            dry_run: true,
            batch_size: 10,
        })
        .await
        .unwrap();

    assert_eq!(report.consolidation_stats.groups_processed, 1);
    assert_eq!(report.consolidation_stats.total_duplicates, 2);
    assert_eq!(report.consolidated, 1);
    assert!(report.errors.is_empty());

    // every record is untouched
    for id in ["m1", "m2", "m3"] {
        assert_eq!(
            state.current_state(id).unwrap(),
            Some(MemoryState::ConsciousProcessed),
            "{id} state must be unchanged by a dry run"
        );
        assert!(storage.get_memory(id).unwrap().unwrap().consolidated_into.is_none());
    }
}

#[tokio::test]
async fn real_run_merges_the_group() {
    let storage = storage();
    let state = storage.state_manager();
    let agent = seed_dark_mode_trio(&storage).await;

    let report = agent
        .consolidate_duplicates(&ConsolidateOptions {
            similarity_threshold: 0.5,
            dry_run: false,
            batch_size: 10,
        })
        .await
        .unwrap();

    assert_eq!(report.consolidated, 1);
    assert_eq!(report.consolidation_stats.safety_checks_passed, 1);

    // duplicates carry back-references and everyone reached consolidated
    for id in ["m2", "m3"] {
        let record = storage.get_memory(id).unwrap().unwrap();
        assert_eq!(record.consolidated_into.as_deref(), Some("m1"));
        assert_eq!(state.current_state(id).unwrap(), Some(MemoryState::Consolidated));
    }
    assert_eq!(state.current_state("m1").unwrap(), Some(MemoryState::Consolidated));

    // consolidated duplicates drop out of the live conscious set
    assert_eq!(storage.conscious_records("ns").unwrap().len(), 1);
    assert_eq!(report.memory_usage.before, 3);
    assert_eq!(report.memory_usage.after, 1);
    assert_eq!(report.memory_usage.peak, 3);
}

#[tokio::test]
async fn below_threshold_groups_are_skipped() {
    let storage = storage();
    let agent = seed_dark_mode_trio(&storage).await;

    // at 0.9 nothing is similar enough
    let report = agent
        .consolidate_duplicates(&ConsolidateOptions {
            similarity_threshold: 0.9,
            dry_run: false,
            batch_size: 10,
        })
        .await
        .unwrap();
    assert_eq!(report.consolidated, 0);
    assert_eq!(report.consolidation_stats.groups_processed, 0);
    assert_eq!(storage.conscious_records("ns").unwrap().len(), 3);
}

#[tokio::test]
async fn loop_shuts_down_within_a_tick() {
    let storage = storage();
    let config = ConsciousConfig {
        update_interval_ms: 20,
        ..ConsciousConfig::default()
    };
    let agent = ConsciousAgent::new(storage.clone(), None, "ns", None, config);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(agent.run(shutdown_rx));

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    shutdown_tx.send(true).unwrap();

    tokio::time::timeout(std::time::Duration::from_millis(500), handle)
        .await
        .expect("agent loop must stop within one tick")
        .unwrap();
}
