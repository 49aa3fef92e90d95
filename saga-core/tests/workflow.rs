//! Chapter workflow against real stores.
//!
//! Covers the session lock, cancellation after staging, retry accounting
//! and reload-with-fallback from files on disk.

use async_trait::async_trait;
use saga_core::persist::Slot;
use saga_core::testing::{sample_state, MockGenerator, MockReply};
use saga_core::workflow::ChapterAdvance;
use saga_core::{
    load_state, CancellationToken, ChapterState, ChapterWorkflow, JsonFileStore, LoadSource,
    MemoryStore, PacingControlTower, PersistError, SnapshotStore, WorkflowConfig, WorkflowError,
    WorkflowOutcome,
};
use serde_json::{json, Value};
use std::time::Duration;
use tempfile::TempDir;

fn fast() -> WorkflowConfig {
    WorkflowConfig::new().with_retry_base_delay(Duration::from_millis(1))
}

fn committed(outcome: WorkflowOutcome) -> ChapterAdvance {
    match outcome {
        WorkflowOutcome::Committed(advance) => *advance,
        WorkflowOutcome::Skipped => panic!("expected a committed chapter"),
    }
}

/// Wraps a store and fires a cancellation token as soon as anything is staged.
struct CancelOnStage<S> {
    inner: S,
    cancel: CancellationToken,
}

#[async_trait]
impl<S: SnapshotStore> SnapshotStore for CancelOnStage<S> {
    async fn read(&self, key: &str, slot: Slot) -> Result<Option<Value>, PersistError> {
        self.inner.read(key, slot).await
    }

    async fn write(&self, key: &str, slot: Slot, document: Value) -> Result<(), PersistError> {
        self.inner.write(key, slot, document).await?;
        if slot == Slot::Staged {
            self.cancel.cancel();
        }
        Ok(())
    }

    async fn remove(&self, key: &str, slot: Slot) -> Result<(), PersistError> {
        self.inner.remove(key, slot).await
    }
}

// =============================================================================
// TEST 1: Overlapping triggers are dropped
// =============================================================================

#[tokio::test]
async fn test_overlapping_advance_is_skipped() {
    let generator = MockGenerator::new(vec![
        MockReply::delta(&json!({"new_handoff_memo": "first"})),
        MockReply::delta(&json!({"new_handoff_memo": "second"})),
    ])
    .with_delay(Duration::from_millis(50));
    let workflow = ChapterWorkflow::new(generator, MemoryStore::new()).with_config(fast());
    let prior = sample_state();
    let cancel = CancellationToken::new();

    let (a, b) = tokio::join!(
        workflow.advance(&prior, "chapter", &cancel),
        workflow.advance(&prior, "chapter", &cancel)
    );
    let outcomes = [
        a.expect("first advance should succeed"),
        b.expect("second advance should succeed"),
    ];

    let skipped = outcomes
        .iter()
        .filter(|o| matches!(o, WorkflowOutcome::Skipped))
        .count();
    assert_eq!(skipped, 1);
    assert_eq!(workflow.generator().prompts().len(), 1);
    assert!(!workflow.is_running());

    // The lock is free again
    let advance = committed(
        workflow
            .advance(&prior, "chapter", &cancel)
            .await
            .expect("advance should succeed"),
    );
    assert_eq!(advance.state.meta.handoff_memo, "second");
}

// =============================================================================
// TEST 2: Cancellation after staging discards the staged record
// =============================================================================

#[tokio::test]
async fn test_cancel_after_stage_keeps_current() {
    let cancel = CancellationToken::new();
    let store = CancelOnStage {
        inner: MemoryStore::new(),
        cancel: cancel.clone(),
    };
    let generator = MockGenerator::new(vec![MockReply::delta(
        &json!({"new_long_term_summary": "never committed"}),
    )]);
    let workflow = ChapterWorkflow::new(generator, store).with_config(fast());
    let prior = sample_state();
    workflow
        .initialize(&prior)
        .await
        .expect("initialize should succeed");

    let result = workflow.advance(&prior, "chapter", &cancel).await;
    assert!(matches!(result, Err(WorkflowError::Cancelled)));

    let store = workflow.store();
    assert!(store
        .read("hero", Slot::Staged)
        .await
        .expect("read should succeed")
        .is_none());
    let current = store
        .load_current("hero")
        .await
        .expect("read should succeed")
        .expect("current should exist");
    assert_eq!(current["uid"], json!(prior.uid));
    assert!(!workflow.is_running());
}

// =============================================================================
// TEST 3: Retries count toward the result and commit once
// =============================================================================

#[tokio::test]
async fn test_retry_then_commit_to_disk() {
    let dir = TempDir::new().expect("temp dir should be created");
    let generator = MockGenerator::new(vec![
        MockReply::fail("timeout"),
        MockReply::delta(&json!({
            "chronology_update": {"day": 3},
            "rhythm_assessment": {"emotional_intensity": 7}
        })),
    ]);
    let workflow = ChapterWorkflow::new(generator, JsonFileStore::new(dir.path())).with_config(fast());
    let prior = sample_state();
    workflow
        .initialize(&prior)
        .await
        .expect("initialize should succeed");

    let advance = committed(
        workflow
            .advance(&prior, "chapter", &CancellationToken::new())
            .await
            .expect("advance should succeed"),
    );
    assert_eq!(advance.attempts, 2);
    assert_eq!(advance.state.dynamic_state.chronology.day, 3);

    let store = workflow.store();
    assert!(!store.path_for("hero", Slot::Staged).exists());
    assert!(store.path_for("hero", Slot::Current).exists());

    let loaded = load_state(store, "hero", &PacingControlTower::default())
        .await
        .expect("load should succeed");
    assert_eq!(loaded.source, LoadSource::Current);
    assert_eq!(loaded.state.uid, advance.state.uid);
    assert_eq!(
        loaded.state.meta.narrative_control_tower.recent_chapters_intensity.len(),
        1
    );
}

// =============================================================================
// TEST 4: Reload falls back when the current snapshot is corrupt
// =============================================================================

#[tokio::test]
async fn test_load_falls_back_to_baseline_then_default() {
    let dir = TempDir::new().expect("temp dir should be created");
    let store = JsonFileStore::new(dir.path());
    let tower = PacingControlTower::default();
    let genesis = sample_state();

    store
        .save_baseline("hero", &genesis, false)
        .await
        .expect("baseline save should succeed");
    tokio::fs::write(store.path_for("hero", Slot::Current), b"{\"uid\": 7}")
        .await
        .expect("write should succeed");

    let loaded = load_state(&store, "hero", &tower)
        .await
        .expect("load should succeed");
    assert_eq!(loaded.source, LoadSource::Baseline);
    assert_eq!(loaded.state.uid, genesis.uid);

    let loaded = load_state(&store, "nobody", &tower)
        .await
        .expect("load should succeed");
    assert_eq!(loaded.source, LoadSource::Default);
    assert_eq!(loaded.state, {
        let mut fresh = ChapterState::new("nobody");
        fresh.uid = loaded.state.uid.clone();
        tower.reconcile(&mut fresh);
        fresh
    });
}
