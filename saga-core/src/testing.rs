//! Testing utilities.
//!
//! This module provides tools for integration testing:
//! - `MockGenerator` for deterministic workflow runs without network calls
//! - `TestHarness` for scripted multi-chapter merge scenarios
//! - Fixtures and assertion helpers for verifying chapter state

use crate::delta::Delta;
use crate::merge::{DeltaMergeEngine, MergeReport};
use crate::resolve::EntityResolver;
use crate::state::{ChapterState, NarrativeArc, RelationshipEdge};
use crate::workflow::{GenerationError, TextGenerator};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// A scripted reply from the mock generator.
#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    Fail(GenerationError),
}

impl MockReply {
    pub fn text(text: impl Into<String>) -> Self {
        MockReply::Text(text.into())
    }

    /// A transport failure.
    pub fn fail(message: impl Into<String>) -> Self {
        MockReply::Fail(GenerationError::Transport(message.into()))
    }

    /// A Delta serialized as a fenced JSON block, the way models tend to reply.
    pub fn delta(delta: &Value) -> Self {
        MockReply::Text(format!("Here is the analysis.\n```json\n{delta}\n```"))
    }
}

/// A text generator that returns scripted replies in order.
///
/// Once the script runs out every call fails with a transport error.
#[derive(Debug, Default)]
pub struct MockGenerator {
    replies: Mutex<VecDeque<MockReply>>,
    prompts: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl MockGenerator {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Add a reply to the end of the script.
    pub fn queue_reply(&self, reply: MockReply) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(reply);
        }
    }

    /// Every prompt received so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .map(|prompts| prompts.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TextGenerator for MockGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self
            .replies
            .lock()
            .ok()
            .and_then(|mut replies| replies.pop_front());
        match next {
            Some(MockReply::Text(text)) => Ok(text),
            Some(MockReply::Fail(e)) => Err(e),
            None => Err(GenerationError::Transport(
                "mock generator has no more scripted replies".to_string(),
            )),
        }
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// A small but complete chapter state: two characters with an edge between
/// them, a location, an item, a main quest with its status, one active arc.
pub fn sample_state() -> ChapterState {
    let mut state = ChapterState::new("hero");
    let statics = &mut state.static_matrices;

    statics.characters.insert(
        "hero".into(),
        json!({"name": "Aren", "role": "protagonist", "traits": {"brave": true}}),
    );
    statics.characters.insert(
        "mira".into(),
        json!({"name": "Mira", "role": "healer", "keywords": ["herbs", "river"]}),
    );
    statics
        .worldview
        .locations
        .insert("harbor".into(), json!({"name": "Grey Harbor", "description": "Fog and gulls."}));
    statics
        .worldview
        .items
        .insert("lantern".into(), json!({"name": "Brass Lantern"}));
    statics.storylines.main_quests.insert(
        "quest_crown".into(),
        json!({"id": "quest_crown", "title": "The Lost Crown", "summary": "Recover the stolen crown."}),
    );
    statics
        .relationship_graph
        .edges
        .push(RelationshipEdge::new("hero_mira", "hero", "mira"));

    state
        .dynamic_state
        .storylines
        .main_quests
        .entry("quest_crown".into())
        .or_default()
        .current_summary = "Recover the stolen crown.".into();

    let mut arc = NarrativeArc::new("arc_trust");
    arc.title = "Earning Mira's Trust".into();
    state.meta.active_narrative_arcs.push(arc);

    state.seal();
    state
}

/// Test harness for running multi-chapter merge scenarios.
pub struct TestHarness {
    pub engine: DeltaMergeEngine,
    pub state: ChapterState,
    /// Report from every applied chapter, oldest first.
    pub reports: Vec<MergeReport>,
}

impl TestHarness {
    /// Harness over [`sample_state`] with the default engine.
    pub fn new() -> Self {
        Self::with_state(sample_state())
    }

    pub fn with_state(state: ChapterState) -> Self {
        Self {
            engine: DeltaMergeEngine::default(),
            state,
            reports: Vec::new(),
        }
    }

    pub fn with_engine(mut self, engine: DeltaMergeEngine) -> Self {
        self.engine = engine;
        self
    }

    /// Parse `delta`, advance one chapter and return that chapter's report.
    #[track_caller]
    pub fn chapter(&mut self, delta: Value) -> &MergeReport {
        let delta: Delta = match serde_json::from_value(delta) {
            Ok(delta) => delta,
            Err(e) => panic!("test delta should parse: {e}"),
        };
        let outcome = self.engine.apply(&self.state, &delta);
        self.state = outcome.state;
        self.reports.push(outcome.report);
        &self.reports[self.reports.len() - 1]
    }

    /// Whether `id` resolves to a visible entity.
    pub fn resolves(&self, id: &str) -> bool {
        EntityResolver::resolve(id, &self.state).is_some()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Assertion Helpers
// ============================================================================

/// Assert that `id` resolves to a visible entity.
#[track_caller]
pub fn assert_resolves(harness: &TestHarness, id: &str) {
    assert!(harness.resolves(id), "Expected '{id}' to resolve");
}

/// Assert that the snapshot passes the structural check.
#[track_caller]
pub fn assert_structurally_valid(state: &ChapterState) {
    let document = state.to_document();
    assert!(
        ChapterState::is_structurally_valid(&document),
        "Expected a structurally valid snapshot, got {document}"
    );
}
