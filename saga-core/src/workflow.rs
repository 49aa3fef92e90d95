//! Chapter advancement.
//!
//! One [`ChapterWorkflow`] per session. A run asks the text-generation
//! collaborator for the chapter analysis, parses the Delta out of it, merges
//! it, stages the result and commits it as the current snapshot. At most one
//! run is active at a time; an overlapping call returns
//! [`WorkflowOutcome::Skipped`] without doing anything.
//!
//! Cancellation is cooperative: the [`CancellationToken`] is checked between
//! steps, never during an in-flight generation call.

use crate::delta::Delta;
use crate::merge::{DeltaMergeEngine, MergeReport};
use crate::persist::{PersistError, SnapshotStore};
use crate::state::{ChapterState, StateError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by a text-generation collaborator.
#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },
}

/// Accepts a prompt, returns raw text.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError>;
}

/// Errors from a workflow run.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Generation failed after {attempts} attempt(s): {message}")]
    Transport { attempts: u32, message: String },

    #[error("Cancelled")]
    Cancelled,

    #[error("Invalid delta: {0}")]
    InvalidDelta(String),

    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),

    #[error("State error: {0}")]
    State(#[from] StateError),
}

/// Workflow tunables.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Retries after the first failed generation attempt.
    pub max_retries: u32,

    /// Delay before retry `n` is `n * retry_base_delay`.
    pub retry_base_delay: Duration,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

impl WorkflowConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }
}

/// Shared cooperative stop flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A committed chapter.
#[derive(Debug, Clone)]
pub struct ChapterAdvance {
    pub state: ChapterState,
    pub report: MergeReport,
    /// Generation attempts used.
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub enum WorkflowOutcome {
    Committed(Box<ChapterAdvance>),
    /// Another run was already active.
    Skipped,
}

/// Releases the session lock when a run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives chapter advancement for one session.
pub struct ChapterWorkflow<G, S> {
    generator: G,
    store: S,
    engine: DeltaMergeEngine,
    config: WorkflowConfig,
    running: AtomicBool,
}

impl<G, S> ChapterWorkflow<G, S>
where
    G: TextGenerator,
    S: SnapshotStore,
{
    pub fn new(generator: G, store: S) -> Self {
        Self {
            generator,
            store,
            engine: DeltaMergeEngine::default(),
            config: WorkflowConfig::default(),
            running: AtomicBool::new(false),
        }
    }

    pub fn with_engine(mut self, engine: DeltaMergeEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_config(mut self, config: WorkflowConfig) -> Self {
        self.config = config;
        self
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn engine(&self) -> &DeltaMergeEngine {
        &self.engine
    }

    /// Whether a run is in progress.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Persist a session's genesis snapshot as both baseline and current.
    pub async fn initialize(&self, state: &ChapterState) -> Result<(), WorkflowError> {
        let key = state.character_id.as_str();
        self.store.save_baseline(key, state, false).await?;
        self.store.save_current(key, state).await?;
        Ok(())
    }

    /// Advance `prior` by one chapter.
    pub async fn advance(
        &self,
        prior: &ChapterState,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<WorkflowOutcome, WorkflowError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(key = %prior.character_id, "chapter workflow already running, trigger dropped");
            return Ok(WorkflowOutcome::Skipped);
        }
        let _guard = RunGuard(&self.running);
        let key = prior.character_id.as_str();

        checkpoint(cancel)?;
        let (raw, attempts) = self.generate_with_retry(prompt, cancel).await?;

        checkpoint(cancel)?;
        let delta = Delta::from_model_output(&raw)
            .map_err(|e| WorkflowError::InvalidDelta(e.to_string()))?;
        let outcome = self.engine.apply(prior, &delta);

        checkpoint(cancel)?;
        self.store.stage(key, &outcome.state).await?;

        if cancel.is_cancelled() {
            tracing::info!(key, "cancelled after staging, discarding transaction record");
            self.store.discard_staged(key).await?;
            return Err(WorkflowError::Cancelled);
        }
        self.store.commit_staged(key).await?;

        tracing::info!(
            key,
            uid = %outcome.state.uid,
            attempts,
            rejected = outcome.report.rejections.len(),
            "chapter committed"
        );
        Ok(WorkflowOutcome::Committed(Box::new(ChapterAdvance {
            state: outcome.state,
            report: outcome.report,
            attempts,
        })))
    }

    async fn generate_with_retry(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<(String, u32), WorkflowError> {
        let max_attempts = self.config.max_retries + 1;
        let mut attempt = 1;
        loop {
            match self.generator.generate(prompt).await {
                Ok(text) => return Ok((text, attempt)),
                Err(e) if attempt >= max_attempts => {
                    return Err(WorkflowError::Transport {
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
                Err(e) => {
                    let delay = self.config.retry_base_delay * attempt;
                    tracing::warn!(attempt, ?delay, error = %e, "generation failed, retrying");
                    tokio::time::sleep(delay).await;
                    checkpoint(cancel)?;
                    attempt += 1;
                }
            }
        }
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), WorkflowError> {
    if cancel.is_cancelled() {
        Err(WorkflowError::Cancelled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryStore;
    use crate::testing::{MockGenerator, MockReply};

    fn fast() -> WorkflowConfig {
        WorkflowConfig::new().with_retry_base_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_advance_commits_current() {
        let generator = MockGenerator::new(vec![MockReply::text(
            r#"```json
{"new_handoff_memo": "Resume at the gate"}
```"#,
        )]);
        let workflow = ChapterWorkflow::new(generator, MemoryStore::new()).with_config(fast());
        let prior = ChapterState::new("hero");

        let outcome = workflow
            .advance(&prior, "summarize", &CancellationToken::new())
            .await
            .expect("advance should succeed");
        let WorkflowOutcome::Committed(advance) = outcome else {
            panic!("expected a committed chapter");
        };
        assert_eq!(advance.state.meta.handoff_memo, "Resume at the gate");
        assert_eq!(advance.attempts, 1);

        let current = workflow
            .store()
            .load_current("hero")
            .await
            .expect("load should succeed")
            .expect("current should exist");
        assert_eq!(current["uid"], serde_json::json!(advance.state.uid));
        assert!(!workflow.is_running());
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let generator = MockGenerator::new(vec![
            MockReply::fail("connection reset"),
            MockReply::fail("connection reset"),
            MockReply::text("{}"),
        ]);
        let workflow = ChapterWorkflow::new(generator, MemoryStore::new()).with_config(fast());

        let outcome = workflow
            .advance(&ChapterState::new("hero"), "p", &CancellationToken::new())
            .await
            .expect("advance should succeed");
        match outcome {
            WorkflowOutcome::Committed(advance) => assert_eq!(advance.attempts, 3),
            WorkflowOutcome::Skipped => panic!("expected a committed chapter"),
        }
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let generator = MockGenerator::new(vec![MockReply::fail("down"); 5]);
        let workflow = ChapterWorkflow::new(generator, MemoryStore::new())
            .with_config(fast().with_max_retries(2));

        let result = workflow
            .advance(&ChapterState::new("hero"), "p", &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(WorkflowError::Transport { attempts: 3, .. })));
        assert_eq!(workflow.generator().prompts().len(), 3);
        assert!(!workflow.is_running());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let workflow = ChapterWorkflow::new(MockGenerator::new(vec![]), MemoryStore::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = workflow.advance(&ChapterState::new("hero"), "p", &cancel).await;
        assert!(matches!(result, Err(WorkflowError::Cancelled)));
        assert!(workflow.generator().prompts().is_empty());
    }

    #[tokio::test]
    async fn test_unparseable_output() {
        let generator = MockGenerator::new(vec![MockReply::text("no json here")]);
        let workflow = ChapterWorkflow::new(generator, MemoryStore::new()).with_config(fast());

        let result = workflow
            .advance(&ChapterState::new("hero"), "p", &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(WorkflowError::InvalidDelta(_))));
    }
}
