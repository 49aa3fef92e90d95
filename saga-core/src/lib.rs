//! Chapter-by-chapter world-state engine for AI-authored narratives.
//!
//! This crate provides:
//! - A versioned chapter snapshot with static and dynamic layers
//! - Fuzzy entity and storyline-category resolution
//! - Delta application that skips bad items instead of aborting
//! - A rule-based pacing tower that emits per-chapter directives
//! - Snapshot persistence and a cancellable chapter workflow
//!
//! # Quick Start
//!
//! ```ignore
//! use saga_core::{ChapterState, Delta, DeltaMergeEngine};
//!
//! let prior = ChapterState::new("hero");
//! let delta = Delta::from_model_output(r#"{"new_handoff_memo": "Resume at the gate"}"#)?;
//!
//! let outcome = DeltaMergeEngine::default().apply(&prior, &delta);
//! for rejection in &outcome.report.rejections {
//!     println!("skipped {}: {}", rejection.target, rejection.reason);
//! }
//! let next = outcome.state;
//! ```

pub mod delta;
pub mod json;
pub mod merge;
pub mod pacing;
pub mod persist;
pub mod resolve;
pub mod state;
pub mod testing;
pub mod workflow;

// Primary public API
pub use delta::{Delta, Loose};
pub use merge::{CreationPolicy, DeltaMergeEngine, MergeConfig, MergeOutcome, MergeReport};
pub use pacing::{PacingConfig, PacingControlTower, PacingDirective, PhaseCeilingMode};
pub use persist::{load_state, JsonFileStore, LoadSource, MemoryStore, PersistError, SnapshotStore};
pub use resolve::{CategoryHints, EntityResolver, StorylineCategoryResolver};
pub use state::{ChapterState, EntityKind, EntityRef, StateError, StorylineCategory, WorldCategory};
pub use testing::{MockGenerator, MockReply, TestHarness};
pub use workflow::{
    CancellationToken, ChapterWorkflow, GenerationError, TextGenerator, WorkflowConfig,
    WorkflowError, WorkflowOutcome,
};
