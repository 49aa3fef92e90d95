//! Delta application.
//!
//! [`DeltaMergeEngine::apply`] turns `(prior, delta)` into the next chapter's
//! snapshot without touching `prior`. Sections run in a fixed order:
//!
//! 1. creations
//! 2. character updates
//! 3. world-entity updates
//! 4. storyline updates
//! 5. running summary and hand-off memo
//! 6. chronology
//! 7. narrative arcs
//! 8. relationship-graph edges
//! 9. stylistic archive
//! 10. pacing
//!
//! A bad item is skipped and recorded in the [`MergeReport`]; it never aborts
//! the merge. There is no rollback across sections, but since the result is a
//! new value the caller decides whether to commit it.

mod entities;
mod narrative;
mod report;

pub use report::{AppliedOp, MergeReport, Rejection, RejectionKind, Section};

use crate::delta::{Delta, Loose, ProgressDelta};
use crate::pacing::PacingControlTower;
use crate::state::ChapterState;

/// Whether an update to an unknown id may create the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationPolicy {
    /// Unknown ids are rejected; creation goes through `creations`.
    Reject,
    /// Unknown ids create a new record from the update.
    CreateOnUpdate,
}

/// Merge tunables.
#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Policy for character updates.
    pub characters: CreationPolicy,

    /// Policy for world-entity updates.
    pub world: CreationPolicy,

    /// Policy for storyline updates.
    pub storylines: CreationPolicy,

    /// Policy for narrative-arc updates.
    pub arcs: CreationPolicy,

    /// Token replaced by the chapter uid inside relationship-graph edges.
    pub placeholder_token: String,

    /// Affinity history entries kept per relationship.
    pub affinity_history_cap: usize,

    /// History entries kept per storyline status record.
    pub storyline_history_cap: usize,

    /// Characters of reasoning kept in each affinity history entry.
    pub reason_excerpt_chars: usize,

    /// Summed descriptor count at which a word is flagged overused.
    pub overuse_threshold: u32,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            characters: CreationPolicy::Reject,
            world: CreationPolicy::Reject,
            storylines: CreationPolicy::Reject,
            arcs: CreationPolicy::CreateOnUpdate,
            placeholder_token: "{{current_chapter}}".to_string(),
            affinity_history_cap: 10,
            storyline_history_cap: 10,
            reason_excerpt_chars: 80,
            overuse_threshold: 5,
        }
    }
}

impl MergeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_character_policy(mut self, policy: CreationPolicy) -> Self {
        self.characters = policy;
        self
    }

    pub fn with_world_policy(mut self, policy: CreationPolicy) -> Self {
        self.world = policy;
        self
    }

    pub fn with_storyline_policy(mut self, policy: CreationPolicy) -> Self {
        self.storylines = policy;
        self
    }

    pub fn with_arc_policy(mut self, policy: CreationPolicy) -> Self {
        self.arcs = policy;
        self
    }

    pub fn with_placeholder_token(mut self, token: impl Into<String>) -> Self {
        self.placeholder_token = token.into();
        self
    }

    pub fn with_storyline_history_cap(mut self, cap: usize) -> Self {
        self.storyline_history_cap = cap;
        self
    }
}

/// Result of one merge.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// The next chapter's snapshot, sealed.
    pub state: ChapterState,
    pub report: MergeReport,
}

/// Applies Deltas to chapter snapshots.
#[derive(Debug, Clone, Default)]
pub struct DeltaMergeEngine {
    config: MergeConfig,
    pacing: PacingControlTower,
}

impl DeltaMergeEngine {
    pub fn new(config: MergeConfig) -> Self {
        Self {
            config,
            pacing: PacingControlTower::default(),
        }
    }

    pub fn with_pacing(mut self, pacing: PacingControlTower) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    pub fn pacing(&self) -> &PacingControlTower {
        &self.pacing
    }

    /// Produce the next chapter from `prior` and `delta`.
    ///
    /// The result gets a fresh uid, which is also the chapter identity
    /// stamped on every history entry this merge writes.
    pub fn apply(&self, prior: &ChapterState, delta: &Delta) -> MergeOutcome {
        let mut state = prior.advance();
        let report = self.apply_in_place(&mut state, delta);
        MergeOutcome { state, report }
    }

    /// Apply `delta` directly to `state`, keeping its uid.
    pub fn apply_in_place(&self, state: &mut ChapterState, delta: &Delta) -> MergeReport {
        let chapter = state.uid.clone();
        let span = tracing::info_span!("merge", chapter = %chapter);
        let _enter = span.enter();

        let mut pass = MergePass {
            state,
            report: MergeReport::new(),
            config: &self.config,
            chapter,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        pass.creations(&delta.creations);
        pass.characters(&delta.updates.characters);
        pass.world(&delta.updates.worldview);
        pass.storylines(&delta.updates.storylines);
        pass.narrative(delta);
        if let Some(chronology) = &delta.chronology_update {
            if let Some(chronology) =
                pass.loose(Section::Chronology, "chronology_update", chronology)
            {
                pass.chronology(chronology);
            }
        }
        let arcs = pass.loose_items(
            Section::Arcs,
            "active_narrative_arcs",
            &delta.updates.meta.active_narrative_arcs,
        );
        pass.arcs(&arcs);
        let edges = pass.loose_items(
            Section::RelationshipGraph,
            "relationship_updates",
            &delta.relationship_updates,
        );
        pass.relationship_edges(&edges);
        if let Some(stylistic) = &delta.stylistic_analysis_delta {
            if let Some(stylistic) =
                pass.loose(Section::Stylistic, "stylistic_analysis_delta", stylistic)
            {
                pass.stylistic(stylistic);
            }
        }

        let rhythm = match &delta.rhythm_assessment {
            Some(rhythm) => pass.loose(Section::Pacing, "rhythm_assessment", rhythm),
            None => None,
        };
        let progress: Vec<ProgressDelta> = pass
            .loose_items(
                Section::Pacing,
                "storyline_progress_deltas",
                &delta.storyline_progress_deltas,
            )
            .into_iter()
            .cloned()
            .collect();
        if rhythm.is_some() || !progress.is_empty() {
            self.pacing.update(pass.state, rhythm, &progress);
            pass.report.applied(
                Section::Pacing,
                "narrative_control_tower",
                format!("{} progress update(s)", progress.len()),
            );
        }

        for repaired in pass.state.repair_orphans() {
            pass.report
                .applied(Section::Repair, repaired.to_string(), "placeholder static record");
        }
        pass.state.seal();

        let report = pass.report;
        tracing::info!(
            applied = report.applied.len(),
            rejected = report.rejections.len(),
            "delta merged"
        );
        report
    }
}

/// Working context for one merge.
pub(crate) struct MergePass<'a> {
    pub(crate) state: &'a mut ChapterState,
    pub(crate) report: MergeReport,
    pub(crate) config: &'a MergeConfig,
    /// Chapter uid stamped on history entries.
    pub(crate) chapter: String,
    pub(crate) timestamp: String,
}

impl MergePass<'_> {
    /// The parsed item, or a rejection naming `target`.
    pub(crate) fn loose<'d, T>(
        &mut self,
        section: Section,
        target: &str,
        item: &'d Loose<T>,
    ) -> Option<&'d T> {
        match item {
            Loose::Parsed(item) => Some(item),
            Loose::Malformed { error, .. } => {
                self.report.reject(
                    section,
                    target,
                    RejectionKind::Invalid,
                    format!("malformed item: {error}"),
                );
                None
            }
        }
    }

    /// Every parsed item; each malformed one is rejected as `label[index]`.
    pub(crate) fn loose_items<'d, T>(
        &mut self,
        section: Section,
        label: &str,
        items: &'d [Loose<T>],
    ) -> Vec<&'d T> {
        items
            .iter()
            .enumerate()
            .filter_map(|(index, item)| self.loose(section, &format!("{label}[{index}]"), item))
            .collect()
    }
}
