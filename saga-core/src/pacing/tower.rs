//! The pacing control tower.

use super::model::{
    Constraint, Device, DeviceUsage, DissonanceOpportunity, ImpendingThreshold, IntensityRange,
    IntensitySample, PacingDirective, PacingState, Phase, PhaseTransition, RhythmCycle,
    StorylineProgress,
};
use super::{PacingConfig, PhaseCeilingMode};
use crate::delta::{ProgressDelta, RhythmAssessment};
use crate::json::first_non_empty_str;
use crate::resolve::{CategoryHints, StorylineCategoryResolver};
use crate::state::{ChapterState, NarrativeStyle, StorylineCategory};
use serde_json::{json, Map, Value};

const TITLE_KEYS: &[&str] = &["title", "storyline_title", "name"];
const SUMMARY_KEYS: &[&str] = &["summary", "storyline_summary", "description", "current_summary"];
const TYPE_KEYS: &[&str] = &["type", "storyline_type"];

/// Legacy or alternate summary keys folded onto `current_summary` on load.
const LEGACY_SUMMARY_KEYS: &[&str] = &["summary", "latest_summary", "status_summary"];

/// Stage label for a progress value.
pub fn stage_for_progress(progress: f64) -> &'static str {
    match progress {
        p if p < 15.0 => "introduction",
        p if p < 25.0 => "setup",
        p if p < 50.0 => "rising_action",
        p if p < 75.0 => "escalation",
        p if p < 90.0 => "climax_approach",
        _ => "resolution",
    }
}

/// Rule-based pacing scheduler.
///
/// Stateless itself: all bookkeeping lives in the chapter state's
/// `meta.narrative_control_tower`, so the tower can be shared freely.
#[derive(Debug, Clone, Default)]
pub struct PacingControlTower {
    config: PacingConfig,
}

impl PacingControlTower {
    pub fn new(config: PacingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PacingConfig {
        &self.config
    }

    /// Fold one closed chapter into the pacing state, then recompute the
    /// directive. The chapter identity is `state.uid`.
    pub fn update(
        &self,
        state: &mut ChapterState,
        rhythm: Option<&RhythmAssessment>,
        progress: &[ProgressDelta],
    ) {
        let chapter = state.uid.clone();
        let style = state.meta.narrative_mode.narrative_style;

        if let Some(assessment) = rhythm {
            let pacing = &mut state.meta.narrative_control_tower;
            self.record_intensity(pacing, &chapter, assessment.intensity());
            self.advance_rhythm(&mut pacing.rhythm, assessment, &chapter, style);
            self.record_devices(pacing, &assessment.devices_used, &chapter);
            pacing.cooldown_flagged = assessment.requires_cooldown;
        }
        self.refresh_rolling_counts(&mut state.meta.narrative_control_tower);

        for delta in progress {
            self.apply_progress(state, delta, &chapter);
        }

        let pacing = &state.meta.narrative_control_tower;
        state.meta.narrative_control_tower.directive = self.compute_directive(pacing, style);
    }

    /// Build the directive from the current pacing state. Never patched
    /// incrementally.
    pub fn compute_directive(&self, pacing: &PacingState, style: NarrativeStyle) -> PacingDirective {
        let mut directive = PacingDirective::default();

        if pacing.cooldown_flagged {
            directive.mandatory_constraints.push(Constraint::CooldownRequired {
                intensity: self.config.cooldown_intensity,
                suggested_archetype: self.config.cooldown_archetype.clone(),
            });
            directive.suggested_intensity = self.config.cooldown_intensity;
        } else {
            directive.suggested_intensity = IntensityRange::default();
        }

        for device in Device::ALL {
            let tracker = pacing.device_cooldowns.tracker(device);
            if tracker.rolling_count >= self.config.device_limit {
                directive
                    .mandatory_constraints
                    .push(Constraint::SignatureDeviceForbidden {
                        device,
                        rolling_count: tracker.rolling_count,
                    });
            }
        }

        for (id, record) in &pacing.storyline_progress {
            for &checkpoint in &self.config.checkpoints {
                let target = f64::from(checkpoint);
                let progress = record.current_progress;
                if progress >= target - self.config.threshold_lookahead && progress < target {
                    directive.impending_thresholds.push(ImpendingThreshold {
                        storyline_id: id.clone(),
                        current_progress: progress,
                        threshold: checkpoint,
                        distance: target - progress,
                    });
                }
            }
        }

        if pacing.storyline_progress.len() >= 2 {
            let by_progress =
                |a: &(&String, &StorylineProgress), b: &(&String, &StorylineProgress)| {
                    a.1.current_progress.total_cmp(&b.1.current_progress)
                };
            let leading = pacing.storyline_progress.iter().max_by(by_progress);
            let lagging = pacing.storyline_progress.iter().min_by(by_progress);
            if let (Some((lead_id, lead)), Some((lag_id, lag))) = (leading, lagging) {
                let gap = lead.current_progress - lag.current_progress;
                if gap >= self.config.dissonance_gap {
                    directive.dissonance_opportunities.push(DissonanceOpportunity {
                        leading: lead_id.clone(),
                        leading_progress: lead.current_progress,
                        lagging: lag_id.clone(),
                        lagging_progress: lag.current_progress,
                        gap,
                    });
                }
            }
        }

        let rhythm = &pacing.rhythm;
        let ceiling = self.ceiling(rhythm.current_phase, style);
        if rhythm.phase_duration > ceiling {
            directive.phase_advisory = Some(format!(
                "{} has lasted {} chapters, past its soft ceiling of {} for {} pacing",
                rhythm.current_phase, rhythm.phase_duration, ceiling, style
            ));
        }

        directive
    }

    /// On-load pass: re-materialize every tracked storyline, fold alternate
    /// summary keys onto `current_summary`, recompute the directive.
    /// Idempotent.
    pub fn reconcile(&self, state: &mut ChapterState) {
        let tracked: Vec<(String, StorylineProgress)> = state
            .meta
            .narrative_control_tower
            .storyline_progress
            .iter()
            .map(|(id, p)| (id.clone(), p.clone()))
            .collect();

        for (id, record) in tracked {
            let fragment = progress_fragment(&record);
            let category = record.category.unwrap_or_else(|| {
                StorylineCategoryResolver::resolve_category(
                    &id,
                    CategoryHints {
                        category: None,
                        storyline_type: record.storyline_type.as_deref(),
                    },
                )
            });
            let used = StorylineCategoryResolver::materialize(state, &id, category, &[&fragment]);
            if let Some(entry) = state.meta.narrative_control_tower.storyline_progress.get_mut(&id) {
                entry.category = Some(used);
            }
        }

        let mut normalized = 0usize;
        for category in StorylineCategory::ALL {
            for status in state.dynamic_state.storylines.category_mut(category).values_mut() {
                for key in LEGACY_SUMMARY_KEYS {
                    let Some(value) = status.extra.remove(*key) else {
                        continue;
                    };
                    normalized += 1;
                    if status.current_summary.trim().is_empty() {
                        if let Some(text) = value.as_str().filter(|s| !s.trim().is_empty()) {
                            status.current_summary = text.to_string();
                        }
                    }
                }
            }
        }
        if normalized > 0 {
            tracing::debug!(normalized, "folded legacy storyline summary fields");
        }

        let style = state.meta.narrative_mode.narrative_style;
        let pacing = &state.meta.narrative_control_tower;
        state.meta.narrative_control_tower.directive = self.compute_directive(pacing, style);
    }

    // =========================================================================
    // Update steps
    // =========================================================================

    fn record_intensity(&self, pacing: &mut PacingState, chapter: &str, intensity: u8) {
        pacing.recent_chapters_intensity.push(IntensitySample {
            chapter: chapter.to_string(),
            intensity,
        });
        trim_front(&mut pacing.recent_chapters_intensity, self.config.window_size);
    }

    fn advance_rhythm(
        &self,
        rhythm: &mut RhythmCycle,
        assessment: &RhythmAssessment,
        chapter: &str,
        style: NarrativeStyle,
    ) {
        if assessment.phase_transition {
            let target = match assessment.next_phase.as_deref() {
                Some(name) => Phase::parse(name).unwrap_or_else(|| {
                    tracing::warn!(phase = name, "unrecognized next phase, using natural successor");
                    rhythm.current_phase.next()
                }),
                None => rhythm.current_phase.next(),
            };
            if target == rhythm.current_phase {
                rhythm.phase_duration += 1;
            } else {
                self.transition(rhythm, target, chapter);
            }
        } else {
            rhythm.phase_duration += 1;
        }

        let ceiling = self.ceiling(rhythm.current_phase, style);
        if rhythm.phase_duration > ceiling {
            tracing::warn!(
                phase = %rhythm.current_phase,
                duration = rhythm.phase_duration,
                ceiling,
                %style,
                "phase overran its soft ceiling"
            );
            if self.config.ceiling_mode == PhaseCeilingMode::Enforced {
                let next = rhythm.current_phase.next();
                self.transition(rhythm, next, chapter);
            }
        }
    }

    fn transition(&self, rhythm: &mut RhythmCycle, to: Phase, chapter: &str) {
        let from = rhythm.current_phase;
        if from == Phase::Rest && to == Phase::BuildUp {
            rhythm.cycle_count += 1;
        }
        rhythm.phase_history.push(PhaseTransition {
            from,
            to,
            chapter: chapter.to_string(),
            duration: rhythm.phase_duration,
        });
        trim_front(&mut rhythm.phase_history, self.config.phase_history_cap);
        rhythm.current_phase = to;
        rhythm.phase_duration = 1;
        tracing::debug!(%from, %to, cycles = rhythm.cycle_count, "phase transition");
    }

    fn record_devices(&self, pacing: &mut PacingState, devices: &[String], chapter: &str) {
        for name in devices {
            let Some(device) = Device::parse(name) else {
                tracing::warn!(device = %name, "unknown narrative device ignored");
                continue;
            };
            let tracker = pacing.device_cooldowns.tracker_mut(device);
            tracker.usage_history.push(DeviceUsage {
                chapter: chapter.to_string(),
                note: None,
            });
            trim_front(&mut tracker.usage_history, self.config.device_history_cap);
            tracker.last_used_chapter = Some(chapter.to_string());
        }
    }

    /// Rolling counts follow the intensity window, so every tracker is
    /// refreshed whenever the window moves.
    fn refresh_rolling_counts(&self, pacing: &mut PacingState) {
        let window: Vec<String> = pacing.window_chapters().map(str::to_string).collect();
        for device in Device::ALL {
            let tracker = pacing.device_cooldowns.tracker_mut(device);
            tracker.rolling_count = tracker
                .usage_history
                .iter()
                .filter(|usage| window.contains(&usage.chapter))
                .count() as u32;
        }
    }

    fn apply_progress(&self, state: &mut ChapterState, delta: &ProgressDelta, chapter: &str) {
        let id = delta.storyline_id.trim();
        if id.is_empty() {
            tracing::warn!("storyline progress delta without an id ignored");
            return;
        }
        let fragment = delta.metadata_fragment();
        let fragments = [&fragment];

        let record = state
            .meta
            .narrative_control_tower
            .storyline_progress
            .entry(id.to_string())
            .or_insert_with(|| StorylineProgress {
                current_progress: 0.0,
                current_stage: stage_for_progress(0.0).to_string(),
                last_delta: 0.0,
                last_updated_chapter: None,
                category: None,
                title: None,
                summary: None,
                storyline_type: None,
            });

        record.current_progress = (record.current_progress + delta.progress_delta).clamp(0.0, 100.0);
        record.last_delta = delta.progress_delta;
        record.current_stage = delta
            .new_stage
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| stage_for_progress(record.current_progress).to_string());
        record.last_updated_chapter = Some(chapter.to_string());

        capture(&mut record.title, first_non_empty_str(&fragments, TITLE_KEYS));
        capture(&mut record.summary, first_non_empty_str(&fragments, SUMMARY_KEYS));
        capture(&mut record.storyline_type, first_non_empty_str(&fragments, TYPE_KEYS));

        let category = record.category.unwrap_or_else(|| {
            let mut hints = CategoryHints::from_fragment(&fragment);
            if hints.storyline_type.is_none() {
                hints.storyline_type = record.storyline_type.as_deref();
            }
            StorylineCategoryResolver::resolve_category(id, hints)
        });
        let merged = progress_fragment(record);

        let used =
            StorylineCategoryResolver::materialize(state, id, category, &[&fragment, &merged]);
        if let Some(entry) = state.meta.narrative_control_tower.storyline_progress.get_mut(id) {
            entry.category = Some(used);
        }
    }

    fn ceiling(&self, phase: Phase, style: NarrativeStyle) -> u32 {
        (self.config.base_ceiling(phase) * style.duration_multiplier()).ceil() as u32
    }
}

fn trim_front<T>(items: &mut Vec<T>, cap: usize) {
    if items.len() > cap {
        let excess = items.len() - cap;
        items.drain(..excess);
    }
}

fn capture(slot: &mut Option<String>, candidate: Option<&str>) {
    if slot.as_deref().map_or(true, |s| s.trim().is_empty()) {
        if let Some(value) = candidate {
            *slot = Some(value.to_string());
        }
    }
}

/// Metadata a progress record carries, as a materialization fragment.
fn progress_fragment(record: &StorylineProgress) -> Value {
    let mut map = Map::new();
    if let Some(title) = &record.title {
        map.insert("title".into(), json!(title));
    }
    if let Some(summary) = &record.summary {
        map.insert("summary".into(), json!(summary));
    }
    if let Some(kind) = &record.storyline_type {
        map.insert("type".into(), json!(kind));
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assessment(intensity: f64) -> RhythmAssessment {
        RhythmAssessment {
            emotional_intensity: intensity,
            ..Default::default()
        }
    }

    fn tracked(progress: &[(&str, f64)]) -> PacingState {
        let mut pacing = PacingState::default();
        for (id, value) in progress {
            pacing.storyline_progress.insert(
                id.to_string(),
                StorylineProgress {
                    current_progress: *value,
                    current_stage: stage_for_progress(*value).to_string(),
                    last_delta: 0.0,
                    last_updated_chapter: None,
                    category: None,
                    title: None,
                    summary: None,
                    storyline_type: None,
                },
            );
        }
        pacing
    }

    #[test]
    fn test_dissonance_gap_examples() {
        let tower = PacingControlTower::default();

        let directive =
            tower.compute_directive(&tracked(&[("a", 85.0), ("b", 40.0)]), NarrativeStyle::Balanced);
        assert_eq!(directive.dissonance_opportunities.len(), 1);
        let opportunity = &directive.dissonance_opportunities[0];
        assert_eq!(opportunity.leading, "a");
        assert_eq!(opportunity.lagging, "b");
        assert_eq!(opportunity.gap, 45.0);

        let directive =
            tower.compute_directive(&tracked(&[("a", 70.0), ("b", 40.0)]), NarrativeStyle::Balanced);
        assert!(directive.dissonance_opportunities.is_empty());
    }

    #[test]
    fn test_single_storyline_has_no_dissonance() {
        let tower = PacingControlTower::default();
        let directive = tower.compute_directive(&tracked(&[("a", 95.0)]), NarrativeStyle::Balanced);
        assert!(directive.dissonance_opportunities.is_empty());
    }

    #[test]
    fn test_impending_threshold_examples() {
        let tower = PacingControlTower::default();

        let directive = tower.compute_directive(&tracked(&[("a", 47.0)]), NarrativeStyle::Balanced);
        assert_eq!(directive.impending_thresholds.len(), 1);
        assert_eq!(directive.impending_thresholds[0].threshold, 50);
        assert_eq!(directive.impending_thresholds[0].distance, 3.0);

        let directive = tower.compute_directive(&tracked(&[("a", 30.0)]), NarrativeStyle::Balanced);
        assert!(directive.impending_thresholds.is_empty());
    }

    #[test]
    fn test_rolling_windows_stay_bounded() {
        let tower = PacingControlTower::default();
        let mut state = ChapterState::new("hero");

        for i in 0..23 {
            state = state.advance();
            let rhythm = RhythmAssessment {
                emotional_intensity: (i % 10) as f64,
                phase_transition: i % 2 == 0,
                devices_used: vec!["spotlight".into()],
                ..Default::default()
            };
            tower.update(&mut state, Some(&rhythm), &[]);

            let pacing = &state.meta.narrative_control_tower;
            assert!(pacing.recent_chapters_intensity.len() <= 5);
            assert!(pacing.rhythm.phase_history.len() <= 5);
            assert!(pacing.device_cooldowns.spotlight.usage_history.len() <= 10);
            assert!(pacing.device_cooldowns.spotlight.rolling_count <= 5);
        }
        assert_eq!(state.meta.narrative_control_tower.recent_chapters_intensity.len(), 5);
    }

    #[test]
    fn test_full_cycle_counts() {
        let tower = PacingControlTower::default();
        let mut state = ChapterState::new("hero");
        let flip = RhythmAssessment {
            phase_transition: true,
            ..Default::default()
        };

        for _ in 0..4 {
            state = state.advance();
            tower.update(&mut state, Some(&flip), &[]);
        }
        let rhythm = &state.meta.narrative_control_tower.rhythm;
        assert_eq!(rhythm.current_phase, Phase::BuildUp);
        assert_eq!(rhythm.cycle_count, 1);
        assert_eq!(rhythm.phase_duration, 1);
        assert_eq!(rhythm.phase_history.len(), 4);
    }

    #[test]
    fn test_device_overuse_forbidden_then_expires() {
        let tower = PacingControlTower::default();
        let mut state = ChapterState::new("hero");
        let with_flashback = RhythmAssessment {
            devices_used: vec!["Flashback".into()],
            ..Default::default()
        };

        for _ in 0..2 {
            state = state.advance();
            tower.update(&mut state, Some(&with_flashback), &[]);
        }
        assert_eq!(
            state.meta.narrative_control_tower.directive.forbidden_devices(),
            vec![Device::Flashback]
        );

        // Five quiet chapters push both uses out of the window
        for _ in 0..5 {
            state = state.advance();
            tower.update(&mut state, Some(&assessment(3.0)), &[]);
        }
        let pacing = &state.meta.narrative_control_tower;
        assert_eq!(pacing.device_cooldowns.flashback.rolling_count, 0);
        assert!(pacing.directive.forbidden_devices().is_empty());
    }

    #[test]
    fn test_cooldown_narrows_intensity() {
        let tower = PacingControlTower::default();
        let mut state = ChapterState::new("hero");
        let hot = RhythmAssessment {
            emotional_intensity: 9.0,
            requires_cooldown: true,
            ..Default::default()
        };
        tower.update(&mut state, Some(&hot), &[]);

        let directive = &state.meta.narrative_control_tower.directive;
        assert!(directive.requires_cooldown());
        assert_eq!(directive.suggested_intensity, IntensityRange { min: 1, max: 5 });
    }

    #[test]
    fn test_phase_ceiling_advisory_and_enforced() {
        let mut state = ChapterState::new("hero");
        state.meta.narrative_control_tower.rhythm.current_phase = Phase::Release;

        let advisory = PacingControlTower::default();
        let mut advised = state.clone();
        advisory.update(&mut advised, Some(&assessment(4.0)), &[]);
        let pacing = &advised.meta.narrative_control_tower;
        assert_eq!(pacing.rhythm.current_phase, Phase::Release);
        assert_eq!(pacing.rhythm.phase_duration, 2);
        assert!(pacing.directive.phase_advisory.is_some());

        let enforced =
            PacingControlTower::new(PacingConfig::new().with_ceiling_mode(PhaseCeilingMode::Enforced));
        let mut forced = state.clone();
        enforced.update(&mut forced, Some(&assessment(4.0)), &[]);
        let pacing = &forced.meta.narrative_control_tower;
        assert_eq!(pacing.rhythm.current_phase, Phase::Rest);
        assert!(pacing.directive.phase_advisory.is_none());
    }

    #[test]
    fn test_slow_burn_extends_ceiling() {
        let tower = PacingControlTower::default();
        let mut state = ChapterState::new("hero");
        state.meta.narrative_mode.narrative_style = NarrativeStyle::SlowBurn;
        state.meta.narrative_control_tower.rhythm.current_phase = Phase::Release;

        // ceil(1 * 1.5) = 2, so a second chapter is still within bounds
        tower.update(&mut state, Some(&assessment(4.0)), &[]);
        assert!(state.meta.narrative_control_tower.directive.phase_advisory.is_none());
    }

    #[test]
    fn test_progress_materializes_storyline() {
        let tower = PacingControlTower::default();
        let mut state = ChapterState::new("hero");
        let delta = ProgressDelta::new("storyline_0042", 30.0)
            .with_metadata("storyline_type", "romance")
            .with_metadata("title", "Letters to Mira");

        tower.update(&mut state, None, &[delta]);

        let record = &state.meta.narrative_control_tower.storyline_progress["storyline_0042"];
        assert_eq!(record.current_progress, 30.0);
        assert_eq!(record.current_stage, "rising_action");
        assert_eq!(record.category, Some(StorylineCategory::RelationshipArcs));
        let static_record = &state.static_matrices.storylines.relationship_arcs["storyline_0042"];
        assert_eq!(static_record["title"], "Letters to Mira");
        assert!(state
            .dynamic_state
            .storylines
            .relationship_arcs
            .contains_key("storyline_0042"));
    }

    #[test]
    fn test_progress_clamps_and_keeps_rich_record() {
        let tower = PacingControlTower::default();
        let mut state = ChapterState::new("hero");
        state.static_matrices.storylines.main_quests.insert(
            "quest_crown".into(),
            json!({"title": "The Lost Crown", "summary": "A stolen heirloom"}),
        );

        tower.update(&mut state, None, &[ProgressDelta::new("quest_crown", 80.0)]);
        tower.update(&mut state, None, &[ProgressDelta::new("quest_crown", 45.0)]);

        let record = &state.meta.narrative_control_tower.storyline_progress["quest_crown"];
        assert_eq!(record.current_progress, 100.0);
        assert_eq!(record.current_stage, "resolution");
        assert_eq!(record.category, Some(StorylineCategory::MainQuests));
        assert_eq!(
            state.static_matrices.storylines.main_quests["quest_crown"]["title"],
            "The Lost Crown"
        );
    }

    #[test]
    fn test_reconcile_is_idempotent_and_folds_summaries() {
        let tower = PacingControlTower::default();
        let mut state = ChapterState::new("hero");
        state.meta.narrative_control_tower = tracked(&[("arc_mira", 20.0)]);
        state
            .dynamic_state
            .storylines
            .relationship_arcs
            .entry("arc_mira".into())
            .or_default()
            .extra
            .insert("latest_summary".into(), json!("Mira forgave the hero"));

        tower.reconcile(&mut state);
        let once = state.clone();
        tower.reconcile(&mut state);
        assert_eq!(state, once);

        let status = &state.dynamic_state.storylines.relationship_arcs["arc_mira"];
        assert_eq!(status.current_summary, "Mira forgave the hero");
        assert!(status.extra.is_empty());
        assert!(state
            .static_matrices
            .storylines
            .relationship_arcs
            .contains_key("arc_mira"));
    }

    #[test]
    fn test_stage_labels() {
        assert_eq!(stage_for_progress(0.0), "introduction");
        assert_eq!(stage_for_progress(15.0), "setup");
        assert_eq!(stage_for_progress(49.9), "rising_action");
        assert_eq!(stage_for_progress(74.0), "escalation");
        assert_eq!(stage_for_progress(89.0), "climax_approach");
        assert_eq!(stage_for_progress(100.0), "resolution");
    }
}
