//! Narrative pacing.
//!
//! The [`PacingControlTower`] turns rolling per-chapter history (intensity
//! readings, rhythm phase, device usage, storyline progress) into a
//! forward-looking [`PacingDirective`] for the next chapter. Everything it
//! keeps lives in `meta.narrative_control_tower` as a [`PacingState`].

mod model;
mod tower;

pub use model::{
    Constraint, Device, DeviceCooldowns, DeviceTracker, DeviceUsage, DissonanceOpportunity,
    ImpendingThreshold, IntensityRange, IntensitySample, PacingDirective, PacingState, Phase,
    PhaseTransition, RhythmCycle, StorylineProgress,
};
pub use tower::{stage_for_progress, PacingControlTower};

use std::collections::HashMap;

/// What happens when a phase outlasts its style-adjusted ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PhaseCeilingMode {
    /// Log a warning and surface `directive.phase_advisory`.
    #[default]
    Advisory,
    /// Force a transition to the next phase.
    Enforced,
}

/// Tunables for the pacing tower.
#[derive(Debug, Clone)]
pub struct PacingConfig {
    /// Intensity samples kept in the rolling window.
    pub window_size: usize,

    /// Phase transitions kept in history.
    pub phase_history_cap: usize,

    /// Usage records kept per device.
    pub device_history_cap: usize,

    /// Progress checkpoints (0-100).
    pub checkpoints: Vec<u8>,

    /// How far below a checkpoint a storyline counts as impending.
    pub threshold_lookahead: f64,

    /// Minimum max-min progress gap for a dissonance opportunity.
    pub dissonance_gap: f64,

    /// Rolling device uses at which the device is forbidden.
    pub device_limit: u32,

    /// Soft ceiling per phase, in chapters, before the style multiplier.
    pub phase_ceilings: HashMap<Phase, f64>,

    pub ceiling_mode: PhaseCeilingMode,

    /// Intensity band imposed by a cooldown.
    pub cooldown_intensity: IntensityRange,

    /// Lower-energy chapter archetype suggested with a cooldown.
    pub cooldown_archetype: String,
}

impl Default for PacingConfig {
    fn default() -> Self {
        let phases = [Phase::BuildUp, Phase::Hold, Phase::Release, Phase::Rest];
        Self {
            window_size: 5,
            phase_history_cap: 5,
            device_history_cap: 10,
            checkpoints: vec![15, 25, 50, 75, 90],
            threshold_lookahead: 10.0,
            dissonance_gap: 40.0,
            device_limit: 2,
            phase_ceilings: phases.iter().map(|p| (*p, p.base_ceiling())).collect(),
            ceiling_mode: PhaseCeilingMode::Advisory,
            cooldown_intensity: IntensityRange { min: 1, max: 5 },
            cooldown_archetype: "quiet_interlude".to_string(),
        }
    }
}

impl PacingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_window_size(mut self, size: usize) -> Self {
        self.window_size = size;
        self
    }

    pub fn with_checkpoints(mut self, checkpoints: Vec<u8>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    pub fn with_dissonance_gap(mut self, gap: f64) -> Self {
        self.dissonance_gap = gap;
        self
    }

    pub fn with_device_limit(mut self, limit: u32) -> Self {
        self.device_limit = limit;
        self
    }

    pub fn with_phase_ceiling(mut self, phase: Phase, chapters: f64) -> Self {
        self.phase_ceilings.insert(phase, chapters);
        self
    }

    pub fn with_ceiling_mode(mut self, mode: PhaseCeilingMode) -> Self {
        self.ceiling_mode = mode;
        self
    }

    pub fn with_cooldown_archetype(mut self, archetype: impl Into<String>) -> Self {
        self.cooldown_archetype = archetype.into();
        self
    }

    /// Base ceiling for `phase`, falling back to the built-in value.
    pub fn base_ceiling(&self, phase: Phase) -> f64 {
        self.phase_ceilings
            .get(&phase)
            .copied()
            .unwrap_or_else(|| phase.base_ceiling())
    }
}
