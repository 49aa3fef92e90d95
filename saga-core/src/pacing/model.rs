//! Persistent pacing sub-document (`meta.narrative_control_tower`).

use crate::state::StorylineCategory;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The four-phase narrative rhythm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    BuildUp,
    Hold,
    Release,
    Rest,
}

impl Phase {
    /// The phase that naturally follows this one.
    pub fn next(&self) -> Phase {
        match self {
            Phase::BuildUp => Phase::Hold,
            Phase::Hold => Phase::Release,
            Phase::Release => Phase::Rest,
            Phase::Rest => Phase::BuildUp,
        }
    }

    /// Parse a loose phase name ("build-up", "Climax", "cooldown", ...).
    pub fn parse(name: &str) -> Option<Phase> {
        let phase = match crate::state::category::normalize(name).as_str() {
            "buildup" | "build" | "rising" | "setup" => Phase::BuildUp,
            "hold" | "climax" | "peak" | "sustain" => Phase::Hold,
            "release" | "resolution" | "falling" => Phase::Release,
            "rest" | "cooldown" | "recovery" | "quiet" => Phase::Rest,
            _ => return None,
        };
        Some(phase)
    }

    /// Base soft ceiling (in chapters) before the style multiplier.
    pub fn base_ceiling(&self) -> f64 {
        match self {
            Phase::BuildUp => 4.0,
            Phase::Hold => 2.0,
            Phase::Release => 1.0,
            Phase::Rest => 2.0,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::BuildUp => "build_up",
            Phase::Hold => "hold",
            Phase::Release => "release",
            Phase::Rest => "rest",
        };
        f.write_str(name)
    }
}

/// One chapter's emotional-intensity reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntensitySample {
    /// Chapter uid the reading belongs to.
    pub chapter: String,
    /// Intensity on a 1-10 scale.
    pub intensity: u8,
}

/// A recorded phase change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: Phase,
    pub to: Phase,
    pub chapter: String,
    /// How many chapters the outgoing phase lasted.
    pub duration: u32,
}

/// Rhythm cycle bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RhythmCycle {
    pub current_phase: Phase,
    pub phase_duration: u32,
    pub cycle_count: u32,
    pub phase_history: Vec<PhaseTransition>,
}

impl Default for RhythmCycle {
    fn default() -> Self {
        Self {
            current_phase: Phase::BuildUp,
            phase_duration: 1,
            cycle_count: 0,
            phase_history: Vec::new(),
        }
    }
}

/// Narrative devices subject to cooldown accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    Spotlight,
    Flashback,
}

impl Device {
    pub const ALL: [Device; 2] = [Device::Spotlight, Device::Flashback];

    pub fn parse(name: &str) -> Option<Device> {
        match crate::state::category::normalize(name).as_str() {
            "spotlight" | "spotlightprotocol" => Some(Device::Spotlight),
            "flashback" | "flashbacks" => Some(Device::Flashback),
            _ => None,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Spotlight => f.write_str("spotlight"),
            Device::Flashback => f.write_str("flashback"),
        }
    }
}

/// A single recorded use of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceUsage {
    pub chapter: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Cooldown accounting for one device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceTracker {
    pub last_used_chapter: Option<String>,
    /// Uses whose chapter is still inside the intensity window.
    pub rolling_count: u32,
    pub usage_history: Vec<DeviceUsage>,
}

/// Both device trackers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceCooldowns {
    pub spotlight: DeviceTracker,
    pub flashback: DeviceTracker,
}

impl DeviceCooldowns {
    pub fn tracker(&self, device: Device) -> &DeviceTracker {
        match device {
            Device::Spotlight => &self.spotlight,
            Device::Flashback => &self.flashback,
        }
    }

    pub fn tracker_mut(&mut self, device: Device) -> &mut DeviceTracker {
        match device {
            Device::Spotlight => &mut self.spotlight,
            Device::Flashback => &mut self.flashback,
        }
    }
}

/// Tracked progress for one storyline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorylineProgress {
    /// 0-100.
    pub current_progress: f64,
    pub current_stage: String,
    #[serde(default)]
    pub last_delta: f64,
    #[serde(default)]
    pub last_updated_chapter: Option<String>,
    #[serde(default)]
    pub category: Option<StorylineCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storyline_type: Option<String>,
}

/// Inclusive intensity band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntensityRange {
    pub min: u8,
    pub max: u8,
}

impl Default for IntensityRange {
    fn default() -> Self {
        Self { min: 1, max: 10 }
    }
}

/// A constraint the next chapter must honor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Constraint {
    CooldownRequired {
        intensity: IntensityRange,
        suggested_archetype: String,
    },
    SignatureDeviceForbidden {
        device: Device,
        rolling_count: u32,
    },
}

/// A storyline approaching a progress checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpendingThreshold {
    pub storyline_id: String,
    pub current_progress: f64,
    pub threshold: u8,
    pub distance: f64,
}

/// A large progress gap between two storylines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DissonanceOpportunity {
    pub leading: String,
    pub leading_progress: f64,
    pub lagging: String,
    pub lagging_progress: f64,
    pub gap: f64,
}

/// Per-chapter pacing directive. Always recomputed from scratch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingDirective {
    pub mandatory_constraints: Vec<Constraint>,
    pub suggested_intensity: IntensityRange,
    pub impending_thresholds: Vec<ImpendingThreshold>,
    pub dissonance_opportunities: Vec<DissonanceOpportunity>,
    pub phase_advisory: Option<String>,
}

impl PacingDirective {
    pub fn requires_cooldown(&self) -> bool {
        self.mandatory_constraints
            .iter()
            .any(|c| matches!(c, Constraint::CooldownRequired { .. }))
    }

    pub fn forbidden_devices(&self) -> Vec<Device> {
        self.mandatory_constraints
            .iter()
            .filter_map(|c| match c {
                Constraint::SignatureDeviceForbidden { device, .. } => Some(*device),
                _ => None,
            })
            .collect()
    }
}

/// The whole pacing sub-document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingState {
    pub recent_chapters_intensity: Vec<IntensitySample>,
    pub rhythm: RhythmCycle,
    pub storyline_progress: BTreeMap<String, StorylineProgress>,
    pub device_cooldowns: DeviceCooldowns,
    /// Whether the last closed chapter's rhythm assessment asked for a cooldown.
    pub cooldown_flagged: bool,
    pub directive: PacingDirective,
}

impl PacingState {
    /// Chapters currently inside the intensity window.
    pub fn window_chapters(&self) -> impl Iterator<Item = &str> {
        self.recent_chapters_intensity
            .iter()
            .map(|s| s.chapter.as_str())
    }
}
