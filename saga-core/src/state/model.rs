//! Typed layers of a chapter snapshot.

use super::category::{StorylineCategory, WorldCategory};
use crate::pacing::PacingState;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Records keyed by id.
pub type Records<T> = BTreeMap<String, T>;

// ============================================================================
// Category containers
// ============================================================================

/// The six world-entity categories, generic over the record type so the same
/// shape serves the static and dynamic layers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Worldview<T> {
    pub locations: Records<T>,
    pub items: Records<T>,
    pub factions: Records<T>,
    pub concepts: Records<T>,
    pub events: Records<T>,
    pub races: Records<T>,
}

impl<T> Worldview<T> {
    pub fn category(&self, category: WorldCategory) -> &Records<T> {
        match category {
            WorldCategory::Locations => &self.locations,
            WorldCategory::Items => &self.items,
            WorldCategory::Factions => &self.factions,
            WorldCategory::Concepts => &self.concepts,
            WorldCategory::Events => &self.events,
            WorldCategory::Races => &self.races,
        }
    }

    pub fn category_mut(&mut self, category: WorldCategory) -> &mut Records<T> {
        match category {
            WorldCategory::Locations => &mut self.locations,
            WorldCategory::Items => &mut self.items,
            WorldCategory::Factions => &mut self.factions,
            WorldCategory::Concepts => &mut self.concepts,
            WorldCategory::Events => &mut self.events,
            WorldCategory::Races => &mut self.races,
        }
    }

    /// Iterate `(category, id, record)` over all categories in search order.
    pub fn iter(&self) -> impl Iterator<Item = (WorldCategory, &String, &T)> {
        WorldCategory::ALL
            .into_iter()
            .flat_map(move |c| self.category(c).iter().map(move |(id, r)| (c, id, r)))
    }
}

/// The four storyline buckets, generic over the record type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Storylines<T> {
    pub main_quests: Records<T>,
    pub side_quests: Records<T>,
    pub relationship_arcs: Records<T>,
    pub personal_arcs: Records<T>,
}

impl<T> Storylines<T> {
    pub fn category(&self, category: StorylineCategory) -> &Records<T> {
        match category {
            StorylineCategory::MainQuests => &self.main_quests,
            StorylineCategory::SideQuests => &self.side_quests,
            StorylineCategory::RelationshipArcs => &self.relationship_arcs,
            StorylineCategory::PersonalArcs => &self.personal_arcs,
        }
    }

    pub fn category_mut(&mut self, category: StorylineCategory) -> &mut Records<T> {
        match category {
            StorylineCategory::MainQuests => &mut self.main_quests,
            StorylineCategory::SideQuests => &mut self.side_quests,
            StorylineCategory::RelationshipArcs => &mut self.relationship_arcs,
            StorylineCategory::PersonalArcs => &mut self.personal_arcs,
        }
    }

    /// Find which bucket holds `id`, if any.
    pub fn find(&self, id: &str) -> Option<StorylineCategory> {
        StorylineCategory::ALL
            .into_iter()
            .find(|c| self.category(*c).contains_key(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = (StorylineCategory, &String, &T)> {
        StorylineCategory::ALL
            .into_iter()
            .flat_map(move |c| self.category(c).iter().map(move |(id, r)| (c, id, r)))
    }
}

// ============================================================================
// Static layer
// ============================================================================

/// An edge in the relationship graph. Always exactly two participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipEdge {
    pub id: String,
    pub participants: [String; 2],
    /// Free-form edge attributes (type, tension, timeline, ...).
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl RelationshipEdge {
    pub fn new(id: impl Into<String>, a: impl Into<String>, b: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            participants: [a.into(), b.into()],
            attributes: Map::new(),
        }
    }

    pub fn involves(&self, id: &str) -> bool {
        self.participants.iter().any(|p| p == id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelationshipGraph {
    pub edges: Vec<RelationshipEdge>,
}

impl RelationshipGraph {
    pub fn edge(&self, id: &str) -> Option<&RelationshipEdge> {
        self.edges.iter().find(|e| e.id == id)
    }

    pub fn edge_mut(&mut self, id: &str) -> Option<&mut RelationshipEdge> {
        self.edges.iter_mut().find(|e| e.id == id)
    }

    /// Insert a new edge or merge attributes into the existing one.
    pub fn upsert(&mut self, edge: RelationshipEdge) {
        match self.edge_mut(&edge.id) {
            Some(existing) => {
                existing.participants = edge.participants;
                crate::json::deep_merge_map(&mut existing.attributes, &edge.attributes);
            }
            None => self.edges.push(edge),
        }
    }
}

/// Canonical, slowly-changing facts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticMatrices {
    pub characters: Records<Value>,
    pub worldview: Worldview<Value>,
    pub storylines: Storylines<Value>,
    pub relationship_graph: RelationshipGraph,
}

// ============================================================================
// Dynamic layer
// ============================================================================

/// One affinity change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffinityEntry {
    pub chapter: String,
    pub change: f64,
    pub affinity: f64,
    /// Short excerpt; the full text lives in `latest_reasoning`.
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub timestamp: String,
}

/// Relationship state from one character toward another.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AffinityTrack {
    pub current_affinity: f64,
    pub history: Vec<AffinityEntry>,
    pub latest_reasoning: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CharacterDynamics {
    #[serde(default)]
    pub relationships: Records<AffinityTrack>,
    /// Physiological state patched on time jumps.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub physiology: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityUpdate {
    pub chapter: String,
    #[serde(default)]
    pub timestamp: String,
    pub content: Value,
}

/// Append-only update log for one world entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityLog {
    pub updates: Vec<EntityUpdate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorylineHistoryEntry {
    pub chapter: String,
    pub note: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub timestamp: String,
}

/// Mutable status of one storyline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorylineStatus {
    #[serde(default = "default_status")]
    pub current_status: String,
    #[serde(default)]
    pub current_summary: String,
    #[serde(default)]
    pub history: Vec<StorylineHistoryEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_status() -> String {
    "active".to_string()
}

impl Default for StorylineStatus {
    fn default() -> Self {
        Self {
            current_status: default_status(),
            current_summary: String::new(),
            history: Vec::new(),
            extra: Map::new(),
        }
    }
}

/// Coarse in-story time of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeSlot {
    Dawn,
    #[default]
    Morning,
    Noon,
    Afternoon,
    Dusk,
    Evening,
    Night,
    Midnight,
}

impl TimeSlot {
    pub fn parse(name: &str) -> Option<TimeSlot> {
        let slot = match name.trim().to_lowercase().as_str() {
            "dawn" | "sunrise" => TimeSlot::Dawn,
            "morning" => TimeSlot::Morning,
            "noon" | "midday" => TimeSlot::Noon,
            "afternoon" => TimeSlot::Afternoon,
            "dusk" | "sunset" => TimeSlot::Dusk,
            "evening" => TimeSlot::Evening,
            "night" => TimeSlot::Night,
            "midnight" | "late_night" => TimeSlot::Midnight,
            _ => return None,
        };
        Some(slot)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Chronology {
    pub day: u32,
    pub time_slot: TimeSlot,
    pub weather: String,
    pub last_rest_chapter: Option<String>,
}

impl Default for Chronology {
    fn default() -> Self {
        Self {
            day: 1,
            time_slot: TimeSlot::Morning,
            weather: "clear".to_string(),
            last_rest_chapter: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DescriptorStat {
    pub count: u32,
    pub overused: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensoryPattern {
    #[serde(rename = "type")]
    pub kind: String,
    pub pattern: String,
    #[serde(default)]
    pub count: u32,
}

/// Archive of prose habits used to steer away from repetition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StylisticArchive {
    pub imagery: Vec<String>,
    pub descriptors: BTreeMap<String, DescriptorStat>,
    pub sensory_patterns: Vec<SensoryPattern>,
}

/// Mutable, append-friendly mirror of the static layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicState {
    pub characters: Records<CharacterDynamics>,
    pub worldview: Worldview<EntityLog>,
    pub storylines: Storylines<StorylineStatus>,
    pub chronology: Chronology,
    pub stylistic_archive: StylisticArchive,
}

// ============================================================================
// Meta
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArcNote {
    pub chapter: String,
    pub timestamp: String,
    pub note: String,
}

/// An active narrative arc tracked in meta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrativeArc {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub notes: Vec<ArcNote>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NarrativeArc {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            status: default_status(),
            notes: Vec::new(),
            extra: Map::new(),
        }
    }
}

/// Overall narrative style; scales the pacing phase ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NarrativeStyle {
    #[default]
    Balanced,
    SlowBurn,
    FastPaced,
    Episodic,
}

impl NarrativeStyle {
    pub fn duration_multiplier(&self) -> f64 {
        match self {
            NarrativeStyle::Balanced => 1.0,
            NarrativeStyle::SlowBurn => 1.5,
            NarrativeStyle::FastPaced => 0.75,
            NarrativeStyle::Episodic => 1.0,
        }
    }
}

impl fmt::Display for NarrativeStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NarrativeStyle::Balanced => "balanced",
            NarrativeStyle::SlowBurn => "slow_burn",
            NarrativeStyle::FastPaced => "fast_paced",
            NarrativeStyle::Episodic => "episodic",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeConfig {
    pub narrative_style: NarrativeStyle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Meta {
    pub long_term_summary: String,
    pub handoff_memo: String,
    pub narrative_control_tower: PacingState,
    /// Active-chapter blueprint produced by the planning step. May be empty.
    pub chapter_blueprint: Value,
    pub player_focus: String,
    pub active_narrative_arcs: Vec<NarrativeArc>,
    pub narrative_mode: ModeConfig,
}

impl Default for Meta {
    fn default() -> Self {
        Self {
            long_term_summary: String::new(),
            handoff_memo: String::new(),
            narrative_control_tower: PacingState::default(),
            chapter_blueprint: Value::Object(Map::new()),
            player_focus: String::new(),
            active_narrative_arcs: Vec::new(),
            narrative_mode: ModeConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_edge_requires_two_participants() {
        let ok: Result<RelationshipEdge, _> =
            serde_json::from_value(json!({"id": "e1", "participants": ["a", "b"], "type": "rivals"}));
        let edge = ok.expect("two participants should parse");
        assert_eq!(edge.attributes["type"], "rivals");
        assert!(edge.involves("b"));

        let three: Result<RelationshipEdge, _> =
            serde_json::from_value(json!({"id": "e2", "participants": ["a", "b", "c"]}));
        assert!(three.is_err());
    }

    #[test]
    fn test_graph_upsert_merges_attributes() {
        let mut graph = RelationshipGraph::default();
        let mut edge = RelationshipEdge::new("e1", "a", "b");
        edge.attributes.insert("tension".into(), json!(3));
        graph.upsert(edge);

        let mut update = RelationshipEdge::new("e1", "a", "b");
        update.attributes.insert("type".into(), json!("allies"));
        graph.upsert(update);

        assert_eq!(graph.edges.len(), 1);
        let edge = graph.edge("e1").unwrap();
        assert_eq!(edge.attributes["tension"], 3);
        assert_eq!(edge.attributes["type"], "allies");
    }

    #[test]
    fn test_storylines_find() {
        let mut lines: Storylines<Value> = Storylines::default();
        lines
            .side_quests
            .insert("sq_rats".into(), json!({"title": "Rats"}));
        assert_eq!(lines.find("sq_rats"), Some(StorylineCategory::SideQuests));
        assert_eq!(lines.find("missing"), None);
    }

    #[test]
    fn test_storyline_status_keeps_legacy_fields() {
        let status: StorylineStatus =
            serde_json::from_value(json!({"summary": "old style"})).unwrap();
        assert_eq!(status.current_status, "active");
        assert_eq!(status.extra["summary"], "old style");
    }

    #[test]
    fn test_time_slot_parse() {
        assert_eq!(TimeSlot::parse("Dusk"), Some(TimeSlot::Dusk));
        assert_eq!(TimeSlot::parse("teatime"), None);
    }
}
