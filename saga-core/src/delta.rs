//! The Delta: a transient, externally authored change-set for one chapter.
//!
//! Deltas come from a text-generation step, so every section is optional and
//! tolerant: a missing or `null` section deserializes as empty, and loose
//! values (category names, time slots, phase names) are kept as strings here
//! and parsed by the merge engine, which can reject them item by item.
//!
//! Typed items are wrapped in [`Loose`]: an item that does not fit its shape
//! is kept raw instead of failing the whole Delta, and the merge engine
//! reports it as a rejection.

use crate::state::category::normalize;
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// A Delta item that either parsed or is kept raw for the merge report.
#[derive(Debug, Clone, PartialEq)]
pub enum Loose<T> {
    Parsed(T),
    Malformed { raw: Value, error: String },
}

impl<T> Loose<T> {
    pub fn parsed(&self) -> Option<&T> {
        match self {
            Loose::Parsed(item) => Some(item),
            Loose::Malformed { .. } => None,
        }
    }

    pub fn is_parsed(&self) -> bool {
        matches!(self, Loose::Parsed(_))
    }
}

impl<T: DeserializeOwned> Loose<T> {
    pub fn from_value(raw: Value) -> Self {
        match T::deserialize(&raw) {
            Ok(item) => Loose::Parsed(item),
            Err(e) => Loose::Malformed {
                error: e.to_string(),
                raw,
            },
        }
    }
}

impl<T> From<T> for Loose<T> {
    fn from(item: T) -> Self {
        Loose::Parsed(item)
    }
}

impl<T: Serialize> Serialize for Loose<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Loose::Parsed(item) => item.serialize(serializer),
            Loose::Malformed { raw, .. } => raw.serialize(serializer),
        }
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for Loose<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Loose::from_value(Value::deserialize(deserializer)?))
    }
}

/// A complete change-set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Delta {
    #[serde(deserialize_with = "null_as_default")]
    pub creations: Creations,
    #[serde(deserialize_with = "null_as_default")]
    pub updates: Updates,
    #[serde(deserialize_with = "loose_list")]
    pub relationship_updates: Vec<Loose<RelationshipUpdate>>,
    pub chronology_update: Option<Loose<ChronologyUpdate>>,
    pub stylistic_analysis_delta: Option<Loose<StylisticDelta>>,
    pub rhythm_assessment: Option<Loose<RhythmAssessment>>,
    #[serde(deserialize_with = "loose_list")]
    pub storyline_progress_deltas: Vec<Loose<ProgressDelta>>,
    pub new_long_term_summary: Option<Loose<String>>,
    pub new_handoff_memo: Option<Loose<String>>,
}

impl Delta {
    /// Parse a Delta out of raw model output (plain JSON or a fenced block).
    pub fn from_model_output(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(crate::json::extract_json(text))
    }

    /// True when applying this delta would touch nothing.
    pub fn is_empty(&self) -> bool {
        self.creations.static_matrices.is_none()
            && self.updates.characters.is_empty()
            && self.updates.worldview.is_empty()
            && self.updates.storylines.is_empty()
            && self.updates.meta.active_narrative_arcs.is_empty()
            && self.relationship_updates.is_empty()
            && self.chronology_update.is_none()
            && self.stylistic_analysis_delta.is_none()
            && self.rhythm_assessment.is_none()
            && self.storyline_progress_deltas.is_empty()
            && self.new_long_term_summary.is_none()
            && self.new_handoff_memo.is_none()
    }
}

/// Brand-new canonical records, shaped like `staticMatrices`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Creations {
    #[serde(rename = "staticMatrices", alias = "static_matrices")]
    pub static_matrices: Option<Value>,
}

/// Patches to existing records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Updates {
    /// Character id → patch.
    #[serde(deserialize_with = "null_as_default")]
    pub characters: Map<String, Value>,
    /// World category → entity id → patch.
    #[serde(deserialize_with = "null_as_default")]
    pub worldview: Map<String, Value>,
    /// Storyline category hint → storyline id → patch.
    #[serde(deserialize_with = "null_as_default")]
    pub storylines: Map<String, Value>,
    #[serde(deserialize_with = "null_as_default")]
    pub meta: MetaUpdates,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaUpdates {
    #[serde(deserialize_with = "loose_list")]
    pub active_narrative_arcs: Vec<Loose<ArcUpdate>>,
}

/// Patch to one narrative arc.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArcUpdate {
    #[serde(alias = "arc_id")]
    pub id: String,
    #[serde(default)]
    pub close: bool,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, alias = "update_note", alias = "progress_note")]
    pub note: Option<String>,
    /// Remaining fields are patched onto the arc.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ArcUpdate {
    /// Whether this update closes the arc.
    pub fn closes(&self) -> bool {
        self.close
            || self
                .status
                .as_deref()
                .map(|s| matches!(normalize(s).as_str(), "closed" | "completed" | "resolved"))
                .unwrap_or(false)
    }
}

/// Dotted-path patches addressed to one relationship-graph edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipUpdate {
    #[serde(alias = "id", alias = "relationship_id")]
    pub edge_id: String,
    /// Dotted path → new value.
    #[serde(default)]
    pub updates: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChronologyUpdate {
    /// Accepts whole numbers and numeric strings.
    #[serde(deserialize_with = "lenient_day")]
    pub day: Option<u32>,
    #[serde(alias = "time_of_day")]
    pub time_slot: Option<String>,
    pub weather: Option<String>,
    #[serde(alias = "transition")]
    pub transition_type: Option<String>,
    /// Character id → physiological patch, applied on time jumps.
    #[serde(alias = "physiological_updates", deserialize_with = "null_as_default")]
    pub character_states: Map<String, Value>,
}

impl ChronologyUpdate {
    pub fn is_time_jump(&self) -> bool {
        self.transition_type
            .as_deref()
            .map(|t| matches!(normalize(t).as_str(), "timejump" | "jump" | "timeskip"))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorDelta {
    pub word: String,
    #[serde(default = "one")]
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensoryPatternDelta {
    #[serde(rename = "type")]
    pub kind: String,
    pub pattern: String,
    #[serde(default = "one")]
    pub count: u32,
}

fn one() -> u32 {
    1
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StylisticDelta {
    #[serde(alias = "new_imagery", deserialize_with = "loose_list")]
    pub imagery: Vec<Loose<String>>,
    #[serde(deserialize_with = "loose_list")]
    pub descriptors: Vec<Loose<DescriptorDelta>>,
    #[serde(deserialize_with = "loose_list")]
    pub sensory_patterns: Vec<Loose<SensoryPatternDelta>>,
}

/// The analysis step's reading of the chapter that just closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RhythmAssessment {
    #[serde(alias = "intensity")]
    pub emotional_intensity: f64,
    pub phase_transition: bool,
    #[serde(alias = "new_phase")]
    pub next_phase: Option<String>,
    #[serde(alias = "cooldown_required")]
    pub requires_cooldown: bool,
    pub devices_used: Vec<String>,
    pub chapter_archetype: Option<String>,
}

impl Default for RhythmAssessment {
    fn default() -> Self {
        Self {
            emotional_intensity: 5.0,
            phase_transition: false,
            next_phase: None,
            requires_cooldown: false,
            devices_used: Vec::new(),
            chapter_archetype: None,
        }
    }
}

impl RhythmAssessment {
    /// Intensity as a 0-10 reading.
    pub fn intensity(&self) -> u8 {
        self.emotional_intensity.round().clamp(0.0, 10.0) as u8
    }
}

/// A storyline progress change plus whatever metadata came with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressDelta {
    #[serde(alias = "id")]
    pub storyline_id: String,
    #[serde(default, alias = "delta", alias = "progress_change")]
    pub progress_delta: f64,
    #[serde(default, alias = "stage")]
    pub new_stage: Option<String>,
    /// Title, summary, type, category... under any of their aliases.
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl ProgressDelta {
    pub fn new(storyline_id: impl Into<String>, progress_delta: f64) -> Self {
        Self {
            storyline_id: storyline_id.into(),
            progress_delta,
            new_stage: None,
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Metadata as a JSON fragment for alias lookups.
    pub fn metadata_fragment(&self) -> Value {
        Value::Object(self.metadata.clone())
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A list of loose items. `null` is empty; a non-list is one malformed item.
fn loose_list<'de, D, T>(deserializer: D) -> Result<Vec<Loose<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => Vec::new(),
        Value::Array(items) => items.into_iter().map(Loose::from_value).collect(),
        other => vec![Loose::Malformed {
            error: "expected a list".to_string(),
            raw: other,
        }],
    })
}

fn lenient_day<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let day = match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| {
                n.as_f64()
                    .filter(|f| *f >= 0.0 && f.fract() == 0.0)
                    .map(|f| f as u64)
            })
            .and_then(|n| u32::try_from(n).ok()),
        Some(Value::String(text)) => text.trim().parse::<u32>().ok(),
        Some(_) => None,
    };
    day.map(Some)
        .ok_or_else(|| D::Error::custom("day must be a whole non-negative number"))
}
