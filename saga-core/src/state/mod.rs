//! The versioned chapter snapshot.
//!
//! A [`ChapterState`] is created fresh at story genesis or derived from the
//! previous chapter with [`ChapterState::advance`]. It is never deleted, only
//! superseded by the next chapter's snapshot.
//!
//! The transport form is a JSON document with camelCase top-level keys:
//!
//! ```text
//! { uid, characterId, staticMatrices, dynamicState, meta, checksum }
//! ```

pub mod category;
mod model;

pub use category::{EntityKind, EntityRef, IdHint, StorylineCategory, WorldCategory};
pub use model::{
    AffinityEntry, AffinityTrack, ArcNote, CharacterDynamics, Chronology, DescriptorStat,
    DynamicState, EntityLog, EntityUpdate, Meta, ModeConfig, NarrativeArc, NarrativeStyle,
    Records, RelationshipEdge, RelationshipGraph, SensoryPattern, StaticMatrices,
    StorylineHistoryEntry, StorylineStatus, StylisticArchive, TimeSlot, Worldview,
};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Top-level keys of the transport document.
pub const TOP_LEVEL_KEYS: [&str; 6] = [
    "uid",
    "characterId",
    "staticMatrices",
    "dynamicState",
    "meta",
    "checksum",
];

/// Errors from building or reading a snapshot.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Structurally invalid snapshot: {0}")]
    StructuralInvalid(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The full snapshot of narrative world-state at one chapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterState {
    /// Unique per snapshot.
    pub uid: String,
    /// Session / owner key.
    #[serde(rename = "characterId")]
    pub character_id: String,
    #[serde(rename = "staticMatrices", default)]
    pub static_matrices: StaticMatrices,
    #[serde(rename = "dynamicState", default)]
    pub dynamic_state: DynamicState,
    #[serde(default)]
    pub meta: Meta,
    /// Content fingerprint; empty until sealed.
    #[serde(default)]
    pub checksum: String,
}

impl ChapterState {
    /// Create the default skeleton for a session.
    pub fn new(character_id: impl Into<String>) -> Self {
        Self {
            uid: new_uid(),
            character_id: character_id.into(),
            static_matrices: StaticMatrices::default(),
            dynamic_state: DynamicState::default(),
            meta: Meta::default(),
            checksum: String::new(),
        }
    }

    /// The default skeleton as a transport document: every category present
    /// as an empty container, default chronology, pacing and mode.
    pub fn default_document(character_id: &str) -> Value {
        Self::new(character_id).to_document()
    }

    /// Build a snapshot from the default skeleton overlaid with `snapshot`.
    ///
    /// The overlay is shallow: see [`ChapterState::overlay`].
    pub fn instantiate(snapshot: &Value) -> Result<Self, StateError> {
        let character_id = snapshot
            .get("characterId")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Self::new(character_id).overlay(snapshot)
    }

    /// Overlay `snapshot` onto this state, one top-level key at a time.
    ///
    /// A top-level key present in `snapshot` replaces the whole subtree; it is
    /// not merged with the existing one. Sub-fields missing from a supplied
    /// subtree fall back to the type defaults, which equal the skeleton's.
    /// Unrecognized top-level keys are ignored.
    pub fn overlay(&self, snapshot: &Value) -> Result<Self, StateError> {
        let overlay = snapshot.as_object().ok_or_else(|| {
            StateError::StructuralInvalid("snapshot is not a JSON object".to_string())
        })?;

        let mut base = self.to_document();
        if let Some(base_obj) = base.as_object_mut() {
            for key in TOP_LEVEL_KEYS {
                if let Some(value) = overlay.get(key) {
                    base_obj.insert(key.to_string(), value.clone());
                }
            }
        }

        Ok(serde_json::from_value(base)?)
    }

    /// Structural check used before trusting any loaded snapshot.
    ///
    /// `uid` and `characterId` must be strings; `staticMatrices`,
    /// `dynamicState` and `meta` must be objects; `staticMatrices` must hold
    /// `characters`, `worldview` and `storylines` objects; and
    /// `meta.chapter_blueprint` must exist (any value).
    pub fn is_structurally_valid(snapshot: &Value) -> bool {
        structural_problem(snapshot).is_none()
    }

    /// Like [`ChapterState::is_structurally_valid`] but names the first problem,
    /// then deserializes.
    pub fn from_document(snapshot: &Value) -> Result<Self, StateError> {
        if let Some(problem) = structural_problem(snapshot) {
            return Err(StateError::StructuralInvalid(problem));
        }
        Ok(serde_json::from_value(snapshot.clone())?)
    }

    /// Serialize to the transport document.
    pub fn to_document(&self) -> Value {
        // Serializing these plain data types cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Clone for a chapter transition: fresh identity, cleared fingerprint,
    /// everything else carried over.
    pub fn advance(&self) -> Self {
        Self {
            uid: new_uid(),
            checksum: String::new(),
            ..self.clone()
        }
    }

    /// Content fingerprint over the static, dynamic and meta layers.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for part in [
            serde_json::to_vec(&self.static_matrices),
            serde_json::to_vec(&self.dynamic_state),
            serde_json::to_vec(&self.meta),
        ] {
            hasher.update(&part.unwrap_or_default());
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Store the current fingerprint in `checksum`.
    pub fn seal(&mut self) {
        self.checksum = self.fingerprint();
    }

    /// Whether the content changed since the last [`ChapterState::seal`].
    pub fn is_dirty(&self) -> bool {
        self.checksum != self.fingerprint()
    }

    /// Synthesize minimal placeholder static records for ids the dynamic
    /// layer references but the static layer lacks. Returns what was repaired.
    pub fn repair_orphans(&mut self) -> Vec<EntityRef> {
        let mut repaired = Vec::new();

        let mut character_ids: Vec<String> = Vec::new();
        for (id, dynamics) in &self.dynamic_state.characters {
            character_ids.push(id.clone());
            character_ids.extend(dynamics.relationships.keys().cloned());
        }
        for id in character_ids {
            if !self.static_matrices.characters.contains_key(&id) {
                self.static_matrices
                    .characters
                    .insert(id.clone(), placeholder_record(&id));
                repaired.push(EntityRef::new(EntityKind::Character, id));
            }
        }

        for category in WorldCategory::ALL {
            let ids: Vec<String> = self
                .dynamic_state
                .worldview
                .category(category)
                .keys()
                .cloned()
                .collect();
            let records = self.static_matrices.worldview.category_mut(category);
            for id in ids {
                if !records.contains_key(&id) {
                    records.insert(id.clone(), placeholder_record(&id));
                    repaired.push(EntityRef::new(EntityKind::World(category), id));
                }
            }
        }

        for category in StorylineCategory::ALL {
            let ids: Vec<String> = self
                .dynamic_state
                .storylines
                .category(category)
                .keys()
                .cloned()
                .collect();
            let records = self.static_matrices.storylines.category_mut(category);
            for id in ids {
                if !records.contains_key(&id) {
                    records.insert(id.clone(), placeholder_record(&id));
                    repaired.push(EntityRef::new(EntityKind::Storyline(category), id));
                }
            }
        }

        if !repaired.is_empty() {
            tracing::warn!(count = repaired.len(), "synthesized placeholder static records");
        }
        repaired
    }
}

fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

fn placeholder_record(id: &str) -> Value {
    json!({ "id": id, "name": id, "placeholder": true })
}

fn structural_problem(snapshot: &Value) -> Option<String> {
    let Some(root) = snapshot.as_object() else {
        return Some("snapshot is not an object".to_string());
    };

    for key in ["uid", "characterId"] {
        if !root.get(key).is_some_and(Value::is_string) {
            return Some(format!("`{key}` must be a string"));
        }
    }
    for key in ["staticMatrices", "dynamicState", "meta"] {
        if !root.get(key).is_some_and(Value::is_object) {
            return Some(format!("`{key}` must be an object"));
        }
    }

    let statics = root.get("staticMatrices").and_then(Value::as_object)?;
    for key in ["characters", "worldview", "storylines"] {
        if !statics.get(key).is_some_and(Value::is_object) {
            return Some(format!("`staticMatrices.{key}` must be an object"));
        }
    }

    let meta: &Map<String, Value> = root.get("meta").and_then(Value::as_object)?;
    if !meta.contains_key("chapter_blueprint") {
        return Some("`meta.chapter_blueprint` is missing".to_string());
    }

    None
}
