//! Sections 1-4: creations and updates to characters, world entities and
//! storylines.

use super::report::{RejectionKind, Section};
use super::{CreationPolicy, MergePass};
use crate::delta::Creations;
use crate::json::{deep_merge, excerpt, first_non_empty_str, legacy_append_values};
use crate::resolve::{CategoryHints, EntityResolver, StorylineCategoryResolver};
use crate::state::{
    AffinityEntry, EntityUpdate, RelationshipEdge, StorylineHistoryEntry, WorldCategory,
};
use lazy_static::lazy_static;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// How a static character field is merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    /// Overwritten.
    Text,
    /// Deep-merged.
    Compound,
}

lazy_static! {
    static ref CHARACTER_FIELDS: HashMap<&'static str, FieldKind> = {
        let mut m = HashMap::new();
        for key in [
            "name", "title", "description", "appearance", "personality", "role",
            "occupation", "voice", "status", "summary", "motivation", "secret",
        ] {
            m.insert(key, FieldKind::Text);
        }
        for key in [
            "traits", "goals", "abilities", "inventory", "affiliations", "backstory",
            "knowledge", "keywords", "core_identity", "social",
        ] {
            m.insert(key, FieldKind::Compound);
        }
        m
    };
}

/// Keys in a character patch that carry relationship changes.
const RELATIONSHIP_KEYS: &[&str] = &["relationships", "relationship_changes"];

const REASON_KEYS: &[&str] = &["reason", "reasoning", "explanation", "note"];

/// Keys whose value replaces a world entity's full description.
const DESCRIPTION_KEYS: &[&str] = &["updated_description", "description", "full_description"];

const STORYLINE_STATUS_KEYS: &[&str] = &["current_status", "status"];
const STORYLINE_SUMMARY_KEYS: &[&str] = &["current_summary", "summary_update"];
const STORYLINE_HISTORY_KEYS: &[&str] = &["history_entry", "latest_development"];

impl MergePass<'_> {
    // =========================================================================
    // 1. Creations
    // =========================================================================

    pub(crate) fn creations(&mut self, creations: &Creations) {
        let Some(statics) = &creations.static_matrices else {
            return;
        };
        let Some(statics) = statics.as_object() else {
            self.report.reject(
                Section::Creations,
                "staticMatrices",
                RejectionKind::Invalid,
                "creations.staticMatrices is not an object",
            );
            return;
        };

        for (key, value) in statics {
            match key.as_str() {
                "characters" => self.create_characters(value),
                "worldview" => self.create_world(value),
                "storylines" => self.create_storylines(value),
                "relationship_graph" => self.create_edges(value),
                other => self.report.reject(
                    Section::Creations,
                    other,
                    RejectionKind::Invalid,
                    "unrecognized staticMatrices section",
                ),
            }
        }
    }

    fn create_characters(&mut self, value: &Value) {
        let Some(records) = self.section_object(Section::Creations, "characters", value) else {
            return;
        };
        for (id, record) in records {
            let target = self
                .state
                .static_matrices
                .characters
                .entry(id.clone())
                .or_insert_with(|| json!({}));
            deep_merge(target, record);
            self.report.applied(Section::Creations, id, "character");
        }
    }

    fn create_world(&mut self, value: &Value) {
        let Some(categories) = self.section_object(Section::Creations, "worldview", value) else {
            return;
        };
        for (key, records) in categories {
            let Some(category) = WorldCategory::parse(key) else {
                self.report.reject(
                    Section::Creations,
                    key,
                    RejectionKind::Invalid,
                    "unknown world category",
                );
                continue;
            };
            let Some(records) = self.section_object(Section::Creations, key, records) else {
                continue;
            };
            for (id, record) in records {
                let target = self
                    .state
                    .static_matrices
                    .worldview
                    .category_mut(category)
                    .entry(id.clone())
                    .or_insert_with(|| json!({}));
                deep_merge(target, record);
                self.report
                    .applied(Section::Creations, id, format!("worldview.{category}"));
            }
        }
    }

    fn create_storylines(&mut self, value: &Value) {
        let Some(categories) = self.section_object(Section::Creations, "storylines", value) else {
            return;
        };
        for (key, records) in categories {
            let Some(records) = self.section_object(Section::Creations, key, records) else {
                continue;
            };
            for (id, record) in records {
                let requested = StorylineCategoryResolver::resolve_category(
                    id,
                    CategoryHints {
                        category: Some(key.as_str()),
                        ..CategoryHints::from_fragment(record)
                    },
                );
                let category = self
                    .state
                    .static_matrices
                    .storylines
                    .find(id)
                    .unwrap_or(requested);
                let target = self
                    .state
                    .static_matrices
                    .storylines
                    .category_mut(category)
                    .entry(id.clone())
                    .or_insert_with(|| json!({}));
                deep_merge(target, record);
                StorylineCategoryResolver::materialize(self.state, id, category, &[record]);
                self.report
                    .applied(Section::Creations, id, format!("storylines.{category}"));
            }
        }
    }

    fn create_edges(&mut self, value: &Value) {
        let edges = value
            .get("edges")
            .and_then(Value::as_array)
            .or_else(|| value.as_array());
        let Some(edges) = edges else {
            self.report.reject(
                Section::Creations,
                "relationship_graph",
                RejectionKind::Invalid,
                "expected an edge list",
            );
            return;
        };

        for raw in edges {
            let mut raw = raw.clone();
            crate::json::substitute_token(&mut raw, &self.config.placeholder_token, &self.chapter);
            match serde_json::from_value::<RelationshipEdge>(raw) {
                Ok(edge) => {
                    let id = edge.id.clone();
                    self.state.static_matrices.relationship_graph.upsert(edge);
                    self.report.applied(Section::Creations, id, "relationship edge");
                }
                Err(e) => self.report.reject(
                    Section::Creations,
                    "relationship_graph",
                    RejectionKind::Invalid,
                    format!("malformed edge: {e}"),
                ),
            }
        }
    }

    // =========================================================================
    // 2. Characters
    // =========================================================================

    pub(crate) fn characters(&mut self, updates: &Map<String, Value>) {
        for (id, patch) in updates {
            let Some(patch) = patch.as_object() else {
                self.report.reject(
                    Section::Characters,
                    id,
                    RejectionKind::Invalid,
                    "character patch is not an object",
                );
                continue;
            };

            if !self.state.static_matrices.characters.contains_key(id) {
                match self.config.characters {
                    CreationPolicy::Reject => {
                        self.report.reject(
                            Section::Characters,
                            id,
                            RejectionKind::ReferenceNotFound,
                            "no static record for character",
                        );
                        continue;
                    }
                    CreationPolicy::CreateOnUpdate => {
                        self.state
                            .static_matrices
                            .characters
                            .insert(id.clone(), json!({ "id": id }));
                    }
                }
            }

            for (key, value) in patch {
                if RELATIONSHIP_KEYS.contains(&key.as_str()) {
                    self.relationships(id, value);
                } else {
                    self.character_field(id, key, value);
                }
            }
            self.report.applied(Section::Characters, id, "updated");
        }
    }

    fn relationships(&mut self, id: &str, value: &Value) {
        let Some(changes) = value.as_object() else {
            self.report.reject(
                Section::Characters,
                id,
                RejectionKind::Invalid,
                "relationships is not an object",
            );
            return;
        };

        let cap = self.config.affinity_history_cap;
        let excerpt_len = self.config.reason_excerpt_chars;
        let dynamics = self
            .state
            .dynamic_state
            .characters
            .entry(id.to_string())
            .or_default();

        for (target, change) in changes {
            let absolute = change.get("current_affinity").and_then(Value::as_f64);
            let relative = change
                .get("affinity_change")
                .and_then(Value::as_f64)
                .or_else(|| change.as_f64());
            if absolute.is_none() && relative.is_none() {
                self.report.reject(
                    Section::Characters,
                    target.as_str(),
                    RejectionKind::Invalid,
                    format!("`{id}` relationship entry has no current_affinity or numeric change"),
                );
                continue;
            }

            let track = dynamics.relationships.entry(target.clone()).or_default();
            let previous = track.current_affinity;
            let affinity = absolute.unwrap_or(previous + relative.unwrap_or(0.0));
            let reason = first_non_empty_str(&[change], REASON_KEYS).unwrap_or_default();

            track.current_affinity = affinity;
            track.history.push(AffinityEntry {
                chapter: self.chapter.clone(),
                change: affinity - previous,
                affinity,
                reason: excerpt(reason, excerpt_len),
                timestamp: self.timestamp.clone(),
            });
            if track.history.len() > cap {
                let excess = track.history.len() - cap;
                track.history.drain(..excess);
            }
            if !reason.is_empty() {
                track.latest_reasoning = Some(reason.to_string());
            }
        }
    }

    fn character_field(&mut self, id: &str, key: &str, value: &Value) {
        let Some(record) = self.state.static_matrices.characters.get_mut(id) else {
            return;
        };
        if !record.is_object() {
            *record = json!({});
        }
        let Some(record) = record.as_object_mut() else {
            return;
        };

        let kind = CHARACTER_FIELDS.get(key).copied().unwrap_or(if value.is_object() {
            FieldKind::Compound
        } else {
            FieldKind::Text
        });

        if let Some(values) = legacy_append_values(value) {
            let slot = record.entry(key.to_string()).or_insert_with(|| json!([]));
            match slot.as_array_mut() {
                Some(existing) => existing.extend(values.iter().cloned()),
                None => *slot = Value::Array(values.clone()),
            }
            return;
        }

        match kind {
            FieldKind::Text => {
                record.insert(key.to_string(), value.clone());
            }
            FieldKind::Compound => {
                let slot = record.entry(key.to_string()).or_insert(Value::Null);
                deep_merge(slot, value);
            }
        }
    }

    // =========================================================================
    // 3. World entities
    // =========================================================================

    pub(crate) fn world(&mut self, updates: &Map<String, Value>) {
        for (key, entries) in updates {
            let named = WorldCategory::parse(key);
            let Some(entries) = self.section_object(Section::World, key, entries) else {
                continue;
            };

            for (id, patch) in entries {
                let located = named
                    .filter(|c| {
                        self.state
                            .static_matrices
                            .worldview
                            .category(*c)
                            .contains_key(id)
                    })
                    .or_else(|| EntityResolver::locate_world(id, self.state));

                let category = match (located, named, self.config.world) {
                    (Some(category), _, _) => category,
                    (None, Some(category), CreationPolicy::CreateOnUpdate) => {
                        self.state
                            .static_matrices
                            .worldview
                            .category_mut(category)
                            .insert(id.clone(), json!({ "id": id, "name": id }));
                        category
                    }
                    _ => {
                        self.report.reject(
                            Section::World,
                            id,
                            RejectionKind::ReferenceNotFound,
                            format!("no static record in any world category (given `{key}`)"),
                        );
                        continue;
                    }
                };

                self.state
                    .dynamic_state
                    .worldview
                    .category_mut(category)
                    .entry(id.clone())
                    .or_default()
                    .updates
                    .push(EntityUpdate {
                        chapter: self.chapter.clone(),
                        timestamp: self.timestamp.clone(),
                        content: patch.clone(),
                    });

                if let Some(description) = first_non_empty_str(&[patch], DESCRIPTION_KEYS) {
                    if let Some(record) = self
                        .state
                        .static_matrices
                        .worldview
                        .category_mut(category)
                        .get_mut(id)
                        .and_then(Value::as_object_mut)
                    {
                        record.insert("description".into(), json!(description));
                    }
                }
                self.report
                    .applied(Section::World, id, format!("worldview.{category}"));
            }
        }
    }

    // =========================================================================
    // 4. Storylines
    // =========================================================================

    pub(crate) fn storylines(&mut self, updates: &Map<String, Value>) {
        for (key, entries) in updates {
            let Some(entries) = self.section_object(Section::Storylines, key, entries) else {
                continue;
            };

            for (id, patch) in entries {
                let Some(fields) = patch.as_object() else {
                    self.report.reject(
                        Section::Storylines,
                        id,
                        RejectionKind::Invalid,
                        "storyline patch is not an object",
                    );
                    continue;
                };

                let category = match self.state.static_matrices.storylines.find(id) {
                    Some(category) => category,
                    None if self.config.storylines == CreationPolicy::CreateOnUpdate => {
                        let category = StorylineCategoryResolver::resolve_category(
                            id,
                            CategoryHints {
                                category: Some(key.as_str()),
                                ..CategoryHints::from_fragment(patch)
                            },
                        );
                        StorylineCategoryResolver::materialize(self.state, id, category, &[patch])
                    }
                    None => {
                        self.report.reject(
                            Section::Storylines,
                            id,
                            RejectionKind::ReferenceNotFound,
                            "storyline has no static record; create it via creations",
                        );
                        continue;
                    }
                };

                let status_text = first_non_empty_str(&[patch], STORYLINE_STATUS_KEYS);
                let summary = first_non_empty_str(&[patch], STORYLINE_SUMMARY_KEYS);
                let history = first_non_empty_str(&[patch], STORYLINE_HISTORY_KEYS);
                let history_cap = self.config.storyline_history_cap;

                let status = self
                    .state
                    .dynamic_state
                    .storylines
                    .category_mut(category)
                    .entry(id.clone())
                    .or_default();
                if let Some(text) = status_text {
                    status.current_status = text.to_string();
                }
                if let Some(text) = summary {
                    status.current_summary = text.to_string();
                }
                if let Some(note) = history {
                    status.history.push(StorylineHistoryEntry {
                        chapter: self.chapter.clone(),
                        note: note.to_string(),
                        status: status_text.map(str::to_string),
                        timestamp: self.timestamp.clone(),
                    });
                    if status.history.len() > history_cap {
                        let excess = status.history.len() - history_cap;
                        status.history.drain(..excess);
                    }
                }

                let static_patch: Map<String, Value> = fields
                    .iter()
                    .filter(|(k, _)| {
                        !STORYLINE_STATUS_KEYS.contains(&k.as_str())
                            && !STORYLINE_SUMMARY_KEYS.contains(&k.as_str())
                            && !STORYLINE_HISTORY_KEYS.contains(&k.as_str())
                    })
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                if !static_patch.is_empty() {
                    if let Some(record) = self
                        .state
                        .static_matrices
                        .storylines
                        .category_mut(category)
                        .get_mut(id)
                    {
                        deep_merge(record, &Value::Object(static_patch));
                    }
                }
                self.report
                    .applied(Section::Storylines, id, format!("storylines.{category}"));
            }
        }
    }

    /// `value` as an object, or a rejection naming `target`.
    pub(crate) fn section_object<'v>(
        &mut self,
        section: Section,
        target: &str,
        value: &'v Value,
    ) -> Option<&'v Map<String, Value>> {
        let object = value.as_object();
        if object.is_none() {
            self.report.reject(
                section,
                target,
                RejectionKind::Invalid,
                "expected an object keyed by id",
            );
        }
        object
    }
}
