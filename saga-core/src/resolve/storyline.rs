//! Storyline category inference and record materialization.

use crate::json::{first_non_empty, is_empty_value};
use crate::state::category::normalize;
use crate::state::{ChapterState, StorylineCategory, StorylineStatus};
use lazy_static::lazy_static;
use serde_json::{Map, Value};

lazy_static! {
    /// Normalized synonyms per category, checked in canonical order.
    static ref SYNONYMS: Vec<(StorylineCategory, Vec<&'static str>)> = vec![
        (
            StorylineCategory::MainQuests,
            vec!["mainquests", "mainquest", "main", "mainline", "mainstory", "primary", "critical", "mainplot"],
        ),
        (
            StorylineCategory::SideQuests,
            vec!["sidequests", "sidequest", "side", "secondary", "subquest", "errand", "optional", "bounty"],
        ),
        (
            StorylineCategory::RelationshipArcs,
            vec!["relationshiparcs", "relationshiparc", "relationship", "romance", "romantic", "friendship", "rivalry", "bond", "social"],
        ),
        (
            StorylineCategory::PersonalArcs,
            vec!["personalarcs", "personalarc", "personal", "character", "growth", "internal", "backstory", "selfdiscovery"],
        ),
    ];
}

/// Partial matches against id text only consider synonyms at least this long,
/// so short tokens like "side" do not fire inside unrelated words.
const MIN_PARTIAL_LEN: usize = 5;

/// Optional hints accompanying a storyline reference.
#[derive(Debug, Clone, Copy, Default)]
pub struct CategoryHints<'a> {
    /// An explicit category name ("main_quest", "relationship_arcs", ...).
    pub category: Option<&'a str>,
    /// A looser type label ("romance", "personal growth", ...).
    pub storyline_type: Option<&'a str>,
}

impl<'a> CategoryHints<'a> {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn category(category: &'a str) -> Self {
        Self {
            category: Some(category),
            storyline_type: None,
        }
    }

    pub fn storyline_type(storyline_type: &'a str) -> Self {
        Self {
            category: None,
            storyline_type: Some(storyline_type),
        }
    }

    /// Pull hints from a metadata fragment (`category` / `storyline_category`,
    /// `type` / `storyline_type`).
    pub fn from_fragment(fragment: &'a Value) -> Self {
        let pick = |keys: &[&str]| {
            keys.iter()
                .filter_map(|k| fragment.get(*k).and_then(Value::as_str))
                .find(|s| !s.trim().is_empty())
        };
        Self {
            category: pick(&["category", "storyline_category"]),
            storyline_type: pick(&["type", "storyline_type"]),
        }
    }
}

/// Aliased keys for each static field filled by materialization.
const TITLE_KEYS: &[&str] = &["title", "storyline_title", "name"];
const SUMMARY_KEYS: &[&str] = &["summary", "storyline_summary", "description", "current_summary"];
const TYPE_KEYS: &[&str] = &["type", "storyline_type"];
const STATUS_KEYS: &[&str] = &["current_status", "status"];
const CURRENT_SUMMARY_KEYS: &[&str] = &["current_summary", "summary_update", "summary", "storyline_summary"];

/// Classifies storyline references and guarantees navigable records.
pub struct StorylineCategoryResolver;

impl StorylineCategoryResolver {
    /// Resolve a storyline reference into one of the four buckets.
    ///
    /// Order: explicit category hint (exact synonym), type hint (exact or
    /// partial containment), the id text (partial), then the personal-arc
    /// default. An explicit hint always wins over the id.
    pub fn resolve_category(id: &str, hints: CategoryHints<'_>) -> StorylineCategory {
        if let Some(category) = hints.category.and_then(exact_match) {
            return category;
        }
        if let Some(category) = hints.storyline_type.and_then(|t| {
            exact_match(t).or_else(|| partial_match(t, 1))
        }) {
            return category;
        }
        if let Some(category) = partial_match(id, MIN_PARTIAL_LEN) {
            return category;
        }
        StorylineCategory::PersonalArcs
    }

    /// Ensure both the static record and the dynamic status record exist for
    /// `id`.
    ///
    /// If the id already lives in another bucket, that bucket is used so ids
    /// stay unique. Missing or empty fields are filled from the first
    /// non-empty value across `fragments`; existing non-empty fields are never
    /// overwritten. Returns the bucket actually used.
    pub fn materialize(
        state: &mut ChapterState,
        id: &str,
        category: StorylineCategory,
        fragments: &[&Value],
    ) -> StorylineCategory {
        let category = state
            .static_matrices
            .storylines
            .find(id)
            .or_else(|| state.dynamic_state.storylines.find(id))
            .unwrap_or(category);

        let record = state
            .static_matrices
            .storylines
            .category_mut(category)
            .entry(id.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !record.is_object() {
            *record = Value::Object(Map::new());
        }
        if let Some(obj) = record.as_object_mut() {
            fill_if_absent(obj, "id", Some(&Value::String(id.to_string())));
            fill_if_absent(obj, "title", first_non_empty(fragments, TITLE_KEYS));
            fill_if_absent(obj, "summary", first_non_empty(fragments, SUMMARY_KEYS));
            fill_if_absent(obj, "type", first_non_empty(fragments, TYPE_KEYS));
        }

        let statuses = state.dynamic_state.storylines.category_mut(category);
        let inserted = !statuses.contains_key(id);
        let status = statuses
            .entry(id.to_string())
            .or_insert_with(StorylineStatus::default);
        // A fresh record carries the default status, which counts as absent
        if inserted || status.current_status.trim().is_empty() {
            if let Some(s) = first_non_empty(fragments, STATUS_KEYS).and_then(Value::as_str) {
                status.current_status = s.to_string();
            } else if status.current_status.trim().is_empty() {
                status.current_status = "active".to_string();
            }
        }
        if status.current_summary.trim().is_empty() {
            if let Some(s) = first_non_empty(fragments, CURRENT_SUMMARY_KEYS).and_then(Value::as_str)
            {
                status.current_summary = s.to_string();
            }
        }

        category
    }
}

fn fill_if_absent(obj: &mut Map<String, Value>, key: &str, candidate: Option<&Value>) {
    if !obj.get(key).map_or(true, is_empty_value) {
        return;
    }
    if let Some(value) = candidate {
        obj.insert(key.to_string(), value.clone());
    }
}

fn exact_match(text: &str) -> Option<StorylineCategory> {
    let needle = normalize(text);
    SYNONYMS
        .iter()
        .find(|(_, words)| words.contains(&needle.as_str()))
        .map(|(category, _)| *category)
}

/// Containment in either direction, ignoring synonyms shorter than `min_len`.
fn partial_match(text: &str, min_len: usize) -> Option<StorylineCategory> {
    let needle = normalize(text);
    if needle.is_empty() {
        return None;
    }
    SYNONYMS
        .iter()
        .find(|(_, words)| {
            words.iter().any(|w| {
                w.len() >= min_len
                    && (needle.contains(w) || (needle.len() >= 4 && w.contains(needle.as_str())))
            })
        })
        .map(|(category, _)| *category)
}
