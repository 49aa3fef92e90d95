//! Entity manifest and id resolution.

use crate::state::{ChapterState, EntityKind, EntityRef, IdHint, StorylineCategory, WorldCategory};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// One flattened manifest row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: String,
    pub kind: EntityKind,
    pub display_name: String,
    pub keywords: Vec<String>,
}

/// A resolved entity: where it lives and its static record.
#[derive(Debug, Clone, Copy)]
pub struct Resolved<'a> {
    pub kind: EntityKind,
    pub id: &'a str,
    pub record: &'a Value,
}

impl Resolved<'_> {
    pub fn to_ref(&self) -> EntityRef {
        EntityRef::new(self.kind, self.id)
    }
}

#[derive(Debug, Clone)]
struct CachedManifest {
    fingerprint: String,
    entries: Vec<ManifestEntry>,
}

/// Resolves ids to records and keeps a cached manifest of every visible
/// entity.
///
/// The cache is keyed by a fingerprint of `staticMatrices`; the manifest is
/// rebuilt only when that fingerprint changes.
#[derive(Debug, Default)]
pub struct EntityResolver {
    cache: Option<CachedManifest>,
    rebuilds: usize,
}

impl EntityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flattened `{id, displayName, keywords}` list over characters, world
    /// entities and storylines. Hidden entities are omitted.
    pub fn manifest(&mut self, state: &ChapterState) -> &[ManifestEntry] {
        let fingerprint = static_fingerprint(state);
        let stale = self
            .cache
            .as_ref()
            .map_or(true, |c| c.fingerprint != fingerprint);

        if stale {
            tracing::debug!(%fingerprint, "rebuilding entity manifest");
            self.rebuilds += 1;
            self.cache = Some(CachedManifest {
                fingerprint,
                entries: build_manifest(state),
            });
        }

        self.cache
            .as_ref()
            .map(|c| c.entries.as_slice())
            .unwrap_or_default()
    }

    /// How many times the manifest has been (re)built.
    pub fn rebuild_count(&self) -> usize {
        self.rebuilds
    }

    /// Drop the cached manifest.
    pub fn invalidate(&mut self) {
        self.cache = None;
    }

    /// Resolve an id to its record. Hidden entities resolve to `None`; the
    /// exclusion is logged so callers can tell it apart from absence.
    pub fn resolve<'a>(id: &'a str, state: &'a ChapterState) -> Option<Resolved<'a>> {
        let found = Self::locate(id, state)?;
        if is_hidden(found.record) {
            tracing::debug!(id, kind = %found.kind, "entity excluded: flagged hidden");
            return None;
        }
        Some(found)
    }

    /// Same search as [`EntityResolver::resolve`] but ignores the hidden flag.
    ///
    /// Order: characters, world categories (locations, items, factions,
    /// concepts, events, races), then storyline categories biased by the id's
    /// prefix.
    pub fn locate<'a>(id: &'a str, state: &'a ChapterState) -> Option<Resolved<'a>> {
        let statics = &state.static_matrices;

        if let Some(record) = statics.characters.get(id) {
            return Some(Resolved {
                kind: EntityKind::Character,
                id,
                record,
            });
        }

        for category in WorldCategory::ALL {
            if let Some(record) = statics.worldview.category(category).get(id) {
                return Some(Resolved {
                    kind: EntityKind::World(category),
                    id,
                    record,
                });
            }
        }

        for category in StorylineCategory::search_order(IdHint::from_id(id)) {
            if let Some(record) = statics.storylines.category(category).get(id) {
                return Some(Resolved {
                    kind: EntityKind::Storyline(category),
                    id,
                    record,
                });
            }
        }

        None
    }

    /// Only the world category holding `id`, if any.
    pub fn locate_world(id: &str, state: &ChapterState) -> Option<WorldCategory> {
        WorldCategory::ALL
            .into_iter()
            .find(|c| state.static_matrices.worldview.category(*c).contains_key(id))
    }

    /// Candidates not already covered by `already_included`, in candidate
    /// order and without duplicates.
    pub fn resolve_out_of_set<'a, I, J>(candidates: I, already_included: J) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
        J: IntoIterator<Item = &'a str>,
    {
        let mut seen: HashSet<&str> = already_included.into_iter().collect();
        candidates
            .into_iter()
            .filter(|id| seen.insert(*id))
            .map(str::to_string)
            .collect()
    }
}

/// `hidden: true` or `is_hidden: true` on the record.
pub fn is_hidden(record: &Value) -> bool {
    ["hidden", "is_hidden", "isHidden"]
        .iter()
        .any(|key| record.get(*key).and_then(Value::as_bool) == Some(true))
}

/// Display name: first non-empty of `name`, `title`, `display_name`, else the id.
pub fn display_name(id: &str, record: &Value) -> String {
    crate::json::first_non_empty_str(&[record], &["name", "title", "display_name"])
        .unwrap_or(id)
        .to_string()
}

fn keywords(record: &Value) -> Vec<String> {
    record
        .get("keywords")
        .and_then(Value::as_array)
        .map(|words| {
            words
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn static_fingerprint(state: &ChapterState) -> String {
    let bytes = serde_json::to_vec(&state.static_matrices).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

fn build_manifest(state: &ChapterState) -> Vec<ManifestEntry> {
    let statics = &state.static_matrices;
    let characters = statics
        .characters
        .iter()
        .map(|(id, r)| (EntityKind::Character, id, r));
    let world = statics
        .worldview
        .iter()
        .map(|(c, id, r)| (EntityKind::World(c), id, r));
    let storylines = statics
        .storylines
        .iter()
        .map(|(c, id, r)| (EntityKind::Storyline(c), id, r));

    characters
        .chain(world)
        .chain(storylines)
        .filter(|(_, _, record)| !is_hidden(record))
        .map(|(kind, id, record)| ManifestEntry {
            id: id.clone(),
            kind,
            display_name: display_name(id, record),
            keywords: keywords(record),
        })
        .collect()
}
