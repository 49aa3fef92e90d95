//! Entity categories and resolved references.
//!
//! Loose category names coming from a Delta are parsed here once; past this
//! boundary entities are addressed by a typed [`EntityRef`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// The six world-entity categories, in resolution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorldCategory {
    Locations,
    Items,
    Factions,
    Concepts,
    Events,
    Races,
}

impl WorldCategory {
    /// All categories in the fixed search order.
    pub const ALL: [WorldCategory; 6] = [
        WorldCategory::Locations,
        WorldCategory::Items,
        WorldCategory::Factions,
        WorldCategory::Concepts,
        WorldCategory::Events,
        WorldCategory::Races,
    ];

    /// The document key for this category.
    pub fn key(&self) -> &'static str {
        match self {
            WorldCategory::Locations => "locations",
            WorldCategory::Items => "items",
            WorldCategory::Factions => "factions",
            WorldCategory::Concepts => "concepts",
            WorldCategory::Events => "events",
            WorldCategory::Races => "races",
        }
    }

    /// Parse a loose category name ("location", "Places", "organization", ...).
    pub fn parse(name: &str) -> Option<Self> {
        let normalized = normalize(name);
        let category = match normalized.as_str() {
            "locations" | "location" | "places" | "place" | "regions" | "region" => {
                WorldCategory::Locations
            }
            "items" | "item" | "objects" | "object" | "artifacts" | "artifact" => {
                WorldCategory::Items
            }
            "factions" | "faction" | "organizations" | "organization" | "groups" | "group" => {
                WorldCategory::Factions
            }
            "concepts" | "concept" | "lore" | "ideas" | "idea" => WorldCategory::Concepts,
            "events" | "event" | "incidents" | "incident" => WorldCategory::Events,
            "races" | "race" | "species" | "peoples" => WorldCategory::Races,
            _ => return None,
        };
        Some(category)
    }
}

impl fmt::Display for WorldCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// The four canonical storyline buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorylineCategory {
    MainQuests,
    SideQuests,
    RelationshipArcs,
    PersonalArcs,
}

impl StorylineCategory {
    /// All categories in canonical order.
    pub const ALL: [StorylineCategory; 4] = [
        StorylineCategory::MainQuests,
        StorylineCategory::SideQuests,
        StorylineCategory::RelationshipArcs,
        StorylineCategory::PersonalArcs,
    ];

    /// The document key for this category.
    pub fn key(&self) -> &'static str {
        match self {
            StorylineCategory::MainQuests => "main_quests",
            StorylineCategory::SideQuests => "side_quests",
            StorylineCategory::RelationshipArcs => "relationship_arcs",
            StorylineCategory::PersonalArcs => "personal_arcs",
        }
    }

    /// Whether this bucket holds quests (as opposed to arcs).
    pub fn is_quest(&self) -> bool {
        matches!(
            self,
            StorylineCategory::MainQuests | StorylineCategory::SideQuests
        )
    }

    /// Search order biased by the id's naming convention. Always covers all
    /// four categories.
    pub fn search_order(hint: IdHint) -> [StorylineCategory; 4] {
        use StorylineCategory::*;
        match hint {
            IdHint::QuestLike => [MainQuests, SideQuests, RelationshipArcs, PersonalArcs],
            IdHint::ArcLike => [RelationshipArcs, PersonalArcs, MainQuests, SideQuests],
            IdHint::Unknown => Self::ALL,
        }
    }
}

impl fmt::Display for StorylineCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Naming-convention hint derived from an id prefix.
///
/// This is only an input-normalization heuristic; it biases search order but
/// never decides where an entity lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdHint {
    QuestLike,
    ArcLike,
    Unknown,
}

const QUEST_PREFIXES: &[&str] = &["quest", "mq", "sq", "main", "side"];
const ARC_PREFIXES: &[&str] = &["arc", "ra", "pa", "rel", "personal"];

impl IdHint {
    /// Inspect the first segment of an id (split on `_`, `-`, `:` or `.`).
    pub fn from_id(id: &str) -> Self {
        let lower = id.to_lowercase();
        let prefix = lower
            .split(['_', '-', ':', '.'])
            .next()
            .unwrap_or_default();
        if QUEST_PREFIXES.contains(&prefix) {
            IdHint::QuestLike
        } else if ARC_PREFIXES.contains(&prefix) {
            IdHint::ArcLike
        } else {
            IdHint::Unknown
        }
    }
}

/// What kind of entity a resolved id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "category", rename_all = "snake_case")]
pub enum EntityKind {
    Character,
    World(WorldCategory),
    Storyline(StorylineCategory),
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Character => f.write_str("characters"),
            EntityKind::World(c) => write!(f, "worldview.{c}"),
            EntityKind::Storyline(c) => write!(f, "storylines.{c}"),
        }
    }
}

/// A resolved reference: category plus id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Lowercase and strip separators (`_`, `-`, spaces, dots).
pub fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| !matches!(c, '_' | '-' | ' ' | '.' | '/' | ':'))
        .flat_map(char::to_lowercase)
        .collect()
}
