//! What a merge did and what it refused to do.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The ten merge sections, in application order, plus the final repair pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Creations,
    Characters,
    World,
    Storylines,
    Narrative,
    Chronology,
    Arcs,
    RelationshipGraph,
    Stylistic,
    Pacing,
    Repair,
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Section::Creations => "creations",
            Section::Characters => "characters",
            Section::World => "world",
            Section::Storylines => "storylines",
            Section::Narrative => "narrative",
            Section::Chronology => "chronology",
            Section::Arcs => "arcs",
            Section::RelationshipGraph => "relationship_graph",
            Section::Stylistic => "stylistic",
            Section::Pacing => "pacing",
            Section::Repair => "repair",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    /// The update targets an id absent from the static layer.
    ReferenceNotFound,
    /// The update is malformed or carries an unusable value.
    Invalid,
}

/// A sub-operation that was applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedOp {
    pub section: Section,
    pub target: String,
    pub detail: String,
}

/// A sub-operation that was skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub section: Section,
    pub target: String,
    pub kind: RejectionKind,
    pub reason: String,
}

/// Per-item outcome of one merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeReport {
    pub applied: Vec<AppliedOp>,
    pub rejections: Vec<Rejection>,
}

impl MergeReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn applied(
        &mut self,
        section: Section,
        target: impl Into<String>,
        detail: impl Into<String>,
    ) {
        self.applied.push(AppliedOp {
            section,
            target: target.into(),
            detail: detail.into(),
        });
    }

    /// Record a skipped item and log it.
    pub(crate) fn reject(
        &mut self,
        section: Section,
        target: impl Into<String>,
        kind: RejectionKind,
        reason: impl Into<String>,
    ) {
        let rejection = Rejection {
            section,
            target: target.into(),
            kind,
            reason: reason.into(),
        };
        tracing::warn!(
            %section,
            target = %rejection.target,
            kind = ?rejection.kind,
            reason = %rejection.reason,
            "delta item rejected"
        );
        self.rejections.push(rejection);
    }

    /// True when nothing was rejected.
    pub fn is_clean(&self) -> bool {
        self.rejections.is_empty()
    }

    pub fn rejections_in(&self, section: Section) -> impl Iterator<Item = &Rejection> {
        self.rejections.iter().filter(move |r| r.section == section)
    }

    pub fn applied_in(&self, section: Section) -> impl Iterator<Item = &AppliedOp> {
        self.applied.iter().filter(move |op| op.section == section)
    }

    /// Whether `target` was rejected in any section.
    pub fn was_rejected(&self, target: &str) -> bool {
        self.rejections.iter().any(|r| r.target == target)
    }
}
