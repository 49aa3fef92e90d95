//! Sections 5-9: running summaries, chronology, arcs, relationship-graph
//! edges and the stylistic archive.

use super::report::{RejectionKind, Section};
use super::{CreationPolicy, MergePass};
use crate::delta::{ArcUpdate, ChronologyUpdate, Delta, RelationshipUpdate, StylisticDelta};
use crate::json::{deep_merge_map, set_path, substitute_token};
use crate::state::{ArcNote, NarrativeArc, RelationshipEdge, SensoryPattern, TimeSlot};
use serde_json::Value;

/// Keys in a physiological patch that signal the character rested.
const REST_KEYS: &[&str] = &["rested", "has_rested", "slept"];

impl MergePass<'_> {
    // =========================================================================
    // 5. Running summary and hand-off memo
    // =========================================================================

    pub(crate) fn narrative(&mut self, delta: &Delta) {
        if let Some(summary) = &delta.new_long_term_summary {
            if let Some(summary) = self.loose(Section::Narrative, "long_term_summary", summary) {
                self.state.meta.long_term_summary = summary.clone();
                self.report
                    .applied(Section::Narrative, "long_term_summary", "replaced");
            }
        }
        if let Some(memo) = &delta.new_handoff_memo {
            if let Some(memo) = self.loose(Section::Narrative, "handoff_memo", memo) {
                self.state.meta.handoff_memo = memo.clone();
                self.report.applied(Section::Narrative, "handoff_memo", "replaced");
            }
        }
    }

    // =========================================================================
    // 6. Chronology
    // =========================================================================

    pub(crate) fn chronology(&mut self, update: &ChronologyUpdate) {
        let chronology = &mut self.state.dynamic_state.chronology;

        if let Some(day) = update.day {
            chronology.day = day;
            self.report.applied(Section::Chronology, "day", day.to_string());
        }
        if let Some(slot) = &update.time_slot {
            match TimeSlot::parse(slot) {
                Some(parsed) => {
                    chronology.time_slot = parsed;
                    self.report.applied(Section::Chronology, "time_slot", slot.clone());
                }
                None => self.report.reject(
                    Section::Chronology,
                    "time_slot",
                    RejectionKind::Invalid,
                    format!("unknown time slot `{slot}`"),
                ),
            }
        }
        if let Some(weather) = &update.weather {
            chronology.weather = weather.clone();
            self.report
                .applied(Section::Chronology, "weather", weather.clone());
        }

        if update.character_states.is_empty() {
            return;
        }
        if !update.is_time_jump() {
            self.report.reject(
                Section::Chronology,
                "character_states",
                RejectionKind::Invalid,
                "physiological patches only apply on a time jump",
            );
            return;
        }

        let mut rested = false;
        for (id, patch) in &update.character_states {
            if !self.state.static_matrices.characters.contains_key(id) {
                self.report.reject(
                    Section::Chronology,
                    id,
                    RejectionKind::ReferenceNotFound,
                    "physiological patch for unknown character",
                );
                continue;
            }
            let Some(patch) = patch.as_object() else {
                self.report.reject(
                    Section::Chronology,
                    id,
                    RejectionKind::Invalid,
                    "physiological patch is not an object",
                );
                continue;
            };

            let dynamics = self
                .state
                .dynamic_state
                .characters
                .entry(id.clone())
                .or_default();
            deep_merge_map(&mut dynamics.physiology, patch);
            rested |= REST_KEYS
                .iter()
                .any(|key| patch.get(*key).and_then(Value::as_bool) == Some(true));
            self.report.applied(Section::Chronology, id, "physiology");
        }

        if rested {
            self.state.dynamic_state.chronology.last_rest_chapter = Some(self.chapter.clone());
        }
    }

    // =========================================================================
    // 7. Narrative arcs
    // =========================================================================

    pub(crate) fn arcs(&mut self, updates: &[&ArcUpdate]) {
        for update in updates {
            let arcs = &mut self.state.meta.active_narrative_arcs;
            let position = arcs.iter().position(|arc| arc.id == update.id);

            if update.closes() {
                match position {
                    Some(index) => {
                        arcs.remove(index);
                        self.report.applied(Section::Arcs, &update.id, "closed");
                    }
                    None => self.report.reject(
                        Section::Arcs,
                        &update.id,
                        RejectionKind::ReferenceNotFound,
                        "cannot close an arc that is not active",
                    ),
                }
                continue;
            }

            let index = match position {
                Some(index) => index,
                None if self.config.arcs == CreationPolicy::CreateOnUpdate => {
                    arcs.push(NarrativeArc::new(update.id.clone()));
                    self.report.applied(Section::Arcs, &update.id, "created");
                    arcs.len() - 1
                }
                None => {
                    self.report.reject(
                        Section::Arcs,
                        &update.id,
                        RejectionKind::ReferenceNotFound,
                        "no active arc with this id",
                    );
                    continue;
                }
            };

            let arc = &mut arcs[index];
            if let Some(status) = &update.status {
                arc.status = status.clone();
            }
            let mut fields = update.fields.clone();
            if let Some(title) = fields.remove("title").and_then(|v| v.as_str().map(str::to_string)) {
                arc.title = title;
            }
            deep_merge_map(&mut arc.extra, &fields);

            let note = update.note.clone().unwrap_or_else(|| {
                let mut changed: Vec<&str> = update.fields.keys().map(String::as_str).collect();
                if update.status.is_some() {
                    changed.push("status");
                }
                format!("updated: {}", changed.join(", "))
            });
            arc.notes.push(ArcNote {
                chapter: self.chapter.clone(),
                timestamp: self.timestamp.clone(),
                note,
            });
            self.report.applied(Section::Arcs, &update.id, "patched");
        }
    }

    // =========================================================================
    // 8. Relationship-graph edges
    // =========================================================================

    pub(crate) fn relationship_edges(&mut self, updates: &[&RelationshipUpdate]) {
        for update in updates {
            let Some(edge) = self
                .state
                .static_matrices
                .relationship_graph
                .edge_mut(&update.edge_id)
            else {
                self.report.reject(
                    Section::RelationshipGraph,
                    &update.edge_id,
                    RejectionKind::ReferenceNotFound,
                    "no edge with this id",
                );
                continue;
            };

            let mut document = serde_json::to_value(&*edge).unwrap_or(Value::Null);
            let mut bad_paths = Vec::new();
            for (path, value) in &update.updates {
                if !set_path(&mut document, path, value.clone()) {
                    bad_paths.push(path.clone());
                }
            }
            substitute_token(&mut document, &self.config.placeholder_token, &self.chapter);

            match serde_json::from_value::<RelationshipEdge>(document) {
                Ok(patched) if patched.id == update.edge_id => {
                    *edge = patched;
                    self.report.applied(
                        Section::RelationshipGraph,
                        &update.edge_id,
                        format!("{} path(s)", update.updates.len() - bad_paths.len()),
                    );
                }
                Ok(_) => self.report.reject(
                    Section::RelationshipGraph,
                    &update.edge_id,
                    RejectionKind::Invalid,
                    "update would change the edge id",
                ),
                Err(e) => self.report.reject(
                    Section::RelationshipGraph,
                    &update.edge_id,
                    RejectionKind::Invalid,
                    format!("patched edge is malformed: {e}"),
                ),
            }

            for path in bad_paths {
                self.report.reject(
                    Section::RelationshipGraph,
                    &update.edge_id,
                    RejectionKind::Invalid,
                    format!("unusable path `{path}`"),
                );
            }
        }
    }

    // =========================================================================
    // 9. Stylistic archive
    // =========================================================================

    pub(crate) fn stylistic(&mut self, delta: &StylisticDelta) {
        let imagery = self.loose_items(Section::Stylistic, "imagery", &delta.imagery);
        let descriptors = self.loose_items(Section::Stylistic, "descriptors", &delta.descriptors);
        let patterns =
            self.loose_items(Section::Stylistic, "sensory_patterns", &delta.sensory_patterns);

        let threshold = self.config.overuse_threshold;
        let archive = &mut self.state.dynamic_state.stylistic_archive;

        archive.imagery.extend(
            imagery
                .iter()
                .filter(|image| !image.trim().is_empty())
                .map(|image| image.to_string()),
        );

        for descriptor in &descriptors {
            let word = descriptor.word.trim().to_lowercase();
            if word.is_empty() {
                continue;
            }
            let stat = archive.descriptors.entry(word).or_default();
            stat.count = stat.count.saturating_add(descriptor.count);
            stat.overused = stat.count >= threshold;
        }

        for pattern in &patterns {
            match archive
                .sensory_patterns
                .iter_mut()
                .find(|p| p.kind == pattern.kind && p.pattern == pattern.pattern)
            {
                Some(existing) => existing.count = existing.count.saturating_add(pattern.count),
                None => archive.sensory_patterns.push(SensoryPattern {
                    kind: pattern.kind.clone(),
                    pattern: pattern.pattern.clone(),
                    count: pattern.count,
                }),
            }
        }

        self.report.applied(
            Section::Stylistic,
            "stylistic_archive",
            format!(
                "{} image(s), {} descriptor(s), {} sensory pattern(s)",
                imagery.len(),
                descriptors.len(),
                patterns.len()
            ),
        );
    }
}
