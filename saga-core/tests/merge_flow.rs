//! Multi-chapter merge scenarios.
//!
//! These tests drive the engine through `TestHarness` the way a session
//! would: one Delta per chapter, each applied to the previous snapshot.

use saga_core::merge::{RejectionKind, Section};
use saga_core::resolve::is_hidden;
use saga_core::testing::{assert_resolves, assert_structurally_valid, sample_state, TestHarness};
use saga_core::{ChapterState, EntityResolver, StorylineCategory};
use serde_json::json;

// =============================================================================
// TEST 1: Created entities are immediately resolvable
// =============================================================================

#[test]
fn test_created_ids_resolve_and_are_visible() {
    let mut harness = TestHarness::new();
    let report = harness.chapter(json!({
        "creations": {"staticMatrices": {
            "characters": {"old_tom": {"name": "Old Tom", "keywords": ["ferryman"]}},
            "worldview": {
                "factions": {"tide_guild": {"name": "The Tide Guild"}},
                "concepts": {"sea_oath": {"name": "The Sea Oath", "hidden": true}}
            },
            "storylines": {"personal_arcs": {"arc_guilt": {"title": "Aren's Guilt"}}}
        }}
    }));
    assert!(report.is_clean());

    for id in ["old_tom", "tide_guild", "arc_guilt"] {
        assert_resolves(&harness, id);
        let found = EntityResolver::resolve(id, &harness.state).expect("created id should resolve");
        assert!(!is_hidden(found.record));
    }

    // Explicitly hidden creations exist but are excluded
    assert!(EntityResolver::resolve("sea_oath", &harness.state).is_none());
    assert!(EntityResolver::locate("sea_oath", &harness.state).is_some());

    let mut resolver = EntityResolver::new();
    let manifest = resolver.manifest(&harness.state);
    assert!(manifest.iter().any(|e| e.id == "old_tom" && e.display_name == "Old Tom"));
    assert!(manifest.iter().all(|e| e.id != "sea_oath"));
}

// =============================================================================
// TEST 2: Relationship history stays bounded across many chapters
// =============================================================================

#[test]
fn test_affinity_history_across_chapters() {
    let mut harness = TestHarness::new();
    let changes = [5.0, -3.0, 8.0, 1.0, -10.0, 4.0, 2.0, 2.0, 6.0, -1.0, 3.0, 7.0];

    for (i, change) in changes.iter().enumerate() {
        harness.chapter(json!({"updates": {"characters": {"mira": {"relationships": {
            "hero": {"affinity_change": change, "reason": format!("Chapter {i} reasoning")}
        }}}}}));

        let track = &harness.state.dynamic_state.characters["mira"].relationships["hero"];
        assert!(track.history.len() <= 10);
        let newest = track.history.last().expect("history should have an entry");
        assert_eq!(newest.change, *change);
        assert_eq!(newest.chapter, harness.state.uid);
    }

    let track = &harness.state.dynamic_state.characters["mira"].relationships["hero"];
    assert_eq!(track.history.len(), 10);
    assert_eq!(track.current_affinity, changes.iter().sum::<f64>());
    assert_eq!(track.latest_reasoning.as_deref(), Some("Chapter 11 reasoning"));
}

// =============================================================================
// TEST 3: Storyline updates never create
// =============================================================================

#[test]
fn test_storyline_update_for_unknown_id_is_rejected() {
    let mut harness = TestHarness::new();
    let before = harness.state.clone();

    let report = harness.chapter(json!({"updates": {"storylines": {
        "side_quests": {"sq_phantom": {"current_status": "active", "title": "Phantom"}}
    }}}));

    let rejection = report
        .rejections_in(Section::Storylines)
        .next()
        .expect("the update should be rejected");
    assert_eq!(rejection.target, "sq_phantom");
    assert_eq!(rejection.kind, RejectionKind::ReferenceNotFound);

    assert_eq!(
        harness.state.static_matrices.storylines,
        before.static_matrices.storylines
    );
    assert_eq!(
        harness.state.dynamic_state.storylines,
        before.dynamic_state.storylines
    );
}

#[test]
fn test_progress_does_not_clobber_created_storyline() {
    let mut harness = TestHarness::new();
    harness.chapter(json!({"creations": {"staticMatrices": {"storylines": {
        "relationship_arcs": {"arc_mira_bond": {
            "title": "A Healer's Trust",
            "summary": "Mira decides whether Aren is worth the risk."
        }}
    }}}}));
    harness.chapter(json!({"storyline_progress_deltas": [
        {"storyline_id": "arc_mira_bond", "progress_delta": 20, "title": "mira thing"}
    ]}));

    let record = &harness.state.static_matrices.storylines.relationship_arcs["arc_mira_bond"];
    assert_eq!(record["title"], "A Healer's Trust");
    let progress =
        &harness.state.meta.narrative_control_tower.storyline_progress["arc_mira_bond"];
    assert_eq!(progress.category, Some(StorylineCategory::RelationshipArcs));
    assert!(harness
        .state
        .static_matrices
        .storylines
        .personal_arcs
        .is_empty());
}

// =============================================================================
// TEST 4: A full chapter touching every section
// =============================================================================

#[test]
fn test_full_chapter() {
    let mut harness = TestHarness::new();
    let report = harness.chapter(json!({
        "creations": {"staticMatrices": {
            "worldview": {"events": {"harbor_fire": {"name": "The Harbor Fire"}}}
        }},
        "updates": {
            "characters": {"hero": {
                "personality": "Guarded, quick to anger",
                "relationships": {"mira": {"affinity_change": 4, "reason": "She tended his burns."}}
            }},
            "worldview": {"locations": {"harbor": {"updated_description": "Ash and wet timber."}}},
            "storylines": {"main_quests": {"quest_crown": {
                "summary_update": "The crown was seen leaving on a grain barge.",
                "history_entry": "A dockhand talked."
            }}},
            "meta": {"active_narrative_arcs": [{"id": "arc_trust", "note": "Mira stayed."}]}
        },
        "relationship_updates": [{"edge_id": "hero_mira", "updates": {
            "last_shared_scene": "{{current_chapter}}"
        }}],
        "chronology_update": {"day": 2, "time_slot": "night", "weather": "smoke"},
        "stylistic_analysis_delta": {"imagery": ["embers on black water"]},
        "rhythm_assessment": {"emotional_intensity": 8, "phase_transition": true},
        "storyline_progress_deltas": [{"storyline_id": "quest_crown", "progress_delta": 12}],
        "new_long_term_summary": "The harbor burned.",
        "new_handoff_memo": "Follow the barge."
    }));
    assert!(report.is_clean(), "unexpected rejections: {:?}", report.rejections);

    let state = &harness.state;
    assert_structurally_valid(state);
    assert!(!state.is_dirty());
    assert_eq!(state.static_matrices.characters["hero"]["personality"], "Guarded, quick to anger");
    assert_eq!(
        state.static_matrices.worldview.locations["harbor"]["description"],
        "Ash and wet timber."
    );
    assert_eq!(
        state.dynamic_state.storylines.main_quests["quest_crown"].current_summary,
        "The crown was seen leaving on a grain barge."
    );
    let edge = state
        .static_matrices
        .relationship_graph
        .edge("hero_mira")
        .expect("edge should exist");
    assert_eq!(edge.attributes["last_shared_scene"], json!(state.uid));
    assert_eq!(state.dynamic_state.chronology.day, 2);
    assert_eq!(state.meta.active_narrative_arcs[0].notes[0].note, "Mira stayed.");
    assert_eq!(state.meta.handoff_memo, "Follow the barge.");
    assert_eq!(state.meta.narrative_control_tower.rhythm.phase_history.len(), 1);
    assert_eq!(
        state.meta.narrative_control_tower.storyline_progress["quest_crown"].current_stage,
        "introduction"
    );
}

// =============================================================================
// TEST 5: Orphans in the dynamic layer get placeholder static records
// =============================================================================

#[test]
fn test_relationship_target_orphan_is_repaired() {
    let mut harness = TestHarness::new();
    let report = harness.chapter(json!({"updates": {"characters": {"hero": {"relationships": {
        "stranger_in_grey": {"affinity_change": -2}
    }}}}}));

    assert_eq!(report.applied_in(Section::Repair).count(), 1);
    let record = &harness.state.static_matrices.characters["stranger_in_grey"];
    assert_eq!(record["placeholder"], true);
}

// =============================================================================
// TEST 6: Round-trip through instantiate
// =============================================================================

#[test]
fn test_round_trip_instantiate() {
    let mut harness = TestHarness::new();
    harness.chapter(json!({
        "rhythm_assessment": {"emotional_intensity": 6, "devices_used": ["flashback"]},
        "chronology_update": {"weather": "drizzle"}
    }));

    let document = harness.state.to_document();
    let restored = ChapterState::instantiate(&document).expect("instantiate should succeed");
    assert!(ChapterState::is_structurally_valid(&restored.to_document()));
    assert_eq!(restored, harness.state);
}

#[test]
fn test_instantiate_partial_subtree_replaces_whole_key() {
    let state = sample_state();
    let mut document = state.to_document();
    document["meta"] = json!({"handoff_memo": "only this"});

    let restored = ChapterState::instantiate(&document).expect("instantiate should succeed");
    assert_eq!(restored.meta.handoff_memo, "only this");
    // The rest of meta came from defaults, not from the source snapshot
    assert!(restored.meta.active_narrative_arcs.is_empty());
    assert_eq!(restored.static_matrices, state.static_matrices);
}

// =============================================================================
// TEST 7: Storyline history stays bounded and bad items stay local
// =============================================================================

#[test]
fn test_storyline_history_across_chapters() {
    let mut harness = TestHarness::new();
    for i in 0..12 {
        harness.chapter(json!({"updates": {"storylines": {"main_quests": {
            "quest_crown": {"history_entry": format!("development {i}")}
        }}}}));
        let history = &harness.state.dynamic_state.storylines.main_quests["quest_crown"].history;
        assert!(history.len() <= 10);
    }

    let status = &harness.state.dynamic_state.storylines.main_quests["quest_crown"];
    assert_eq!(status.history.len(), 10);
    assert_eq!(
        status.history.last().map(|entry| entry.note.as_str()),
        Some("development 11")
    );
}

#[test]
fn test_malformed_items_rejected_chapter_still_applies() {
    let mut harness = TestHarness::new();
    let report = harness.chapter(json!({
        "new_handoff_memo": "Meet at dawn",
        "updates": {"meta": {"active_narrative_arcs": [{"title": "no id"}]}},
        "relationship_updates": [{"updates": {"tension": 2}}],
        "chronology_update": {"day": "3"}
    })).clone();

    assert_eq!(harness.state.meta.handoff_memo, "Meet at dawn");
    assert_eq!(harness.state.dynamic_state.chronology.day, 3);
    let rejected: Vec<_> = report
        .rejections
        .iter()
        .map(|r| (r.section, r.kind, r.target.as_str()))
        .collect();
    assert_eq!(
        rejected,
        vec![
            (Section::Arcs, RejectionKind::Invalid, "active_narrative_arcs[0]"),
            (
                Section::RelationshipGraph,
                RejectionKind::Invalid,
                "relationship_updates[0]"
            ),
        ]
    );
    assert_structurally_valid(&harness.state);
}
