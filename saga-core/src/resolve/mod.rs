//! Reference resolution.
//!
//! [`EntityResolver`] gives name-and-keyword visibility into every entity and
//! resolves ids back to records. [`StorylineCategoryResolver`] maps loose
//! storyline references onto the four canonical buckets and materializes
//! missing records.

mod entity;
mod storyline;

pub use entity::{display_name, is_hidden, EntityResolver, ManifestEntry, Resolved};
pub use storyline::{CategoryHints, StorylineCategoryResolver};
