//! Snapshot persistence.
//!
//! Snapshots are stored per session key in three slots: a write-once
//! baseline, the current chapter, and a staged transaction record that is
//! either committed as current or discarded. Every save passes through
//! [`whitelist`], which drops unrecognized top-level keys.

use crate::pacing::PacingControlTower;
use crate::state::{ChapterState, TOP_LEVEL_KEYS};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Structurally invalid snapshot: {0}")]
    StructuralInvalid(String),

    #[error("Nothing stored for `{key}`")]
    NotFound { key: String },
}

/// Storage slot for one session key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Baseline,
    Current,
    Staged,
}

impl Slot {
    fn suffix(&self) -> &'static str {
        match self {
            Slot::Baseline => "baseline",
            Slot::Current => "current",
            Slot::Staged => "staged",
        }
    }
}

/// Keep only the recognized top-level snapshot keys.
pub fn whitelist(document: &Value) -> Value {
    let mut kept = Map::new();
    if let Some(root) = document.as_object() {
        for key in TOP_LEVEL_KEYS {
            if let Some(value) = root.get(key) {
                kept.insert(key.to_string(), value.clone());
            }
        }
    }
    Value::Object(kept)
}

/// Key-value snapshot storage.
///
/// Backends implement the three slot primitives; the chapter-level
/// operations are provided on top of them.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn read(&self, key: &str, slot: Slot) -> Result<Option<Value>, PersistError>;

    async fn write(&self, key: &str, slot: Slot, document: Value) -> Result<(), PersistError>;

    async fn remove(&self, key: &str, slot: Slot) -> Result<(), PersistError>;

    async fn load_baseline(&self, key: &str) -> Result<Option<Value>, PersistError> {
        self.read(key, Slot::Baseline).await
    }

    /// Write the baseline. An existing baseline is kept unless `force` is set;
    /// returns whether a write happened.
    async fn save_baseline(
        &self,
        key: &str,
        state: &ChapterState,
        force: bool,
    ) -> Result<bool, PersistError> {
        if !force && self.read(key, Slot::Baseline).await?.is_some() {
            tracing::debug!(key, "baseline already stored, not overwriting");
            return Ok(false);
        }
        self.write(key, Slot::Baseline, whitelist(&state.to_document()))
            .await?;
        Ok(true)
    }

    async fn load_current(&self, key: &str) -> Result<Option<Value>, PersistError> {
        self.read(key, Slot::Current).await
    }

    async fn save_current(&self, key: &str, state: &ChapterState) -> Result<(), PersistError> {
        self.write(key, Slot::Current, whitelist(&state.to_document()))
            .await
    }

    /// Write a transaction record that is not yet the current chapter.
    async fn stage(&self, key: &str, state: &ChapterState) -> Result<(), PersistError> {
        self.write(key, Slot::Staged, whitelist(&state.to_document()))
            .await
    }

    async fn discard_staged(&self, key: &str) -> Result<(), PersistError> {
        self.remove(key, Slot::Staged).await
    }

    /// Promote the staged record to current.
    async fn commit_staged(&self, key: &str) -> Result<(), PersistError> {
        let staged = self
            .read(key, Slot::Staged)
            .await?
            .ok_or_else(|| PersistError::NotFound {
                key: key.to_string(),
            })?;
        self.write(key, Slot::Current, staged).await?;
        self.remove(key, Slot::Staged).await
    }
}

// ============================================================================
// Backends
// ============================================================================

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: RwLock<HashMap<(String, Slot), Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn read(&self, key: &str, slot: Slot) -> Result<Option<Value>, PersistError> {
        let slots = self.slots.read().await;
        Ok(slots.get(&(key.to_string(), slot)).cloned())
    }

    async fn write(&self, key: &str, slot: Slot, document: Value) -> Result<(), PersistError> {
        self.slots
            .write()
            .await
            .insert((key.to_string(), slot), document);
        Ok(())
    }

    async fn remove(&self, key: &str, slot: Slot) -> Result<(), PersistError> {
        self.slots.write().await.remove(&(key.to_string(), slot));
        Ok(())
    }
}

/// One pretty-printed JSON file per key and slot.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// File path for `key` in `slot`.
    pub fn path_for(&self, key: &str, slot: Slot) -> PathBuf {
        let sanitized = key
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
            .collect::<String>();
        self.dir.join(format!("{sanitized}.{}.json", slot.suffix()))
    }
}

#[async_trait]
impl SnapshotStore for JsonFileStore {
    async fn read(&self, key: &str, slot: Slot) -> Result<Option<Value>, PersistError> {
        match fs::read_to_string(self.path_for(key, slot)).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, key: &str, slot: Slot, document: Value) -> Result<(), PersistError> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(key, slot);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&document)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, key: &str, slot: Slot) -> Result<(), PersistError> {
        match fs::remove_file(self.path_for(key, slot)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// Loading with fallback
// ============================================================================

/// Where a loaded state came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Current,
    Baseline,
    /// Neither slot held a usable snapshot; a fresh skeleton was built.
    Default,
}

#[derive(Debug, Clone)]
pub struct LoadedState {
    pub state: ChapterState,
    pub source: LoadSource,
}

/// Load the state for `key`, never trusting a malformed snapshot.
///
/// Tries current, then baseline, then a fresh default skeleton. The pacing
/// reconcile pass runs on whatever is returned.
pub async fn load_state<S>(
    store: &S,
    key: &str,
    tower: &PacingControlTower,
) -> Result<LoadedState, PersistError>
where
    S: SnapshotStore + ?Sized,
{
    let mut loaded = None;
    for (slot, source) in [
        (Slot::Current, LoadSource::Current),
        (Slot::Baseline, LoadSource::Baseline),
    ] {
        let Some(document) = store.read(key, slot).await? else {
            continue;
        };
        match ChapterState::from_document(&document) {
            Ok(state) => {
                loaded = Some((state, source));
                break;
            }
            Err(e) => {
                tracing::warn!(key, slot = slot.suffix(), error = %e, "stored snapshot rejected");
            }
        }
    }

    let (mut state, source) =
        loaded.unwrap_or_else(|| (ChapterState::new(key), LoadSource::Default));
    tower.reconcile(&mut state);
    tracing::info!(key, ?source, uid = %state.uid, "state loaded");
    Ok(LoadedState { state, source })
}
