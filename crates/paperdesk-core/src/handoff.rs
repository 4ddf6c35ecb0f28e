//! Keyed handoff of payloads between independent execution contexts.
//!
//! Two flavours of record share one store:
//!
//! - **Result sets** (`put` / `take`): read exactly once. The first `take`
//!   removes the record, so a second consumer (a stale view, a re-run of the
//!   same command) gets [`CoreError::NotFound`].
//! - **Entity payloads** (`put_entity` / `peek_entity`): one paper staged for
//!   analysis. Reads are non-destructive because the same entity may be opened
//!   more than once; the record lives until cleared or overwritten.
//!
//! Nothing is evicted in the background. Records that are never consumed stay
//! until overwritten or removed by hand.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::CoreError;

pub const RESULTS_KEY_PREFIX: &str = "results_";
pub const ENTITY_KEY_PREFIX: &str = "paper_for_analysis_";

/// Key for a freshly aggregated result set: `results_<unix millis>`.
pub fn results_key(at: DateTime<Utc>) -> String {
    format!("{RESULTS_KEY_PREFIX}{}", at.timestamp_millis())
}

/// Key for a staged entity: `paper_for_analysis_<entity id>`.
pub fn entity_key(entity_id: &str) -> String {
    format!("{ENTITY_KEY_PREFIX}{entity_id}")
}

/// A stored payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub key: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl HandoffRecord {
    pub fn new(key: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            payload,
            created_at: Utc::now(),
        }
    }

    /// Decode the payload into a concrete type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CoreError> {
        T::deserialize(&self.payload).map_err(|e| {
            CoreError::MalformedPayload(format!("handoff record {}: {e}", self.key))
        })
    }
}

/// Storage shared between the context that produces a payload and the
/// context that consumes it.
///
/// Implementations must make `put` fully visible before it returns and make
/// `take` remove-and-return atomically, so two concurrent consumers can never
/// both receive the same record.
pub trait HandoffStore: Send + Sync {
    /// Store a result set under `key`. An existing record is replaced.
    fn put(&self, key: &str, payload: serde_json::Value) -> Result<(), CoreError>;

    /// Remove and return the record under `key`.
    fn take(&self, key: &str) -> Result<HandoffRecord, CoreError>;

    /// Stage a single entity's payload. An existing payload is replaced.
    fn put_entity(&self, entity_id: &str, payload: serde_json::Value) -> Result<(), CoreError>;

    /// Read a staged entity's payload without removing it.
    fn peek_entity(&self, entity_id: &str) -> Result<HandoffRecord, CoreError>;

    /// Drop a staged entity. Returns whether anything was removed.
    fn clear_entity(&self, entity_id: &str) -> Result<bool, CoreError>;
}

/// In-process store for contexts that share an address space.
///
/// Uses [`DashMap`] so producers and consumers on different tasks never block
/// each other on a global lock.
#[derive(Default)]
pub struct MemoryHandoffStore {
    records: DashMap<String, HandoffRecord>,
    entities: DashMap<String, HandoffRecord>,
}

impl MemoryHandoffStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of result sets waiting to be taken.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl HandoffStore for MemoryHandoffStore {
    fn put(&self, key: &str, payload: serde_json::Value) -> Result<(), CoreError> {
        check_key(key)?;
        self.records
            .insert(key.to_string(), HandoffRecord::new(key, payload));
        Ok(())
    }

    fn take(&self, key: &str) -> Result<HandoffRecord, CoreError> {
        self.records
            .remove(key)
            .map(|(_, record)| record)
            .ok_or_else(|| CoreError::NotFound(key.to_string()))
    }

    fn put_entity(&self, entity_id: &str, payload: serde_json::Value) -> Result<(), CoreError> {
        check_key(entity_id)?;
        self.entities.insert(
            entity_id.to_string(),
            HandoffRecord::new(entity_key(entity_id), payload),
        );
        Ok(())
    }

    fn peek_entity(&self, entity_id: &str) -> Result<HandoffRecord, CoreError> {
        self.entities
            .get(entity_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| CoreError::NotFound(entity_key(entity_id)))
    }

    fn clear_entity(&self, entity_id: &str) -> Result<bool, CoreError> {
        Ok(self.entities.remove(entity_id).is_some())
    }
}

impl std::fmt::Debug for MemoryHandoffStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryHandoffStore")
            .field("records", &self.records.len())
            .field("entities", &self.entities.len())
            .finish()
    }
}

/// Directory-backed store for contexts in separate processes.
///
/// Layout under the root directory:
///
/// ```text
/// results/<key>.json                      result sets
/// entities/paper_for_analysis_<id>.json   staged entities
/// .claimed/                               records mid-take
/// ```
///
/// Writes go to a temp file in the destination directory and are renamed into
/// place, so readers never see a partial record. `take` claims a record by
/// renaming it into `.claimed/` first; only one process can win that rename.
#[derive(Debug, Clone)]
pub struct DirHandoffStore {
    root: PathBuf,
}

impl DirHandoffStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let root = root.into();
        for sub in ["results", "entities", ".claimed"] {
            fs::create_dir_all(root.join(sub))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, key: &str) -> Result<PathBuf, CoreError> {
        check_key(key)?;
        Ok(self.root.join("results").join(file_name(key)))
    }

    fn entity_path(&self, entity_id: &str) -> Result<PathBuf, CoreError> {
        check_key(entity_id)?;
        Ok(self
            .root
            .join("entities")
            .join(file_name(&entity_key(entity_id))))
    }

    fn write_atomic(&self, path: &Path, record: &HandoffRecord) -> Result<(), CoreError> {
        let dir = path.parent().unwrap_or(&self.root);
        let mut tmp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer(&mut tmp, record)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| CoreError::Io(e.error))?;
        Ok(())
    }

    fn read_record(path: &Path, key: &str) -> Result<HandoffRecord, CoreError> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CoreError::NotFound(key.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&raw)
            .map_err(|e| CoreError::MalformedPayload(format!("handoff record {key}: {e}")))
    }
}

impl HandoffStore for DirHandoffStore {
    fn put(&self, key: &str, payload: serde_json::Value) -> Result<(), CoreError> {
        let path = self.record_path(key)?;
        self.write_atomic(&path, &HandoffRecord::new(key, payload))
    }

    fn take(&self, key: &str) -> Result<HandoffRecord, CoreError> {
        let path = self.record_path(key)?;
        let claimed = self.root.join(".claimed").join(format!(
            "{}.{:016x}",
            file_name(key),
            fastrand::u64(..)
        ));

        match fs::rename(&path, &claimed) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CoreError::NotFound(key.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        let record = Self::read_record(&claimed, key);
        if let Err(e) = fs::remove_file(&claimed) {
            log::warn!("could not remove claimed handoff record {}: {e}", claimed.display());
        }
        record
    }

    fn put_entity(&self, entity_id: &str, payload: serde_json::Value) -> Result<(), CoreError> {
        let path = self.entity_path(entity_id)?;
        self.write_atomic(&path, &HandoffRecord::new(entity_key(entity_id), payload))
    }

    fn peek_entity(&self, entity_id: &str) -> Result<HandoffRecord, CoreError> {
        let path = self.entity_path(entity_id)?;
        Self::read_record(&path, &entity_key(entity_id))
    }

    fn clear_entity(&self, entity_id: &str) -> Result<bool, CoreError> {
        let path = self.entity_path(entity_id)?;
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

fn check_key(key: &str) -> Result<(), CoreError> {
    if key.trim().is_empty() {
        return Err(CoreError::InvalidRequest(
            "handoff key must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Map a key onto a safe file name: anything outside `[A-Za-z0-9._-]` becomes
/// `_`, and a leading dot is replaced so records never hide as dotfiles.
fn file_name(key: &str) -> String {
    let mut name: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.starts_with('.') {
        name.replace_range(..1, "_");
    }
    name.push_str(".json");
    name
}
