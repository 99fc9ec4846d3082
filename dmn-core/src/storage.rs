//! Durable undo records and tip state
//!
//! Every file is an envelope holding a format version, the SHA3-256
//! checksum of the body and the bincode body itself. Files are written to a
//! temporary path first and renamed into place.

use crate::config::StorageConfig;
use crate::snapshot::{Snapshot, UndoRecord};
use crate::types::{BlockHash, BlockHeight};
use crate::{DmnError, Result};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Envelope format version
pub const STORAGE_VERSION: u32 = 1;

const UNDO_EXTENSION: &str = "undo";

/// Everything needed to resume at the active tip
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTip {
    /// Snapshot of the active tip
    pub snapshot: Snapshot,
    /// Activation signal of every connected block, genesis first
    pub signals: Vec<bool>,
    /// Genesis the registry was started from
    pub genesis_hash: BlockHash,
}

/// Persistence of undo records and the active tip
pub trait UndoStore {
    /// Store the undo record of one block, replacing any record at its height
    fn put(&mut self, record: &UndoRecord) -> Result<()>;

    /// Fetch the undo record at `height`
    fn get(&self, height: BlockHeight) -> Result<Option<UndoRecord>>;

    /// Drop the undo record at `height`
    fn remove(&mut self, height: BlockHeight) -> Result<()>;

    /// Heights with a stored record, ascending
    fn heights(&self) -> Result<Vec<BlockHeight>>;

    /// Persist the active tip
    fn save_tip(&mut self, tip: &StoredTip) -> Result<()>;

    /// Load the active tip, `None` for a fresh store
    fn load_tip(&self) -> Result<Option<StoredTip>>;
}

/// In-memory store for tests and ephemeral nodes
#[derive(Debug, Clone, Default)]
pub struct MemoryUndoStore {
    records: BTreeMap<BlockHeight, UndoRecord>,
    tip: Option<StoredTip>,
}

impl MemoryUndoStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl UndoStore for MemoryUndoStore {
    fn put(&mut self, record: &UndoRecord) -> Result<()> {
        self.records.insert(record.height, record.clone());
        Ok(())
    }

    fn get(&self, height: BlockHeight) -> Result<Option<UndoRecord>> {
        Ok(self.records.get(&height).cloned())
    }

    fn remove(&mut self, height: BlockHeight) -> Result<()> {
        self.records.remove(&height);
        Ok(())
    }

    fn heights(&self) -> Result<Vec<BlockHeight>> {
        Ok(self.records.keys().copied().collect())
    }

    fn save_tip(&mut self, tip: &StoredTip) -> Result<()> {
        self.tip = Some(tip.clone());
        Ok(())
    }

    fn load_tip(&self) -> Result<Option<StoredTip>> {
        Ok(self.tip.clone())
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u32,
    checksum: [u8; 32],
    body: Vec<u8>,
}

fn checksum(body: &[u8]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(body);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

fn seal<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let body = bincode::serialize(value)?;
    let envelope = Envelope {
        version: STORAGE_VERSION,
        checksum: checksum(&body),
        body,
    };
    Ok(bincode::serialize(&envelope)?)
}

fn unseal<T: for<'de> Deserialize<'de>>(bytes: &[u8], path: &Path) -> Result<T> {
    let envelope: Envelope = bincode::deserialize(bytes)
        .map_err(|e| DmnError::CorruptUndoRecord(format!("{}: {}", path.display(), e)))?;

    if envelope.version != STORAGE_VERSION {
        return Err(DmnError::CorruptUndoRecord(format!(
            "{}: unsupported version {}",
            path.display(),
            envelope.version
        )));
    }
    if checksum(&envelope.body) != envelope.checksum {
        return Err(DmnError::CorruptUndoRecord(format!(
            "{}: checksum mismatch",
            path.display()
        )));
    }

    bincode::deserialize(&envelope.body)
        .map_err(|e| DmnError::CorruptUndoRecord(format!("{}: {}", path.display(), e)))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let write_err = |e: std::io::Error| DmnError::Storage(format!("Failed to write {}: {}", tmp.display(), e));

    let mut file = File::create(&tmp).map_err(write_err)?;
    file.write_all(bytes).map_err(write_err)?;
    // Contents must be on disk before the rename makes them visible
    file.sync_all().map_err(write_err)?;
    drop(file);

    std::fs::rename(&tmp, path)
        .map_err(|e| DmnError::Storage(format!("Failed to move {} into place: {}", path.display(), e)))?;
    sync_parent(path)
}

/// Persist the directory entry created by a rename
#[cfg(unix)]
fn sync_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        File::open(parent)
            .and_then(|dir| dir.sync_all())
            .map_err(|e| DmnError::Storage(format!("Failed to sync {}: {}", parent.display(), e)))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> Result<()> {
    Ok(())
}

/// Store keeping one file per undo record plus a tip file
#[derive(Debug, Clone)]
pub struct FileUndoStore {
    undo_dir: PathBuf,
    tip_path: PathBuf,
}

impl FileUndoStore {
    /// Open a store, creating directories as needed
    pub fn open(undo_dir: impl Into<PathBuf>, tip_path: impl Into<PathBuf>) -> Result<Self> {
        let undo_dir = undo_dir.into();
        let tip_path = tip_path.into();

        std::fs::create_dir_all(&undo_dir)
            .map_err(|e| DmnError::Storage(format!("Failed to create undo directory: {}", e)))?;
        if let Some(parent) = tip_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DmnError::Storage(format!("Failed to create data directory: {}", e)))?;
        }

        Ok(Self { undo_dir, tip_path })
    }

    /// Open the store described by a storage configuration
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        Self::open(config.undo_path(), config.snapshot_path())
    }

    fn record_path(&self, height: BlockHeight) -> PathBuf {
        self.undo_dir.join(format!("{}.{}", height, UNDO_EXTENSION))
    }
}

impl UndoStore for FileUndoStore {
    fn put(&mut self, record: &UndoRecord) -> Result<()> {
        let path = self.record_path(record.height);
        write_atomic(&path, &seal(record)?)?;
        debug!("Stored undo record for height {}", record.height);
        Ok(())
    }

    fn get(&self, height: BlockHeight) -> Result<Option<UndoRecord>> {
        let path = self.record_path(height);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)
            .map_err(|e| DmnError::Storage(format!("Failed to read {}: {}", path.display(), e)))?;
        let record: UndoRecord = unseal(&bytes, &path)?;
        if record.height != height {
            return Err(DmnError::CorruptUndoRecord(format!(
                "{} holds the record for height {}",
                path.display(),
                record.height
            )));
        }
        Ok(Some(record))
    }

    fn remove(&mut self, height: BlockHeight) -> Result<()> {
        let path = self.record_path(height);
        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| DmnError::Storage(format!("Failed to remove {}: {}", path.display(), e)))?;
        }
        Ok(())
    }

    fn heights(&self) -> Result<Vec<BlockHeight>> {
        let entries = std::fs::read_dir(&self.undo_dir)
            .map_err(|e| DmnError::Storage(format!("Failed to read undo directory: {}", e)))?;

        let mut heights = Vec::new();
        for entry in entries {
            let entry = entry
                .map_err(|e| DmnError::Storage(format!("Failed to read directory entry: {}", e)))?;

            let path = entry.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == UNDO_EXTENSION) {
                if let Some(height) = path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .and_then(|stem| stem.parse::<BlockHeight>().ok())
                {
                    heights.push(height);
                }
            }
        }

        heights.sort_unstable();
        Ok(heights)
    }

    fn save_tip(&mut self, tip: &StoredTip) -> Result<()> {
        write_atomic(&self.tip_path, &seal(tip)?)
    }

    fn load_tip(&self) -> Result<Option<StoredTip>> {
        if !self.tip_path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&self.tip_path)
            .map_err(|e| DmnError::Storage(format!("Failed to read tip state: {}", e)))?;
        unseal(&bytes, &self.tip_path).map(Some)
    }
}
