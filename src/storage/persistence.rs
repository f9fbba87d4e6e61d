//! Snapshot persistence for the in-memory document store

use crate::core::{DbError, Result};
use crate::storage::collection::Collection;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

// ============================================================================
// Store Snapshot
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    pub collections: HashMap<String, Collection>,
    pub metadata: SnapshotMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub created_at: i64,
    pub document_count: usize,
    pub collection_count: usize,
}

impl StoreSnapshot {
    pub fn new(collections: HashMap<String, Collection>) -> Self {
        let document_count = collections.values().map(Collection::len).sum();
        let collection_count = collections.len();

        Self {
            version: 1,
            collections,
            metadata: SnapshotMetadata {
                created_at: chrono::Utc::now().timestamp_millis(),
                document_count,
                collection_count,
            },
        }
    }
}

// ============================================================================
// Durability Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurabilityMode {
    /// Checkpoint after every successful mutation.
    Sync,
    #[default]
    None,
}

// ============================================================================
// Snapshot Manager
// ============================================================================

pub struct SnapshotManager {
    snapshot_path: PathBuf,
}

impl SnapshotManager {
    pub fn new<P: AsRef<Path>>(snapshot_path: P) -> Self {
        Self {
            snapshot_path: snapshot_path.as_ref().to_path_buf(),
        }
    }

    pub fn in_dir<P: AsRef<Path>>(data_dir: P) -> Self {
        Self::new(data_dir.as_ref().join("changebee.snapshot"))
    }

    pub fn path(&self) -> &Path {
        &self.snapshot_path
    }

    /// Writes to a sibling temp file and renames it over the old snapshot.
    pub fn save(&self, snapshot: &StoreSnapshot) -> Result<()> {
        if let Some(parent) = self.snapshot_path.parent() {
            fs::create_dir_all(parent).map_err(|e| DbError::IoError(format!("Failed to create snapshot directory: {}", e)))?;
        }
        let temp_path = self.snapshot_path.with_extension("tmp");
        let temp_file = File::create(&temp_path).map_err(|e| DbError::IoError(format!("Failed to create temp file: {}", e)))?;
        let mut writer = BufWriter::new(temp_file);
        let serialized = rmp_serde::to_vec(snapshot).map_err(|e| DbError::ExecutionError(format!("Failed to serialize snapshot: {}", e)))?;
        writer.write_all(&serialized).map_err(|e| DbError::IoError(format!("Failed to write snapshot: {}", e)))?;
        writer.flush().map_err(|e| DbError::IoError(format!("Failed to flush snapshot: {}", e)))?;
        writer.get_mut().sync_all().map_err(|e| DbError::IoError(format!("Failed to sync snapshot: {}", e)))?;
        fs::rename(&temp_path, &self.snapshot_path).map_err(|e| DbError::IoError(format!("Failed to rename snapshot: {}", e)))?;
        Ok(())
    }

    pub fn load(&self) -> Result<Option<StoreSnapshot>> {
        if !self.snapshot_path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&self.snapshot_path).map_err(|e| DbError::IoError(format!("Failed to open snapshot: {}", e)))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data).map_err(|e| DbError::IoError(format!("Failed to read snapshot: {}", e)))?;
        let mut snapshot: StoreSnapshot = rmp_serde::from_slice(&data).map_err(|e| DbError::ExecutionError(format!("Failed to deserialize snapshot: {}", e)))?;
        for collection in snapshot.collections.values_mut() {
            collection.rebuild_indexes();
        }
        Ok(Some(snapshot))
    }

    pub fn exists(&self) -> bool {
        self.snapshot_path.exists()
    }
}
