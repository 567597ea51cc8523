//! Whole-state JSON snapshot persistence: write to a temp file, then
//! `rename` over the real path. Adapted from the queue-serialization
//! pattern used for the scheduler's task queue elsewhere in this codebase.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;

use super::{KeyRecord, StoreError};

#[derive(Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: String,
    pub keys: Vec<KeyRecord>,
}

pub async fn load(path: &Path) -> Result<Snapshot, StoreError> {
    let contents = fs::read_to_string(path).await?;
    let snapshot: Snapshot = serde_json::from_str(&contents)?;
    Ok(snapshot)
}

pub async fn save(path: &Path, snapshot: &Snapshot) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(snapshot)?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, json).await?;
    fs::rename(&tmp_path, path).await?;
    Ok(())
}
