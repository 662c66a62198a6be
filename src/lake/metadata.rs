use std::{collections::BTreeMap, fs, path::Path};

use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::LakeError;

pub const METADATA_FILE: &str = "_metadata";
pub const COMMON_METADATA_FILE: &str = "_common_metadata";

/// Dataset-level sidecar: union schema plus per-file row counts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DatasetMetadata {
    /// Relative part path → entry.
    pub files: BTreeMap<String, FileEntry>,

    /// Union schema across all parts, column → dtype string.
    pub schema: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileEntry {
    pub rows: usize,
}

impl DatasetMetadata {
    pub fn total_rows(&self) -> usize {
        self.files.values().map(|f| f.rows).sum()
    }
}

pub fn load(dataset_dir: &Path) -> Result<DatasetMetadata, LakeError> {
    let path = dataset_dir.join(METADATA_FILE);
    if !path.exists() {
        return Ok(DatasetMetadata::default());
    }
    let raw = fs::read_to_string(&path)?;
    serde_json::from_str(&raw).map_err(|e| {
        LakeError::BadPartition(format!("corrupt {METADATA_FILE}: {e}"))
    })
}

/// Registers one freshly-written part and refreshes both sidecars.
pub fn record_file(
    dataset_dir: &Path,
    partition: &str,
    seq: u32,
    part: &DataFrame,
) -> Result<(), LakeError> {
    let mut metadata = load(dataset_dir)?;
    metadata.files.insert(
        format!("{partition}/part-{seq}.parquet"),
        FileEntry { rows: part.height() },
    );
    for (name, dtype) in part.schema().iter() {
        metadata
            .schema
            .entry(name.to_string())
            .or_insert_with(|| dtype.to_string());
    }
    store(dataset_dir, &metadata)
}

/// Drops entries for parts unlinked by coalesce or retention.
pub fn forget_files(dataset_dir: &Path, relative_paths: &[String]) -> Result<(), LakeError> {
    let mut metadata = load(dataset_dir)?;
    for path in relative_paths {
        metadata.files.remove(path);
    }
    store(dataset_dir, &metadata)
}

fn store(dataset_dir: &Path, metadata: &DatasetMetadata) -> Result<(), LakeError> {
    fs::create_dir_all(dataset_dir)?;
    write_atomic(
        &dataset_dir.join(METADATA_FILE),
        &serde_json::to_string_pretty(metadata)
            .map_err(|e| LakeError::BadPartition(e.to_string()))?,
    )?;

    // The common sidecar carries only the union schema.
    let common = DatasetMetadata {
        files: BTreeMap::new(),
        schema: metadata.schema.clone(),
    };
    write_atomic(
        &dataset_dir.join(COMMON_METADATA_FILE),
        &serde_json::to_string_pretty(&common)
            .map_err(|e| LakeError::BadPartition(e.to_string()))?,
    )?;
    Ok(())
}

fn write_atomic(path: &Path, contents: &str) -> Result<(), LakeError> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
