//! Dataset registry: named datasets with their records and metadata.
//!
//! The registry is an explicit value owned by the driver and passed to
//! whatever needs it, never a process-wide catalog.

use crate::data::coco::{DatasetRecord, load_coco_json};
use crate::error::{Result, SegTrainError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Metadata recorded alongside each registered dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub name: String,
    pub thing_classes: Vec<String>,
    pub json_file: PathBuf,
    pub image_root: PathBuf,
    pub evaluator_type: String,
    /// COCO category id for each contiguous class id.
    pub category_ids: Vec<u64>,
}

#[derive(Debug, Clone)]
struct Entry {
    metadata: DatasetMetadata,
    records: Arc<Vec<DatasetRecord>>,
}

#[derive(Debug, Clone, Default)]
pub struct DatasetRegistry {
    entries: BTreeMap<String, Entry>,
}

impl DatasetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and register a COCO instances file under `name`.
    ///
    /// Registering the same name for the same file again is a no-op; the same
    /// name for a different file is an error.
    pub fn register_coco_instances(
        &mut self,
        name: &str,
        json_file: &Path,
        image_root: &Path,
        thing_classes: &[String],
    ) -> Result<&DatasetMetadata> {
        if let Some(existing) = self.entries.get(name) {
            if !same_file(&existing.metadata.json_file, json_file)
                || existing.metadata.thing_classes != thing_classes
            {
                return Err(SegTrainError::AlreadyExists(format!(
                    "dataset '{name}' is already registered for {}",
                    existing.metadata.json_file.display()
                )));
            }
        } else {
            self.insert_coco(name, json_file, image_root, thing_classes)?;
        }
        Ok(&self.entries[name].metadata)
    }

    fn insert_coco(
        &mut self,
        name: &str,
        json_file: &Path,
        image_root: &Path,
        thing_classes: &[String],
    ) -> Result<()> {
        let loaded = load_coco_json(json_file, image_root, thing_classes)?;
        let annotations: usize = loaded.records.iter().map(|r| r.annotations.len()).sum();
        tracing::info!(
            dataset = name,
            images = loaded.records.len(),
            annotations,
            "registered COCO dataset"
        );

        let metadata = DatasetMetadata {
            name: name.to_string(),
            thing_classes: thing_classes.to_vec(),
            json_file: json_file.to_path_buf(),
            image_root: image_root.to_path_buf(),
            evaluator_type: "coco".to_string(),
            category_ids: loaded.category_ids,
        };
        self.entries.insert(
            name.to_string(),
            Entry {
                metadata,
                records: Arc::new(loaded.records),
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<Vec<DatasetRecord>>> {
        self.entries
            .get(name)
            .map(|e| Arc::clone(&e.records))
            .ok_or_else(|| SegTrainError::not_found(format!("dataset '{name}' is not registered")))
    }

    pub fn metadata(&self, name: &str) -> Result<&DatasetMetadata> {
        self.entries
            .get(name)
            .map(|e| &e.metadata)
            .ok_or_else(|| SegTrainError::not_found(format!("dataset '{name}' is not registered")))
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// Whether `name` is registered for a file other than `json_file`.
    fn is_taken_by_other(&self, name: &str, json_file: &Path) -> bool {
        self.entries
            .get(name)
            .is_some_and(|e| !same_file(&e.metadata.json_file, json_file))
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Register one split from its label file and return `(name, class_count)`.
///
/// The name is derived from the label file's directory and stem, so
/// `data/train/_annotations.coco.json` becomes `train_annotations_coco`.
/// When that name already belongs to another file, a short hash of the
/// canonical path is appended. Images resolve against `image_root`, or the
/// label file's directory.
pub fn register_dataset(
    registry: &mut DatasetRegistry,
    label_path: &Path,
    thing_classes: &[String],
    image_root: Option<&Path>,
) -> Result<(String, usize)> {
    let json_file = label_path.canonicalize().map_err(|e| {
        SegTrainError::dataset(format!(
            "cannot open label file {}: {e}",
            label_path.display()
        ))
    })?;
    let mut name = dataset_name_for(&json_file);
    if registry.is_taken_by_other(&name, &json_file) {
        name = format!("{name}_{}", path_digest(&json_file));
    }
    let root = match image_root {
        Some(root) => root.to_path_buf(),
        None => json_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    };
    registry.register_coco_instances(&name, &json_file, &root, thing_classes)?;
    Ok((name, thing_classes.len()))
}

fn path_digest(path: &Path) -> String {
    let hash = format!("{:x}", Sha256::digest(path.to_string_lossy().as_bytes()));
    hash[..8].to_string()
}

pub fn dataset_name_for(label_path: &Path) -> String {
    let stem = label_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("dataset");
    let parent = label_path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|s| s.to_str())
        .unwrap_or("");
    let raw = if parent.is_empty() {
        stem.to_string()
    } else {
        format!("{parent}_{stem}")
    };
    let mut name = String::with_capacity(raw.len());
    for ch in raw.chars() {
        let ch = if ch.is_ascii_alphanumeric() { ch } else { '_' };
        if ch == '_' && name.ends_with('_') {
            continue;
        }
        name.push(ch);
    }
    let trimmed = name.trim_matches('_');
    if trimmed.is_empty() {
        "dataset".to_string()
    } else {
        trimmed.to_string()
    }
}
