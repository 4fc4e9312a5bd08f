//! Local file store laid out like `mlruns/`, readable by the MLflow UI.
//!
//! ```text
//! <root>/<experiment_id>/meta.yaml
//! <root>/<experiment_id>/<run_id>/meta.yaml
//! <root>/<experiment_id>/<run_id>/params/<key>
//! <root>/<experiment_id>/<run_id>/metrics/<key>     "<ms> <value> <step>" lines
//! <root>/<experiment_id>/<run_id>/artifacts/
//! ```

use super::{
    RunRecord, RunStatus, Tracker, TrackingSettings, collect_artifact_files, join_artifact_path,
    now_millis, truncate_params,
};
use crate::config::Hyperparameters;
use crate::error::{Result, SegTrainError};
use crate::persistence::atomic_write;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ExperimentMeta {
    artifact_location: String,
    experiment_id: String,
    lifecycle_stage: String,
    name: String,
    #[serde(default)]
    creation_time: i64,
    #[serde(default)]
    last_update_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RunMeta {
    artifact_uri: String,
    end_time: Option<i64>,
    entry_point_name: String,
    experiment_id: String,
    lifecycle_stage: String,
    run_id: String,
    run_name: String,
    run_uuid: String,
    source_name: String,
    source_type: u8,
    source_version: String,
    start_time: i64,
    status: u8,
    user_id: String,
}

pub struct FileTracker {
    run_dir: PathBuf,
    meta: Mutex<RunMeta>,
    record: Mutex<RunRecord>,
}

impl FileTracker {
    /// Open (or create) the experiment under `root` and create or attach the run.
    pub fn open(root: &Path, settings: &TrackingSettings) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let root = std::fs::canonicalize(root)?;
        let experiment_id = get_or_create_experiment(&root, &settings.experiment_name)?;
        let exp_dir = root.join(&experiment_id);

        let meta = match &settings.run_id {
            Some(run_id) => {
                let path = exp_dir.join(run_id).join("meta.yaml");
                let meta: RunMeta = read_yaml(&path)?.ok_or_else(|| {
                    SegTrainError::tracking(format!(
                        "run '{run_id}' not found in experiment {experiment_id}"
                    ))
                })?;
                tracing::info!(run_id = %run_id, "attached to tracked run");
                meta
            }
            None => {
                let run_id = uuid::Uuid::new_v4().simple().to_string();
                let run_dir = exp_dir.join(&run_id);
                let meta = RunMeta {
                    artifact_uri: format!("file://{}", run_dir.join("artifacts").display()),
                    end_time: None,
                    entry_point_name: String::new(),
                    experiment_id: experiment_id.clone(),
                    lifecycle_stage: "active".to_string(),
                    run_id: run_id.clone(),
                    run_name: settings
                        .run_name
                        .clone()
                        .unwrap_or_else(|| format!("segtrain-{}", &run_id[..8])),
                    run_uuid: run_id.clone(),
                    source_name: String::new(),
                    source_type: 4,
                    source_version: env!("CARGO_PKG_VERSION").to_string(),
                    start_time: now_millis(),
                    status: RunStatus::Running.code(),
                    user_id: std::env::var("USER").unwrap_or_default(),
                };
                for sub in ["params", "metrics", "artifacts", "tags"] {
                    std::fs::create_dir_all(run_dir.join(sub))?;
                }
                write_yaml(&run_dir.join("meta.yaml"), &meta)?;
                tracing::info!(run_id = %run_id, experiment_id = %experiment_id, "created tracked run");
                meta
            }
        };

        let run_dir = exp_dir.join(&meta.run_id);
        let record = load_record(&run_dir, &meta)?;
        Ok(Self {
            run_dir,
            meta: Mutex::new(meta),
            record: Mutex::new(record),
        })
    }

    pub async fn run_id(&self) -> String {
        self.meta.lock().await.run_id.clone()
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.run_dir.join("artifacts")
    }
}

#[async_trait]
impl Tracker for FileTracker {
    async fn log_params(&self, params: &Hyperparameters) -> Result<()> {
        let params = truncate_params(params);
        let mut record = self.record.lock().await;
        for (key, value) in &params {
            let path = self.run_dir.join("params").join(checked_key(key)?);
            if !path.exists() {
                atomic_write(&path, value.as_bytes())?;
            }
        }
        record.add_params(&params);
        Ok(())
    }

    async fn log_metrics(&self, metrics: &BTreeMap<String, f64>, step: u64) -> Result<()> {
        let timestamp = now_millis();
        let mut record = self.record.lock().await;
        for (key, value) in metrics {
            let path = self.run_dir.join("metrics").join(checked_key(key)?);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            writeln!(file, "{timestamp} {value} {step}")?;
        }
        record.add_metrics(metrics, step, timestamp);
        Ok(())
    }

    async fn log_artifacts(&self, local_dir: &Path, artifact_path: Option<&str>) -> Result<()> {
        let files = collect_artifact_files(local_dir)?;
        let dest_root = self.artifact_dir();
        let mut logged = Vec::with_capacity(files.len());
        for (src, rel) in files {
            let rel = join_artifact_path(artifact_path, &rel);
            let dest = dest_root.join(checked_key(&rel)?);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(&src, &dest).await?;
            logged.push(rel);
        }
        tracing::debug!(count = logged.len(), dir = %local_dir.display(), "logged artifacts");
        self.record.lock().await.add_artifacts(logged);
        Ok(())
    }

    async fn finish(&self, status: RunStatus) -> Result<()> {
        let mut meta = self.meta.lock().await;
        meta.status = status.code();
        if status.is_terminal() {
            meta.end_time = Some(now_millis());
        }
        write_yaml(&self.run_dir.join("meta.yaml"), &*meta)?;
        self.record.lock().await.status = status;
        Ok(())
    }

    async fn record(&self) -> RunRecord {
        self.record.lock().await.clone()
    }
}

fn get_or_create_experiment(root: &Path, name: &str) -> Result<String> {
    let mut max_id: Option<u64> = None;
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(meta) = read_yaml::<ExperimentMeta>(&entry.path().join("meta.yaml"))? else {
            continue;
        };
        if meta.name == name && meta.lifecycle_stage == "active" {
            return Ok(meta.experiment_id);
        }
        if let Ok(id) = meta.experiment_id.parse::<u64>() {
            max_id = Some(max_id.map_or(id, |m| m.max(id)));
        }
    }

    let experiment_id = match max_id {
        Some(id) => (id + 1).to_string(),
        None if name == super::DEFAULT_EXPERIMENT => "0".to_string(),
        None => "1".to_string(),
    };
    let dir = root.join(&experiment_id);
    std::fs::create_dir_all(&dir)?;
    let now = now_millis();
    write_yaml(
        &dir.join("meta.yaml"),
        &ExperimentMeta {
            artifact_location: format!("file://{}", dir.display()),
            experiment_id: experiment_id.clone(),
            lifecycle_stage: "active".to_string(),
            name: name.to_string(),
            creation_time: now,
            last_update_time: now,
        },
    )?;
    tracing::info!(experiment = name, experiment_id = %experiment_id, "created experiment");
    Ok(experiment_id)
}

/// Rebuild the in-memory record of an existing run from disk.
fn load_record(run_dir: &Path, meta: &RunMeta) -> Result<RunRecord> {
    let mut record = RunRecord::new(&meta.run_id, &meta.experiment_id);
    record.status = match meta.status {
        2 => RunStatus::Scheduled,
        3 => RunStatus::Finished,
        4 => RunStatus::Failed,
        5 => RunStatus::Killed,
        _ => RunStatus::Running,
    };

    for (sub, is_metric) in [("params", false), ("metrics", true)] {
        let base = run_dir.join(sub);
        if !base.is_dir() {
            continue;
        }
        for (path, key) in collect_artifact_files(&base)? {
            let text = std::fs::read_to_string(&path)?;
            if !is_metric {
                record.params.insert(key, text);
                continue;
            }
            for line in text.lines() {
                let mut parts = line.split_whitespace();
                let (Some(ts), Some(value), Some(step)) = (parts.next(), parts.next(), parts.next())
                else {
                    continue;
                };
                if let (Ok(ts), Ok(value), Ok(step)) =
                    (ts.parse::<i64>(), value.parse::<f64>(), step.parse::<u64>())
                {
                    let point = BTreeMap::from([(key.clone(), value)]);
                    record.add_metrics(&point, step, ts);
                }
            }
        }
    }

    let artifacts = run_dir.join("artifacts");
    if artifacts.is_dir() {
        record.add_artifacts(
            collect_artifact_files(&artifacts)?
                .into_iter()
                .map(|(_, rel)| rel),
        );
    }
    Ok(record)
}

/// Keys become file paths; refuse anything that escapes the run directory.
fn checked_key(key: &str) -> Result<PathBuf> {
    let path = PathBuf::from(key);
    let escapes = key.is_empty()
        || path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
    if escapes {
        return Err(SegTrainError::tracking(format!("invalid key '{key}'")));
    }
    Ok(path)
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path)?;
    let value = serde_yaml::from_str(&text).map_err(|e| {
        SegTrainError::tracking(format!("malformed {}: {e}", path.display()))
    })?;
    Ok(Some(value))
}

fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let text = serde_yaml::to_string(value)
        .map_err(|e| SegTrainError::tracking(format!("failed to serialize meta.yaml: {e}")))?;
    atomic_write(path, text.as_bytes())?;
    Ok(())
}
