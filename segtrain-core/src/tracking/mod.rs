//! Experiment tracking: parameters, metrics and artifacts of one run.
//!
//! The tracker is an explicit value handed to the driver. Only the main
//! process talks to a real backend; the other ranks get a [`NullTracker`].

pub mod file;
pub mod mlflow;

use crate::config::Hyperparameters;
use crate::error::{Result, SegTrainError};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

pub use file::FileTracker;
pub use mlflow::MlflowTracker;

pub const ENV_TRACKING_URI: &str = "MLFLOW_TRACKING_URI";
pub const ENV_EXPERIMENT_NAME: &str = "MLFLOW_EXPERIMENT_NAME";
pub const ENV_RUN_ID: &str = "MLFLOW_RUN_ID";

pub const DEFAULT_EXPERIMENT: &str = "Default";

/// Longest parameter value the tracking server accepts.
pub const MAX_PARAM_VALUE_LEN: usize = 6000;

/// Lifecycle of a tracked run, named as the tracking server names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Scheduled,
    Finished,
    Failed,
    Killed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Scheduled => "SCHEDULED",
            RunStatus::Finished => "FINISHED",
            RunStatus::Failed => "FAILED",
            RunStatus::Killed => "KILLED",
        }
    }

    /// Numeric code used in file-store `meta.yaml`.
    pub fn code(&self) -> u8 {
        match self {
            RunStatus::Running => 1,
            RunStatus::Scheduled => 2,
            RunStatus::Finished => 3,
            RunStatus::Failed => 4,
            RunStatus::Killed => 5,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Finished | RunStatus::Failed | RunStatus::Killed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub value: f64,
    pub step: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// Local mirror of everything logged to a run. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub experiment_id: String,
    pub params: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, Vec<MetricPoint>>,
    /// Artifact paths relative to the run's artifact root.
    pub artifacts: Vec<String>,
    pub status: RunStatus,
}

impl RunRecord {
    pub fn new(run_id: impl Into<String>, experiment_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            experiment_id: experiment_id.into(),
            params: BTreeMap::new(),
            metrics: BTreeMap::new(),
            artifacts: Vec::new(),
            status: RunStatus::Running,
        }
    }

    /// Add parameters. A key already logged with a different value keeps its
    /// first value.
    pub fn add_params(&mut self, params: &BTreeMap<String, String>) {
        for (key, value) in params {
            match self.params.get(key) {
                Some(existing) if existing != value => {
                    tracing::warn!(key = %key, "parameter already logged with a different value");
                }
                Some(_) => {}
                None => {
                    self.params.insert(key.clone(), value.clone());
                }
            }
        }
    }

    pub fn add_metrics(&mut self, metrics: &BTreeMap<String, f64>, step: u64, timestamp: i64) {
        for (key, value) in metrics {
            self.metrics.entry(key.clone()).or_default().push(MetricPoint {
                value: *value,
                step,
                timestamp,
            });
        }
    }

    pub fn add_artifacts(&mut self, paths: impl IntoIterator<Item = String>) {
        for path in paths {
            if !self.artifacts.contains(&path) {
                self.artifacts.push(path);
            }
        }
    }

    pub fn latest_metric(&self, key: &str) -> Option<f64> {
        self.metrics.get(key).and_then(|h| h.last()).map(|p| p.value)
    }

    pub fn metric_keys(&self) -> Vec<&str> {
        self.metrics.keys().map(String::as_str).collect()
    }
}

/// A tracked run the driver logs into.
#[async_trait]
pub trait Tracker: Send + Sync {
    async fn log_params(&self, params: &Hyperparameters) -> Result<()>;

    async fn log_metrics(&self, metrics: &BTreeMap<String, f64>, step: u64) -> Result<()>;

    /// Upload every file under `local_dir`, placed under `artifact_path`
    /// inside the run's artifact root.
    async fn log_artifacts(&self, local_dir: &Path, artifact_path: Option<&str>) -> Result<()>;

    async fn finish(&self, status: RunStatus) -> Result<()>;

    async fn record(&self) -> RunRecord;
}

/// Tracker settings read from the environment at process start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackingSettings {
    pub tracking_uri: Option<String>,
    pub experiment_name: String,
    /// Attach to this run instead of creating one.
    pub run_id: Option<String>,
    pub run_name: Option<String>,
}

impl TrackingSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            tracking_uri: non_empty(ENV_TRACKING_URI),
            experiment_name: non_empty(ENV_EXPERIMENT_NAME)
                .unwrap_or_else(|| DEFAULT_EXPERIMENT.to_string()),
            run_id: non_empty(ENV_RUN_ID),
            run_name: None,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_run_name(mut self, run_name: impl Into<String>) -> Self {
        self.run_name = Some(run_name.into());
        self
    }

    /// Where the tracking URI points.
    pub fn backend(&self) -> Result<TrackingBackend> {
        match self.tracking_uri.as_deref() {
            None => Ok(TrackingBackend::File(PathBuf::from("mlruns"))),
            Some(uri) if uri.starts_with("http://") || uri.starts_with("https://") => {
                Ok(TrackingBackend::Rest(uri.trim_end_matches('/').to_string()))
            }
            Some(uri) => match local_path_from_uri(uri) {
                Some(path) => Ok(TrackingBackend::File(path)),
                None => Err(SegTrainError::tracking(format!(
                    "unsupported tracking URI '{uri}'"
                ))),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackingBackend {
    Rest(String),
    File(PathBuf),
}

/// Open the tracked run described by `settings`.
pub async fn open_tracker(settings: &TrackingSettings) -> Result<Arc<dyn Tracker>> {
    match settings.backend()? {
        TrackingBackend::Rest(base) => {
            let tracker = MlflowTracker::connect(&base, settings).await?;
            Ok(Arc::new(tracker))
        }
        TrackingBackend::File(root) => {
            let tracker = FileTracker::open(&root, settings)?;
            Ok(Arc::new(tracker))
        }
    }
}

/// Scheme-less tracking URIs that name a remote backend, not a directory.
const REMOTE_URI_NAMES: &[&str] = &["databricks", "databricks-uc", "uc"];

/// `file:///x`, `file:x` or a plain path. `None` for any other scheme and
/// for the remote backend names MLflow reserves.
pub fn local_path_from_uri(uri: &str) -> Option<PathBuf> {
    if let Some(rest) = uri.strip_prefix("file://") {
        return Some(PathBuf::from(rest));
    }
    if let Some(rest) = uri.strip_prefix("file:") {
        return Some(PathBuf::from(rest));
    }
    match uri.split_once("://") {
        Some(_) => None,
        None if uri.contains(':') && !looks_like_windows_drive(uri) => None,
        None if REMOTE_URI_NAMES.contains(&uri.trim()) => None,
        None => Some(PathBuf::from(uri)),
    }
}

fn looks_like_windows_drive(uri: &str) -> bool {
    let bytes = uri.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Truncate parameter values the server would reject.
pub fn truncate_params(params: &Hyperparameters) -> Hyperparameters {
    params
        .iter()
        .map(|(k, v)| {
            if v.chars().count() > MAX_PARAM_VALUE_LEN {
                tracing::warn!(key = %k, "truncating parameter value");
                (k.clone(), v.chars().take(MAX_PARAM_VALUE_LEN).collect())
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect()
}

/// Files under `dir` paired with their `/`-separated path relative to it.
pub(crate) fn collect_artifact_files(dir: &Path) -> Result<Vec<(PathBuf, String)>> {
    if !dir.is_dir() {
        return Err(SegTrainError::tracking(format!(
            "artifact directory {} does not exist",
            dir.display()
        )));
    }
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| SegTrainError::tracking(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| SegTrainError::tracking(e.to_string()))?;
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        files.push((entry.path().to_path_buf(), rel));
    }
    Ok(files)
}

pub(crate) fn join_artifact_path(prefix: Option<&str>, rel: &str) -> String {
    match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{prefix}/{rel}"),
        None => rel.to_string(),
    }
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Keeps the run record in memory and sends nothing anywhere.
#[derive(Debug)]
pub struct NullTracker {
    record: Mutex<RunRecord>,
}

impl NullTracker {
    pub fn new() -> Self {
        Self {
            record: Mutex::new(RunRecord::new("", "")),
        }
    }
}

impl Default for NullTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tracker for NullTracker {
    async fn log_params(&self, params: &Hyperparameters) -> Result<()> {
        self.record.lock().await.add_params(&truncate_params(params));
        Ok(())
    }

    async fn log_metrics(&self, metrics: &BTreeMap<String, f64>, step: u64) -> Result<()> {
        self.record
            .lock()
            .await
            .add_metrics(metrics, step, now_millis());
        Ok(())
    }

    async fn log_artifacts(&self, local_dir: &Path, artifact_path: Option<&str>) -> Result<()> {
        let files = collect_artifact_files(local_dir)?;
        self.record.lock().await.add_artifacts(
            files
                .iter()
                .map(|(_, rel)| join_artifact_path(artifact_path, rel)),
        );
        Ok(())
    }

    async fn finish(&self, status: RunStatus) -> Result<()> {
        self.record.lock().await.status = status;
        Ok(())
    }

    async fn record(&self) -> RunRecord {
        self.record.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_lookup() {
        let settings = TrackingSettings::from_lookup(|key| match key {
            ENV_TRACKING_URI => Some("http://localhost:5000/".into()),
            ENV_RUN_ID => Some("abc".into()),
            ENV_EXPERIMENT_NAME => Some("   ".into()),
            _ => None,
        });
        assert_eq!(settings.experiment_name, DEFAULT_EXPERIMENT);
        assert_eq!(settings.run_id.as_deref(), Some("abc"));
        assert_eq!(
            settings.backend().unwrap(),
            TrackingBackend::Rest("http://localhost:5000".into())
        );
    }

    #[test]
    fn test_backend_selection() {
        let mut settings = TrackingSettings::default();
        assert_eq!(
            settings.backend().unwrap(),
            TrackingBackend::File(PathBuf::from("mlruns"))
        );
        settings.tracking_uri = Some("file:///tmp/runs".into());
        assert_eq!(
            settings.backend().unwrap(),
            TrackingBackend::File(PathBuf::from("/tmp/runs"))
        );
        settings.tracking_uri = Some("runs/local".into());
        assert_eq!(
            settings.backend().unwrap(),
            TrackingBackend::File(PathBuf::from("runs/local"))
        );
        settings.tracking_uri = Some("s3://bucket/x".into());
        assert!(settings.backend().is_err());
    }

    #[test]
    fn test_remote_backend_names_are_unsupported() {
        for uri in ["databricks", "databricks-uc", "uc", "databricks://profile"] {
            let settings = TrackingSettings {
                tracking_uri: Some(uri.into()),
                ..TrackingSettings::default()
            };
            assert!(
                matches!(settings.backend(), Err(SegTrainError::Tracking(_))),
                "{uri} should be rejected"
            );
            assert_eq!(local_path_from_uri(uri), None);
        }
    }

    #[test]
    fn test_truncate_params() {
        let mut params = Hyperparameters::new();
        params.insert("long".into(), "x".repeat(MAX_PARAM_VALUE_LEN + 10));
        params.insert("short".into(), "1".into());
        let out = truncate_params(&params);
        assert_eq!(out["long"].len(), MAX_PARAM_VALUE_LEN);
        assert_eq!(out["short"], "1");
    }

    #[test]
    fn test_record_keeps_first_param_value() {
        let mut record = RunRecord::new("r", "0");
        let mut params = BTreeMap::new();
        params.insert("a".to_string(), "1".to_string());
        record.add_params(&params);
        params.insert("a".to_string(), "2".to_string());
        record.add_params(&params);
        assert_eq!(record.params["a"], "1");
    }

    #[tokio::test]
    async fn test_null_tracker_records_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.png"), b"a").unwrap();
        std::fs::write(dir.path().join("sub/b.png"), b"b").unwrap();

        let tracker = NullTracker::new();
        tracker
            .log_artifacts(dir.path(), Some("sample_compare_result"))
            .await
            .unwrap();
        let mut metrics = BTreeMap::new();
        metrics.insert("APbbox".to_string(), 50.0);
        tracker.log_metrics(&metrics, 0).await.unwrap();
        tracker.finish(RunStatus::Finished).await.unwrap();

        let record = tracker.record().await;
        assert_eq!(
            record.artifacts,
            vec![
                "sample_compare_result/a.png".to_string(),
                "sample_compare_result/sub/b.png".to_string()
            ]
        );
        assert_eq!(record.latest_metric("APbbox"), Some(50.0));
        assert_eq!(record.status, RunStatus::Finished);
    }

    #[tokio::test]
    async fn test_missing_artifact_dir_fails() {
        let tracker = NullTracker::new();
        let err = tracker
            .log_artifacts(Path::new("/no/such/dir"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SegTrainError::Tracking(_)));
    }
}
