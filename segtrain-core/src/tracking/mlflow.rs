//! MLflow tracking server client over its REST API.

use super::{
    RunRecord, RunStatus, Tracker, TrackingSettings, collect_artifact_files, join_artifact_path,
    local_path_from_uri, now_millis, truncate_params,
};
use crate::config::Hyperparameters;
use crate::error::{Result, SegTrainError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const API_PREFIX: &str = "api/2.0/mlflow";

/// Per-request limits of `runs/log-batch`.
const MAX_PARAMS_PER_BATCH: usize = 100;
const MAX_METRICS_PER_BATCH: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
enum ArtifactStore {
    /// `mlflow-artifacts:/<path>`, served by the tracking server.
    Proxied(String),
    Local(PathBuf),
}

pub struct MlflowTracker {
    client: Client,
    base_url: String,
    run_id: String,
    artifacts: ArtifactStore,
    record: Mutex<RunRecord>,
}

impl MlflowTracker {
    /// Resolve the experiment by name, then create a run or attach to
    /// `settings.run_id`.
    pub async fn connect(base_url: &str, settings: &TrackingSettings) -> Result<Self> {
        let client = Client::new();
        let base_url = base_url.trim_end_matches('/').to_string();

        let info = match &settings.run_id {
            Some(run_id) => {
                let body = get_json(
                    &client,
                    &endpoint(&base_url, "runs/get"),
                    &[("run_id", run_id.as_str())],
                )
                .await?;
                info!(run_id = %run_id, "attached to MLflow run");
                body["run"]["info"].clone()
            }
            None => {
                let experiment_id =
                    get_or_create_experiment(&client, &base_url, &settings.experiment_name).await?;
                let mut request = json!({
                    "experiment_id": experiment_id,
                    "start_time": now_millis(),
                    "tags": [{"key": "mlflow.source.name", "value": "segtrain"}],
                });
                if let Some(name) = &settings.run_name {
                    request["run_name"] = Value::String(name.clone());
                }
                let body = post_json(&client, &endpoint(&base_url, "runs/create"), &request).await?;
                let info = body["run"]["info"].clone();
                info!(
                    run_id = info["run_id"].as_str().unwrap_or_default(),
                    experiment_id = %experiment_id,
                    "created MLflow run"
                );
                info
            }
        };

        let run_id = string_field(&info, "run_id")?;
        let experiment_id = string_field(&info, "experiment_id")?;
        let artifact_uri = string_field(&info, "artifact_uri")?;
        let artifacts = artifact_store(&artifact_uri)?;

        Ok(Self {
            client,
            base_url,
            record: Mutex::new(RunRecord::new(&run_id, experiment_id)),
            run_id,
            artifacts,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    async fn log_batch(&self, params: &[(String, String)], metrics: &[Value]) -> Result<()> {
        let body = json!({
            "run_id": self.run_id,
            "params": params
                .iter()
                .map(|(k, v)| json!({"key": k, "value": v}))
                .collect::<Vec<_>>(),
            "metrics": metrics,
            "tags": [],
        });
        post_json(&self.client, &endpoint(&self.base_url, "runs/log-batch"), &body).await?;
        Ok(())
    }

    async fn upload(&self, src: &Path, dest: &str) -> Result<()> {
        match &self.artifacts {
            ArtifactStore::Proxied(root) => {
                let url = format!(
                    "{}/api/2.0/mlflow-artifacts/artifacts/{}/{}",
                    self.base_url,
                    root.trim_matches('/'),
                    dest
                );
                let data = tokio::fs::read(src).await?;
                let response = self.client.put(&url).body(data).send().await?;
                check_status(response.status(), &url, response.text().await.unwrap_or_default())?;
            }
            ArtifactStore::Local(root) => {
                let target = root.join(dest);
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::copy(src, &target).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Tracker for MlflowTracker {
    async fn log_params(&self, params: &Hyperparameters) -> Result<()> {
        let params = truncate_params(params);
        let pairs: Vec<(String, String)> = params.clone().into_iter().collect();
        for chunk in pairs.chunks(MAX_PARAMS_PER_BATCH) {
            self.log_batch(chunk, &[]).await?;
        }
        debug!(count = pairs.len(), "logged parameters");
        self.record.lock().await.add_params(&params);
        Ok(())
    }

    async fn log_metrics(&self, metrics: &BTreeMap<String, f64>, step: u64) -> Result<()> {
        let timestamp = now_millis();
        let mut finite = BTreeMap::new();
        let mut payload = Vec::with_capacity(metrics.len());
        for (key, value) in metrics {
            if !value.is_finite() {
                warn!(key = %key, value = %value, "skipping non-finite metric");
                continue;
            }
            finite.insert(key.clone(), *value);
            payload.push(json!({
                "key": key,
                "value": value,
                "timestamp": timestamp,
                "step": step,
            }));
        }
        for chunk in payload.chunks(MAX_METRICS_PER_BATCH) {
            self.log_batch(&[], chunk).await?;
        }
        self.record
            .lock()
            .await
            .add_metrics(&finite, step, timestamp);
        Ok(())
    }

    async fn log_artifacts(&self, local_dir: &Path, artifact_path: Option<&str>) -> Result<()> {
        let files = collect_artifact_files(local_dir)?;
        let mut logged = Vec::with_capacity(files.len());
        for (src, rel) in files {
            let dest = join_artifact_path(artifact_path, &rel);
            self.upload(&src, &dest).await?;
            logged.push(dest);
        }
        debug!(count = logged.len(), dir = %local_dir.display(), "uploaded artifacts");
        self.record.lock().await.add_artifacts(logged);
        Ok(())
    }

    async fn finish(&self, status: RunStatus) -> Result<()> {
        let mut body = json!({"run_id": self.run_id, "status": status.as_str()});
        if status.is_terminal() {
            body["end_time"] = json!(now_millis());
        }
        post_json(&self.client, &endpoint(&self.base_url, "runs/update"), &body).await?;
        self.record.lock().await.status = status;
        Ok(())
    }

    async fn record(&self) -> RunRecord {
        self.record.lock().await.clone()
    }
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{base_url}/{API_PREFIX}/{path}")
}

async fn get_or_create_experiment(client: &Client, base_url: &str, name: &str) -> Result<String> {
    let url = endpoint(base_url, "experiments/get-by-name");
    let response = client
        .get(&url)
        .query(&[("experiment_name", name)])
        .send()
        .await?;
    let status = response.status();
    let text = response.text().await?;
    if status.is_success() {
        let body: Value = serde_json::from_str(&text)?;
        return string_field(&body["experiment"], "experiment_id");
    }
    if status != StatusCode::NOT_FOUND && !text.contains("RESOURCE_DOES_NOT_EXIST") {
        return Err(http_error(status, &url, &text));
    }

    let body = post_json(
        client,
        &endpoint(base_url, "experiments/create"),
        &json!({"name": name}),
    )
    .await?;
    info!(experiment = name, "created MLflow experiment");
    string_field(&body, "experiment_id")
}

async fn get_json(client: &Client, url: &str, query: &[(&str, &str)]) -> Result<Value> {
    let response = client.get(url).query(query).send().await?;
    let status = response.status();
    let text = response.text().await?;
    check_status(status, url, text.clone())?;
    Ok(serde_json::from_str(&text)?)
}

async fn post_json(client: &Client, url: &str, body: &Value) -> Result<Value> {
    let response = client.post(url).json(body).send().await?;
    let status = response.status();
    let text = response.text().await?;
    check_status(status, url, text.clone())?;
    if text.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    Ok(serde_json::from_str(&text)?)
}

fn check_status(status: StatusCode, url: &str, body: String) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else {
        Err(http_error(status, url, &body))
    }
}

fn http_error(status: StatusCode, url: &str, body: &str) -> SegTrainError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.chars().take(200).collect());
    SegTrainError::tracking(format!("{url} returned {status}: {message}"))
}

fn string_field(value: &Value, key: &str) -> Result<String> {
    match &value[key] {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(SegTrainError::tracking(format!(
            "tracking server response is missing '{key}'"
        ))),
    }
}

fn artifact_store(artifact_uri: &str) -> Result<ArtifactStore> {
    if let Some(rest) = artifact_uri.strip_prefix("mlflow-artifacts:") {
        // Either `mlflow-artifacts:/path` or `mlflow-artifacts://host/path`.
        let path = match rest.strip_prefix("//") {
            Some(with_host) => with_host
                .split_once('/')
                .map(|(_, p)| p)
                .unwrap_or_default(),
            None => rest,
        };
        return Ok(ArtifactStore::Proxied(path.trim_matches('/').to_string()));
    }
    local_path_from_uri(artifact_uri)
        .map(ArtifactStore::Local)
        .ok_or_else(|| {
            SegTrainError::tracking(format!(
                "artifact store '{artifact_uri}' is not reachable from this client"
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_store_parsing() {
        assert_eq!(
            artifact_store("mlflow-artifacts:/1/abc/artifacts").unwrap(),
            ArtifactStore::Proxied("1/abc/artifacts".into())
        );
        assert_eq!(
            artifact_store("mlflow-artifacts://server:5000/1/abc/artifacts").unwrap(),
            ArtifactStore::Proxied("1/abc/artifacts".into())
        );
        assert_eq!(
            artifact_store("file:///srv/mlruns/1/abc/artifacts").unwrap(),
            ArtifactStore::Local(PathBuf::from("/srv/mlruns/1/abc/artifacts"))
        );
        assert!(artifact_store("s3://bucket/1/abc").is_err());
    }

    #[test]
    fn test_string_field_accepts_numbers() {
        let v = json!({"experiment_id": 3, "run_id": "x"});
        assert_eq!(string_field(&v, "experiment_id").unwrap(), "3");
        assert_eq!(string_field(&v, "run_id").unwrap(), "x");
        assert!(string_field(&v, "missing").is_err());
    }

    #[test]
    fn test_http_error_uses_server_message() {
        let err = http_error(
            StatusCode::BAD_REQUEST,
            "http://h/api",
            r#"{"error_code": "INVALID_PARAMETER_VALUE", "message": "bad key"}"#,
        );
        assert!(err.to_string().contains("bad key"));
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_server_fails() {
        let port = crate::comm::free_local_port().unwrap();
        let result = MlflowTracker::connect(
            &format!("http://127.0.0.1:{port}"),
            &TrackingSettings::default(),
        )
        .await;
        assert!(matches!(result, Err(SegTrainError::Http(_))));
    }
}
