//! Run configuration.
//!
//! Uses `figment` for layered configuration: defaults -> config file ->
//! environment -> CLI overrides -> registered datasets. The result is an
//! immutable [`RunConfig`] built once per run and shared by every step.

use crate::error::{Result, SegTrainError};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
    value::Value,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Flat hyperparameter mapping logged to the tracker (`solver.base_lr` -> `"0.001"`).
pub type Hyperparameters = BTreeMap<String, String>;

/// Resolved configuration for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Directory holding checkpoints, metrics and the comparison images.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Base seed; each rank derives its own from it.
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub datasets: DatasetsConfig,
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub solver: SolverConfig,
    #[serde(default)]
    pub test: TestConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            seed: default_seed(),
            datasets: DatasetsConfig::default(),
            input: InputConfig::default(),
            model: ModelConfig::default(),
            solver: SolverConfig::default(),
            test: TestConfig::default(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./output")
}

fn default_seed() -> u64 {
    42
}

/// Registered dataset names used for training and evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetsConfig {
    #[serde(default)]
    pub train: Vec<String>,
    #[serde(default)]
    pub test: Vec<String>,
}

/// Input preprocessing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    /// Images are resized to `size x size` before entering the model.
    #[serde(default = "default_input_size")]
    pub size: usize,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            size: default_input_size(),
        }
    }
}

fn default_input_size() -> usize {
    64
}

/// Model construction parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    /// Number of detection slots predicted per image.
    #[serde(default = "default_max_detections")]
    pub max_detections: usize,
    #[serde(default = "default_hidden_dim")]
    pub hidden_dim: usize,
    /// Side of the per-instance mask grid.
    #[serde(default = "default_mask_resolution")]
    pub mask_resolution: usize,
    /// Initial weights, loaded when not resuming.
    #[serde(default)]
    pub weights: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_classes: default_num_classes(),
            max_detections: default_max_detections(),
            hidden_dim: default_hidden_dim(),
            mask_resolution: default_mask_resolution(),
            weights: None,
        }
    }
}

fn default_num_classes() -> usize {
    1
}

fn default_max_detections() -> usize {
    16
}

fn default_hidden_dim() -> usize {
    128
}

fn default_mask_resolution() -> usize {
    14
}

/// Optimisation schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverConfig {
    #[serde(default = "default_base_lr")]
    pub base_lr: f64,
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,
    /// Images per iteration across all workers.
    #[serde(default = "default_ims_per_batch")]
    pub ims_per_batch: usize,
    #[serde(default = "default_warmup_iters")]
    pub warmup_iters: usize,
    #[serde(default = "default_warmup_factor")]
    pub warmup_factor: f64,
    /// Iterations at which the learning rate is multiplied by `gamma`.
    #[serde(default)]
    pub steps: Vec<usize>,
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f32,
    #[serde(default = "default_checkpoint_period")]
    pub checkpoint_period: usize,
    /// Periodic checkpoints retained on disk.
    #[serde(default = "default_max_to_keep")]
    pub max_to_keep: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            base_lr: default_base_lr(),
            max_iter: default_max_iter(),
            ims_per_batch: default_ims_per_batch(),
            warmup_iters: default_warmup_iters(),
            warmup_factor: default_warmup_factor(),
            steps: Vec::new(),
            gamma: default_gamma(),
            weight_decay: default_weight_decay(),
            checkpoint_period: default_checkpoint_period(),
            max_to_keep: default_max_to_keep(),
        }
    }
}

fn default_base_lr() -> f64 {
    1e-3
}

fn default_max_iter() -> usize {
    1000
}

fn default_ims_per_batch() -> usize {
    4
}

fn default_warmup_iters() -> usize {
    100
}

fn default_warmup_factor() -> f64 {
    1e-3
}

fn default_gamma() -> f64 {
    0.1
}

fn default_weight_decay() -> f32 {
    1e-4
}

fn default_checkpoint_period() -> usize {
    500
}

fn default_max_to_keep() -> usize {
    3
}

/// Evaluation and inference settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestConfig {
    /// Evaluate every N iterations during training (0 disables).
    #[serde(default)]
    pub eval_period: usize,
    #[serde(default = "default_detections_per_image")]
    pub detections_per_image: usize,
    #[serde(default = "default_score_thresh")]
    pub score_thresh: f32,
    #[serde(default = "default_nms_thresh")]
    pub nms_thresh: f32,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            eval_period: 0,
            detections_per_image: default_detections_per_image(),
            score_thresh: default_score_thresh(),
            nms_thresh: default_nms_thresh(),
        }
    }
}

fn default_detections_per_image() -> usize {
    100
}

fn default_score_thresh() -> f32 {
    0.05
}

fn default_nms_thresh() -> f32 {
    0.5
}

/// Where configuration comes from, besides the built-in defaults.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Optional TOML file.
    pub config_file: Option<PathBuf>,
    /// Prefix for environment overrides (`SEGTRAIN_SOLVER__BASE_LR`); `None` disables them.
    pub env_prefix: Option<String>,
    /// `KEY=VALUE` (or `KEY VALUE`) pairs with dotted keys.
    pub overrides: Vec<String>,
    /// Output directory from the command line, applied after `overrides`.
    pub output_dir: Option<PathBuf>,
}

impl ConfigSources {
    pub fn with_env() -> Self {
        Self {
            env_prefix: Some("SEGTRAIN_".to_string()),
            ..Self::default()
        }
    }
}

impl RunConfig {
    /// Combine the configured sources with the registered datasets into a
    /// finalized configuration plus its flat hyperparameter mapping.
    pub fn assemble(
        sources: &ConfigSources,
        train_name: &str,
        test_name: &str,
        num_classes: usize,
    ) -> Result<(RunConfig, Hyperparameters)> {
        let mut figment = Figment::from(Serialized::defaults(RunConfig::default()));

        if let Some(path) = &sources.config_file {
            if !path.exists() {
                return Err(SegTrainError::config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }

        if let Some(prefix) = &sources.env_prefix {
            figment = figment.merge(Env::prefixed(prefix).split("__"));
        }

        for (key, value) in parse_overrides(&sources.overrides)? {
            figment = figment.merge(Serialized::default(&key, value));
        }

        if let Some(output_dir) = &sources.output_dir {
            figment = figment.merge(Serialized::default("output_dir", output_dir));
        }

        figment = figment
            .merge(Serialized::default("datasets.train", vec![train_name]))
            .merge(Serialized::default("datasets.test", vec![test_name]))
            .merge(Serialized::default("model.num_classes", num_classes));

        let cfg: RunConfig = figment.extract()?;
        cfg.validate()?;
        let hyperparameters = cfg.hyperparameters();
        Ok((cfg, hyperparameters))
    }

    pub fn validate(&self) -> Result<()> {
        if self.model.num_classes == 0 {
            return Err(SegTrainError::config("model.num_classes must be > 0"));
        }
        if self.model.max_detections == 0 {
            return Err(SegTrainError::config("model.max_detections must be > 0"));
        }
        if self.model.mask_resolution == 0 {
            return Err(SegTrainError::config("model.mask_resolution must be > 0"));
        }
        if self.input.size < 8 || self.input.size % 8 != 0 {
            return Err(SegTrainError::config(format!(
                "input.size must be a positive multiple of 8, got {}",
                self.input.size
            )));
        }
        if self.solver.ims_per_batch == 0 {
            return Err(SegTrainError::config("solver.ims_per_batch must be > 0"));
        }
        if self.solver.max_iter == 0 {
            return Err(SegTrainError::config("solver.max_iter must be > 0"));
        }
        if !(self.solver.base_lr > 0.0) {
            return Err(SegTrainError::config("solver.base_lr must be positive"));
        }
        if !(0.0..=1.0).contains(&self.test.score_thresh) {
            return Err(SegTrainError::config(
                "test.score_thresh must lie in [0, 1]",
            ));
        }
        Ok(())
    }

    /// Flatten the configuration into dotted keys with string values.
    pub fn hyperparameters(&self) -> Hyperparameters {
        let mut out = Hyperparameters::new();
        match serde_json::to_value(self) {
            Ok(value) => flatten_into(&mut out, "", &value),
            Err(e) => tracing::warn!(error = %e, "failed to flatten configuration"),
        }
        out
    }

    /// Write the resolved configuration as TOML.
    pub fn dump(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| SegTrainError::config(format!("failed to serialize config: {e}")))?;
        crate::persistence::atomic_write(path, text.as_bytes())?;
        Ok(())
    }

    /// Per-worker batch size; `ims_per_batch` must split evenly across workers.
    pub fn images_per_worker(&self, world_size: usize) -> Result<usize> {
        let world_size = world_size.max(1);
        if self.solver.ims_per_batch % world_size != 0 {
            return Err(SegTrainError::config(format!(
                "solver.ims_per_batch ({}) must be divisible by the number of workers ({world_size})",
                self.solver.ims_per_batch
            )));
        }
        Ok(self.solver.ims_per_batch / world_size)
    }
}

fn flatten_into(out: &mut Hyperparameters, prefix: &str, value: &serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_into(out, &path, child);
            }
        }
        serde_json::Value::String(s) => {
            out.insert(prefix.to_string(), s.clone());
        }
        serde_json::Value::Null => {
            out.insert(prefix.to_string(), "none".to_string());
        }
        other => {
            out.insert(prefix.to_string(), other.to_string());
        }
    }
}

/// Parse `KEY=VALUE` and `KEY VALUE` override pairs.
pub fn parse_overrides(raw: &[String]) -> Result<Vec<(String, Value)>> {
    let mut out = Vec::new();
    let mut iter = raw.iter();
    while let Some(item) = iter.next() {
        let (key, text) = match item.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => {
                let value = iter.next().ok_or_else(|| {
                    SegTrainError::invalid_input(format!("override '{item}' is missing a value"))
                })?;
                (item.clone(), value.clone())
            }
        };
        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() {
            return Err(SegTrainError::invalid_input(format!(
                "override '{item}' has an empty key"
            )));
        }
        let value = match text.parse::<Value>() {
            Ok(v) => v,
            Err(never) => match never {},
        };
        out.push((key, value));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sources(overrides: &[&str]) -> ConfigSources {
        ConfigSources {
            overrides: overrides.iter().map(|s| s.to_string()).collect(),
            ..ConfigSources::default()
        }
    }

    #[test]
    fn test_assemble_applies_datasets_and_class_count() {
        let (cfg, hp) = RunConfig::assemble(&sources(&[]), "train_a", "test_a", 3).unwrap();
        assert_eq!(cfg.datasets.train, vec!["train_a".to_string()]);
        assert_eq!(cfg.datasets.test, vec!["test_a".to_string()]);
        assert_eq!(cfg.model.num_classes, 3);
        assert_eq!(hp.get("model.num_classes").map(String::as_str), Some("3"));
    }

    #[test]
    fn test_overrides_beat_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("run.toml");
        std::fs::write(&file, "[solver]\nbase_lr = 0.5\nmax_iter = 7\n").unwrap();

        let mut src = sources(&["solver.base_lr=0.25", "TEST.EVAL_PERIOD", "5"]);
        src.config_file = Some(file);
        let (cfg, _) = RunConfig::assemble(&src, "a", "b", 1).unwrap();
        assert_eq!(cfg.solver.base_lr, 0.25);
        assert_eq!(cfg.solver.max_iter, 7);
        assert_eq!(cfg.test.eval_period, 5);
    }

    #[test]
    fn test_registered_class_count_cannot_be_overridden() {
        let (cfg, _) =
            RunConfig::assemble(&sources(&["model.num_classes=9"]), "a", "b", 2).unwrap();
        assert_eq!(cfg.model.num_classes, 2);
    }

    #[test]
    fn test_missing_config_file_fails() {
        let mut src = sources(&[]);
        src.config_file = Some(PathBuf::from("/definitely/not/here.toml"));
        assert!(matches!(
            RunConfig::assemble(&src, "a", "b", 1),
            Err(SegTrainError::Config(_))
        ));
    }

    #[test]
    fn test_override_without_value_fails() {
        assert!(matches!(
            parse_overrides(&["solver.max_iter".to_string()]),
            Err(SegTrainError::InvalidInput(_))
        ));
        assert!(matches!(
            parse_overrides(&["=3".to_string()]),
            Err(SegTrainError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_hyperparameters_are_flat() {
        let cfg = RunConfig {
            solver: SolverConfig {
                steps: vec![10, 20],
                ..SolverConfig::default()
            },
            ..RunConfig::default()
        };
        let hp = cfg.hyperparameters();
        assert_eq!(hp.get("solver.steps").map(String::as_str), Some("[10,20]"));
        assert_eq!(hp.get("model.weights").map(String::as_str), Some("none"));
        assert_eq!(hp.get("output_dir").map(String::as_str), Some("./output"));
        assert!(hp.keys().all(|k| !k.contains('{')));
    }

    #[test]
    fn test_validate_rejects_bad_input_size() {
        let cfg = RunConfig {
            input: InputConfig { size: 30 },
            ..RunConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_images_per_worker() {
        let cfg = RunConfig::default();
        assert_eq!(cfg.images_per_worker(2).unwrap(), 2);
        assert!(cfg.images_per_worker(3).is_err());
    }

    #[test]
    fn test_dump_writes_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        RunConfig::default().dump(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let back: RunConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, RunConfig::default());
    }
}
