//! Checkpoint management for training runs.
//!
//! A checkpoint named `model_final` is stored as `model_final.bin` (module
//! record), `model_final-optim.bin` (optimizer record, optional) and
//! `model_final.json` ([`TrainingState`]). `last_checkpoint` holds the file
//! name of the most recent save and `checkpoints.json` is the manifest.

use crate::error::{Result, SegTrainError};
use crate::persistence::{atomic_write, atomic_write_json, load_json};
use burn::module::Module;
use burn::record::{BinFileRecorder, FullPrecisionSettings, Record, Recorder};
use burn::tensor::backend::Backend;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

const MANIFEST: &str = "checkpoints.json";
const LAST_CHECKPOINT: &str = "last_checkpoint";

/// Progress restored on resume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Iterations completed when the checkpoint was written.
    pub iteration: usize,
    #[serde(default)]
    pub best_metric: Option<f64>,
}

/// Manifest entry for one saved checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub name: String,
    pub iteration: usize,
    pub path: PathBuf,
    pub hash: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

pub struct DetectionCheckpointer {
    save_dir: PathBuf,
    save_to_disk: bool,
    recorder: BinFileRecorder<FullPrecisionSettings>,
}

impl DetectionCheckpointer {
    /// `save_to_disk` is true only on the main process.
    pub fn new(save_dir: impl Into<PathBuf>, save_to_disk: bool) -> Self {
        Self {
            save_dir: save_dir.into(),
            save_to_disk,
            recorder: BinFileRecorder::new(),
        }
    }

    pub fn save_dir(&self) -> &Path {
        &self.save_dir
    }

    pub fn model_path(&self, name: &str) -> PathBuf {
        self.save_dir.join(format!("{name}.bin"))
    }

    fn optimizer_path(&self, name: &str) -> PathBuf {
        self.save_dir.join(format!("{name}-optim.bin"))
    }

    fn state_path(&self, name: &str) -> PathBuf {
        self.save_dir.join(format!("{name}.json"))
    }

    /// Persist a model, its optimizer record and the training state.
    pub fn save<B, M, R>(
        &self,
        name: &str,
        model: &M,
        optimizer: Option<R>,
        state: TrainingState,
    ) -> Result<Option<CheckpointEntry>>
    where
        B: Backend,
        M: Module<B>,
        R: Record<B>,
    {
        if !self.save_to_disk {
            return Ok(None);
        }
        std::fs::create_dir_all(&self.save_dir)?;
        let path = self.model_path(name);
        model
            .clone()
            .save_file(path.clone(), &self.recorder)
            .map_err(|e| SegTrainError::checkpoint(format!("failed to save {name}: {e:?}")))?;
        if let Some(record) = optimizer {
            Recorder::<B>::record(&self.recorder, record, self.optimizer_path(name)).map_err(
                |e| SegTrainError::checkpoint(format!("failed to save optimizer for {name}: {e:?}")),
            )?;
        }
        atomic_write_json(&self.state_path(name), &state)?;
        let entry = self.register(name, state.iteration)?;
        tracing::info!(checkpoint = %path.display(), iteration = state.iteration, "saved checkpoint");
        Ok(Some(entry))
    }

    /// Write only the module weights to `path`, outside the manifest.
    pub fn export<B: Backend, M: Module<B>>(&self, model: &M, path: &Path) -> Result<()> {
        if !self.save_to_disk {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        model
            .clone()
            .save_file(path.to_path_buf(), &self.recorder)
            .map_err(|e| {
                SegTrainError::checkpoint(format!("failed to export {}: {e:?}", path.display()))
            })?;
        Ok(())
    }

    fn register(&self, name: &str, iteration: usize) -> Result<CheckpointEntry> {
        let path = self.model_path(name);
        let bytes = std::fs::read(&path)?;
        let hash = format!("{:x}", Sha256::digest(&bytes));
        let entry = CheckpointEntry {
            name: name.to_string(),
            iteration,
            path: path.clone(),
            hash,
            size_bytes: bytes.len() as u64,
            created_at: Utc::now(),
        };
        let mut entries = self.list()?;
        entries.retain(|e| e.name != name);
        entries.push(entry.clone());
        atomic_write_json(&self.save_dir.join(MANIFEST), &entries)?;
        let file_name = format!("{name}.bin");
        atomic_write(&self.save_dir.join(LAST_CHECKPOINT), file_name.as_bytes())?;
        Ok(entry)
    }

    pub fn list(&self) -> Result<Vec<CheckpointEntry>> {
        Ok(load_json(&self.save_dir.join(MANIFEST))?.unwrap_or_default())
    }

    pub fn has_checkpoint(&self) -> bool {
        self.save_dir.join(LAST_CHECKPOINT).exists()
    }

    /// Name of the most recently saved checkpoint, if any.
    pub fn last_checkpoint(&self) -> Result<Option<String>> {
        let marker = self.save_dir.join(LAST_CHECKPOINT);
        if !marker.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(marker)?;
        let file_name = text.trim();
        if file_name.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            file_name.strip_suffix(".bin").unwrap_or(file_name).to_string(),
        ))
    }

    /// Load module weights from `path`, failing if the parameter layout differs.
    pub fn load_model<B: Backend, M: Module<B>>(
        &self,
        model: M,
        path: &Path,
        device: &B::Device,
    ) -> Result<M> {
        if !path.exists() {
            return Err(SegTrainError::checkpoint(format!(
                "checkpoint {} does not exist",
                path.display()
            )));
        }
        let expected = model.num_params();
        let loaded = model
            .load_file(path.to_path_buf(), &self.recorder, device)
            .map_err(|e| {
                SegTrainError::checkpoint(format!("failed to load {}: {e:?}", path.display()))
            })?;
        if loaded.num_params() != expected {
            return Err(SegTrainError::checkpoint(format!(
                "checkpoint {} has {} parameters, model expects {expected}",
                path.display(),
                loaded.num_params()
            )));
        }
        tracing::info!(checkpoint = %path.display(), "loaded weights");
        Ok(loaded)
    }

    pub fn load_state(&self, name: &str) -> Result<TrainingState> {
        load_json(&self.state_path(name))?.ok_or_else(|| {
            SegTrainError::checkpoint(format!("checkpoint {name} has no training state"))
        })
    }

    /// Optimizer record saved with `name`, if one was written.
    pub fn load_optimizer<B: Backend, R: Record<B>>(
        &self,
        name: &str,
        device: &B::Device,
    ) -> Result<Option<R>> {
        let path = self.optimizer_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let record = Recorder::<B>::load(&self.recorder, path, device).map_err(|e| {
            SegTrainError::checkpoint(format!("failed to load optimizer for {name}: {e:?}"))
        })?;
        Ok(Some(record))
    }

    /// Resume from the last checkpoint when `resume` is set and one exists;
    /// otherwise load `weights` if given. The state is returned only on resume.
    pub fn resume_or_load<B: Backend, M: Module<B>>(
        &self,
        model: M,
        weights: Option<&Path>,
        resume: bool,
        device: &B::Device,
    ) -> Result<(M, Option<(String, TrainingState)>)> {
        if resume {
            if let Some(name) = self.last_checkpoint()? {
                let model = self.load_model(model, &self.model_path(&name), device)?;
                let state = self.load_state(&name)?;
                tracing::info!(checkpoint = %name, iteration = state.iteration, "resuming");
                return Ok((model, Some((name, state))));
            }
            tracing::info!(dir = %self.save_dir.display(), "no checkpoint found to resume from");
        }
        match weights {
            Some(path) => Ok((self.load_model(model, path, device)?, None)),
            None => Ok((model, None)),
        }
    }

    /// Copy every file of checkpoint `from` to `to`.
    pub fn copy(&self, from: &str, to: &str) -> Result<()> {
        if !self.save_to_disk {
            return Ok(());
        }
        std::fs::copy(self.model_path(from), self.model_path(to))?;
        if self.optimizer_path(from).exists() {
            std::fs::copy(self.optimizer_path(from), self.optimizer_path(to))?;
        }
        let state = self.load_state(from)?;
        atomic_write_json(&self.state_path(to), &state)?;
        let mut entries = self.list()?;
        let hash = entries
            .iter()
            .find(|e| e.name == from)
            .map(|e| e.hash.clone());
        let bytes = std::fs::read(self.model_path(to))?;
        entries.retain(|e| e.name != to);
        entries.push(CheckpointEntry {
            name: to.to_string(),
            iteration: state.iteration,
            path: self.model_path(to),
            hash: hash.unwrap_or_else(|| format!("{:x}", Sha256::digest(&bytes))),
            size_bytes: bytes.len() as u64,
            created_at: Utc::now(),
        });
        atomic_write_json(&self.save_dir.join(MANIFEST), &entries)?;
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        for path in [
            self.model_path(name),
            self.optimizer_path(name),
            self.state_path(name),
        ] {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        let mut entries = self.list()?;
        entries.retain(|e| e.name != name);
        atomic_write_json(&self.save_dir.join(MANIFEST), &entries)?;
        tracing::debug!(checkpoint = name, "removed checkpoint");
        Ok(())
    }
}

/// Decides when to write `model_{iter:07}` and `model_final`, and prunes old
/// periodic checkpoints.
#[derive(Debug, Clone)]
pub struct PeriodicCheckpointer {
    pub period: usize,
    pub max_iter: usize,
    pub max_to_keep: usize,
}

impl PeriodicCheckpointer {
    pub fn new(period: usize, max_iter: usize, max_to_keep: usize) -> Self {
        Self {
            period,
            max_iter,
            max_to_keep,
        }
    }

    /// Checkpoint to write after the 0-based `iteration`, if any.
    pub fn checkpoint_name(&self, iteration: usize) -> Option<String> {
        if iteration + 1 >= self.max_iter {
            return Some("model_final".to_string());
        }
        if self.period > 0 && (iteration + 1) % self.period == 0 {
            return Some(periodic_name(iteration));
        }
        None
    }

    /// Drop the oldest periodic checkpoints beyond `max_to_keep`.
    pub fn prune(&self, checkpointer: &DetectionCheckpointer) -> Result<Vec<String>> {
        if self.max_to_keep == 0 || !checkpointer.save_to_disk {
            return Ok(Vec::new());
        }
        let mut periodic: Vec<(usize, String)> = checkpointer
            .list()?
            .into_iter()
            .filter_map(|e| parse_periodic(&e.name).map(|it| (it, e.name)))
            .collect();
        periodic.sort();
        let excess = periodic.len().saturating_sub(self.max_to_keep);
        let mut removed = Vec::with_capacity(excess);
        for (_, name) in periodic.into_iter().take(excess) {
            checkpointer.remove(&name)?;
            removed.push(name);
        }
        Ok(removed)
    }
}

pub fn periodic_name(iteration: usize) -> String {
    format!("model_{iteration:07}")
}

fn parse_periodic(name: &str) -> Option<usize> {
    let digits = name.strip_prefix("model_")?;
    if digits.len() == 7 && digits.bytes().all(|b| b.is_ascii_digit()) {
        digits.parse().ok()
    } else {
        None
    }
}

pub const BEST_CHECKPOINT: &str = "model_best";

/// Tracks the best value of an evaluation metric (higher is better).
#[derive(Debug, Clone)]
pub struct BestCheckpointer {
    pub metric: String,
    pub best: Option<f64>,
}

impl BestCheckpointer {
    pub fn new(metric: impl Into<String>, best: Option<f64>) -> Self {
        Self {
            metric: metric.into(),
            best,
        }
    }

    /// Returns true when `value` improves on the best seen so far.
    pub fn improves(&mut self, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        match self.best {
            Some(best) if value <= best => false,
            _ => {
                self.best = Some(value);
                true
            }
        }
    }

    /// Make sure `model_best` holds the selected model. Without a tracked
    /// best value it is refreshed from `model_final` on every call.
    pub fn ensure_best(&self, checkpointer: &DetectionCheckpointer) -> Result<PathBuf> {
        let best = checkpointer.model_path(BEST_CHECKPOINT);
        if self.best.is_none() || !best.exists() {
            tracing::info!(
                metric = %self.metric,
                "no evaluation selected a best model; using model_final"
            );
            checkpointer.copy("model_final", BEST_CHECKPOINT)?;
        }
        Ok(best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modeling::{MaskDetector, MaskDetectorConfig};
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    fn model(classes: usize) -> MaskDetector<B> {
        MaskDetectorConfig {
            num_classes: classes,
            max_detections: 2,
            hidden_dim: 4,
            mask_resolution: 2,
        }
        .init(&Default::default())
    }

    fn save(ckpt: &DetectionCheckpointer, name: &str, iteration: usize) {
        ckpt.save::<B, _, ()>(name, &model(1), None, TrainingState { iteration, best_metric: None })
            .unwrap();
    }

    #[test]
    fn test_resume_picks_last_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = DetectionCheckpointer::new(dir.path(), true);
        assert!(!ckpt.has_checkpoint());
        save(&ckpt, "model_0000009", 10);
        save(&ckpt, "model_0000019", 20);
        assert_eq!(ckpt.last_checkpoint().unwrap().as_deref(), Some("model_0000019"));

        let (_, state) = ckpt
            .resume_or_load(model(1), None, true, &Default::default())
            .unwrap();
        let (name, state) = state.unwrap();
        assert_eq!(name, "model_0000019");
        assert_eq!(state.iteration, 20);
    }

    #[test]
    fn test_without_resume_state_is_not_restored() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = DetectionCheckpointer::new(dir.path(), true);
        save(&ckpt, "model_final", 5);
        let weights = ckpt.model_path("model_final");
        let (_, state) = ckpt
            .resume_or_load(model(1), Some(&weights), false, &Default::default())
            .unwrap();
        assert!(state.is_none());
    }

    #[test]
    fn test_mismatched_layout_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = DetectionCheckpointer::new(dir.path(), true);
        save(&ckpt, "model_final", 1);
        let err = ckpt
            .load_model(model(3), &ckpt.model_path("model_final"), &Default::default())
            .unwrap_err();
        assert!(matches!(err, SegTrainError::Checkpoint(_)));
    }

    #[test]
    fn test_non_main_process_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = DetectionCheckpointer::new(dir.path().join("out"), false);
        save(&ckpt, "model_final", 1);
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn test_periodic_names_and_pruning() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = DetectionCheckpointer::new(dir.path(), true);
        let periodic = PeriodicCheckpointer::new(10, 35, 2);
        assert_eq!(periodic.checkpoint_name(8), None);
        assert_eq!(periodic.checkpoint_name(9).as_deref(), Some("model_0000009"));
        assert_eq!(periodic.checkpoint_name(34).as_deref(), Some("model_final"));

        for it in [9, 19, 29] {
            save(&ckpt, &periodic_name(it), it + 1);
        }
        save(&ckpt, "model_final", 35);
        let removed = periodic.prune(&ckpt).unwrap();
        assert_eq!(removed, vec!["model_0000009".to_string()]);
        assert!(!ckpt.model_path("model_0000009").exists());
        assert!(ckpt.model_path("model_final").exists());
        assert_eq!(ckpt.list().unwrap().len(), 3);
    }

    #[test]
    fn test_best_falls_back_to_final() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = DetectionCheckpointer::new(dir.path(), true);
        save(&ckpt, "model_final", 3);
        let mut best = BestCheckpointer::new("bbox/AP50", None);
        assert!(best.improves(10.0));
        assert!(!best.improves(5.0));
        assert!(!best.improves(f64::NAN));
        let path = best.ensure_best(&ckpt).unwrap();
        assert!(path.exists());
        assert_eq!(ckpt.load_state(BEST_CHECKPOINT).unwrap().iteration, 3);
    }

    #[test]
    fn test_fallback_best_follows_newer_final() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = DetectionCheckpointer::new(dir.path(), true);
        let best = BestCheckpointer::new("bbox/AP50", None);
        save(&ckpt, "model_final", 2);
        best.ensure_best(&ckpt).unwrap();
        save(&ckpt, "model_final", 4);
        best.ensure_best(&ckpt).unwrap();
        assert_eq!(ckpt.load_state(BEST_CHECKPOINT).unwrap().iteration, 4);
    }

    #[test]
    fn test_selected_best_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = DetectionCheckpointer::new(dir.path(), true);
        let mut best = BestCheckpointer::new("bbox/AP50", None);
        assert!(best.improves(50.0));
        save(&ckpt, BEST_CHECKPOINT, 2);
        save(&ckpt, "model_final", 4);
        best.ensure_best(&ckpt).unwrap();
        assert_eq!(ckpt.load_state(BEST_CHECKPOINT).unwrap().iteration, 2);
    }
}
