//! Per-iteration training events.

use crate::error::Result;
use crate::modeling::LossBreakdown;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;

/// One line of `metrics.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationEvent {
    pub iteration: usize,
    pub lr: f64,
    pub time: f64,
    #[serde(flatten)]
    pub losses: LossBreakdown,
}

/// Keeps the event history and appends it as JSON lines when a path is set.
#[derive(Debug)]
pub struct EventStorage {
    path: Option<PathBuf>,
    history: Vec<IterationEvent>,
    log_period: usize,
    total_time: f64,
}

impl EventStorage {
    /// `path` is `Some` only on the main process.
    pub fn new(path: Option<PathBuf>, log_period: usize) -> Self {
        Self {
            path,
            history: Vec::new(),
            log_period: log_period.max(1),
            total_time: 0.0,
        }
    }

    pub fn record(&mut self, event: IterationEvent, max_iter: usize) -> Result<()> {
        self.total_time += event.time;
        if let Some(path) = &self.path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            writeln!(file, "{}", serde_json::to_string(&event)?)?;
        }
        let last = event.iteration + 1 == max_iter;
        if (event.iteration + 1) % self.log_period == 0 || last {
            let recent = self.recent_median_loss(self.log_period).unwrap_or(event.losses.total_loss as f64);
            tracing::info!(
                iteration = event.iteration,
                max_iter,
                total_loss = recent,
                loss_objectness = event.losses.loss_objectness,
                loss_box_reg = event.losses.loss_box_reg,
                loss_cls = event.losses.loss_cls,
                loss_mask = event.losses.loss_mask,
                lr = event.lr,
                time = event.time,
                "training step"
            );
        }
        self.history.push(event);
        Ok(())
    }

    pub fn history(&self) -> &[IterationEvent] {
        &self.history
    }

    pub fn latest(&self) -> Option<&IterationEvent> {
        self.history.last()
    }

    pub fn total_time(&self) -> f64 {
        self.total_time
    }

    /// Median total loss over the last `window` events.
    pub fn recent_median_loss(&self, window: usize) -> Option<f64> {
        let start = self.history.len().saturating_sub(window);
        let mut values: Vec<f64> = self.history[start..]
            .iter()
            .map(|e| e.losses.total_loss as f64)
            .collect();
        if values.is_empty() {
            return None;
        }
        values.sort_by(|a, b| a.total_cmp(b));
        let mid = values.len() / 2;
        Some(if values.len() % 2 == 0 {
            (values[mid - 1] + values[mid]) / 2.0
        } else {
            values[mid]
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(iteration: usize, total: f32) -> IterationEvent {
        IterationEvent {
            iteration,
            lr: 0.01,
            time: 0.5,
            losses: LossBreakdown {
                total_loss: total,
                ..LossBreakdown::default()
            },
        }
    }

    #[test]
    fn test_events_are_appended_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        let mut storage = EventStorage::new(Some(path.clone()), 20);
        storage.record(event(0, 2.0), 2).unwrap();
        storage.record(event(1, 1.0), 2).unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed["iteration"], 1);
        assert_eq!(parsed["total_loss"], 1.0);
        assert_eq!(storage.total_time(), 1.0);
    }

    #[test]
    fn test_median_loss() {
        let mut storage = EventStorage::new(None, 20);
        for (i, v) in [4.0, 1.0, 3.0, 2.0].into_iter().enumerate() {
            storage.record(event(i, v), 10).unwrap();
        }
        assert_eq!(storage.recent_median_loss(3), Some(2.0));
        assert_eq!(storage.recent_median_loss(4), Some(2.5));
        assert_eq!(storage.latest().map(|e| e.iteration), Some(3));
    }
}
