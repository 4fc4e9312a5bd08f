//! COCO evaluation of model predictions.

pub mod coco_eval;

use crate::data::coco::{RleCounts, RleObject, Segmentation};
use crate::data::{BitMask, encode_rle_string};
use crate::error::{Result, SegTrainError};
use crate::modeling::Instance;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use coco_eval::{Detection, IouType, evaluate};

/// `task -> metric -> value`, e.g. `bbox -> AP50 -> 87.1`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResults(pub BTreeMap<String, BTreeMap<String, f64>>);

impl EvaluationResults {
    pub fn get(&self, task: &str, metric: &str) -> Option<f64> {
        self.0.get(task).and_then(|m| m.get(metric)).copied()
    }

    pub fn task(&self, task: &str) -> Option<&BTreeMap<String, f64>> {
        self.0.get(task)
    }

    pub fn insert(&mut self, task: impl Into<String>, metrics: BTreeMap<String, f64>) {
        self.0.insert(task.into(), metrics);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Metrics for the tracker, keyed `<metric><task>` (`AP50bbox`).
    pub fn suffixed(&self, task: &str) -> BTreeMap<String, f64> {
        self.0
            .get(task)
            .map(|m| m.iter().map(|(k, v)| (format!("{k}{task}"), *v)).collect())
            .unwrap_or_default()
    }
}

/// One entry of `coco_instances_results.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CocoPrediction {
    pub image_id: u64,
    pub category_id: u64,
    /// `[x, y, width, height]`
    pub bbox: [f64; 4],
    pub score: f32,
    pub segmentation: RleObject,
}

impl CocoPrediction {
    pub fn from_instance(image_id: u64, instance: &Instance, category_ids: &[u64]) -> Result<Self> {
        let category_id = *category_ids.get(instance.category).ok_or_else(|| {
            SegTrainError::evaluation(format!(
                "predicted class {} has no COCO category",
                instance.category
            ))
        })?;
        let [x0, y0, x1, y1] = instance.bbox;
        let rle = instance.mask.to_rle();
        Ok(Self {
            image_id,
            category_id,
            bbox: [x0, y0, x1 - x0, y1 - y0],
            score: instance.score,
            segmentation: RleObject {
                size: rle.size,
                counts: RleCounts::Compressed(encode_rle_string(&rle.counts)),
            },
        })
    }

    /// Back to an evaluable [`Detection`] with a contiguous class id.
    pub fn to_detection(&self, category_ids: &[u64], with_mask: bool) -> Result<Detection> {
        let category = category_ids
            .iter()
            .position(|&id| id == self.category_id)
            .ok_or_else(|| {
                SegTrainError::evaluation(format!("unknown category id {}", self.category_id))
            })?;
        let [x, y, w, h] = self.bbox;
        let mask: Option<BitMask> = if with_mask {
            let [height, width] = self.segmentation.size;
            Some(Segmentation::Rle(self.segmentation.clone()).to_mask(width, height)?)
        } else {
            None
        };
        Ok(Detection {
            image_id: self.image_id,
            category,
            bbox: [x, y, x + w, y + h],
            score: self.score,
            mask,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffixed_keys() {
        let mut results = EvaluationResults::default();
        results.insert("bbox", BTreeMap::from([("AP".to_string(), 50.0)]));
        results.insert("segm", BTreeMap::from([("AP50".to_string(), 40.0)]));
        assert_eq!(results.suffixed("bbox"), BTreeMap::from([("APbbox".to_string(), 50.0)]));
        assert_eq!(results.get("segm", "AP50"), Some(40.0));
        assert!(results.suffixed("keypoints").is_empty());
    }

    #[test]
    fn test_prediction_preserves_box_and_mask() {
        let mask = BitMask::from_box([2.0, 1.0, 6.0, 4.0], 8, 5);
        let instance = Instance {
            bbox: [2.0, 1.0, 6.0, 4.0],
            score: 0.8,
            category: 1,
            mask: mask.clone(),
        };
        let pred = CocoPrediction::from_instance(9, &instance, &[3, 7]).unwrap();
        assert_eq!(pred.category_id, 7);
        assert_eq!(pred.bbox, [2.0, 1.0, 4.0, 3.0]);
        let det = pred.to_detection(&[3, 7], true).unwrap();
        assert_eq!(det.category, 1);
        assert_eq!(det.bbox, instance.bbox);
        assert_eq!(det.mask, Some(mask));
    }

    #[test]
    fn test_unknown_category_fails() {
        let instance = Instance {
            bbox: [0.0, 0.0, 1.0, 1.0],
            score: 1.0,
            category: 4,
            mask: BitMask::new(2, 2),
        };
        assert!(CocoPrediction::from_instance(1, &instance, &[1]).is_err());
    }
}
