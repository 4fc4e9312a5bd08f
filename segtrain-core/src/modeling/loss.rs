//! Training losses for [`MaskDetector`](super::MaskDetector).

use super::detector::DetectorOutput;
use super::targets::{MatchedTargets, match_targets};
use crate::data::SampleTargets;
use crate::error::{Result, SegTrainError};
use burn::tensor::activation::log_softmax;
use burn::tensor::{Tensor, TensorData, backend::Backend};
use serde::{Deserialize, Serialize};

const BOX_WEIGHT: f32 = 5.0;

/// Loss terms of one step, still attached to the graph.
#[derive(Debug, Clone)]
pub struct DetectionLosses<B: Backend> {
    pub objectness: Tensor<B, 1>,
    pub box_reg: Tensor<B, 1>,
    pub classification: Tensor<B, 1>,
    pub mask: Tensor<B, 1>,
}

/// Host copy of the loss terms, as stored per iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LossBreakdown {
    pub loss_objectness: f32,
    pub loss_box_reg: f32,
    pub loss_cls: f32,
    pub loss_mask: f32,
    pub total_loss: f32,
}

impl LossBreakdown {
    pub fn is_finite(&self) -> bool {
        [
            self.loss_objectness,
            self.loss_box_reg,
            self.loss_cls,
            self.loss_mask,
            self.total_loss,
        ]
        .iter()
        .all(|v| v.is_finite())
    }

    pub fn terms(&self) -> [(&'static str, f32); 5] {
        [
            ("loss_objectness", self.loss_objectness),
            ("loss_box_reg", self.loss_box_reg),
            ("loss_cls", self.loss_cls),
            ("loss_mask", self.loss_mask),
            ("total_loss", self.total_loss),
        ]
    }
}

impl<B: Backend> DetectionLosses<B> {
    pub fn total(&self) -> Tensor<B, 1> {
        self.objectness.clone()
            + self.box_reg.clone() * BOX_WEIGHT
            + self.classification.clone()
            + self.mask.clone()
    }

    pub fn breakdown(&self) -> Result<LossBreakdown> {
        Ok(LossBreakdown {
            loss_objectness: scalar(self.objectness.clone())?,
            loss_box_reg: scalar(self.box_reg.clone())?,
            loss_cls: scalar(self.classification.clone())?,
            loss_mask: scalar(self.mask.clone())?,
            total_loss: scalar(self.total())?,
        })
    }
}

pub fn scalar<B: Backend>(t: Tensor<B, 1>) -> Result<f32> {
    t.into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| SegTrainError::training(format!("failed to read tensor: {e:?}")))?
        .first()
        .copied()
        .ok_or_else(|| SegTrainError::training("empty loss tensor"))
}

/// Match targets against the current predictions and compute every loss term.
pub fn detection_losses<B: Backend>(
    output: &DetectorOutput<B>,
    targets: &[SampleTargets],
    mask_resolution: usize,
) -> Result<DetectionLosses<B>> {
    let [batch, slots, _] = output.boxes.dims();
    let num_classes = output.class_logits.dims()[2];
    if targets.len() != batch {
        return Err(SegTrainError::training(format!(
            "batch has {batch} images but {} target sets",
            targets.len()
        )));
    }
    let predicted = output
        .boxes
        .clone()
        .detach()
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| SegTrainError::training(format!("failed to read boxes: {e:?}")))?;
    let matched = match_targets(&predicted, targets, slots, num_classes, mask_resolution);
    Ok(losses_for(output, &matched))
}

fn losses_for<B: Backend>(output: &DetectorOutput<B>, m: &MatchedTargets) -> DetectionLosses<B> {
    let device = output.boxes.device();
    let (n, k, c, cells) = (m.batch, m.slots, m.num_classes, m.mask_cells);
    let matched = m.num_matched.max(1) as f32;

    let obj_target = Tensor::<B, 2>::from_data(TensorData::new(m.objectness.clone(), [n, k]), &device);
    let objectness = bce_with_logits(output.objectness_logits.clone(), obj_target).mean();

    let box_target = Tensor::<B, 3>::from_data(TensorData::new(m.boxes.clone(), [n, k, 4]), &device);
    let box_weight = Tensor::<B, 3>::from_data(TensorData::new(m.slot_weights(4), [n, k, 4]), &device);
    let box_reg = ((output.boxes.clone() - box_target).abs() * box_weight).sum() / (matched * 4.0);

    let one_hot = Tensor::<B, 3>::from_data(TensorData::new(m.classes.clone(), [n, k, c]), &device);
    let classification = (log_softmax(output.class_logits.clone(), 2) * one_hot).sum().neg() / matched;

    let mask_target = Tensor::<B, 3>::from_data(TensorData::new(m.masks.clone(), [n, k, cells]), &device);
    let mask_weight = Tensor::<B, 3>::from_data(TensorData::new(m.slot_weights(cells), [n, k, cells]), &device);
    let mask = (bce_with_logits(output.mask_logits.clone(), mask_target) * mask_weight).sum()
        / (matched * cells as f32);

    DetectionLosses {
        objectness,
        box_reg,
        classification,
        mask,
    }
}

/// Element-wise `max(x, 0) - x * t + ln(1 + e^-|x|)`.
fn bce_with_logits<B: Backend, const D: usize>(logits: Tensor<B, D>, target: Tensor<B, D>) -> Tensor<B, D> {
    let softplus = logits.clone().abs().neg().exp().log1p();
    logits.clone().clamp_min(0.0) - logits * target + softplus
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modeling::MaskDetectorConfig;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn test_bce_matches_closed_form() {
        let device = Default::default();
        let logits = Tensor::<B, 1>::from_floats([0.0, 2.0, -3.0], &device);
        let target = Tensor::<B, 1>::from_floats([1.0, 0.0, 0.0], &device);
        let values = bce_with_logits(logits, target).into_data().to_vec::<f32>().unwrap();
        let expected = [2f32.ln(), 2.0 + (-2f32).exp().ln_1p(), (-3f32).exp().ln_1p()];
        for (v, e) in values.iter().zip(expected) {
            assert!((v - e).abs() < 1e-5, "{v} vs {e}");
        }
    }

    #[test]
    fn test_losses_are_finite_and_positive() {
        let device = Default::default();
        let model = MaskDetectorConfig {
            num_classes: 2,
            max_detections: 4,
            hidden_dim: 8,
            mask_resolution: 3,
        }
        .init::<B>(&device);
        let output = model.forward(Tensor::<B, 4>::ones([1, 3, 16, 16], &device));
        let targets = vec![SampleTargets {
            boxes: vec![[0.1, 0.1, 0.6, 0.7]],
            classes: vec![1],
            masks: vec![vec![1.0; 9]],
        }];
        let losses = detection_losses(&output, &targets, 3).unwrap();
        let breakdown = losses.breakdown().unwrap();
        assert!(breakdown.is_finite());
        assert!(breakdown.loss_objectness > 0.0);
        assert!(breakdown.loss_cls > 0.0);
        assert!(breakdown.total_loss >= breakdown.loss_mask);
    }

    #[test]
    fn test_target_count_must_match_batch() {
        let device = Default::default();
        let model = MaskDetectorConfig {
            num_classes: 1,
            max_detections: 2,
            hidden_dim: 8,
            mask_resolution: 2,
        }
        .init::<B>(&device);
        let output = model.forward(Tensor::<B, 4>::zeros([2, 3, 8, 8], &device));
        assert!(detection_losses(&output, &[SampleTargets::default()], 2).is_err());
    }
}
