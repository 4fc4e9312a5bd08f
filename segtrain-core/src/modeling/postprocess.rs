//! Turn raw network outputs into per-image detections.

use super::detector::DetectorOutput;
use crate::data::{BitMask, box_iou};
use crate::error::{Result, SegTrainError};
use burn::tensor::activation::{sigmoid, softmax};
use burn::tensor::backend::Backend;

/// Mask probability at or above which a pixel belongs to the instance.
pub const MASK_THRESHOLD: f32 = 0.5;

/// One detected instance in original image coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    /// `xyxy` in pixels.
    pub bbox: [f64; 4],
    pub score: f32,
    pub category: usize,
    pub mask: BitMask,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PostprocessParams {
    pub score_thresh: f32,
    pub nms_thresh: f32,
    pub detections_per_image: usize,
}

impl PostprocessParams {
    pub fn from_test_config(test: &crate::config::TestConfig) -> Self {
        Self {
            score_thresh: test.score_thresh,
            nms_thresh: test.nms_thresh,
            detections_per_image: test.detections_per_image,
        }
    }

    pub fn with_score_thresh(mut self, score_thresh: f32) -> Self {
        self.score_thresh = score_thresh;
        self
    }
}

/// Per-image instances, scaled to each `(width, height)` in `sizes`.
pub fn postprocess<B: Backend>(
    output: DetectorOutput<B>,
    sizes: &[(u32, u32)],
    params: PostprocessParams,
) -> Result<Vec<Vec<Instance>>> {
    let [batch, slots, _] = output.boxes.dims();
    let classes = output.class_logits.dims()[2];
    let cells = output.mask_logits.dims()[2];
    let m = (cells as f64).sqrt().round() as usize;
    if sizes.len() != batch {
        return Err(SegTrainError::evaluation(format!(
            "{} image sizes given for a batch of {batch}",
            sizes.len()
        )));
    }

    let boxes = host(output.boxes)?;
    let objectness = host(sigmoid(output.objectness_logits))?;
    let class_probs = host(softmax(output.class_logits, 2))?;
    let masks = host(sigmoid(output.mask_logits))?;

    let mut results = Vec::with_capacity(batch);
    for (n, &(width, height)) in sizes.iter().enumerate() {
        let mut candidates = Vec::new();
        for s in 0..slots {
            let slot = n * slots + s;
            let probs = &class_probs[slot * classes..(slot + 1) * classes];
            let (category, prob) = probs
                .iter()
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .unwrap_or((0, 0.0));
            let score = objectness[slot] * prob;
            if score < params.score_thresh {
                continue;
            }
            let b = &boxes[slot * 4..slot * 4 + 4];
            let bbox = [
                b[0] as f64 * width as f64,
                b[1] as f64 * height as f64,
                b[2] as f64 * width as f64,
                b[3] as f64 * height as f64,
            ];
            if bbox[2] - bbox[0] <= 0.0 || bbox[3] - bbox[1] <= 0.0 {
                continue;
            }
            candidates.push((slot, bbox, score, category));
        }

        let kept = nms(candidates, params.nms_thresh, params.detections_per_image);
        let instances = kept
            .into_iter()
            .map(|(slot, bbox, score, category)| Instance {
                bbox,
                score,
                category,
                mask: BitMask::paste(
                    &masks[slot * cells..(slot + 1) * cells],
                    m,
                    bbox,
                    width,
                    height,
                    MASK_THRESHOLD,
                ),
            })
            .collect();
        results.push(instances);
    }
    Ok(results)
}

type Candidate = (usize, [f64; 4], f32, usize);

/// Per-class non-maximum suppression, then the top `limit` by score.
fn nms(mut candidates: Vec<Candidate>, iou_thresh: f32, limit: usize) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.2.total_cmp(&a.2));
    let mut kept: Vec<Candidate> = Vec::new();
    for cand in candidates {
        let suppressed = kept
            .iter()
            .any(|k| k.3 == cand.3 && box_iou(k.1, cand.1) > iou_thresh as f64);
        if !suppressed {
            kept.push(cand);
        }
        if kept.len() >= limit {
            break;
        }
    }
    kept
}

fn host<B: Backend, const D: usize>(t: burn::tensor::Tensor<B, D>) -> Result<Vec<f32>> {
    t.into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| SegTrainError::evaluation(format!("failed to read tensor: {e:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::{Tensor, TensorData};

    type B = NdArray<f32>;

    fn output(boxes: Vec<f32>, obj: Vec<f32>, cls: Vec<f32>, k: usize) -> DetectorOutput<B> {
        let device = Default::default();
        DetectorOutput {
            boxes: Tensor::from_data(TensorData::new(boxes, [1, k, 4]), &device),
            objectness_logits: Tensor::from_data(TensorData::new(obj, [1, k]), &device),
            class_logits: Tensor::from_data(TensorData::new(cls, [1, k, 2]), &device),
            mask_logits: Tensor::from_data(TensorData::new(vec![10.0; k * 4], [1, k, 4]), &device),
        }
    }

    fn params(score_thresh: f32) -> PostprocessParams {
        PostprocessParams {
            score_thresh,
            nms_thresh: 0.5,
            detections_per_image: 100,
        }
    }

    #[test]
    fn test_overlapping_same_class_is_suppressed() {
        let out = output(
            vec![0.0, 0.0, 0.5, 0.5, 0.0, 0.0, 0.5, 0.45, 0.6, 0.6, 1.0, 1.0],
            vec![5.0, 4.0, 5.0],
            vec![10.0, 0.0, 10.0, 0.0, 10.0, 0.0],
            3,
        );
        let result = postprocess(out, &[(100, 50)], params(0.5)).unwrap();
        assert_eq!(result[0].len(), 2);
        assert_eq!(result[0][0].bbox, [0.0, 0.0, 50.0, 25.0]);
        assert_eq!(result[0][0].mask.width(), 100);
        assert!(result[0][0].mask.area() > 0);
    }

    #[test]
    fn test_score_threshold_filters() {
        let out = output(
            vec![0.0, 0.0, 0.5, 0.5, 0.5, 0.5, 1.0, 1.0],
            vec![5.0, -5.0],
            vec![0.0, 10.0, 0.0, 10.0],
            2,
        );
        let result = postprocess(out, &[(10, 10)], params(0.7)).unwrap();
        assert_eq!(result[0].len(), 1);
        assert_eq!(result[0][0].category, 1);
        assert!(result[0][0].score >= 0.7);
    }

    #[test]
    fn test_detections_per_image_caps_output() {
        let out = output(
            vec![0.0, 0.0, 0.2, 0.2, 0.5, 0.5, 0.7, 0.7],
            vec![5.0, 5.0],
            vec![10.0, 0.0, 10.0, 0.0],
            2,
        );
        let mut p = params(0.0);
        p.detections_per_image = 1;
        assert_eq!(postprocess(out, &[(10, 10)], p).unwrap()[0].len(), 1);
    }
}
