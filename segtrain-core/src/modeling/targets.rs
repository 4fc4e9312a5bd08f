//! Assignment of ground-truth instances to detection slots.

use crate::data::SampleTargets;
use crate::data::box_iou;

/// Host-side training targets for a batch, flattened per slot.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedTargets {
    pub batch: usize,
    pub slots: usize,
    pub num_classes: usize,
    pub mask_cells: usize,
    /// `[N * K]`, 1 for matched slots.
    pub objectness: Vec<f32>,
    /// `[N * K * 4]`
    pub boxes: Vec<f32>,
    /// `[N * K * C]` one-hot, zero rows for unmatched slots.
    pub classes: Vec<f32>,
    /// `[N * K * M * M]`
    pub masks: Vec<f32>,
    pub num_matched: usize,
}

impl MatchedTargets {
    /// `[N * K * width]` copy of the objectness targets, for per-slot weighting.
    pub fn slot_weights(&self, width: usize) -> Vec<f32> {
        self.objectness
            .iter()
            .flat_map(|&w| std::iter::repeat_n(w, width))
            .collect()
    }
}

/// Greedily pair ground truth with predicted slots, best IoU first and
/// nearest corners to break ties; surplus ground truth beyond `slots` is dropped.
pub fn match_targets(
    predicted: &[f32],
    targets: &[SampleTargets],
    slots: usize,
    num_classes: usize,
    mask_resolution: usize,
) -> MatchedTargets {
    let batch = targets.len();
    let mask_cells = mask_resolution * mask_resolution;
    let mut out = MatchedTargets {
        batch,
        slots,
        num_classes,
        mask_cells,
        objectness: vec![0.0; batch * slots],
        boxes: vec![0.0; batch * slots * 4],
        classes: vec![0.0; batch * slots * num_classes],
        masks: vec![0.0; batch * slots * mask_cells],
        num_matched: 0,
    };

    for (n, sample) in targets.iter().enumerate() {
        let mut pairs = Vec::with_capacity(sample.boxes.len() * slots);
        for (g, gt) in sample.boxes.iter().enumerate() {
            for s in 0..slots {
                let base = (n * slots + s) * 4;
                let Some(pred) = predicted.get(base..base + 4) else {
                    continue;
                };
                let iou = box_iou(to_f64(pred), to_f64(gt));
                let dist: f32 = pred.iter().zip(gt).map(|(a, b)| (a - b).abs()).sum();
                pairs.push((iou, dist, g, s));
            }
        }
        pairs.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.total_cmp(&b.1)));

        let mut gt_used = vec![false; sample.boxes.len()];
        let mut slot_used = vec![false; slots];
        for (_, _, g, s) in pairs {
            if gt_used[g] || slot_used[s] {
                continue;
            }
            gt_used[g] = true;
            slot_used[s] = true;
            let slot = n * slots + s;
            out.objectness[slot] = 1.0;
            out.boxes[slot * 4..slot * 4 + 4].copy_from_slice(&sample.boxes[g]);
            let class = sample.classes[g].min(num_classes.saturating_sub(1));
            out.classes[slot * num_classes + class] = 1.0;
            if let Some(mask) = sample.masks.get(g) {
                let len = mask.len().min(mask_cells);
                out.masks[slot * mask_cells..slot * mask_cells + len].copy_from_slice(&mask[..len]);
            }
            out.num_matched += 1;
        }
    }
    out
}

fn to_f64(b: &[f32]) -> [f64; 4] {
    [b[0] as f64, b[1] as f64, b[2] as f64, b[3] as f64]
}
