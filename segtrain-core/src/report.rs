//! Side-by-side renders of ground truth and predictions for a few test images.

use crate::backend::{DefaultBackend, DefaultDevice};
use crate::checkpoint::DetectionCheckpointer;
use crate::config::RunConfig;
use crate::data::{BitMask, DatasetRecord};
use crate::engine::inference_on_records;
use crate::error::{Result, SegTrainError};
use crate::modeling::{Instance, PostprocessParams, build_model};
use image::{Rgba, RgbaImage};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::path::{Path, PathBuf};

const GT_COLOR: Rgba<u8> = Rgba([0, 220, 0, 255]);
const MASK_ALPHA: f32 = 0.4;
const BOX_THICKNESS: u32 = 2;

const PALETTE: [[u8; 3]; 8] = [
    [230, 25, 75],
    [0, 130, 200],
    [245, 130, 48],
    [145, 30, 180],
    [70, 240, 240],
    [240, 50, 230],
    [210, 245, 60],
    [128, 128, 0],
];

/// Colour used for predictions of `class`.
pub fn class_color(class: usize) -> Rgba<u8> {
    let [r, g, b] = PALETTE[class % PALETTE.len()];
    Rgba([r, g, b, 255])
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleComparison {
    pub num_samples: usize,
    pub score_threshold: f32,
}

impl Default for SampleComparison {
    fn default() -> Self {
        Self {
            num_samples: 10,
            score_threshold: 0.7,
        }
    }
}

impl SampleComparison {
    /// Predict with the weights at `weights` and write one PNG per sampled
    /// image into `dest_dir`: ground truth left, predictions right.
    pub fn compare_gt(
        &self,
        cfg: &RunConfig,
        records: &[DatasetRecord],
        weights: &Path,
        dest_dir: &Path,
        device: &DefaultDevice,
    ) -> Result<Vec<PathBuf>> {
        if !weights.exists() {
            return Err(SegTrainError::report(format!(
                "weights {} do not exist",
                weights.display()
            )));
        }
        std::fs::create_dir_all(dest_dir)?;

        let model = build_model::<DefaultBackend>(cfg, device)?;
        let model = DetectionCheckpointer::new(&cfg.output_dir, false)
            .load_model(model, weights, device)?;

        let samples = self.pick(records, cfg.seed);
        let params = PostprocessParams::from_test_config(&cfg.test)
            .with_score_thresh(self.score_threshold);
        let predictions = inference_on_records(&model, &samples, cfg.input.size, params, device)?;

        let mut written = Vec::with_capacity(samples.len());
        for (idx, (record, instances)) in samples.iter().zip(&predictions).enumerate() {
            let canvas = render_comparison(record, instances)?;
            let stem = record
                .file_name
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("image");
            let path = dest_dir.join(format!("{idx:02}_{stem}.png"));
            canvas.save(&path)?;
            tracing::debug!(path = %path.display(), detections = instances.len(), "wrote comparison");
            written.push(path);
        }
        tracing::info!(
            images = written.len(),
            threshold = self.score_threshold,
            dir = %dest_dir.display(),
            "rendered sample comparisons"
        );
        Ok(written)
    }

    /// `min(num_samples, len)` records, chosen by a seeded shuffle.
    pub fn pick(&self, records: &[DatasetRecord], seed: u64) -> Vec<DatasetRecord> {
        let mut order: Vec<usize> = (0..records.len()).collect();
        order.shuffle(&mut StdRng::seed_from_u64(seed));
        order
            .into_iter()
            .take(self.num_samples)
            .map(|i| records[i].clone())
            .collect()
    }
}

/// Two copies of the image next to each other, annotated.
pub fn render_comparison(record: &DatasetRecord, instances: &[Instance]) -> Result<RgbaImage> {
    let base = image::open(&record.file_name)?.to_rgba8();
    let (w, h) = base.dimensions();

    let mut gt = base.clone();
    for ann in &record.annotations {
        let mask = ann.mask(w, h)?;
        blend_mask(&mut gt, &mask, GT_COLOR);
        if let Some(bbox) = pixel_box(ann.bbox, (w, h)) {
            draw_rect(&mut gt, bbox, GT_COLOR, BOX_THICKNESS);
        }
    }

    let mut pred = base;
    for instance in instances {
        let color = class_color(instance.category);
        blend_mask(&mut pred, &instance.mask, color);
        if let Some(bbox) = pixel_box(instance.bbox, (w, h)) {
            draw_rect(&mut pred, bbox, color, BOX_THICKNESS);
        }
    }

    let mut canvas = RgbaImage::new(w * 2, h);
    image::imageops::replace(&mut canvas, &gt, 0, 0);
    image::imageops::replace(&mut canvas, &pred, i64::from(w), 0);
    Ok(canvas)
}

/// Pixel-space `xyxy` box clamped to the image, `None` when it is empty.
pub fn pixel_box(bbox: [f64; 4], dims: (u32, u32)) -> Option<[u32; 4]> {
    let (w, h) = dims;
    if w == 0 || h == 0 {
        return None;
    }
    let clamp = |v: f64, max: u32| -> u32 { v.max(0.0).min((max - 1) as f64) as u32 };
    let x0 = clamp(bbox[0], w);
    let y0 = clamp(bbox[1], h);
    let x1 = clamp(bbox[2] - 1.0, w);
    let y1 = clamp(bbox[3] - 1.0, h);
    if x0 > x1 || y0 > y1 {
        return None;
    }
    Some([x0, y0, x1, y1])
}

/// Draw a rectangle border with given thickness.
pub fn draw_rect(img: &mut RgbaImage, bbox_px: [u32; 4], color: Rgba<u8>, thickness: u32) {
    let (w, h) = img.dimensions();
    let [x0, y0, x1, y1] = bbox_px;
    for t in 0..thickness {
        let xx0 = x0.saturating_add(t);
        let yy0 = y0.saturating_add(t);
        let xx1 = x1.saturating_sub(t);
        let yy1 = y1.saturating_sub(t);
        if xx0 >= w || yy0 >= h || xx1 >= w || yy1 >= h || xx0 > xx1 || yy0 > yy1 {
            continue;
        }
        for x in xx0..=xx1 {
            img.put_pixel(x, yy0, color);
            img.put_pixel(x, yy1, color);
        }
        for y in yy0..=yy1 {
            img.put_pixel(xx0, y, color);
            img.put_pixel(xx1, y, color);
        }
    }
}

/// Tint the pixels covered by `mask`.
pub fn blend_mask(img: &mut RgbaImage, mask: &BitMask, color: Rgba<u8>) {
    let w = img.width().min(mask.width());
    let h = img.height().min(mask.height());
    for y in 0..h {
        for x in 0..w {
            if !mask.get(x, y) {
                continue;
            }
            let px = img.get_pixel_mut(x, y);
            for c in 0..3 {
                let blended =
                    px[c] as f32 * (1.0 - MASK_ALPHA) + color[c] as f32 * MASK_ALPHA;
                px[c] = blended.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::InstanceAnnotation;

    fn record(dir: &Path) -> DatasetRecord {
        let file_name = dir.join("scene.png");
        RgbaImage::from_pixel(10, 6, Rgba([0, 0, 0, 255]))
            .save(&file_name)
            .unwrap();
        DatasetRecord {
            image_id: 4,
            file_name,
            width: 10,
            height: 6,
            annotations: vec![InstanceAnnotation {
                bbox: [1.0, 1.0, 5.0, 5.0],
                category: 0,
                iscrowd: false,
                area: 16.0,
                segmentation: None,
            }],
        }
    }

    #[test]
    fn test_draw_rect_border_only() {
        let mut img = RgbaImage::from_pixel(6, 6, Rgba([0, 0, 0, 255]));
        draw_rect(&mut img, [1, 1, 4, 4], GT_COLOR, 1);
        assert_eq!(*img.get_pixel(1, 1), GT_COLOR);
        assert_eq!(*img.get_pixel(4, 2), GT_COLOR);
        assert_eq!(*img.get_pixel(2, 2), Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn test_pixel_box_clamps() {
        assert_eq!(pixel_box([-3.0, 0.0, 20.0, 4.0], (10, 6)), Some([0, 0, 9, 3]));
        assert_eq!(pixel_box([5.0, 5.0, 5.0, 5.0], (10, 6)), None);
    }

    #[test]
    fn test_render_puts_gt_left_and_predictions_right() {
        let dir = tempfile::tempdir().unwrap();
        let rec = record(dir.path());
        let instance = Instance {
            bbox: [6.0, 0.0, 10.0, 4.0],
            score: 0.9,
            category: 1,
            mask: BitMask::from_box([6.0, 0.0, 10.0, 4.0], 10, 6),
        };
        let canvas = render_comparison(&rec, &[instance]).unwrap();
        assert_eq!(canvas.dimensions(), (20, 6));
        // Ground-truth box edge on the left half.
        assert_eq!(*canvas.get_pixel(1, 1), GT_COLOR);
        // Prediction box edge on the right half, in its class colour.
        assert_eq!(*canvas.get_pixel(10 + 6, 0), class_color(1));
        // The prediction is not drawn on the ground-truth side.
        assert_ne!(*canvas.get_pixel(6, 0), class_color(1));
    }

    #[test]
    fn test_pick_caps_and_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let base = record(dir.path());
        let records: Vec<_> = (0..15)
            .map(|i| DatasetRecord {
                image_id: i,
                ..base.clone()
            })
            .collect();
        let cmp = SampleComparison::default();
        let a: Vec<u64> = cmp.pick(&records, 3).iter().map(|r| r.image_id).collect();
        let b: Vec<u64> = cmp.pick(&records, 3).iter().map(|r| r.image_id).collect();
        assert_eq!(a.len(), 10);
        assert_eq!(a, b);
        assert_eq!(cmp.pick(&records[..4], 3).len(), 4);
    }

    #[test]
    fn test_missing_weights_is_report_error() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RunConfig::default();
        let err = SampleComparison::default()
            .compare_gt(
                &cfg,
                &[],
                &dir.path().join("model_best.bin"),
                dir.path(),
                &Default::default(),
            )
            .unwrap_err();
        assert!(matches!(err, SegTrainError::Report(_)));
    }
}
