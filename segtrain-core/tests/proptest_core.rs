//! Property-based tests for geometry, evaluation and the LR schedule.

use proptest::prelude::*;

use segtrain_core::config::SolverConfig;
use segtrain_core::data::{BitMask, DatasetRecord, InstanceAnnotation, box_iou};
use segtrain_core::engine::learning_rate;
use segtrain_core::evaluation::{Detection, IouType, evaluate};
use std::path::PathBuf;

fn rect() -> impl Strategy<Value = [u32; 4]> {
    (0u32..40, 0u32..40, 1u32..24, 1u32..24).prop_map(|(x, y, w, h)| [x, y, w, h])
}

// --- Masks and boxes ---

proptest! {
    #[test]
    fn rectangle_polygon_area_is_exact([x, y, w, h] in rect()) {
        let (x0, y0) = (x as f64, y as f64);
        let (x1, y1) = ((x + w) as f64, (y + h) as f64);
        let mask = BitMask::from_polygons(&[vec![x0, y0, x1, y0, x1, y1, x0, y1]], 64, 64);
        prop_assert_eq!(mask.area(), (w * h) as u64);
        prop_assert_eq!(mask.bbox(), Some([x0, y0, x1, y1]));
    }

    #[test]
    fn mask_iou_matches_box_iou_for_rectangles(a in rect(), b in rect()) {
        let to_xyxy = |[x, y, w, h]: [u32; 4]| [x as f64, y as f64, (x + w) as f64, (y + h) as f64];
        let (ba, bb) = (to_xyxy(a), to_xyxy(b));
        let ma = BitMask::from_box(ba, 64, 64);
        let mb = BitMask::from_box(bb, 64, 64);
        prop_assert!((ma.iou(&mb) - box_iou(ba, bb)).abs() < 1e-9);
    }
}

// --- COCO evaluation ---

fn records(boxes: &[[u32; 4]]) -> Vec<DatasetRecord> {
    boxes
        .iter()
        .enumerate()
        .map(|(i, &[x, y, w, h])| DatasetRecord {
            image_id: i as u64 + 1,
            file_name: PathBuf::from(format!("{i}.png")),
            width: 64,
            height: 64,
            annotations: vec![InstanceAnnotation {
                bbox: [x as f64, y as f64, (x + w) as f64, (y + h) as f64],
                category: i % 2,
                iscrowd: false,
                area: (w * h) as f64,
                segmentation: None,
            }],
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn perfect_predictions_score_100(boxes in proptest::collection::vec(rect(), 2..6)) {
        let records = records(&boxes);
        let detections: Vec<Detection> = records
            .iter()
            .map(|r| {
                let ann = &r.annotations[0];
                Detection {
                    image_id: r.image_id,
                    category: ann.category,
                    bbox: ann.bbox,
                    score: 0.9,
                    mask: Some(BitMask::from_box(ann.bbox, 64, 64)),
                }
            })
            .collect();
        let classes = vec!["a".to_string(), "b".to_string()];
        for iou_type in [IouType::Bbox, IouType::Segm] {
            let metrics = evaluate(&records, &detections, iou_type, &classes).unwrap();
            prop_assert!((metrics["AP"] - 100.0).abs() < 1e-6);
            prop_assert!((metrics["AP50"] - 100.0).abs() < 1e-6);
        }
    }
}

// --- Learning-rate schedule ---

proptest! {
    #[test]
    fn learning_rate_never_exceeds_base(
        iteration in 0usize..10_000,
        warmup in 0usize..500,
        step in 1usize..5000,
    ) {
        let solver = SolverConfig {
            base_lr: 0.02,
            warmup_iters: warmup,
            steps: vec![step],
            ..SolverConfig::default()
        };
        let lr = learning_rate(&solver, iteration);
        prop_assert!(lr > 0.0);
        prop_assert!(lr <= solver.base_lr + 1e-12);
        if iteration >= warmup.max(step) {
            prop_assert!((lr - solver.base_lr * solver.gamma).abs() < 1e-12);
        }
    }
}
