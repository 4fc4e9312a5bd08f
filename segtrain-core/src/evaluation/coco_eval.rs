//! COCO-style average precision for boxes and masks.
//!
//! Matching and accumulation follow the reference COCO evaluation: ten IoU
//! thresholds from 0.50 to 0.95, 101 recall points, at most 100 detections
//! per image, crowd ground truth acting as ignore regions.

use crate::data::{BitMask, DatasetRecord, box_iou};
use crate::error::Result;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IouType {
    Bbox,
    Segm,
}

impl IouType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IouType::Bbox => "bbox",
            IouType::Segm => "segm",
        }
    }
}

/// A detection in pixel coordinates with a contiguous class id.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub image_id: u64,
    pub category: usize,
    /// `xyxy`
    pub bbox: [f64; 4],
    pub score: f32,
    pub mask: Option<BitMask>,
}

const AREA_RANGES: [(f64, f64); 4] = [
    (0.0, 1e10),
    (0.0, 32.0 * 32.0),
    (32.0 * 32.0, 96.0 * 96.0),
    (96.0 * 96.0, 1e10),
];
const MAX_DETS: usize = 100;
const NUM_RECALL: usize = 101;

fn iou_thresholds() -> Vec<f64> {
    (0..10).map(|i| 0.5 + 0.05 * i as f64).collect()
}

fn recall_thresholds() -> Vec<f64> {
    (0..NUM_RECALL).map(|i| i as f64 / 100.0).collect()
}

struct GtObj {
    area: f64,
    crowd: bool,
    bbox: [f64; 4],
    mask: Option<BitMask>,
}

struct DtObj {
    score: f32,
    area: f64,
    bbox: [f64; 4],
    mask: Option<BitMask>,
}

struct ImageEval {
    scores: Vec<f32>,
    /// `[threshold][detection]`
    matched: Vec<Vec<bool>>,
    ignored: Vec<Vec<bool>>,
    gt_ignored: Vec<bool>,
}

/// `precision[t][k][a]` holds the 101-point curve, or `None` when the
/// category has no ground truth in that area range.
struct Accumulated {
    precision: Vec<Vec<Vec<Option<Vec<f64>>>>>,
}

/// COCO metrics in percent: `AP`, `AP50`, `AP75`, `APs`, `APm`, `APl` and
/// `AP-<class>`; `NaN` where no ground truth exists.
pub fn evaluate(
    records: &[DatasetRecord],
    detections: &[Detection],
    iou_type: IouType,
    thing_classes: &[String],
) -> Result<BTreeMap<String, f64>> {
    let mut metrics = BTreeMap::new();
    if detections.is_empty() {
        tracing::warn!(task = iou_type.as_str(), "no predictions from the model");
        for name in ["AP", "AP50", "AP75", "APs", "APm", "APl"] {
            metrics.insert(name.to_string(), f64::NAN);
        }
        for class in thing_classes {
            metrics.insert(format!("AP-{class}"), f64::NAN);
        }
        return Ok(metrics);
    }

    let acc = accumulate(records, detections, iou_type, thing_classes.len())?;
    let t_all: Vec<usize> = (0..10).collect();
    let summaries = [
        ("AP", t_all.clone(), 0),
        ("AP50", vec![0], 0),
        ("AP75", vec![5], 0),
        ("APs", t_all.clone(), 1),
        ("APm", t_all.clone(), 2),
        ("APl", t_all.clone(), 3),
    ];
    for (name, thresholds, area) in summaries {
        let classes: Vec<usize> = (0..thing_classes.len()).collect();
        metrics.insert(name.to_string(), mean_precision(&acc, &thresholds, &classes, area));
    }
    for (k, class) in thing_classes.iter().enumerate() {
        metrics.insert(format!("AP-{class}"), mean_precision(&acc, &t_all, &[k], 0));
    }
    Ok(metrics)
}

fn mean_precision(acc: &Accumulated, thresholds: &[usize], classes: &[usize], area: usize) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for &t in thresholds {
        for &k in classes {
            if let Some(curve) = &acc.precision[t][k][area] {
                sum += curve.iter().sum::<f64>();
                count += curve.len();
            }
        }
    }
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64 * 100.0
    }
}

fn accumulate(
    records: &[DatasetRecord],
    detections: &[Detection],
    iou_type: IouType,
    num_classes: usize,
) -> Result<Accumulated> {
    let iou_thrs = iou_thresholds();
    let rec_thrs = recall_thresholds();

    let mut dets_by_key: BTreeMap<(u64, usize), Vec<&Detection>> = BTreeMap::new();
    for det in detections {
        dets_by_key.entry((det.image_id, det.category)).or_default().push(det);
    }

    // evals[k][a] holds one entry per image that has anything to evaluate.
    let mut evals: Vec<Vec<Vec<ImageEval>>> = (0..num_classes)
        .map(|_| (0..AREA_RANGES.len()).map(|_| Vec::new()).collect())
        .collect();

    for record in records {
        for k in 0..num_classes {
            let mut gts = Vec::new();
            for ann in record.annotations.iter().filter(|a| a.category == k) {
                gts.push(GtObj {
                    area: ann.area,
                    crowd: ann.iscrowd,
                    bbox: ann.bbox,
                    mask: match iou_type {
                        IouType::Segm => Some(ann.mask(record.width, record.height)?),
                        IouType::Bbox => None,
                    },
                });
            }
            let mut dts: Vec<DtObj> = dets_by_key
                .get(&(record.image_id, k))
                .map(|v| v.as_slice())
                .unwrap_or_default()
                .iter()
                .map(|d| DtObj {
                    score: d.score,
                    area: match (iou_type, &d.mask) {
                        (IouType::Segm, Some(m)) => m.area() as f64,
                        (IouType::Segm, None) => 0.0,
                        (IouType::Bbox, _) => (d.bbox[2] - d.bbox[0]) * (d.bbox[3] - d.bbox[1]),
                    },
                    bbox: d.bbox,
                    mask: d.mask.clone(),
                })
                .collect();
            if gts.is_empty() && dts.is_empty() {
                continue;
            }
            dts.sort_by(|a, b| b.score.total_cmp(&a.score));
            dts.truncate(MAX_DETS);
            let ious = compute_ious(&dts, &gts, iou_type);
            for (a, range) in AREA_RANGES.iter().enumerate() {
                evals[k][a].push(evaluate_image(&dts, &gts, &ious, *range, &iou_thrs));
            }
        }
    }

    let mut precision = vec![vec![vec![None; AREA_RANGES.len()]; num_classes]; iou_thrs.len()];
    for (k, per_area) in evals.iter().enumerate() {
        for (a, images) in per_area.iter().enumerate() {
            let npig = images
                .iter()
                .flat_map(|e| e.gt_ignored.iter())
                .filter(|ig| !**ig)
                .count();
            if npig == 0 {
                continue;
            }
            let mut order: Vec<(usize, usize)> = images
                .iter()
                .enumerate()
                .flat_map(|(i, e)| (0..e.scores.len()).map(move |d| (i, d)))
                .collect();
            order.sort_by(|x, y| images[y.0].scores[y.1].total_cmp(&images[x.0].scores[x.1]));

            for t in 0..iou_thrs.len() {
                let mut tp = 0.0f64;
                let mut fp = 0.0f64;
                let mut recall = Vec::with_capacity(order.len());
                let mut prec = Vec::with_capacity(order.len());
                for &(i, d) in &order {
                    let e = &images[i];
                    if !e.ignored[t][d] {
                        if e.matched[t][d] {
                            tp += 1.0;
                        } else {
                            fp += 1.0;
                        }
                    }
                    recall.push(tp / npig as f64);
                    prec.push(tp / (tp + fp + f64::EPSILON));
                }
                for i in (1..prec.len()).rev() {
                    if prec[i] > prec[i - 1] {
                        prec[i - 1] = prec[i];
                    }
                }
                let mut curve = vec![0.0; rec_thrs.len()];
                for (r, thr) in rec_thrs.iter().enumerate() {
                    let idx = recall.partition_point(|rc| rc < thr);
                    match prec.get(idx) {
                        Some(p) => curve[r] = *p,
                        None => break,
                    }
                }
                precision[t][k][a] = Some(curve);
            }
        }
    }
    Ok(Accumulated { precision })
}

/// `ious[d][g]`; against crowd ground truth the union is the detection area.
fn compute_ious(dts: &[DtObj], gts: &[GtObj], iou_type: IouType) -> Vec<Vec<f64>> {
    dts.iter()
        .map(|d| {
            gts.iter()
                .map(|g| match iou_type {
                    IouType::Bbox => {
                        if g.crowd {
                            let inter = box_intersection(d.bbox, g.bbox);
                            let area = (d.bbox[2] - d.bbox[0]) * (d.bbox[3] - d.bbox[1]);
                            if area > 0.0 { inter / area } else { 0.0 }
                        } else {
                            box_iou(d.bbox, g.bbox)
                        }
                    }
                    IouType::Segm => match (&d.mask, &g.mask) {
                        (Some(dm), Some(gm)) => {
                            if g.crowd {
                                let area = dm.area();
                                if area > 0 {
                                    dm.intersection(gm) as f64 / area as f64
                                } else {
                                    0.0
                                }
                            } else {
                                dm.iou(gm)
                            }
                        }
                        _ => 0.0,
                    },
                })
                .collect()
        })
        .collect()
}

fn box_intersection(a: [f64; 4], b: [f64; 4]) -> f64 {
    let w = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let h = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    w * h
}

fn evaluate_image(
    dts: &[DtObj],
    gts: &[GtObj],
    ious: &[Vec<f64>],
    range: (f64, f64),
    iou_thrs: &[f64],
) -> ImageEval {
    let out_of_range = |area: f64| area < range.0 || area > range.1;
    // Non-ignored ground truth first.
    let gt_ignore_raw: Vec<bool> = gts.iter().map(|g| g.crowd || out_of_range(g.area)).collect();
    let mut gt_order: Vec<usize> = (0..gts.len()).collect();
    gt_order.sort_by_key(|&g| gt_ignore_raw[g]);
    let gt_ignored: Vec<bool> = gt_order.iter().map(|&g| gt_ignore_raw[g]).collect();

    let n_t = iou_thrs.len();
    let mut matched = vec![vec![false; dts.len()]; n_t];
    let mut ignored = vec![vec![false; dts.len()]; n_t];
    let mut gt_taken = vec![vec![false; gts.len()]; n_t];

    for (t, &thr) in iou_thrs.iter().enumerate() {
        for d in 0..dts.len() {
            let mut best = thr.min(1.0 - 1e-10);
            let mut m: Option<usize> = None;
            for (pos, &g) in gt_order.iter().enumerate() {
                if gt_taken[t][pos] && !gts[g].crowd {
                    continue;
                }
                if let Some(prev) = m {
                    if !gt_ignored[prev] && gt_ignored[pos] {
                        break;
                    }
                }
                if ious[d][g] < best {
                    continue;
                }
                best = ious[d][g];
                m = Some(pos);
            }
            if let Some(pos) = m {
                ignored[t][d] = gt_ignored[pos];
                matched[t][d] = true;
                gt_taken[t][pos] = true;
            }
        }
        for (d, det) in dts.iter().enumerate() {
            if !matched[t][d] && out_of_range(det.area) {
                ignored[t][d] = true;
            }
        }
    }

    ImageEval {
        scores: dts.iter().map(|d| d.score).collect(),
        matched,
        ignored,
        gt_ignored,
    }
}
