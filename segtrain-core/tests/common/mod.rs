//! Tiny synthetic COCO datasets for driver-level tests.

#![allow(dead_code)]

use image::{Rgb, RgbImage};
use segtrain_core::comm::{Comm, World};
use segtrain_core::config::ConfigSources;
use segtrain_core::tracking::NullTracker;
use segtrain_core::workspace::DeletionApprover;
use segtrain_core::{DriverArgs, RunContext};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

pub const WIDTH: u32 = 32;
pub const HEIGHT: u32 = 24;

pub struct Fixture {
    pub dir: TempDir,
    pub train_labels: PathBuf,
    pub test_labels: PathBuf,
    pub classes: Vec<String>,
}

impl Fixture {
    pub fn new(num_train: usize, num_test: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let train_labels = write_split(&dir.path().join("train"), num_train, 0);
        let test_labels = write_split(&dir.path().join("test"), num_test, 1000);
        Self {
            dir,
            train_labels,
            test_labels,
            classes: vec!["cat".to_string(), "dog".to_string()],
        }
    }

    pub fn output_dir(&self) -> PathBuf {
        self.dir.path().join("output")
    }

    /// Driver arguments for a very short run; `extra` overrides come last.
    pub fn args(&self, extra: &[&str]) -> DriverArgs {
        let mut overrides: Vec<String> = [
            "solver.max_iter=2",
            "solver.ims_per_batch=2",
            "solver.checkpoint_period=1",
            "solver.warmup_iters=1",
            "input.size=32",
            "model.hidden_dim=16",
            "model.max_detections=4",
            "model.mask_resolution=7",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        overrides.extend(extra.iter().map(|s| s.to_string()));

        DriverArgs {
            train_label_path: self.train_labels.clone(),
            test_label_path: self.test_labels.clone(),
            train_image_root: None,
            test_image_root: None,
            thing_classes: self.classes.clone(),
            config: ConfigSources {
                config_file: None,
                env_prefix: None,
                overrides,
                output_dir: Some(self.output_dir()),
            },
            resume: false,
            eval_only: false,
        }
    }
}

/// Single-process context with an in-memory tracker.
pub fn local_context(approver: Arc<dyn DeletionApprover>) -> (RunContext, Arc<NullTracker>) {
    let tracker = Arc::new(NullTracker::new());
    let ctx = RunContext::new(World::single(), Comm::Local, tracker.clone(), approver);
    (ctx, tracker)
}

/// `n` images, each with one "cat" square and one "dog" rectangle.
fn write_split(dir: &Path, n: usize, first_id: u64) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let mut images = Vec::new();
    let mut annotations = Vec::new();
    for i in 0..n as u64 {
        let id = first_id + i;
        let file_name = format!("img_{id}.png");
        let shift = (i % 4) as u32;
        let cat = [2 + shift, 2, 8, 8];
        let dog = [16, 10 + shift, 12, 10];

        let mut img = RgbImage::from_pixel(WIDTH, HEIGHT, Rgb([20, 20, 20]));
        paint(&mut img, cat, Rgb([220, 40, 40]));
        paint(&mut img, dog, Rgb([40, 40, 220]));
        img.save(dir.join(&file_name)).unwrap();

        images.push(json!({"id": id, "file_name": file_name, "width": WIDTH, "height": HEIGHT}));
        for (k, (category_id, [x, y, w, h])) in [(1, cat), (2, dog)].into_iter().enumerate() {
            annotations.push(json!({
                "id": id * 10 + k as u64,
                "image_id": id,
                "category_id": category_id,
                "bbox": [x, y, w, h],
                "area": w * h,
                "iscrowd": 0,
                "segmentation": [[x, y, x + w, y, x + w, y + h, x, y + h]],
            }));
        }
    }
    let labels = json!({
        "images": images,
        "annotations": annotations,
        "categories": [{"id": 1, "name": "cat"}, {"id": 2, "name": "dog"}],
    });
    let path = dir.join("_annotations.coco.json");
    std::fs::write(&path, serde_json::to_string_pretty(&labels).unwrap()).unwrap();
    path
}

fn paint(img: &mut RgbImage, [x, y, w, h]: [u32; 4], color: Rgb<u8>) {
    for yy in y..(y + h).min(HEIGHT) {
        for xx in x..(x + w).min(WIDTH) {
            img.put_pixel(xx, yy, color);
        }
    }
}
