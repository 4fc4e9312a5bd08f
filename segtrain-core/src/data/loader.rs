use crate::data::coco::DatasetRecord;
use crate::error::{Result, SegTrainError};
use burn::tensor::{Tensor, TensorData, backend::Backend};
use image::imageops::FilterType;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

/// Ground truth for one training image, in normalised `xyxy` coordinates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleTargets {
    pub boxes: Vec<[f32; 4]>,
    pub classes: Vec<usize>,
    /// One `mask_resolution x mask_resolution` grid per instance, row-major.
    pub masks: Vec<Vec<f32>>,
}

/// A collated batch: images on the device, targets on the host.
#[derive(Debug, Clone)]
pub struct Batch<B: Backend> {
    /// Shape `[batch, 3, size, size]`, values in `[0, 1]`.
    pub images: Tensor<B, 4>,
    pub targets: Vec<SampleTargets>,
}

/// Decode an image, resize it to `size x size` and return CHW floats plus the
/// original `(width, height)`.
pub fn load_image_chw(path: &Path, size: usize) -> Result<(Vec<f32>, (u32, u32))> {
    let img = image::open(path)
        .map_err(|e| SegTrainError::dataset(format!("failed to open image {}: {e}", path.display())))?
        .to_rgb8();
    let dims = img.dimensions();
    let resized = image::imageops::resize(&img, size as u32, size as u32, FilterType::Triangle);

    let mut buf = Vec::with_capacity(3 * size * size);
    for c in 0..3 {
        for y in 0..size as u32 {
            for x in 0..size as u32 {
                buf.push(resized.get_pixel(x, y)[c] as f32 / 255.0);
            }
        }
    }
    Ok((buf, dims))
}

/// Build training targets for a record, skipping crowd and degenerate instances.
pub fn prepare_targets(record: &DatasetRecord, mask_resolution: usize) -> Result<SampleTargets> {
    let w = record.width.max(1) as f64;
    let h = record.height.max(1) as f64;
    let mut targets = SampleTargets::default();
    for ann in &record.annotations {
        if ann.iscrowd {
            continue;
        }
        let [x0, y0, x1, y1] = ann.bbox;
        if x1 - x0 <= 0.0 || y1 - y0 <= 0.0 {
            continue;
        }
        let mask = ann.mask(record.width, record.height)?;
        targets.boxes.push([
            (x0 / w).clamp(0.0, 1.0) as f32,
            (y0 / h).clamp(0.0, 1.0) as f32,
            (x1 / w).clamp(0.0, 1.0) as f32,
            (y1 / h).clamp(0.0, 1.0) as f32,
        ]);
        targets.classes.push(ann.category);
        targets.masks.push(mask.crop_resize(ann.bbox, mask_resolution));
    }
    Ok(targets)
}

/// Infinite, shuffled, rank-sharded stream of training batches.
pub struct TrainLoader {
    records: Arc<Vec<DatasetRecord>>,
    shard: Vec<usize>,
    order: Vec<usize>,
    cursor: usize,
    batch_size: usize,
    input_size: usize,
    mask_resolution: usize,
    rng: StdRng,
}

impl TrainLoader {
    pub fn new(
        records: Arc<Vec<DatasetRecord>>,
        rank: usize,
        world_size: usize,
        batch_size: usize,
        input_size: usize,
        mask_resolution: usize,
        seed: u64,
    ) -> Result<Self> {
        let world_size = world_size.max(1);
        let usable: Vec<usize> = records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.has_trainable_instances())
            .map(|(i, _)| i)
            .collect();
        if usable.is_empty() {
            return Err(SegTrainError::dataset(
                "training set has no images with non-crowd annotations",
            ));
        }
        let skipped = records.len() - usable.len();
        if skipped > 0 {
            tracing::info!(skipped, "removed images without usable annotations");
        }
        let shard: Vec<usize> = usable
            .into_iter()
            .enumerate()
            .filter(|(pos, _)| pos % world_size == rank)
            .map(|(_, idx)| idx)
            .collect();
        if shard.is_empty() {
            return Err(SegTrainError::dataset(format!(
                "rank {rank} received no training images; the dataset is smaller than the world size {world_size}"
            )));
        }
        Ok(Self {
            records,
            order: Vec::new(),
            shard,
            cursor: 0,
            batch_size: batch_size.max(1),
            input_size,
            mask_resolution,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn shard_len(&self) -> usize {
        self.shard.len()
    }

    fn next_index(&mut self) -> usize {
        if self.cursor >= self.order.len() {
            self.order = self.shard.clone();
            self.order.shuffle(&mut self.rng);
            self.cursor = 0;
        }
        let idx = self.order[self.cursor];
        self.cursor += 1;
        idx
    }

    pub fn next_batch<B: Backend>(&mut self, device: &B::Device) -> Result<Batch<B>> {
        let size = self.input_size;
        let mut pixels = Vec::with_capacity(self.batch_size * 3 * size * size);
        let mut targets = Vec::with_capacity(self.batch_size);
        for _ in 0..self.batch_size {
            let idx = self.next_index();
            let record = &self.records[idx];
            let (chw, _) = load_image_chw(&record.file_name, size)?;
            pixels.extend_from_slice(&chw);
            targets.push(prepare_targets(record, self.mask_resolution)?);
        }
        let images = Tensor::<B, 4>::from_data(
            TensorData::new(pixels, [self.batch_size, 3, size, size]),
            device,
        );
        Ok(Batch { images, targets })
    }
}

/// Contiguous slice of `len` items assigned to `rank` for inference.
pub fn inference_shard(len: usize, rank: usize, world_size: usize) -> Range<usize> {
    let world_size = world_size.max(1);
    let per = len.div_ceil(world_size);
    let start = (rank * per).min(len);
    let end = (start + per).min(len);
    start..end
}
