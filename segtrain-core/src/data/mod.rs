//! Datasets: COCO parsing, masks, the registry and the data loaders.

pub mod coco;
pub mod loader;
pub mod mask;
pub mod registry;

pub use coco::{DatasetRecord, InstanceAnnotation, Segmentation};
pub use loader::{Batch, SampleTargets, TrainLoader, inference_shard, load_image_chw, prepare_targets};
pub use mask::{BitMask, Rle, box_iou, decode_rle_string, encode_rle_string};
pub use registry::{DatasetMetadata, DatasetRegistry, register_dataset};
