//! COCO instances files: parsing, validation and conversion into
//! per-image [`DatasetRecord`]s with contiguous class ids.

use crate::data::mask::{BitMask, Rle, decode_rle_string};
use crate::error::{Result, SegTrainError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Top-level COCO instances file. `info` and `licenses` are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CocoFile {
    #[serde(default)]
    pub images: Vec<CocoImage>,
    #[serde(default)]
    pub annotations: Vec<CocoAnnotation>,
    #[serde(default)]
    pub categories: Vec<CocoCategory>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CocoImage {
    pub id: u64,
    pub file_name: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CocoCategory {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub supercategory: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CocoAnnotation {
    #[serde(default)]
    pub id: u64,
    pub image_id: u64,
    pub category_id: u64,
    /// `[x, y, width, height]` in pixels.
    pub bbox: [f64; 4],
    #[serde(default)]
    pub area: Option<f64>,
    #[serde(default)]
    pub iscrowd: u8,
    #[serde(default)]
    pub segmentation: Option<Segmentation>,
}

/// Polygon list, or an RLE object with plain or compressed counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Segmentation {
    Polygons(Vec<Vec<f64>>),
    Rle(RleObject),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RleObject {
    /// `[height, width]`.
    pub size: [u32; 2],
    pub counts: RleCounts,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RleCounts {
    Plain(Vec<u32>),
    Compressed(String),
}

impl Segmentation {
    /// Rasterise into a `width x height` mask.
    pub fn to_mask(&self, width: u32, height: u32) -> Result<BitMask> {
        match self {
            Segmentation::Polygons(polys) => Ok(BitMask::from_polygons(polys, width, height)),
            Segmentation::Rle(obj) => {
                let counts = match &obj.counts {
                    RleCounts::Plain(c) => c.clone(),
                    RleCounts::Compressed(s) => decode_rle_string(s)?,
                };
                let mask = BitMask::from_rle(&Rle {
                    size: obj.size,
                    counts,
                })?;
                if mask.width() != width || mask.height() != height {
                    return Err(SegTrainError::dataset(format!(
                        "RLE size {}x{} does not match image size {width}x{height}",
                        mask.width(),
                        mask.height()
                    )));
                }
                Ok(mask)
            }
        }
    }
}

/// One annotated instance with its class mapped to a contiguous id.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceAnnotation {
    /// `xyxy` in pixels.
    pub bbox: [f64; 4],
    pub category: usize,
    pub iscrowd: bool,
    pub area: f64,
    pub segmentation: Option<Segmentation>,
}

impl InstanceAnnotation {
    /// Instance mask; falls back to the filled box without a segmentation.
    pub fn mask(&self, width: u32, height: u32) -> Result<BitMask> {
        match &self.segmentation {
            Some(seg) => seg.to_mask(width, height),
            None => Ok(BitMask::from_box(self.bbox, width, height)),
        }
    }
}

/// One image of a registered dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetRecord {
    pub image_id: u64,
    pub file_name: PathBuf,
    pub width: u32,
    pub height: u32,
    pub annotations: Vec<InstanceAnnotation>,
}

impl DatasetRecord {
    pub fn has_trainable_instances(&self) -> bool {
        self.annotations.iter().any(|a| !a.iscrowd)
    }
}

/// Parsed dataset plus the contiguous-id -> COCO category id table.
#[derive(Debug, Clone)]
pub struct LoadedCoco {
    pub records: Vec<DatasetRecord>,
    pub category_ids: Vec<u64>,
}

/// Load a COCO instances file, resolving image paths against `image_root`.
pub fn load_coco_json(
    json_file: &Path,
    image_root: &Path,
    thing_classes: &[String],
) -> Result<LoadedCoco> {
    let text = std::fs::read_to_string(json_file).map_err(|e| {
        SegTrainError::dataset(format!(
            "failed to read label file {}: {e}",
            json_file.display()
        ))
    })?;
    let coco: CocoFile = serde_json::from_str(&text).map_err(|e| {
        SegTrainError::dataset(format!(
            "malformed COCO label file {}: {e}",
            json_file.display()
        ))
    })?;
    build_records(coco, image_root, thing_classes)
}

pub fn build_records(
    coco: CocoFile,
    image_root: &Path,
    thing_classes: &[String],
) -> Result<LoadedCoco> {
    if thing_classes.is_empty() {
        return Err(SegTrainError::dataset("thing_classes must not be empty"));
    }

    let mut categories = coco.categories.clone();
    categories.sort_by_key(|c| c.id);
    if categories.len() > thing_classes.len() {
        return Err(SegTrainError::dataset(format!(
            "label file defines {} categories but only {} class names were given",
            categories.len(),
            thing_classes.len()
        )));
    }
    let mut contiguous: HashMap<u64, usize> = HashMap::new();
    let mut category_ids = Vec::with_capacity(thing_classes.len());
    for (idx, cat) in categories.iter().enumerate() {
        if cat.name != thing_classes[idx] {
            tracing::warn!(
                category_id = cat.id,
                file_name = %cat.name,
                given = %thing_classes[idx],
                "category name differs from the given class name"
            );
        }
        contiguous.insert(cat.id, idx);
        category_ids.push(cat.id);
    }
    // Classes with no category entry still get a stable id for result files.
    let mut next_id = categories.last().map(|c| c.id + 1).unwrap_or(1);
    while category_ids.len() < thing_classes.len() {
        category_ids.push(next_id);
        next_id += 1;
    }

    let mut seen = HashSet::new();
    let mut by_image: BTreeMap<u64, DatasetRecord> = BTreeMap::new();
    let mut order = Vec::with_capacity(coco.images.len());
    for img in &coco.images {
        if !seen.insert(img.id) {
            return Err(SegTrainError::dataset(format!(
                "duplicate image id {}",
                img.id
            )));
        }
        order.push(img.id);
        by_image.insert(
            img.id,
            DatasetRecord {
                image_id: img.id,
                file_name: image_root.join(&img.file_name),
                width: img.width,
                height: img.height,
                annotations: Vec::new(),
            },
        );
    }

    for ann in coco.annotations {
        let record = by_image.get_mut(&ann.image_id).ok_or_else(|| {
            SegTrainError::dataset(format!(
                "annotation {} references unknown image {}",
                ann.id, ann.image_id
            ))
        })?;
        let category = *contiguous.get(&ann.category_id).ok_or_else(|| {
            SegTrainError::dataset(format!(
                "annotation {} references unknown category {}",
                ann.id, ann.category_id
            ))
        })?;
        let [x, y, w, h] = ann.bbox;
        if w < 0.0 || h < 0.0 || !x.is_finite() || !y.is_finite() {
            return Err(SegTrainError::dataset(format!(
                "annotation {} has an invalid bbox {:?}",
                ann.id, ann.bbox
            )));
        }
        let area = match ann.area {
            Some(a) => a,
            None => match &ann.segmentation {
                Some(seg) => seg.to_mask(record.width, record.height)?.area() as f64,
                None => w * h,
            },
        };
        record.annotations.push(InstanceAnnotation {
            bbox: [x, y, x + w, y + h],
            category,
            iscrowd: ann.iscrowd != 0,
            area,
            segmentation: ann.segmentation,
        });
    }

    let records = order
        .into_iter()
        .filter_map(|id| by_image.remove(&id))
        .collect();
    Ok(LoadedCoco {
        records,
        category_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classes(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    const SAMPLE: &str = r#"{
        "images": [{"id": 7, "file_name": "a.png", "width": 10, "height": 10}],
        "categories": [{"id": 3, "name": "cat"}, {"id": 1, "name": "dog"}],
        "annotations": [
            {"id": 1, "image_id": 7, "category_id": 3, "bbox": [1, 1, 4, 4],
             "segmentation": [[1, 1, 5, 1, 5, 5, 1, 5]], "iscrowd": 0},
            {"id": 2, "image_id": 7, "category_id": 1, "bbox": [0, 0, 2, 2],
             "segmentation": {"size": [10, 10], "counts": [0, 2, 8, 2, 88]}, "area": 4, "iscrowd": 1}
        ]
    }"#;

    #[test]
    fn test_categories_map_by_ascending_id() {
        let coco: CocoFile = serde_json::from_str(SAMPLE).unwrap();
        let loaded = build_records(coco, Path::new("/data"), &classes(&["dog", "cat"])).unwrap();
        assert_eq!(loaded.category_ids, vec![1, 3]);
        let rec = &loaded.records[0];
        assert_eq!(rec.file_name, PathBuf::from("/data/a.png"));
        assert_eq!(rec.annotations[0].category, 1);
        assert_eq!(rec.annotations[0].bbox, [1.0, 1.0, 5.0, 5.0]);
        // Area derived from the polygon when absent.
        assert_eq!(rec.annotations[0].area, 16.0);
        assert!(rec.annotations[1].iscrowd);
        assert_eq!(rec.annotations[1].mask(10, 10).unwrap().area(), 4);
    }

    #[test]
    fn test_too_many_categories_fails() {
        let coco: CocoFile = serde_json::from_str(SAMPLE).unwrap();
        assert!(build_records(coco, Path::new("."), &classes(&["dog"])).is_err());
    }

    #[test]
    fn test_unknown_image_fails() {
        let mut coco: CocoFile = serde_json::from_str(SAMPLE).unwrap();
        coco.annotations[0].image_id = 99;
        assert!(build_records(coco, Path::new("."), &classes(&["dog", "cat"])).is_err());
    }

    #[test]
    fn test_compressed_rle_segmentation() {
        let seg: Segmentation =
            serde_json::from_str(r#"{"size": [2, 2], "counts": "11"}"#).unwrap();
        assert!(matches!(
            &seg,
            Segmentation::Rle(RleObject {
                counts: RleCounts::Compressed(_),
                ..
            })
        ));
        // "1" decodes to run length 1: [1 zero, 1 one], which is short of 4 pixels.
        assert!(seg.to_mask(2, 2).is_err());
        let seg: Segmentation =
            serde_json::from_str(r#"{"size": [2, 2], "counts": "112"}"#).unwrap();
        assert_eq!(seg.to_mask(2, 2).unwrap().area(), 1);
    }

    #[test]
    fn test_missing_file_is_dataset_error() {
        let err = load_coco_json(
            Path::new("/no/such/labels.json"),
            Path::new("."),
            &classes(&["a"]),
        )
        .unwrap_err();
        assert!(matches!(err, SegTrainError::Dataset(_)));
    }
}
