//! Binary instance masks: polygon rasterisation, COCO run-length encoding,
//! IoU, and conversion to and from the fixed-size grids the model predicts.

use crate::error::{Result, SegTrainError};
use serde::{Deserialize, Serialize};

/// Run-length encoded mask in COCO layout (column-major, first run counts zeros).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rle {
    /// `[height, width]`.
    pub size: [u32; 2],
    pub counts: Vec<u32>,
}

/// Row-major boolean mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitMask {
    width: u32,
    height: u32,
    bits: Vec<bool>,
}

impl BitMask {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            bits: vec![false; width as usize * height as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn get(&self, x: u32, y: u32) -> bool {
        if x >= self.width || y >= self.height {
            return false;
        }
        self.bits[(y * self.width + x) as usize]
    }

    pub fn set(&mut self, x: u32, y: u32, value: bool) {
        if x < self.width && y < self.height {
            self.bits[(y * self.width + x) as usize] = value;
        }
    }

    pub fn area(&self) -> u64 {
        self.bits.iter().filter(|b| **b).count() as u64
    }

    /// Pixels set in both masks. Masks of different sizes never overlap.
    pub fn intersection(&self, other: &BitMask) -> u64 {
        if self.width != other.width || self.height != other.height {
            return 0;
        }
        self.bits
            .iter()
            .zip(other.bits.iter())
            .filter(|(a, b)| **a && **b)
            .count() as u64
    }

    pub fn iou(&self, other: &BitMask) -> f64 {
        let inter = self.intersection(other) as f64;
        let union = self.area() as f64 + other.area() as f64 - inter;
        if union <= 0.0 { 0.0 } else { inter / union }
    }

    /// Tight `xyxy` box around the set pixels (exclusive max edge).
    pub fn bbox(&self) -> Option<[f64; 4]> {
        let mut min_x = u32::MAX;
        let mut min_y = u32::MAX;
        let mut max_x = 0u32;
        let mut max_y = 0u32;
        let mut any = false;
        for y in 0..self.height {
            for x in 0..self.width {
                if self.get(x, y) {
                    any = true;
                    min_x = min_x.min(x);
                    min_y = min_y.min(y);
                    max_x = max_x.max(x);
                    max_y = max_y.max(y);
                }
            }
        }
        any.then(|| {
            [
                min_x as f64,
                min_y as f64,
                (max_x + 1) as f64,
                (max_y + 1) as f64,
            ]
        })
    }

    /// Union of polygons given as flat `[x0, y0, x1, y1, ...]` lists.
    ///
    /// A pixel is inside when its centre is inside any polygon (even-odd rule).
    pub fn from_polygons(polygons: &[Vec<f64>], width: u32, height: u32) -> Self {
        let mut mask = Self::new(width, height);
        for poly in polygons {
            if poly.len() < 6 {
                continue;
            }
            let points: Vec<(f64, f64)> = poly.chunks_exact(2).map(|p| (p[0], p[1])).collect();
            for y in 0..height {
                let cy = y as f64 + 0.5;
                let mut crossings = Vec::new();
                for i in 0..points.len() {
                    let (x0, y0) = points[i];
                    let (x1, y1) = points[(i + 1) % points.len()];
                    if (y0 <= cy && y1 > cy) || (y1 <= cy && y0 > cy) {
                        crossings.push(x0 + (cy - y0) / (y1 - y0) * (x1 - x0));
                    }
                }
                crossings.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                for pair in crossings.chunks_exact(2) {
                    let start = (pair[0] - 0.5).ceil().max(0.0) as u32;
                    let end = (pair[1] - 0.5).ceil().min(width as f64).max(0.0) as u32;
                    for x in start..end {
                        mask.set(x, y, true);
                    }
                }
            }
        }
        mask
    }

    /// Filled rectangle, used when an annotation carries no segmentation.
    pub fn from_box(bbox: [f64; 4], width: u32, height: u32) -> Self {
        let mut mask = Self::new(width, height);
        let x0 = bbox[0].round().max(0.0) as u32;
        let y0 = bbox[1].round().max(0.0) as u32;
        let x1 = (bbox[2].round().max(0.0) as u32).min(width);
        let y1 = (bbox[3].round().max(0.0) as u32).min(height);
        for y in y0..y1 {
            for x in x0..x1 {
                mask.set(x, y, true);
            }
        }
        mask
    }

    pub fn from_rle(rle: &Rle) -> Result<Self> {
        let [height, width] = rle.size;
        let total = width as u64 * height as u64;
        let sum: u64 = rle.counts.iter().map(|c| *c as u64).sum();
        if sum != total {
            return Err(SegTrainError::dataset(format!(
                "RLE counts sum to {sum}, expected {total} for a {width}x{height} mask"
            )));
        }
        let mut mask = Self::new(width, height);
        let mut idx = 0u64;
        let mut value = false;
        for count in &rle.counts {
            if value {
                for i in idx..idx + *count as u64 {
                    // Column-major: index = x * height + y.
                    let x = (i / height as u64) as u32;
                    let y = (i % height as u64) as u32;
                    mask.set(x, y, true);
                }
            }
            idx += *count as u64;
            value = !value;
        }
        Ok(mask)
    }

    pub fn to_rle(&self) -> Rle {
        let mut counts = Vec::new();
        let mut current = false;
        let mut run = 0u32;
        for x in 0..self.width {
            for y in 0..self.height {
                let v = self.get(x, y);
                if v != current {
                    counts.push(run);
                    run = 0;
                    current = v;
                }
                run += 1;
            }
        }
        counts.push(run);
        Rle {
            size: [self.height, self.width],
            counts,
        }
    }

    /// Sample the mask on an `m x m` grid spanning `bbox` (pixel `xyxy`).
    pub fn crop_resize(&self, bbox: [f64; 4], m: usize) -> Vec<f32> {
        let bw = (bbox[2] - bbox[0]).max(1e-6);
        let bh = (bbox[3] - bbox[1]).max(1e-6);
        let mut grid = vec![0.0f32; m * m];
        for i in 0..m {
            for j in 0..m {
                let px = bbox[0] + (j as f64 + 0.5) * bw / m as f64;
                let py = bbox[1] + (i as f64 + 0.5) * bh / m as f64;
                if px < 0.0 || py < 0.0 {
                    continue;
                }
                if self.get(px.floor() as u32, py.floor() as u32) {
                    grid[i * m + j] = 1.0;
                }
            }
        }
        grid
    }

    /// Inverse of [`BitMask::crop_resize`]: paste an `m x m` probability grid
    /// into `bbox` of a `width x height` image, keeping cells `>= threshold`.
    pub fn paste(
        grid: &[f32],
        m: usize,
        bbox: [f64; 4],
        width: u32,
        height: u32,
        threshold: f32,
    ) -> Self {
        let mut mask = Self::new(width, height);
        if m == 0 || grid.len() < m * m {
            return mask;
        }
        let bw = bbox[2] - bbox[0];
        let bh = bbox[3] - bbox[1];
        if bw <= 0.0 || bh <= 0.0 {
            return mask;
        }
        let x_start = bbox[0].floor().max(0.0) as u32;
        let y_start = bbox[1].floor().max(0.0) as u32;
        let x_end = (bbox[2].ceil().max(0.0) as u32).min(width);
        let y_end = (bbox[3].ceil().max(0.0) as u32).min(height);
        for y in y_start..y_end {
            let v = ((y as f64 + 0.5 - bbox[1]) / bh * m as f64).floor();
            if v < 0.0 || v >= m as f64 {
                continue;
            }
            for x in x_start..x_end {
                let u = ((x as f64 + 0.5 - bbox[0]) / bw * m as f64).floor();
                if u < 0.0 || u >= m as f64 {
                    continue;
                }
                if grid[v as usize * m + u as usize] >= threshold {
                    mask.set(x, y, true);
                }
            }
        }
        mask
    }
}

/// Decode the COCO compressed counts string (LEB128-like, delta coded after index 2).
pub fn decode_rle_string(s: &str) -> Result<Vec<u32>> {
    let bytes = s.as_bytes();
    let mut counts: Vec<i64> = Vec::new();
    let mut p = 0usize;
    while p < bytes.len() {
        let mut x: i64 = 0;
        let mut k = 0u32;
        let mut more = true;
        while more {
            let byte = *bytes
                .get(p)
                .ok_or_else(|| SegTrainError::dataset("truncated compressed RLE string"))?;
            if !(48..48 + 64).contains(&byte) {
                return Err(SegTrainError::dataset(format!(
                    "invalid character {:?} in compressed RLE string",
                    byte as char
                )));
            }
            let c = (byte - 48) as i64;
            x |= (c & 0x1f) << (5 * k);
            more = c & 0x20 != 0;
            p += 1;
            k += 1;
            if !more && (c & 0x10) != 0 {
                x |= -1i64 << (5 * k);
            }
        }
        if counts.len() > 2 {
            x += counts[counts.len() - 2];
        }
        counts.push(x);
    }
    counts
        .into_iter()
        .map(|c| {
            u32::try_from(c)
                .map_err(|_| SegTrainError::dataset(format!("negative RLE run length {c}")))
        })
        .collect()
}

/// Encode counts in the COCO compressed string form.
pub fn encode_rle_string(counts: &[u32]) -> String {
    let mut out = String::new();
    for i in 0..counts.len() {
        let mut x = counts[i] as i64;
        if i > 2 {
            x -= counts[i - 2] as i64;
        }
        let mut more = true;
        while more {
            let mut c = x & 0x1f;
            x >>= 5;
            more = if c & 0x10 != 0 { x != -1 } else { x != 0 };
            if more {
                c |= 0x20;
            }
            out.push((c as u8 + 48) as char);
        }
    }
    out
}

/// IoU of two `xyxy` boxes.
pub fn box_iou(a: [f64; 4], b: [f64; 4]) -> f64 {
    let iw = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let ih = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = iw * ih;
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_square_polygon_area() {
        let poly = vec![vec![2.0, 2.0, 6.0, 2.0, 6.0, 6.0, 2.0, 6.0]];
        let mask = BitMask::from_polygons(&poly, 10, 10);
        assert_eq!(mask.area(), 16);
        assert_eq!(mask.bbox(), Some([2.0, 2.0, 6.0, 6.0]));
    }

    #[test]
    fn test_degenerate_polygon_ignored() {
        let mask = BitMask::from_polygons(&[vec![1.0, 1.0, 3.0, 3.0]], 5, 5);
        assert_eq!(mask.area(), 0);
        assert_eq!(mask.bbox(), None);
    }

    #[test]
    fn test_rle_is_column_major() {
        // 2x2 mask with only the bottom-left pixel set: column 0 is [0, 1].
        let rle = Rle {
            size: [2, 2],
            counts: vec![1, 1, 2],
        };
        let mask = BitMask::from_rle(&rle).unwrap();
        assert!(mask.get(0, 1));
        assert_eq!(mask.area(), 1);
        assert_eq!(mask.to_rle(), rle);
    }

    #[test]
    fn test_rle_count_mismatch_fails() {
        let rle = Rle {
            size: [2, 2],
            counts: vec![1, 1],
        };
        assert!(BitMask::from_rle(&rle).is_err());
    }

    #[test]
    fn test_known_compressed_string() {
        // Runs below index 3 are stored as-is, one character each.
        assert_eq!(decode_rle_string("022").unwrap(), vec![0, 2, 2]);
        assert_eq!(encode_rle_string(&[0, 2, 2]), "022");
    }

    #[test]
    fn test_paste_inverts_crop_resize() {
        let full = BitMask::from_box([4.0, 4.0, 12.0, 12.0], 16, 16);
        let grid = full.crop_resize([4.0, 4.0, 12.0, 12.0], 4);
        assert!(grid.iter().all(|v| *v == 1.0));
        let pasted = BitMask::paste(&grid, 4, [4.0, 4.0, 12.0, 12.0], 16, 16, 0.5);
        assert_eq!(pasted, full);
    }

    #[test]
    fn test_box_iou_identity_and_disjoint() {
        assert_eq!(box_iou([0.0, 0.0, 2.0, 2.0], [0.0, 0.0, 2.0, 2.0]), 1.0);
        assert_eq!(box_iou([0.0, 0.0, 1.0, 1.0], [2.0, 2.0, 3.0, 3.0]), 0.0);
    }

    proptest! {
        #[test]
        fn prop_compressed_rle_roundtrip(counts in proptest::collection::vec(0u32..5000, 0..40)) {
            let encoded = encode_rle_string(&counts);
            prop_assert_eq!(decode_rle_string(&encoded).unwrap(), counts);
        }

        #[test]
        fn prop_mask_rle_roundtrip(bits in proptest::collection::vec(any::<bool>(), 1..64)) {
            let width = bits.len() as u32;
            let mut mask = BitMask::new(width, 1);
            for (x, b) in bits.iter().enumerate() {
                mask.set(x as u32, 0, *b);
            }
            prop_assert_eq!(BitMask::from_rle(&mask.to_rle()).unwrap(), mask);
        }

        #[test]
        fn prop_box_iou_is_bounded(
            a in proptest::array::uniform4(0.0f64..100.0),
            b in proptest::array::uniform4(0.0f64..100.0),
        ) {
            let a = [a[0].min(a[2]), a[1].min(a[3]), a[0].max(a[2]), a[1].max(a[3])];
            let b = [b[0].min(b[2]), b[1].min(b[3]), b[0].max(b[2]), b[1].max(b[3])];
            let iou = box_iou(a, b);
            prop_assert!((0.0..=1.0).contains(&iou));
            prop_assert!((iou - box_iou(b, a)).abs() < 1e-12);
        }
    }
}
