//! Small single-shot instance-segmentation network.
//!
//! Shapes (normalized coords):
//! - Input images: `[N, 3, S, S]`
//! - Boxes: `[N, K, 4]` (x_min, y_min, x_max, y_max in 0..1)
//! - Objectness logits: `[N, K]`
//! - Class logits: `[N, K, C]`
//! - Mask logits: `[N, K, M * M]`
//!
//! `K` is the number of detection slots, `C` the class count and `M` the
//! mask resolution.

use crate::config::RunConfig;
use crate::error::{Result, SegTrainError};
use burn::module::Module;
use burn::nn;
use burn::nn::PaddingConfig2d;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::tensor::activation::{relu, sigmoid};
use burn::tensor::{Tensor, backend::Backend};

const POOLED: usize = 4;
const CHANNELS: [usize; 4] = [3, 16, 32, 64];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaskDetectorConfig {
    pub num_classes: usize,
    pub max_detections: usize,
    pub hidden_dim: usize,
    pub mask_resolution: usize,
}

impl MaskDetectorConfig {
    pub fn from_run_config(cfg: &RunConfig) -> Self {
        Self {
            num_classes: cfg.model.num_classes,
            max_detections: cfg.model.max_detections,
            hidden_dim: cfg.model.hidden_dim,
            mask_resolution: cfg.model.mask_resolution,
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> MaskDetector<B> {
        MaskDetector::new(*self, device)
    }
}

#[derive(Module, Debug)]
pub struct MaskDetector<B: Backend> {
    convs: Vec<Conv2d<B>>,
    pool: AdaptiveAvgPool2d,
    trunk: nn::Linear<B>,
    box_head: nn::Linear<B>,
    objectness_head: nn::Linear<B>,
    class_head: nn::Linear<B>,
    mask_head: nn::Linear<B>,
    num_classes: usize,
    max_detections: usize,
    mask_resolution: usize,
    hidden_dim: usize,
}

/// Raw network outputs for a batch.
#[derive(Debug, Clone)]
pub struct DetectorOutput<B: Backend> {
    pub boxes: Tensor<B, 3>,
    pub objectness_logits: Tensor<B, 2>,
    pub class_logits: Tensor<B, 3>,
    pub mask_logits: Tensor<B, 3>,
}

impl<B: Backend> MaskDetector<B> {
    pub fn new(cfg: MaskDetectorConfig, device: &B::Device) -> Self {
        let num_classes = cfg.num_classes.max(1);
        let max_detections = cfg.max_detections.max(1);
        let mask_resolution = cfg.mask_resolution.max(1);
        let convs = CHANNELS
            .windows(2)
            .map(|pair| {
                Conv2dConfig::new([pair[0], pair[1]], [3, 3])
                    .with_stride([2, 2])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .init(device)
            })
            .collect();
        let features = CHANNELS[CHANNELS.len() - 1] * POOLED * POOLED;
        let hidden = cfg.hidden_dim.max(1);
        Self {
            convs,
            pool: AdaptiveAvgPool2dConfig::new([POOLED, POOLED]).init(),
            trunk: nn::LinearConfig::new(features, hidden).init(device),
            box_head: nn::LinearConfig::new(hidden, max_detections * 4).init(device),
            objectness_head: nn::LinearConfig::new(hidden, max_detections).init(device),
            class_head: nn::LinearConfig::new(hidden, max_detections * num_classes).init(device),
            mask_head: nn::LinearConfig::new(
                hidden,
                max_detections * mask_resolution * mask_resolution,
            )
            .init(device),
            num_classes,
            max_detections,
            mask_resolution,
            hidden_dim: hidden,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn max_detections(&self) -> usize {
        self.max_detections
    }

    pub fn mask_resolution(&self) -> usize {
        self.mask_resolution
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> DetectorOutput<B> {
        let mut x = images;
        for conv in &self.convs {
            x = relu(conv.forward(x));
        }
        let x = self.pool.forward(x);
        let batch = x.dims()[0];
        let x = x.reshape([batch, CHANNELS[CHANNELS.len() - 1] * POOLED * POOLED]);
        let x = relu(self.trunk.forward(x));

        let k = self.max_detections;
        let boxes = sigmoid(self.box_head.forward(x.clone())).reshape([batch, k, 4]);
        let objectness_logits = self.objectness_head.forward(x.clone());
        let class_logits = self
            .class_head
            .forward(x.clone())
            .reshape([batch, k, self.num_classes]);
        let mm = self.mask_resolution * self.mask_resolution;
        let mask_logits = self.mask_head.forward(x).reshape([batch, k, mm]);

        DetectorOutput {
            boxes: order_corners(boxes),
            objectness_logits,
            class_logits,
            mask_logits,
        }
    }

    /// Human-readable structure, logged when the model is built.
    pub fn describe(&self) -> String {
        let mut out = String::from("MaskDetector(\n");
        for (idx, pair) in CHANNELS.windows(2).enumerate() {
            out.push_str(&format!(
                "  (conv{}): Conv2d({}, {}, kernel_size=3, stride=2, padding=1)\n",
                idx + 1,
                pair[0],
                pair[1]
            ));
        }
        let features = CHANNELS[CHANNELS.len() - 1] * POOLED * POOLED;
        let hidden = self.hidden_dim;
        let k = self.max_detections;
        let m = self.mask_resolution;
        out.push_str(&format!(
            "  (pool): AdaptiveAvgPool2d(output_size=({POOLED}, {POOLED}))\n"
        ));
        out.push_str(&format!("  (trunk): Linear({features}, {hidden})\n"));
        out.push_str(&format!("  (box_head): Linear({hidden}, {})\n", k * 4));
        out.push_str(&format!("  (objectness_head): Linear({hidden}, {k})\n"));
        out.push_str(&format!(
            "  (class_head): Linear({hidden}, {})\n",
            k * self.num_classes
        ));
        out.push_str(&format!("  (mask_head): Linear({hidden}, {})\n", k * m * m));
        out.push_str(&format!(
            ")\nslots={k} classes={} mask={m}x{m} parameters={}",
            self.num_classes,
            self.num_params()
        ));
        out
    }
}

/// Reorder box corners so that `x0 <= x1` and `y0 <= y1`, clamped to `[0, 1]`.
fn order_corners<B: Backend>(boxes: Tensor<B, 3>) -> Tensor<B, 3> {
    let [batch, k, _] = boxes.dims();
    let x0 = boxes.clone().slice([0..batch, 0..k, 0..1]);
    let y0 = boxes.clone().slice([0..batch, 0..k, 1..2]);
    let x1 = boxes.clone().slice([0..batch, 0..k, 2..3]);
    let y1 = boxes.slice([0..batch, 0..k, 3..4]);

    let dx = x0.clone() - x1.clone();
    let dy = y0.clone() - y1.clone();
    let x_min = (x0.clone() + x1.clone() - dx.clone().abs()) * 0.5;
    let x_max = (x0 + x1 + dx.abs()) * 0.5;
    let y_min = (y0.clone() + y1.clone() - dy.clone().abs()) * 0.5;
    let y_max = (y0 + y1 + dy.abs()) * 0.5;

    Tensor::cat(
        vec![
            x_min.clamp(0.0, 1.0),
            y_min.clamp(0.0, 1.0),
            x_max.clamp(0.0, 1.0),
            y_max.clamp(0.0, 1.0),
        ],
        2,
    )
}

/// Build the model for a run and log its structure.
pub fn build_model<B: Backend>(cfg: &RunConfig, device: &B::Device) -> Result<MaskDetector<B>> {
    if cfg.input.size % 8 != 0 {
        return Err(SegTrainError::model(format!(
            "input size {} is not divisible by the network stride 8",
            cfg.input.size
        )));
    }
    let model = MaskDetectorConfig::from_run_config(cfg).init::<B>(device);
    tracing::info!(parameters = model.num_params(), "model built");
    tracing::info!("Model:\n{}", model.describe());
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type B = NdArray<f32>;

    fn config() -> MaskDetectorConfig {
        MaskDetectorConfig {
            num_classes: 3,
            max_detections: 5,
            hidden_dim: 16,
            mask_resolution: 4,
        }
    }

    #[test]
    fn test_forward_shapes() {
        let device = Default::default();
        let model = config().init::<B>(&device);
        let images = Tensor::<B, 4>::zeros([2, 3, 32, 32], &device);
        let out = model.forward(images);
        assert_eq!(out.boxes.dims(), [2, 5, 4]);
        assert_eq!(out.objectness_logits.dims(), [2, 5]);
        assert_eq!(out.class_logits.dims(), [2, 5, 3]);
        assert_eq!(out.mask_logits.dims(), [2, 5, 16]);
    }

    #[test]
    fn test_boxes_are_ordered() {
        let device = Default::default();
        let model = config().init::<B>(&device);
        let images = Tensor::<B, 4>::from_data(
            TensorData::new((0..3 * 16 * 16).map(|v| (v % 7) as f32 / 7.0).collect::<Vec<_>>(), [1, 3, 16, 16]),
            &device,
        );
        let boxes = model.forward(images).boxes.into_data().to_vec::<f32>().unwrap();
        for b in boxes.chunks(4) {
            assert!(b[0] <= b[2] && b[1] <= b[3]);
            assert!(b.iter().all(|v| (0.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn test_describe_mentions_heads() {
        let device = Default::default();
        let model = config().init::<B>(&device);
        let text = model.describe();
        assert!(text.contains("mask_head"));
        assert!(text.contains(&format!("parameters={}", model.num_params())));
    }

    #[test]
    fn test_build_model_uses_run_config() {
        let mut cfg = RunConfig::default();
        cfg.model.num_classes = 2;
        let model = build_model::<B>(&cfg, &Default::default()).unwrap();
        assert_eq!(model.num_classes(), 2);
        assert_eq!(model.max_detections(), cfg.model.max_detections);
    }
}
