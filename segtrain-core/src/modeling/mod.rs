//! Model factory: network, target assignment, losses and postprocessing.

pub mod detector;
pub mod loss;
pub mod postprocess;
pub mod targets;

pub use detector::{DetectorOutput, MaskDetector, MaskDetectorConfig, build_model};
pub use loss::{DetectionLosses, LossBreakdown, detection_losses};
pub use postprocess::{Instance, PostprocessParams, postprocess};
