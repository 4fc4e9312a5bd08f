//! # segtrain-core: COCO instance-segmentation training
//!
//! Everything a training run needs, wired together by [`driver::run`]:
//! dataset registration, a small mask detector, data-parallel training with
//! checkpointing, COCO evaluation, experiment tracking and a visual report.

// Foundation
pub mod backend;
pub mod config;
pub mod error;
pub mod persistence;
pub mod reproducibility;

// Data and model
pub mod data;
pub mod modeling;

// Training infrastructure
pub mod checkpoint;
pub mod comm;
pub mod engine;
pub mod evaluation;

// Run outputs
pub mod report;
pub mod tracking;
pub mod workspace;

pub mod driver;

// Re-exports
pub use config::{ConfigSources, Hyperparameters, RunConfig};
pub use driver::{DriverArgs, RunContext, RunMode, RunSummary, run};
pub use error::{Result, SegTrainError};
pub use tracking::{RunRecord, RunStatus, Tracker, TrackingSettings};
pub use workspace::{ApprovalDecision, DeletionApprover, OutputWorkspace};
