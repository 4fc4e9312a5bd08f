//! Training and evaluation loops.

pub mod ddp;
pub mod evaluate;
pub mod hooks;
pub mod metrics;
pub mod train;

use crate::backend::TrainBackend;
use crate::comm::{Comm, World};
use crate::data::DatasetRegistry;
use crate::modeling::MaskDetector;

pub use ddp::DistributedDataParallel;
pub use evaluate::{do_evaluate, inference_on_records};
pub use hooks::{HookAction, TrainHook};
pub use metrics::EventStorage;
pub use train::{TrainReport, do_train, learning_rate};

/// What the loops need from the surrounding run.
#[derive(Clone, Copy)]
pub struct EngineContext<'a> {
    pub world: World,
    pub comm: &'a Comm,
    pub registry: &'a DatasetRegistry,
}

/// A model ready for training, optionally wrapped for data parallelism.
pub enum Trainable {
    Local(MaskDetector<TrainBackend>),
    DataParallel(DistributedDataParallel<MaskDetector<TrainBackend>>),
}

impl Trainable {
    pub fn is_data_parallel(&self) -> bool {
        matches!(self, Trainable::DataParallel(_))
    }

    pub fn into_parts(self) -> (MaskDetector<TrainBackend>, Option<Comm>) {
        match self {
            Trainable::Local(model) => (model, None),
            Trainable::DataParallel(ddp) => {
                let (model, comm) = ddp.into_parts();
                (model, Some(comm))
            }
        }
    }
}
