//! Data-parallel wrapper: identical initial weights on every rank and
//! gradients averaged across ranks before each optimizer step.

use crate::comm::Comm;
use crate::error::{Result, SegTrainError};
use burn::module::{AutodiffModule, ModuleVisitor, ParamId};
use burn::optim::GradientsParams;
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Tensor, TensorData};
use bytes::Bytes;
use std::collections::HashMap;

pub struct DistributedDataParallel<M> {
    module: M,
    comm: Comm,
}

impl<M> DistributedDataParallel<M> {
    /// Wrap `module`, replacing its parameters with rank 0's.
    pub async fn wrap<B>(module: M, comm: Comm, device: &B::Device) -> Result<Self>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
    {
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let payload = if comm.rank() == 0 {
            let bytes = Recorder::<B>::record(&recorder, module.clone().into_record(), ())
                .map_err(|e| SegTrainError::distributed(format!("failed to encode parameters: {e:?}")))?;
            Bytes::from(bytes)
        } else {
            Bytes::new()
        };
        let payload = comm.broadcast(payload).await?;
        let module = if comm.rank() == 0 {
            module
        } else {
            let record = Recorder::<B>::load(&recorder, payload.to_vec(), device).map_err(|e| {
                SegTrainError::distributed(format!("failed to decode parameters: {e:?}"))
            })?;
            module.load_record(record)
        };
        tracing::info!(
            rank = comm.rank(),
            world_size = comm.world_size(),
            "model wrapped for data-parallel training"
        );
        Ok(Self { module, comm })
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    pub fn comm(&self) -> &Comm {
        &self.comm
    }

    pub fn into_parts(self) -> (M, Comm) {
        (self.module, self.comm)
    }
}

/// Average every gradient of `module` across ranks through one flat buffer.
pub async fn all_reduce_gradients<B, M>(
    comm: &Comm,
    module: &M,
    mut grads: GradientsParams,
) -> Result<GradientsParams>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    if comm.world_size() <= 1 {
        return Ok(grads);
    }
    let mut flatten = Flatten::<B> {
        grads: &mut grads,
        buffer: Vec::new(),
        layout: HashMap::new(),
        device: None,
        error: None,
    };
    module.visit(&mut flatten);
    if let Some(e) = flatten.error {
        return Err(e);
    }
    let Flatten {
        mut buffer,
        layout,
        device,
        ..
    } = flatten;

    comm.all_reduce_mean(&mut buffer).await?;

    if let Some(device) = device {
        let mut restore = Restore::<B> {
            grads: &mut grads,
            buffer: &buffer,
            layout: &layout,
            device,
        };
        module.visit(&mut restore);
    }
    Ok(grads)
}

struct Flatten<'a, B: AutodiffBackend> {
    grads: &'a mut GradientsParams,
    buffer: Vec<f32>,
    layout: HashMap<ParamId, (usize, Vec<usize>)>,
    device: Option<<B::InnerBackend as Backend>::Device>,
    error: Option<SegTrainError>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for Flatten<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) else {
            return;
        };
        if self.device.is_none() {
            self.device = Some(grad.device());
        }
        let shape = grad.dims().to_vec();
        match grad.into_data().convert::<f32>().to_vec::<f32>() {
            Ok(values) => {
                self.layout.insert(id, (self.buffer.len(), shape));
                self.buffer.extend_from_slice(&values);
            }
            Err(e) => {
                self.error = Some(SegTrainError::distributed(format!(
                    "failed to read gradient: {e:?}"
                )));
            }
        }
    }
}

struct Restore<'a, B: AutodiffBackend> {
    grads: &'a mut GradientsParams,
    buffer: &'a [f32],
    layout: &'a HashMap<ParamId, (usize, Vec<usize>)>,
    device: <B::InnerBackend as Backend>::Device,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for Restore<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        let Some((offset, shape)) = self.layout.get(&id) else {
            return;
        };
        let len: usize = shape.iter().product();
        let values = self.buffer[*offset..*offset + len].to_vec();
        let grad = Tensor::<B::InnerBackend, D>::from_data(
            TensorData::new(values, shape.clone()),
            &self.device,
        );
        self.grads.register::<B::InnerBackend, D>(id, grad);
    }
}
