//! Tensor backend selection (NdArray by default; WGPU if enabled).

use burn::backend::Autodiff;

#[cfg(feature = "backend-wgpu")]
pub type DefaultBackend = burn::backend::Wgpu;
#[cfg(not(feature = "backend-wgpu"))]
pub type DefaultBackend = burn::backend::NdArray<f32>;

/// Backend used for training (autodiff over [`DefaultBackend`]).
pub type TrainBackend = Autodiff<DefaultBackend>;

pub type DefaultDevice = <DefaultBackend as burn::tensor::backend::Backend>::Device;

/// Device a worker process is pinned to.
#[cfg(feature = "backend-wgpu")]
pub fn device_for_local_rank(local_rank: usize) -> DefaultDevice {
    burn::backend::wgpu::WgpuDevice::DiscreteGpu(local_rank)
}

/// Device a worker process is pinned to. NdArray only has the CPU.
#[cfg(not(feature = "backend-wgpu"))]
pub fn device_for_local_rank(_local_rank: usize) -> DefaultDevice {
    burn::backend::ndarray::NdArrayDevice::Cpu
}

pub fn backend_name() -> &'static str {
    if cfg!(feature = "backend-wgpu") {
        "wgpu"
    } else {
        "ndarray"
    }
}
