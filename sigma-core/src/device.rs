use anyhow::Result;
use candle_core::utils::{
    cuda_is_available, get_num_threads, has_accelerate, has_mkl, metal_is_available, with_avx,
    with_f16c, with_neon,
};
use candle_core::Device;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::ForceCpu
    }
}

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                tracing::warn!(
                    "Running on CPU, to run on GPU(metal), build with `--features metal`"
                );
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                tracing::warn!("Running on CPU, to run on GPU, build with `--features cuda`");
            }
            Ok(Device::Cpu)
        }
    }
}

pub fn device_name(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}

/// Runtime capabilities reported by the health endpoint.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RuntimeInfo {
    pub num_threads: usize,
    pub cuda_available: bool,
    pub metal_available: bool,
    pub mkl: bool,
    pub accelerate: bool,
    pub avx: bool,
    pub neon: bool,
    pub f16c: bool,
}

impl RuntimeInfo {
    pub fn detect() -> Self {
        Self {
            num_threads: get_num_threads(),
            cuda_available: cuda_is_available(),
            metal_available: metal_is_available(),
            mkl: has_mkl(),
            accelerate: has_accelerate(),
            avx: with_avx(),
            neon: with_neon(),
            f16c: with_f16c(),
        }
    }
}
