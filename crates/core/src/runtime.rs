use anyhow::{Context, Result};
use candle_core::{DType, Device};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Cpu,
    Metal,
    Cuda,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    F32,
    F16,
    Bf16,
}

/// Open the requested device and settle the working dtype.
///
/// Without an explicit precision, CPU runs in f32 and accelerators in f16.
pub fn prepare_device_and_dtype(
    device: DeviceKind,
    precision: Option<Precision>,
) -> Result<(Device, DType)> {
    let device = match device {
        DeviceKind::Cpu => Device::Cpu,
        DeviceKind::Metal => Device::new_metal(0).context("failed to initialise Metal device")?,
        DeviceKind::Cuda => Device::new_cuda(0).context("failed to initialise CUDA device")?,
    };
    let dtype = precision
        .map(dtype_from_precision)
        .unwrap_or_else(|| default_dtype_for_device(&device));
    Ok((device, dtype))
}

pub fn default_dtype_for_device(device: &Device) -> DType {
    if device.is_metal() || device.is_cuda() {
        DType::F16
    } else {
        DType::F32
    }
}

pub fn dtype_from_precision(p: Precision) -> DType {
    match p {
        Precision::F32 => DType::F32,
        Precision::F16 => DType::F16,
        Precision::Bf16 => DType::BF16,
    }
}
