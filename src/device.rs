//! Compute device and dtype selection

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device};
use tracing::info;

/// Parse a device string: `cpu`, `cuda`/`gpu`, `cuda:N` or `metal`.
///
/// Backends not compiled in fail here rather than at first tensor use.
pub fn parse_device(device_str: &str) -> Result<Device> {
    let device_str = device_str.trim().to_lowercase();
    match device_str.as_str() {
        "cpu" => Ok(Device::Cpu),
        "cuda" | "gpu" => Device::new_cuda(0).context("Failed to create CUDA device 0"),
        "metal" => Device::new_metal(0).context("Failed to create Metal device"),
        s if s.starts_with("cuda:") => {
            let ordinal: usize = s["cuda:".len()..]
                .parse()
                .with_context(|| format!("Invalid CUDA device ordinal in '{s}'"))?;
            Device::new_cuda(ordinal)
                .with_context(|| format!("Failed to create CUDA device {ordinal}"))
        }
        other => bail!("Unknown device: '{other}'. Use 'cpu', 'cuda', 'cuda:N' or 'metal'"),
    }
}

/// CUDA when available, else CPU
pub fn default_device() -> Device {
    match Device::cuda_if_available(0) {
        Ok(dev) if dev.is_cuda() => {
            info!("Using CUDA device");
            dev
        }
        _ => {
            info!("CUDA not available, using CPU");
            Device::Cpu
        }
    }
}

/// Resolve an optional device string to a device
pub fn select_device(device_str: Option<&str>) -> Result<Device> {
    match device_str {
        Some(s) => parse_device(s),
        None => Ok(default_device()),
    }
}

/// Compute dtype for a device.
///
/// Qwen checkpoints are trained in bfloat16; float16 overflows in some
/// layers on CUDA. Metal lacks full bf16 matmul support, CPU runs f32.
pub fn default_dtype(device: &Device) -> DType {
    match device {
        Device::Cuda(_) => DType::BF16,
        Device::Metal(_) => DType::F16,
        Device::Cpu => DType::F32,
    }
}

/// Parse a dtype name (`f32`, `f16`, `bf16` and their long forms)
pub fn parse_dtype(dtype_str: &str) -> Result<DType> {
    match dtype_str.trim().to_lowercase().as_str() {
        "f32" | "float32" => Ok(DType::F32),
        "f16" | "float16" | "half" => Ok(DType::F16),
        "bf16" | "bfloat16" => Ok(DType::BF16),
        other => bail!("Unknown dtype: '{other}'. Use 'f32', 'f16' or 'bf16'"),
    }
}
