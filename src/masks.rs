//! Additive attention masks for the text decoder
//!
//! Causal masks are cached by `(seq_len, device, dtype)`. A multimodal
//! prompt is often several thousand tokens long, so the prefill and the
//! capture pass would otherwise each rebuild a `seq^2` mask.

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, PoisonError};

use anyhow::Result;
use candle_core::{DType, Device, DeviceLocation, Tensor};

type MaskKey = (usize, (u8, usize), DType);

static CAUSAL_MASK_CACHE: LazyLock<Mutex<HashMap<MaskKey, Tensor>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn device_key(device: &Device) -> (u8, usize) {
    match device.location() {
        DeviceLocation::Cpu => (0, 0),
        DeviceLocation::Cuda { gpu_id } => (1, gpu_id),
        DeviceLocation::Metal { gpu_id } => (2, gpu_id),
    }
}

/// `[1, 1, seq_len, seq_len]` mask: `0` where `j <= i`, `-inf` above the diagonal
pub fn create_causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let key = (seq_len, device_key(device), dtype);
    if let Some(cached) = CAUSAL_MASK_CACHE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&key)
    {
        return Ok(cached.clone());
    }

    let mask = generation_mask_values(seq_len, seq_len, 0);
    let mask = Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)?;

    CAUSAL_MASK_CACHE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(key, mask.clone());
    Ok(mask)
}

/// Mask for `new_seq_len` queries appended after `start_pos` cached keys.
///
/// Returns `[1, 1, new_seq_len, total_seq_len]`; a single new token sees
/// everything, so that case is all zeros.
pub fn create_generation_mask(
    new_seq_len: usize,
    total_seq_len: usize,
    start_pos: usize,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    if new_seq_len == 1 {
        return Ok(Tensor::zeros((1, 1, 1, total_seq_len), dtype, device)?);
    }
    let mask = generation_mask_values(new_seq_len, total_seq_len, start_pos);
    Ok(Tensor::from_vec(mask, (1, 1, new_seq_len, total_seq_len), device)?.to_dtype(dtype)?)
}

fn generation_mask_values(rows: usize, cols: usize, start_pos: usize) -> Vec<f32> {
    (0..rows)
        .flat_map(|i| {
            let visible_up_to = start_pos + i;
            (0..cols).map(move |j| {
                if j <= visible_up_to {
                    0.0
                } else {
                    f32::NEG_INFINITY
                }
            })
        })
        .collect()
}

/// Drop all cached masks
pub fn clear_mask_caches() {
    CAUSAL_MASK_CACHE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clear();
}

pub fn mask_cache_size() -> usize {
    CAUSAL_MASK_CACHE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .len()
}
