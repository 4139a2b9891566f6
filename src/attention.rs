//! Captured attention weights and their on-disk form
//!
//! The decoder pushes one `[batch, heads, seq, seq]` tensor per layer into an
//! [`AttentionCache`]. Each layer is written as a headerless little-endian
//! float16 blob of shape `(heads, seq, seq)`; shape lives in `meta.json`.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};
use half::f16;

use crate::error::ExtractError;

/// Attention weights per layer, in layer order
#[derive(Debug, Default)]
pub struct AttentionCache {
    patterns: Vec<Tensor>,
}

impl AttentionCache {
    pub fn with_capacity(n_layers: usize) -> Self {
        Self {
            patterns: Vec::with_capacity(n_layers),
        }
    }

    pub fn push(&mut self, pattern: Tensor) {
        self.patterns.push(pattern);
    }

    /// Number of layers captured
    pub fn n_layers(&self) -> usize {
        self.patterns.len()
    }

    pub fn get_layer(&self, layer: usize) -> Option<&Tensor> {
        self.patterns.get(layer)
    }

    pub fn into_layers(self) -> Vec<Tensor> {
        self.patterns
    }

    /// Check the capture against the model's reported geometry.
    ///
    /// Every layer must be present and shaped `(heads, seq, seq)`, with an
    /// optional leading batch dimension of one.
    pub fn validate(&self, num_layers: usize, num_heads: usize, seq_len: usize) -> Result<()> {
        if self.patterns.len() != num_layers {
            return Err(ExtractError::AttentionCaptureMismatch {
                expected: num_layers,
                actual: self.patterns.len(),
            }
            .into());
        }
        let expected = [num_heads, seq_len, seq_len];
        for (layer, pattern) in self.patterns.iter().enumerate() {
            let dims = pattern.dims();
            let ok = match dims {
                [1, rest @ ..] => rest == expected,
                _ => dims == expected,
            };
            if !ok {
                return Err(ExtractError::AttentionShapeMismatch {
                    layer,
                    expected: expected.to_vec(),
                    actual: dims.to_vec(),
                }
                .into());
            }
        }
        Ok(())
    }
}

/// File name of one layer's attention blob
pub fn attention_file_name(layer: usize) -> String {
    format!("attn_layer_{layer:02}.bin")
}

/// Exact byte length of one layer file
pub fn attention_file_len(num_heads: usize, seq_len: usize) -> u64 {
    (num_heads * seq_len * seq_len * std::mem::size_of::<f16>()) as u64
}

/// Cast `pattern` to float16 and write it row-major, dropping a leading
/// batch dimension of one. Returns the number of bytes written.
pub fn write_attention_f16(pattern: &Tensor, path: &Path) -> Result<u64> {
    let pattern = if pattern.rank() == 4 {
        pattern.squeeze(0)?
    } else {
        pattern.clone()
    };
    let values: Vec<f16> = pattern.to_dtype(DType::F16)?.flatten_all()?.to_vec1()?;

    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    for v in &values {
        writer.write_all(&v.to_le_bytes())?;
    }
    writer
        .flush()
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok((values.len() * std::mem::size_of::<f16>()) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn uniform_pattern(heads: usize, seq: usize) -> Tensor {
        Tensor::ones((1, heads, seq, seq), DType::F32, &Device::Cpu)
            .unwrap()
            .affine(1.0 / seq as f64, 0.0)
            .unwrap()
    }

    #[test]
    fn test_attention_cache() {
        let mut cache = AttentionCache::with_capacity(2);
        assert_eq!(cache.n_layers(), 0);
        cache.push(uniform_pattern(2, 3));
        cache.push(uniform_pattern(2, 3));
        assert_eq!(cache.n_layers(), 2);
        assert!(cache.get_layer(1).is_some());
        assert!(cache.get_layer(2).is_none());
        cache.validate(2, 2, 3).unwrap();
    }

    #[test]
    fn test_validate_layer_count() {
        let mut cache = AttentionCache::with_capacity(3);
        cache.push(uniform_pattern(2, 3));
        let err = cache.validate(3, 2, 3).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExtractError>(),
            Some(ExtractError::AttentionCaptureMismatch {
                expected: 3,
                actual: 1
            })
        ));
    }

    #[test]
    fn test_validate_shape() {
        let mut cache = AttentionCache::default();
        cache.push(uniform_pattern(2, 3));
        let err = cache.validate(1, 4, 3).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExtractError>(),
            Some(ExtractError::AttentionShapeMismatch { layer: 0, .. })
        ));
    }

    #[test]
    fn test_file_name() {
        assert_eq!(attention_file_name(0), "attn_layer_00.bin");
        assert_eq!(attention_file_name(27), "attn_layer_27.bin");
    }

    #[test]
    fn test_write_f16_length_and_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(attention_file_name(0));
        let written = write_attention_f16(&uniform_pattern(2, 4), &path).unwrap();

        assert_eq!(written, attention_file_len(2, 4));
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len() as u64, written);
        let first = f16::from_le_bytes([bytes[0], bytes[1]]);
        assert_eq!(first.to_f32(), 0.25);
    }
}
