//! Per-layer key/value cache for greedy decoding
//!
//! Generation only needs the cache while decoding; the attention capture
//! pass always re-runs the full sequence without it.
//!
//! Tensors are `[batch, num_kv_heads, seq_len, head_dim]`, stored before
//! grouped-query expansion.

use candle_core::Tensor;

#[derive(Debug, Clone, Default)]
pub struct KVCache {
    pub keys: Vec<Option<Tensor>>,
    pub values: Vec<Option<Tensor>>,
}

impl KVCache {
    pub fn new(n_layers: usize) -> Self {
        Self {
            keys: vec![None; n_layers],
            values: vec![None; n_layers],
        }
    }

    /// Cached positions (0 if empty)
    pub fn seq_len(&self) -> usize {
        self.keys
            .iter()
            .find_map(|k| k.as_ref())
            .map_or(0, |k| k.dim(2).unwrap_or(0))
    }

    pub fn is_empty(&self) -> bool {
        self.keys.iter().all(Option::is_none)
    }

    pub fn n_layers(&self) -> usize {
        self.keys.len()
    }

    /// `(cache_k, cache_v)` slots of one layer
    pub fn layer_mut(&mut self, layer: usize) -> (&mut Option<Tensor>, &mut Option<Tensor>) {
        (&mut self.keys[layer], &mut self.values[layer])
    }

    /// Bytes held by all cached tensors
    pub fn memory_usage(&self) -> usize {
        self.keys
            .iter()
            .chain(self.values.iter())
            .flatten()
            .map(|t| t.elem_count() * t.dtype().size_in_bytes())
            .sum()
    }
}
