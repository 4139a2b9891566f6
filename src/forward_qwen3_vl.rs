//! Qwen3-VL text decoder with per-layer attention capture
//!
//! Runs layer by layer with eager attention (explicit softmax) so the dense
//! `[batch, heads, seq, seq]` weights of every layer can be returned.
//!
//! Differences from a plain Qwen decoder:
//! - per-head RMSNorm on queries and keys (`q_norm`, `k_norm`)
//! - interleaved multimodal RoPE: each rotary frequency is driven by the
//!   temporal, height or width coordinate of the token
//! - deepstack: visual features from intermediate vision blocks are added to
//!   the hidden state at image positions after the first decoder layers

use anyhow::{ensure, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_nn::rotary_emb::rope;
use candle_nn::{embedding, linear_no_bias, Embedding, Linear, RmsNorm, VarBuilder};
use serde::Deserialize;
use tracing::{debug, info};

use crate::attention::AttentionCache;
use crate::kv_cache::KVCache;
use crate::masks::{create_causal_mask, create_generation_mask};

/// `text_config` section of a Qwen3-VL `config.json`
#[derive(Debug, Clone, Deserialize)]
pub struct Qwen3VlTextConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    #[serde(default)]
    pub head_dim: Option<usize>,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default)]
    pub rope_scaling: Option<RopeScaling>,
    #[serde(default)]
    pub tie_word_embeddings: Option<bool>,
    #[serde(default)]
    pub eos_token_id: Option<EosTokenId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RopeScaling {
    #[serde(default = "default_mrope_section")]
    pub mrope_section: [usize; 3],
}

/// `eos_token_id` is either a single id or a list
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EosTokenId {
    One(u32),
    Many(Vec<u32>),
}

impl EosTokenId {
    pub fn ids(&self) -> Vec<u32> {
        match self {
            Self::One(id) => vec![*id],
            Self::Many(ids) => ids.clone(),
        }
    }
}

fn default_rope_theta() -> f64 {
    5_000_000.0
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_mrope_section() -> [usize; 3] {
    [24, 20, 20]
}

impl Qwen3VlTextConfig {
    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads)
    }

    pub fn mrope_section(&self) -> [usize; 3] {
        self.rope_scaling
            .as_ref()
            .map_or_else(default_mrope_section, |r| r.mrope_section)
    }
}

/// Rotary table for one forward call: `[seq, head_dim / 2]` each
pub struct RopeTable {
    cos: Tensor,
    sin: Tensor,
}

impl RopeTable {
    fn apply(&self, x: &Tensor) -> Result<Tensor> {
        Ok(rope(&x.contiguous()?, &self.cos, &self.sin)?)
    }
}

/// Interleaved multimodal rotary embedding.
///
/// Frequency `j` reads the height coordinate when `j % 3 == 1`, the width
/// coordinate when `j % 3 == 2`, within the first `3 * section` slots of
/// each axis; every other frequency reads the temporal coordinate.
pub struct MropeRotary {
    inv_freq: Vec<f32>,
    axis_of_freq: Vec<usize>,
}

impl MropeRotary {
    pub fn new(head_dim: usize, theta: f64, mrope_section: [usize; 3]) -> Self {
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| (1.0 / theta.powf(i as f64 / head_dim as f64)) as f32)
            .collect();
        let axis_of_freq = (0..inv_freq.len())
            .map(|j| match j % 3 {
                1 if j < mrope_section[1] * 3 => 1,
                2 if j < mrope_section[2] * 3 => 2,
                _ => 0,
            })
            .collect();
        Self {
            inv_freq,
            axis_of_freq,
        }
    }

    /// Build cos/sin for `(t, h, w)` position triples
    pub fn table(&self, positions: &[[i64; 3]], device: &Device, dtype: DType) -> Result<RopeTable> {
        let half = self.inv_freq.len();
        let mut freqs = Vec::with_capacity(positions.len() * half);
        for pos in positions {
            for (freq, &axis) in self.inv_freq.iter().zip(&self.axis_of_freq) {
                freqs.push(pos[axis] as f32 * freq);
            }
        }
        let freqs = Tensor::from_vec(freqs, (positions.len(), half), device)?;
        Ok(RopeTable {
            cos: freqs.cos()?.to_dtype(dtype)?,
            sin: freqs.sin()?.to_dtype(dtype)?,
        })
    }
}

/// Grouped-query attention with per-head q/k normalisation
struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    q_norm: RmsNorm,
    k_norm: RmsNorm,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &Qwen3VlTextConfig) -> Result<Self> {
        let head_dim = config.head_dim();
        let hidden = config.hidden_size;
        Ok(Self {
            q_proj: linear_no_bias(hidden, config.num_attention_heads * head_dim, vb.pp("q_proj"))?,
            k_proj: linear_no_bias(hidden, config.num_key_value_heads * head_dim, vb.pp("k_proj"))?,
            v_proj: linear_no_bias(hidden, config.num_key_value_heads * head_dim, vb.pp("v_proj"))?,
            o_proj: linear_no_bias(config.num_attention_heads * head_dim, hidden, vb.pp("o_proj"))?,
            q_norm: candle_nn::rms_norm(head_dim, config.rms_norm_eps, vb.pp("q_norm"))?,
            k_norm: candle_nn::rms_norm(head_dim, config.rms_norm_eps, vb.pp("k_norm"))?,
            num_heads: config.num_attention_heads,
            num_kv_heads: config.num_key_value_heads,
            head_dim,
        })
    }

    /// Returns `(output, attention_weights)`; weights are `[batch, heads, q_len, kv_len]`.
    ///
    /// With a cache slot, new keys/values are appended to it and queries
    /// attend to the cached prefix as well.
    fn forward_with_attn(
        &self,
        x: &Tensor,
        rope: &RopeTable,
        cache: Option<(&mut Option<Tensor>, &mut Option<Tensor>)>,
    ) -> Result<(Tensor, Tensor)> {
        let (b, seq_len, _) = x.dims3()?;

        let q = self
            .q_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_heads, self.head_dim))?;
        let k = self
            .k_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let q = self.q_norm.forward(&q)?.transpose(1, 2)?;
        let k = self.k_norm.forward(&k)?.transpose(1, 2)?;
        let q = rope.apply(&q)?;
        let k = rope.apply(&k)?;

        let (k, v, start_pos) = match cache {
            Some((cache_k, cache_v)) => {
                let start_pos = cache_k.as_ref().map(|t| t.dim(2)).transpose()?.unwrap_or(0);
                let (k, v) = match (cache_k.as_ref(), cache_v.as_ref()) {
                    (Some(prev_k), Some(prev_v)) => {
                        (Tensor::cat(&[prev_k, &k], 2)?, Tensor::cat(&[prev_v, &v], 2)?)
                    }
                    _ => (k, v),
                };
                *cache_k = Some(k.clone());
                *cache_v = Some(v.clone());
                (k, v, start_pos)
            }
            None => (k, v, 0),
        };

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?;
        let v = repeat_kv(v, n_rep)?.contiguous()?;
        let total_len = k.dim(2)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;

        let mask = if start_pos == 0 && total_len == seq_len {
            create_causal_mask(seq_len, x.device(), DType::F32)?
        } else {
            create_generation_mask(seq_len, total_len, start_pos, x.device(), DType::F32)?
        };
        // softmax in f32, weights returned in the model dtype
        let attn_weights = scores.to_dtype(DType::F32)?.broadcast_add(&mask)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?.to_dtype(x.dtype())?;
        let attn_output = attn_weights.matmul(&v)?;

        let attn_output = attn_output.transpose(1, 2)?.reshape((b, seq_len, ()))?;
        Ok((self.o_proj.forward(&attn_output)?, attn_weights))
    }
}

fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (b, num_kv_heads, seq_len, head_dim) = x.dims4()?;
    let x = x.unsqueeze(2)?;
    let x = x.expand((b, num_kv_heads, n_rep, seq_len, head_dim))?;
    Ok(x.reshape((b, num_kv_heads * n_rep, seq_len, head_dim))?)
}

/// SwiGLU feed-forward
struct Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl Mlp {
    fn load(vb: VarBuilder, config: &Qwen3VlTextConfig) -> Result<Self> {
        let (hidden, inter) = (config.hidden_size, config.intermediate_size);
        Ok(Self {
            gate_proj: linear_no_bias(hidden, inter, vb.pp("gate_proj"))?,
            up_proj: linear_no_bias(hidden, inter, vb.pp("up_proj"))?,
            down_proj: linear_no_bias(inter, hidden, vb.pp("down_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        Ok(self.down_proj.forward(&(gate * up)?)?)
    }
}

struct DecoderLayer {
    self_attn: Attention,
    mlp: Mlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn load(vb: VarBuilder, config: &Qwen3VlTextConfig) -> Result<Self> {
        Ok(Self {
            self_attn: Attention::load(vb.pp("self_attn"), config)?,
            mlp: Mlp::load(vb.pp("mlp"), config)?,
            input_layernorm: candle_nn::rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("input_layernorm"),
            )?,
            post_attention_layernorm: candle_nn::rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    fn forward_with_attn(
        &self,
        x: &Tensor,
        rope: &RopeTable,
        cache: Option<(&mut Option<Tensor>, &mut Option<Tensor>)>,
    ) -> Result<(Tensor, Tensor)> {
        let residual = x;
        let x = self.input_layernorm.forward(x)?;
        let (x, attn_weights) = self.self_attn.forward_with_attn(&x, rope, cache)?;
        let x = (residual + x)?;
        let residual = &x;
        let x = self.post_attention_layernorm.forward(&x)?;
        let x = self.mlp.forward(&x)?;
        Ok(((residual + x)?, attn_weights))
    }
}

/// Visual features added to the residual stream after the first layers
pub struct DeepstackInjection {
    /// Sequence indices of the image placeholder tokens, u32
    pub positions: Tensor,
    /// One `[n_image_tokens, hidden]` tensor per injected layer
    pub features: Vec<Tensor>,
}

impl DeepstackInjection {
    fn apply(&self, layer: usize, hidden: &Tensor) -> Result<Tensor> {
        match self.features.get(layer) {
            Some(features) => {
                let features = features.to_dtype(hidden.dtype())?.unsqueeze(0)?;
                Ok(hidden.index_add(&self.positions, &features, 1)?)
            }
            None => Ok(hidden.clone()),
        }
    }
}

/// Qwen3-VL language model
pub struct Qwen3VlTextModel {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    /// Separate head when present in the checkpoint, else tied to `embed_tokens`
    lm_head: Option<Linear>,
    rotary: MropeRotary,
    n_layers: usize,
    n_heads: usize,
}

impl Qwen3VlTextModel {
    /// `vb` points at `model.language_model`; `vb_root` is the checkpoint root
    pub fn load(vb: VarBuilder, vb_root: VarBuilder, config: &Qwen3VlTextConfig) -> Result<Self> {
        ensure!(
            config.num_attention_heads % config.num_key_value_heads == 0,
            "{} heads not divisible by {} kv heads",
            config.num_attention_heads,
            config.num_key_value_heads
        );
        info!(
            "Text config: {} layers, {} hidden, {} heads ({} kv), {} vocab",
            config.num_hidden_layers,
            config.hidden_size,
            config.num_attention_heads,
            config.num_key_value_heads,
            config.vocab_size
        );

        let embed_tokens = embedding(config.vocab_size, config.hidden_size, vb.pp("embed_tokens"))?;
        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            if (i + 1) % 10 == 0 || i == 0 {
                info!("Loading layer {}/{}", i + 1, config.num_hidden_layers);
            }
            layers.push(DecoderLayer::load(vb.pp(format!("layers.{i}")), config)?);
        }
        let norm = candle_nn::rms_norm(config.hidden_size, config.rms_norm_eps, vb.pp("norm"))?;

        let lm_head = if config.tie_word_embeddings != Some(true)
            && vb_root.contains_tensor("lm_head.weight")
        {
            info!("Loading separate lm_head...");
            Some(linear_no_bias(
                config.hidden_size,
                config.vocab_size,
                vb_root.pp("lm_head"),
            )?)
        } else {
            None
        };

        let rotary = MropeRotary::new(config.head_dim(), config.rope_theta, config.mrope_section());

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rotary,
            n_layers: config.num_hidden_layers,
            n_heads: config.num_attention_heads,
        })
    }

    pub fn n_layers(&self) -> usize {
        self.n_layers
    }

    pub fn n_heads(&self) -> usize {
        self.n_heads
    }

    pub fn new_kv_cache(&self) -> KVCache {
        KVCache::new(self.n_layers)
    }

    /// `[batch, seq]` ids -> `[batch, seq, hidden]`
    pub fn embed(&self, input_ids: &Tensor) -> Result<Tensor> {
        Ok(self.embed_tokens.forward(input_ids)?)
    }

    /// Full-sequence forward capturing every layer's attention weights.
    ///
    /// Returns the final-normed hidden states and the attention cache.
    pub fn forward_with_attention(
        &self,
        embeds: &Tensor,
        positions: &[[i64; 3]],
        deepstack: Option<&DeepstackInjection>,
    ) -> Result<(Tensor, AttentionCache)> {
        let rope = self
            .rotary
            .table(positions, embeds.device(), embeds.dtype())?;
        let mut attn_cache = AttentionCache::with_capacity(self.n_layers);

        let mut hidden = embeds.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            let (new_hidden, attn_weights) = layer.forward_with_attn(&hidden, &rope, None)?;
            hidden = match deepstack {
                Some(ds) => ds.apply(i, &new_hidden)?,
                None => new_hidden,
            };
            attn_cache.push(attn_weights);

            if (i + 1) % 10 == 0 {
                info!(
                    "Processed layer {}/{} (with attention)",
                    i + 1,
                    self.n_layers
                );
            }
        }

        Ok((self.norm.forward(&hidden)?, attn_cache))
    }

    /// Forward `embeds` (the tokens after the cached prefix) through the
    /// cache and return logits of the last position, `[batch, vocab]`
    pub fn forward_with_kv_cache(
        &self,
        embeds: &Tensor,
        positions: &[[i64; 3]],
        deepstack: Option<&DeepstackInjection>,
        kv_cache: &mut KVCache,
    ) -> Result<Tensor> {
        let rope = self
            .rotary
            .table(positions, embeds.device(), embeds.dtype())?;
        debug!(
            "Cached forward: {} new tokens after {}",
            positions.len(),
            kv_cache.seq_len()
        );

        let mut hidden = embeds.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            let (new_hidden, _) = layer.forward_with_attn(&hidden, &rope, Some(kv_cache.layer_mut(i)))?;
            hidden = match deepstack {
                Some(ds) => ds.apply(i, &new_hidden)?,
                None => new_hidden,
            };
        }

        let output = self.norm.forward(&hidden)?;
        let seq_len = output.dim(1)?;
        let last_hidden = output.i((.., seq_len - 1, ..))?;
        self.project_to_vocab(&last_hidden)
    }

    pub fn project_to_vocab(&self, hidden: &Tensor) -> Result<Tensor> {
        let logits = match &self.lm_head {
            Some(lm_head) => lm_head.forward(hidden)?,
            None => hidden.matmul(&self.embed_tokens.embeddings().t()?)?,
        };
        Ok(logits)
    }
}

/// Greedy pick from `[1, vocab]` or `[vocab]` logits
pub fn argmax_token(logits: &Tensor) -> Result<u32> {
    let logits = logits.to_dtype(DType::F32)?.flatten_all()?;
    Ok(logits.argmax(D::Minus1)?.to_scalar::<u32>()?)
}
