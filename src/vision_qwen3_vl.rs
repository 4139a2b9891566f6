//! Qwen3-VL vision tower
//!
//! Patch embedding (a Conv3d whose kernel equals the patch, so a linear map
//! over flattened patches), a learned position table bilinearly resampled to
//! the patch grid, 2-D rotary attention blocks, and patch mergers that fold
//! each `merge x merge` block into one language-model token. Intermediate
//! blocks listed in `deepstack_visual_indexes` feed extra mergers whose
//! outputs the decoder adds back after its first layers.
//!
//! Patches arrive in merge-block order (see `processor`), so every group of
//! `merge^2` consecutive rows belongs to one output token.

use anyhow::{ensure, Context, Result};
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::rotary_emb::rope;
use candle_nn::{layer_norm, linear, Embedding, LayerNorm, Linear, VarBuilder};
use serde::Deserialize;
use tracing::debug;

/// `vision_config` section of a Qwen3-VL `config.json`
#[derive(Debug, Clone, Deserialize)]
pub struct Qwen3VlVisionConfig {
    #[serde(default = "default_depth")]
    pub depth: usize,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_intermediate_size")]
    pub intermediate_size: usize,
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,
    #[serde(default = "default_merge_size")]
    pub spatial_merge_size: usize,
    #[serde(default = "default_temporal_patch_size")]
    pub temporal_patch_size: usize,
    #[serde(default = "default_out_hidden_size")]
    pub out_hidden_size: usize,
    #[serde(default = "default_num_position_embeddings")]
    pub num_position_embeddings: usize,
    #[serde(default = "default_deepstack_visual_indexes")]
    pub deepstack_visual_indexes: Vec<usize>,
}

fn default_depth() -> usize {
    24
}
fn default_hidden_size() -> usize {
    1024
}
fn default_intermediate_size() -> usize {
    4096
}
fn default_num_heads() -> usize {
    16
}
fn default_in_channels() -> usize {
    3
}
fn default_patch_size() -> usize {
    16
}
fn default_merge_size() -> usize {
    2
}
fn default_temporal_patch_size() -> usize {
    2
}
fn default_out_hidden_size() -> usize {
    2048
}
fn default_num_position_embeddings() -> usize {
    2304
}
fn default_deepstack_visual_indexes() -> Vec<usize> {
    vec![5, 11, 17]
}

impl Qwen3VlVisionConfig {
    fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    fn patch_dim(&self) -> usize {
        self.in_channels * self.temporal_patch_size * self.patch_size * self.patch_size
    }

    /// Side of the square learned position grid
    fn grid_per_side(&self) -> usize {
        (self.num_position_embeddings as f64).sqrt() as usize
    }
}

/// Output of the vision tower for one image
pub struct VisionOutput {
    /// `[n_merged_tokens, out_hidden]`
    pub embeds: Tensor,
    /// One `[n_merged_tokens, out_hidden]` tensor per deepstack index
    pub deepstack: Vec<Tensor>,
}

/// `(row, col)` of every patch in merge-block order, repeated per frame
fn merge_block_positions(grid_thw: [u32; 3], merge: usize) -> Result<Vec<(usize, usize)>> {
    let [t, h, w] = grid_thw.map(|v| v as usize);
    ensure!(
        h % merge == 0 && w % merge == 0,
        "patch grid {h}x{w} not divisible by merge size {merge}"
    );
    let mut frame = Vec::with_capacity(h * w);
    for bh in 0..h / merge {
        for bw in 0..w / merge {
            for ih in 0..merge {
                for iw in 0..merge {
                    frame.push((bh * merge + ih, bw * merge + iw));
                }
            }
        }
    }
    Ok(frame.repeat(t))
}

/// Four-corner indices and weights for resampling an `n x n` table onto an
/// `h x w` grid (`linspace` over `0..n-1` on each axis)
fn bilinear_taps(row: usize, col: usize, h: usize, w: usize, n: usize) -> [(u32, f32); 4] {
    let coord = |i: usize, len: usize| -> f32 {
        if len <= 1 {
            0.0
        } else {
            i as f32 * (n - 1) as f32 / (len - 1) as f32
        }
    };
    let (y, x) = (coord(row, h), coord(col, w));
    let (y0, x0) = (y.floor() as usize, x.floor() as usize);
    let (y1, x1) = ((y0 + 1).min(n - 1), (x0 + 1).min(n - 1));
    let (dy, dx) = (y - y0 as f32, x - x0 as f32);
    let idx = |r: usize, c: usize| (r * n + c) as u32;
    [
        (idx(y0, x0), (1.0 - dy) * (1.0 - dx)),
        (idx(y0, x1), (1.0 - dy) * dx),
        (idx(y1, x0), dy * (1.0 - dx)),
        (idx(y1, x1), dy * dx),
    ]
}

struct VisionMlp {
    linear_fc1: Linear,
    linear_fc2: Linear,
}

impl VisionMlp {
    fn load(vb: VarBuilder, cfg: &Qwen3VlVisionConfig) -> Result<Self> {
        Ok(Self {
            linear_fc1: linear(cfg.hidden_size, cfg.intermediate_size, vb.pp("linear_fc1"))?,
            linear_fc2: linear(cfg.intermediate_size, cfg.hidden_size, vb.pp("linear_fc2"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // gelu_pytorch_tanh
        let x = self.linear_fc1.forward(x)?.gelu()?;
        Ok(self.linear_fc2.forward(&x)?)
    }
}

struct VisionAttention {
    qkv: Linear,
    proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl VisionAttention {
    fn load(vb: VarBuilder, cfg: &Qwen3VlVisionConfig) -> Result<Self> {
        ensure!(
            cfg.hidden_size % cfg.num_heads == 0,
            "vision hidden size not divisible by heads"
        );
        Ok(Self {
            qkv: linear(cfg.hidden_size, cfg.hidden_size * 3, vb.pp("qkv"))?,
            proj: linear(cfg.hidden_size, cfg.hidden_size, vb.pp("proj"))?,
            num_heads: cfg.num_heads,
            head_dim: cfg.head_dim(),
        })
    }

    /// Bidirectional attention within each frame of `frame_len` patches
    fn forward(&self, x: &Tensor, rotary: &VisionRope, frame_len: usize) -> Result<Tensor> {
        let (n, _) = x.dims2()?;
        let qkv = self
            .qkv
            .forward(x)?
            .reshape((n, 3, self.num_heads, self.head_dim))?;
        // [1, heads, n, head_dim]
        let split = |i: usize| -> Result<Tensor> {
            Ok(qkv
                .narrow(1, i, 1)?
                .squeeze(1)?
                .transpose(0, 1)?
                .unsqueeze(0)?
                .contiguous()?)
        };
        let (q, k, v) = (split(0)?, split(1)?, split(2)?);
        let q = rotary.apply(&q)?;
        let k = rotary.apply(&k)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let mut outputs = Vec::with_capacity(n / frame_len.max(1));
        let mut start = 0;
        while start < n {
            let len = frame_len.min(n - start);
            let q = q.narrow(2, start, len)?;
            let k = k.narrow(2, start, len)?;
            let v = v.narrow(2, start, len)?.contiguous()?;
            let scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
            let probs = candle_nn::ops::softmax_last_dim(&scores.to_dtype(DType::F32)?)?
                .to_dtype(v.dtype())?;
            outputs.push(probs.matmul(&v)?);
            start += len;
        }
        let out = Tensor::cat(&outputs, 2)?
            .squeeze(0)?
            .transpose(0, 1)?
            .reshape((n, self.num_heads * self.head_dim))?;
        Ok(self.proj.forward(&out)?)
    }
}

struct VisionBlock {
    norm1: LayerNorm,
    norm2: LayerNorm,
    attn: VisionAttention,
    mlp: VisionMlp,
}

impl VisionBlock {
    fn load(vb: VarBuilder, cfg: &Qwen3VlVisionConfig) -> Result<Self> {
        Ok(Self {
            norm1: layer_norm(cfg.hidden_size, 1e-6, vb.pp("norm1"))?,
            norm2: layer_norm(cfg.hidden_size, 1e-6, vb.pp("norm2"))?,
            attn: VisionAttention::load(vb.pp("attn"), cfg)?,
            mlp: VisionMlp::load(vb.pp("mlp"), cfg)?,
        })
    }

    fn forward(&self, x: &Tensor, rotary: &VisionRope, frame_len: usize) -> Result<Tensor> {
        let x = (x + self.attn.forward(&self.norm1.forward(x)?, rotary, frame_len)?)?;
        Ok((&x + self.mlp.forward(&self.norm2.forward(&x)?)?)?)
    }
}

/// Folds `merge^2` consecutive patches into one token.
///
/// The final merger normalises each patch before folding; deepstack mergers
/// normalise the folded vector.
struct PatchMerger {
    norm: LayerNorm,
    linear_fc1: Linear,
    linear_fc2: Linear,
    folded_dim: usize,
    postshuffle_norm: bool,
}

impl PatchMerger {
    fn load(vb: VarBuilder, cfg: &Qwen3VlVisionConfig, postshuffle_norm: bool) -> Result<Self> {
        let folded_dim = cfg.hidden_size * cfg.spatial_merge_size * cfg.spatial_merge_size;
        let norm_dim = if postshuffle_norm {
            folded_dim
        } else {
            cfg.hidden_size
        };
        Ok(Self {
            norm: layer_norm(norm_dim, 1e-6, vb.pp("norm"))?,
            linear_fc1: linear(folded_dim, folded_dim, vb.pp("linear_fc1"))?,
            linear_fc2: linear(folded_dim, cfg.out_hidden_size, vb.pp("linear_fc2"))?,
            folded_dim,
            postshuffle_norm,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = if self.postshuffle_norm {
            self.norm.forward(&x.reshape(((), self.folded_dim))?)?
        } else {
            self.norm.forward(x)?.reshape(((), self.folded_dim))?
        };
        let x = self.linear_fc1.forward(&x)?.gelu_erf()?;
        Ok(self.linear_fc2.forward(&x)?)
    }
}

/// 2-D rotary table: half the frequencies follow the row, half the column
struct VisionRope {
    cos: Tensor,
    sin: Tensor,
}

impl VisionRope {
    fn new(
        positions: &[(usize, usize)],
        head_dim: usize,
        device: &Device,
    ) -> Result<Self> {
        let rope_dim = head_dim / 2;
        let inv_freq: Vec<f32> = (0..rope_dim / 2)
            .map(|i| 1.0 / 10_000f32.powf((2 * i) as f32 / rope_dim as f32))
            .collect();
        let mut freqs = Vec::with_capacity(positions.len() * rope_dim);
        for &(row, col) in positions {
            freqs.extend(inv_freq.iter().map(|f| row as f32 * f));
            freqs.extend(inv_freq.iter().map(|f| col as f32 * f));
        }
        let freqs = Tensor::from_vec(freqs, (positions.len(), rope_dim), device)?;
        Ok(Self {
            cos: freqs.cos()?,
            sin: freqs.sin()?,
        })
    }

    /// Rotate `[1, heads, n, head_dim]` in f32, returning the input dtype
    fn apply(&self, x: &Tensor) -> Result<Tensor> {
        let rotated = rope(&x.to_dtype(DType::F32)?.contiguous()?, &self.cos, &self.sin)?;
        Ok(rotated.to_dtype(x.dtype())?)
    }
}

pub struct Qwen3VlVisionModel {
    patch_embed: Linear,
    pos_embed: Embedding,
    blocks: Vec<VisionBlock>,
    merger: PatchMerger,
    deepstack_mergers: Vec<PatchMerger>,
    deepstack_visual_indexes: Vec<usize>,
    config: Qwen3VlVisionConfig,
}

impl Qwen3VlVisionModel {
    /// `vb` points at `model.visual`
    pub fn load(vb: VarBuilder, config: &Qwen3VlVisionConfig) -> Result<Self> {
        let cfg = config;
        let proj = vb.pp("patch_embed").pp("proj");
        let weight = proj
            .get(
                (
                    cfg.hidden_size,
                    cfg.in_channels,
                    cfg.temporal_patch_size,
                    cfg.patch_size,
                    cfg.patch_size,
                ),
                "weight",
            )
            .context("missing patch_embed weight")?
            .reshape((cfg.hidden_size, cfg.patch_dim()))?;
        let bias = proj.get(cfg.hidden_size, "bias")?;
        let patch_embed = Linear::new(weight, Some(bias));

        let pos_embed = candle_nn::embedding(
            cfg.num_position_embeddings,
            cfg.hidden_size,
            vb.pp("pos_embed"),
        )?;

        let mut blocks = Vec::with_capacity(cfg.depth);
        for i in 0..cfg.depth {
            blocks.push(VisionBlock::load(vb.pp(format!("blocks.{i}")), cfg)?);
        }
        let merger = PatchMerger::load(vb.pp("merger"), cfg, false)?;
        let deepstack_mergers = (0..cfg.deepstack_visual_indexes.len())
            .map(|j| PatchMerger::load(vb.pp(format!("deepstack_merger_list.{j}")), cfg, true))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            patch_embed,
            pos_embed,
            blocks,
            merger,
            deepstack_mergers,
            deepstack_visual_indexes: cfg.deepstack_visual_indexes.clone(),
            config: cfg.clone(),
        })
    }

    pub fn spatial_merge_size(&self) -> usize {
        self.config.spatial_merge_size
    }

    /// Learned position table resampled to the patch grid, merge-block order
    fn interpolated_pos_embed(&self, grid_thw: [u32; 3], positions: &[(usize, usize)]) -> Result<Tensor> {
        let [_, h, w] = grid_thw.map(|v| v as usize);
        let n = self.config.grid_per_side();
        let mut indices = vec![Vec::with_capacity(positions.len()); 4];
        let mut weights = vec![Vec::with_capacity(positions.len()); 4];
        for &(row, col) in positions {
            for (corner, (idx, wt)) in bilinear_taps(row, col, h, w, n).into_iter().enumerate() {
                indices[corner].push(idx);
                weights[corner].push(wt);
            }
        }
        let device = self.pos_embed.embeddings().device();
        let dtype = self.pos_embed.embeddings().dtype();
        let mut total: Option<Tensor> = None;
        for (idx, wt) in indices.into_iter().zip(weights) {
            let len = idx.len();
            let idx = Tensor::from_vec(idx, len, device)?;
            let wt = Tensor::from_vec(wt, (len, 1), device)?.to_dtype(dtype)?;
            let term = self.pos_embed.forward(&idx)?.broadcast_mul(&wt)?;
            total = Some(match total {
                Some(acc) => (acc + term)?,
                None => term,
            });
        }
        total.context("empty position table")
    }

    /// Encode `[n_patches, patch_dim]` pixel values for one image
    pub fn forward(&self, pixel_values: &Tensor, grid_thw: [u32; 3]) -> Result<VisionOutput> {
        let merge = self.config.spatial_merge_size;
        let positions = merge_block_positions(grid_thw, merge)?;
        let (n_patches, patch_dim) = pixel_values.dims2()?;
        ensure!(
            n_patches == positions.len() && patch_dim == self.config.patch_dim(),
            "pixel values {n_patches}x{patch_dim} do not match grid {grid_thw:?}"
        );
        debug!("Vision tower: {} patches, grid {:?}", n_patches, grid_thw);

        let dtype = self.pos_embed.embeddings().dtype();
        let device = pixel_values.device();
        let hidden = self.patch_embed.forward(&pixel_values.to_dtype(dtype)?)?;
        let mut hidden = (hidden + self.interpolated_pos_embed(grid_thw, &positions)?)?;

        let rotary = VisionRope::new(&positions, self.config.head_dim(), device)?;
        let frame_len = (grid_thw[1] * grid_thw[2]) as usize;

        let mut deepstack = Vec::with_capacity(self.deepstack_mergers.len());
        for (i, block) in self.blocks.iter().enumerate() {
            hidden = block.forward(&hidden, &rotary, frame_len)?;
            if let Some(j) = self.deepstack_visual_indexes.iter().position(|&d| d == i) {
                deepstack.push(self.deepstack_mergers[j].forward(&hidden)?);
            }
        }
        let embeds = self.merger.forward(&hidden)?;
        ensure!(
            embeds.dim(D::Minus2)? == n_patches / (merge * merge),
            "merger produced {} tokens for {} patches",
            embeds.dim(D::Minus2)?,
            n_patches
        );
        Ok(VisionOutput { embeds, deepstack })
    }
}
