//! Qwen3-VL family: multimodal model and adapter
//!
//! The model splices vision-tower features into the token embeddings at the
//! `<|image_pad|>` positions, assigns multimodal rotary positions, and runs
//! the text decoder either through a KV cache (greedy decoding) or once over
//! the whole sequence with attention capture.

use std::path::Path;

use anyhow::{ensure, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use serde::Deserialize;
use tracing::{debug, info};

use crate::adapter::{AttentionModel, ChatContent, ChatMessage, ModelAdapter, ModelInputs};
use crate::attention::AttentionCache;
use crate::error::ExtractError;
use crate::forward_qwen3_vl::{
    argmax_token, DeepstackInjection, Qwen3VlTextConfig, Qwen3VlTextModel,
};
use crate::processor::Processor;
use crate::vision_qwen3_vl::{Qwen3VlVisionConfig, Qwen3VlVisionModel};
use crate::weights::ModelFiles;

// Qwen VL special token ids, shared across the family
pub const VISION_START_ID: u32 = 151_652;
pub const VISION_END_ID: u32 = 151_653;
pub const IMAGE_TOKEN_ID: u32 = 151_655;

/// `<|im_end|>`, `<|endoftext|>`
const DEFAULT_EOS_IDS: [u32; 2] = [151_645, 151_643];

const PATCH_SIZE: u32 = 16;
const MERGE_SIZE: u32 = 2;

const IM_START: &str = "<|im_start|>";
const IM_END: &str = "<|im_end|>";
const IMAGE_PAD: &str = "<|image_pad|>";
const VISION_START: &str = "<|vision_start|>";
const VISION_END: &str = "<|vision_end|>";

fn default_image_token_id() -> u32 {
    IMAGE_TOKEN_ID
}

/// Top-level `config.json` of a Qwen3-VL checkpoint
#[derive(Debug, Clone, Deserialize)]
pub struct Qwen3VlConfig {
    pub text_config: Qwen3VlTextConfig,
    pub vision_config: Qwen3VlVisionConfig,
    #[serde(default = "default_image_token_id")]
    pub image_token_id: u32,
    #[serde(default)]
    pub tie_word_embeddings: Option<bool>,
}

/// Multimodal rotary positions for a token sequence.
///
/// Text tokens get `(p, p, p)`. A run of image placeholders covering an
/// `llm_grid = (t, h, w)` block starts at the next free position `base` and
/// token `k` gets `(base + k / (h*w), base + row, base + col)`. Text after
/// the block resumes at one past the largest position used.
///
/// Returns the positions and the rope delta (`max + 1 - len`) used to
/// position tokens appended during decoding.
pub fn rope_index(
    token_ids: &[u32],
    image_token_id: u32,
    llm_grid: Option<[usize; 3]>,
) -> (Vec<[i64; 3]>, i64) {
    let mut positions = Vec::with_capacity(token_ids.len());
    let mut next: i64 = 0;
    let mut i = 0;
    while i < token_ids.len() {
        match llm_grid {
            Some([t, h, w]) if token_ids[i] == image_token_id && t * h * w > 0 => {
                let base = next;
                let mut max_pos = base;
                let mut k = 0;
                while k < t * h * w && i < token_ids.len() && token_ids[i] == image_token_id {
                    let pos = [
                        base + (k / (h * w)) as i64,
                        base + ((k / w) % h) as i64,
                        base + (k % w) as i64,
                    ];
                    max_pos = max_pos.max(pos[0]).max(pos[1]).max(pos[2]);
                    positions.push(pos);
                    k += 1;
                    i += 1;
                }
                next = max_pos + 1;
            }
            _ => {
                positions.push([next; 3]);
                next += 1;
                i += 1;
            }
        }
    }
    (positions, next - token_ids.len() as i64)
}

/// Render chat messages with the Qwen template and an open assistant turn
pub fn render_chat(messages: &[ChatMessage], thinking: bool) -> String {
    let mut text = String::new();
    for message in messages {
        text.push_str(IM_START);
        text.push_str(&message.role);
        text.push('\n');
        for content in &message.content {
            match content {
                ChatContent::Image(_) => {
                    text.push_str(VISION_START);
                    text.push_str(IMAGE_PAD);
                    text.push_str(VISION_END);
                }
                ChatContent::Text(t) => text.push_str(t),
            }
        }
        text.push_str(IM_END);
        text.push('\n');
    }
    text.push_str(IM_START);
    text.push_str("assistant\n");
    if thinking {
        text.push_str("<think>\n");
    }
    text
}

struct PreparedSequence {
    token_ids: Vec<u32>,
    embeds: Tensor,
    positions: Vec<[i64; 3]>,
    rope_delta: i64,
    deepstack: Option<DeepstackInjection>,
}

/// Qwen3-VL vision tower plus language model
pub struct Qwen3VlModel {
    visual: Qwen3VlVisionModel,
    text: Qwen3VlTextModel,
    image_token_id: u32,
    eos_token_ids: Vec<u32>,
}

impl Qwen3VlModel {
    /// Build from a checkpoint-root `VarBuilder`
    pub fn new(config: &Qwen3VlConfig, vb: VarBuilder) -> Result<Self> {
        let mut text_config = config.text_config.clone();
        if text_config.tie_word_embeddings.is_none() {
            text_config.tie_word_embeddings = config.tie_word_embeddings;
        }

        info!(
            "Vision config: {} blocks, {} hidden, deepstack at {:?}",
            config.vision_config.depth,
            config.vision_config.hidden_size,
            config.vision_config.deepstack_visual_indexes
        );
        let visual = Qwen3VlVisionModel::load(vb.pp("model.visual"), &config.vision_config)?;
        let text = Qwen3VlTextModel::load(vb.pp("model.language_model"), vb.clone(), &text_config)?;

        let mut eos_token_ids = text_config
            .eos_token_id
            .as_ref()
            .map(|e| e.ids())
            .unwrap_or_default();
        eos_token_ids.extend(DEFAULT_EOS_IDS);
        eos_token_ids.sort_unstable();
        eos_token_ids.dedup();

        Ok(Self {
            visual,
            text,
            image_token_id: config.image_token_id,
            eos_token_ids,
        })
    }

    /// Load config and memory-mapped weights
    pub fn load(files: &ModelFiles, device: &Device, dtype: DType) -> Result<Self> {
        let config_str =
            std::fs::read_to_string(&files.config).context("Failed to read config")?;
        let config: Qwen3VlConfig =
            serde_json::from_str(&config_str).context("Failed to parse Qwen3-VL config")?;

        // SAFETY: the shard files are not modified while mapped
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, device)? };
        let model = Self::new(&config, vb)?;
        info!(
            "Model loaded successfully with {} layers",
            model.text.n_layers()
        );
        Ok(model)
    }

    /// Embed tokens, splice in image features and compute rotary positions
    fn prepare(&self, inputs: &ModelInputs) -> Result<PreparedSequence> {
        let token_ids = inputs.token_ids()?;
        let device = inputs.input_ids.device();
        let mut embeds = self.text.embed(&inputs.input_ids)?;
        let image_idx: Vec<u32> = token_ids
            .iter()
            .enumerate()
            .filter(|(_, &id)| id == self.image_token_id)
            .map(|(i, _)| i as u32)
            .collect();

        let mut llm_grid = None;
        let mut deepstack = None;
        if let Some(vision) = &inputs.vision {
            let merge = self.visual.spatial_merge_size();
            let [t, h, w] = vision.grid_thw.map(|v| v as usize);
            llm_grid = Some([t, h / merge, w / merge]);

            if !image_idx.is_empty() {
                let out = self.visual.forward(&vision.pixel_values, vision.grid_thw)?;
                let n_features = out.embeds.dim(0)?;
                ensure!(
                    n_features == image_idx.len(),
                    "sequence holds {} image tokens but the vision tower produced {} features",
                    image_idx.len(),
                    n_features
                );
                let positions = Tensor::new(image_idx.as_slice(), device)?;
                let keep: Vec<f32> = token_ids
                    .iter()
                    .map(|&id| if id == self.image_token_id { 0.0 } else { 1.0 })
                    .collect();
                let keep = Tensor::from_vec(keep, (1, token_ids.len(), 1), device)?
                    .to_dtype(embeds.dtype())?;
                let features = out.embeds.to_dtype(embeds.dtype())?.unsqueeze(0)?;
                embeds = embeds
                    .broadcast_mul(&keep)?
                    .index_add(&positions, &features, 1)?;
                deepstack = Some(DeepstackInjection {
                    positions,
                    features: out.deepstack,
                });
            }
        }

        let (positions, rope_delta) = rope_index(&token_ids, self.image_token_id, llm_grid);
        Ok(PreparedSequence {
            token_ids,
            embeds,
            positions,
            rope_delta,
            deepstack,
        })
    }
}

impl AttentionModel for Qwen3VlModel {
    fn num_layers(&self) -> usize {
        self.text.n_layers()
    }

    fn num_heads(&self) -> usize {
        self.text.n_heads()
    }

    /// Greedy decoding with KV cache. The stop token, when reached, is kept.
    fn generate(&self, inputs: &ModelInputs, max_new_tokens: usize) -> Result<Vec<u32>> {
        let prepared = self.prepare(inputs)?;
        let mut tokens = prepared.token_ids.clone();
        if max_new_tokens == 0 {
            return Ok(tokens);
        }

        let device = inputs.input_ids.device();
        let mut kv_cache = self.text.new_kv_cache();
        let mut logits = self.text.forward_with_kv_cache(
            &prepared.embeds,
            &prepared.positions,
            prepared.deepstack.as_ref(),
            &mut kv_cache,
        )?;

        for step in 1..=max_new_tokens {
            let next = argmax_token(&logits)?;
            tokens.push(next);
            if self.eos_token_ids.contains(&next) {
                debug!("Stop token {} after {} new tokens", next, step);
                break;
            }
            if step == max_new_tokens {
                break;
            }
            if step % 32 == 0 {
                debug!("Generated {}/{} tokens", step, max_new_tokens);
            }

            let pos = (tokens.len() - 1) as i64 + prepared.rope_delta;
            let input = Tensor::new(&[next], device)?.unsqueeze(0)?;
            logits = self.text.forward_with_kv_cache(
                &self.text.embed(&input)?,
                &[[pos; 3]],
                None,
                &mut kv_cache,
            )?;
        }
        Ok(tokens)
    }

    fn forward_with_attention(&self, inputs: &ModelInputs) -> Result<AttentionCache> {
        let prepared = self.prepare(inputs)?;
        let (_, cache) = self.text.forward_with_attention(
            &prepared.embeds,
            &prepared.positions,
            prepared.deepstack.as_ref(),
        )?;
        Ok(cache)
    }
}

/// Adapter for Qwen3-VL checkpoints (2B, 4B, 8B; Instruct and Thinking)
#[derive(Debug, Clone, Copy, Default)]
pub struct Qwen3VlAdapter;

impl ModelAdapter for Qwen3VlAdapter {
    fn family(&self) -> &'static str {
        "qwen3-vl"
    }

    fn default_model_name(&self) -> &'static str {
        "Qwen/Qwen3-VL-2B-Thinking"
    }

    fn image_token_id(&self) -> u32 {
        IMAGE_TOKEN_ID
    }

    fn effective_patch_size(&self) -> u32 {
        PATCH_SIZE * MERGE_SIZE
    }

    fn load(
        &self,
        model_id: &str,
        device: &Device,
        dtype: DType,
    ) -> Result<(Box<dyn AttentionModel>, Processor)> {
        let load = || -> Result<(Box<dyn AttentionModel>, Processor)> {
            let files = ModelFiles::resolve(model_id)?;
            let processor =
                Processor::from_files(&files.tokenizer, files.preprocessor_config.as_deref())?
                    .with_model_id(model_id);
            let model = Qwen3VlModel::load(&files, device, dtype)?;
            Ok((Box::new(model), processor))
        };
        load().map_err(|e| ExtractError::model_load(model_id, e).into())
    }

    fn preprocess(
        &self,
        processor: &Processor,
        messages: &[ChatMessage],
        device: &Device,
    ) -> Result<ModelInputs> {
        let thinking = processor.model_id().to_lowercase().contains("thinking");
        let text = render_chat(messages, thinking);

        let image_path: Option<&Path> = messages.iter().flat_map(ChatMessage::image_paths).next();
        let Some(image_path) = image_path else {
            return ModelInputs::new(&processor.encode(&text)?, None, device);
        };

        let vision = processor.load_image(image_path, device)?;
        let n_image_tokens = vision.n_merged_tokens(processor.image_config().merge_size as u32);
        debug!(
            "Image grid {:?} -> {} placeholder tokens",
            vision.grid_thw, n_image_tokens
        );

        let mut token_ids = Vec::new();
        for (i, piece) in text.split(IMAGE_PAD).enumerate() {
            if i > 0 {
                token_ids.extend(std::iter::repeat(self.image_token_id()).take(n_image_tokens));
            }
            token_ids.extend(processor.encode(piece)?);
        }
        ModelInputs::new(&token_ids, Some(vision), device)
    }
}
