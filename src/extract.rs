//! Extraction orchestrator
//!
//! One run walks the stages `Load -> Preprocess -> Generate? -> Forward ->
//! Serialize -> Finalize` in order. All model-family behaviour is delegated
//! to the [`ModelAdapter`]; this module owns I/O and sequencing.
//!
//! `meta.json` is the last file written. If any stage fails the run stops
//! and no metadata is emitted, so attention files without a `meta.json` are
//! from an aborted run.

use std::fmt;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use candle_core::{DType, Device};
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::adapter::{AttentionModel, ModelAdapter, ModelInputs};
use crate::attention::{attention_file_name, write_attention_f16, AttentionCache};
use crate::device::{default_dtype, parse_dtype, select_device};
use crate::error::ExtractError;
use crate::metadata::{
    RunMetadata, TokenEntry, ATTENTION_DTYPE, IMAGE_FILE_NAME, META_FILE_NAME,
};
use crate::processor::Processor;

const JPEG_QUALITY: u8 = 95;

/// Whether to decode before capturing attention
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMode {
    /// Attention over the prompt only
    #[default]
    Prefill,
    /// Greedy decoding first, then attention over prompt + generated tokens
    Generate,
}

impl fmt::Display for ExtractionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prefill => f.write_str("prefill"),
            Self::Generate => f.write_str("generate"),
        }
    }
}

/// Settings for one extraction run
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    pub image: PathBuf,
    pub prompt: String,
    pub output_dir: PathBuf,
    /// Model id or local directory; the adapter default when `None`
    pub model: Option<String>,
    /// Device string (`cpu`, `cuda:1`, ...); CUDA if available when `None`
    pub device: Option<String>,
    /// Compute dtype override; per-device default when `None`
    pub dtype: Option<String>,
    pub mode: ExtractionMode,
    /// Decoding bound, generate mode only
    pub max_new_tokens: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            image: PathBuf::new(),
            prompt: "Describe this image in detail.".to_string(),
            output_dir: PathBuf::from("attention_output"),
            model: None,
            device: None,
            dtype: None,
            mode: ExtractionMode::Prefill,
            max_new_tokens: 256,
        }
    }
}

/// What a finished run produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionSummary {
    pub output_dir: PathBuf,
    pub model: String,
    pub seq_len: usize,
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    /// Total size of the attention files
    pub attention_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Load,
    Preprocess,
    Generate,
    Forward,
    Serialize,
    Finalize,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Load => "load",
            Self::Preprocess => "preprocess",
            Self::Generate => "generate",
            Self::Forward => "forward",
            Self::Serialize => "serialize",
            Self::Finalize => "finalize",
        };
        f.write_str(name)
    }
}

struct Loaded {
    model_id: String,
    model: Box<dyn AttentionModel>,
    processor: Processor,
    image: DynamicImage,
    device: Device,
    num_layers: usize,
    num_heads: usize,
}

struct Sequence {
    inputs: ModelInputs,
    token_ids: Vec<u32>,
    prompt_len: usize,
}

/// Run one extraction end to end
pub fn run_extraction(
    adapter: &dyn ModelAdapter,
    config: &ExtractionConfig,
) -> Result<ExtractionSummary> {
    let loaded = stage(Stage::Load, || load(adapter, config))?;
    let sequence = stage(Stage::Preprocess, || preprocess(adapter, config, &loaded))?;
    let sequence = match config.mode {
        ExtractionMode::Prefill => sequence,
        ExtractionMode::Generate => stage(Stage::Generate, || {
            generate(&loaded, sequence, config.max_new_tokens)
        })?,
    };
    let cache = stage(Stage::Forward, || forward(&loaded, &sequence))?;
    let attention_bytes = stage(Stage::Serialize, || {
        serialize(cache, &config.output_dir)
    })?;
    stage(Stage::Finalize, || {
        finalize(adapter, config, &loaded, &sequence)
    })?;

    let summary = ExtractionSummary {
        output_dir: config.output_dir.clone(),
        model: loaded.model_id.clone(),
        seq_len: sequence.token_ids.len(),
        prompt_tokens: sequence.prompt_len,
        generated_tokens: sequence.token_ids.len().saturating_sub(sequence.prompt_len),
        num_layers: loaded.num_layers,
        num_heads: loaded.num_heads,
        attention_bytes,
    };
    log_summary(&summary)?;
    Ok(summary)
}

fn stage<T>(stage: Stage, f: impl FnOnce() -> Result<T>) -> Result<T> {
    info!("[{}]", stage);
    f().with_context(|| format!("{stage} stage failed"))
}

fn load(adapter: &dyn ModelAdapter, config: &ExtractionConfig) -> Result<Loaded> {
    std::fs::create_dir_all(&config.output_dir).with_context(|| {
        format!(
            "Failed to create output directory {}",
            config.output_dir.display()
        )
    })?;
    if !config.image.exists() {
        return Err(ExtractError::ImageNotFound(config.image.clone()).into());
    }
    let image = image::open(&config.image)
        .with_context(|| format!("Failed to decode image {}", config.image.display()))?;
    let patch = adapter.effective_patch_size();
    if image.width() < patch {
        return Err(ExtractError::ImageTooSmall {
            width: image.width(),
            height: image.height(),
            patch,
        }
        .into());
    }
    info!(
        "Image: {} ({}x{})",
        config.image.display(),
        image.width(),
        image.height()
    );

    let device = select_device(config.device.as_deref())?;
    let dtype: DType = match config.dtype.as_deref() {
        Some(s) => parse_dtype(s)?,
        None => default_dtype(&device),
    };
    let model_id = config
        .model
        .clone()
        .unwrap_or_else(|| adapter.default_model_name().to_string());
    info!(
        "Loading {} ({}) on {:?} as {:?}",
        model_id,
        adapter.family(),
        device,
        dtype
    );

    let (model, processor) = adapter.load(&model_id, &device, dtype)?;
    let num_layers = adapter.get_num_layers(model.as_ref());
    let num_heads = adapter.get_num_heads(model.as_ref());
    info!("Model: {} layers, {} heads", num_layers, num_heads);

    Ok(Loaded {
        model_id,
        model,
        processor,
        image,
        device,
        num_layers,
        num_heads,
    })
}

fn preprocess(
    adapter: &dyn ModelAdapter,
    config: &ExtractionConfig,
    loaded: &Loaded,
) -> Result<Sequence> {
    let messages = adapter.build_messages(&config.image, &config.prompt);
    let inputs = adapter.preprocess(&loaded.processor, &messages, &loaded.device)?;
    let token_ids = inputs.token_ids()?;
    info!("Input sequence: {} tokens", token_ids.len());
    Ok(Sequence {
        inputs,
        prompt_len: token_ids.len(),
        token_ids,
    })
}

fn generate(loaded: &Loaded, sequence: Sequence, max_new_tokens: usize) -> Result<Sequence> {
    let token_ids = loaded.model.generate(&sequence.inputs, max_new_tokens)?;
    ensure!(
        token_ids.starts_with(&sequence.token_ids),
        "generated sequence of {} tokens does not extend the {}-token prompt",
        token_ids.len(),
        sequence.prompt_len
    );
    let generated = token_ids.len() - sequence.prompt_len;
    info!(
        "Generated {} tokens (sequence now {})",
        generated,
        token_ids.len()
    );
    debug!(
        "Generated text: {:?}",
        loaded
            .processor
            .tokenizer()
            .decode(&token_ids[sequence.prompt_len..], true)
            .unwrap_or_default()
    );
    Ok(Sequence {
        inputs: sequence.inputs.with_token_ids(&token_ids)?,
        token_ids,
        prompt_len: sequence.prompt_len,
    })
}

fn forward(loaded: &Loaded, sequence: &Sequence) -> Result<AttentionCache> {
    let cache = loaded.model.forward_with_attention(&sequence.inputs)?;
    cache.validate(loaded.num_layers, loaded.num_heads, sequence.token_ids.len())?;
    info!("Captured attention for {} layers", cache.n_layers());
    Ok(cache)
}

fn serialize(cache: AttentionCache, output_dir: &Path) -> Result<u64> {
    let mut total = 0;
    for (layer, pattern) in cache.into_layers().into_iter().enumerate() {
        let name = attention_file_name(layer);
        let written = write_attention_f16(&pattern, &output_dir.join(&name))?;
        info!(
            "Saved {} ({:.1} MB)",
            name,
            written as f64 / (1024.0 * 1024.0)
        );
        total += written;
    }
    Ok(total)
}

fn finalize(
    adapter: &dyn ModelAdapter,
    config: &ExtractionConfig,
    loaded: &Loaded,
    sequence: &Sequence,
) -> Result<()> {
    let (width, height) = (loaded.image.width(), loaded.image.height());
    let grid = adapter.build_image_grid(&sequence.token_ids, width, height)?;
    if !grid.is_empty() {
        info!(
            "Image grid: {}x{} (tokens {}..={})",
            grid.rows(),
            grid.cols(),
            grid.start_idx(),
            grid.end_idx()
        );
    }

    let tokens: Vec<TokenEntry> = sequence
        .token_ids
        .iter()
        .enumerate()
        .map(|(idx, &id)| {
            let text = loaded.processor.decode_token(id);
            TokenEntry {
                id: idx,
                kind: adapter.classify_token(id, &text),
                text,
                grid_pos: grid.position(idx).map(|(row, col)| [row, col]),
            }
        })
        .collect();

    // image first: meta.json must be the last file of a complete run
    save_image(&config.image, &loaded.image, &config.output_dir.join(IMAGE_FILE_NAME))?;

    let meta = RunMetadata {
        model: loaded.model_id.clone(),
        mode: config.mode,
        prompt: config.prompt.clone(),
        image_path: IMAGE_FILE_NAME.to_string(),
        image_size: [width, height],
        num_layers: loaded.num_layers,
        num_heads: loaded.num_heads,
        seq_len: sequence.token_ids.len(),
        dtype: ATTENTION_DTYPE.to_string(),
        tokens,
        image_grid: grid.summary(),
    };
    meta.save(&config.output_dir)?;
    Ok(())
}

/// Copy JPEG sources byte-for-byte, re-encode anything else
fn save_image(source: &Path, image: &DynamicImage, dest: &Path) -> Result<()> {
    let is_jpeg = source
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("jpg") || e.eq_ignore_ascii_case("jpeg"));
    if is_jpeg {
        std::fs::copy(source, dest)
            .with_context(|| format!("Failed to copy image to {}", dest.display()))?;
    } else {
        let file = File::create(dest)
            .with_context(|| format!("Failed to create {}", dest.display()))?;
        let encoder = JpegEncoder::new_with_quality(BufWriter::new(file), JPEG_QUALITY);
        image
            .to_rgb8()
            .write_with_encoder(encoder)
            .with_context(|| format!("Failed to encode {}", dest.display()))?;
    }
    Ok(())
}

fn log_summary(summary: &ExtractionSummary) -> Result<()> {
    let meta_len = std::fs::metadata(summary.output_dir.join(META_FILE_NAME))?.len();
    info!("Output: {}", summary.output_dir.display());
    info!("  meta.json ({:.1} KB)", meta_len as f64 / 1024.0);
    info!(
        "  {} attention files ({:.1} MB total)",
        summary.num_layers,
        summary.attention_bytes as f64 / (1024.0 * 1024.0)
    );
    info!(
        "  {} tokens ({} prompt + {} generated)",
        summary.seq_len, summary.prompt_tokens, summary.generated_tokens
    );
    Ok(())
}
