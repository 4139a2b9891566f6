// Pedantic clippy configuration for ML/math codebase
#![allow(clippy::cast_precision_loss)] // usize→f64 for sizes and scales
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_possible_wrap)] // usize→i64 for rotary positions
#![allow(clippy::many_single_char_names)] // t, h, w, x standard in tensor code
#![allow(clippy::similar_names)] // `head`/`heads`, `row`/`rows`
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::cast_sign_loss)]

//! vlm-attention-viz: attention extraction for vision-language models
//!
//! Runs one image + prompt through a VLM, captures every layer's dense
//! self-attention and writes it next to token and image-grid metadata for
//! offline visualization.
//!
//! ## Architecture
//!
//! - `registry`: family key -> adapter factory, auto-detection from model names
//! - `adapter`: `ModelAdapter` strategy trait and the loaded `AttentionModel` handle
//! - `grid`: alignment of image-placeholder tokens with the image patch grid
//! - `extract`: the extraction pipeline (load, preprocess, generate, forward, serialize, finalize)
//! - `metadata`: `meta.json` schema and readers for finished runs
//! - `attention`: captured attention weights and their float16 file format
//! - `processor`: tokenizer wrapper and VLM image preprocessing
//! - `weights`: model file resolution (hub or local directory)
//! - `qwen3_vl`: Qwen3-VL adapter and multimodal model
//! - `forward_qwen3_vl`: Qwen3-VL text decoder with attention capture
//! - `vision_qwen3_vl`: Qwen3-VL vision tower
//! - `kv_cache`, `masks`: decoding support
//! - `device`: device and dtype selection

pub mod adapter;
pub mod attention;
pub mod device;
pub mod error;
pub mod extract;
pub mod forward_qwen3_vl;
pub mod grid;
pub mod kv_cache;
pub mod masks;
pub mod metadata;
pub mod processor;
pub mod qwen3_vl;
pub mod registry;
pub mod vision_qwen3_vl;
pub mod weights;

pub use adapter::{
    classify_markup_token, AttentionModel, ChatContent, ChatMessage, ModelAdapter, ModelInputs,
    TokenKind, VisionInputs,
};
pub use attention::{attention_file_len, attention_file_name, write_attention_f16, AttentionCache};
pub use device::{default_dtype, parse_device, parse_dtype, select_device};
pub use error::ExtractError;
pub use extract::{run_extraction, ExtractionConfig, ExtractionMode, ExtractionSummary};
pub use grid::{build_image_grid, GridInfo, GridSummary, ImageGrid};
pub use kv_cache::KVCache;
pub use masks::{clear_mask_caches, create_causal_mask, create_generation_mask};
pub use metadata::{read_attention_layer, RunMetadata, TokenEntry};
pub use processor::{ImageProcessorConfig, Processor};
pub use qwen3_vl::{Qwen3VlAdapter, Qwen3VlModel};
pub use registry::{detect_model_type, get_adapter, list_model_types, resolve_model_type};
pub use weights::ModelFiles;
