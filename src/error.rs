//! Error taxonomy for attention extraction runs
//!
//! Every variant is fatal: the orchestrator aborts on the first one and
//! never writes a partial `meta.json`.

use std::path::PathBuf;

use thiserror::Error;

/// Failures callers may want to tell apart.
///
/// Library functions return `anyhow::Result`; these variants are the root
/// causes and can be recovered with `err.downcast_ref::<ExtractError>()`.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// Input image path does not exist
    #[error("image not found: {}", .0.display())]
    ImageNotFound(PathBuf),

    /// Explicit model family key is not registered
    #[error("unknown model type `{requested}`. Available: {available}")]
    UnknownModelType { requested: String, available: String },

    /// No family was given and none could be inferred from the model name
    #[error("could not detect model type from `{model}`. Use --model-type ({available})")]
    FamilyDetectionFailed { model: String, available: String },

    /// Pretrained resources missing or incompatible
    #[error("failed to load model `{model}`")]
    ModelLoad {
        model: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Forward pass returned a different number of attention tensors than the model has layers
    #[error(
        "model reports {expected} layers but the forward pass returned {actual} attention tensors"
    )]
    AttentionCaptureMismatch { expected: usize, actual: usize },

    /// A captured attention tensor does not have the `(heads, seq, seq)` shape
    #[error("attention tensor for layer {layer} has shape {actual:?}, expected {expected:?}")]
    AttentionShapeMismatch {
        layer: usize,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Image is narrower than one effective patch, so no grid column exists
    #[error("image is {width}x{height}px, narrower than one {patch}px patch")]
    ImageTooSmall { width: u32, height: u32, patch: u32 },

    /// Output directory holds no `meta.json`; attention files there are not a complete run
    #[error("run in {} is incomplete: meta.json is missing", .0.display())]
    IncompleteRun(PathBuf),
}

impl ExtractError {
    /// Wrap any load failure for `model`, keeping the cause chain.
    pub fn model_load(model: &str, source: anyhow::Error) -> Self {
        Self::ModelLoad {
            model: model.to_string(),
            source: source.into(),
        }
    }
}
