//! Model-family abstraction
//!
//! The extraction pipeline only talks to a model family through
//! [`ModelAdapter`]. Everything family-specific (checkpoint layout, chat
//! markup, image preprocessing, placeholder ids, patch geometry) lives
//! behind it; the loaded network itself is an [`AttentionModel`].

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Result;
use candle_core::{DType, Device, IndexOp, Tensor};
use serde::{Deserialize, Serialize};

use crate::attention::AttentionCache;
use crate::grid::{build_image_grid, GridInfo};
use crate::processor::Processor;

/// Role of a token in the multimodal sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    /// Image placeholder, one per merged patch
    Image,
    /// Chat or control markup such as `<|im_start|>` or `<think>`
    Special,
    Text,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Image => "image",
            Self::Special => "special",
            Self::Text => "text",
        };
        f.write_str(name)
    }
}

/// Classify a decoded token the way chat-markup tokenizers render it.
///
/// `image` iff the id is the placeholder id; `special` iff the text is
/// wrapped in `<|...|>` or `<...>`; otherwise `text`.
pub fn classify_markup_token(token_id: u32, token_text: &str, image_token_id: u32) -> TokenKind {
    if token_id == image_token_id {
        return TokenKind::Image;
    }
    let wrapped = |open: &str, close: &str| {
        token_text.len() >= open.len() + close.len()
            && token_text.starts_with(open)
            && token_text.ends_with(close)
    };
    if wrapped("<|", "|>") || wrapped("<", ">") {
        TokenKind::Special
    } else {
        TokenKind::Text
    }
}

/// One part of a chat message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatContent {
    Image(PathBuf),
    Text(String),
}

/// A single chat turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: Vec<ChatContent>,
}

impl ChatMessage {
    /// Single-turn user request: the image first, then the prompt
    pub fn user_with_image(image_path: &Path, prompt: &str) -> Self {
        let image_path = image_path
            .canonicalize()
            .unwrap_or_else(|_| image_path.to_path_buf());
        Self {
            role: "user".to_string(),
            content: vec![
                ChatContent::Image(image_path),
                ChatContent::Text(prompt.to_string()),
            ],
        }
    }

    pub fn image_paths(&self) -> impl Iterator<Item = &Path> {
        self.content.iter().filter_map(|c| match c {
            ChatContent::Image(p) => Some(p.as_path()),
            ChatContent::Text(_) => None,
        })
    }
}

/// Encoded image tensors for the vision tower
#[derive(Debug, Clone)]
pub struct VisionInputs {
    /// Flattened patches: `[n_patches, C * T * P * P]`
    pub pixel_values: Tensor,
    /// Patch grid `(t, h, w)` before spatial merging
    pub grid_thw: [u32; 3],
}

impl VisionInputs {
    /// Placeholder tokens this image expands to after merging
    pub fn n_merged_tokens(&self, merge_size: u32) -> usize {
        let [t, h, w] = self.grid_thw;
        let m = merge_size.max(1);
        (t * (h / m) * (w / m)) as usize
    }
}

/// Named tensor bundle fed to the model
#[derive(Debug, Clone)]
pub struct ModelInputs {
    /// `[1, seq_len]` u32
    pub input_ids: Tensor,
    /// `[1, seq_len]` u32, all ones for a single unpadded sequence
    pub attention_mask: Tensor,
    pub vision: Option<VisionInputs>,
}

impl ModelInputs {
    pub fn new(token_ids: &[u32], vision: Option<VisionInputs>, device: &Device) -> Result<Self> {
        let input_ids = Tensor::new(token_ids, device)?.unsqueeze(0)?;
        let attention_mask = Tensor::ones((1, token_ids.len()), DType::U32, device)?;
        Ok(Self {
            input_ids,
            attention_mask,
            vision,
        })
    }

    /// Token ids of the single batch row
    pub fn token_ids(&self) -> Result<Vec<u32>> {
        Ok(self.input_ids.i(0)?.to_vec1::<u32>()?)
    }

    pub fn seq_len(&self) -> Result<usize> {
        Ok(self.input_ids.dim(1)?)
    }

    /// Replace the token sequence, regenerating an all-ones mask.
    ///
    /// Vision tensors describe the fixed image and are carried over as-is.
    pub fn with_token_ids(&self, token_ids: &[u32]) -> Result<Self> {
        Self::new(token_ids, self.vision.clone(), self.input_ids.device())
    }
}

/// A loaded model able to return dense attention weights
pub trait AttentionModel {
    fn num_layers(&self) -> usize;
    fn num_heads(&self) -> usize;

    /// Greedy decoding; returns prompt ids followed by generated ids
    fn generate(&self, inputs: &ModelInputs, max_new_tokens: usize) -> Result<Vec<u32>>;

    /// One forward pass over the whole sequence, capturing every layer's
    /// attention weights as `[1, heads, seq, seq]`
    fn forward_with_attention(&self, inputs: &ModelInputs) -> Result<AttentionCache>;
}

/// Family-specific strategy used by the extraction pipeline.
///
/// Implementations are stateless and may be reused across runs.
pub trait ModelAdapter: Send + Sync {
    /// Registry key of this family
    fn family(&self) -> &'static str;

    /// Checkpoint used when the caller names none
    fn default_model_name(&self) -> &'static str;

    /// Reserved image-placeholder token id
    fn image_token_id(&self) -> u32;

    /// Pixels covered by one placeholder token (patch size x spatial merge)
    fn effective_patch_size(&self) -> u32;

    /// Load weights and processor. Must select the eager attention path so
    /// that dense weights are available.
    fn load(
        &self,
        model_id: &str,
        device: &Device,
        dtype: DType,
    ) -> Result<(Box<dyn AttentionModel>, Processor)>;

    fn build_messages(&self, image_path: &Path, prompt: &str) -> Vec<ChatMessage> {
        vec![ChatMessage::user_with_image(image_path, prompt)]
    }

    fn preprocess(
        &self,
        processor: &Processor,
        messages: &[ChatMessage],
        device: &Device,
    ) -> Result<ModelInputs>;

    fn classify_token(&self, token_id: u32, token_text: &str) -> TokenKind {
        classify_markup_token(token_id, token_text, self.image_token_id())
    }

    fn build_image_grid(
        &self,
        token_ids: &[u32],
        image_width: u32,
        image_height: u32,
    ) -> Result<GridInfo> {
        build_image_grid(
            token_ids,
            self.image_token_id(),
            image_width,
            image_height,
            self.effective_patch_size(),
        )
    }

    fn get_num_layers(&self, model: &dyn AttentionModel) -> usize {
        model.num_layers()
    }

    fn get_num_heads(&self, model: &dyn AttentionModel) -> usize {
        model.num_heads()
    }
}
