//! Run metadata (`meta.json`) and readers for a finished run
//!
//! `meta.json` is written last. A directory without it holds an aborted run
//! and its attention files must not be read.

use std::path::Path;

use anyhow::{bail, Context, Result};
use half::f16;
use serde::{Deserialize, Serialize};

use crate::adapter::TokenKind;
use crate::attention::{attention_file_len, attention_file_name};
use crate::error::ExtractError;
use crate::extract::ExtractionMode;
use crate::grid::GridSummary;

pub const META_FILE_NAME: &str = "meta.json";
pub const IMAGE_FILE_NAME: &str = "image.jpg";
pub const ATTENTION_DTYPE: &str = "float16";

/// One position of the token sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEntry {
    /// Sequence position
    pub id: usize,
    /// Decoded text, special-token markup included
    pub text: String,
    #[serde(rename = "type")]
    pub kind: TokenKind,
    /// `[row, col]` for image placeholders
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid_pos: Option<[usize; 2]>,
}

/// Contents of `meta.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub model: String,
    pub mode: ExtractionMode,
    pub prompt: String,
    pub image_path: String,
    /// Original `[width, height]` in pixels
    pub image_size: [u32; 2],
    pub num_layers: usize,
    pub num_heads: usize,
    pub seq_len: usize,
    pub dtype: String,
    pub tokens: Vec<TokenEntry>,
    pub image_grid: GridSummary,
}

impl RunMetadata {
    /// Write as pretty-printed UTF-8 JSON (non-ASCII kept as is)
    pub fn save(&self, dir: &Path) -> Result<u64> {
        let path = dir.join(META_FILE_NAME);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, &json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(json.len() as u64)
    }

    /// Read `meta.json` of a completed run
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(META_FILE_NAME);
        if !path.exists() {
            return Err(ExtractError::IncompleteRun(dir.to_path_buf()).into());
        }
        let json = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&json).with_context(|| format!("Malformed {}", path.display()))
    }

    /// Tokens carrying a grid position
    pub fn image_tokens(&self) -> impl Iterator<Item = &TokenEntry> {
        self.tokens.iter().filter(|t| t.grid_pos.is_some())
    }
}

/// Read one layer of a completed run as a flat `(heads, seq, seq)` array
pub fn read_attention_layer(dir: &Path, layer: usize, meta: &RunMetadata) -> Result<Vec<f16>> {
    if layer >= meta.num_layers {
        bail!(
            "layer {} out of range, run has {} layers",
            layer,
            meta.num_layers
        );
    }
    let path = dir.join(attention_file_name(layer));
    let bytes =
        std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    let expected = attention_file_len(meta.num_heads, meta.seq_len);
    if bytes.len() as u64 != expected {
        bail!(
            "{} is {} bytes, expected {}",
            path.display(),
            bytes.len(),
            expected
        );
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|b| f16::from_le_bytes([b[0], b[1]]))
        .collect())
}
