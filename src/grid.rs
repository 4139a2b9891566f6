//! Image-token spatial alignment
//!
//! Maps the flattened multimodal token sequence back onto the 2-D patch grid
//! of the source image. Placeholder tokens are assumed to be emitted in
//! row-major raster order, one per effective patch (patch size x spatial merge).
//!
//! Tokens that are not placeholders but sit inside the image block (row
//! separators, for families that emit them) are skipped: they get no grid
//! position and do not advance the raster counter.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::ExtractError;

/// A contiguous block of image-placeholder tokens and their grid positions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageGrid {
    /// Rows of the grid derived from the original image height
    pub rows: usize,
    /// Columns of the grid derived from the original image width
    pub cols: usize,
    /// Index of the first placeholder token (inclusive)
    pub start_idx: usize,
    /// Index of the last placeholder token (inclusive)
    pub end_idx: usize,
    /// Token index -> (row, col), placeholders only
    pub positions: BTreeMap<usize, (usize, usize)>,
}

/// Spatial metadata for the image tokens of one run.
///
/// `Empty` is the "no image token present" case; it reports zero for every
/// bound and has no positions, so metadata assembly never needs a null path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GridInfo {
    Empty,
    Image(ImageGrid),
}

/// `image_grid` object as written into `meta.json`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridSummary {
    pub rows: usize,
    pub cols: usize,
    pub start_idx: usize,
    pub end_idx: usize,
}

impl GridInfo {
    pub fn rows(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Image(grid) => grid.rows,
        }
    }

    pub fn cols(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Image(grid) => grid.cols,
        }
    }

    pub fn start_idx(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Image(grid) => grid.start_idx,
        }
    }

    pub fn end_idx(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Image(grid) => grid.end_idx,
        }
    }

    /// Grid position of a token, if it is a placeholder inside the block
    pub fn position(&self, token_idx: usize) -> Option<(usize, usize)> {
        match self {
            Self::Empty => None,
            Self::Image(grid) => grid.positions.get(&token_idx).copied(),
        }
    }

    /// Number of placeholder tokens with a grid position
    pub fn n_positions(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Image(grid) => grid.positions.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn summary(&self) -> GridSummary {
        GridSummary {
            rows: self.rows(),
            cols: self.cols(),
            start_idx: self.start_idx(),
            end_idx: self.end_idx(),
        }
    }
}

/// Align image-placeholder tokens with the image patch grid.
///
/// # Arguments
/// * `token_ids` - Full token sequence (after generation, if any)
/// * `image_token_id` - The family's reserved placeholder id
/// * `image_width`, `image_height` - Original (pre-resize) image size in pixels
/// * `effective_patch` - Pixels covered by one placeholder token
///
/// Fails with [`ExtractError::ImageTooSmall`] when an image block exists but
/// the image is narrower than one patch.
pub fn build_image_grid(
    token_ids: &[u32],
    image_token_id: u32,
    image_width: u32,
    image_height: u32,
    effective_patch: u32,
) -> Result<GridInfo> {
    let patch = effective_patch.max(1);
    let cols = (image_width / patch) as usize;
    let rows = (image_height / patch) as usize;

    let mut bounds: Option<(usize, usize)> = None;
    for (i, &id) in token_ids.iter().enumerate() {
        if id == image_token_id {
            bounds = Some(match bounds {
                None => (i, i),
                Some((start, _)) => (start, i),
            });
        }
    }

    let Some((start_idx, end_idx)) = bounds else {
        return Ok(GridInfo::Empty);
    };

    if cols == 0 {
        return Err(ExtractError::ImageTooSmall {
            width: image_width,
            height: image_height,
            patch,
        }
        .into());
    }

    let mut positions = BTreeMap::new();
    let mut k = 0usize;
    for (i, &id) in token_ids
        .iter()
        .enumerate()
        .take(end_idx + 1)
        .skip(start_idx)
    {
        if id == image_token_id {
            positions.insert(i, (k / cols, k % cols));
            k += 1;
        }
    }

    Ok(GridInfo::Image(ImageGrid {
        rows,
        cols,
        start_idx,
        end_idx,
        positions,
    }))
}
