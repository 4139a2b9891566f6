//! Text and image preprocessing shared by vision-language families
//!
//! [`Processor`] wraps the tokenizer and the image preprocessing settings of
//! a checkpoint. Images are resized to a multiple of `patch * merge`,
//! normalised, and flattened into patches in merge-block order so that each
//! group of `merge * merge` consecutive patches becomes one placeholder token.

use std::path::Path;

use anyhow::{anyhow, ensure, Context, Result};
use candle_core::{Device, Tensor};
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use serde::Deserialize;
use tokenizers::Tokenizer;

use crate::adapter::VisionInputs;

/// Image preprocessing parameters (`preprocessor_config.json`)
#[derive(Debug, Clone, PartialEq)]
pub struct ImageProcessorConfig {
    pub patch_size: usize,
    pub temporal_patch_size: usize,
    pub merge_size: usize,
    pub min_pixels: usize,
    pub max_pixels: usize,
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
}

impl Default for ImageProcessorConfig {
    fn default() -> Self {
        Self {
            patch_size: 16,
            temporal_patch_size: 2,
            merge_size: 2,
            min_pixels: 65_536,
            max_pixels: 16_777_216,
            image_mean: [0.5, 0.5, 0.5],
            image_std: [0.5, 0.5, 0.5],
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawSize {
    shortest_edge: Option<usize>,
    longest_edge: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawImageProcessorConfig {
    patch_size: Option<usize>,
    temporal_patch_size: Option<usize>,
    #[serde(alias = "spatial_merge_size")]
    merge_size: Option<usize>,
    min_pixels: Option<usize>,
    max_pixels: Option<usize>,
    #[serde(default)]
    size: RawSize,
    image_mean: Option<[f32; 3]>,
    image_std: Option<[f32; 3]>,
}

impl From<RawImageProcessorConfig> for ImageProcessorConfig {
    fn from(raw: RawImageProcessorConfig) -> Self {
        let d = Self::default();
        Self {
            patch_size: raw.patch_size.unwrap_or(d.patch_size),
            temporal_patch_size: raw.temporal_patch_size.unwrap_or(d.temporal_patch_size),
            merge_size: raw.merge_size.unwrap_or(d.merge_size),
            min_pixels: raw
                .size
                .shortest_edge
                .or(raw.min_pixels)
                .unwrap_or(d.min_pixels),
            max_pixels: raw
                .size
                .longest_edge
                .or(raw.max_pixels)
                .unwrap_or(d.max_pixels),
            image_mean: raw.image_mean.unwrap_or(d.image_mean),
            image_std: raw.image_std.unwrap_or(d.image_std),
        }
    }
}

impl ImageProcessorConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawImageProcessorConfig =
            serde_json::from_str(json).context("Failed to parse preprocessor config")?;
        Ok(raw.into())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_json(&json)
    }

    /// Resize granularity in pixels
    pub fn factor(&self) -> u32 {
        (self.patch_size * self.merge_size) as u32
    }
}

/// Tokenizer plus image settings of one checkpoint
pub struct Processor {
    tokenizer: Tokenizer,
    image: ImageProcessorConfig,
    model_id: String,
}

impl Processor {
    pub fn new(tokenizer: Tokenizer, image: ImageProcessorConfig) -> Self {
        Self {
            tokenizer,
            image,
            model_id: String::new(),
        }
    }

    /// Record the checkpoint this processor belongs to
    pub fn with_model_id(mut self, model_id: &str) -> Self {
        self.model_id = model_id.to_string();
        self
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Load `tokenizer.json` and, when present, `preprocessor_config.json`
    pub fn from_files(tokenizer_path: &Path, preprocessor_path: Option<&Path>) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| anyhow!("Tokenizer error: {e}"))?;
        let image = match preprocessor_path {
            Some(path) => ImageProcessorConfig::load(path)?,
            None => ImageProcessorConfig::default(),
        };
        Ok(Self::new(tokenizer, image))
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn image_config(&self) -> &ImageProcessorConfig {
        &self.image
    }

    /// Encode text without adding BOS/EOS; chat markup resolves to added tokens
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow!("Tokenization error: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Decode one id, keeping special-token markup
    pub fn decode_token(&self, token_id: u32) -> String {
        self.tokenizer
            .decode(&[token_id], false)
            .unwrap_or_else(|_| format!("<{token_id}>"))
    }

    /// Load an image from disk and encode it for the vision tower
    pub fn load_image(&self, path: &Path, device: &Device) -> Result<VisionInputs> {
        let image = image::open(path)
            .with_context(|| format!("Failed to decode image {}", path.display()))?;
        self.preprocess_image(&image, device)
    }

    pub fn preprocess_image(&self, image: &DynamicImage, device: &Device) -> Result<VisionInputs> {
        preprocess_image(image, &self.image, device)
    }
}

/// Resize, normalise and patchify one image.
///
/// Output `pixel_values` is `[t * h * w, C * T * P * P]` with patches in
/// merge-block order; `grid_thw` counts patches before merging.
pub fn preprocess_image(
    image: &DynamicImage,
    cfg: &ImageProcessorConfig,
    device: &Device,
) -> Result<VisionInputs> {
    let rgb = image.to_rgb8();
    let (orig_w, orig_h) = rgb.dimensions();
    let (resized_h, resized_w) = smart_resize(
        orig_h,
        orig_w,
        cfg.factor(),
        cfg.min_pixels as u32,
        cfg.max_pixels as u32,
    )?;
    let resized: RgbImage = if (orig_w, orig_h) == (resized_w, resized_h) {
        rgb
    } else {
        image::imageops::resize(&rgb, resized_w, resized_h, FilterType::CatmullRom)
    };

    let normalised = normalise_rgb(&resized, cfg)?;
    let grid_h = resized_h as usize / cfg.patch_size;
    let grid_w = resized_w as usize / cfg.patch_size;
    ensure!(
        grid_h > 0 && grid_w > 0,
        "invalid resized dimensions: {resized_h}x{resized_w}"
    );
    let patches = patchify(&normalised, resized_w as usize, resized_h as usize, cfg)?;
    let patch_dim = 3 * cfg.temporal_patch_size.max(1) * cfg.patch_size * cfg.patch_size;
    let pixel_values = Tensor::from_vec(patches, (grid_h * grid_w, patch_dim), device)?;

    Ok(VisionInputs {
        pixel_values,
        grid_thw: [1, grid_h as u32, grid_w as u32],
    })
}

fn normalise_rgb(image: &RgbImage, cfg: &ImageProcessorConfig) -> Result<Vec<f32>> {
    let rescale = 1.0 / 255.0;
    let mut data = Vec::with_capacity((image.width() * image.height() * 3) as usize);
    for pixel in image.pixels() {
        for (idx, &value) in pixel.0.iter().enumerate() {
            let normalised = (value as f32 * rescale - cfg.image_mean[idx]) / cfg.image_std[idx];
            ensure!(normalised.is_finite(), "normalised pixel is not finite");
            data.push(normalised);
        }
    }
    Ok(data)
}

/// Interleaved HWC floats -> per-patch `(C, T, P, P)` rows in merge-block order.
/// A still image is repeated across the temporal axis.
fn patchify(
    data: &[f32],
    width: usize,
    height: usize,
    cfg: &ImageProcessorConfig,
) -> Result<Vec<f32>> {
    let patch = cfg.patch_size;
    let merge = cfg.merge_size.max(1);
    let temporal = cfg.temporal_patch_size.max(1);
    ensure!(width % patch == 0 && height % patch == 0);
    let grid_h = height / patch;
    let grid_w = width / patch;
    ensure!(
        grid_h % merge == 0 && grid_w % merge == 0,
        "grid {grid_h}x{grid_w} not divisible by merge size {merge}"
    );

    let channels = 3usize;
    let row_stride = width * channels;
    let mut patches = Vec::with_capacity(grid_h * grid_w * channels * temporal * patch * patch);
    for bh in 0..grid_h / merge {
        for bw in 0..grid_w / merge {
            for ih in 0..merge {
                for iw in 0..merge {
                    let gh = bh * merge + ih;
                    let gw = bw * merge + iw;
                    for channel in 0..channels {
                        for _ in 0..temporal {
                            for py in 0..patch {
                                let y = gh * patch + py;
                                for px in 0..patch {
                                    let x = gw * patch + px;
                                    patches.push(data[y * row_stride + x * channels + channel]);
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(patches)
}

/// Pick a size divisible by `factor` that keeps the aspect ratio and the
/// pixel count within `[min_pixels, max_pixels]`. Returns `(height, width)`.
pub fn smart_resize(
    height: u32,
    width: u32,
    factor: u32,
    min_pixels: u32,
    max_pixels: u32,
) -> Result<(u32, u32)> {
    let factor = factor.max(1) as f64;
    let h = height.max(1) as f64;
    let w = width.max(1) as f64;
    let aspect = h.max(w) / h.min(w);
    ensure!(aspect <= 200.0, "aspect ratio exceeds limit ({aspect})");

    // halves go to the even multiple
    let mut h_bar = ((h / factor).round_ties_even() * factor).max(factor);
    let mut w_bar = ((w / factor).round_ties_even() * factor).max(factor);
    let max_pixels = max_pixels.max(1) as f64;
    let min_pixels = min_pixels.max(1) as f64;
    if h_bar * w_bar > max_pixels {
        let beta = ((h * w) / max_pixels).sqrt();
        h_bar = (((h / beta) / factor).floor() * factor).max(factor);
        w_bar = (((w / beta) / factor).floor() * factor).max(factor);
    } else if h_bar * w_bar < min_pixels {
        let beta = (min_pixels / (h * w)).sqrt();
        h_bar = ((h * beta) / factor).ceil() * factor;
        w_bar = ((w * beta) / factor).ceil() * factor;
    }
    Ok((h_bar as u32, w_bar as u32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_smart_resize_keeps_aligned_size() {
        assert_eq!(
            smart_resize(480, 640, 32, 65_536, 16_777_216).unwrap(),
            (480, 640)
        );
    }

    #[test]
    fn test_smart_resize_rounds_to_factor() {
        let (h, w) = smart_resize(500, 700, 32, 65_536, 16_777_216).unwrap();
        assert_eq!((h % 32, w % 32), (0, 0));
        assert_eq!((h, w), (512, 704));
    }

    #[test]
    fn test_smart_resize_half_factor_rounds_to_even() {
        // 720 / 32 = 22.5
        assert_eq!(
            smart_resize(720, 1280, 32, 65_536, 16_777_216).unwrap(),
            (704, 1280)
        );
        // 400 / 32 = 12.5, 1040 / 32 = 32.5
        assert_eq!(
            smart_resize(400, 1040, 32, 65_536, 16_777_216).unwrap(),
            (384, 1024)
        );
    }

    #[test]
    fn test_hd_image_placeholders_fit_grid() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(1280, 720));
        let cfg = ImageProcessorConfig::default();
        let vision = preprocess_image(&image, &cfg, &Device::Cpu).unwrap();
        assert_eq!(vision.grid_thw, [1, 44, 80]);

        let n_tokens = vision.n_merged_tokens(cfg.merge_size as u32);
        assert_eq!(n_tokens, 880);
        let ids = vec![7u32; n_tokens];
        let grid = crate::grid::build_image_grid(&ids, 7, 1280, 720, 32).unwrap();
        assert_eq!((grid.rows(), grid.cols()), (22, 40));
        let max_row = (0..n_tokens)
            .filter_map(|i| grid.position(i))
            .map(|(row, _)| row)
            .max()
            .unwrap();
        assert!(max_row < grid.rows());
    }

    #[test]
    fn test_smart_resize_upscales_small_images() {
        let (h, w) = smart_resize(64, 64, 32, 65_536, 16_777_216).unwrap();
        assert!(h * w >= 65_536);
        assert_eq!((h, w), (256, 256));
    }

    #[test]
    fn test_smart_resize_rejects_extreme_aspect() {
        assert!(smart_resize(1, 1000, 32, 1, 16_777_216).is_err());
    }

    #[test]
    fn test_parse_qwen3_vl_config() {
        let cfg = ImageProcessorConfig::from_json(
            r#"{
                "size": {"longest_edge": 16777216, "shortest_edge": 65536},
                "patch_size": 16,
                "temporal_patch_size": 2,
                "merge_size": 2,
                "image_mean": [0.5, 0.5, 0.5],
                "image_std": [0.5, 0.5, 0.5],
                "processor_class": "Qwen3VLProcessor"
            }"#,
        )
        .unwrap();
        assert_eq!(cfg, ImageProcessorConfig::default());
        assert_eq!(cfg.factor(), 32);
    }

    #[test]
    fn test_preprocess_constant_image() {
        let cfg = ImageProcessorConfig {
            min_pixels: 32 * 32,
            max_pixels: 64 * 64,
            ..ImageProcessorConfig::default()
        };
        let mut img = RgbImage::new(64, 32);
        for pixel in img.pixels_mut() {
            *pixel = Rgb([255, 255, 255]);
        }
        let vision = preprocess_image(&DynamicImage::ImageRgb8(img), &cfg, &Device::Cpu).unwrap();

        assert_eq!(vision.grid_thw, [1, 2, 4]);
        assert_eq!(vision.pixel_values.dims(), &[8, 3 * 2 * 16 * 16]);
        assert_eq!(vision.n_merged_tokens(2), 2);
        let values: Vec<f32> = vision.pixel_values.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_patchify_merge_block_order() {
        let cfg = ImageProcessorConfig {
            patch_size: 1,
            temporal_patch_size: 1,
            merge_size: 2,
            ..ImageProcessorConfig::default()
        };
        // 4x2 image, one channel value per pixel encodes x + 10 * y
        let (w, h) = (4, 2);
        let mut data = Vec::new();
        for y in 0..h {
            for x in 0..w {
                let v = (x + 10 * y) as f32;
                data.extend_from_slice(&[v, v, v]);
            }
        }
        let patches = patchify(&data, w, h, &cfg).unwrap();
        let red: Vec<f32> = patches.chunks(3).map(|c| c[0]).collect();
        // first merge block covers x in 0..2, second x in 2..4
        assert_eq!(red, vec![0.0, 1.0, 10.0, 11.0, 2.0, 3.0, 12.0, 13.0]);
    }
}
