//! Integration tests for vlm-attention-viz
//!
//! The pipeline tests run against a small in-process adapter whose model
//! returns uniform causal attention, so they need no download.
//! Tests marked with #[ignore] load the real Qwen3-VL checkpoint.
//! Run them explicitly with: cargo test --ignored

use std::path::{Path, PathBuf};

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use tokenizers::Tokenizer;
use vlm_attention_viz::qwen3_vl::render_chat;
use vlm_attention_viz::{
    attention_file_len, attention_file_name, get_adapter, list_model_types, read_attention_layer,
    resolve_model_type, run_extraction, AttentionCache, AttentionModel, ChatMessage,
    ExtractError, ExtractionConfig, ExtractionMode, ImageProcessorConfig, ModelAdapter,
    ModelInputs, Processor, RunMetadata, TokenKind,
};

const IMAGE_PAD: u32 = 100;
const IM_END: u32 = 91;
const CONTINUATION: [u32; 4] = [7, 8, 9, IM_END];

fn test_tokenizer() -> Tokenizer {
    let added = [
        (90, "<|im_start|>"),
        (91, "<|im_end|>"),
        (92, "<|vision_start|>"),
        (93, "<|vision_end|>"),
        (100, "<|image_pad|>"),
    ];
    let added_tokens: Vec<serde_json::Value> = added
        .iter()
        .map(|(id, content)| {
            serde_json::json!({
                "id": id, "content": content, "single_word": false, "lstrip": false,
                "rstrip": false, "normalized": false, "special": true
            })
        })
        .collect();
    let mut vocab = serde_json::json!({
        "<unk>": 0, "user": 1, "assistant": 2, "Describe": 3, "this": 4,
        "image": 5, ".": 6, "the": 7, "cat": 8, "sat": 9
    });
    for (id, content) in added {
        vocab[content] = serde_json::json!(id);
    }
    let json = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": added_tokens,
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": vocab,
            "unk_token": "<unk>"
        }
    });
    Tokenizer::from_bytes(json.to_string().as_bytes()).unwrap()
}

/// Returns uniform causal attention: row i spreads 1/(i+1) over keys 0..=i
struct UniformModel {
    layers: usize,
    heads: usize,
    captured_layers: usize,
    /// Return only the continuation from `generate`, without the prompt
    drop_prompt: bool,
}

impl AttentionModel for UniformModel {
    fn num_layers(&self) -> usize {
        self.layers
    }

    fn num_heads(&self) -> usize {
        self.heads
    }

    fn generate(&self, inputs: &ModelInputs, max_new_tokens: usize) -> Result<Vec<u32>> {
        let mut tokens = if self.drop_prompt {
            Vec::new()
        } else {
            inputs.token_ids()?
        };
        tokens.extend(CONTINUATION.iter().take(max_new_tokens));
        Ok(tokens)
    }

    fn forward_with_attention(&self, inputs: &ModelInputs) -> Result<AttentionCache> {
        let seq = inputs.seq_len()?;
        let mut row_major = Vec::with_capacity(self.heads * seq * seq);
        for _ in 0..self.heads {
            for i in 0..seq {
                for j in 0..seq {
                    row_major.push(if j <= i { 1.0 / (i + 1) as f32 } else { 0.0 });
                }
            }
        }
        let pattern = Tensor::from_vec(row_major, (1, self.heads, seq, seq), &Device::Cpu)?;
        let mut cache = AttentionCache::with_capacity(self.captured_layers);
        for _ in 0..self.captured_layers {
            cache.push(pattern.clone());
        }
        Ok(cache)
    }
}

struct TestAdapter {
    layers: usize,
    heads: usize,
    captured_layers: usize,
    drop_prompt: bool,
    /// Expand the image marker into placeholders; text-only when false
    image_tokens: bool,
}

impl TestAdapter {
    fn new() -> Self {
        Self {
            layers: 3,
            heads: 2,
            captured_layers: 3,
            drop_prompt: false,
            image_tokens: true,
        }
    }
}

impl ModelAdapter for TestAdapter {
    fn family(&self) -> &'static str {
        "test-vlm"
    }

    fn default_model_name(&self) -> &'static str {
        "test/tiny-vlm"
    }

    fn image_token_id(&self) -> u32 {
        IMAGE_PAD
    }

    fn effective_patch_size(&self) -> u32 {
        32
    }

    fn load(
        &self,
        _model_id: &str,
        _device: &Device,
        _dtype: DType,
    ) -> Result<(Box<dyn AttentionModel>, Processor)> {
        let image = ImageProcessorConfig {
            min_pixels: 32 * 32,
            ..ImageProcessorConfig::default()
        };
        let model = UniformModel {
            layers: self.layers,
            heads: self.heads,
            captured_layers: self.captured_layers,
            drop_prompt: self.drop_prompt,
        };
        Ok((Box::new(model), Processor::new(test_tokenizer(), image)))
    }

    fn preprocess(
        &self,
        processor: &Processor,
        messages: &[ChatMessage],
        device: &Device,
    ) -> Result<ModelInputs> {
        let text = render_chat(messages, false);
        let image_path = messages
            .iter()
            .flat_map(ChatMessage::image_paths)
            .next()
            .unwrap();
        let vision = processor.load_image(image_path, device)?;
        let n_image = if self.image_tokens {
            vision.n_merged_tokens(2)
        } else {
            0
        };

        let mut ids = Vec::new();
        for (i, piece) in text.split("<|image_pad|>").enumerate() {
            if i > 0 {
                ids.extend(std::iter::repeat(IMAGE_PAD).take(n_image));
            }
            ids.extend(processor.encode(piece)?);
        }
        ModelInputs::new(&ids, Some(vision), device)
    }
}

/// 96x64 PNG: a 3x2 grid of 32px patches
fn write_test_image(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
    let path = dir.join(name);
    let image = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x * 2) as u8, (y * 3) as u8, 128])
    });
    image.save(&path).unwrap();
    path
}

fn test_config(image: PathBuf, output_dir: PathBuf, mode: ExtractionMode) -> ExtractionConfig {
    ExtractionConfig {
        image,
        prompt: "Describe this image.".to_string(),
        output_dir,
        device: Some("cpu".to_string()),
        mode,
        max_new_tokens: 8,
        ..ExtractionConfig::default()
    }
}

#[test]
fn test_prefill_run_layout() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_test_image(dir.path(), "scene.png", 96, 64);
    let out = dir.path().join("run");
    let config = test_config(image, out.clone(), ExtractionMode::Prefill);

    let summary = run_extraction(&TestAdapter::new(), &config).unwrap();
    assert_eq!(summary.generated_tokens, 0);
    assert_eq!(summary.model, "test/tiny-vlm");

    let meta = RunMetadata::load(&out).unwrap();
    assert_eq!(meta.seq_len, summary.seq_len);
    assert_eq!(meta.tokens.len(), meta.seq_len);
    assert!(meta.tokens.iter().enumerate().all(|(i, t)| t.id == i));
    assert_eq!(meta.image_size, [96, 64]);
    assert_eq!(meta.dtype, "float16");
    assert_eq!(meta.image_path, "image.jpg");
    assert_eq!((meta.num_layers, meta.num_heads), (3, 2));

    for layer in 0..meta.num_layers {
        let len = std::fs::metadata(out.join(attention_file_name(layer)))
            .unwrap()
            .len();
        assert_eq!(len, attention_file_len(2, meta.seq_len));
    }
    assert!(!out.join(attention_file_name(3)).exists());
    assert_eq!(
        image::ImageFormat::from_path(out.join("image.jpg")).unwrap(),
        image::ImageFormat::Jpeg
    );
}

#[test]
fn test_token_classification_and_grid() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_test_image(dir.path(), "scene.png", 96, 64);
    let out = dir.path().join("run");
    run_extraction(
        &TestAdapter::new(),
        &test_config(image, out.clone(), ExtractionMode::Prefill),
    )
    .unwrap();
    let meta = RunMetadata::load(&out).unwrap();

    // <|im_start|> user <|vision_start|> then six placeholders
    assert_eq!(meta.tokens[0].text, "<|im_start|>");
    assert_eq!(meta.tokens[0].kind, TokenKind::Special);
    assert_eq!(meta.tokens[1].kind, TokenKind::Text);
    assert_eq!(meta.tokens[2].text, "<|vision_start|>");

    assert_eq!(meta.image_grid.rows, 2);
    assert_eq!(meta.image_grid.cols, 3);
    assert_eq!(meta.image_grid.start_idx, 3);
    assert_eq!(meta.image_grid.end_idx, 8);

    let grid: Vec<(usize, [usize; 2])> = meta
        .tokens
        .iter()
        .filter_map(|t| t.grid_pos.map(|pos| (t.id, pos)))
        .collect();
    assert_eq!(
        grid,
        vec![
            (3, [0, 0]),
            (4, [0, 1]),
            (5, [0, 2]),
            (6, [1, 0]),
            (7, [1, 1]),
            (8, [1, 2]),
        ]
    );
    assert!(meta
        .tokens
        .iter()
        .all(|t| (t.kind == TokenKind::Image) == t.grid_pos.is_some()));
}

#[test]
fn test_generate_extends_prefill() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_test_image(dir.path(), "scene.png", 96, 64);
    let adapter = TestAdapter::new();

    let prefill_out = dir.path().join("prefill");
    let prefill = run_extraction(
        &adapter,
        &test_config(image.clone(), prefill_out.clone(), ExtractionMode::Prefill),
    )
    .unwrap();
    let generate_out = dir.path().join("generate");
    let generate = run_extraction(
        &adapter,
        &test_config(image, generate_out.clone(), ExtractionMode::Generate),
    )
    .unwrap();

    assert_eq!(generate.prompt_tokens, prefill.seq_len);
    assert_eq!(generate.generated_tokens, CONTINUATION.len());
    assert_eq!(
        generate.seq_len,
        generate.prompt_tokens + generate.generated_tokens
    );

    let prefill_meta = RunMetadata::load(&prefill_out).unwrap();
    let generate_meta = RunMetadata::load(&generate_out).unwrap();
    assert_eq!(generate_meta.mode, ExtractionMode::Generate);
    assert_eq!(
        &generate_meta.tokens[..prefill_meta.seq_len],
        prefill_meta.tokens.as_slice()
    );
    let tail: Vec<&str> = generate_meta.tokens[prefill_meta.seq_len..]
        .iter()
        .map(|t| t.text.as_str())
        .collect();
    assert_eq!(tail, vec!["the", "cat", "sat", "<|im_end|>"]);

    let len = std::fs::metadata(generate_out.join(attention_file_name(0)))
        .unwrap()
        .len();
    assert_eq!(len, attention_file_len(2, generate.seq_len));
}

#[test]
fn test_generate_respects_bound() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_test_image(dir.path(), "scene.png", 96, 64);
    let mut config = test_config(image, dir.path().join("run"), ExtractionMode::Generate);
    config.max_new_tokens = 2;

    let summary = run_extraction(&TestAdapter::new(), &config).unwrap();
    assert_eq!(summary.generated_tokens, 2);
}

#[test]
fn test_prefill_is_reproducible() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_test_image(dir.path(), "scene.png", 96, 64);
    let adapter = TestAdapter::new();

    let first = dir.path().join("first");
    let second = dir.path().join("second");
    run_extraction(
        &adapter,
        &test_config(image.clone(), first.clone(), ExtractionMode::Prefill),
    )
    .unwrap();
    run_extraction(
        &adapter,
        &test_config(image, second.clone(), ExtractionMode::Prefill),
    )
    .unwrap();

    for name in ["meta.json", "attn_layer_00.bin", "attn_layer_02.bin"] {
        assert_eq!(
            std::fs::read(first.join(name)).unwrap(),
            std::fs::read(second.join(name)).unwrap(),
            "{name} differs between runs"
        );
    }
}

#[test]
fn test_attention_values_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_test_image(dir.path(), "scene.png", 96, 64);
    let out = dir.path().join("run");
    run_extraction(
        &TestAdapter::new(),
        &test_config(image, out.clone(), ExtractionMode::Prefill),
    )
    .unwrap();
    let meta = RunMetadata::load(&out).unwrap();
    let seq = meta.seq_len;

    let values = read_attention_layer(&out, 1, &meta).unwrap();
    assert_eq!(values.len(), meta.num_heads * seq * seq);
    // head 1, query 1: half on keys 0 and 1, nothing after
    let row = &values[seq * seq + seq..seq * seq + 2 * seq];
    assert_eq!(row[0].to_f32(), 0.5);
    assert_eq!(row[1].to_f32(), 0.5);
    assert!(row[2..].iter().all(|v| v.to_f32() == 0.0));
}

#[test]
fn test_missing_image() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("run");
    let config = test_config(
        dir.path().join("nope.png"),
        out.clone(),
        ExtractionMode::Prefill,
    );

    let err = run_extraction(&TestAdapter::new(), &config).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ExtractError>(),
        Some(ExtractError::ImageNotFound(_))
    ));
    assert!(!out.join("meta.json").exists());
}

#[test]
fn test_image_narrower_than_patch() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_test_image(dir.path(), "thin.png", 16, 64);
    let out = dir.path().join("run");

    let err = run_extraction(
        &TestAdapter::new(),
        &test_config(image, out.clone(), ExtractionMode::Prefill),
    )
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ExtractError>(),
        Some(ExtractError::ImageTooSmall { width: 16, .. })
    ));
    assert!(!out.join("meta.json").exists());
}

#[test]
fn test_capture_mismatch_leaves_run_incomplete() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_test_image(dir.path(), "scene.png", 96, 64);
    let out = dir.path().join("run");
    let adapter = TestAdapter {
        captured_layers: 2,
        ..TestAdapter::new()
    };

    let err = run_extraction(
        &adapter,
        &test_config(image, out.clone(), ExtractionMode::Prefill),
    )
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ExtractError>(),
        Some(ExtractError::AttentionCaptureMismatch {
            expected: 3,
            actual: 2
        })
    ));
    assert!(!out.join("meta.json").exists());
    assert!(matches!(
        RunMetadata::load(&out).unwrap_err().downcast_ref::<ExtractError>(),
        Some(ExtractError::IncompleteRun(_))
    ));
}

#[test]
fn test_text_only_sequence_has_empty_grid() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_test_image(dir.path(), "scene.png", 96, 64);
    let out = dir.path().join("run");
    let adapter = TestAdapter {
        image_tokens: false,
        ..TestAdapter::new()
    };

    run_extraction(
        &adapter,
        &test_config(image, out.clone(), ExtractionMode::Prefill),
    )
    .unwrap();
    let meta = RunMetadata::load(&out).unwrap();

    assert_eq!(meta.tokens.len(), meta.seq_len);
    assert_eq!(meta.tokens[2].text, "<|vision_start|>");
    assert_eq!(meta.tokens[3].text, "<|vision_end|>");
    assert_eq!(
        (
            meta.image_grid.rows,
            meta.image_grid.cols,
            meta.image_grid.start_idx,
            meta.image_grid.end_idx
        ),
        (0, 0, 0, 0)
    );
    assert!(meta.tokens.iter().all(|t| t.grid_pos.is_none()));
    assert!(meta.tokens.iter().all(|t| t.kind != TokenKind::Image));
    assert_eq!(meta.image_tokens().count(), 0);

    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(out.join("meta.json")).unwrap()).unwrap();
    assert!(raw["tokens"]
        .as_array()
        .unwrap()
        .iter()
        .all(|t| t.get("grid_pos").is_none()));
}

#[test]
fn test_generate_must_extend_prompt() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_test_image(dir.path(), "scene.png", 96, 64);
    let out = dir.path().join("run");
    let adapter = TestAdapter {
        drop_prompt: true,
        ..TestAdapter::new()
    };

    let err = run_extraction(
        &adapter,
        &test_config(image, out.clone(), ExtractionMode::Generate),
    )
    .unwrap_err();
    assert!(format!("{err:#}").contains("does not extend"));
    assert!(!out.join("meta.json").exists());
    assert!(!out.join(attention_file_name(0)).exists());
}

#[test]
fn test_registry_public_api() {
    assert_eq!(list_model_types(), vec!["qwen3-vl"]);
    assert_eq!(
        resolve_model_type(None, Some("Qwen/Qwen3-VL-8B-Instruct")).unwrap(),
        "qwen3-vl"
    );
    let err = resolve_model_type(None, Some("llava-hf/llava-1.5-7b-hf")).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ExtractError>(),
        Some(ExtractError::FamilyDetectionFailed { .. })
    ));
    let adapter = get_adapter("qwen3-vl").unwrap();
    assert_eq!(adapter.default_model_name(), "Qwen/Qwen3-VL-2B-Thinking");
}

/// Full run against the published 2B checkpoint
#[test]
#[ignore = "requires model download"]
fn test_qwen3_vl_prefill() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_test_image(dir.path(), "scene.png", 96, 64);
    let out = dir.path().join("run");
    let adapter = get_adapter("qwen3-vl").unwrap();
    let config = ExtractionConfig {
        dtype: Some("f32".to_string()),
        ..test_config(image, out.clone(), ExtractionMode::Prefill)
    };

    let summary = run_extraction(adapter.as_ref(), &config).unwrap();
    let meta = RunMetadata::load(&out).unwrap();
    assert_eq!(meta.num_layers, 28);
    assert_eq!(meta.tokens.len(), summary.seq_len);
    assert!(meta.image_tokens().count() > 0);

    // causal: nothing above the diagonal, rows sum to one
    let values = read_attention_layer(&out, 0, &meta).unwrap();
    let seq = meta.seq_len;
    let last_row: f32 = values[(seq - 1) * seq..seq * seq]
        .iter()
        .map(|v| v.to_f32())
        .sum();
    assert!((last_row - 1.0).abs() < 1e-2);
    assert_eq!(values[1].to_f32(), 0.0);
}

/// Greedy decoding on the real model stays within the bound
#[test]
#[ignore = "requires model download"]
fn test_qwen3_vl_generate() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_test_image(dir.path(), "scene.png", 96, 64);
    let adapter = get_adapter("qwen3-vl").unwrap();
    let config = ExtractionConfig {
        dtype: Some("f32".to_string()),
        max_new_tokens: 4,
        ..test_config(image, dir.path().join("run"), ExtractionMode::Generate)
    };

    let summary = run_extraction(adapter.as_ref(), &config).unwrap();
    assert!(summary.generated_tokens >= 1 && summary.generated_tokens <= 4);
}
