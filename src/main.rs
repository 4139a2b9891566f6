//! vlm-attention-viz CLI: extract VLM attention for one image + prompt

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use vlm_attention_viz::{
    get_adapter, list_model_types, resolve_model_type, run_extraction, ExtractionConfig,
    ExtractionMode,
};

#[derive(Parser)]
#[command(name = "vlm-attention-viz")]
#[command(about = "Extract per-layer, per-head attention from vision-language models")]
#[command(version)]
struct Cli {
    /// Input image
    #[arg(long, required_unless_present = "list_model_types")]
    image: Option<PathBuf>,

    /// Text prompt sent with the image
    #[arg(long, default_value = "Describe this image in detail.")]
    prompt: String,

    /// Output directory for meta.json, attention files and image.jpg
    #[arg(short, long, required_unless_present = "list_model_types")]
    output: Option<PathBuf>,

    /// Model ID from `HuggingFace` or a local directory (default: the family's default model)
    #[arg(short, long)]
    model: Option<String>,

    /// Model family (auto-detected from --model when omitted)
    #[arg(long)]
    model_type: Option<String>,

    /// Compute device: cpu, cuda, cuda:N or metal (default: CUDA if available)
    #[arg(long)]
    device: Option<String>,

    /// Compute dtype: f32, f16 or bf16 (default depends on the device)
    #[arg(long)]
    dtype: Option<String>,

    /// Capture attention over the prompt only, or after greedy decoding
    #[arg(long, value_enum, default_value_t = ExtractionMode::Prefill)]
    mode: ExtractionMode,

    /// Decoding bound in generate mode
    #[arg(long, default_value_t = 256)]
    max_new_tokens: usize,

    /// Print registered model families and exit
    #[arg(long)]
    list_model_types: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn run(cli: Cli) -> Result<()> {
    if cli.list_model_types {
        for key in list_model_types() {
            println!("{key}");
        }
        return Ok(());
    }

    let model_type = resolve_model_type(cli.model_type.as_deref(), cli.model.as_deref())?;
    let adapter = get_adapter(model_type)?;

    let config = ExtractionConfig {
        image: cli.image.unwrap_or_default(),
        prompt: cli.prompt,
        output_dir: cli.output.unwrap_or_default(),
        model: cli.model,
        device: cli.device,
        dtype: cli.dtype,
        mode: cli.mode,
        max_new_tokens: cli.max_new_tokens,
    };

    println!("=== vlm-attention-viz ===");
    println!(
        "Model:  {} ({})",
        config
            .model
            .as_deref()
            .unwrap_or(adapter.default_model_name()),
        model_type
    );
    println!("Image:  {}", config.image.display());
    println!("Output: {}", config.output_dir.display());
    println!("Mode:   {}", config.mode);

    let summary = run_extraction(adapter.as_ref(), &config)?;
    info!(
        "Done: {} layers x {} heads over {} tokens",
        summary.num_layers, summary.num_heads, summary.seq_len
    );
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("error: {err}");
        return ExitCode::FAILURE;
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
