//! Checkpoint file resolution
//!
//! A model identifier is either a local directory holding a Hugging Face
//! style checkpoint or a hub repository id. Single-file and sharded
//! safetensors layouts are both supported.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use hf_hub::api::sync::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};
use serde::Deserialize;
use tracing::info;

/// Safetensors index for sharded models
#[derive(Debug, Deserialize)]
struct SafetensorsIndex {
    weight_map: HashMap<String, String>,
}

enum Source {
    Local(PathBuf),
    Hub(ApiRepo),
}

impl Source {
    fn get(&self, name: &str) -> Result<PathBuf> {
        match self {
            Self::Local(dir) => {
                let path = dir.join(name);
                anyhow::ensure!(path.exists(), "{} not found", path.display());
                Ok(path)
            }
            Self::Hub(repo) => repo
                .get(name)
                .with_context(|| format!("Failed to download {name}")),
        }
    }
}

/// Paths of everything needed to build a model and its processor
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub preprocessor_config: Option<PathBuf>,
    pub weights: Vec<PathBuf>,
}

impl ModelFiles {
    /// Resolve from a local directory if `model_id` is one, else from the hub
    pub fn resolve(model_id: &str) -> Result<Self> {
        let local = Path::new(model_id);
        let source = if local.is_dir() {
            info!("Loading checkpoint from local directory {}", local.display());
            Source::Local(local.to_path_buf())
        } else {
            let api = Api::new()?;
            Source::Hub(api.repo(Repo::new(model_id.to_string(), RepoType::Model)))
        };

        let config = source
            .get("config.json")
            .context("Failed to fetch config.json")?;
        let tokenizer = source
            .get("tokenizer.json")
            .context("Failed to fetch tokenizer.json")?;
        let preprocessor_config = source.get("preprocessor_config.json").ok();

        let weights = if let Ok(index_path) = source.get("model.safetensors.index.json") {
            info!("Model is sharded, loading index...");
            let index_str =
                std::fs::read_to_string(&index_path).context("Failed to read index")?;
            let index: SafetensorsIndex = serde_json::from_str(&index_str)?;
            let shard_names = shard_names(&index);
            info!("Fetching {} shard files...", shard_names.len());
            shard_names
                .iter()
                .map(|name| source.get(name))
                .collect::<Result<Vec<_>>>()?
        } else {
            vec![source
                .get("model.safetensors")
                .context("Failed to fetch model.safetensors")?]
        };

        Ok(Self {
            config,
            tokenizer,
            preprocessor_config,
            weights,
        })
    }
}

/// Unique shard file names, sorted
fn shard_names(index: &SafetensorsIndex) -> Vec<String> {
    let mut names: Vec<String> = index.weight_map.values().cloned().collect();
    names.sort();
    names.dedup();
    names
}
