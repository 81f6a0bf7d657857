//! Model shape loading
//!
//! The reference engine only needs a model's dimensions. They are read from a
//! `config.json` on disk, or fetched from HuggingFace Hub when the model id is
//! not a local path.

use anyhow::{anyhow, bail, Context, Result};
use candle_core::DType;
use hf_hub::{api::sync::Api, Repo, RepoType};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Preset name resolved without any I/O
pub const TINY_MODEL: &str = "tiny";

/// Where to find a model and how to hold its tensors
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Local directory, local `config.json`, HuggingFace model ID, or `tiny`
    pub model_id: String,
    /// Model revision/branch on the Hub
    pub revision: String,
    /// Data type for weights and KV cache
    pub dtype: DType,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_id: TINY_MODEL.to_string(),
            revision: "main".to_string(),
            dtype: DType::F32,
        }
    }
}

impl ModelConfig {
    pub fn with_model_id(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            ..Default::default()
        }
    }
}

/// Transformer dimensions as found in a HuggingFace `config.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDims {
    pub vocab_size: usize,
    pub hidden_size: usize,
    #[serde(alias = "n_layer", alias = "num_layers")]
    pub num_hidden_layers: usize,
    #[serde(alias = "n_head", alias = "num_heads")]
    pub num_attention_heads: usize,
}

impl ModelDims {
    /// Small shape for smoke runs and tests
    pub fn tiny() -> Self {
        Self {
            vocab_size: 256,
            hidden_size: 64,
            num_hidden_layers: 2,
            num_attention_heads: 4,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 || self.hidden_size == 0 || self.num_hidden_layers == 0 {
            bail!("model dimensions must be non-zero: {:?}", self);
        }
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            bail!(
                "hidden size {} is not divisible by {} attention heads",
                self.hidden_size,
                self.num_attention_heads
            );
        }
        Ok(())
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let dims: ModelDims = serde_json::from_slice(bytes).context("invalid model config")?;
        dims.validate()?;
        Ok(dims)
    }
}

/// Resolve the dimensions of the configured model
pub fn load_model_dims(config: &ModelConfig) -> Result<ModelDims> {
    if config.model_id == TINY_MODEL {
        info!("Using built-in tiny model shape");
        return Ok(ModelDims::tiny());
    }

    let config_file = match local_config_path(Path::new(&config.model_id)) {
        Some(path) => path,
        None => {
            info!("Fetching config for {} from HuggingFace Hub", config.model_id);
            let api = Api::new()?;
            let repo = api.repo(Repo::with_revision(
                config.model_id.clone(),
                RepoType::Model,
                config.revision.clone(),
            ));
            repo.get("config.json")
                .map_err(|e| anyhow!("Failed to fetch config for {}: {}", config.model_id, e))?
        }
    };

    info!("Loading model config from {}", config_file.display());
    let bytes = std::fs::read(&config_file)
        .with_context(|| format!("reading {}", config_file.display()))?;
    let dims = ModelDims::from_json(&bytes)?;

    info!("  - Vocab size: {}", dims.vocab_size);
    info!("  - Hidden size: {}", dims.hidden_size);
    info!("  - Layers: {}", dims.num_hidden_layers);
    info!("  - Heads: {}", dims.num_attention_heads);
    Ok(dims)
}

fn local_config_path(path: &Path) -> Option<PathBuf> {
    if path.is_dir() {
        let candidate = path.join("config.json");
        candidate.is_file().then_some(candidate)
    } else if path.is_file() && path.extension().is_some_and(|e| e == "json") {
        Some(path.to_path_buf())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LLAMA_CONFIG: &str = r#"{
        "architectures": ["LlamaForCausalLM"],
        "hidden_size": 2048,
        "intermediate_size": 5632,
        "num_attention_heads": 32,
        "num_hidden_layers": 22,
        "num_key_value_heads": 4,
        "vocab_size": 32000
    }"#;

    #[test]
    fn test_parse_llama_config() {
        let dims = ModelDims::from_json(LLAMA_CONFIG.as_bytes()).unwrap();
        assert_eq!(dims.vocab_size, 32000);
        assert_eq!(dims.hidden_size, 2048);
        assert_eq!(dims.num_hidden_layers, 22);
        assert_eq!(dims.num_attention_heads, 32);
        assert_eq!(dims.head_dim(), 64);
    }

    #[test]
    fn test_parse_gpt2_style_names() {
        let json = r#"{"vocab_size": 50257, "hidden_size": 768, "n_layer": 12, "n_head": 12}"#;
        let dims = ModelDims::from_json(json.as_bytes()).unwrap();
        assert_eq!(dims.num_hidden_layers, 12);
        assert_eq!(dims.num_attention_heads, 12);
    }

    #[test]
    fn test_rejects_indivisible_heads() {
        let json = r#"{"vocab_size": 10, "hidden_size": 30, "num_hidden_layers": 1, "num_attention_heads": 4}"#;
        assert!(ModelDims::from_json(json.as_bytes()).is_err());
    }

    #[test]
    fn test_tiny_preset_needs_no_io() {
        let dims = load_model_dims(&ModelConfig::default()).unwrap();
        assert_eq!(dims, ModelDims::tiny());
        dims.validate().unwrap();
    }

    #[test]
    fn test_load_from_local_dir_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.json");
        std::fs::write(&file, LLAMA_CONFIG).unwrap();

        let from_dir = load_model_dims(&ModelConfig::with_model_id(
            dir.path().to_string_lossy().to_string(),
        ))
        .unwrap();
        let from_file =
            load_model_dims(&ModelConfig::with_model_id(file.to_string_lossy().to_string())).unwrap();
        assert_eq!(from_dir, from_file);
        assert_eq!(from_dir.num_hidden_layers, 22);
    }
}
