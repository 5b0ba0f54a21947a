//! Configuration management for the serving engine
//!
//! An [`EngineConfig`] describes everything needed to build an engine from
//! disk: the maximum sequence length, the tokenizer, the KV cache layout and
//! the models. It is stored as JSON and can be overridden from the
//! environment with `SERVE_ENGINE__`-prefixed variables, e.g.
//! `SERVE_ENGINE__KV_CACHE__PAGE_SIZE=32`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::engine::kv_cache::{KVCacheConfig, KVCacheConfigPayload};
use crate::engine::llm_engine::DEFAULT_SPEC_DRAFT_LENGTH;
use crate::model::DeviceSpec;

/// Prefix of environment variables read by [`EngineConfig::load_layered`]
pub const ENV_PREFIX: &str = "SERVE_ENGINE";

/// One model to load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Path to the model weights
    pub model_path: PathBuf,

    /// Device to place the model on
    #[serde(default)]
    pub device: DeviceSpec,
}

impl ModelEntry {
    pub fn new<P: Into<PathBuf>>(model_path: P, device: DeviceSpec) -> Self {
        Self {
            model_path: model_path.into(),
            device,
        }
    }
}

/// Main configuration struct for the serving engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Longest sequence (input plus output) a request may reach
    pub max_single_sequence_length: usize,

    /// `tokenizer.json` or a directory containing one
    pub tokenizer_path: PathBuf,

    /// KV cache layout shared by every model
    pub kv_cache: KVCacheConfigPayload,

    /// Primary model first, then an optional draft model
    pub models: Vec<ModelEntry>,

    /// Tokens the draft model proposes per decode step
    pub spec_draft_length: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_single_sequence_length: 4096,
            tokenizer_path: PathBuf::new(),
            kv_cache: KVCacheConfigPayload::default(),
            models: Vec::new(),
            spec_draft_length: DEFAULT_SPEC_DRAFT_LENGTH,
        }
    }
}

impl EngineConfig {
    /// Create a config with one primary model
    pub fn new<P: Into<PathBuf>, T: Into<PathBuf>>(model_path: P, tokenizer_path: T) -> Self {
        Self {
            tokenizer_path: tokenizer_path.into(),
            models: vec![ModelEntry::new(model_path, DeviceSpec::default())],
            ..Default::default()
        }
    }

    /// Validate the configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.models.is_empty() {
            anyhow::bail!("no model provided");
        }

        if self.models.len() > 2 {
            anyhow::bail!("at most one draft model is supported, got {} models", self.models.len());
        }

        if self.spec_draft_length == 0 {
            anyhow::bail!("spec_draft_length must be positive");
        }

        KVCacheConfig::new(&self.kv_cache, self.max_single_sequence_length)
            .context("Invalid kv_cache section")?;

        Ok(())
    }

    /// KV cache section as the JSON payload `Engine::new` takes
    pub fn kv_cache_json(&self) -> Result<String> {
        serde_json::to_string(&self.kv_cache).context("Failed to serialize kv_cache section")
    }

    /// Load configuration from a file
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.validate()?;
        Ok(config)
    }

    /// Load an optional JSON file, then apply `SERVE_ENGINE__*` environment overrides
    pub fn load_layered(path: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&Self::default())
            .context("Failed to build default configuration")?;
        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path.to_path_buf())
                    .format(config::FileFormat::Json)
                    .required(true),
            );
        }

        let config: Self = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to load layered config from {:?}", path))?
            .try_deserialize()
            .context("Failed to deserialize layered config")?;

        config.validate()?;
        tracing::debug!("Loaded layered config: {:?}", config);
        Ok(config)
    }

    /// Save configuration to a file
    pub fn save_to_file<P: Into<PathBuf>>(&self, path: P) -> Result<()> {
        let path = path.into();
        let content = serde_json::to_string_pretty(self)
            .context("Failed to serialize config")?;

        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Builder pattern methods
    pub fn with_max_single_sequence_length(mut self, len: usize) -> Self {
        self.max_single_sequence_length = len;
        self
    }

    pub fn with_kv_cache(mut self, kv_cache: KVCacheConfigPayload) -> Self {
        self.kv_cache = kv_cache;
        self
    }

    pub fn with_draft_model<P: Into<PathBuf>>(mut self, model_path: P, device: DeviceSpec) -> Self {
        self.models.push(ModelEntry::new(model_path, device));
        self
    }

    pub fn with_spec_draft_length(mut self, len: usize) -> Self {
        self.spec_draft_length = len;
        self
    }

    pub fn with_device(mut self, device: DeviceSpec) -> Self {
        for entry in self.models.iter_mut() {
            entry.device = device;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.max_single_sequence_length, 4096);
        assert_eq!(config.spec_draft_length, 4);
        assert!(config.models.is_empty());
        // Defaults alone have no model
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = EngineConfig::new("model", "tokenizer.json");
        assert!(config.validate().is_ok());

        config.kv_cache.max_total_sequence_length = 1024;
        assert!(config.validate().is_err());

        config.kv_cache.max_total_sequence_length = 16384;
        config.spec_draft_length = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder_pattern() {
        let config = EngineConfig::new("model", "tok")
            .with_max_single_sequence_length(512)
            .with_draft_model("draft", DeviceSpec::cpu())
            .with_device(DeviceSpec::cuda(1))
            .with_spec_draft_length(3);

        assert_eq!(config.max_single_sequence_length, 512);
        assert_eq!(config.models.len(), 2);
        assert_eq!(config.models[1].device, DeviceSpec::cuda(1));
        assert_eq!(config.spec_draft_length, 3);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.json");
        let config = EngineConfig::new("model", "tok").with_max_single_sequence_length(256);

        config.save_to_file(&path).unwrap();
        let loaded = EngineConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_kv_cache_json() {
        let json = EngineConfig::new("model", "tok").kv_cache_json().unwrap();
        let parsed = KVCacheConfig::from_json(&json, 4096).unwrap();
        assert_eq!(parsed.page_size, 16);
    }
}
