//! Tokenizer collaborator
//!
//! The engine only needs `encode` and `decode`. [`HfTokenizer`] backs them
//! with a HuggingFace `tokenizer.json`.

use std::path::{Path, PathBuf};

use crate::error::{EngineError, Result};

/// Text <-> token id conversion used by the engine
pub trait Tokenizer: Send + Sync {
    /// Encode text into token ids
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode token ids back into text
    fn decode(&self, token_ids: &[u32]) -> Result<String>;
}

/// Tokenizer loaded from a HuggingFace `tokenizer.json`
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
}

impl HfTokenizer {
    /// Load from a `tokenizer.json` file or a directory containing one
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file: PathBuf = if path.is_dir() {
            path.join("tokenizer.json")
        } else {
            path.to_path_buf()
        };

        if !file.exists() {
            return Err(EngineError::config(format!(
                "tokenizer file does not exist: {:?}",
                file
            )));
        }

        let inner = tokenizers::Tokenizer::from_file(&file).map_err(|e| {
            EngineError::config(format!("failed to load tokenizer {:?}: {}", file, e))
        })?;
        tracing::info!("Loaded tokenizer from {:?}", file);

        Ok(Self { inner })
    }
}

impl std::fmt::Debug for HfTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HfTokenizer")
            .field("vocab_size", &self.inner.get_vocab_size(true))
            .finish()
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| EngineError::Tokenization(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, token_ids: &[u32]) -> Result<String> {
        self.inner
            .decode(token_ids, false)
            .map_err(|e| EngineError::Tokenization(e.to_string()))
    }
}
