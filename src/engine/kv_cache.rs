//! KV cache configuration and page accounting
//!
//! Each model owns its physical paged cache. The engine mirrors every model's
//! cache with a [`PageTable`] so it can decide admission and preemption
//! without asking the model.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

fn default_page_size() -> usize {
    16
}

/// JSON payload describing the KV cache, as passed to `Engine::new`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KVCacheConfigPayload {
    /// Tokens per cache page
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Maximum number of concurrently running sequences
    pub max_num_sequence: usize,

    /// Total tokens the cache can hold across all sequences
    pub max_total_sequence_length: usize,

    /// Largest prefill a model runs in one forward pass
    #[serde(default)]
    pub prefill_chunk_size: Option<usize>,
}

impl Default for KVCacheConfigPayload {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_num_sequence: 32,
            max_total_sequence_length: 16384,
            prefill_chunk_size: None,
        }
    }
}

/// Validated, immutable KV cache configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KVCacheConfig {
    pub page_size: usize,
    pub max_num_sequence: usize,
    pub max_total_sequence_length: usize,
    pub prefill_chunk_size: usize,
    pub max_single_sequence_length: usize,
}

impl KVCacheConfig {
    /// Parse and validate a JSON payload
    pub fn from_json(json: &str, max_single_sequence_length: usize) -> Result<Self> {
        let payload: KVCacheConfigPayload = serde_json::from_str(json)
            .map_err(|e| EngineError::config(format!("invalid kv cache config: {}", e)))?;
        Self::new(&payload, max_single_sequence_length)
    }

    /// Validate a payload against the maximum single sequence length
    pub fn new(payload: &KVCacheConfigPayload, max_single_sequence_length: usize) -> Result<Self> {
        if max_single_sequence_length == 0 {
            return Err(EngineError::config("max_single_sequence_length must be positive"));
        }
        if payload.page_size == 0 {
            return Err(EngineError::config("page_size must be positive"));
        }
        if payload.max_num_sequence == 0 {
            return Err(EngineError::config("max_num_sequence must be positive"));
        }

        let prefill_chunk_size = payload.prefill_chunk_size.unwrap_or(max_single_sequence_length);
        if prefill_chunk_size == 0 {
            return Err(EngineError::config("prefill_chunk_size must be positive"));
        }

        let config = Self {
            page_size: payload.page_size,
            max_num_sequence: payload.max_num_sequence,
            max_total_sequence_length: payload.max_total_sequence_length,
            prefill_chunk_size,
            max_single_sequence_length,
        };

        let needed = config.pages_for(max_single_sequence_length);
        if config.num_pages() < needed {
            return Err(EngineError::config(format!(
                "kv cache of {} pages cannot hold one sequence of {} tokens ({} pages)",
                config.num_pages(),
                max_single_sequence_length,
                needed
            )));
        }

        Ok(config)
    }

    /// Total pages in each model's cache
    pub fn num_pages(&self) -> usize {
        self.max_total_sequence_length / self.page_size
    }

    /// Pages needed to hold `num_tokens`
    pub fn pages_for(&self, num_tokens: usize) -> usize {
        num_tokens.div_ceil(self.page_size)
    }

    /// Token capacity, rounded down to whole pages
    pub fn capacity_tokens(&self) -> usize {
        self.num_pages() * self.page_size
    }
}

/// Engine-side view of one model's paged cache
#[derive(Debug, Clone)]
pub struct PageTable {
    page_size: usize,
    num_pages: usize,
    free_pages: usize,
    /// Token length per cache sequence
    sequences: HashMap<i64, usize>,
}

impl PageTable {
    pub fn new(config: &KVCacheConfig) -> Self {
        Self {
            page_size: config.page_size,
            num_pages: config.num_pages(),
            free_pages: config.num_pages(),
            sequences: HashMap::new(),
        }
    }

    pub fn pages_for(&self, num_tokens: usize) -> usize {
        num_tokens.div_ceil(self.page_size)
    }

    pub fn num_free_pages(&self) -> usize {
        self.free_pages
    }

    pub fn num_total_pages(&self) -> usize {
        self.num_pages
    }

    pub fn capacity_tokens(&self) -> usize {
        self.num_pages * self.page_size
    }

    pub fn num_sequences(&self) -> usize {
        self.sequences.len()
    }

    /// Tokens currently held across all sequences
    pub fn num_used_tokens(&self) -> usize {
        self.sequences.values().sum()
    }

    pub fn sequence_length(&self, seq_id: i64) -> Option<usize> {
        self.sequences.get(&seq_id).copied()
    }

    /// Whether a new sequence of `num_tokens` fits in the free pages
    pub fn can_allocate(&self, num_tokens: usize) -> bool {
        self.pages_for(num_tokens) <= self.free_pages
    }

    /// Extra pages `seq_id` needs to grow by `num_tokens`
    pub fn pages_to_grow(&self, seq_id: i64, num_tokens: usize) -> usize {
        let len = self.sequences.get(&seq_id).copied().unwrap_or(0);
        self.pages_for(len + num_tokens) - self.pages_for(len)
    }

    /// Whether every `(seq_id, num_tokens)` growth fits at once
    pub fn can_grow_all(&self, growth: &[(i64, usize)]) -> bool {
        let needed: usize = growth
            .iter()
            .map(|&(seq_id, num_tokens)| self.pages_to_grow(seq_id, num_tokens))
            .sum();
        needed <= self.free_pages
    }

    /// Register a new sequence holding `num_tokens`
    pub fn allocate(&mut self, seq_id: i64, num_tokens: usize) -> Result<()> {
        if self.sequences.contains_key(&seq_id) {
            return Err(EngineError::Cache(format!("sequence {} already allocated", seq_id)));
        }
        let pages = self.pages_for(num_tokens);
        if pages > self.free_pages {
            return Err(EngineError::Cache(format!(
                "sequence {} needs {} pages, {} free",
                seq_id, pages, self.free_pages
            )));
        }
        self.free_pages -= pages;
        self.sequences.insert(seq_id, num_tokens);
        Ok(())
    }

    /// Extend a sequence by `num_tokens`
    pub fn grow(&mut self, seq_id: i64, num_tokens: usize) -> Result<()> {
        let len = *self
            .sequences
            .get(&seq_id)
            .ok_or_else(|| EngineError::Cache(format!("unknown sequence {}", seq_id)))?;
        let extra = self.pages_for(len + num_tokens) - self.pages_for(len);
        if extra > self.free_pages {
            return Err(EngineError::Cache(format!(
                "sequence {} needs {} more pages, {} free",
                seq_id, extra, self.free_pages
            )));
        }
        self.free_pages -= extra;
        self.sequences.insert(seq_id, len + num_tokens);
        Ok(())
    }

    /// Remove the last `num_tokens` of a sequence
    pub fn shrink(&mut self, seq_id: i64, num_tokens: usize) -> Result<()> {
        let len = *self
            .sequences
            .get(&seq_id)
            .ok_or_else(|| EngineError::Cache(format!("unknown sequence {}", seq_id)))?;
        if num_tokens > len {
            return Err(EngineError::Cache(format!(
                "cannot pop {} tokens from sequence {} of length {}",
                num_tokens, seq_id, len
            )));
        }
        self.free_pages += self.pages_for(len) - self.pages_for(len - num_tokens);
        self.sequences.insert(seq_id, len - num_tokens);
        Ok(())
    }

    /// Free a sequence; returns the number of tokens it held
    pub fn release(&mut self, seq_id: i64) -> Option<usize> {
        let len = self.sequences.remove(&seq_id)?;
        self.free_pages += self.pages_for(len);
        Some(len)
    }

    pub fn clear(&mut self) {
        self.sequences.clear();
        self.free_pages = self.num_pages;
    }
}
