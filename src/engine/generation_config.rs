//! Generation configuration for a request
//!
//! This module defines the parameters that control how tokens are sampled
//! for a request and when its generation stops: temperature, top-k, top-p,
//! maximum output length and stop tokens.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Parameters controlling sampling and stopping for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Temperature for sampling (0.0 = greedy, higher = more random)
    pub temperature: f32,

    /// Nucleus sampling threshold, 1.0 disables it
    pub top_p: f32,

    /// Top-k truncation, 0 disables it
    pub top_k: usize,

    /// Maximum number of tokens to generate
    pub max_tokens: usize,

    /// Token ids that end generation when produced
    pub stop_token_ids: Vec<u32>,

    /// Whether to keep generating past stop tokens
    pub ignore_eos: bool,

    /// Seed for the request's random generator
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 1.0,
            top_k: 0,
            max_tokens: 64,
            stop_token_ids: Vec::new(),
            ignore_eos: false,
            seed: None,
        }
    }
}

impl GenerationConfig {
    /// Create a new generation config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Greedy decoding with otherwise default settings
    pub fn greedy() -> Self {
        Self::default().with_temperature(0.0)
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_stop_token_ids(mut self, stop_token_ids: Vec<u32>) -> Self {
        self.stop_token_ids = stop_token_ids;
        self
    }

    pub fn with_ignore_eos(mut self, ignore_eos: bool) -> Self {
        self.ignore_eos = ignore_eos;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Check if sampling is greedy (temperature == 0.0)
    pub fn is_greedy(&self) -> bool {
        self.temperature == 0.0
    }

    /// Whether `token_id` ends generation under this config
    pub fn is_stop_token(&self, token_id: u32) -> bool {
        !self.ignore_eos && self.stop_token_ids.contains(&token_id)
    }

    /// Validate generation parameters
    pub fn validate(&self) -> Result<()> {
        if !(self.temperature >= 0.0) {
            return Err(EngineError::InvalidRequest(format!(
                "temperature must be non-negative, got {}",
                self.temperature
            )));
        }

        if self.max_tokens == 0 {
            return Err(EngineError::InvalidRequest(
                "max_tokens must be positive".to_string(),
            ));
        }

        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(EngineError::InvalidRequest(format!(
                "top_p must be in (0.0, 1.0], got {}",
                self.top_p
            )));
        }

        Ok(())
    }
}
