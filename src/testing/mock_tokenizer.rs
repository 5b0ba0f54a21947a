use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::tokenizer::Tokenizer;

/// Lossless tokenizer mapping each character to its code point
///
/// Clones share the call counter, so a test can keep one clone and hand the
/// other to the engine.
#[derive(Debug, Clone, Default)]
pub struct CharTokenizer {
    encode_calls: Arc<AtomicUsize>,
    reject: Option<char>,
}

impl CharTokenizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail to encode any text containing `c`
    pub fn rejecting(c: char) -> Self {
        Self {
            reject: Some(c),
            ..Self::default()
        }
    }

    pub fn num_encode_calls(&self) -> usize {
        self.encode_calls.load(Ordering::SeqCst)
    }
}

impl Tokenizer for CharTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        self.encode_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(c) = self.reject {
            if text.contains(c) {
                return Err(EngineError::Tokenization(format!("cannot encode {:?}", c)));
            }
        }
        Ok(text.chars().map(u32::from).collect())
    }

    fn decode(&self, token_ids: &[u32]) -> Result<String> {
        token_ids
            .iter()
            .map(|&id| {
                char::from_u32(id)
                    .ok_or_else(|| EngineError::Tokenization(format!("invalid token id {}", id)))
            })
            .collect()
    }
}
