//! Deterministic collaborators for driving the engine without hardware
//!
//! [`MockModel`] replays a scripted next-token distribution over an
//! in-memory cache, [`CharTokenizer`] maps characters to code points, and
//! [`MockMemoryManager`] counts clears. Integration tests and downstream
//! hosts use them to exercise scheduling end to end.

mod mock_model;
mod mock_tokenizer;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub use mock_model::{
    fixed_distribution, successor_distribution, uniform_distribution, DistributionFn, MockModel,
    MockModelHandle, MockModelLib, ModelCall,
};
pub use mock_tokenizer::CharTokenizer;

use crate::error::Result;
use crate::model::MemoryManager;

/// Memory manager that only counts how often it was cleared
#[derive(Debug, Clone, Default)]
pub struct MockMemoryManager {
    clears: Arc<AtomicUsize>,
}

impl MockMemoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

impl MemoryManager for MockMemoryManager {
    fn clear(&self) -> Result<()> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
