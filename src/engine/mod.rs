//! Engine module
//!
//! This module contains the request lifecycle, the KV cache bookkeeping and
//! the scheduling actions that drive prefill and decode.

pub mod actions;
pub mod engine_state;
pub mod generation_config;
pub mod kv_cache;
pub mod llm_engine;
pub mod request;
pub mod request_state;
pub mod threaded;

// Re-export commonly used types
pub use engine_state::{EngineState, EngineStats};
pub use generation_config::GenerationConfig;
pub use kv_cache::{KVCacheConfig, KVCacheConfigPayload, PageTable};
pub use llm_engine::{Engine, EngineBuilder, StepOutcome, DEFAULT_SPEC_DRAFT_LENGTH};
pub use request::{FinishReason, Request, RequestInput, RequestOutput};
pub use request_state::{RequestModelState, RequestState};
pub use threaded::ThreadedEngine;
