//! # Nano-Serve Rust
//!
//! Request scheduling and token sampling core for a lightweight LLM serving
//! engine, built on candle.
//!
//! ## Features
//!
//! - **Step-driven scheduling** - abort, prefill and decode actions run in a fixed order
//! - **Paged KV cache accounting** - admission control and preemption under memory pressure
//! - **Speculative decoding** - optional draft model with exact rejection sampling
//! - **Host and device samplers** - temperature, top-k and top-p with per-request seeds
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use nano_serve_rs::{Engine, EngineConfig, GenerationConfig, Request};
//! # fn lib() -> Arc<dyn nano_serve_rs::ModelLib> { unimplemented!() }
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = EngineConfig::new("/path/to/model", "/path/to/tokenizer.json");
//!     let mut engine = Engine::from_config(&config, lib())?;
//!
//!     let params = GenerationConfig::new().with_temperature(0.8).with_max_tokens(64);
//!     engine.add_request(Request::from_text("Hello!", params, |output| {
//!         println!("Generated: {}", output.text);
//!     }));
//!
//!     while engine.has_pending_work() {
//!         engine.step()?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Background Engine
//!
//! ```rust,no_run
//! use nano_serve_rs::{Engine, GenerationConfig, ThreadedEngine};
//! # fn engine() -> Engine { unimplemented!() }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let threaded = ThreadedEngine::spawn(engine());
//!     let output = threaded.generate_text("Tell me a story", GenerationConfig::new()).await?;
//!     println!("{}", output.text);
//!     threaded.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod sampler;
pub mod testing;
pub mod tokenizer;
pub mod utils;

// Re-export main types for convenience
pub use config::{EngineConfig, ModelEntry};
pub use engine::generation_config::GenerationConfig;
pub use engine::kv_cache::{KVCacheConfig, KVCacheConfigPayload};
pub use engine::llm_engine::{Engine, EngineBuilder, StepOutcome};
pub use engine::request::{FinishReason, Request, RequestInput, RequestOutput};
pub use engine::threaded::ThreadedEngine;
pub use model::{DeviceSpec, DeviceType, MemoryManager, Model, ModelInfo, ModelLib};
pub use sampler::{create_sampler, SampleResult, Sampler};
pub use tokenizer::{HfTokenizer, Tokenizer};

// Error types
pub use error::{EngineError, Result};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
