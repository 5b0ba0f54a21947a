//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use nano_serve_rs::testing::{CharTokenizer, MockModel};
use nano_serve_rs::{Engine, EngineBuilder, GenerationConfig, Request, RequestInput, RequestOutput};

pub use nano_serve_rs::utils::init_test_logging;

/// Collects every output delivered to the callbacks it hands out
#[derive(Clone, Default)]
pub struct OutputSink {
    outputs: Arc<Mutex<Vec<RequestOutput>>>,
}

impl OutputSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> impl FnOnce(RequestOutput) + Send + 'static {
        let outputs = Arc::clone(&self.outputs);
        move |output| outputs.lock().unwrap().push(output)
    }

    pub fn outputs(&self) -> Vec<RequestOutput> {
        self.outputs.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.outputs.lock().unwrap().len()
    }

    pub fn get(&self, request_id: &str) -> Option<RequestOutput> {
        self.outputs
            .lock()
            .unwrap()
            .iter()
            .find(|o| o.request_id == request_id)
            .cloned()
    }
}

pub fn kv_json(page_size: usize, max_num_sequence: usize, max_total_sequence_length: usize) -> String {
    format!(
        r#"{{"page_size": {}, "max_num_sequence": {}, "max_total_sequence_length": {}}}"#,
        page_size, max_num_sequence, max_total_sequence_length
    )
}

/// Single-model engine over a successor-predicting mock model
pub fn single_model_engine(max_single: usize, kv: &str, vocab_size: usize) -> Engine {
    init_test_logging();
    EngineBuilder::new(max_single)
        .tokenizer(Box::new(CharTokenizer::new()))
        .kv_cache_config_json(kv)
        .model(Box::new(MockModel::new(vocab_size)))
        .build()
        .unwrap()
}

pub fn token_request(
    id: &str,
    tokens: Vec<u32>,
    config: GenerationConfig,
    sink: &OutputSink,
) -> Request {
    Request::new(id, RequestInput::TokenIds(tokens), config, sink.callback())
}

/// Step until no work is left, panicking after `max_steps`
pub fn run_to_completion(engine: &mut Engine, max_steps: usize) -> usize {
    let mut steps = 0;
    while engine.has_pending_work() {
        assert!(steps < max_steps, "engine did not drain within {} steps", max_steps);
        engine.step().unwrap();
        steps += 1;
    }
    steps
}

/// Structural invariants that must hold between any two steps
pub fn assert_consistent(engine: &Engine) {
    let state = engine.state();

    for id in &state.running_queue {
        assert!(!state.waiting_queue.contains(id), "{} is both waiting and running", id);
    }
    for id in state.waiting_queue.iter().chain(&state.running_queue) {
        let request_state = state
            .request_states
            .get(id)
            .unwrap_or_else(|| panic!("live request {} has no state", id));
        assert_eq!(request_state.model_states.len(), engine.num_models());
    }
    assert_eq!(
        state.request_states.len(),
        state.waiting_queue.len() + state.running_queue.len()
    );
    assert!(state.running_queue.len() <= engine.kv_cache_config().max_num_sequence);

    for table in &state.page_tables {
        assert!(table.num_used_tokens() <= table.capacity_tokens());
        assert_eq!(table.num_sequences(), state.running_queue.len());
    }
}
