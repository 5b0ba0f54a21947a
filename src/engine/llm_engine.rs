//! Serving engine - step-driven request scheduling
//!
//! The [`Engine`] owns the models, the tokenizer, the sampler and all
//! scheduling state. Callers add requests and drive progress by calling
//! [`Engine::step`] repeatedly; every call runs the abort, prefill and decode
//! actions in that fixed order and makes at most one scheduling decision.
//!
//! # Author
//!
//! Sai Sunkara <https://github.com/ssvgopal>

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::EngineConfig;
use crate::engine::actions::{
    decode_growth, process_finished_requests, AbortRequest, BatchDecode, EngineAction, NewRequestPrefill,
};
use crate::engine::engine_state::EngineState;
use crate::engine::kv_cache::{KVCacheConfig, KVCacheConfigPayload};
use crate::engine::request::{Request, RequestOutput};
use crate::engine::request_state::RequestState;
use crate::error::{EngineError, Result};
use crate::model::{MemoryManager, Model, ModelInfo, ModelLib, ModelSet};
use crate::sampler::{create_sampler, Sampler};
use crate::tokenizer::{HfTokenizer, Tokenizer};

/// Default number of tokens a draft model proposes per decode step
pub const DEFAULT_SPEC_DRAFT_LENGTH: usize = 4;

/// What a call to [`Engine::step`] did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepOutcome {
    /// The abort queue was drained
    pub aborted: bool,
    /// A waiting request was admitted
    pub prefilled: bool,
    /// A decode round ran
    pub decoded: bool,
    /// Requests that finished and were delivered this step
    pub num_finished: usize,
}

impl StepOutcome {
    pub fn did_work(&self) -> bool {
        self.aborted || self.prefilled || self.decoded
    }
}

/// Step-driven serving engine
pub struct Engine {
    state: EngineState,
    models: ModelSet,
    tokenizer: Arc<dyn Tokenizer>,
    kv_cache_config: Arc<KVCacheConfig>,
    sampler: Arc<dyn Sampler>,
    abort_request: AbortRequest,
    new_request_prefill: NewRequestPrefill,
    batch_decode: BatchDecode,
    max_single_sequence_length: usize,
    spec_draft_length: usize,
}

impl Engine {
    /// Create an engine, loading the tokenizer and every model from disk
    ///
    /// `model_infos[0]` is the primary model; an optional second entry is
    /// used as the draft model for speculative decoding.
    pub fn new<P: Into<PathBuf>>(
        max_single_sequence_length: usize,
        tokenizer_path: P,
        kv_cache_config_json: &str,
        model_infos: Vec<ModelInfo>,
    ) -> Result<Self> {
        EngineBuilder::new(max_single_sequence_length)
            .tokenizer_path(tokenizer_path)
            .kv_cache_config_json(kv_cache_config_json)
            .model_infos(model_infos)
            .build()
    }

    /// Create an engine from a configuration file, loading every model with `lib`
    pub fn from_config(config: &EngineConfig, lib: Arc<dyn ModelLib>) -> Result<Self> {
        let model_infos = config
            .models
            .iter()
            .map(|entry| ModelInfo::new(Arc::clone(&lib), entry.model_path.clone(), entry.device))
            .collect();
        EngineBuilder::new(config.max_single_sequence_length)
            .tokenizer_path(config.tokenizer_path.clone())
            .kv_cache_config(config.kv_cache.clone())
            .model_infos(model_infos)
            .spec_draft_length(config.spec_draft_length)
            .build()
    }

    /// Queue a request
    ///
    /// The input is tokenized here, once. A request that cannot be served
    /// (tokenizer failure, invalid generation config, input too long,
    /// duplicate id) is finished immediately through its callback with
    /// [`crate::FinishReason::Error`]; the engine itself never fails.
    pub fn add_request(&mut self, mut request: Request) {
        if let Err(e) = self.prepare_request(&mut request) {
            tracing::warn!("Rejected request {}: {}", request.id, e);
            let output = RequestOutput::error(&request.id, &e);
            request.finish(output);
            return;
        }

        let request_id = request.id.clone();
        tracing::debug!("Queued {}", request);
        let request_state = RequestState::new(request, self.num_models());
        self.state.request_states.insert(request_id.clone(), request_state);
        self.state.waiting_queue.push_back(request_id);
        self.state.stats.requests_added += 1;
    }

    fn prepare_request(&self, request: &mut Request) -> Result<()> {
        if self.state.is_live(&request.id) {
            return Err(EngineError::InvalidRequest(format!(
                "request id {} is already in use",
                request.id
            )));
        }
        request.generation_config.validate()?;
        request.tokenize(self.tokenizer.as_ref())?;

        let input_len = request.input_total_length().unwrap_or(0);
        if input_len == 0 {
            return Err(EngineError::InvalidRequest("input is empty".to_string()));
        }
        if input_len >= self.max_single_sequence_length {
            return Err(EngineError::InvalidRequest(format!(
                "input of {} tokens leaves no room to generate within {} tokens",
                input_len, self.max_single_sequence_length
            )));
        }
        Ok(())
    }

    /// Queue a request for abortion at the start of the next step
    ///
    /// Unknown or already finished ids are ignored.
    pub fn abort_request(&mut self, request_id: &str) {
        if !self.state.abort_queue.iter().any(|id| id == request_id) {
            self.state.abort_queue.push(request_id.to_string());
        }
    }

    /// Run one scheduling step
    ///
    /// # Panics
    /// If neither prefill nor decode made progress while requests are
    /// running. That state is a scheduling bug and is never recoverable.
    pub fn step(&mut self) -> Result<StepOutcome> {
        let span = tracing::debug_span!("step", running = self.state.running_queue.len());
        let _enter = span.enter();

        let mut outcome = StepOutcome {
            aborted: run_action(&mut self.abort_request, &mut self.state)?,
            ..StepOutcome::default()
        };

        if run_action(&mut self.new_request_prefill, &mut self.state)? {
            outcome.prefilled = true;
            outcome.num_finished = self.process_finished()?;
            return Ok(outcome);
        }

        if run_action(&mut self.batch_decode, &mut self.state)? {
            outcome.decoded = true;
            outcome.num_finished = self.process_finished()?;
            return Ok(outcome);
        }

        if !self.state.running_queue.is_empty() {
            panic!(
                "internal invariant violated: step made no progress with {} running and {} waiting requests",
                self.state.running_queue.len(),
                self.state.waiting_queue.len()
            );
        }
        Ok(outcome)
    }

    fn process_finished(&mut self) -> Result<usize> {
        let mut models = self.models.lock();
        let finished = process_finished_requests(
            &mut models,
            &mut self.state,
            self.tokenizer.as_ref(),
            self.max_single_sequence_length,
        )?;
        Ok(finished.len())
    }

    /// Drop every request and discard all model cache contents
    ///
    /// Dropped requests never receive a callback.
    pub fn reset(&mut self) -> Result<()> {
        let dropped = self.state.request_states.len();
        self.state.reset();
        for model in self.models.lock().iter_mut() {
            model.reset()?;
        }
        tracing::info!("Engine reset, dropped {} live requests", dropped);
        Ok(())
    }

    /// Aggregate statistics as a JSON string
    pub fn stats(&self) -> String {
        self.state.stats_json()
    }

    /// Release process-wide device memory at a reinitialisation boundary
    ///
    /// Call after dropping one engine and before creating the next.
    pub fn clear_global_memory_manager(manager: &dyn MemoryManager) -> Result<()> {
        tracing::info!("Clearing global memory manager");
        manager.clear()
    }

    pub fn num_waiting(&self) -> usize {
        self.state.waiting_queue.len()
    }

    pub fn num_running(&self) -> usize {
        self.state.running_queue.len()
    }

    pub fn has_pending_work(&self) -> bool {
        self.state.has_pending_work()
    }

    pub fn num_models(&self) -> usize {
        self.state.num_models()
    }

    pub fn request_state(&self, request_id: &str) -> Option<&RequestState> {
        self.state.request_states.get(request_id)
    }

    /// Read-only view of the scheduling state
    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn kv_cache_config(&self) -> &KVCacheConfig {
        &self.kv_cache_config
    }

    pub fn max_single_sequence_length(&self) -> usize {
        self.max_single_sequence_length
    }

    pub fn sampler_name(&self) -> &'static str {
        self.sampler.name()
    }
}

fn run_action(action: &mut dyn EngineAction, state: &mut EngineState) -> Result<bool> {
    let did_work = action.step(state)?;
    tracing::trace!("{} did_work={}", action.name(), did_work);
    Ok(did_work)
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("num_models", &self.num_models())
            .field("kv_cache_config", &self.kv_cache_config)
            .field("sampler", &self.sampler.name())
            .field("num_waiting", &self.num_waiting())
            .field("num_running", &self.num_running())
            .finish()
    }
}

/// Builder for engines with injected collaborators
///
/// Injected models come first, followed by models loaded from
/// `model_infos`, in the order given.
pub struct EngineBuilder {
    max_single_sequence_length: usize,
    tokenizer_path: Option<PathBuf>,
    tokenizer: Option<Box<dyn Tokenizer>>,
    kv_cache_config_json: Option<String>,
    kv_cache_config: Option<KVCacheConfigPayload>,
    model_infos: Vec<ModelInfo>,
    models: Vec<Box<dyn Model>>,
    spec_draft_length: usize,
    sampler: Option<Arc<dyn Sampler>>,
}

impl EngineBuilder {
    pub fn new(max_single_sequence_length: usize) -> Self {
        Self {
            max_single_sequence_length,
            tokenizer_path: None,
            tokenizer: None,
            kv_cache_config_json: None,
            kv_cache_config: None,
            model_infos: Vec::new(),
            models: Vec::new(),
            spec_draft_length: DEFAULT_SPEC_DRAFT_LENGTH,
            sampler: None,
        }
    }

    /// Load a HuggingFace tokenizer from this path
    pub fn tokenizer_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.tokenizer_path = Some(path.into());
        self
    }

    /// Use this tokenizer instead of loading one
    pub fn tokenizer(mut self, tokenizer: Box<dyn Tokenizer>) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    pub fn kv_cache_config_json<S: Into<String>>(mut self, json: S) -> Self {
        self.kv_cache_config_json = Some(json.into());
        self
    }

    pub fn kv_cache_config(mut self, payload: KVCacheConfigPayload) -> Self {
        self.kv_cache_config = Some(payload);
        self
    }

    pub fn model_infos(mut self, model_infos: Vec<ModelInfo>) -> Self {
        self.model_infos.extend(model_infos);
        self
    }

    /// Add an already loaded model
    pub fn model(mut self, model: Box<dyn Model>) -> Self {
        self.models.push(model);
        self
    }

    pub fn spec_draft_length(mut self, spec_draft_length: usize) -> Self {
        self.spec_draft_length = spec_draft_length;
        self
    }

    /// Use this sampler instead of picking one for the primary model's device
    pub fn sampler(mut self, sampler: Arc<dyn Sampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn build(self) -> Result<Engine> {
        let max_single_sequence_length = self.max_single_sequence_length;
        if max_single_sequence_length == 0 {
            return Err(EngineError::config("max_single_sequence_length must be positive"));
        }
        if self.spec_draft_length == 0 {
            return Err(EngineError::config("spec_draft_length must be positive"));
        }

        let num_models = self.models.len() + self.model_infos.len();
        if num_models == 0 {
            return Err(EngineError::config("no model provided"));
        }
        if num_models > 2 {
            return Err(EngineError::config(format!(
                "at most one draft model is supported, got {} models",
                num_models
            )));
        }

        let kv_cache_config = match (self.kv_cache_config_json, self.kv_cache_config) {
            (Some(json), _) => KVCacheConfig::from_json(&json, max_single_sequence_length)?,
            (None, Some(payload)) => KVCacheConfig::new(&payload, max_single_sequence_length)?,
            (None, None) => KVCacheConfig::new(&KVCacheConfigPayload::default(), max_single_sequence_length)?,
        };

        let tokenizer: Arc<dyn Tokenizer> = match (self.tokenizer, self.tokenizer_path) {
            (Some(tokenizer), _) => Arc::from(tokenizer),
            (None, Some(path)) => Arc::new(HfTokenizer::from_path(path)?),
            (None, None) => return Err(EngineError::config("no tokenizer provided")),
        };

        let mut models = self.models;
        for info in &self.model_infos {
            models.push(info.load()?);
        }

        for (index, model) in models.iter_mut().enumerate() {
            model.create_kv_cache(&kv_cache_config)?;
            if model.max_window_size() < max_single_sequence_length {
                return Err(EngineError::config(format!(
                    "model {} has a window of {} tokens, below max_single_sequence_length {}",
                    index,
                    model.max_window_size(),
                    max_single_sequence_length
                )));
            }
        }

        if let [target, draft] = models.as_slice() {
            if target.vocab_size() != draft.vocab_size() {
                return Err(EngineError::config(format!(
                    "draft model vocabulary of {} tokens differs from the target's {}",
                    draft.vocab_size(),
                    target.vocab_size()
                )));
            }
        }

        let sampler = match self.sampler {
            Some(sampler) => sampler,
            None => create_sampler(models[0].device()),
        };

        let mut state = EngineState::new(&kv_cache_config, num_models);
        state.reset();

        let kv_cache_config = Arc::new(kv_cache_config);
        let models: ModelSet = Arc::new(Mutex::new(models));
        let growth = decode_growth(num_models, self.spec_draft_length);

        tracing::info!(
            "Engine ready: {} model(s), {} sampler, {} pages of {} tokens",
            num_models,
            sampler.name(),
            kv_cache_config.num_pages(),
            kv_cache_config.page_size
        );

        Ok(Engine {
            state,
            abort_request: AbortRequest::new(Arc::clone(&models), Arc::clone(&tokenizer)),
            new_request_prefill: NewRequestPrefill::new(
                Arc::clone(&models),
                Arc::clone(&sampler),
                Arc::clone(&kv_cache_config),
                growth,
            ),
            batch_decode: BatchDecode::new(
                Arc::clone(&models),
                Arc::clone(&sampler),
                self.spec_draft_length,
                max_single_sequence_length,
            ),
            models,
            tokenizer,
            kv_cache_config,
            sampler,
            max_single_sequence_length,
            spec_draft_length: self.spec_draft_length,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::generation_config::GenerationConfig;
    use crate::engine::request::{FinishReason, RequestInput};
    use crate::model::DeviceSpec;
    use crate::testing::{CharTokenizer, MockMemoryManager, MockModel, MockModelLib};
    use std::sync::Mutex as StdMutex;

    const KV_JSON: &str = r#"{"page_size": 4, "max_num_sequence": 4, "max_total_sequence_length": 64}"#;

    fn engine() -> Engine {
        EngineBuilder::new(32)
            .tokenizer(Box::new(CharTokenizer::new()))
            .kv_cache_config_json(KV_JSON)
            .model(Box::new(MockModel::new(8)))
            .build()
            .unwrap()
    }

    fn collect() -> (Arc<StdMutex<Vec<RequestOutput>>>, impl FnOnce(RequestOutput) + Send + 'static) {
        let sink = Arc::new(StdMutex::new(Vec::new()));
        let writer = Arc::clone(&sink);
        (sink, move |output| writer.lock().unwrap().push(output))
    }

    #[test]
    fn test_no_model_is_configuration_error() {
        let err = EngineBuilder::new(32)
            .tokenizer(Box::new(CharTokenizer::new()))
            .kv_cache_config_json(KV_JSON)
            .build()
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("no model provided"));
    }

    #[test]
    fn test_small_window_rejected() {
        let err = EngineBuilder::new(32)
            .tokenizer(Box::new(CharTokenizer::new()))
            .kv_cache_config_json(KV_JSON)
            .model(Box::new(MockModel::new(8).with_max_window_size(16)))
            .build()
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_draft_vocabulary_must_match() {
        let err = EngineBuilder::new(32)
            .tokenizer(Box::new(CharTokenizer::new()))
            .kv_cache_config_json(KV_JSON)
            .model(Box::new(MockModel::new(8)))
            .model(Box::new(MockModel::new(16)))
            .build()
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_zero_max_length_rejected() {
        assert!(Engine::new(0, "missing", KV_JSON, Vec::new()).unwrap_err().is_configuration());
    }

    #[test]
    fn test_new_loads_models_from_infos() {
        let dir = tempfile::tempdir().unwrap();
        let lib = MockModelLib::new(8);
        let infos = vec![ModelInfo::new(Arc::new(lib.clone()), "primary", DeviceSpec::cpu())];
        // No tokenizer.json in the directory; the tokenizer loads before any model
        let err = Engine::new(32, dir.path(), KV_JSON, infos.clone()).unwrap_err();
        assert!(err.is_configuration());

        let engine = EngineBuilder::new(32)
            .tokenizer(Box::new(CharTokenizer::new()))
            .kv_cache_config_json(KV_JSON)
            .model_infos(infos)
            .build()
            .unwrap();
        assert_eq!(engine.num_models(), 1);
        assert_eq!(lib.loaded_paths(), vec![PathBuf::from("primary")]);
        assert_eq!(engine.sampler_name(), "host");
    }

    #[test]
    fn test_add_request_queues() {
        let mut engine = engine();
        let (_, callback) = collect();
        engine.add_request(Request::new("a", RequestInput::Text("hello".into()), GenerationConfig::default(), callback));

        assert_eq!(engine.num_waiting(), 1);
        let state = engine.request_state("a").unwrap();
        assert_eq!(state.input_len(), 5);
        assert_eq!(state.model_states.len(), 1);
    }

    #[test]
    fn test_invalid_requests_finish_with_error() {
        let mut engine = engine();
        let (sink, callback) = collect();
        engine.add_request(Request::new(
            "long",
            RequestInput::TokenIds(vec![1; 32]),
            GenerationConfig::default(),
            callback,
        ));
        let (_, callback) = collect();
        engine.add_request(Request::new("ok", RequestInput::TokenIds(vec![1]), GenerationConfig::default(), callback));
        let (dup_sink, callback) = collect();
        engine.add_request(Request::new("ok", RequestInput::TokenIds(vec![1]), GenerationConfig::default(), callback));
        let (bad_sink, callback) = collect();
        engine.add_request(Request::new(
            "bad",
            RequestInput::TokenIds(vec![1]),
            GenerationConfig::new().with_top_p(0.0),
            callback,
        ));

        assert_eq!(engine.num_waiting(), 1);
        for sink in [sink, dup_sink, bad_sink] {
            let outputs = sink.lock().unwrap();
            assert_eq!(outputs.len(), 1);
            assert!(matches!(outputs[0].finish_reason, FinishReason::Error(_)));
        }
    }

    #[test]
    fn test_step_prefill_then_decode() {
        let mut engine = engine();
        let (_, callback) = collect();
        engine.add_request(Request::new("a", RequestInput::TokenIds(vec![1, 2]), GenerationConfig::greedy(), callback));

        let outcome = engine.step().unwrap();
        assert!(outcome.prefilled && !outcome.decoded);
        assert_eq!(engine.request_state("a").unwrap().num_generated(), 1);

        let outcome = engine.step().unwrap();
        assert!(outcome.decoded && !outcome.prefilled);
        let generated: Vec<u32> = engine
            .request_state("a")
            .unwrap()
            .generated_tokens()
            .iter()
            .map(|t| t.token_id)
            .collect();
        assert_eq!(generated, vec![3, 4]);
    }

    #[test]
    fn test_idle_step_does_nothing() {
        let mut engine = engine();
        let outcome = engine.step().unwrap();
        assert!(!outcome.did_work());
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut engine = engine();
        let (_, callback) = collect();
        engine.add_request(Request::new("a", RequestInput::TokenIds(vec![1]), GenerationConfig::default(), callback));
        engine.step().unwrap();

        engine.reset().unwrap();

        assert!(!engine.has_pending_work());
        assert!(engine.request_state("a").is_none());
        let stats: serde_json::Value = serde_json::from_str(&engine.stats()).unwrap();
        assert_eq!(stats["stats"]["requests_added"], 0);
        assert_eq!(stats["kv_cache"][0]["used_tokens"], 0);
    }

    #[test]
    fn test_clear_global_memory_manager() {
        let manager = MockMemoryManager::new();
        Engine::clear_global_memory_manager(&manager).unwrap();
        assert_eq!(manager.num_clears(), 1);
    }
}
