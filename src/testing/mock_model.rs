use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{Device, Tensor};
use parking_lot::Mutex;

use crate::engine::kv_cache::KVCacheConfig;
use crate::error::{EngineError, Result};
use crate::model::{Model, ModelLib};

/// Next-token distribution as a function of the tokens in the cache
pub type DistributionFn = Arc<dyn Fn(&[u32]) -> Vec<f32> + Send + Sync>;

/// Puts all mass on `(last + 1) % vocab_size`
pub fn successor_distribution(vocab_size: usize) -> DistributionFn {
    Arc::new(move |context: &[u32]| {
        let next = context.last().map_or(0, |&t| (t as usize + 1) % vocab_size);
        let mut row = vec![0.0; vocab_size];
        row[next] = 1.0;
        row
    })
}

/// The same row at every position
pub fn fixed_distribution(row: Vec<f32>) -> DistributionFn {
    Arc::new(move |_: &[u32]| row.clone())
}

/// Uniform over the vocabulary
pub fn uniform_distribution(vocab_size: usize) -> DistributionFn {
    fixed_distribution(vec![1.0 / vocab_size as f32; vocab_size])
}

/// A call made on a [`MockModel`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelCall {
    CreateKVCache,
    AddSequence(i64),
    RemoveSequence(i64),
    PopN(i64, usize),
    Prefill { seq_id: i64, num_tokens: usize },
    Decode { seq_ids: Vec<i64> },
    BatchVerify { seq_ids: Vec<i64>, lengths: Vec<usize> },
    Reset,
}

#[derive(Debug, Default)]
struct MockState {
    sequences: HashMap<i64, Vec<u32>>,
    calls: Vec<ModelCall>,
}

/// Shared view into a [`MockModel`] that outlives boxing it into an engine
#[derive(Debug, Clone, Default)]
pub struct MockModelHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockModelHandle {
    pub fn calls(&self) -> Vec<ModelCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Tokens held in the cache for `seq_id`
    pub fn sequence(&self, seq_id: i64) -> Option<Vec<u32>> {
        self.state.lock().sequences.get(&seq_id).cloned()
    }

    pub fn sequence_length(&self, seq_id: i64) -> Option<usize> {
        self.state.lock().sequences.get(&seq_id).map(Vec::len)
    }

    pub fn num_sequences(&self) -> usize {
        self.state.lock().sequences.len()
    }

    pub fn num_decode_calls(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| matches!(call, ModelCall::Decode { .. }))
            .count()
    }
}

/// Deterministic in-memory model with a scripted next-token distribution
pub struct MockModel {
    vocab_size: usize,
    max_window_size: usize,
    device: Device,
    distribution: DistributionFn,
    has_kv_cache: bool,
    handle: MockModelHandle,
}

impl MockModel {
    /// Model over `vocab_size` tokens that always predicts the successor token
    pub fn new(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            max_window_size: 4096,
            device: Device::Cpu,
            distribution: successor_distribution(vocab_size),
            has_kv_cache: false,
            handle: MockModelHandle::default(),
        }
    }

    pub fn with_distribution(mut self, distribution: DistributionFn) -> Self {
        self.distribution = distribution;
        self
    }

    pub fn with_max_window_size(mut self, max_window_size: usize) -> Self {
        self.max_window_size = max_window_size;
        self
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn handle(&self) -> MockModelHandle {
        self.handle.clone()
    }

    fn record(&self, call: ModelCall) {
        self.handle.state.lock().calls.push(call);
    }

    /// Append tokens to a sequence, returning one distribution per token
    fn append(&self, seq_id: i64, token_ids: &[u32]) -> Result<Vec<f32>> {
        if !self.has_kv_cache {
            return Err(EngineError::Model("kv cache not created".to_string()));
        }
        let mut state = self.handle.state.lock();
        let sequence = state
            .sequences
            .get_mut(&seq_id)
            .ok_or_else(|| EngineError::Model(format!("unknown sequence {}", seq_id)))?;
        if sequence.len() + token_ids.len() > self.max_window_size {
            return Err(EngineError::Model(format!(
                "sequence {} would exceed the window of {} tokens",
                seq_id, self.max_window_size
            )));
        }

        let mut rows = Vec::with_capacity(token_ids.len() * self.vocab_size);
        for &token in token_ids {
            sequence.push(token);
            let row = (self.distribution)(sequence.as_slice());
            if row.len() != self.vocab_size {
                return Err(EngineError::Model(format!(
                    "scripted row has {} entries, vocab is {}",
                    row.len(),
                    self.vocab_size
                )));
            }
            rows.extend(row);
        }
        Ok(rows)
    }

    fn to_tensor(&self, rows: Vec<f32>) -> Result<Tensor> {
        let n = rows.len() / self.vocab_size;
        Ok(Tensor::from_vec(rows, (n, self.vocab_size), &self.device)?)
    }
}

impl Model for MockModel {
    fn create_kv_cache(&mut self, _config: &KVCacheConfig) -> Result<()> {
        self.record(ModelCall::CreateKVCache);
        self.has_kv_cache = true;
        Ok(())
    }

    fn max_window_size(&self) -> usize {
        self.max_window_size
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn add_new_sequence(&mut self, seq_id: i64) -> Result<()> {
        self.record(ModelCall::AddSequence(seq_id));
        let mut state = self.handle.state.lock();
        if state.sequences.insert(seq_id, Vec::new()).is_some() {
            return Err(EngineError::Model(format!("sequence {} already exists", seq_id)));
        }
        Ok(())
    }

    fn remove_sequence(&mut self, seq_id: i64) -> Result<()> {
        self.record(ModelCall::RemoveSequence(seq_id));
        self.handle
            .state
            .lock()
            .sequences
            .remove(&seq_id)
            .map(|_| ())
            .ok_or_else(|| EngineError::Model(format!("unknown sequence {}", seq_id)))
    }

    fn pop_n(&mut self, seq_id: i64, n: usize) -> Result<()> {
        self.record(ModelCall::PopN(seq_id, n));
        let mut state = self.handle.state.lock();
        let sequence = state
            .sequences
            .get_mut(&seq_id)
            .ok_or_else(|| EngineError::Model(format!("unknown sequence {}", seq_id)))?;
        if n > sequence.len() {
            return Err(EngineError::Model(format!(
                "cannot pop {} tokens from sequence {} of length {}",
                n,
                seq_id,
                sequence.len()
            )));
        }
        sequence.truncate(sequence.len() - n);
        Ok(())
    }

    fn prefill(&mut self, seq_id: i64, token_ids: &[u32]) -> Result<Tensor> {
        self.record(ModelCall::Prefill { seq_id, num_tokens: token_ids.len() });
        if token_ids.is_empty() {
            return Err(EngineError::Model("empty prefill".to_string()));
        }
        let rows = self.append(seq_id, token_ids)?;
        let last = rows[rows.len() - self.vocab_size..].to_vec();
        self.to_tensor(last)
    }

    fn decode(&mut self, seq_ids: &[i64], token_ids: &[u32]) -> Result<Tensor> {
        self.record(ModelCall::Decode { seq_ids: seq_ids.to_vec() });
        if seq_ids.len() != token_ids.len() {
            return Err(EngineError::Model("decode inputs differ in length".to_string()));
        }
        let mut rows = Vec::with_capacity(seq_ids.len() * self.vocab_size);
        for (&seq_id, &token) in seq_ids.iter().zip(token_ids) {
            rows.extend(self.append(seq_id, &[token])?);
        }
        self.to_tensor(rows)
    }

    fn batch_verify(&mut self, seq_ids: &[i64], token_ids: &[Vec<u32>]) -> Result<Tensor> {
        self.record(ModelCall::BatchVerify {
            seq_ids: seq_ids.to_vec(),
            lengths: token_ids.iter().map(Vec::len).collect(),
        });
        if seq_ids.len() != token_ids.len() {
            return Err(EngineError::Model("verify inputs differ in length".to_string()));
        }
        let mut rows = Vec::new();
        for (&seq_id, tokens) in seq_ids.iter().zip(token_ids) {
            rows.extend(self.append(seq_id, tokens)?);
        }
        self.to_tensor(rows)
    }

    fn reset(&mut self) -> Result<()> {
        self.record(ModelCall::Reset);
        self.handle.state.lock().sequences.clear();
        Ok(())
    }
}

/// Model library producing [`MockModel`]s
///
/// Every loaded model's handle is kept so tests can inspect models the
/// engine created itself.
#[derive(Clone)]
pub struct MockModelLib {
    factory: Arc<dyn Fn() -> MockModel + Send + Sync>,
    loaded: Arc<Mutex<Vec<(PathBuf, MockModelHandle)>>>,
}

impl MockModelLib {
    pub fn new(vocab_size: usize) -> Self {
        Self::with_factory(move || MockModel::new(vocab_size))
    }

    pub fn with_factory<F>(factory: F) -> Self
    where
        F: Fn() -> MockModel + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
            loaded: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handles of the models loaded so far, in load order
    pub fn loaded(&self) -> Vec<MockModelHandle> {
        self.loaded.lock().iter().map(|(_, handle)| handle.clone()).collect()
    }

    pub fn loaded_paths(&self) -> Vec<PathBuf> {
        self.loaded.lock().iter().map(|(path, _)| path.clone()).collect()
    }
}

impl ModelLib for MockModelLib {
    fn load(&self, model_path: &Path, device: Device) -> Result<Box<dyn Model>> {
        let model = (self.factory)().with_device(device);
        self.loaded.lock().push((model_path.to_path_buf(), model.handle()));
        Ok(Box::new(model))
    }
}
