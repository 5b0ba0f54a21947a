use std::sync::Arc;
use std::time::Instant;

use super::EngineAction;
use crate::engine::engine_state::EngineState;
use crate::engine::kv_cache::{KVCacheConfig, PageTable};
use crate::error::{EngineError, Result};
use crate::model::ModelSet;
use crate::sampler::Sampler;

/// Admits the request at the front of the waiting queue
///
/// The request is prefilled on every model and its first token sampled
/// from the primary model. Admission is deferred, not failed, when the
/// running queue is full or the caches lack room.
pub struct NewRequestPrefill {
    models: ModelSet,
    sampler: Arc<dyn Sampler>,
    kv_cache_config: Arc<KVCacheConfig>,
    growth: usize,
}

impl NewRequestPrefill {
    /// `growth` is the per-step decode growth the admitted request must leave room for
    pub fn new(
        models: ModelSet,
        sampler: Arc<dyn Sampler>,
        kv_cache_config: Arc<KVCacheConfig>,
        growth: usize,
    ) -> Self {
        Self {
            models,
            sampler,
            kv_cache_config,
            growth,
        }
    }

    /// Whether `num_tokens` fit on `table` while every running sequence can still grow
    fn fits(&self, table: &PageTable, num_tokens: usize, running: &[i64]) -> bool {
        let after_decode = (num_tokens + self.growth).min(self.kv_cache_config.max_single_sequence_length);
        let running_growth: usize = running
            .iter()
            .map(|&seq_id| table.pages_to_grow(seq_id, self.growth))
            .sum();
        table.pages_for(after_decode.max(num_tokens)) + running_growth <= table.num_free_pages()
    }
}

impl EngineAction for NewRequestPrefill {
    fn step(&mut self, state: &mut EngineState) -> Result<bool> {
        let Some(request_id) = state.waiting_queue.front().cloned() else {
            return Ok(false);
        };

        if state.running_queue.len() >= self.kv_cache_config.max_num_sequence {
            tracing::trace!("Running queue full, deferring {}", request_id);
            return Ok(false);
        }

        let Some(request_state) = state.request_states.get(&request_id) else {
            tracing::warn!("Waiting request {} has no state, dropping it", request_id);
            state.waiting_queue.pop_front();
            return Ok(true);
        };
        let tokens = request_state.prefill_tokens();

        for (model_index, table) in state.page_tables.iter().enumerate() {
            let running = state.running_internal_ids(model_index);
            if !self.fits(table, tokens.len(), &running) {
                tracing::trace!(
                    "KV cache of model {} cannot admit {} ({} tokens), deferring",
                    model_index,
                    request_id,
                    tokens.len()
                );
                return Ok(false);
            }
        }

        let start = Instant::now();
        let num_models = state.num_models();
        let seq_ids: Vec<i64> = (0..num_models).map(|_| state.next_internal_id()).collect();

        let request_state = state
            .request_states
            .get_mut(&request_id)
            .ok_or_else(|| EngineError::InvalidRequest(format!("request {} vanished", request_id)))?;

        let mut models = self.models.lock();
        let mut primary_probs = None;
        for (model_index, model) in models.iter_mut().enumerate() {
            let seq_id = seq_ids[model_index];
            model.add_new_sequence(seq_id)?;
            state.page_tables[model_index].allocate(seq_id, tokens.len())?;

            let slot = &mut request_state.model_states[model_index];
            slot.internal_id = Some(seq_id);

            let mut probs = None;
            for chunk in tokens.chunks(self.kv_cache_config.prefill_chunk_size) {
                probs = Some(model.prefill(seq_id, chunk)?);
            }
            slot.num_tokens_in_cache = tokens.len();

            if model_index == 0 {
                primary_probs = probs;
            }
        }
        drop(models);

        let probs = primary_probs
            .ok_or_else(|| EngineError::Model(format!("prefill of {} produced no output", request_id)))?;
        let config = request_state.request.generation_config.clone();
        let sampled = self.sampler.batch_sample_tokens(
            &probs,
            &[0],
            std::slice::from_ref(&request_id),
            &[&config],
            &mut [&mut request_state.rng],
            None,
        )?;
        let token = sampled
            .first()
            .copied()
            .ok_or_else(|| EngineError::Sampler("no token sampled".to_string()))?;
        for slot in request_state.model_states.iter_mut() {
            slot.commit(token);
        }

        state.waiting_queue.pop_front();
        state.running_queue.push(request_id.clone());

        state.stats.prefill_steps += 1;
        state.stats.prefill_tokens += tokens.len() as u64;
        state.stats.prefill_time += start.elapsed();

        tracing::debug!(
            "Admitted {} with {} prefill tokens, first token {}",
            request_id,
            tokens.len(),
            token.token_id
        );
        Ok(true)
    }

    fn name(&self) -> &'static str {
        "new_request_prefill"
    }
}
