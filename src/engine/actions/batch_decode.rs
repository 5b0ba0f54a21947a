use std::sync::Arc;
use std::time::Instant;

use candle_core::Tensor;

use super::{preempt_last, EngineAction};
use crate::engine::engine_state::{running_states, EngineState};
use crate::engine::generation_config::GenerationConfig;
use crate::engine::request_state::RequestState;
use crate::error::{EngineError, Result};
use crate::model::{Model, ModelSet};
use crate::sampler::{RandomGenerator, SampleResult, Sampler};

/// Runs one decode round over every running request
///
/// With a single model each request gains exactly one token. With a draft
/// model the draft proposes up to `spec_draft_length` tokens per request, the
/// primary model scores them in one verification pass, and each request
/// gains between one and `spec_draft_length + 1` tokens. Near
/// `max_single_sequence_length` fewer tokens are drafted so a step never
/// commits past the window.
pub struct BatchDecode {
    models: ModelSet,
    sampler: Arc<dyn Sampler>,
    spec_draft_length: usize,
    max_single_sequence_length: usize,
}

impl BatchDecode {
    pub fn new(
        models: ModelSet,
        sampler: Arc<dyn Sampler>,
        spec_draft_length: usize,
        max_single_sequence_length: usize,
    ) -> Self {
        Self {
            models,
            sampler,
            spec_draft_length,
            max_single_sequence_length,
        }
    }

    /// Draft tokens to propose for `request` this step
    ///
    /// Verification may commit one token past the drafts, so the drafts stop
    /// one short of the window.
    fn draft_length(&self, request: &RequestState) -> usize {
        let len = request.input_len() + request.num_generated();
        self.spec_draft_length
            .min(self.max_single_sequence_length.saturating_sub(len + 1))
    }

    /// Tokens this step appends to `request`'s cache on model `model_index`
    fn step_growth(&self, request: &RequestState, model_index: usize, num_models: usize) -> usize {
        if num_models == 1 {
            return 1;
        }
        let k = self.draft_length(request);
        if model_index == 0 {
            return k + 1;
        }
        // Catch up to the last committed token, then feed all drafts but the last
        let len = request.input_len() + request.num_generated();
        (len + k.saturating_sub(1)).saturating_sub(request.model_states[model_index].num_tokens_in_cache)
    }

    /// Preempt from the back of the running queue until every model can hold
    /// this step's growth of every running request
    fn make_room(&self, models: &mut [Box<dyn Model>], state: &mut EngineState) -> Result<bool> {
        let num_models = state.num_models();
        let mut preempted = false;
        while !state.running_queue.is_empty() {
            let fits = (0..num_models).all(|model_index| {
                let growth: Vec<(i64, usize)> = state
                    .running_queue
                    .iter()
                    .filter_map(|id| state.request_states.get(id))
                    .filter_map(|request| {
                        let seq_id = request.model_states[model_index].internal_id?;
                        Some((seq_id, self.step_growth(request, model_index, num_models)))
                    })
                    .collect();
                state.page_tables[model_index].can_grow_all(&growth)
            });
            if fits {
                break;
            }
            preempt_last(models, state)?;
            preempted = true;
        }
        Ok(preempted)
    }

    fn decode(&self, model: &mut dyn Model, state: &mut EngineState) -> Result<()> {
        let EngineState {
            running_queue,
            request_states,
            page_tables,
            stats,
            ..
        } = state;
        let mut requests = running_states(running_queue, request_states);

        let seq_ids = primary_seq_ids(&requests)?;
        let last_tokens: Vec<u32> = requests
            .iter()
            .map(|r| last_committed(r, 0))
            .collect::<Result<_>>()?;

        for &seq_id in &seq_ids {
            page_tables[0].grow(seq_id, 1)?;
        }
        let probs = model.decode(&seq_ids, &last_tokens)?;

        let sample_indices: Vec<usize> = (0..requests.len()).collect();
        let sampled = sample(self.sampler.as_ref(), &probs, &sample_indices, &mut requests, None)?;

        for (request, token) in requests.iter_mut().zip(sampled) {
            let slot = &mut request.model_states[0];
            slot.num_tokens_in_cache += 1;
            slot.commit(token);
        }
        stats.decode_tokens += requests.len() as u64;
        Ok(())
    }

    fn speculative_decode(
        &self,
        target: &mut dyn Model,
        draft: &mut dyn Model,
        state: &mut EngineState,
    ) -> Result<()> {
        let EngineState {
            running_queue,
            request_states,
            page_tables,
            stats,
            ..
        } = state;
        let mut requests = running_states(running_queue, request_states);
        let n = requests.len();
        let draft_lens: Vec<usize> = requests.iter().map(|r| self.draft_length(r)).collect();
        let max_draft_len = draft_lens.iter().copied().max().unwrap_or(0);

        // Draft: first round catches the draft cache up to the last committed token
        let draft_ids: Vec<i64> = requests
            .iter()
            .map(|r| seq_id(r, 1))
            .collect::<Result<_>>()?;
        let catch_up: Vec<Vec<u32>> = requests
            .iter()
            .map(|r| {
                let full = r.prefill_tokens();
                let cached = r.model_states[1].num_tokens_in_cache.min(full.len());
                full[cached..].to_vec()
            })
            .collect();
        if let Some(pos) = catch_up.iter().position(Vec::is_empty) {
            return Err(EngineError::Cache(format!(
                "draft cache of {} is ahead of its committed tokens",
                requests[pos].id()
            )));
        }

        for (&seq_id, tokens) in draft_ids.iter().zip(&catch_up) {
            page_tables[1].grow(seq_id, tokens.len())?;
        }
        let probs = draft.batch_verify(&draft_ids, &catch_up)?;
        let mut row_ends = Vec::with_capacity(n);
        let mut row = 0;
        for tokens in &catch_up {
            row += tokens.len();
            row_ends.push(row - 1);
        }
        for (request, tokens) in requests.iter_mut().zip(&catch_up) {
            let slot = &mut request.model_states[1];
            slot.clear_draft();
            slot.num_tokens_in_cache += tokens.len();
        }
        let proposing: Vec<usize> = (0..n).filter(|&i| draft_lens[i] > 0).collect();
        if !proposing.is_empty() {
            let sample_indices: Vec<usize> = proposing.iter().map(|&i| row_ends[i]).collect();
            self.propose(&probs, &sample_indices, &mut select(&mut requests, &proposing))?;
        }

        // Later rounds only feed requests that still want more drafts
        for round in 1..max_draft_len {
            let active: Vec<usize> = (0..n).filter(|&i| draft_lens[i] > round).collect();
            let active_ids: Vec<i64> = active.iter().map(|&i| draft_ids[i]).collect();
            let last_drafts: Vec<u32> = active
                .iter()
                .map(|&i| requests[i].model_states[1].draft_output_tokens.last().map_or(0, |t| t.token_id))
                .collect();
            for &seq_id in &active_ids {
                page_tables[1].grow(seq_id, 1)?;
            }
            let probs = draft.decode(&active_ids, &last_drafts)?;
            let mut active_requests = select(&mut requests, &active);
            for request in active_requests.iter_mut() {
                request.model_states[1].num_tokens_in_cache += 1;
            }
            let sample_indices: Vec<usize> = (0..active.len()).collect();
            self.propose(&probs, &sample_indices, &mut active_requests)?;
        }

        // Verify: target scores [last committed, d1..dk] for every request
        let target_ids = primary_seq_ids(&requests)?;
        let mut verify_tokens = Vec::with_capacity(n);
        for request in requests.iter() {
            let mut tokens = vec![last_committed(request, 0)?];
            tokens.extend(request.model_states[1].draft_output_tokens.iter().map(|t| t.token_id));
            verify_tokens.push(tokens);
        }
        for (&seq_id, tokens) in target_ids.iter().zip(&verify_tokens) {
            page_tables[0].grow(seq_id, tokens.len())?;
        }
        let probs = target.batch_verify(&target_ids, &verify_tokens)?;
        for (request, tokens) in requests.iter_mut().zip(&verify_tokens) {
            request.model_states[0].num_tokens_in_cache += tokens.len();
        }

        let mut cum_verify_lengths = Vec::with_capacity(n + 1);
        let mut total = 0;
        cum_verify_lengths.push(total);
        for tokens in &verify_tokens {
            total += tokens.len();
            cum_verify_lengths.push(total);
        }
        let draft_tokens: Vec<Vec<SampleResult>> = requests
            .iter_mut()
            .map(|r| std::mem::take(&mut r.model_states[1].draft_output_tokens))
            .collect();
        let draft_dists: Vec<Vec<Vec<f32>>> = requests
            .iter_mut()
            .map(|r| std::mem::take(&mut r.model_states[1].draft_output_prob_dist))
            .collect();

        let request_ids: Vec<String> = requests.iter().map(|r| r.id().to_string()).collect();
        let configs: Vec<GenerationConfig> =
            requests.iter().map(|r| r.request.generation_config.clone()).collect();
        let config_refs: Vec<&GenerationConfig> = configs.iter().collect();
        let accepted = {
            let mut rngs: Vec<&mut RandomGenerator> = requests.iter_mut().map(|r| &mut r.rng).collect();
            self.sampler.batch_verify_draft_tokens(
                &probs,
                &request_ids,
                &cum_verify_lengths,
                &config_refs,
                &mut rngs,
                &draft_tokens,
                &draft_dists,
            )?
        };

        // Roll both caches back to what the accepted tokens justify
        for (((request, tokens), &k), (&target_id, &draft_id)) in requests
            .iter_mut()
            .zip(accepted)
            .zip(&draft_lens)
            .zip(target_ids.iter().zip(&draft_ids))
        {
            let num_accepted = tokens.len();
            let target_pop = k + 1 - num_accepted;
            let draft_pop = k - num_accepted.min(k);

            if target_pop > 0 {
                target.pop_n(target_id, target_pop)?;
                page_tables[0].shrink(target_id, target_pop)?;
                request.model_states[0].num_tokens_in_cache -= target_pop;
            }
            if draft_pop > 0 {
                draft.pop_n(draft_id, draft_pop)?;
                page_tables[1].shrink(draft_id, draft_pop)?;
                request.model_states[1].num_tokens_in_cache -= draft_pop;
            }

            for slot in request.model_states.iter_mut() {
                for &token in &tokens {
                    slot.commit(token);
                }
            }

            stats.draft_tokens_proposed += k as u64;
            stats.draft_tokens_accepted += (num_accepted - 1) as u64;
            stats.decode_tokens += num_accepted as u64;
            tracing::trace!("Request {} accepted {}/{} draft tokens", request.id(), num_accepted - 1, k);
        }
        Ok(())
    }

    /// Sample one draft token per request from `probs` and record it on the draft slot
    fn propose(
        &self,
        probs: &Tensor,
        sample_indices: &[usize],
        requests: &mut [&mut RequestState],
    ) -> Result<()> {
        let mut dists = Vec::new();
        let sampled = sample(self.sampler.as_ref(), probs, sample_indices, requests, Some(&mut dists))?;
        for ((request, token), dist) in requests.iter_mut().zip(sampled).zip(dists) {
            let slot = &mut request.model_states[1];
            slot.draft_output_tokens.push(token);
            slot.draft_output_prob_dist.push(dist);
        }
        Ok(())
    }
}

impl EngineAction for BatchDecode {
    fn step(&mut self, state: &mut EngineState) -> Result<bool> {
        if state.running_queue.is_empty() {
            return Ok(false);
        }

        let start = Instant::now();
        let mut models = self.models.lock();
        let preempted = self.make_room(&mut models, state)?;
        if state.running_queue.is_empty() {
            return Ok(preempted);
        }

        let batch_size = state.running_queue.len();
        match models.as_mut_slice() {
            [model] => self.decode(model.as_mut(), state)?,
            [target, draft] => self.speculative_decode(target.as_mut(), draft.as_mut(), state)?,
            other => {
                return Err(EngineError::config(format!(
                    "decode supports one primary and at most one draft model, got {} models",
                    other.len()
                )))
            }
        }

        state.stats.decode_steps += 1;
        state.stats.decode_time += start.elapsed();
        tracing::debug!("Decoded a batch of {} requests", batch_size);
        Ok(true)
    }

    fn name(&self) -> &'static str {
        "batch_decode"
    }
}

fn seq_id(request: &RequestState, model_index: usize) -> Result<i64> {
    request.model_states[model_index]
        .internal_id
        .ok_or_else(|| EngineError::Cache(format!("running request {} has no cache sequence", request.id())))
}

/// Reborrow the requests at `indices`, in order
fn select<'a>(requests: &'a mut [&mut RequestState], indices: &[usize]) -> Vec<&'a mut RequestState> {
    requests
        .iter_mut()
        .enumerate()
        .filter(|(i, _)| indices.contains(i))
        .map(|(_, request)| &mut **request)
        .collect()
}

fn primary_seq_ids(requests: &[&mut RequestState]) -> Result<Vec<i64>> {
    requests.iter().map(|r| seq_id(r, 0)).collect()
}

fn last_committed(request: &RequestState, model_index: usize) -> Result<u32> {
    request.model_states[model_index]
        .committed_tokens
        .last()
        .map(|t| t.token_id)
        .ok_or_else(|| EngineError::Cache(format!("running request {} has no committed token", request.id())))
}

/// Batch-sample with each request's own config and generator
fn sample(
    sampler: &dyn Sampler,
    probs: &Tensor,
    sample_indices: &[usize],
    requests: &mut [&mut RequestState],
    output_prob_dist: Option<&mut Vec<Vec<f32>>>,
) -> Result<Vec<SampleResult>> {
    let request_ids: Vec<String> = requests.iter().map(|r| r.id().to_string()).collect();
    let configs: Vec<GenerationConfig> = requests.iter().map(|r| r.request.generation_config.clone()).collect();
    let config_refs: Vec<&GenerationConfig> = configs.iter().collect();
    let mut rngs: Vec<&mut RandomGenerator> = requests.iter_mut().map(|r| &mut r.rng).collect();
    sampler.batch_sample_tokens(probs, sample_indices, &request_ids, &config_refs, &mut rngs, output_prob_dist)
}
