//! Engine actions
//!
//! Each action is one unit of scheduling policy. The engine runs them in a
//! fixed order every step: [`AbortRequest`], then [`NewRequestPrefill`], then
//! [`BatchDecode`]. Helpers shared by several actions (cache release,
//! preemption and finish processing) live here.

mod abort_request;
mod batch_decode;
mod new_request_prefill;

pub use abort_request::AbortRequest;
pub use batch_decode::BatchDecode;
pub use new_request_prefill::NewRequestPrefill;

use crate::engine::engine_state::EngineState;
use crate::engine::kv_cache::PageTable;
use crate::engine::request::FinishReason;
use crate::engine::request_state::RequestState;
use crate::error::Result;
use crate::model::Model;
use crate::tokenizer::Tokenizer;

/// One unit of scheduling policy
pub trait EngineAction: Send {
    /// Apply the action; returns whether it did any work
    fn step(&mut self, state: &mut EngineState) -> Result<bool>;

    fn name(&self) -> &'static str;
}

/// Most tokens a running request may add to each model's cache in one decode step
pub fn decode_growth(num_models: usize, spec_draft_length: usize) -> usize {
    if num_models > 1 {
        spec_draft_length + 1
    } else {
        1
    }
}

/// Free every cache sequence `request_state` holds
pub(crate) fn release_caches(
    models: &mut [Box<dyn Model>],
    page_tables: &mut [PageTable],
    request_state: &mut RequestState,
) -> Result<()> {
    let slots = models
        .iter_mut()
        .zip(page_tables.iter_mut())
        .zip(request_state.model_states.iter_mut());
    for ((model, table), slot) in slots {
        if let Some(seq_id) = slot.internal_id {
            model.remove_sequence(seq_id)?;
            table.release(seq_id);
            slot.evict();
        }
    }
    Ok(())
}

/// Move the most recently admitted request back to the front of the waiting queue
///
/// Its committed tokens are kept; it is prefilled again over input plus
/// committed tokens when readmitted.
pub(crate) fn preempt_last(models: &mut [Box<dyn Model>], state: &mut EngineState) -> Result<Option<String>> {
    let Some(request_id) = state.running_queue.pop() else {
        return Ok(None);
    };
    if let Some(request_state) = state.request_states.get_mut(&request_id) {
        release_caches(models, &mut state.page_tables, request_state)?;
    }
    state.waiting_queue.push_front(request_id.clone());
    state.stats.requests_preempted += 1;
    tracing::warn!("Preempted request {} to free KV cache pages", request_id);
    Ok(Some(request_id))
}

/// Finish every running request that met a stop condition
///
/// Finished requests release their caches, leave the running queue and
/// receive their output through the callback. A request whose release
/// fails stays running. Returns the ids of the delivered requests.
pub(crate) fn process_finished_requests(
    models: &mut [Box<dyn Model>],
    state: &mut EngineState,
    tokenizer: &dyn Tokenizer,
    max_single_sequence_length: usize,
) -> Result<Vec<String>> {
    let mut finished = Vec::new();
    for request_id in &state.running_queue {
        if let Some(request_state) = state.request_states.get_mut(request_id) {
            if request_state.check_finished(max_single_sequence_length) {
                finished.push(request_id.clone());
            }
        }
    }

    for request_id in &finished {
        if let Some(request_state) = state.request_states.get_mut(request_id) {
            release_caches(models, &mut state.page_tables, request_state)?;
        }
        state.running_queue.retain(|id| id != request_id);
        let Some(mut request_state) = state.request_states.remove(request_id) else {
            continue;
        };

        let reason = request_state.finish_reason.clone().unwrap_or(FinishReason::Length);
        let output = request_state.to_output(tokenizer, reason);
        tracing::debug!(
            "Request {} finished ({:?}) with {} tokens",
            request_id,
            output.finish_reason,
            output.output_token_ids.len()
        );
        state.stats.requests_finished += 1;
        request_state.request.finish(output);
    }

    Ok(finished)
}
