use std::sync::Arc;

use super::{release_caches, EngineAction};
use crate::engine::engine_state::EngineState;
use crate::engine::request::FinishReason;
use crate::error::Result;
use crate::model::ModelSet;
use crate::tokenizer::Tokenizer;

/// Tears down every request queued for abortion
pub struct AbortRequest {
    models: ModelSet,
    tokenizer: Arc<dyn Tokenizer>,
}

impl AbortRequest {
    pub fn new(models: ModelSet, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self { models, tokenizer }
    }
}

impl EngineAction for AbortRequest {
    fn step(&mut self, state: &mut EngineState) -> Result<bool> {
        if state.abort_queue.is_empty() {
            return Ok(false);
        }

        let abort_ids = std::mem::take(&mut state.abort_queue);
        let mut models = self.models.lock();
        for (pos, request_id) in abort_ids.iter().enumerate() {
            let waiting_pos = state.waiting_queue.iter().position(|id| id == request_id);
            let running_pos = state.running_queue.iter().position(|id| id == request_id);
            if waiting_pos.is_none() && running_pos.is_none() {
                tracing::debug!("Abort of unknown request {} ignored", request_id);
                continue;
            }

            if let Some(request_state) = state.request_states.get_mut(request_id) {
                if let Err(e) = release_caches(&mut models, &mut state.page_tables, request_state) {
                    // Unprocessed aborts stay queued ahead of any that arrived since
                    let mut remaining = abort_ids[pos..].to_vec();
                    remaining.append(&mut state.abort_queue);
                    state.abort_queue = remaining;
                    return Err(e);
                }
            }
            if let Some(pos) = waiting_pos {
                state.waiting_queue.remove(pos);
            }
            if let Some(pos) = running_pos {
                state.running_queue.remove(pos);
            }

            let Some(mut request_state) = state.request_states.remove(request_id) else {
                continue;
            };
            let output = request_state.to_output(self.tokenizer.as_ref(), FinishReason::Aborted);
            tracing::debug!(
                "Aborted request {} after {} tokens",
                request_id,
                output.output_token_ids.len()
            );
            state.stats.requests_aborted += 1;
            request_state.request.finish(output);
        }

        Ok(true)
    }

    fn name(&self) -> &'static str {
        "abort_request"
    }
}
