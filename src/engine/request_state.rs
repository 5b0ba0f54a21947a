//! Per-request scheduling state
//!
//! A [`RequestState`] exists for every live request, waiting or running. It
//! carries one [`RequestModelState`] per model; the primary model is slot 0
//! and draft models follow.

use crate::engine::request::{FinishReason, Request, RequestOutput};
use crate::sampler::{seeded_rng, RandomGenerator, SampleResult};
use crate::tokenizer::Tokenizer;

/// A request's progress on one model
#[derive(Debug, Clone, Default)]
pub struct RequestModelState {
    /// Cache sequence handle on the model, set while admitted
    pub internal_id: Option<i64>,

    /// Tokens generated and accepted so far
    pub committed_tokens: Vec<SampleResult>,

    /// Draft tokens proposed in the current step (draft models only)
    pub draft_output_tokens: Vec<SampleResult>,

    /// Distribution each draft token was sampled from
    pub draft_output_prob_dist: Vec<Vec<f32>>,

    /// Tokens of this request held in the model's cache
    pub num_tokens_in_cache: usize,
}

impl RequestModelState {
    pub fn is_admitted(&self) -> bool {
        self.internal_id.is_some()
    }

    /// Committed token ids in generation order
    pub fn committed_token_ids(&self) -> Vec<u32> {
        self.committed_tokens.iter().map(|t| t.token_id).collect()
    }

    pub fn commit(&mut self, token: SampleResult) {
        self.committed_tokens.push(token);
    }

    pub fn clear_draft(&mut self) {
        self.draft_output_tokens.clear();
        self.draft_output_prob_dist.clear();
    }

    /// Forget the cache handle after its sequence was removed
    pub fn evict(&mut self) {
        self.internal_id = None;
        self.num_tokens_in_cache = 0;
        self.clear_draft();
    }
}

/// Everything the engine tracks about one live request
pub struct RequestState {
    pub request: Request,

    /// Draws every random number this request consumes
    pub rng: RandomGenerator,

    /// One entry per model, index-aligned with the engine's model set
    pub model_states: Vec<RequestModelState>,

    /// Set once a finish condition is met
    pub finish_reason: Option<FinishReason>,
}

impl RequestState {
    pub fn new(request: Request, num_models: usize) -> Self {
        let rng = seeded_rng(request.generation_config.seed);
        Self {
            request,
            rng,
            model_states: vec![RequestModelState::default(); num_models],
            finish_reason: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.request.id
    }

    pub fn input_len(&self) -> usize {
        self.request.input_total_length().unwrap_or(0)
    }

    pub fn input_token_ids(&self) -> &[u32] {
        self.request.input_token_ids().unwrap_or(&[])
    }

    /// Tokens generated so far, as recorded on the primary model
    pub fn generated_tokens(&self) -> &[SampleResult] {
        self.model_states
            .first()
            .map(|state| state.committed_tokens.as_slice())
            .unwrap_or(&[])
    }

    pub fn num_generated(&self) -> usize {
        self.generated_tokens().len()
    }

    /// Input followed by every committed token
    pub fn prefill_tokens(&self) -> Vec<u32> {
        let mut tokens = self.input_token_ids().to_vec();
        tokens.extend(self.generated_tokens().iter().map(|t| t.token_id));
        tokens
    }

    pub fn is_finished(&self) -> bool {
        self.finish_reason.is_some()
    }

    /// Apply the stopping rules after new tokens were committed
    ///
    /// A request whose input plus generated tokens reach
    /// `max_single_sequence_length` finishes with [`FinishReason::Length`].
    pub fn check_finished(&mut self, max_single_sequence_length: usize) -> bool {
        if self.is_finished() {
            return true;
        }

        let config = &self.request.generation_config;
        let generated = self.generated_tokens();
        let reason = if generated.iter().any(|t| config.is_stop_token(t.token_id)) {
            Some(FinishReason::Stop)
        } else if generated.len() >= config.max_tokens {
            Some(FinishReason::Length)
        } else if self.input_len() + generated.len() >= max_single_sequence_length {
            Some(FinishReason::Length)
        } else {
            None
        };

        self.finish_reason = reason;
        self.finish_reason.is_some()
    }

    /// Output token ids, cut at `max_tokens` and just after the first stop token
    pub fn output_token_ids(&self) -> Vec<u32> {
        let config = &self.request.generation_config;
        let mut ids = Vec::new();
        for token in self.generated_tokens().iter().take(config.max_tokens) {
            ids.push(token.token_id);
            if config.is_stop_token(token.token_id) {
                break;
            }
        }
        ids
    }

    /// Build the final output, detokenizing with `tokenizer`
    ///
    /// A detokenization failure replaces `finish_reason` with
    /// [`FinishReason::Error`]; the token ids are still reported.
    pub fn to_output(&self, tokenizer: &dyn Tokenizer, finish_reason: FinishReason) -> RequestOutput {
        let output_token_ids = self.output_token_ids();
        let (text, finish_reason) = match tokenizer.decode(&output_token_ids) {
            Ok(text) => (text, finish_reason),
            Err(e) => {
                tracing::warn!("Failed to detokenize output of {}: {}", self.request.id, e);
                (String::new(), FinishReason::Error(e.to_string()))
            }
        };
        RequestOutput {
            request_id: self.request.id.clone(),
            output_token_ids,
            text,
            finish_reason,
            num_input_tokens: self.input_len(),
        }
    }
}

impl std::fmt::Debug for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestState")
            .field("request", &self.request)
            .field("model_states", &self.model_states)
            .field("finish_reason", &self.finish_reason)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::generation_config::GenerationConfig;
    use crate::engine::request::RequestInput;
    use crate::testing::CharTokenizer;

    fn state(input: Vec<u32>, config: GenerationConfig) -> RequestState {
        let mut request = Request::new("r", RequestInput::TokenIds(input), config, |_| {});
        request.tokenize(&CharTokenizer::new()).unwrap();
        RequestState::new(request, 2)
    }

    fn commit(state: &mut RequestState, ids: &[u32]) {
        for slot in state.model_states.iter_mut() {
            for &id in ids {
                slot.commit(SampleResult::new(id, 1.0));
            }
        }
    }

    #[test]
    fn test_slots_per_model() {
        let state = state(vec![1, 2, 3], GenerationConfig::default());
        assert_eq!(state.model_states.len(), 2);
        assert!(!state.model_states[0].is_admitted());
        assert_eq!(state.input_len(), 3);
    }

    #[test]
    fn test_finish_on_stop_token() {
        let mut state = state(vec![1], GenerationConfig::new().with_stop_token_ids(vec![9]));
        commit(&mut state, &[4, 5]);
        assert!(!state.check_finished(100));

        commit(&mut state, &[9, 6]);
        assert!(state.check_finished(100));
        assert_eq!(state.finish_reason, Some(FinishReason::Stop));
        assert_eq!(state.output_token_ids(), vec![4, 5, 9]);
    }

    #[test]
    fn test_ignore_eos() {
        let config = GenerationConfig::new()
            .with_stop_token_ids(vec![9])
            .with_ignore_eos(true);
        let mut state = state(vec![1], config);
        commit(&mut state, &[9]);
        assert!(!state.check_finished(100));
    }

    #[test]
    fn test_finish_on_max_tokens_truncates() {
        let mut state = state(vec![1], GenerationConfig::new().with_max_tokens(2));
        commit(&mut state, &[4, 5, 6]);
        assert!(state.check_finished(100));
        assert_eq!(state.finish_reason, Some(FinishReason::Length));
        assert_eq!(state.output_token_ids(), vec![4, 5]);
    }

    #[test]
    fn test_finish_on_sequence_length() {
        let mut state = state(vec![1, 2, 3], GenerationConfig::default());
        commit(&mut state, &[4]);
        assert!(!state.check_finished(5));
        assert!(state.check_finished(4));
        assert_eq!(state.finish_reason, Some(FinishReason::Length));
    }

    #[test]
    fn test_prefill_tokens_include_committed() {
        let mut state = state(vec![1, 2], GenerationConfig::default());
        commit(&mut state, &[7]);
        assert_eq!(state.prefill_tokens(), vec![1, 2, 7]);
    }

    #[test]
    fn test_to_output_detokenizes() {
        let mut state = state(vec!['a' as u32], GenerationConfig::default());
        commit(&mut state, &['h' as u32, 'i' as u32]);
        let output = state.to_output(&CharTokenizer::new(), FinishReason::Length);
        assert_eq!(output.text, "hi");
        assert_eq!(output.num_input_tokens, 1);
    }

    #[test]
    fn test_to_output_reports_decode_failure() {
        let mut state = state(vec!['a' as u32], GenerationConfig::default());
        commit(&mut state, &['h' as u32, 0xD800]);
        let output = state.to_output(&CharTokenizer::new(), FinishReason::Length);
        assert!(matches!(output.finish_reason, FinishReason::Error(_)));
        assert_eq!(output.output_token_ids, vec!['h' as u32, 0xD800]);
        assert!(output.text.is_empty());
    }
}
