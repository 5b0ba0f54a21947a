//! Batched token sampling and speculative-decoding verification
//!
//! Two interchangeable implementations share one contract:
//!
//! - [`HostSampler`] copies the probability distributions to host memory and
//!   does all work there, optionally in parallel across the batch.
//! - [`DeviceSampler`] keeps temperature scaling, sorting and top-k
//!   truncation on the tensor's device and only copies back the truncated
//!   candidate set.
//!
//! Per row the transform order is always: temperature, top-k, top-p,
//! renormalise, then one uniform draw (inverse CDF over candidates sorted by
//! descending probability). Greedy rows (temperature 0) take the argmax and
//! consume no randomness. Both implementations draw uniforms in the same
//! order from the same per-request generators, so a fixed generator state
//! yields the same tokens from either.

mod device;
mod host;

use std::sync::Arc;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::engine::generation_config::GenerationConfig;
use crate::error::{EngineError, Result};

pub use device::DeviceSampler;
pub use host::HostSampler;

/// Per-request random generator
pub type RandomGenerator = StdRng;

/// Create a request's generator, seeded when a seed is given
pub fn seeded_rng(seed: Option<u64>) -> RandomGenerator {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// A sampled token and the probability it had in the distribution it was drawn from
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleResult {
    pub token_id: u32,
    pub prob: f32,
}

impl SampleResult {
    pub fn new(token_id: u32, prob: f32) -> Self {
        Self { token_id, prob }
    }
}

/// Batched sampling contract shared by host and device samplers
pub trait Sampler: Send + Sync {
    /// Sample one token per output position
    ///
    /// `result[i]` is drawn from row `sample_indices[i]` of `probs` under
    /// `generation_configs[i]` using `rngs[i]`. `sample_indices`,
    /// `request_ids`, `generation_configs` and `rngs` are parallel arrays.
    /// When `output_prob_dist` is given it receives, per output position,
    /// the full post-transform distribution the token was drawn from.
    fn batch_sample_tokens(
        &self,
        probs: &Tensor,
        sample_indices: &[usize],
        request_ids: &[String],
        generation_configs: &[&GenerationConfig],
        rngs: &mut [&mut RandomGenerator],
        output_prob_dist: Option<&mut Vec<Vec<f32>>>,
    ) -> Result<Vec<SampleResult>>;

    /// Verify draft tokens against the target model's distributions
    ///
    /// Sequence `i` owns rows `cum_verify_lengths[i]..cum_verify_lengths[i + 1]`
    /// of `probs`; row `j` of that range is the target distribution at draft
    /// position `j`, and the final row is the position past the last draft.
    /// Returns the accepted drafts followed by one resampled or bonus token,
    /// between 1 and `draft_len + 1` results per sequence.
    #[allow(clippy::too_many_arguments)]
    fn batch_verify_draft_tokens(
        &self,
        probs: &Tensor,
        request_ids: &[String],
        cum_verify_lengths: &[usize],
        generation_configs: &[&GenerationConfig],
        rngs: &mut [&mut RandomGenerator],
        draft_output_tokens: &[Vec<SampleResult>],
        draft_output_prob_dist: &[Vec<Vec<f32>>],
    ) -> Result<Vec<Vec<SampleResult>>>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// Whether sampling can stay resident on `device`
pub fn supports_device_sampler(device: &Device) -> bool {
    device.is_cuda()
}

/// Pick the sampler implementation for a device
pub fn create_sampler(device: &Device) -> Arc<dyn Sampler> {
    if supports_device_sampler(device) {
        tracing::info!("Using device-resident sampler");
        Arc::new(DeviceSampler::new(device.clone()))
    } else {
        tracing::info!("Using host sampler");
        Arc::new(HostSampler::new())
    }
}

pub(crate) fn check_sample_inputs(
    num_rows: usize,
    sample_indices: &[usize],
    request_ids: &[String],
    generation_configs: &[&GenerationConfig],
    num_rngs: usize,
) -> Result<()> {
    let n = sample_indices.len();
    if request_ids.len() != n || generation_configs.len() != n || num_rngs != n {
        return Err(EngineError::Sampler(format!(
            "parallel inputs differ in length: indices={}, ids={}, configs={}, rngs={}",
            n,
            request_ids.len(),
            generation_configs.len(),
            num_rngs
        )));
    }
    if let Some(&bad) = sample_indices.iter().find(|&&i| i >= num_rows) {
        return Err(EngineError::Sampler(format!(
            "sample index {} out of range for {} rows",
            bad, num_rows
        )));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn check_verify_inputs(
    num_rows: usize,
    request_ids: &[String],
    cum_verify_lengths: &[usize],
    generation_configs: &[&GenerationConfig],
    num_rngs: usize,
    draft_output_tokens: &[Vec<SampleResult>],
    draft_output_prob_dist: &[Vec<Vec<f32>>],
) -> Result<()> {
    let n = request_ids.len();
    if cum_verify_lengths.len() != n + 1
        || generation_configs.len() != n
        || num_rngs != n
        || draft_output_tokens.len() != n
        || draft_output_prob_dist.len() != n
    {
        return Err(EngineError::Sampler(format!(
            "verification inputs differ in length for {} sequences",
            n
        )));
    }
    if cum_verify_lengths.last() != Some(&num_rows) {
        return Err(EngineError::Sampler(format!(
            "cumulative verify lengths end at {:?}, expected {} rows",
            cum_verify_lengths.last(),
            num_rows
        )));
    }
    for i in 0..n {
        let rows = cum_verify_lengths[i + 1].checked_sub(cum_verify_lengths[i]);
        let drafts = draft_output_tokens[i].len();
        if rows != Some(drafts + 1) || draft_output_prob_dist[i].len() != drafts {
            return Err(EngineError::Sampler(format!(
                "sequence {} has {:?} verify rows for {} draft tokens",
                request_ids[i], rows, drafts
            )));
        }
    }
    Ok(())
}

/// Scale a probability row by temperature: `p^(1/T)` renormalised
pub(crate) fn apply_temperature(row: &[f32], temperature: f32) -> Vec<f32> {
    if temperature <= 0.0 || temperature == 1.0 {
        return normalize(row.to_vec());
    }
    let inv_temp = 1.0 / temperature;
    let scaled: Vec<f32> = row
        .iter()
        .map(|&p| if p > 0.0 { p.ln() * inv_temp } else { f32::NEG_INFINITY })
        .collect();
    let max = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return vec![0.0; row.len()];
    }
    normalize(scaled.iter().map(|&l| (l - max).exp()).collect())
}

fn normalize(mut row: Vec<f32>) -> Vec<f32> {
    let sum: f32 = row.iter().sum();
    if sum > 0.0 {
        row.iter_mut().for_each(|p| *p /= sum);
    }
    row
}

/// Token ids sorted by descending probability, ties broken by lower id
pub(crate) fn sort_desc(row: &[f32]) -> Vec<(u32, f32)> {
    let mut sorted: Vec<(u32, f32)> = row.iter().enumerate().map(|(i, &p)| (i as u32, p)).collect();
    sorted.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    sorted
}

pub(crate) fn argmax(row: &[f32]) -> u32 {
    let mut best = 0;
    for (i, &p) in row.iter().enumerate() {
        if p > row[best] {
            best = i;
        }
    }
    best as u32
}

/// Number of leading candidates kept by top-k then top-p, at least one
pub(crate) fn nucleus_len(sorted: &[(u32, f32)], top_k: usize, top_p: f32) -> usize {
    let nonzero = sorted.iter().take_while(|(_, p)| *p > 0.0).count().max(1);
    let k = if top_k == 0 { nonzero } else { top_k.min(nonzero) };
    if top_p >= 1.0 {
        return k;
    }

    let mass: f32 = sorted[..k].iter().map(|(_, p)| p).sum();
    let threshold = top_p * mass;
    let mut cumulative = 0.0;
    for (i, (_, p)) in sorted[..k].iter().enumerate() {
        cumulative += p;
        if cumulative >= threshold {
            return i + 1;
        }
    }
    k
}

/// Inverse-CDF draw over a truncated, descending candidate prefix
pub(crate) fn draw_sorted(candidates: &[(u32, f32)], u: f32) -> SampleResult {
    let mass: f32 = candidates.iter().map(|(_, p)| p).sum();
    if candidates.is_empty() || mass <= 0.0 {
        let token_id = candidates.first().map(|(id, _)| *id).unwrap_or(0);
        return SampleResult::new(token_id, 1.0);
    }

    let target = u * mass;
    let mut cumulative = 0.0;
    for &(token_id, p) in candidates {
        cumulative += p;
        if target < cumulative {
            return SampleResult::new(token_id, p / mass);
        }
    }
    let &(token_id, p) = candidates
        .iter()
        .rev()
        .find(|(_, p)| *p > 0.0)
        .unwrap_or(&candidates[candidates.len() - 1]);
    SampleResult::new(token_id, p / mass)
}

/// Scatter a truncated candidate prefix back into a normalised vocab-order distribution
pub(crate) fn scatter_candidates(candidates: &[(u32, f32)], vocab_size: usize) -> Vec<f32> {
    let mass: f32 = candidates.iter().map(|(_, p)| p).sum();
    let mut dist = vec![0.0; vocab_size];
    for &(token_id, p) in candidates {
        if let Some(slot) = dist.get_mut(token_id as usize) {
            *slot = if mass > 0.0 { p / mass } else { 0.0 };
        }
    }
    dist
}

pub(crate) fn one_hot(token_id: u32, vocab_size: usize) -> Vec<f32> {
    let mut dist = vec![0.0; vocab_size];
    if let Some(slot) = dist.get_mut(token_id as usize) {
        *slot = 1.0;
    }
    dist
}

/// Sample from a temperature-scaled row, returning the distribution when asked
pub(crate) fn sample_scaled_row(
    scaled: &[f32],
    config: &GenerationConfig,
    u: f32,
    want_dist: bool,
) -> (SampleResult, Option<Vec<f32>>) {
    let sorted = sort_desc(scaled);
    let kept = nucleus_len(&sorted, config.top_k, config.top_p);
    let candidates = &sorted[..kept];
    let result = draw_sorted(candidates, u);
    let dist = want_dist.then(|| scatter_candidates(candidates, scaled.len()));
    (result, dist)
}

/// Top-k/top-p filtered distribution of a temperature-scaled row, in vocab order
pub(crate) fn filter_scaled(scaled: &[f32], config: &GenerationConfig) -> Vec<f32> {
    if config.is_greedy() {
        return one_hot(argmax(scaled), scaled.len());
    }
    let sorted = sort_desc(scaled);
    let kept = nucleus_len(&sorted, config.top_k, config.top_p);
    scatter_candidates(&sorted[..kept], scaled.len())
}

/// Rejection-sampling verification of one sequence's drafts
///
/// `targets` holds `drafts.len() + 1` filtered target distributions. Draft
/// `j` is accepted with probability `min(1, p_j / q_j)`; the first rejection
/// resamples from the normalised residual `max(0, p - q)` and stops. If every
/// draft is accepted a bonus token is drawn from the last target row.
pub(crate) fn verify_sequence(
    targets: &[Vec<f32>],
    drafts: &[SampleResult],
    draft_dists: &[Vec<f32>],
    rng: &mut RandomGenerator,
) -> Vec<SampleResult> {
    let mut accepted = Vec::with_capacity(drafts.len() + 1);

    for (j, draft) in drafts.iter().enumerate() {
        let p = &targets[j];
        let q = &draft_dists[j];
        let token = draft.token_id as usize;
        let p_token = p.get(token).copied().unwrap_or(0.0);
        let q_token = q.get(token).copied().unwrap_or(0.0);

        let u: f32 = rng.gen();
        let accept = if q_token > 0.0 {
            u < (p_token / q_token).min(1.0)
        } else {
            p_token > 0.0
        };
        if accept {
            accepted.push(SampleResult::new(draft.token_id, p_token));
            continue;
        }

        let residual: Vec<f32> = p
            .iter()
            .enumerate()
            .map(|(i, &pi)| (pi - q.get(i).copied().unwrap_or(0.0)).max(0.0))
            .collect();
        let source = if residual.iter().any(|&r| r > 0.0) { &residual } else { p };
        let sorted = sort_desc(source);
        let kept = sorted.iter().take_while(|(_, r)| *r > 0.0).count().max(1);
        let u: f32 = rng.gen();
        let resampled = draw_sorted(&sorted[..kept], u);
        let prob = p.get(resampled.token_id as usize).copied().unwrap_or(0.0);
        accepted.push(SampleResult::new(resampled.token_id, prob));
        return accepted;
    }

    let last = &targets[drafts.len()];
    let sorted = sort_desc(last);
    let kept = sorted.iter().take_while(|(_, r)| *r > 0.0).count().max(1);
    let u: f32 = rng.gen();
    accepted.push(draw_sorted(&sorted[..kept], u));
    accepted
}
