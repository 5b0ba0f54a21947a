//! Host-resident sampler
//!
//! Copies the probability rows to host memory and samples there. Uniform
//! draws are taken sequentially in batch order first, so the parallel part
//! (temperature, sort, truncation) cannot change the result.

use candle_core::{DType, Tensor};
use rand::Rng;
use rayon::prelude::*;

use super::{
    apply_temperature, argmax, check_sample_inputs, check_verify_inputs, filter_scaled, one_hot,
    sample_scaled_row, verify_sequence, RandomGenerator, SampleResult, Sampler,
};
use crate::engine::generation_config::GenerationConfig;
use crate::error::Result;

/// Batches at least this large are sampled with rayon
const PARALLEL_THRESHOLD: usize = 8;

/// Sampler that runs entirely on the host
#[derive(Debug, Default)]
pub struct HostSampler;

impl HostSampler {
    pub fn new() -> Self {
        Self
    }

    fn sample_row(
        row: &[f32],
        config: &GenerationConfig,
        u: Option<f32>,
        want_dist: bool,
    ) -> (SampleResult, Option<Vec<f32>>) {
        match u {
            None => {
                let token_id = argmax(row);
                let dist = want_dist.then(|| one_hot(token_id, row.len()));
                (SampleResult::new(token_id, 1.0), dist)
            }
            Some(u) => {
                let scaled = apply_temperature(row, config.temperature);
                sample_scaled_row(&scaled, config, u, want_dist)
            }
        }
    }
}

impl Sampler for HostSampler {
    fn batch_sample_tokens(
        &self,
        probs: &Tensor,
        sample_indices: &[usize],
        request_ids: &[String],
        generation_configs: &[&GenerationConfig],
        rngs: &mut [&mut RandomGenerator],
        output_prob_dist: Option<&mut Vec<Vec<f32>>>,
    ) -> Result<Vec<SampleResult>> {
        let rows: Vec<Vec<f32>> = probs.to_dtype(DType::F32)?.to_vec2()?;
        check_sample_inputs(rows.len(), sample_indices, request_ids, generation_configs, rngs.len())?;

        let uniforms: Vec<Option<f32>> = generation_configs
            .iter()
            .zip(rngs.iter_mut())
            .map(|(config, rng)| (!config.is_greedy()).then(|| rng.gen::<f32>()))
            .collect();

        let want_dist = output_prob_dist.is_some();
        let work = |i: usize| {
            Self::sample_row(&rows[sample_indices[i]], generation_configs[i], uniforms[i], want_dist)
        };
        let n = sample_indices.len();
        let sampled: Vec<(SampleResult, Option<Vec<f32>>)> = if n >= PARALLEL_THRESHOLD {
            (0..n).into_par_iter().map(work).collect()
        } else {
            (0..n).map(work).collect()
        };

        tracing::trace!("Host sampler drew {} tokens", n);

        let (results, dists): (Vec<SampleResult>, Vec<Option<Vec<f32>>>) = sampled.into_iter().unzip();
        if let Some(out) = output_prob_dist {
            *out = dists.into_iter().flatten().collect();
        }
        Ok(results)
    }

    fn batch_verify_draft_tokens(
        &self,
        probs: &Tensor,
        request_ids: &[String],
        cum_verify_lengths: &[usize],
        generation_configs: &[&GenerationConfig],
        rngs: &mut [&mut RandomGenerator],
        draft_output_tokens: &[Vec<SampleResult>],
        draft_output_prob_dist: &[Vec<Vec<f32>>],
    ) -> Result<Vec<Vec<SampleResult>>> {
        let rows: Vec<Vec<f32>> = probs.to_dtype(DType::F32)?.to_vec2()?;
        check_verify_inputs(
            rows.len(),
            request_ids,
            cum_verify_lengths,
            generation_configs,
            rngs.len(),
            draft_output_tokens,
            draft_output_prob_dist,
        )?;

        let mut results = Vec::with_capacity(request_ids.len());
        for (i, rng) in rngs.iter_mut().enumerate() {
            let config = generation_configs[i];
            let targets: Vec<Vec<f32>> = rows[cum_verify_lengths[i]..cum_verify_lengths[i + 1]]
                .iter()
                .map(|row| filter_scaled(&apply_temperature(row, config.temperature), config))
                .collect();
            results.push(verify_sequence(
                &targets,
                &draft_output_tokens[i],
                &draft_output_prob_dist[i],
                rng,
            ));
        }
        Ok(results)
    }

    fn name(&self) -> &'static str {
        "host"
    }
}
