//! Device-resident sampler
//!
//! Row selection, temperature scaling, argmax and the descending sort run on
//! the sampler's device. Only the candidate prefix that top-k can keep is
//! copied back, which for typical `top_k` values is a tiny slice of the
//! vocabulary.

use candle_core::{DType, Device, Tensor};
use rand::Rng;

use super::{
    check_sample_inputs, check_verify_inputs, draw_sorted, filter_scaled, nucleus_len, one_hot,
    scatter_candidates, verify_sequence, RandomGenerator, SampleResult, Sampler,
};
use crate::engine::generation_config::GenerationConfig;
use crate::error::Result;

/// Sampler that keeps the heavy per-vocabulary work on a device
#[derive(Debug)]
pub struct DeviceSampler {
    device: Device,
}

impl DeviceSampler {
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Temperature-scale each row: `softmax(log(p) / T)`, rows with `T == 0` left as is
    fn scale(&self, rows: &Tensor, temperatures: &[f32]) -> Result<Tensor> {
        let inv_temps: Vec<f32> = temperatures
            .iter()
            .map(|&t| if t > 0.0 { 1.0 / t } else { 1.0 })
            .collect();
        let inv_temps = Tensor::from_vec(inv_temps, (temperatures.len(), 1), &self.device)?;
        let scaled = rows.log()?.broadcast_mul(&inv_temps)?;
        Ok(candle_nn::ops::softmax_last_dim(&scaled)?)
    }
}

impl Sampler for DeviceSampler {
    fn batch_sample_tokens(
        &self,
        probs: &Tensor,
        sample_indices: &[usize],
        request_ids: &[String],
        generation_configs: &[&GenerationConfig],
        rngs: &mut [&mut RandomGenerator],
        output_prob_dist: Option<&mut Vec<Vec<f32>>>,
    ) -> Result<Vec<SampleResult>> {
        let probs = probs.to_device(&self.device)?.to_dtype(DType::F32)?;
        let (num_rows, vocab_size) = probs.dims2()?;
        check_sample_inputs(num_rows, sample_indices, request_ids, generation_configs, rngs.len())?;

        let n = sample_indices.len();
        if n == 0 {
            return Ok(Vec::new());
        }

        let uniforms: Vec<Option<f32>> = generation_configs
            .iter()
            .zip(rngs.iter_mut())
            .map(|(config, rng)| (!config.is_greedy()).then(|| rng.gen::<f32>()))
            .collect();

        let indices: Vec<u32> = sample_indices.iter().map(|&i| i as u32).collect();
        let rows = probs.index_select(&Tensor::new(indices.as_slice(), &self.device)?, 0)?;

        let greedy_ids: Vec<u32> = if uniforms.iter().any(Option::is_none) {
            rows.argmax(1)?.to_vec1()?
        } else {
            Vec::new()
        };

        // Widest prefix any stochastic row can keep after top-k
        let width = generation_configs
            .iter()
            .filter(|config| !config.is_greedy())
            .map(|config| match config.top_k {
                0 => vocab_size,
                k => k.min(vocab_size),
            })
            .max();

        let (sorted_probs, sorted_ids): (Vec<Vec<f32>>, Vec<Vec<u32>>) = match width {
            Some(width) => {
                let temperatures: Vec<f32> =
                    generation_configs.iter().map(|config| config.temperature).collect();
                let scaled = self.scale(&rows, &temperatures)?;
                let (sorted, order) = scaled.sort_last_dim(false)?;
                (
                    sorted.narrow(1, 0, width)?.to_vec2()?,
                    order.narrow(1, 0, width)?.to_vec2()?,
                )
            }
            None => (Vec::new(), Vec::new()),
        };

        let want_dist = output_prob_dist.is_some();
        let mut results = Vec::with_capacity(n);
        let mut dists = Vec::with_capacity(if want_dist { n } else { 0 });
        for i in 0..n {
            match uniforms[i] {
                None => {
                    let token_id = greedy_ids[i];
                    results.push(SampleResult::new(token_id, 1.0));
                    if want_dist {
                        dists.push(one_hot(token_id, vocab_size));
                    }
                }
                Some(u) => {
                    let config = generation_configs[i];
                    let candidates: Vec<(u32, f32)> = sorted_ids[i]
                        .iter()
                        .copied()
                        .zip(sorted_probs[i].iter().copied())
                        .collect();
                    let kept = nucleus_len(&candidates, config.top_k, config.top_p);
                    results.push(draw_sorted(&candidates[..kept], u));
                    if want_dist {
                        dists.push(scatter_candidates(&candidates[..kept], vocab_size));
                    }
                }
            }
        }

        tracing::trace!("Device sampler drew {} tokens, copied width {:?}", n, width);

        if let Some(out) = output_prob_dist {
            *out = dists;
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
        let probs = probs.to_device(&self.device)?.to_dtype(DType::F32)?;
        let (num_rows, _) = probs.dims2()?;
        check_verify_inputs(
            num_rows,
            request_ids,
            cum_verify_lengths,
            generation_configs,
            rngs.len(),
            draft_output_tokens,
            draft_output_prob_dist,
        )?;
        if num_rows == 0 {
            return Ok(Vec::new());
        }

        let mut temperatures = Vec::with_capacity(num_rows);
        for (i, config) in generation_configs.iter().enumerate() {
            let rows = cum_verify_lengths[i + 1] - cum_verify_lengths[i];
            temperatures.extend(std::iter::repeat(config.temperature).take(rows));
        }
        let scaled: Vec<Vec<f32>> = self.scale(&probs, &temperatures)?.to_vec2()?;

        let mut results = Vec::with_capacity(request_ids.len());
        for (i, rng) in rngs.iter_mut().enumerate() {
            let config = generation_configs[i];
            let targets: Vec<Vec<f32>> = scaled[cum_verify_lengths[i]..cum_verify_lengths[i + 1]]
                .iter()
                .map(|row| filter_scaled(row, config))
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
        "device"
    }
}
