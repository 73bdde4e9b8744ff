//! Autoregressive token generator: prefill + decode loop over a
//! [`BlockScheduler`], sampling one token per decode step (`spec.md` §4.10).
//!
//! Grounded on `original_source/src/inference/{include/gcore/inference/generator.hpp,
//! src/generator.cpp}`. The reference's `Generator::generate()` string-level
//! wrapper (tokenizer encode/decode) is out of scope here — `spec.md` §1
//! excludes the BPE tokenizer's internals — so this module operates on
//! token ids throughout, matching `generate_tokens()` rather than `generate()`.

pub mod sampler;
pub mod tracing_sinks;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::inference::block_scheduler::BlockScheduler;
use crate::rt::stream::Stream;
use crate::utils::Result;

pub use sampler::{argmax, sample, SamplingParams};
pub use tracing_sinks::{hash_f32, log_layer_trace, log_landscape, log_readout, log_stage_trace, stats_f32, Stats};

const F32_BYTES: usize = 4;

/// Counters returned once generation stops (`spec.md` §4.10, supplemented
/// with timing since `original_source/generator.hpp`'s `GenerationStats`
/// carries duration/throughput fields the distillation didn't name in detail).
#[derive(Debug, Clone)]
pub struct GenerationStats {
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub elapsed: Duration,
    /// Wall-clock from `generate_tokens` entry to the first emitted token
    /// (`spec.md` §4.10 step 5). Zero if no token was ever emitted.
    pub time_to_first_token: Duration,
}

impl GenerationStats {
    pub fn tokens_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            0.0
        } else {
            self.generated_tokens as f64 / secs
        }
    }
}

/// Per-token streaming hook. Returning `false` stops generation early.
pub type TokenCallback<'a> = Box<dyn FnMut(u32) -> bool + 'a>;

/// One generated token's full diagnostic record, for external
/// alignment/debugging tooling (`original_source/generator.cpp`'s
/// `AlignmentCallback`; dropped by the distillation, carried here per
/// `SPEC_FULL.md` §4.10).
#[derive(Debug, Clone)]
pub struct AlignmentStep {
    pub step: usize,
    pub token_id: u32,
    pub logit: f32,
    pub logit_min: f32,
    pub logit_max: f32,
    pub logit_mean: f32,
    pub nan_count: usize,
    pub inf_count: usize,
    pub topk_ids: Vec<u32>,
    pub topk_logits: Vec<f32>,
}

pub type AlignmentCallback<'a> = Box<dyn FnMut(&AlignmentStep) + 'a>;

/// Drives a [`BlockScheduler`] through prefill and decode, sampling one
/// token per step. Assumes single-sequence (batch 1) generation, matching
/// the trimmed-out continuous-batching scheduler (`SPEC_FULL.md` §14).
pub struct Generator<'s, 'b> {
    scheduler: &'s BlockScheduler<'b>,
    sample_call_count: AtomicUsize,
}

impl<'s, 'b> Generator<'s, 'b> {
    pub fn new(scheduler: &'s BlockScheduler<'b>) -> Self {
        Self { scheduler, sample_call_count: AtomicUsize::new(0) }
    }

    /// Run prefill over `prompt_tokens` then decode up to `params.max_tokens`
    /// further tokens, invoking `on_token` (and, if present, `on_alignment`)
    /// once per generated token.
    ///
    /// # Safety
    /// Issues raw Vulkan dispatch calls via [`BlockScheduler::forward`].
    pub unsafe fn generate_tokens(
        &self,
        stream: Option<&Stream>,
        prompt_tokens: &[u32],
        params: &SamplingParams,
        mut on_token: TokenCallback<'_>,
        mut on_alignment: Option<AlignmentCallback<'_>>,
    ) -> Result<GenerationStats> {
        let start = Instant::now();
        let vocab_size = self.scheduler.config().vocab_size as usize;

        if !prompt_tokens.is_empty() {
            self.scheduler.forward(stream, 0, prompt_tokens.len())?;
        }
        log_stage_trace(0, "prefill", &[]);

        let mut generated = 0usize;
        let mut time_to_first_token = Duration::ZERO;
        for step in 0..params.max_tokens {
            let last_pos = self.scheduler.current_seq_pos().saturating_sub(1);
            let logits_row = self.read_logits_row(last_pos, vocab_size)?;

            let token = self.sample_with_diagnostics(step, &logits_row, params);
            log_readout(step, token, &logits_row);

            if Some(token) == params.eos_token_id {
                break;
            }
            if !on_token(token) {
                break;
            }
            if generated == 0 {
                time_to_first_token = start.elapsed();
            }
            generated += 1;

            if let Some(cb) = on_alignment.as_deref_mut() {
                cb(&self.build_alignment_step(step, token, &logits_row));
            }

            let next_pos = self.scheduler.current_seq_pos();
            self.scheduler.forward(stream, next_pos, 1)?;
        }

        Ok(GenerationStats {
            prompt_tokens: prompt_tokens.len(),
            generated_tokens: generated,
            elapsed: start.elapsed(),
            time_to_first_token,
        })
    }

    fn read_logits_row(&self, pos: usize, vocab_size: usize) -> Result<Vec<f32>> {
        let Some(logits) = self.scheduler.logits() else {
            return Ok(vec![0.0; vocab_size]);
        };
        let mut bytes = vec![0u8; vocab_size * F32_BYTES];
        let offset = pos * vocab_size * F32_BYTES;
        unsafe {
            // `allocate_activations` allocates the logits buffer `HostVisible`
            // specifically so this read-back needs no staging copy.
            logits.copy_to_host_offset(&mut bytes, offset)?;
        }
        Ok(bytes
            .chunks_exact(F32_BYTES)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect())
    }

    /// Wraps [`sampler::sample`] with the reference's first-3-calls debug
    /// line (`original_source/generator.cpp`'s `sample()`), routed through
    /// `tracing::debug!` instead of the original's `std::cerr` print.
    fn sample_with_diagnostics(&self, step: usize, logits: &[f32], params: &SamplingParams) -> u32 {
        let call_index = self.sample_call_count.fetch_add(1, Ordering::Relaxed);
        if call_index < 3 {
            let stats = stats_f32(logits);
            let top5 = top_k_indices(logits, 5);
            debug!(
                step,
                call_index,
                min = stats.min,
                max = stats.max,
                mean = stats.mean,
                nan_count = stats.nan_count,
                ?top5,
                "sample() diagnostic"
            );
        }
        sample(logits, params)
    }

    fn build_alignment_step(&self, step: usize, token_id: u32, logits: &[f32]) -> AlignmentStep {
        let stats = stats_f32(logits);
        let topk_ids = top_k_indices(logits, 5);
        let topk_logits = topk_ids.iter().map(|&i| logits[i as usize]).collect();
        AlignmentStep {
            step,
            token_id,
            logit: logits.get(token_id as usize).copied().unwrap_or(0.0),
            logit_min: stats.min,
            logit_max: stats.max,
            logit_mean: stats.mean,
            nan_count: stats.nan_count,
            inf_count: stats.inf_count,
            topk_ids,
            topk_logits,
        }
    }
}

fn top_k_indices(values: &[f32], k: usize) -> Vec<u32> {
    let mut indexed: Vec<(usize, f32)> = values.iter().cloned().enumerate().collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
    indexed.into_iter().take(k).map(|(i, _)| i as u32).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_k_indices_returns_descending_order() {
        let values = vec![1.0, 5.0, 3.0, 9.0, 0.0];
        assert_eq!(top_k_indices(&values, 3), vec![3, 1, 2]);
    }

    #[test]
    fn generation_stats_throughput_is_zero_for_no_elapsed_time() {
        let stats = GenerationStats {
            prompt_tokens: 4,
            generated_tokens: 10,
            elapsed: Duration::ZERO,
            time_to_first_token: Duration::ZERO,
        };
        assert_eq!(stats.tokens_per_second(), 0.0);
    }

    #[test]
    fn generation_stats_throughput_matches_rate() {
        let stats = GenerationStats {
            prompt_tokens: 0,
            generated_tokens: 10,
            elapsed: Duration::from_secs(2),
            time_to_first_token: Duration::from_millis(150),
        };
        assert!((stats.tokens_per_second() - 5.0).abs() < 1e-9);
    }
}
