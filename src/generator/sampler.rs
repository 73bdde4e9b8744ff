//! Token sampling: greedy argmax, or temperature-scaled softmax with an
//! honored top-k/top-p truncation before a categorical draw (`spec.md`
//! §4.10; Open Question resolved in `DESIGN.md` — top_k/top_p truncate the
//! distribution rather than being ignored).
//!
//! Grounded on `original_source/src/inference/src/generator.cpp`'s
//! `Generator::sample()`, replacing its `std::mt19937` categorical draw with
//! `rand`'s `StdRng`/`WeightedIndex`.

use rand::distributions::WeightedIndex;
use rand::prelude::Distribution;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::compute::cpu_ref::softmax;

/// Sampling knobs for one generation call (`spec.md` §4.10).
#[derive(Debug, Clone)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_k: usize,
    pub top_p: f32,
    pub max_tokens: usize,
    pub seed: u64,
    pub greedy: bool,
    /// Decode stops immediately once this token id is sampled (`spec.md`
    /// §4.10 "if last == EOS, stop"). `None` disables the check.
    pub eos_token_id: Option<u32>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            max_tokens: 128,
            seed: 0,
            greedy: false,
            eos_token_id: None,
        }
    }
}

/// Index of the largest logit. Ties resolve to the first (lowest-index) max,
/// matching `std::max_element`'s behavior in the reference.
pub fn argmax(logits: &[f32]) -> u32 {
    let mut best_idx = 0usize;
    let mut best_val = f32::NEG_INFINITY;
    for (i, v) in logits.iter().enumerate() {
        if *v > best_val {
            best_val = *v;
            best_idx = i;
        }
    }
    best_idx as u32
}

/// Zero every probability outside the `k` largest, leaving the rest
/// unnormalized (the caller renormalizes via `WeightedIndex`).
fn restrict_top_k(probs: &mut [f32], k: usize) {
    if k == 0 || k >= probs.len() {
        return;
    }
    let mut sorted: Vec<f32> = probs.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap());
    let threshold = sorted[k - 1];
    for p in probs.iter_mut() {
        if *p < threshold {
            *p = 0.0;
        }
    }
}

/// Zero every probability outside the smallest nucleus whose cumulative
/// mass (sorted descending) reaches `top_p`.
fn restrict_top_p(probs: &mut [f32], top_p: f32) {
    if top_p >= 1.0 {
        return;
    }
    let mut indexed: Vec<(usize, f32)> = probs.iter().cloned().enumerate().collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());

    let mut cumulative = 0f32;
    let mut cutoff_idx = indexed.len();
    for (rank, (_, p)) in indexed.iter().enumerate() {
        cumulative += p;
        if cumulative >= top_p {
            cutoff_idx = rank + 1;
            break;
        }
    }
    let keep: std::collections::HashSet<usize> = indexed[..cutoff_idx].iter().map(|(i, _)| *i).collect();
    for (i, p) in probs.iter_mut().enumerate() {
        if !keep.contains(&i) {
            *p = 0.0;
        }
    }
}

/// Draw one token id from `logits` according to `params`.
///
/// `greedy` (or `temperature <= 0`) short-circuits to [`argmax`]; otherwise
/// logits are scaled by `1/temperature`, softmax-normalized, truncated by
/// `top_k` then `top_p`, renormalized, and drawn from with a `seed`-keyed RNG.
pub fn sample(logits: &[f32], params: &SamplingParams) -> u32 {
    if params.greedy || params.temperature <= 0.0 {
        return argmax(logits);
    }

    let scaled: Vec<f32> = logits.iter().map(|v| v / params.temperature).collect();
    let mut probs = softmax(&scaled);

    restrict_top_k(&mut probs, params.top_k);
    restrict_top_p(&mut probs, params.top_p);

    let total: f32 = probs.iter().sum();
    if total <= 0.0 {
        return argmax(logits);
    }

    let mut rng = StdRng::seed_from_u64(params.seed);
    let dist = WeightedIndex::new(&probs).unwrap_or_else(|_| {
        // Every weight was zero (shouldn't happen given the `total` guard
        // above, kept defensive since `WeightedIndex` rejects all-zero).
        WeightedIndex::new(vec![1.0; probs.len()]).expect("uniform fallback is always valid")
    });
    dist.sample(&mut rng) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greedy_always_picks_the_max() {
        let logits = vec![0.1, 5.0, -2.0, 4.9];
        let params = SamplingParams { greedy: true, ..Default::default() };
        assert_eq!(sample(&logits, &params), 1);
    }

    #[test]
    fn argmax_ties_break_to_first_index() {
        let logits = vec![3.0, 3.0, 1.0];
        assert_eq!(argmax(&logits), 0);
    }

    #[test]
    fn top_k_restricts_support() {
        // With top_k=1 the distribution collapses onto the single highest
        // logit regardless of temperature/seed.
        let logits = vec![1.0, 9.0, 2.0, 0.5];
        let params = SamplingParams { temperature: 1.0, top_k: 1, top_p: 1.0, seed: 7, ..Default::default() };
        for seed in 0..10 {
            let p = SamplingParams { seed, ..params.clone() };
            assert_eq!(sample(&logits, &p), 1);
        }
    }

    #[test]
    fn top_p_restricts_support() {
        // A single dominant logit pushes cumulative probability above any
        // top_p < 1 immediately, so the nucleus is just that one token.
        let logits = vec![-5.0, 20.0, -5.0, -5.0];
        let params = SamplingParams { temperature: 1.0, top_k: 0, top_p: 0.5, seed: 3, ..Default::default() };
        for seed in 0..10 {
            let p = SamplingParams { seed, ..params.clone() };
            assert_eq!(sample(&logits, &p), 1);
        }
    }

    #[test]
    fn zero_temperature_falls_back_to_greedy() {
        let logits = vec![1.0, 2.0, 0.5];
        let params = SamplingParams { temperature: 0.0, greedy: false, ..Default::default() };
        assert_eq!(sample(&logits, &params), 1);
    }

    #[test]
    fn same_seed_is_deterministic() {
        let logits = vec![1.0, 1.1, 0.9, 1.05, 0.95];
        let params = SamplingParams { temperature: 0.8, seed: 42, ..Default::default() };
        let a = sample(&logits, &params);
        let b = sample(&logits, &params);
        assert_eq!(a, b);
    }
}
