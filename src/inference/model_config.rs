//! Llama-style model shape configuration (`spec.md` §4.8, §3).
//!
//! Grounded on `original_source/src/inference/include/gcore/inference/model_config.hpp`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub dim: u32,
    pub num_heads: u32,
    pub num_heads_kv: u32,
    pub num_layers: u32,
    pub vocab_size: u32,
    pub hidden_dim: u32,
    pub head_dim: u32,
    pub max_seq_len: u32,
    pub rope_base: f32,
    pub rms_eps: f32,
    #[serde(default)]
    pub vocabulary: Vec<String>,
    /// End-of-sequence token id, when known from the container's tokenizer
    /// metadata (`tokenizer.ggml.eos_token_id`). `None` when unparsed,
    /// in which case decode runs to `max_tokens` with no early stop.
    #[serde(default)]
    pub eos_token_id: Option<u32>,
}

impl ModelConfig {
    pub fn llama2_7b() -> Self {
        Self {
            dim: 4096,
            num_heads: 32,
            num_heads_kv: 32,
            num_layers: 32,
            vocab_size: 32000,
            hidden_dim: 11008,
            head_dim: 128,
            max_seq_len: 2048,
            rope_base: 10000.0,
            rms_eps: 1e-5,
            vocabulary: Vec::new(),
            eos_token_id: Some(2),
        }
    }

    pub fn llama2_13b() -> Self {
        Self {
            dim: 5120,
            num_heads: 40,
            num_heads_kv: 40,
            num_layers: 40,
            vocab_size: 32000,
            hidden_dim: 13824,
            head_dim: 128,
            max_seq_len: 4096,
            rope_base: 10000.0,
            rms_eps: 1e-5,
            vocabulary: Vec::new(),
            eos_token_id: Some(2),
        }
    }

    /// Approximate total parameter count: embedding + per-layer attention
    /// (Q, K, V, O) + per-layer MLP (gate, up, down) + output projection.
    pub fn param_count(&self) -> u64 {
        let dim = self.dim as u64;
        let hidden_dim = self.hidden_dim as u64;
        let vocab_size = self.vocab_size as u64;
        let embed = vocab_size * dim;
        let attn_per_layer = 4 * dim * dim;
        let mlp_per_layer = 3 * dim * hidden_dim;
        let output = dim * vocab_size;
        embed + self.num_layers as u64 * (attn_per_layer + mlp_per_layer) + output
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::llama2_7b()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn llama2_7b_param_count_is_in_expected_ballpark() {
        let cfg = ModelConfig::llama2_7b();
        let count = cfg.param_count();
        assert!(count > 6_000_000_000 && count < 7_500_000_000, "got {count}");
    }

    #[test]
    fn llama2_13b_has_more_params_than_7b() {
        assert!(ModelConfig::llama2_13b().param_count() > ModelConfig::llama2_7b().param_count());
    }
}
