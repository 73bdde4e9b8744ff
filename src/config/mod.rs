//! Runtime configuration with TOML support (`SPEC_FULL.md` §11).
//!
//! Precedence: built-in defaults → TOML file (`EXSA_CONFIG` or `--config`)
//! → individual environment-variable overrides, with a `validate()`
//! collecting every problem found rather than stopping at the first one.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::generator::SamplingParams;

/// Complete runtime configuration for the EXSA core compute runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub shader: ShaderConfig,
    pub autotune: AutotuneConfig,
    pub arena: ArenaConfig,
    pub allocator: AllocatorConfig,
    pub sampling: SamplingDefaults,
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            shader: ShaderConfig::default(),
            autotune: AutotuneConfig::default(),
            arena: ArenaConfig::default(),
            allocator: AllocatorConfig::default(),
            sampling: SamplingDefaults::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn from_file(path: &str) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config file: {e}"))?;
        toml::from_str(&contents).map_err(|e| format!("failed to parse config: {e}"))
    }

    /// Resolve a config: `explicit_path` (e.g. `--config`) if given, else
    /// `EXSA_CONFIG`, else built-in defaults; then apply individual
    /// environment-variable overrides.
    pub fn load(explicit_path: Option<&str>) -> Self {
        let path = explicit_path.map(str::to_string).or_else(|| std::env::var("EXSA_CONFIG").ok());

        let mut config = match path {
            Some(path) => match Self::from_file(&path) {
                Ok(cfg) => {
                    info!(path, "loaded runtime config from file");
                    cfg
                }
                Err(e) => {
                    warn!(path, error = %e, "failed to load runtime config, using defaults");
                    Self::default()
                }
            },
            None => Self::default(),
        };

        config.apply_env_overrides();
        config
    }

    /// Apply individual environment-variable overrides on top of whatever
    /// was loaded from defaults/TOML.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("EXSA_SHADER_DIR") {
            self.shader.dir = PathBuf::from(dir);
        }
        if let Ok(margin) = std::env::var("EXSA_AUTOTUNE_MARGIN") {
            if let Ok(v) = margin.parse() {
                self.autotune.margin = v;
            }
        }
        if let Ok(iters) = std::env::var("EXSA_AUTOTUNE_RERUN_ITERS") {
            if let Ok(v) = iters.parse() {
                self.autotune.rerun_iters = v;
            }
        }
        if let Ok(min_tflops) = std::env::var("EXSA_AUTOTUNE_MIN_TFLOPS") {
            if let Ok(v) = min_tflops.parse() {
                self.autotune.min_tflops = v;
            }
        }
        if let Ok(bytes) = std::env::var("EXSA_ARENA_CHUNK_BYTES") {
            if let Ok(v) = bytes.parse() {
                self.arena.chunk_bytes = v;
            }
        }
        if let Ok(level) = std::env::var("EXSA_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(level) = std::env::var("RUST_LOG") {
            self.logging.level = level;
        }
    }

    /// Validate the loaded configuration, collecting every problem found
    /// rather than stopping at the first one.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.arena.chunk_bytes == 0 {
            errors.push("arena.chunk_bytes must be greater than 0".to_string());
        }
        if self.allocator.bin_min_pow2 > self.allocator.bin_max_pow2 {
            errors.push("allocator.bin_min_pow2 must be <= allocator.bin_max_pow2".to_string());
        }
        if self.autotune.margin < 0.0 {
            errors.push("autotune.margin must be non-negative".to_string());
        }
        if self.autotune.rerun_iters == 0 {
            errors.push("autotune.rerun_iters must be at least 1".to_string());
        }
        if self.sampling.top_p <= 0.0 || self.sampling.top_p > 1.0 {
            errors.push("sampling.top_p must be in (0.0, 1.0]".to_string());
        }
        if self.sampling.max_tokens == 0 {
            errors.push("sampling.max_tokens must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn to_toml(&self) -> Result<String, String> {
        toml::to_string_pretty(self).map_err(|e| format!("failed to serialize config: {e}"))
    }
}

/// Shader directory resolution default (`spec.md` §6.4 `VK_SHADER_DIR`
/// handles the lower-level override at load time; this is the config-file
/// layer above it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShaderConfig {
    pub dir: PathBuf,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self { dir: PathBuf::from("./build") }
    }
}

/// Autotuner defaults (`spec.md` §4.6.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutotuneConfig {
    pub margin: f64,
    pub rerun_iters: u32,
    pub min_tflops: f64,
}

impl Default for AutotuneConfig {
    fn default() -> Self {
        Self { margin: 0.05, rerun_iters: 3, min_tflops: 0.0 }
    }
}

/// Device arena defaults (`spec.md` §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArenaConfig {
    pub chunk_bytes: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self { chunk_bytes: 256 * 1024 * 1024 }
    }
}

/// Host allocator bin range defaults (`spec.md` §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorConfig {
    pub bin_min_pow2: i32,
    pub bin_max_pow2: i32,
    pub large_threshold_pow2: i32,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self { bin_min_pow2: 6, bin_max_pow2: 24, large_threshold_pow2: 24 }
    }
}

/// Default sampling parameters, used when a caller doesn't supply its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingDefaults {
    pub temperature: f32,
    pub top_k: usize,
    pub top_p: f32,
    pub max_tokens: usize,
    pub seed: u64,
    pub greedy: bool,
}

impl Default for SamplingDefaults {
    fn default() -> Self {
        let defaults = SamplingParams::default();
        Self {
            temperature: defaults.temperature,
            top_k: defaults.top_k,
            top_p: defaults.top_p,
            max_tokens: defaults.max_tokens,
            seed: defaults.seed,
            greedy: defaults.greedy,
        }
    }
}

impl From<&SamplingDefaults> for SamplingParams {
    fn from(d: &SamplingDefaults) -> Self {
        SamplingParams {
            temperature: d.temperature,
            top_k: d.top_k,
            top_p: d.top_p,
            max_tokens: d.max_tokens,
            seed: d.seed,
            greedy: d.greedy,
            eos_token_id: None,
        }
    }
}

/// Logging configuration (`SPEC_FULL.md` §10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(RuntimeConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_chunk_bytes_fails_validation() {
        let mut config = RuntimeConfig::default();
        config.arena.chunk_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn inverted_bin_range_fails_validation() {
        let mut config = RuntimeConfig::default();
        config.allocator.bin_min_pow2 = 20;
        config.allocator.bin_max_pow2 = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let config = RuntimeConfig::default();
        let toml_str = config.to_toml().unwrap();
        let parsed: RuntimeConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.arena.chunk_bytes, config.arena.chunk_bytes);
    }

    #[test]
    fn env_override_replaces_shader_dir() {
        std::env::set_var("EXSA_SHADER_DIR", "/tmp/shaders");
        let mut config = RuntimeConfig::default();
        config.apply_env_overrides();
        assert_eq!(config.shader.dir, PathBuf::from("/tmp/shaders"));
        std::env::remove_var("EXSA_SHADER_DIR");
    }

    #[test]
    fn sampling_defaults_round_trip_into_sampling_params() {
        let config = RuntimeConfig::default();
        let params: SamplingParams = (&config.sampling).into();
        assert_eq!(params.max_tokens, config.sampling.max_tokens);
    }
}
