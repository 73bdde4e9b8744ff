//! Generator-side structured trace sinks (`spec.md` §4.10.2 supplement).
//!
//! Grounded on `original_source/src/inference/src/generator.cpp`'s
//! `hash_f32`/`stats_f32`/`log_readout`/`log_landscape`/`validate_trace_shapes`
//! free functions. These are a file-based JSON-lines data channel distinct
//! from `tracing` log events (`SPEC_FULL.md` §10): each sink is gated by its
//! own `TRACE_*_OUT` environment variable naming an output path, and is a
//! silent no-op when that variable is unset.

use std::fs::OpenOptions;
use std::io::Write;

use serde::Serialize;

const FNV_OFFSET_BASIS: u64 = 0x14650FB0E739ECD3;
const FNV_PRIME: u64 = 0x100000001B3;

/// FNV-1a over the raw little-endian bytes of up to the first 256 floats of
/// `values`, used as a cheap fingerprint for trace-shape validation.
pub fn hash_f32(values: &[f32]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for v in values.iter().take(256) {
        for byte in v.to_le_bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    }
    hash
}

/// Summary statistics over one float buffer: min/max/mean plus NaN/Inf
/// counts, matching the reference's `stats_f32`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Stats {
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub nan_count: usize,
    pub inf_count: usize,
}

pub fn stats_f32(values: &[f32]) -> Stats {
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    let mut sum = 0f64;
    let mut nan_count = 0usize;
    let mut inf_count = 0usize;
    let mut finite_count = 0usize;

    for v in values {
        if v.is_nan() {
            nan_count += 1;
            continue;
        }
        if v.is_infinite() {
            inf_count += 1;
            continue;
        }
        min = min.min(*v);
        max = max.max(*v);
        sum += *v as f64;
        finite_count += 1;
    }

    let mean = if finite_count > 0 { (sum / finite_count as f64) as f32 } else { 0.0 };
    if finite_count == 0 {
        min = 0.0;
        max = 0.0;
    }

    Stats { min, max, mean, nan_count, inf_count }
}

fn env_flag(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn append_json_line<T: Serialize>(path: &str, record: &T) -> std::io::Result<()> {
    let line = serde_json::to_string(record)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}

#[derive(Serialize)]
struct ReadoutRecord<'a> {
    step: usize,
    token_id: u32,
    stats: Stats,
    hash: u64,
    tag: &'a str,
}

/// Appends one JSON line to `TRACE_READOUT_OUT` if set; a per-step readout
/// of the sampled token and its logit distribution's summary stats.
pub fn log_readout(step: usize, token_id: u32, logits: &[f32]) {
    let Some(path) = env_flag("TRACE_READOUT_OUT") else { return };
    let record = ReadoutRecord { step, token_id, stats: stats_f32(logits), hash: hash_f32(logits), tag: "readout" };
    let _ = append_json_line(&path, &record);
}

#[derive(Serialize)]
struct LandscapeRecord<'a> {
    step: usize,
    layer: usize,
    stats: Stats,
    hash: u64,
    tag: &'a str,
}

/// Appends one JSON line to `TRACE_LANDSCAPE_OUT` if set; a per-layer
/// activation snapshot used to chart a value's evolution across layers.
pub fn log_landscape(step: usize, layer: usize, activations: &[f32]) {
    let Some(path) = env_flag("TRACE_LANDSCAPE_OUT") else { return };
    let record = LandscapeRecord { step, layer, stats: stats_f32(activations), hash: hash_f32(activations), tag: "landscape" };
    let _ = append_json_line(&path, &record);
}

#[derive(Serialize)]
struct LayerTraceRecord<'a> {
    step: usize,
    layer: usize,
    shape_ok: bool,
    stats: Stats,
    tag: &'a str,
}

/// Appends one JSON line to `TRACE_LAYER_OUT` if set, after validating that
/// `values.len()` matches `expected_len` (the reference's
/// `validate_trace_shapes`, surfaced here as a boolean field rather than an
/// abort — a trace mismatch should not crash generation).
pub fn log_layer_trace(step: usize, layer: usize, values: &[f32], expected_len: usize) {
    let Some(path) = env_flag("TRACE_LAYER_OUT") else { return };
    let record = LayerTraceRecord {
        step,
        layer,
        shape_ok: values.len() == expected_len,
        stats: stats_f32(values),
        tag: "layer",
    };
    let _ = append_json_line(&path, &record);
}

#[derive(Serialize)]
struct StageTraceRecord<'a> {
    step: usize,
    stage: &'a str,
    stats: Stats,
    tag: &'a str,
}

/// Appends one JSON line to `TRACE_STAGE_OUT` if set; a coarser checkpoint
/// between named pipeline stages (e.g. "prefill", "decode").
pub fn log_stage_trace(step: usize, stage: &str, values: &[f32]) {
    let Some(path) = env_flag("TRACE_STAGE_OUT") else { return };
    let record = StageTraceRecord { step, stage, stats: stats_f32(values), tag: "stage" };
    let _ = append_json_line(&path, &record);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_for_identical_input() {
        let a = vec![1.0f32, 2.0, 3.0];
        assert_eq!(hash_f32(&a), hash_f32(&a));
    }

    #[test]
    fn hash_differs_for_different_input() {
        let a = vec![1.0f32, 2.0, 3.0];
        let b = vec![1.0f32, 2.0, 3.1];
        assert_ne!(hash_f32(&a), hash_f32(&b));
    }

    #[test]
    fn hash_only_considers_first_256_values() {
        let mut a = vec![0.0f32; 256];
        let mut b = a.clone();
        a.push(1.0);
        b.push(2.0);
        assert_eq!(hash_f32(&a), hash_f32(&b));
    }

    #[test]
    fn stats_counts_nan_and_inf_separately_from_finite_values() {
        let values = vec![1.0, f32::NAN, f32::INFINITY, -f32::INFINITY, 3.0];
        let s = stats_f32(&values);
        assert_eq!(s.nan_count, 1);
        assert_eq!(s.inf_count, 2);
        assert_eq!(s.min, 1.0);
        assert_eq!(s.max, 3.0);
        assert_eq!(s.mean, 2.0);
    }

    #[test]
    fn readout_is_a_silent_noop_without_the_env_var() {
        std::env::remove_var("TRACE_READOUT_OUT");
        log_readout(0, 5, &[1.0, 2.0]);
    }

    #[test]
    fn readout_appends_a_json_line_when_env_var_is_set() {
        let path = std::env::temp_dir().join(format!("exsa_core_readout_{}.jsonl", std::process::id()));
        std::env::set_var("TRACE_READOUT_OUT", path.to_str().unwrap());
        log_readout(0, 5, &[1.0, 2.0, 3.0]);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("\"token_id\":5"));
        std::env::remove_var("TRACE_READOUT_OUT");
        let _ = std::fs::remove_file(&path);
    }
}
